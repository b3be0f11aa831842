//! End-to-end lifecycle tests against the stub service binary.

#![cfg(unix)]

mod support;

use minicluster::{ClusterState, Error, ServiceId, ServiceKind, ServiceState};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::sync::Arc;
use std::time::Duration;
use support::{NeverReady, StubLauncher, ask, builder, orchestrator, process_alive};
use tempfile::TempDir;

#[tokio::test]
async fn start_exposes_reachable_endpoint() {
    let temp = TempDir::new().unwrap();
    let mut cluster = orchestrator(StubLauncher::default())
        .start(builder(&temp).data_nodes(2))
        .await
        .unwrap();

    assert_eq!(cluster.state(), ClusterState::Running);
    let info = cluster.connection_info().unwrap();
    let (host, port) = info.coordination_endpoint.rsplit_once(':').unwrap();
    assert_eq!(host, "127.0.0.1");
    assert!(port.parse::<u16>().unwrap() > 0);
    assert_eq!(ask(&info.coordination_endpoint, "ruok").await.unwrap(), "imok");
    assert_eq!(ask(&info.coordination_endpoint, "kind").await.unwrap(), "zookeeper");
    assert_eq!(info.root_password, "notsecure");

    cluster.stop().await.unwrap();
}

#[tokio::test]
async fn stop_leaves_no_processes_or_storage() {
    let temp = TempDir::new().unwrap();
    let mut cluster = orchestrator(StubLauncher::default())
        .start(builder(&temp))
        .await
        .unwrap();

    let root = cluster.config().storage_root.clone();
    let pids: Vec<u32> = cluster.services().filter_map(|s| s.pid()).collect();
    assert_eq!(pids.len(), 5);
    assert!(pids.iter().all(|pid| process_alive(*pid)));

    let report = cluster.stop().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(cluster.state(), ClusterState::Stopped);
    assert!(pids.iter().all(|pid| !process_alive(*pid)));
    assert!(!root.exists());
}

#[tokio::test]
async fn double_stop_is_a_noop() {
    let temp = TempDir::new().unwrap();
    let mut cluster = orchestrator(StubLauncher::default())
        .start(builder(&temp))
        .await
        .unwrap();

    cluster.stop().await.unwrap();
    let second = cluster.stop().await.unwrap();
    assert!(second.is_clean());
    assert_eq!(cluster.state(), ClusterState::Stopped);
}

#[tokio::test]
async fn data_node_death_fails_cluster() {
    let temp = TempDir::new().unwrap();
    let mut cluster = orchestrator(StubLauncher::default())
        .start(builder(&temp).data_nodes(2))
        .await
        .unwrap();

    let pid = cluster.service(ServiceId::data_node(0)).unwrap().pid().unwrap();
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();

    let mut state = cluster.state();
    for _ in 0..100 {
        if state == ClusterState::Failed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        state = cluster.state();
    }
    assert_eq!(state, ClusterState::Failed);
    assert_eq!(
        cluster.service(ServiceId::data_node(0)).unwrap().state(),
        ServiceState::Failed
    );
    assert!(matches!(
        cluster.connection_info().unwrap_err(),
        Error::InvalidState { .. }
    ));

    // A failed cluster can still be stopped.
    cluster.stop().await.unwrap();
    assert_eq!(cluster.state(), ClusterState::Stopped);
}

#[tokio::test]
async fn never_ready_gc_tears_down_started_services() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("cluster");
    let orchestrator = orchestrator(StubLauncher::default())
        .with_probe(ServiceKind::GarbageCollector, Arc::new(NeverReady));

    let err = orchestrator
        .start(builder(&temp).startup_timeout(Duration::from_millis(500)))
        .await
        .unwrap_err();

    match err.root_cause() {
        Error::ReadinessTimeout { service, output, .. } => {
            assert!(service.ends_with("-gc"), "{service}");
            assert!(output.iter().any(|line| line.contains("listening on")));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("Cluster '"));
    assert!(!root.exists());
}

#[tokio::test]
async fn early_exit_is_a_start_failure() {
    let temp = TempDir::new().unwrap();
    let launcher = StubLauncher::default().with_args(ServiceKind::Manager, &["--exit-after-ms", "0", "--ready-delay-ms", "5000"]);

    let err = orchestrator(launcher)
        .start(builder(&temp))
        .await
        .unwrap_err();

    assert!(matches!(err.root_cause(), Error::ProcessStart { .. }));
    assert!(err.captured_output().iter().any(|l| l.contains("exiting after")));
}

#[tokio::test]
async fn extension_visible_to_data_node() {
    let temp = TempDir::new().unwrap();
    let jar = temp.path().join("custom-iterators.jar");
    std::fs::write(&jar, b"iterator classes").unwrap();

    let mut cluster = orchestrator(StubLauncher::default())
        .with_extension(&jar)
        .start(builder(&temp).data_nodes(1))
        .await
        .unwrap();

    let artifact = &cluster.extensions()[0];
    let expected = artifact.target_name();
    let addr = cluster.config().socket_addr(ServiceId::data_node(0)).unwrap();

    let listing = ask(&addr.to_string(), "exts").await.unwrap();
    assert_eq!(listing, expected);

    cluster.stop().await.unwrap();
}

#[tokio::test]
async fn extension_installed_while_running() {
    let temp = TempDir::new().unwrap();
    let jar = temp.path().join("late.jar");
    std::fs::write(&jar, b"late classes").unwrap();

    let mut cluster = orchestrator(StubLauncher::default())
        .start(builder(&temp).data_nodes(1))
        .await
        .unwrap();

    let artifact = cluster.install_extension(&jar).unwrap();
    cluster.restart_data_node(0).await.unwrap();
    assert_eq!(cluster.state(), ClusterState::Running);

    let addr = cluster.config().socket_addr(ServiceId::data_node(0)).unwrap();
    let listing = ask(&addr.to_string(), "exts").await.unwrap();
    assert_eq!(listing, artifact.target_name());

    cluster.stop().await.unwrap();
}

#[tokio::test]
async fn sigterm_ignored_is_a_warning() {
    let temp = TempDir::new().unwrap();
    let launcher = StubLauncher::default().with_args(ServiceKind::GarbageCollector, &["--ignore-sigterm"]);

    let mut cluster = orchestrator(launcher)
        .start(builder(&temp).stop_grace_period(Duration::from_millis(300)))
        .await
        .unwrap();
    let pid = cluster.service(ServiceId::GARBAGE_COLLECTOR).unwrap().pid().unwrap();

    let report = cluster.stop().await.unwrap();
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].is_warning());
    assert!(!process_alive(pid));
}

#[tokio::test]
async fn init_runs_once_per_storage_root() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("cluster");

    let mut cluster = orchestrator(StubLauncher::default().with_init(0))
        .start(builder(&temp).reuse_storage(true).disposition(minicluster::StorageDisposition::Retain))
        .await
        .unwrap();
    cluster.stop().await.unwrap();
    assert!(root.join(".initialized").exists());

    // A failing init step is skipped because the root is already initialized.
    let mut cluster = orchestrator(StubLauncher::default().with_init(1))
        .start(builder(&temp).reuse_storage(true))
        .await
        .unwrap();
    cluster.stop().await.unwrap();
    assert!(root.exists());
}

#[tokio::test]
async fn failed_init_aborts_start() {
    let temp = TempDir::new().unwrap();
    let err = orchestrator(StubLauncher::default().with_init(4))
        .start(builder(&temp))
        .await
        .unwrap_err();

    assert!(matches!(err.root_cause(), Error::ProcessStart { .. }));
    assert!(!temp.path().join("cluster").exists());
}

#[tokio::test]
async fn dropped_handle_kills_processes() {
    let temp = TempDir::new().unwrap();
    let cluster = orchestrator(StubLauncher::default())
        .start(builder(&temp))
        .await
        .unwrap();
    let pids: Vec<u32> = cluster.services().filter_map(|s| s.pid()).collect();

    drop(cluster);

    for _ in 0..100 {
        if pids.iter().all(|pid| !process_alive(*pid)) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(pids.iter().all(|pid| !process_alive(*pid)));
    assert!(!temp.path().join("cluster").exists());
}
