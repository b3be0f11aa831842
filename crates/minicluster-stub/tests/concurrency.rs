//! Independent clusters provisioned side by side.

#![cfg(unix)]

mod support;

use minicluster::ClusterState;
use std::collections::HashSet;
use support::{StubLauncher, builder, orchestrator};
use tempfile::TempDir;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_clusters_use_disjoint_ports() {
    let (a, b, c) = (TempDir::new().unwrap(), TempDir::new().unwrap(), TempDir::new().unwrap());
    let orchestrator = orchestrator(StubLauncher::default());

    let (first, second, third) = tokio::join!(
        orchestrator.start(builder(&a).data_nodes(2)),
        orchestrator.start(builder(&b).data_nodes(2)),
        orchestrator.start(builder(&c).data_nodes(2)),
    );
    let mut clusters = vec![first.unwrap(), second.unwrap(), third.unwrap()];

    let mut seen = HashSet::new();
    for cluster in &mut clusters {
        assert_eq!(cluster.state(), ClusterState::Running);
        for port in cluster.config().ports.values() {
            assert!(seen.insert(*port), "port {port} shared between clusters");
        }
    }
    assert_eq!(seen.len(), 15);

    let endpoints: HashSet<String> = clusters
        .iter_mut()
        .map(|c| c.connection_info().unwrap().coordination_endpoint)
        .collect();
    assert_eq!(endpoints.len(), 3);

    for cluster in &mut clusters {
        cluster.stop().await.unwrap();
    }
}

#[tokio::test]
async fn ports_return_to_the_pool_after_stop() {
    let temp = TempDir::new().unwrap();
    let mut cluster = orchestrator(StubLauncher::default())
        .start(builder(&temp))
        .await
        .unwrap();
    let ports: Vec<u16> = cluster.config().ports.values().copied().collect();
    assert!(ports.iter().all(|p| minicluster::PortAllocator::is_reserved(*p)));

    cluster.stop().await.unwrap();
    assert!(ports.iter().all(|p| !minicluster::PortAllocator::is_reserved(*p)));
}
