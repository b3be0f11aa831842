//! Shared helpers: a launcher that runs the stub service binary for every
//! kind, and a line-command client for talking to it.

#![allow(dead_code)]

use minicluster::{
    ClusterConfig, ConfigBuilder, Orchestrator, ReadinessProbe, Result, ServiceCommand, ServiceId,
    ServiceKind, ServiceLauncher,
};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub const STUB: &str = env!("CARGO_BIN_EXE_minicluster-stub");

/// Runs `minicluster-stub` in place of every service.
#[derive(Debug, Default, Clone)]
pub struct StubLauncher {
    extra_args: BTreeMap<ServiceKind, Vec<String>>,
    init: Option<i32>,
}

impl StubLauncher {
    /// Appends `args` to the command line of every service of `kind`.
    pub fn with_args(mut self, kind: ServiceKind, args: &[&str]) -> Self {
        self.extra_args
            .entry(kind)
            .or_default()
            .extend(args.iter().map(ToString::to_string));
        self
    }

    /// Adds an init step exiting with `code`.
    pub fn with_init(mut self, code: i32) -> Self {
        self.init = Some(code);
        self
    }
}

impl ServiceLauncher for StubLauncher {
    fn service_command(&self, config: &ClusterConfig, service: ServiceId) -> Result<ServiceCommand> {
        let port = config.port(service).unwrap_or_default();
        Ok(ServiceCommand::new(STUB)
            .args(["--kind", service.kind.short_name()])
            .arg("--port")
            .arg(port.to_string())
            .arg("--ext-dir")
            .arg(config.extension_dir.display().to_string())
            .args(self.extra_args.get(&service.kind).into_iter().flatten().cloned())
            .working_dir(config.service_dir(service)))
    }

    fn init_command(&self, _config: &ClusterConfig) -> Result<Option<ServiceCommand>> {
        Ok(self.init.map(|code| {
            ServiceCommand::new(STUB)
                .args(["--kind", "init", "--oneshot", "--exit-code"])
                .arg(code.to_string())
        }))
    }
}

/// Probe that never succeeds.
#[derive(Debug)]
pub struct NeverReady;

#[async_trait::async_trait]
impl ReadinessProbe for NeverReady {
    async fn check(&self, _addr: SocketAddr) -> bool {
        false
    }
}

pub fn orchestrator(launcher: StubLauncher) -> Orchestrator {
    Orchestrator::new(Arc::new(launcher))
}

/// Builder rooted in `temp` with test-friendly timings.
pub fn builder(temp: &TempDir) -> ConfigBuilder {
    ConfigBuilder::new()
        .storage_root(temp.path().join("cluster"))
        .startup_timeout(Duration::from_secs(10))
        .poll_interval(Duration::from_millis(25))
        .stop_grace_period(Duration::from_secs(3))
}

/// Sends one line command to a stub service and returns its reply.
pub async fn ask(addr: &str, command: &str) -> std::io::Result<String> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(format!("{command}\n").as_bytes()).await?;
    let mut reply = String::new();
    stream.read_to_string(&mut reply).await?;
    Ok(reply)
}

/// Whether a process with `pid` still exists.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), None).is_ok()
}
