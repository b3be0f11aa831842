//! The coordination ensemble every other service registers with.
//!
//! In embedded mode this wraps a [`ServiceProcess`] that owns the private
//! data directory under the storage root. In external mode nothing is
//! spawned; the runner only waits for the configured endpoint to answer the
//! handshake and never stops it.

use crate::config::CoordinationMode;
use crate::launcher::ServiceLauncher;
use crate::output::OutputLog;
use crate::probe::ReadinessProbe;
use crate::supervisor::ServiceProcess;
use crate::{ClusterConfig, Error, Result, ServiceId, ServiceState};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{Instant, sleep};

#[derive(Debug)]
enum Runner {
    Embedded {
        process: ServiceProcess,
        data_dir: PathBuf,
    },
    External {
        state: ServiceState,
    },
}

/// Runs (or attaches to) the coordination ensemble.
#[derive(Debug)]
pub struct CoordinationService {
    runner: Runner,
    endpoint: String,
}

impl CoordinationService {
    pub fn new(config: &ClusterConfig) -> Self {
        let runner = match config.coordination {
            CoordinationMode::Embedded => {
                let name = config.process_name(ServiceId::COORDINATION);
                let mut output = OutputLog::new(config.output_capacity);
                if config.log_to_files {
                    output = output.with_files(&config.log_dir(), &name);
                }
                Runner::Embedded {
                    process: ServiceProcess::new(ServiceId::COORDINATION, name, output),
                    data_dir: config.coordination_data_dir(),
                }
            }
            CoordinationMode::External { .. } => Runner::External {
                state: ServiceState::NotStarted,
            },
        };
        Self {
            runner,
            endpoint: config.coordination_endpoint(),
        }
    }

    /// Private data directory, embedded mode only.
    pub fn data_dir(&self) -> Option<&Path> {
        match &self.runner {
            Runner::Embedded { data_dir, .. } => Some(data_dir),
            Runner::External { .. } => None,
        }
    }

    /// The supervised process, embedded mode only.
    pub fn process(&self) -> Option<&ServiceProcess> {
        match &self.runner {
            Runner::Embedded { process, .. } => Some(process),
            Runner::External { .. } => None,
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self.runner, Runner::External { .. })
    }

    pub fn state(&self) -> ServiceState {
        match &self.runner {
            Runner::Embedded { process, .. } => process.state(),
            Runner::External { state } => *state,
        }
    }

    /// `host:port` of the ensemble, only once it is Ready.
    pub fn endpoint(&self) -> Option<&str> {
        (self.state() == ServiceState::Ready).then_some(self.endpoint.as_str())
    }

    /// Starts the ensemble and waits for the handshake to pass.
    pub async fn start(
        &mut self,
        config: &ClusterConfig,
        launcher: &dyn ServiceLauncher,
        probe: &dyn ReadinessProbe,
    ) -> Result<()> {
        let timeout = config.startup_timeout;
        let interval = config.poll_interval;

        match &mut self.runner {
            Runner::Embedded { process, data_dir } => {
                tokio::fs::create_dir_all(&*data_dir).await?;
                let command = launcher.service_command(config, ServiceId::COORDINATION)?;
                let addr = config.socket_addr(ServiceId::COORDINATION)?;

                tracing::info!(endpoint = %self.endpoint, "starting coordination service");
                process.start(&command)?;
                process.await_ready(probe, addr, timeout, interval).await
            }
            Runner::External { state } => {
                state.transition(ServiceState::Starting)?;
                let addr = resolve_endpoint(&self.endpoint)?;

                tracing::info!(endpoint = %self.endpoint, "waiting for external coordination service");
                if poll(probe, addr, timeout, interval).await {
                    state.transition(ServiceState::Ready)?;
                    Ok(())
                } else {
                    state.transition(ServiceState::Failed)?;
                    Err(Error::ReadinessTimeout {
                        service: format!("external coordination at {}", self.endpoint),
                        timeout,
                        output: Vec::new(),
                    })
                }
            }
        }
    }

    /// Re-checks liveness of the embedded process.
    pub fn refresh(&mut self) -> ServiceState {
        match &mut self.runner {
            Runner::Embedded { process, .. } => process.refresh(),
            Runner::External { state } => *state,
        }
    }

    /// Kills the embedded process at once, see [`ServiceProcess::kill_now`].
    pub fn kill_now(&mut self) {
        if let Runner::Embedded { process, .. } = &mut self.runner {
            process.kill_now();
        }
    }

    /// Stops the embedded process. An external ensemble is left running.
    pub async fn stop(&mut self, grace: Duration) -> Result<Option<Error>> {
        match &mut self.runner {
            Runner::Embedded { process, .. } => process.stop(grace).await,
            Runner::External { state } => {
                if !state.is_terminal() {
                    state.transition(ServiceState::Stopped)?;
                }
                Ok(None)
            }
        }
    }
}

fn resolve_endpoint(endpoint: &str) -> Result<SocketAddr> {
    endpoint
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::Configuration(format!("endpoint {endpoint} did not resolve")))
}

async fn poll(
    probe: &dyn ReadinessProbe,
    addr: SocketAddr,
    timeout: Duration,
    interval: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if probe.check(addr).await {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        sleep(interval.min(deadline - now)).await;
    }
}
