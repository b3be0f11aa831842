//! Supervision of a single service process.
//!
//! A [`ServiceProcess`] owns one child process from spawn to confirmed exit.
//! The child itself lives in a monitor task which records the exit status as
//! soon as it happens, so an unexpected exit is visible on the next
//! [`ServiceProcess::refresh`]. Dropping a `ServiceProcess` kills the child.

use crate::launcher::ServiceCommand;
use crate::output::{OutputLog, Stream};
use crate::probe::ReadinessProbe;
use crate::{Error, Result, ServiceId, ServiceState};
use std::fmt;
use std::net::SocketAddr;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};

/// Upper bound on waiting for a killed process to be reaped.
const KILL_WAIT: Duration = Duration::from_secs(10);

/// How long to wait for output readers to drain after exit.
const DRAIN_WAIT: Duration = Duration::from_secs(1);

/// Exit information of a finished process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub success: bool,
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            success: status.success(),
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => f.write_str("termination by signal"),
        }
    }
}

fn build_command(cmd: &ServiceCommand) -> Command {
    let mut command = Command::new(&cmd.program);
    command
        .args(&cmd.args)
        .envs(&cmd.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &cmd.working_dir {
        command.current_dir(dir);
    }
    command
}

/// Spawns `cmd` and starts copying its output into `output`.
fn spawn(
    cmd: &ServiceCommand,
    output: &OutputLog,
    name: &str,
) -> std::io::Result<(Child, Vec<JoinHandle<()>>)> {
    tracing::debug!(service = %name, command = %cmd, "spawning process");
    let mut child = build_command(cmd).spawn()?;

    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(output.capture(stdout, Stream::Stdout, name.to_string()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(output.capture(stderr, Stream::Stderr, name.to_string()));
    }
    Ok((child, readers))
}

async fn monitor(
    mut child: Child,
    kill: oneshot::Receiver<()>,
    exit: watch::Sender<Option<ExitInfo>>,
    name: String,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(service = %name, error = %e, "kill failed");
            }
            child.wait().await
        }
    };

    let info = match status {
        Ok(status) => ExitInfo::from(status),
        Err(e) => {
            tracing::warn!(service = %name, error = %e, "could not collect exit status");
            ExitInfo {
                code: None,
                success: false,
            }
        }
    };
    tracing::debug!(service = %name, exit = %info, "process exited");
    let _ = exit.send(Some(info));
}

#[cfg(unix)]
fn send_terminate(pid: u32) -> std::io::Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(true),
        Err(e) => Err(std::io::Error::from(e)),
    }
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32) -> std::io::Result<bool> {
    // No graceful signal available, go straight to the forced path.
    Ok(false)
}

#[cfg(unix)]
fn send_kill(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

#[cfg(not(unix))]
fn send_kill(_pid: u32) {}

/// Control unit for one external service process.
pub struct ServiceProcess {
    id: ServiceId,
    name: String,
    state: ServiceState,
    pid: Option<u32>,
    output: OutputLog,
    exit: Option<watch::Receiver<Option<ExitInfo>>>,
    kill: Option<oneshot::Sender<()>>,
    readers: Vec<JoinHandle<()>>,
}

impl fmt::Debug for ServiceProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceProcess")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl ServiceProcess {
    /// Creates a descriptor in `NotStarted`.
    pub fn new(id: ServiceId, name: impl Into<String>, output: OutputLog) -> Self {
        Self {
            id,
            name: name.into(),
            state: ServiceState::NotStarted,
            pid: None,
            output,
            exit: None,
            kill: None,
            readers: Vec::new(),
        }
    }

    pub fn id(&self) -> ServiceId {
        self.id
    }

    /// Process name, e.g. `mac-<id>-gc`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// OS process id, once spawned.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Captured stdout/stderr.
    pub fn output(&self) -> &OutputLog {
        &self.output
    }

    /// Exit information if the process has exited.
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit.as_ref().and_then(|rx| *rx.borrow())
    }

    /// Whether the process was spawned and has not exited yet.
    pub fn is_running(&self) -> bool {
        self.exit.is_some() && self.exit_info().is_none()
    }

    /// Launches the process. `NotStarted -> Starting`.
    pub fn start(&mut self, command: &ServiceCommand) -> Result<()> {
        if self.state != ServiceState::NotStarted {
            return Err(Error::InvalidState {
                operation: "start service",
                state: self.state.to_string(),
            });
        }

        let (child, readers) = match spawn(command, &self.output, &self.name) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.state.transition(ServiceState::Failed)?;
                return Err(Error::ProcessStart {
                    service: self.name.clone(),
                    reason: format!("could not launch {}: {e}", command.program.display()),
                    output: Vec::new(),
                });
            }
        };

        self.pid = child.id();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(monitor(child, kill_rx, exit_tx, self.name.clone()));

        self.exit = Some(exit_rx);
        self.kill = Some(kill_tx);
        self.readers = readers;
        self.state.transition(ServiceState::Starting)?;

        tracing::info!(service = %self.name, pid = ?self.pid, "process started");
        Ok(())
    }

    /// Polls `probe` against `addr` every `interval` until it passes or
    /// `timeout` elapses. `Starting -> Ready` on success, `Failed` otherwise.
    pub async fn await_ready(
        &mut self,
        probe: &dyn ReadinessProbe,
        addr: SocketAddr,
        timeout: Duration,
        interval: Duration,
    ) -> Result<()> {
        if self.state != ServiceState::Starting {
            return Err(Error::InvalidState {
                operation: "await readiness",
                state: self.state.to_string(),
            });
        }

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(exit) = self.exit_info() {
                self.state.transition(ServiceState::Failed)?;
                return Err(Error::ProcessStart {
                    service: self.name.clone(),
                    reason: format!("exited with {exit} before becoming ready"),
                    output: self.drained_output().await,
                });
            }

            if probe.check(addr).await {
                self.state.transition(ServiceState::Ready)?;
                tracing::info!(service = %self.name, %addr, "service ready");
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                self.state.transition(ServiceState::Failed)?;
                tracing::warn!(service = %self.name, ?timeout, "service not ready in time");
                return Err(Error::ReadinessTimeout {
                    service: self.name.clone(),
                    timeout,
                    output: self.output.snapshot(),
                });
            }

            tracing::trace!(service = %self.name, %addr, "not ready yet");
            sleep(interval.min(deadline - now)).await;
        }
    }

    /// Re-checks liveness. A `Ready` process that has exited becomes `Failed`.
    pub fn refresh(&mut self) -> ServiceState {
        if self.state == ServiceState::Ready {
            if let Some(exit) = self.exit_info() {
                tracing::warn!(service = %self.name, %exit, "service exited unexpectedly");
                self.state = ServiceState::Failed;
            }
        }
        self.state
    }

    /// Stops the process: SIGTERM, wait up to `grace`, then kill.
    ///
    /// Ends in `Stopped` on either path; a forced kill is returned as a
    /// [`Error::Shutdown`] warning. A `Failed` descriptor keeps its state but
    /// its process is still terminated. Calling this on a stopped
    /// descriptor does nothing.
    pub async fn stop(&mut self, grace: Duration) -> Result<Option<Error>> {
        match self.state {
            ServiceState::Stopped => return Ok(None),
            ServiceState::Failed => {}
            _ => self.state.transition(ServiceState::Stopping)?,
        }

        let forced = self.terminate(grace).await;

        if self.state != ServiceState::Failed {
            self.state.transition(ServiceState::Stopped)?;
        }

        if forced? {
            tracing::warn!(service = %self.name, ?grace, "process killed after grace period");
            return Ok(Some(Error::Shutdown {
                service: self.name.clone(),
                grace_period: grace,
            }));
        }
        tracing::info!(service = %self.name, "process stopped");
        Ok(None)
    }

    /// Kills the child without waiting for it to be reaped.
    ///
    /// For synchronous contexts such as `Drop`: the signal is delivered
    /// before this returns, the monitor task collects the exit status.
    pub fn kill_now(&mut self) {
        if let Some(pid) = self.pid.filter(|_| self.is_running()) {
            send_kill(pid);
        }
        self.kill.take();
    }

    /// Returns whether the forced path was needed.
    async fn terminate(&mut self, grace: Duration) -> Result<bool> {
        let Some(mut exit) = self.exit.clone() else {
            return Ok(false);
        };
        if self.exit_info().is_some() {
            self.drain_readers().await;
            return Ok(false);
        }

        let signalled = match self.pid {
            Some(pid) => send_terminate(pid)?,
            None => false,
        };

        if signalled
            && timeout(grace, exit.wait_for(Option::is_some))
                .await
                .is_ok()
        {
            self.drain_readers().await;
            return Ok(false);
        }

        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        if timeout(KILL_WAIT, exit.wait_for(Option::is_some))
            .await
            .is_err()
        {
            return Err(Error::Io(std::io::Error::other(format!(
                "{} did not exit after being killed",
                self.name
            ))));
        }
        self.drain_readers().await;
        Ok(true)
    }

    async fn drain_readers(&mut self) {
        for reader in self.readers.drain(..) {
            let _ = timeout(DRAIN_WAIT, reader).await;
        }
    }

    async fn drained_output(&mut self) -> Vec<String> {
        self.drain_readers().await;
        self.output.snapshot()
    }
}

/// Runs `command` to completion, capturing its output into `output`.
///
/// Fails with [`Error::ProcessStart`] if it cannot be launched, exits
/// unsuccessfully or does not finish within `limit`.
pub async fn run_oneshot(
    name: &str,
    command: &ServiceCommand,
    output: &OutputLog,
    limit: Duration,
) -> Result<ExitInfo> {
    let failure = |reason: String, output: &OutputLog| Error::ProcessStart {
        service: name.to_string(),
        reason,
        output: output.snapshot(),
    };

    let (mut child, readers) = spawn(command, output, name)
        .map_err(|e| failure(format!("could not launch {}: {e}", command.program.display()), output))?;

    let status = match timeout(limit, child.wait()).await {
        Ok(status) => ExitInfo::from(status?),
        Err(_) => {
            let _ = child.kill().await;
            return Err(failure(format!("did not finish within {limit:?}"), output));
        }
    };
    for reader in readers {
        let _ = timeout(DRAIN_WAIT, reader).await;
    }

    if !status.success {
        return Err(failure(format!("finished with {status}"), output));
    }
    tracing::info!(service = %name, "one-shot command finished");
    Ok(status)
}

#[cfg(all(test, unix))]
impl ServiceProcess {
    /// Descriptor left in `Stopping`, as after an interrupted stop.
    pub(crate) fn stuck_stopping(id: ServiceId, name: impl Into<String>) -> Self {
        let mut process = Self::new(id, name, OutputLog::new(1));
        process.state = ServiceState::Stopping;
        process
    }
}
