//! Cluster lifecycle: provisioning, health, teardown.
//!
//! [`Orchestrator::start`] brings the services up strictly in order, each one
//! awaited before the next is launched:
//!
//! 1. coordination (embedded or external)
//! 2. the one-shot init step, unless the storage root is already initialized
//! 3. pending extension artifacts
//! 4. manager, garbage collector, then every data node
//!
//! Provisioning is all-or-nothing. Any failure, including running past the
//! provisioning timeout, stops whatever was started in reverse order and
//! disposes the storage root before the error is returned.

use crate::coordination::CoordinationService;
use crate::extension::{ExtensionArtifact, ExtensionInstaller};
use crate::launcher::{DefaultClasspathLoader, JvmLauncher, ServiceLauncher};
use crate::output::OutputLog;
use crate::ports::PortReservation;
use crate::probe::{HandshakeProbe, ReadinessProbe, TcpConnectProbe};
use crate::supervisor::{ServiceProcess, run_oneshot};
use crate::{
    ClusterConfig, ConfigBuilder, Error, Result, ServiceId, ServiceKind, ServiceState,
    StorageDisposition,
};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

/// Overall state of a cluster handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterState {
    Provisioning,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What a client needs to reach a running cluster.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// `host:port` of the coordination ensemble.
    pub coordination_endpoint: String,
    pub instance_name: String,
    pub storage_root: PathBuf,
    pub root_password: String,
}

impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("coordination_endpoint", &self.coordination_endpoint)
            .field("instance_name", &self.instance_name)
            .field("storage_root", &self.storage_root)
            .field("root_password", &"<redacted>")
            .finish()
    }
}

/// Outcome of a successful stop.
#[derive(Debug, Default)]
pub struct StopReport {
    /// Services that ignored termination and had to be killed.
    pub warnings: Vec<Error>,
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Starts clusters with a given launcher, probes and extension set.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    launcher: Arc<dyn ServiceLauncher>,
    probes: HashMap<ServiceKind, Arc<dyn ReadinessProbe>>,
    extensions: Vec<PathBuf>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        let loader = Arc::new(DefaultClasspathLoader::from_env());
        Self::new(Arc::new(JvmLauncher::new(loader)))
    }
}

impl Orchestrator {
    /// Orchestrator with the default probes: handshake for coordination,
    /// TCP connect for everything else.
    pub fn new(launcher: Arc<dyn ServiceLauncher>) -> Self {
        let tcp: Arc<dyn ReadinessProbe> = Arc::new(TcpConnectProbe::default());
        let mut probes: HashMap<ServiceKind, Arc<dyn ReadinessProbe>> = HashMap::new();
        probes.insert(ServiceKind::Coordination, Arc::new(HandshakeProbe::default()));
        for kind in [
            ServiceKind::Manager,
            ServiceKind::GarbageCollector,
            ServiceKind::DataNode,
        ] {
            probes.insert(kind, Arc::clone(&tcp));
        }
        Self {
            launcher,
            probes,
            extensions: Vec::new(),
        }
    }

    /// Replaces the readiness probe for every service of `kind`.
    pub fn with_probe(mut self, kind: ServiceKind, probe: Arc<dyn ReadinessProbe>) -> Self {
        self.probes.insert(kind, probe);
        self
    }

    /// Queues an artifact to be installed before the first data node starts.
    pub fn with_extension(mut self, path: impl Into<PathBuf>) -> Self {
        self.extensions.push(path.into());
        self
    }

    /// Provisions a cluster and waits until every service is ready.
    pub async fn start(&self, builder: ConfigBuilder) -> Result<ClusterHandle> {
        let (config, reservation) = builder.build()?;
        let instance = config.instance_name.clone();
        let limit = config.provisioning_timeout;

        tracing::info!(
            instance = %instance,
            root = %config.storage_root.display(),
            data_nodes = config.data_nodes,
            "provisioning cluster"
        );

        let mut handle = ClusterHandle {
            coordination: CoordinationService::new(&config),
            installer: ExtensionInstaller::new(&config.extension_dir),
            extensions: Vec::new(),
            services: Vec::new(),
            state: ClusterState::Provisioning,
            reservation: Some(reservation),
            launcher: Arc::clone(&self.launcher),
            probes: self.probes.clone(),
            config,
        };

        let outcome = match tokio::time::timeout(limit, handle.provision(&self.extensions)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::ProvisioningTimeout(limit)),
        };

        match outcome {
            Ok(()) => {
                handle.state = ClusterState::Running;
                tracing::info!(
                    instance = %instance,
                    endpoint = %handle.config.coordination_endpoint(),
                    "cluster running"
                );
                Ok(handle)
            }
            Err(e) => {
                tracing::error!(instance = %instance, error = %e, "provisioning failed, tearing down");
                handle.state = ClusterState::Failed;
                let (_, failures) = handle.teardown().await;
                for failure in &failures {
                    tracing::warn!(instance = %instance, error = %failure, "teardown after failed start");
                }
                Err(e.in_cluster(&instance))
            }
        }
    }
}

/// A provisioned cluster. Stop it explicitly; dropping it kills the processes
/// and applies the storage disposition on a best-effort basis.
pub struct ClusterHandle {
    config: ClusterConfig,
    reservation: Option<PortReservation>,
    coordination: CoordinationService,
    services: Vec<ServiceProcess>,
    installer: ExtensionInstaller,
    extensions: Vec<ExtensionArtifact>,
    state: ClusterState,
    launcher: Arc<dyn ServiceLauncher>,
    probes: HashMap<ServiceKind, Arc<dyn ReadinessProbe>>,
}

impl fmt::Debug for ClusterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterHandle")
            .field("instance", &self.config.instance_name)
            .field("state", &self.state)
            .field("coordination", &self.coordination)
            .field("services", &self.services)
            .finish_non_exhaustive()
    }
}

impl ClusterHandle {
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Supervised processes in start order, coordination first when embedded.
    pub fn services(&self) -> impl Iterator<Item = &ServiceProcess> {
        self.coordination
            .process()
            .into_iter()
            .chain(self.services.iter())
    }

    /// Looks up one supervised process.
    pub fn service(&self, id: ServiceId) -> Option<&ServiceProcess> {
        self.services().find(|s| s.id() == id)
    }

    /// Artifacts installed through this handle.
    pub fn extensions(&self) -> &[ExtensionArtifact] {
        &self.extensions
    }

    /// Current state, after re-checking every process for an unexpected exit.
    pub fn state(&mut self) -> ClusterState {
        if self.state == ClusterState::Running {
            let mut failed = self.coordination.refresh() == ServiceState::Failed;
            for service in &mut self.services {
                if service.refresh() == ServiceState::Failed {
                    tracing::warn!(
                        instance = %self.config.instance_name,
                        service = %service.name(),
                        "service exited unexpectedly"
                    );
                    failed = true;
                }
            }
            if failed {
                self.state = ClusterState::Failed;
            }
        }
        self.state
    }

    /// Endpoint and credentials. Only available while Running.
    pub fn connection_info(&mut self) -> Result<ConnectionInfo> {
        let state = self.state();
        let endpoint = match (state, self.coordination.endpoint()) {
            (ClusterState::Running, Some(endpoint)) => endpoint.to_string(),
            _ => {
                return Err(Error::InvalidState {
                    operation: "get connection info",
                    state: state.to_string(),
                });
            }
        };
        Ok(ConnectionInfo {
            coordination_endpoint: endpoint,
            instance_name: self.config.instance_name.clone(),
            storage_root: self.config.storage_root.clone(),
            root_password: self.config.secrets.root_password.clone(),
        })
    }

    /// Stops every service in reverse start order, disposes the storage root
    /// and releases the ports.
    ///
    /// Every service is attempted even when an earlier one fails; failures
    /// come back together as [`Error::Teardown`], forced kills as warnings in
    /// the [`StopReport`]. Stopping a stopped cluster does nothing.
    pub async fn stop(&mut self) -> Result<StopReport> {
        match self.state {
            ClusterState::Stopped => return Ok(StopReport::default()),
            ClusterState::Running | ClusterState::Failed => {}
            state @ (ClusterState::Provisioning | ClusterState::Stopping) => {
                return Err(Error::InvalidState {
                    operation: "stop cluster",
                    state: state.to_string(),
                });
            }
        }

        let instance = self.config.instance_name.clone();
        tracing::info!(instance = %instance, "stopping cluster");
        self.state = ClusterState::Stopping;
        let (warnings, failures) = self.teardown().await;
        self.state = ClusterState::Stopped;

        if failures.is_empty() {
            tracing::info!(instance = %instance, warnings = warnings.len(), "cluster stopped");
            Ok(StopReport { warnings })
        } else {
            Err(Error::Teardown(failures).in_cluster(&instance))
        }
    }

    /// Installs an artifact into the running cluster's extension directory.
    ///
    /// Running data nodes are only guaranteed to see it after a restart; see
    /// [`Self::restart_data_node`].
    pub fn install_extension(&mut self, path: impl Into<PathBuf>) -> Result<ExtensionArtifact> {
        if self.state() != ClusterState::Running {
            return Err(Error::InvalidState {
                operation: "install extension",
                state: self.state.to_string(),
            });
        }
        let mut artifact = ExtensionArtifact::from_path(path)?;
        self.installer.install(&mut artifact)?;
        tracing::info!(
            instance = %self.config.instance_name,
            artifact = %artifact.target_name(),
            "extension installed into running cluster; restart data nodes to guarantee visibility"
        );
        self.extensions.push(artifact.clone());
        Ok(artifact)
    }

    /// Stops data node `ordinal` and launches a fresh process in its place.
    pub async fn restart_data_node(&mut self, ordinal: usize) -> Result<()> {
        if self.state() != ClusterState::Running {
            return Err(Error::InvalidState {
                operation: "restart data node",
                state: self.state.to_string(),
            });
        }
        let id = ServiceId::data_node(ordinal);
        let index = self
            .services
            .iter()
            .position(|s| s.id() == id)
            .ok_or_else(|| Error::Configuration(format!("no data node with ordinal {ordinal}")))?;

        tracing::info!(instance = %self.config.instance_name, service = %id, "restarting data node");
        if let Some(warning) = self.services[index].stop(self.config.stop_grace_period).await? {
            tracing::warn!(error = %warning, "data node killed during restart");
        }

        self.services[index] = self.new_process(id);
        let result = self.launch_at(index).await;
        if result.is_err() {
            self.state = ClusterState::Failed;
        }
        result.map_err(|e| e.in_cluster(&self.config.instance_name))
    }

    async fn provision(&mut self, extensions: &[PathBuf]) -> Result<()> {
        self.config.materialize()?;

        let probe = self.probe(ServiceKind::Coordination);
        self.coordination
            .start(&self.config, self.launcher.as_ref(), probe.as_ref())
            .await?;

        self.initialize().await?;

        for path in extensions {
            let mut artifact = ExtensionArtifact::from_path(path)?;
            self.installer.install(&mut artifact)?;
            self.extensions.push(artifact);
        }

        for id in self.config.services() {
            if id.kind == ServiceKind::Coordination {
                continue;
            }
            let process = self.new_process(id);
            self.services.push(process);
            self.launch_at(self.services.len() - 1).await?;
        }
        Ok(())
    }

    /// Runs the launcher's init step once per storage root.
    async fn initialize(&self) -> Result<()> {
        if self.config.is_initialized() {
            tracing::debug!(instance = %self.config.instance_name, "storage root already initialized");
            return Ok(());
        }
        let Some(command) = self.launcher.init_command(&self.config)? else {
            return Ok(());
        };

        let name = format!("mac-{}-init", self.config.instance_id);
        let output = self.output_log(&name);
        tracing::info!(instance = %self.config.instance_name, "initializing instance");
        run_oneshot(&name, &command, &output, self.config.provisioning_timeout).await?;

        tokio::fs::write(self.config.initialized_marker(), &self.config.instance_id).await?;
        Ok(())
    }

    fn new_process(&self, id: ServiceId) -> ServiceProcess {
        let name = self.config.process_name(id);
        let output = self.output_log(&name);
        ServiceProcess::new(id, name, output)
    }

    fn output_log(&self, name: &str) -> OutputLog {
        let output = OutputLog::new(self.config.output_capacity);
        if self.config.log_to_files {
            output.with_files(&self.config.log_dir(), name)
        } else {
            output
        }
    }

    /// Starts the not-yet-started process at `index` and awaits readiness.
    async fn launch_at(&mut self, index: usize) -> Result<()> {
        let id = self.services[index].id();
        let command = self.launcher.service_command(&self.config, id)?;
        let addr = self.config.socket_addr(id)?;
        let probe = self.probe(id.kind);

        let process = &mut self.services[index];
        process.start(&command)?;
        process
            .await_ready(
                probe.as_ref(),
                addr,
                self.config.startup_timeout,
                self.config.poll_interval,
            )
            .await
    }

    fn probe(&self, kind: ServiceKind) -> Arc<dyn ReadinessProbe> {
        self.probes
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| Arc::new(TcpConnectProbe::default()))
    }

    /// Stops everything in reverse order, disposes storage and releases the
    /// ports. Returns `(warnings, failures)`.
    async fn teardown(&mut self) -> (Vec<Error>, Vec<Error>) {
        let grace = self.config.stop_grace_period;
        let mut warnings = Vec::new();
        let mut failures = Vec::new();

        for service in self.services.iter_mut().rev() {
            match service.stop(grace).await {
                Ok(Some(warning)) => warnings.push(warning),
                Ok(None) => {}
                Err(e) => failures.push(e),
            }
        }
        match self.coordination.stop(grace).await {
            Ok(Some(warning)) => warnings.push(warning),
            Ok(None) => {}
            Err(e) => failures.push(e),
        }

        if let Err(e) = self.dispose_storage() {
            failures.push(e);
        }
        self.reservation = None;
        (warnings, failures)
    }

    fn dispose_storage(&self) -> Result<()> {
        if self.config.disposition == StorageDisposition::Retain {
            tracing::debug!(root = %self.config.storage_root.display(), "retaining storage root");
            return Ok(());
        }
        match std::fs::remove_dir_all(&self.config.storage_root) {
            Ok(()) => {
                tracing::debug!(root = %self.config.storage_root.display(), "storage root removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for ClusterHandle {
    fn drop(&mut self) {
        if self.reservation.is_none() {
            return;
        }
        tracing::warn!(
            instance = %self.config.instance_name,
            "cluster handle dropped without stop; killing processes"
        );
        // Nothing may still write into the root when it is removed.
        for service in self.services.iter_mut().rev() {
            service.kill_now();
        }
        self.coordination.kill_now();
        self.services.clear();
        if let Err(e) = self.dispose_storage() {
            tracing::warn!(error = %e, "could not dispose storage root");
        }
    }
}
