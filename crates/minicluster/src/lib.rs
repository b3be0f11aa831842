//! Disposable multi-process storage clusters for integration tests.
//!
//! Provides local cluster provisioning for testing and development:
//! - Isolated configuration and conflict-free port reservation per instance
//! - Process supervision with readiness probes and captured output
//! - Ordered startup (coordination, init, manager, gc, data nodes)
//! - Extension artifacts placed before the data nodes start
//! - Reverse-order teardown that never leaks processes or storage
//!
//! # Example
//!
//! ```no_run
//! # async fn run() -> minicluster::Result<()> {
//! use minicluster::ConfigBuilder;
//!
//! let mut cluster = minicluster::start(ConfigBuilder::new().data_nodes(2)).await?;
//! let info = cluster.connection_info()?;
//! println!("coordination at {}", info.coordination_endpoint);
//! cluster.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod cluster;
pub mod config;
pub mod coordination;
pub mod error;
pub mod extension;
pub mod launcher;
pub mod output;
pub mod ports;
pub mod probe;
pub mod service;
pub mod supervisor;

pub use cluster::{ClusterHandle, ClusterState, ConnectionInfo, Orchestrator, StopReport};
pub use config::{ClusterConfig, ConfigBuilder, CoordinationMode, Secrets, StorageDisposition};
pub use coordination::CoordinationService;
pub use error::{Error, Result};
pub use extension::{ExtensionArtifact, ExtensionInstaller};
pub use launcher::{
    ClasspathLoader, DefaultClasspathLoader, JvmLauncher, ServiceCommand, ServiceLauncher,
};
pub use output::OutputLog;
pub use ports::{PortAllocator, PortReservation};
pub use probe::{HandshakeProbe, ReadinessProbe, TcpConnectProbe};
pub use service::{ServiceId, ServiceKind, ServiceState};
pub use supervisor::{ExitInfo, ServiceProcess};

/// Starts a cluster with the default JVM launcher and probes.
pub async fn start(builder: ConfigBuilder) -> Result<ClusterHandle> {
    Orchestrator::default().start(builder).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_start_rejects_bad_config_before_spawning() {
        let temp = TempDir::new().unwrap();
        let err = start(
            ConfigBuilder::new()
                .storage_root(temp.path().join("mac"))
                .data_nodes(0),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Configuration(_)));
        assert!(!temp.path().join("mac").exists());
    }

    #[tokio::test]
    async fn test_missing_java_fails_and_cleans_up() {
        let temp = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(std::sync::Arc::new(
            JvmLauncher::new(std::sync::Arc::new(DefaultClasspathLoader::default()))
                .with_java(temp.path().join("no-java")),
        ));

        let err = orchestrator
            .start(ConfigBuilder::new().storage_root(temp.path().join("mac")))
            .await
            .unwrap_err();

        assert!(matches!(err.root_cause(), Error::ProcessStart { .. }));
        assert!(!temp.path().join("mac").exists());
    }
}
