//! Error types for cluster provisioning.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Cluster provisioning errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or conflicting configuration input.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Not enough free ports were found within the probe bound.
    #[error("Could not reserve {requested} free ports after {attempts} probes (found {found})")]
    PortAllocation {
        requested: usize,
        found: usize,
        attempts: usize,
    },

    /// The service process could not be launched, or died while starting.
    #[error("Service {service} failed to start: {reason}")]
    ProcessStart {
        service: String,
        reason: String,
        output: Vec<String>,
    },

    /// The service process launched but never became reachable.
    #[error("Service {service} was not ready within {timeout:?} ({} output lines captured)", .output.len())]
    ReadinessTimeout {
        service: String,
        timeout: Duration,
        output: Vec<String>,
    },

    /// Graceful stop did not finish within the grace period and the process
    /// was killed. Reported as a warning: the service still reached Stopped.
    #[error("Service {service} ignored termination for {grace_period:?} and was killed")]
    Shutdown {
        service: String,
        grace_period: Duration,
    },

    /// Operation is not permitted in the current state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// The whole provisioning sequence exceeded its deadline.
    #[error("Cluster provisioning did not finish within {0:?}")]
    ProvisioningTimeout(Duration),

    /// Extension artifact could not be installed or removed.
    #[error("Extension {path}: {reason}")]
    Extension { path: PathBuf, reason: String },

    /// One or more steps of a stop failed. Every service was still attempted.
    #[error("Teardown finished with {} failure(s): {}", .0.len(), summarize(.0))]
    Teardown(Vec<Error>),

    /// An error raised while provisioning or stopping a named instance.
    #[error("Cluster '{instance}': {source}")]
    Cluster {
        instance: String,
        #[source]
        source: Box<Error>,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Manifest serialization error.
    #[error("Manifest serialization error: {0}")]
    Manifest(#[from] toml::ser::Error),
}

impl Error {
    /// Wraps `self` with the name of the cluster instance it belongs to.
    pub(crate) fn in_cluster(self, instance: &str) -> Self {
        match self {
            already @ Self::Cluster { .. } => already,
            other => Self::Cluster {
                instance: instance.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Returns the innermost error, skipping cluster context wrappers.
    pub fn root_cause(&self) -> &Error {
        match self {
            Self::Cluster { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Captured process output attached to this error, if any.
    pub fn captured_output(&self) -> &[String] {
        match self.root_cause() {
            Self::ProcessStart { output, .. } | Self::ReadinessTimeout { output, .. } => output,
            _ => &[],
        }
    }

    /// Whether this error is a warning that did not prevent reaching Stopped.
    pub fn is_warning(&self) -> bool {
        matches!(self.root_cause(), Self::Shutdown { .. })
    }
}

fn summarize(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for cluster operations.
pub type Result<T> = std::result::Result<T, Error>;
