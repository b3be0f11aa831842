//! Service identities and the per-service state machine.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kinds of service process a cluster is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    /// Consensus ensemble every other service registers with.
    Coordination,
    /// Cluster-wide metadata and assignment.
    Manager,
    /// Reclaims unreferenced storage.
    GarbageCollector,
    /// Holds and serves a shard of the data.
    DataNode,
}

impl ServiceKind {
    /// Kinds in dependency (start) order.
    pub const START_ORDER: [ServiceKind; 4] = [
        ServiceKind::Coordination,
        ServiceKind::Manager,
        ServiceKind::GarbageCollector,
        ServiceKind::DataNode,
    ];

    /// Short name used in process names, log files and manifests.
    pub fn short_name(self) -> &'static str {
        match self {
            Self::Coordination => "zookeeper",
            Self::Manager => "manager",
            Self::GarbageCollector => "gc",
            Self::DataNode => "tserver",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// One service instance within a cluster: a kind plus an ordinal.
///
/// Only data nodes have ordinals above zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceId {
    pub kind: ServiceKind,
    pub ordinal: usize,
}

impl ServiceId {
    pub const COORDINATION: ServiceId = ServiceId::single(ServiceKind::Coordination);
    pub const MANAGER: ServiceId = ServiceId::single(ServiceKind::Manager);
    pub const GARBAGE_COLLECTOR: ServiceId = ServiceId::single(ServiceKind::GarbageCollector);

    const fn single(kind: ServiceKind) -> Self {
        Self { kind, ordinal: 0 }
    }

    /// The `ordinal`-th data node.
    pub const fn data_node(ordinal: usize) -> Self {
        Self {
            kind: ServiceKind::DataNode,
            ordinal,
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ServiceKind::DataNode => write!(f, "{}-{}", self.kind, self.ordinal),
            kind => write!(f, "{kind}"),
        }
    }
}

/// Lifecycle state of one supervised service process.
///
/// States only move forward along
/// `NotStarted -> Starting -> Ready -> Stopping -> Stopped`, or divert to
/// `Failed` from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceState {
    NotStarted,
    Starting,
    Ready,
    Stopping,
    Stopped,
    Failed,
}

impl ServiceState {
    fn rank(self) -> Option<u8> {
        match self {
            Self::NotStarted => Some(0),
            Self::Starting => Some(1),
            Self::Ready => Some(2),
            Self::Stopping => Some(3),
            Self::Stopped => Some(4),
            Self::Failed => None,
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: ServiceState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.rank(), next.rank()) {
            (_, None) => true,
            (Some(from), Some(to)) => to > from,
            (None, Some(_)) => false,
        }
    }

    /// Moves `self` to `next`, rejecting reversals.
    pub fn transition(&mut self, next: ServiceState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(Error::InvalidState {
                operation: "change service state",
                state: format!("{self:?} (requested {next:?})"),
            });
        }
        *self = next;
        Ok(())
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
