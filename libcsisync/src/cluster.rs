//! Orchestrator view trait and watch events.
//!
//! [`ClusterState`] is the read side of the orchestrator API: list volumes,
//! fetch a claim, list the pods of a namespace, and subscribe to changes.
//! Changes arrive as [`ClusterEvent`] values on a channel so that callback
//! processing runs on its own path, separate from the full-sync timer.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::SyncError;
use crate::types::{OrchestratorClaim, OrchestratorPod, OrchestratorVolume, PodPhase};

/// A change observed on the orchestrator.
///
/// Update variants carry the previously observed object when one is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    VolumeAdded(OrchestratorVolume),
    VolumeUpdated {
        old: OrchestratorVolume,
        new: OrchestratorVolume,
    },
    VolumeDeleted(OrchestratorVolume),
    ClaimAdded(OrchestratorClaim),
    ClaimUpdated {
        old: OrchestratorClaim,
        new: OrchestratorClaim,
    },
    ClaimDeleted(OrchestratorClaim),
    PodAdded(OrchestratorPod),
    PodUpdated {
        old: OrchestratorPod,
        new: OrchestratorPod,
    },
    PodDeleted(OrchestratorPod),
}

impl ClusterEvent {
    /// Short label for logs, e.g. `"VolumeUpdated(pv-1)"`.
    pub fn describe(&self) -> String {
        match self {
            Self::VolumeAdded(v) => format!("VolumeAdded({})", v.name),
            Self::VolumeUpdated { new, .. } => format!("VolumeUpdated({})", new.name),
            Self::VolumeDeleted(v) => format!("VolumeDeleted({})", v.name),
            Self::ClaimAdded(c) => format!("ClaimAdded({})", c.key()),
            Self::ClaimUpdated { new, .. } => format!("ClaimUpdated({})", new.key()),
            Self::ClaimDeleted(c) => format!("ClaimDeleted({})", c.key()),
            Self::PodAdded(p) => format!("PodAdded({}/{})", p.namespace, p.name),
            Self::PodUpdated { new, .. } => format!("PodUpdated({}/{})", new.namespace, new.name),
            Self::PodDeleted(p) => format!("PodDeleted({}/{})", p.namespace, p.name),
        }
    }
}

/// Read access to the orchestrator's declarative state.
#[async_trait]
pub trait ClusterState: Send + Sync {
    /// Every persistent volume in the cluster, all drivers and phases.
    async fn list_volumes(&self) -> Result<Vec<OrchestratorVolume>, SyncError>;

    /// Fetch one volume by name; a missing volume is
    /// [`SyncError::ObjectNotFound`].
    async fn get_volume(&self, name: &str) -> Result<OrchestratorVolume, SyncError>;

    /// Fetch one claim; a missing claim is [`SyncError::ObjectNotFound`].
    async fn get_claim(&self, namespace: &str, name: &str)
    -> Result<OrchestratorClaim, SyncError>;

    /// Pods of `namespace` currently in `phase`.
    async fn list_pods(
        &self,
        namespace: &str,
        phase: PodPhase,
    ) -> Result<Vec<OrchestratorPod>, SyncError>;

    /// Start delivering change events. Each call returns an independent
    /// stream; it ends when the underlying watches stop.
    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<ClusterEvent>, SyncError>;
}
