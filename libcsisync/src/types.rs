//! Core data model shared by the catalog, the orchestrator view and the sync
//! engine.
//!
//! The catalog side ([`VolumeRecord`], [`EntityMetadata`], the request specs)
//! is what the backend stores and is [`Serialize`]/[`Deserialize`] so it can
//! be transmitted over QUIC as JSON.  The orchestrator side
//! ([`OrchestratorVolume`], [`OrchestratorClaim`], [`OrchestratorPod`]) is a
//! normalized projection of the cluster API objects the engine reasons about.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

/// Label set attached to an orchestrator object or a metadata entry.
pub type Labels = HashMap<String, String>;

// ---------------------------------------------------------------------------
// Catalog-side metadata
// ---------------------------------------------------------------------------

/// Kind of orchestrator entity a metadata entry describes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EntityType {
    PersistentVolume,
    PersistentVolumeClaim,
    Pod,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PersistentVolume => "PERSISTENT_VOLUME",
            Self::PersistentVolumeClaim => "PERSISTENT_VOLUME_CLAIM",
            Self::Pod => "POD",
        })
    }
}

/// A `(name, namespace)` pair naming a namespaced orchestrator object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub name: String,
    pub namespace: String,
}

impl EntityRef {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// One metadata entry stored against a catalog volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityMetadata {
    pub entity_type: EntityType,
    pub entity_name: String,
    /// Empty for cluster-scoped entities (persistent volumes).
    #[serde(default)]
    pub namespace: String,
    /// `None` leaves whatever labels the catalog already holds untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Labels>,
    /// Tombstone: remove this entity's entry from the volume's metadata.
    #[serde(default)]
    pub delete_marker: bool,
}

/// Identity of the cluster that owns a catalog volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ContainerCluster {
    pub cluster_type: String,
    pub cluster_id: String,
    #[serde(default)]
    pub user: String,
}

/// A volume as held by the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeRecord {
    /// Catalog id; equals the orchestrator volume handle.
    pub id: String,
    pub name: String,
    pub cluster_id: String,
    #[serde(default)]
    pub metadata: Vec<EntityMetadata>,
}

// ---------------------------------------------------------------------------
// Catalog requests
// ---------------------------------------------------------------------------

/// Backing object for a volume being registered in the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BackingDetails {
    pub capacity_mb: u64,
    /// Existing disk to register instead of allocating a new one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backing_disk_id: Option<String>,
}

/// Request to register a volume in the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateSpec {
    pub name: String,
    pub volume_type: String,
    pub backing: BackingDetails,
    pub cluster: ContainerCluster,
    #[serde(default)]
    pub metadata: Vec<EntityMetadata>,
}

/// Request to push metadata entries onto a catalog volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateSpec {
    pub volume_id: String,
    pub cluster: ContainerCluster,
    pub metadata: Vec<EntityMetadata>,
}

/// Narrows a catalog query. Empty vectors match everything.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct QueryFilter {
    #[serde(default)]
    pub volume_ids: Vec<String>,
    #[serde(default)]
    pub cluster_ids: Vec<String>,
}

impl QueryFilter {
    pub fn by_volume(volume_id: impl Into<String>) -> Self {
        Self {
            volume_ids: vec![volume_id.into()],
            ..Default::default()
        }
    }

    pub fn by_cluster(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_ids: vec![cluster_id.into()],
            ..Default::default()
        }
    }
}

/// Which parts of each record a query returns.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct QuerySelection {
    pub include_metadata: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct QueryResult {
    #[serde(default)]
    pub volumes: Vec<VolumeRecord>,
}

// ---------------------------------------------------------------------------
// Orchestrator-side model
// ---------------------------------------------------------------------------

/// Lifecycle phase of an orchestrator volume.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum VolumePhase {
    #[default]
    Pending,
    Bound,
    Available,
    Released,
    Failed,
}

impl VolumePhase {
    /// Only these phases have a trustworthy link to a catalog volume.
    pub fn is_reconcilable(self) -> bool {
        matches!(self, Self::Bound | Self::Available | Self::Released)
    }
}

impl FromStr for VolumePhase {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Bound" => Ok(Self::Bound),
            "Available" => Ok(Self::Available),
            "Released" => Ok(Self::Released),
            "Failed" => Ok(Self::Failed),
            other => Err(SyncError::InvalidArgument(format!(
                "unknown volume phase {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ReclaimPolicy {
    #[default]
    Delete,
    Retain,
    Recycle,
}

impl FromStr for ReclaimPolicy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Delete" => Ok(Self::Delete),
            "Retain" => Ok(Self::Retain),
            "Recycle" => Ok(Self::Recycle),
            other => Err(SyncError::InvalidArgument(format!(
                "unknown reclaim policy {other:?}"
            ))),
        }
    }
}

/// Reference from a volume to the claim bound to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimRef {
    pub namespace: String,
    pub name: String,
}

impl ClaimRef {
    pub fn key(&self) -> String {
        claim_key(&self.namespace, &self.name)
    }
}

/// Orchestrator persistent volume, reduced to what the sync engine reads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct OrchestratorVolume {
    pub name: String,
    /// Catalog volume id.
    pub volume_handle: String,
    /// CSI driver that provisioned the volume; empty for non-CSI volumes.
    pub driver: String,
    pub phase: VolumePhase,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub claim_ref: Option<ClaimRef>,
    #[serde(default)]
    pub storage_class: String,
    #[serde(default)]
    pub reclaim_policy: ReclaimPolicy,
    #[serde(default)]
    pub capacity_bytes: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ClaimPhase {
    #[default]
    Pending,
    Bound,
    Lost,
}

impl FromStr for ClaimPhase {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Bound" => Ok(Self::Bound),
            "Lost" => Ok(Self::Lost),
            other => Err(SyncError::InvalidArgument(format!(
                "unknown claim phase {other:?}"
            ))),
        }
    }
}

/// Orchestrator persistent volume claim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct OrchestratorClaim {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: Labels,
    /// Name of the bound volume, once bound.
    #[serde(default)]
    pub volume_name: Option<String>,
    #[serde(default)]
    pub phase: ClaimPhase,
}

impl OrchestratorClaim {
    pub fn key(&self) -> String {
        claim_key(&self.namespace, &self.name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
        })
    }
}

impl FromStr for PodPhase {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Running" => Ok(Self::Running),
            "Succeeded" => Ok(Self::Succeeded),
            "Failed" => Ok(Self::Failed),
            "Unknown" => Ok(Self::Unknown),
            other => Err(SyncError::InvalidArgument(format!(
                "unknown pod phase {other:?}"
            ))),
        }
    }
}

/// Orchestrator pod, reduced to the claims it mounts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct OrchestratorPod {
    pub name: String,
    pub namespace: String,
    pub phase: PodPhase,
    /// Claims referenced from the pod's volume list, same namespace.
    #[serde(default)]
    pub claim_names: Vec<String>,
}

impl OrchestratorPod {
    pub fn mounts_claim(&self, claim_name: &str) -> bool {
        self.claim_names.iter().any(|c| c == claim_name)
    }
}

/// `namespace/name` key used to index claims and the pods mounting them.
pub fn claim_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}
