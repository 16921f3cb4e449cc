//! Volume catalog trait.
//!
//! The catalog is the storage control plane's authoritative list of
//! first-class disks together with the orchestrator metadata attached to
//! each of them.  The sync engine only ever changes it through these calls.

use async_trait::async_trait;

use crate::error::SyncError;
use crate::types::{CreateSpec, QueryFilter, QueryResult, QuerySelection, UpdateSpec};

/// Backend catalog of first-class disks.
///
/// Implementations must be safe to call from several Tokio tasks at once:
/// the full sync runs its create, update and delete phases concurrently.
#[async_trait]
pub trait VolumeCatalog: Send + Sync {
    /// Register a volume and return its catalog id.
    async fn create_volume(&self, spec: CreateSpec) -> Result<String, SyncError>;

    /// Remove a volume from the catalog.
    ///
    /// With `delete_disk == false` only the catalog entry goes away and the
    /// underlying disk is kept.
    async fn delete_volume(&self, volume_id: &str, delete_disk: bool) -> Result<(), SyncError>;

    /// Merge the metadata entries in `spec` into the volume's metadata.
    async fn update_volume_metadata(&self, spec: UpdateSpec) -> Result<(), SyncError>;

    /// Return the matching volumes, metadata included.
    async fn query_volume(&self, filter: QueryFilter) -> Result<QueryResult, SyncError>;

    /// Return every matching volume in one call; `selection` controls how much
    /// of each record comes back.
    async fn query_all_volumes(
        &self,
        filter: QueryFilter,
        selection: QuerySelection,
    ) -> Result<QueryResult, SyncError>;
}
