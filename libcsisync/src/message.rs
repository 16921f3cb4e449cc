//! Catalog protocol messages transmitted over QUIC.
//!
//! [`CatalogMessage`] is the envelope for every request and response
//! exchanged between [`CatalogClient`](crate::transport::client::CatalogClient)
//! and [`CatalogServer`](crate::transport::server::CatalogServer).

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::types::*;

/// Top-level message envelope for the catalog protocol.
///
/// Each QUIC bi-stream carries exactly one request followed by one response.
/// The client sends a *request* variant and the server replies with the
/// corresponding *response* variant (or [`CatalogMessage::Error`]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CatalogMessage {
    // ----- Requests --------------------------------------------------------
    /// Register a volume.
    CreateVolume(CreateSpec),
    /// Remove a volume; `delete_disk` also removes the backing disk.
    DeleteVolume { volume_id: String, delete_disk: bool },
    /// Merge metadata entries into a registered volume.
    UpdateVolumeMetadata(UpdateSpec),
    /// Point query, metadata included.
    QueryVolume(QueryFilter),
    /// Bulk query.
    QueryAllVolumes {
        filter: QueryFilter,
        selection: QuerySelection,
    },

    // ----- Responses -------------------------------------------------------
    /// Id assigned to a newly registered volume.
    VolumeCreated(String),
    /// Matching volumes.
    Volumes(QueryResult),
    /// Generic success acknowledgement (no payload).
    Ok,
    /// An error occurred.
    Error(SyncError),
}

impl std::fmt::Display for CatalogMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateVolume(spec) => write!(f, "CreateVolume(name={})", spec.name),
            Self::DeleteVolume {
                volume_id,
                delete_disk,
            } => write!(f, "DeleteVolume({volume_id}, delete_disk={delete_disk})"),
            Self::UpdateVolumeMetadata(spec) => write!(
                f,
                "UpdateVolumeMetadata({}, entries={})",
                spec.volume_id,
                spec.metadata.len()
            ),
            Self::QueryVolume(filter) => {
                write!(f, "QueryVolume(ids={})", filter.volume_ids.len())
            }
            Self::QueryAllVolumes { selection, .. } => write!(
                f,
                "QueryAllVolumes(include_metadata={})",
                selection.include_metadata
            ),
            Self::VolumeCreated(id) => write!(f, "VolumeCreated({id})"),
            Self::Volumes(result) => write!(f, "Volumes(count={})", result.volumes.len()),
            Self::Ok => f.write_str("Ok"),
            Self::Error(e) => write!(f, "Error({e})"),
        }
    }
}
