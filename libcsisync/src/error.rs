//! Metadata sync error types.
//!
//! All errors in the `libcsisync` crate are represented by the [`SyncError`]
//! enum, which derives [`thiserror::Error`] for ergonomic error handling and
//! also implements [`Serialize`]/[`Deserialize`] so catalog errors can travel
//! across the QUIC transport layer unchanged.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for catalog, cluster and sync operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The catalog has no volume with this id.
    #[error("volume {0} not found")]
    VolumeNotFound(String),

    /// The catalog already holds a volume backed by this disk.
    #[error("volume {0} already exists")]
    VolumeAlreadyExists(String),

    /// An orchestrator object (claim, pod, volume) does not exist.
    #[error("{kind} {key} not found")]
    ObjectNotFound {
        /// Object kind, e.g. `"PersistentVolumeClaim"`.
        kind: String,
        /// `namespace/name` or bare name for cluster-scoped objects.
        key: String,
    },

    /// The volume catalog returned an error.
    #[error("catalog error: {0}")]
    Catalog(String),

    /// The orchestrator API returned an error.
    #[error("cluster error: {0}")]
    Cluster(String),

    /// A QUIC / transport-level error.
    #[error("transport error: {0}")]
    Transport(String),

    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration is missing or inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Create a [`SyncError::Catalog`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn catalog<E: std::fmt::Display>(e: E) -> Self {
        Self::Catalog(e.to_string())
    }

    /// Create a [`SyncError::Cluster`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn cluster<E: std::fmt::Display>(e: E) -> Self {
        Self::Cluster(e.to_string())
    }

    /// Create a [`SyncError::Transport`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::Transport(e.to_string())
    }

    /// Create a [`SyncError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Shorthand for a missing orchestrator object.
    pub fn object_not_found(kind: &str, key: impl Into<String>) -> Self {
        Self::ObjectNotFound {
            kind: kind.to_owned(),
            key: key.into(),
        }
    }

    /// `true` when the error means "the thing does not exist" rather than
    /// "the call failed".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::VolumeNotFound(_) | Self::ObjectNotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SyncError::VolumeNotFound("fcd-123".into());
        assert_eq!(err.to_string(), "volume fcd-123 not found");

        let err = SyncError::object_not_found("PersistentVolumeClaim", "default/data");
        assert_eq!(
            err.to_string(),
            "PersistentVolumeClaim default/data not found"
        );
    }

    #[test]
    fn not_found_classification() {
        assert!(SyncError::VolumeNotFound("v".into()).is_not_found());
        assert!(SyncError::object_not_found("Pod", "ns/p").is_not_found());
        assert!(!SyncError::cluster("connection refused").is_not_found());
    }

    #[test]
    fn error_serde_roundtrip() {
        let err = SyncError::Catalog("session expired".into());
        let json = serde_json::to_string(&err).expect("serialize");
        let de: SyncError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(err, de);
    }
}
