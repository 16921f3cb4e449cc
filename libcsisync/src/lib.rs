//! # libcsisync: volume metadata reconciliation for CSI drivers
//!
//! `libcsisync` keeps a first-class-disk volume catalog consistent with the
//! persistent volumes, claims and pods of a container orchestrator.  It runs
//! two paths against the same catalog: a periodic full sync that snapshots
//! both sides and converges them, and incremental handlers that push single
//! watch events as they happen.  It follows the RK8s conventions (Tokio async
//! runtime, `tracing` for observability, `thiserror` for structured errors)
//! and reaches a remote catalog over QUIC (via [`quinn`]).
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: entity metadata, specs, orchestrator objects. |
//! | [`error`] | [`SyncError`] enum covering all failure modes. |
//! | [`config`] | [`SyncConfig`] with defaults, env overrides and validation. |
//! | [`catalog`] | [`VolumeCatalog`] trait for the backend volume catalog. |
//! | [`cluster`] | [`ClusterState`] trait and [`ClusterEvent`] watch events. |
//! | [`metadata`] | Entity metadata builder. |
//! | [`compare`] | Classifies a fresh metadata list against the catalog's. |
//! | [`index`] | Volume → claim → running pod index for one cycle. |
//! | [`debounce`] | Two-sighting deletion debounce. |
//! | [`syncer`] | Full sync, event handlers and the [`MetadataSyncer`] loop. |
//! | [`message`] | [`CatalogMessage`] protocol envelope for QUIC transport. |
//! | [`transport`] | QUIC client/server built on `quinn`. |
//! | [`backend`] | In-memory catalog and cluster. |

pub mod backend;
pub mod catalog;
pub mod cluster;
pub mod compare;
pub mod config;
pub mod debounce;
pub mod error;
pub mod index;
pub mod message;
pub mod metadata;
pub mod syncer;
pub mod transport;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use catalog::VolumeCatalog;
pub use cluster::{ClusterEvent, ClusterState};
pub use config::SyncConfig;
pub use error::SyncError;
pub use message::CatalogMessage;
pub use syncer::{EventHandlers, FullSync, MetadataSyncer, SyncReport};
pub use types::*;
