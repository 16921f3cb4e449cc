//! Pluggable catalog and cluster implementations.
//!
//! Each backend module provides concrete types implementing
//! [`VolumeCatalog`](crate::catalog::VolumeCatalog) and/or
//! [`ClusterState`](crate::cluster::ClusterState).

pub mod memory;
