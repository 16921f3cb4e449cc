//! QUIC transport layer for catalog messages.
//!
//! This module provides [`CatalogClient`](client::CatalogClient) and
//! [`CatalogServer`](server::CatalogServer) that exchange
//! [`CatalogMessage`](crate::message::CatalogMessage) values over QUIC
//! bi-directional streams using `quinn`, plus [`tls`] helpers that build the
//! `rustls` configurations both ends need.

pub mod client;
pub mod server;
pub mod tls;

/// Upper bound on a single serialized message.
pub(crate) const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;
