//! QUIC server that exposes a [`VolumeCatalog`] implementation to remote
//! syncers.

use std::net::SocketAddr;
use std::sync::Arc;

use quinn::crypto::rustls::QuicServerConfig;
use tracing::{debug, error, info, instrument, warn};

use crate::catalog::VolumeCatalog;
use crate::error::SyncError;
use crate::message::CatalogMessage;
use crate::transport::MAX_MESSAGE_BYTES;

/// A catalog server that accepts QUIC connections and dispatches
/// [`CatalogMessage`] requests to a [`VolumeCatalog`].
pub struct CatalogServer<T> {
    endpoint: quinn::Endpoint,
    catalog: Arc<T>,
}

impl<T> CatalogServer<T>
where
    T: VolumeCatalog + 'static,
{
    /// Create a new server bound to `addr`.
    pub fn new(
        addr: SocketAddr,
        tls_config: rustls::ServerConfig,
        catalog: Arc<T>,
    ) -> Result<Self, SyncError> {
        let quic_server_config = QuicServerConfig::try_from(tls_config)
            .map_err(|e| SyncError::Transport(format!("invalid TLS config: {e}")))?;
        let server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_server_config));
        let endpoint =
            quinn::Endpoint::server(server_config, addr).map_err(SyncError::transport)?;
        info!(%addr, "catalog QUIC server listening");
        Ok(Self { endpoint, catalog })
    }

    /// Accept connections in a loop until the endpoint is closed.
    ///
    /// Each accepted connection spawns a Tokio task, and each bi-stream
    /// within a connection is handled concurrently.
    pub async fn serve(&self) -> Result<(), SyncError> {
        while let Some(incoming) = self.endpoint.accept().await {
            let catalog = Arc::clone(&self.catalog);
            tokio::spawn(async move {
                match incoming.await {
                    Ok(conn) => {
                        let remote = conn.remote_address();
                        debug!(%remote, "catalog connection accepted");
                        if let Err(e) = Self::handle_connection(conn, catalog).await {
                            warn!(%remote, error = %e, "catalog connection error");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "catalog incoming connection failed");
                    }
                }
            });
        }
        Ok(())
    }

    async fn handle_connection(
        conn: quinn::Connection,
        catalog: Arc<T>,
    ) -> Result<(), SyncError> {
        loop {
            let (send, recv) = match conn.accept_bi().await {
                Ok(stream) => stream,
                Err(quinn::ConnectionError::ApplicationClosed(_)) => return Ok(()),
                Err(e) => return Err(SyncError::transport(e)),
            };

            let catalog = Arc::clone(&catalog);
            tokio::spawn(async move {
                if let Err(e) = Self::handle_stream(send, recv, catalog.as_ref()).await {
                    error!(error = %e, "catalog stream handler error");
                }
            });
        }
    }

    /// Read request, dispatch, write response.
    #[instrument(skip_all)]
    async fn handle_stream(
        mut send: quinn::SendStream,
        mut recv: quinn::RecvStream,
        catalog: &T,
    ) -> Result<(), SyncError> {
        let buf = recv
            .read_to_end(MAX_MESSAGE_BYTES)
            .await
            .map_err(SyncError::transport)?;

        let response = match serde_json::from_slice::<CatalogMessage>(&buf) {
            Ok(request) => {
                debug!(%request, "catalog request received");
                Self::dispatch(catalog, request).await
            }
            Err(e) => CatalogMessage::Error(SyncError::InvalidArgument(format!(
                "malformed request: {e}"
            ))),
        };

        let payload = serde_json::to_vec(&response).map_err(SyncError::internal)?;
        send.write_all(&payload)
            .await
            .map_err(SyncError::transport)?;
        send.finish().map_err(SyncError::transport)?;
        Ok(())
    }

    /// Map a request to the catalog call and wrap the result in a response.
    async fn dispatch(catalog: &T, request: CatalogMessage) -> CatalogMessage {
        match request {
            CatalogMessage::CreateVolume(spec) => match catalog.create_volume(spec).await {
                Ok(id) => CatalogMessage::VolumeCreated(id),
                Err(e) => CatalogMessage::Error(e),
            },
            CatalogMessage::DeleteVolume {
                volume_id,
                delete_disk,
            } => match catalog.delete_volume(&volume_id, delete_disk).await {
                Ok(()) => CatalogMessage::Ok,
                Err(e) => CatalogMessage::Error(e),
            },
            CatalogMessage::UpdateVolumeMetadata(spec) => {
                match catalog.update_volume_metadata(spec).await {
                    Ok(()) => CatalogMessage::Ok,
                    Err(e) => CatalogMessage::Error(e),
                }
            }
            CatalogMessage::QueryVolume(filter) => match catalog.query_volume(filter).await {
                Ok(result) => CatalogMessage::Volumes(result),
                Err(e) => CatalogMessage::Error(e),
            },
            CatalogMessage::QueryAllVolumes { filter, selection } => {
                match catalog.query_all_volumes(filter, selection).await {
                    Ok(result) => CatalogMessage::Volumes(result),
                    Err(e) => CatalogMessage::Error(e),
                }
            }

            // --- Response variants should never arrive as requests ----------
            other => {
                warn!(msg = %other, "unexpected message variant received as request");
                CatalogMessage::Error(SyncError::InvalidArgument(format!(
                    "unexpected message: {other}"
                )))
            }
        }
    }

    /// Return a reference to the underlying QUIC endpoint, useful for
    /// obtaining the local address or shutting down.
    pub fn endpoint(&self) -> &quinn::Endpoint {
        &self.endpoint
    }
}
