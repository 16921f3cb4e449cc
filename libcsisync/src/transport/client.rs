//! QUIC client used by the syncer to reach a remote volume catalog.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quinn::crypto::rustls::QuicClientConfig;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::catalog::VolumeCatalog;
use crate::error::SyncError;
use crate::message::CatalogMessage;
use crate::transport::MAX_MESSAGE_BYTES;
use crate::types::*;

/// Ping interval on an otherwise idle connection.  Must stay below quinn's
/// default idle timeout of 30 s.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// A catalog client that sends [`CatalogMessage`] requests over a QUIC
/// connection and returns the server's response.
///
/// The connection is re-established on the next request once it has been
/// closed by either side.
pub struct CatalogClient {
    endpoint: quinn::Endpoint,
    addr: SocketAddr,
    server_name: String,
    connection: RwLock<quinn::Connection>,
}

impl CatalogClient {
    /// Establish a new QUIC connection to the catalog server at `addr`.
    ///
    /// * `addr`: socket address of the remote catalog server
    /// * `server_name`: TLS SNI name that must match a SAN in the server's
    ///   certificate
    /// * `tls_config`: client TLS configuration, see
    ///   [`tls::client_config`](crate::transport::tls::client_config)
    pub async fn connect(
        addr: SocketAddr,
        server_name: &str,
        tls_config: rustls::ClientConfig,
    ) -> Result<Self, SyncError> {
        let quic_client_config = QuicClientConfig::try_from(tls_config)
            .map_err(|e| SyncError::Transport(format!("invalid TLS config: {e}")))?;
        let mut client_config = quinn::ClientConfig::new(Arc::new(quic_client_config));
        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
        client_config.transport_config(Arc::new(transport));

        let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
        let mut endpoint = quinn::Endpoint::client(bind).map_err(SyncError::transport)?;
        endpoint.set_default_client_config(client_config);

        let connection = dial(&endpoint, addr, server_name).await?;
        debug!(%addr, %server_name, "catalog QUIC connection established");
        Ok(Self {
            endpoint,
            addr,
            server_name: server_name.to_owned(),
            connection: RwLock::new(connection),
        })
    }

    /// The current connection, re-dialled if it has been closed.
    async fn get_connection(&self) -> Result<quinn::Connection, SyncError> {
        let connection = self.connection.read().await.clone();
        if connection.close_reason().is_none() {
            return Ok(connection);
        }
        self.reconnect(&connection).await
    }

    /// Replace `stale` with a fresh connection.  A concurrent caller that
    /// already swapped it out wins and its connection is reused.
    async fn reconnect(&self, stale: &quinn::Connection) -> Result<quinn::Connection, SyncError> {
        let mut current = self.connection.write().await;
        if current.stable_id() != stale.stable_id() && current.close_reason().is_none() {
            return Ok(current.clone());
        }
        let connection = dial(&self.endpoint, self.addr, &self.server_name).await?;
        info!(addr = %self.addr, "catalog QUIC connection re-established");
        *current = connection.clone();
        Ok(connection)
    }

    /// Send a request and wait for the corresponding response.
    ///
    /// Each call opens a new bi-directional QUIC stream, writes the
    /// JSON-serialized request, finishes the send side, then reads the
    /// full response and deserializes it.  A stream that cannot be opened
    /// is retried once on a new connection.
    #[instrument(skip(self), fields(msg = %msg))]
    pub async fn request(&self, msg: &CatalogMessage) -> Result<CatalogMessage, SyncError> {
        let connection = self.get_connection().await?;
        let (mut send, mut recv) = match connection.open_bi().await {
            Ok(streams) => streams,
            Err(e) => {
                debug!(error = %e, "failed to open stream, reconnecting");
                let connection = self.reconnect(&connection).await?;
                connection.open_bi().await.map_err(SyncError::transport)?
            }
        };

        let payload = serde_json::to_vec(msg).map_err(SyncError::internal)?;
        send.write_all(&payload)
            .await
            .map_err(SyncError::transport)?;
        send.finish().map_err(SyncError::transport)?;

        let buf = recv
            .read_to_end(MAX_MESSAGE_BYTES)
            .await
            .map_err(SyncError::transport)?;

        let response: CatalogMessage =
            serde_json::from_slice(&buf).map_err(SyncError::transport)?;
        debug!(%response, "catalog response received");
        match response {
            CatalogMessage::Error(e) => Err(e),
            other => Ok(other),
        }
    }

    /// Close the current QUIC connection gracefully.  A later request
    /// opens a new one.
    pub async fn close(&self) {
        self.connection
            .read()
            .await
            .close(quinn::VarInt::from_u32(0), b"client shutdown");
    }
}

async fn dial(
    endpoint: &quinn::Endpoint,
    addr: SocketAddr,
    server_name: &str,
) -> Result<quinn::Connection, SyncError> {
    endpoint
        .connect(addr, server_name)
        .map_err(SyncError::transport)?
        .await
        .map_err(SyncError::transport)
}

fn unexpected(response: CatalogMessage) -> SyncError {
    SyncError::Transport(format!("unexpected response: {response}"))
}

#[async_trait]
impl VolumeCatalog for CatalogClient {
    async fn create_volume(&self, spec: CreateSpec) -> Result<String, SyncError> {
        match self.request(&CatalogMessage::CreateVolume(spec)).await? {
            CatalogMessage::VolumeCreated(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    async fn delete_volume(&self, volume_id: &str, delete_disk: bool) -> Result<(), SyncError> {
        let msg = CatalogMessage::DeleteVolume {
            volume_id: volume_id.to_owned(),
            delete_disk,
        };
        match self.request(&msg).await? {
            CatalogMessage::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn update_volume_metadata(&self, spec: UpdateSpec) -> Result<(), SyncError> {
        match self.request(&CatalogMessage::UpdateVolumeMetadata(spec)).await? {
            CatalogMessage::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn query_volume(&self, filter: QueryFilter) -> Result<QueryResult, SyncError> {
        match self.request(&CatalogMessage::QueryVolume(filter)).await? {
            CatalogMessage::Volumes(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    async fn query_all_volumes(
        &self,
        filter: QueryFilter,
        selection: QuerySelection,
    ) -> Result<QueryResult, SyncError> {
        let msg = CatalogMessage::QueryAllVolumes { filter, selection };
        match self.request(&msg).await? {
            CatalogMessage::Volumes(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }
}
