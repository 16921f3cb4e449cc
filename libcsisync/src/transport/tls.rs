//! `rustls` configuration for the catalog transport.
//!
//! Both ends pin the `ring` crypto provider so the configuration does not
//! depend on a process-wide default being installed.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::SyncError;

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Client configuration trusting exactly `roots`.
pub fn client_config(
    roots: Vec<CertificateDer<'static>>,
) -> Result<rustls::ClientConfig, SyncError> {
    let mut store = rustls::RootCertStore::empty();
    for cert in roots {
        store.add(cert).map_err(SyncError::transport)?;
    }
    Ok(rustls::ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(SyncError::transport)?
        .with_root_certificates(store)
        .with_no_client_auth())
}

/// Server configuration presenting `chain` signed with `key`.
pub fn server_config(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<rustls::ServerConfig, SyncError> {
    rustls::ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(SyncError::transport)?
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(SyncError::transport)
}

/// Load every certificate of a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, SyncError> {
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(SyncError::Config(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(certs)
}

/// Load the first private key of a PEM file.
pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, SyncError> {
    PrivateKeyDer::from_pem_file(path)
        .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))
}
