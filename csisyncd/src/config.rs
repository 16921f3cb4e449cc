//! csisyncd daemon configuration.
//!
//! Loaded from an optional YAML file, then overridden by environment
//! variables (see [`SyncConfig::apply_env`]) and finally by CLI flags.
//!
//! ```yaml
//! sync:
//!   cluster_id: prod-east
//!   full_sync_interval_minutes: 15
//! catalog:
//!   address: 10.0.0.12:7443
//!   server_name: catalog.internal
//!   ca_cert: /etc/csisyncd/ca.pem
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use libcsisync::SyncConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub sync: SyncConfig,
    pub catalog: CatalogEndpoint,
}

/// Where the remote volume catalog listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogEndpoint {
    pub address: String,
    /// TLS server name; must match a SAN of the catalog certificate.
    pub server_name: String,
    /// PEM bundle of the CA that signed the catalog certificate.
    pub ca_cert: Option<PathBuf>,
}

impl Default for CatalogEndpoint {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:7443".into(),
            server_name: "localhost".into(),
            ca_cert: None,
        }
    }
}

impl DaemonConfig {
    /// Read `path` if given, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                serde_yaml::from_str::<Self>(&raw)
                    .with_context(|| format!("failed to parse config file {}", path.display()))?
            }
            None => Self::default(),
        };
        Ok(Self {
            sync: config.sync.apply_env(),
            ..config
        })
    }
}
