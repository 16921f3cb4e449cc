//! Metadata syncer configuration.
//!
//! Values come from the daemon's config file and can be overridden from the
//! environment:
//! - `CSI_CLUSTER_ID`: cluster identity stamped on every catalog request.
//! - `CSI_DRIVER_NAME`: driver whose volumes are synced.
//! - `FULL_SYNC_INTERVAL_MINUTES`: full-sync period, a positive integer.
//!   Defaults to `30`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::SyncError;
use crate::types::ContainerCluster;

pub const DEFAULT_DRIVER_NAME: &str = "csi.vsphere.vmware.com";
pub const DEFAULT_FULL_SYNC_INTERVAL_MINUTES: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    pub cluster_id: String,
    pub cluster_type: String,
    pub cluster_user: String,
    pub driver_name: String,
    /// Volume-type constant sent with every create request.
    pub volume_type: String,
    pub full_sync_interval_minutes: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cluster_id: "default-cluster".to_owned(),
            cluster_type: "KUBERNETES".to_owned(),
            cluster_user: String::new(),
            driver_name: DEFAULT_DRIVER_NAME.to_owned(),
            volume_type: "BLOCK".to_owned(),
            full_sync_interval_minutes: DEFAULT_FULL_SYNC_INTERVAL_MINUTES,
        }
    }
}

impl SyncConfig {
    /// Apply environment overrides on top of the current values.
    pub fn apply_env(mut self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok());
        self
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup("CSI_CLUSTER_ID").filter(|v| !v.is_empty()) {
            self.cluster_id = id;
        }
        if let Some(driver) = lookup("CSI_DRIVER_NAME").filter(|v| !v.is_empty()) {
            self.driver_name = driver;
        }
        if let Some(raw) = lookup("FULL_SYNC_INTERVAL_MINUTES") {
            match raw.trim().parse::<u64>() {
                Ok(minutes) if minutes > 0 => self.full_sync_interval_minutes = minutes,
                _ => warn!(value = %raw, "ignoring invalid FULL_SYNC_INTERVAL_MINUTES"),
            }
        }
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.cluster_id.is_empty() {
            return Err(SyncError::Config("cluster_id must not be empty".into()));
        }
        if self.driver_name.is_empty() {
            return Err(SyncError::Config("driver_name must not be empty".into()));
        }
        if self.full_sync_interval_minutes == 0 {
            return Err(SyncError::Config(
                "full_sync_interval_minutes must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn full_sync_interval(&self) -> Duration {
        Duration::from_secs(self.full_sync_interval_minutes * 60)
    }

    /// Container-cluster block attached to every create and update spec.
    pub fn container_cluster(&self) -> ContainerCluster {
        ContainerCluster {
            cluster_type: self.cluster_type.clone(),
            cluster_id: self.cluster_id.clone(),
            user: self.cluster_user.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn overrides(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = SyncConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.full_sync_interval(), Duration::from_secs(30 * 60));
    }

    #[test]
    fn env_overrides_apply() {
        let env = overrides(&[
            ("CSI_CLUSTER_ID", "prod-east"),
            ("FULL_SYNC_INTERVAL_MINUTES", "5"),
        ]);
        let mut cfg = SyncConfig::default();
        cfg.apply_overrides(|k| env.get(k).cloned());
        assert_eq!(cfg.cluster_id, "prod-east");
        assert_eq!(cfg.full_sync_interval_minutes, 5);
        assert_eq!(cfg.driver_name, DEFAULT_DRIVER_NAME);
    }

    #[test]
    fn bad_interval_is_ignored() {
        let env = overrides(&[("FULL_SYNC_INTERVAL_MINUTES", "0")]);
        let mut cfg = SyncConfig::default();
        cfg.apply_overrides(|k| env.get(k).cloned());
        assert_eq!(cfg.full_sync_interval_minutes, DEFAULT_FULL_SYNC_INTERVAL_MINUTES);

        let env = overrides(&[("FULL_SYNC_INTERVAL_MINUTES", "soon")]);
        cfg.apply_overrides(|k| env.get(k).cloned());
        assert_eq!(cfg.full_sync_interval_minutes, DEFAULT_FULL_SYNC_INTERVAL_MINUTES);
    }

    #[test]
    fn validate_rejects_empty_cluster() {
        let cfg = SyncConfig {
            cluster_id: String::new(),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn partial_json_uses_defaults() {
        let cfg: SyncConfig =
            serde_json::from_str(r#"{"cluster_id":"c1"}"#).expect("deserialize");
        assert_eq!(cfg.cluster_id, "c1");
        assert_eq!(cfg.volume_type, "BLOCK");
    }
}
