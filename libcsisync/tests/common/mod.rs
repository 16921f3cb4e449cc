#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Once};

use libcsisync::backend::memory::{MemoryCatalog, MemoryCluster};
use libcsisync::{FullSync, SyncConfig, types::*};
use tracing_subscriber::EnvFilter;

pub const DRIVER: &str = "csi.test.io";
pub const CLUSTER_ID: &str = "it-cluster";
pub const NAMESPACE: &str = "default";

pub fn init_logger() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

pub fn config() -> SyncConfig {
    SyncConfig {
        cluster_id: CLUSTER_ID.into(),
        driver_name: DRIVER.into(),
        ..Default::default()
    }
}

pub fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect::<HashMap<_, _>>()
}

/// A volume of our driver with no claim reference.
pub fn volume(name: &str, phase: VolumePhase) -> OrchestratorVolume {
    OrchestratorVolume {
        name: name.into(),
        volume_handle: format!("fcd-{name}"),
        driver: DRIVER.into(),
        phase,
        capacity_bytes: 1 << 30,
        ..Default::default()
    }
}

/// A bound volume together with its claim.
pub fn bound_pair(name: &str, claim_name: &str) -> (OrchestratorVolume, OrchestratorClaim) {
    let mut volume = volume(name, VolumePhase::Bound);
    volume.claim_ref = Some(ClaimRef {
        namespace: NAMESPACE.into(),
        name: claim_name.into(),
    });
    volume.storage_class = "standard".into();
    let claim = OrchestratorClaim {
        name: claim_name.into(),
        namespace: NAMESPACE.into(),
        volume_name: Some(name.into()),
        phase: ClaimPhase::Bound,
        ..Default::default()
    };
    (volume, claim)
}

pub fn running_pod(name: &str, claim_name: &str) -> OrchestratorPod {
    OrchestratorPod {
        name: name.into(),
        namespace: NAMESPACE.into(),
        phase: PodPhase::Running,
        claim_names: vec![claim_name.into()],
    }
}

pub struct Harness {
    pub catalog: Arc<MemoryCatalog>,
    pub cluster: Arc<MemoryCluster>,
    pub sync: FullSync,
}

impl Harness {
    pub fn new() -> Self {
        init_logger();
        let catalog = Arc::new(MemoryCatalog::new());
        let cluster = Arc::new(MemoryCluster::new());
        let sync = FullSync::new(catalog.clone(), cluster.clone(), config());
        Self {
            catalog,
            cluster,
            sync,
        }
    }

    /// Metadata the catalog currently holds for `volume_id`.
    pub async fn stored(&self, volume_id: &str) -> Vec<EntityMetadata> {
        self.catalog
            .record(volume_id)
            .await
            .map(|r| r.metadata)
            .unwrap_or_default()
    }
}
