//! Incremental handlers for orchestrator watch events.
//!
//! Every handler pushes the one change it observed straight to the catalog.
//! They are best effort: a failed push is reported to the caller and left
//! for the next full sync to repair.  Handlers never touch the deletion
//! debounce window and never delete a catalog volume on their own except
//! when the orchestrator volume itself is deleted.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::catalog::VolumeCatalog;
use crate::cluster::{ClusterEvent, ClusterState};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::metadata::{claim_entry, pod_entry, volume_entry};
use crate::types::*;

const BYTES_PER_MB: u64 = 1024 * 1024;

pub struct EventHandlers {
    catalog: Arc<dyn VolumeCatalog>,
    cluster: Arc<dyn ClusterState>,
    config: SyncConfig,
}

impl EventHandlers {
    pub fn new(
        catalog: Arc<dyn VolumeCatalog>,
        cluster: Arc<dyn ClusterState>,
        config: SyncConfig,
    ) -> Self {
        Self {
            catalog,
            cluster,
            config,
        }
    }

    /// Route one event to its handler.
    #[instrument(skip_all, fields(event = %event.describe()))]
    pub async fn handle(&self, event: ClusterEvent) -> Result<(), SyncError> {
        match event {
            ClusterEvent::VolumeAdded(volume) => self.volume_updated(None, &volume).await,
            ClusterEvent::VolumeUpdated { old, new } => self.volume_updated(Some(&old), &new).await,
            ClusterEvent::VolumeDeleted(volume) => self.volume_deleted(&volume).await,
            // A new claim is not bound yet; binding shows up as an update.
            ClusterEvent::ClaimAdded(_) => Ok(()),
            ClusterEvent::ClaimUpdated { old, new } => self.claim_updated(&old, &new).await,
            ClusterEvent::ClaimDeleted(claim) => self.claim_deleted(&claim).await,
            ClusterEvent::PodAdded(pod) => self.pod_updated(None, &pod).await,
            ClusterEvent::PodUpdated { old, new } => self.pod_updated(Some(&old), &new).await,
            ClusterEvent::PodDeleted(pod) => self.pod_deleted(&pod).await,
        }
    }

    fn owns(&self, volume: &OrchestratorVolume) -> bool {
        volume.driver == self.config.driver_name
    }

    /// Volume added or updated.
    ///
    /// Volumes that were `Available` or that come from a storage class already
    /// exist in the catalog and get an update.  Anything else is a statically
    /// provisioned volume appearing for the first time and gets registered.
    pub async fn volume_updated(
        &self,
        old: Option<&OrchestratorVolume>,
        new: &OrchestratorVolume,
    ) -> Result<(), SyncError> {
        if !self.owns(new) {
            debug!(volume = %new.name, driver = %new.driver, "not our volume, skipping");
            return Ok(());
        }
        if matches!(new.phase, VolumePhase::Pending | VolumePhase::Failed) {
            debug!(volume = %new.name, phase = ?new.phase, "volume not settled, skipping");
            return Ok(());
        }
        let was_available = old.is_some_and(|o| o.phase == VolumePhase::Available);
        if was_available && old.is_some_and(|o| o.labels == new.labels) {
            debug!(volume = %new.name, "labels unchanged, skipping");
            return Ok(());
        }

        let metadata = self.volume_metadata(new).await;
        if was_available || !new.storage_class.is_empty() {
            return self.push(&new.volume_handle, metadata).await;
        }

        let spec = CreateSpec {
            name: new.name.clone(),
            volume_type: self.config.volume_type.clone(),
            backing: BackingDetails {
                capacity_mb: new.capacity_bytes / BYTES_PER_MB,
                backing_disk_id: Some(new.volume_handle.clone()),
            },
            cluster: self.config.container_cluster(),
            metadata: metadata.clone(),
        };
        match self.catalog.create_volume(spec).await {
            Ok(volume_id) => {
                info!(%volume_id, volume = %new.name, "registered statically provisioned volume");
                Ok(())
            }
            Err(SyncError::VolumeAlreadyExists(_)) => {
                debug!(volume = %new.name, "volume already registered, updating instead");
                self.push(&new.volume_handle, metadata).await
            }
            Err(e) => Err(e),
        }
    }

    /// Volume deleted from the orchestrator.
    pub async fn volume_deleted(&self, volume: &OrchestratorVolume) -> Result<(), SyncError> {
        if !self.owns(volume) {
            debug!(volume = %volume.name, "not our volume, skipping");
            return Ok(());
        }
        let delete_disk = delete_disk(volume);
        match self
            .catalog
            .delete_volume(&volume.volume_handle, delete_disk)
            .await
        {
            Ok(()) => {
                info!(
                    volume_id = %volume.volume_handle,
                    delete_disk,
                    "volume deleted from catalog",
                );
                Ok(())
            }
            Err(SyncError::VolumeNotFound(_)) => {
                debug!(volume_id = %volume.volume_handle, "volume already gone from catalog");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn claim_updated(
        &self,
        old: &OrchestratorClaim,
        new: &OrchestratorClaim,
    ) -> Result<(), SyncError> {
        if new.phase != ClaimPhase::Bound {
            return Ok(());
        }
        if old.phase == ClaimPhase::Bound && old.labels == new.labels {
            debug!(claim = %new.key(), "labels unchanged, skipping");
            return Ok(());
        }
        let Some(volume) = self.bound_volume(new).await? else {
            return Ok(());
        };
        self.push(
            &volume.volume_handle,
            vec![volume_entry(&volume), claim_entry(new, false)],
        )
        .await
    }

    pub async fn claim_deleted(&self, claim: &OrchestratorClaim) -> Result<(), SyncError> {
        let Some(volume) = self.bound_volume(claim).await? else {
            return Ok(());
        };
        self.push(
            &volume.volume_handle,
            vec![volume_entry(&volume), claim_entry(claim, true)],
        )
        .await
    }

    /// Record a pod entering `Running`, or tombstone one leaving it.
    pub async fn pod_updated(
        &self,
        old: Option<&OrchestratorPod>,
        new: &OrchestratorPod,
    ) -> Result<(), SyncError> {
        let was_running = old.is_some_and(|o| o.phase == PodPhase::Running);
        let is_running = new.phase == PodPhase::Running;
        match (was_running, is_running) {
            (false, true) => self.push_pod(new, false).await,
            (true, false) => self.push_pod(new, true).await,
            _ => Ok(()),
        }
    }

    pub async fn pod_deleted(&self, pod: &OrchestratorPod) -> Result<(), SyncError> {
        self.push_pod(pod, true).await
    }

    /// Push PV + PVC + POD entries for every claim `pod` mounts that is bound
    /// to one of our volumes. Claims are handled independently; the first
    /// failure is returned after all of them were tried.
    async fn push_pod(&self, pod: &OrchestratorPod, delete_marker: bool) -> Result<(), SyncError> {
        let mut first_error = None;
        for claim_name in &pod.claim_names {
            let result = self.push_pod_claim(pod, claim_name, delete_marker).await;
            if let Err(e) = result {
                warn!(
                    pod = %pod.name,
                    claim = %claim_name,
                    error = %e,
                    "failed to push pod metadata",
                );
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn push_pod_claim(
        &self,
        pod: &OrchestratorPod,
        claim_name: &str,
        delete_marker: bool,
    ) -> Result<(), SyncError> {
        let claim = match self.cluster.get_claim(&pod.namespace, claim_name).await {
            Ok(claim) => claim,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        let Some(volume) = self.bound_volume(&claim).await? else {
            return Ok(());
        };
        self.push(
            &volume.volume_handle,
            vec![
                volume_entry(&volume),
                claim_entry(&claim, false),
                pod_entry(&pod.name, &pod.namespace, delete_marker),
            ],
        )
        .await
    }

    /// The volume `claim` is bound to, if it is one of ours and settled.
    async fn bound_volume(
        &self,
        claim: &OrchestratorClaim,
    ) -> Result<Option<OrchestratorVolume>, SyncError> {
        let Some(volume_name) = &claim.volume_name else {
            return Ok(None);
        };
        let volume = match self.cluster.get_volume(volume_name).await {
            Ok(volume) => volume,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        if !self.owns(&volume) || !volume.phase.is_reconcilable() {
            return Ok(None);
        }
        Ok(Some(volume))
    }

    /// PV entry, plus claim and running pod when they can be resolved.
    async fn volume_metadata(&self, volume: &OrchestratorVolume) -> Vec<EntityMetadata> {
        let mut metadata = vec![volume_entry(volume)];
        let Some(claim_ref) = volume
            .claim_ref
            .as_ref()
            .filter(|_| volume.phase == VolumePhase::Bound)
        else {
            return metadata;
        };
        let claim = match self.cluster.get_claim(&claim_ref.namespace, &claim_ref.name).await {
            Ok(claim) => claim,
            Err(e) => {
                debug!(claim = %claim_ref.key(), error = %e, "claim not resolvable");
                return metadata;
            }
        };
        metadata.push(claim_entry(&claim, false));
        if let Ok(pods) = self.cluster.list_pods(&claim.namespace, PodPhase::Running).await
            && let Some(pod) = pods.iter().find(|p| p.mounts_claim(&claim.name))
        {
            metadata.push(pod_entry(&pod.name, &pod.namespace, false));
        }
        metadata
    }

    async fn push(&self, volume_id: &str, metadata: Vec<EntityMetadata>) -> Result<(), SyncError> {
        let spec = UpdateSpec {
            volume_id: volume_id.to_owned(),
            cluster: self.config.container_cluster(),
            metadata,
        };
        self.catalog.update_volume_metadata(spec).await?;
        info!(%volume_id, "volume metadata updated");
        Ok(())
    }
}

/// Whether deleting the orchestrator volume also destroys the disk.
///
/// Claimed volumes with a `Delete` policy are destroyed through the
/// provisioner's delete path; unclaimed volumes were never consumed.
pub fn delete_disk(volume: &OrchestratorVolume) -> bool {
    volume.claim_ref.is_some() && volume.reclaim_policy != ReclaimPolicy::Delete
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{CatalogCall, MemoryCatalog, MemoryCluster};
    use std::collections::HashMap;

    const DRIVER: &str = "csi.test";

    fn config() -> SyncConfig {
        SyncConfig {
            cluster_id: "c1".into(),
            driver_name: DRIVER.into(),
            ..Default::default()
        }
    }

    fn setup() -> (Arc<MemoryCatalog>, Arc<MemoryCluster>, EventHandlers) {
        let catalog = Arc::new(MemoryCatalog::new());
        let cluster = Arc::new(MemoryCluster::new());
        let handlers = EventHandlers::new(catalog.clone(), cluster.clone(), config());
        (catalog, cluster, handlers)
    }

    fn volume(phase: VolumePhase, storage_class: &str) -> OrchestratorVolume {
        OrchestratorVolume {
            name: "pv-1".into(),
            volume_handle: "fcd-1".into(),
            driver: DRIVER.into(),
            phase,
            storage_class: storage_class.into(),
            ..Default::default()
        }
    }

    fn bound_claim() -> OrchestratorClaim {
        OrchestratorClaim {
            name: "data".into(),
            namespace: "default".into(),
            labels: HashMap::from([("app".into(), "web".into())]),
            volume_name: Some("pv-1".into()),
            phase: ClaimPhase::Bound,
        }
    }

    fn pod(phase: PodPhase) -> OrchestratorPod {
        OrchestratorPod {
            name: "web-0".into(),
            namespace: "default".into(),
            phase,
            claim_names: vec!["data".into()],
        }
    }

    #[test]
    fn delete_disk_flag() {
        let mut pv = volume(VolumePhase::Released, "gold");
        assert!(!delete_disk(&pv));

        pv.claim_ref = Some(ClaimRef {
            namespace: "default".into(),
            name: "data".into(),
        });
        assert!(!delete_disk(&pv));

        pv.reclaim_policy = ReclaimPolicy::Retain;
        assert!(delete_disk(&pv));
    }

    #[tokio::test]
    async fn static_volume_is_registered() {
        let (catalog, _, handlers) = setup();
        let old = volume(VolumePhase::Pending, "");
        let new = volume(VolumePhase::Available, "");
        handlers.volume_updated(Some(&old), &new).await.unwrap();

        let calls = catalog.calls().await;
        assert!(matches!(calls.as_slice(), [CatalogCall::Create(spec)] if spec.name == "pv-1"));
    }

    #[tokio::test]
    async fn provisioned_volume_is_updated() {
        let (catalog, _, handlers) = setup();
        let err = handlers
            .volume_updated(None, &volume(VolumePhase::Bound, "gold"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::VolumeNotFound(_)));

        catalog
            .create_volume(CreateSpec {
                name: "pv-1".into(),
                volume_type: "BLOCK".into(),
                backing: BackingDetails {
                    capacity_mb: 1,
                    backing_disk_id: Some("fcd-1".into()),
                },
                cluster: config().container_cluster(),
                metadata: vec![],
            })
            .await
            .unwrap();
        handlers
            .volume_updated(None, &volume(VolumePhase::Bound, "gold"))
            .await
            .unwrap();
        let calls = catalog.calls().await;
        assert!(matches!(calls.as_slice(), [CatalogCall::Create(_), CatalogCall::Update(_)]));
    }

    #[tokio::test]
    async fn unchanged_available_volume_is_skipped() {
        let (catalog, _, handlers) = setup();
        let old = volume(VolumePhase::Available, "gold");
        let new = volume(VolumePhase::Bound, "gold");
        handlers.volume_updated(Some(&old), &new).await.unwrap();
        assert!(catalog.calls().await.is_empty());
    }

    #[tokio::test]
    async fn foreign_and_pending_volumes_are_ignored() {
        let (catalog, _, handlers) = setup();
        let mut foreign = volume(VolumePhase::Bound, "gold");
        foreign.driver = "other.csi".into();
        handlers.volume_updated(None, &foreign).await.unwrap();
        handlers.volume_deleted(&foreign).await.unwrap();
        handlers
            .volume_updated(None, &volume(VolumePhase::Failed, "gold"))
            .await
            .unwrap();
        assert!(catalog.calls().await.is_empty());
    }

    #[tokio::test]
    async fn static_volume_registered_twice_falls_back_to_update() {
        let (catalog, _, handlers) = setup();
        let new = volume(VolumePhase::Available, "");
        handlers.volume_updated(None, &new).await.unwrap();
        handlers.volume_updated(None, &new).await.unwrap();
        let calls = catalog.calls().await;
        assert!(matches!(calls.as_slice(), [CatalogCall::Create(_), CatalogCall::Update(_)]));
    }

    #[tokio::test]
    async fn volume_delete_passes_flag() {
        let (catalog, _, handlers) = setup();
        handlers
            .volume_updated(None, &volume(VolumePhase::Available, ""))
            .await
            .unwrap();
        let mut pv = volume(VolumePhase::Released, "");
        pv.claim_ref = Some(ClaimRef {
            namespace: "default".into(),
            name: "data".into(),
        });
        pv.reclaim_policy = ReclaimPolicy::Retain;
        handlers.volume_deleted(&pv).await.unwrap();

        let calls = catalog.calls().await;
        assert!(matches!(
            calls.last(),
            Some(CatalogCall::Delete { volume_id, delete_disk: true }) if volume_id == "fcd-1"
        ));

        // Deleting again is not an error.
        handlers.volume_deleted(&pv).await.unwrap();
    }

    #[tokio::test]
    async fn pod_lifecycle_pushes_and_tombstones() {
        let (catalog, cluster, handlers) = setup();
        let pv = volume(VolumePhase::Bound, "gold");
        cluster.put_volume(pv.clone()).await;
        cluster.put_claim(bound_claim()).await;
        handlers
            .volume_updated(None, &volume(VolumePhase::Available, ""))
            .await
            .unwrap();

        handlers
            .pod_updated(Some(&pod(PodPhase::Pending)), &pod(PodPhase::Running))
            .await
            .unwrap();
        let stored = catalog.record("fcd-1").await.unwrap();
        assert_eq!(stored.metadata.len(), 3);

        handlers.pod_deleted(&pod(PodPhase::Running)).await.unwrap();
        let stored = catalog.record("fcd-1").await.unwrap();
        assert_eq!(stored.metadata.len(), 2);
        assert!(stored.metadata.iter().all(|e| e.entity_type != EntityType::Pod));
    }

    #[tokio::test]
    async fn claim_label_change_is_pushed() {
        let (catalog, cluster, handlers) = setup();
        cluster.put_volume(volume(VolumePhase::Bound, "gold")).await;
        handlers
            .volume_updated(None, &volume(VolumePhase::Available, ""))
            .await
            .unwrap();

        let old = bound_claim();
        handlers.claim_updated(&old, &old).await.unwrap();
        assert_eq!(catalog.calls().await.len(), 1);

        let mut new = bound_claim();
        new.labels.insert("tier".into(), "gold".into());
        handlers.claim_updated(&old, &new).await.unwrap();
        let stored = catalog.record("fcd-1").await.unwrap();
        let pvc = stored
            .metadata
            .iter()
            .find(|e| e.entity_type == EntityType::PersistentVolumeClaim)
            .unwrap();
        assert_eq!(pvc.labels.as_ref().unwrap().get("tier").map(String::as_str), Some("gold"));

        handlers.claim_deleted(&new).await.unwrap();
        let stored = catalog.record("fcd-1").await.unwrap();
        assert_eq!(stored.metadata.len(), 1);
    }
}
