//! In-memory catalog and cluster.
//!
//! [`MemoryCatalog`] implements [`VolumeCatalog`] and [`MemoryCluster`]
//! implements [`ClusterState`] on top of concurrent maps.  They back the
//! test-suite and the daemon's development catalog server.
//!
//! # Metadata merge rules
//!
//! ```text
//! entry without delete marker  -> replaces the stored entry of the same type
//! entry with delete marker     -> removes the stored entry with the same
//!                                 type, name and namespace
//! labels == None               -> keeps the stored labels of the same entity
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, instrument};

use crate::catalog::VolumeCatalog;
use crate::cluster::{ClusterEvent, ClusterState};
use crate::error::SyncError;
use crate::types::*;

/// A successful mutating call, as seen by the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogCall {
    Create(CreateSpec),
    Update(UpdateSpec),
    Delete { volume_id: String, delete_disk: bool },
}

/// Catalog held entirely in memory.
///
/// Volumes registered with a backing disk id keep that id as their catalog
/// id; anything else gets a fresh `fcd-<uuid>` id.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    records: DashMap<String, VolumeRecord>,
    calls: Mutex<Vec<CatalogCall>>,
    /// Volume ids whose mutating calls fail.
    failing: DashSet<String>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record directly, bypassing call recording.
    pub async fn insert_record(&self, record: VolumeRecord) {
        self.records.insert(record.id.clone(), record);
    }

    pub async fn record(&self, volume_id: &str) -> Option<VolumeRecord> {
        self.records.get(volume_id).map(|r| r.clone())
    }

    /// Successful mutating calls, oldest first.
    pub async fn calls(&self) -> Vec<CatalogCall> {
        self.calls.lock().await.clone()
    }

    pub async fn clear_calls(&self) {
        self.calls.lock().await.clear();
    }

    /// Make every mutating call on `volume_id` fail until healed.
    pub fn fail_volume(&self, volume_id: &str) {
        self.failing.insert(volume_id.to_owned());
    }

    pub fn heal_volume(&self, volume_id: &str) {
        self.failing.remove(volume_id);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn check_failing(&self, volume_id: &str) -> Result<(), SyncError> {
        if self.failing.contains(volume_id) {
            return Err(SyncError::Catalog(format!(
                "injected failure for volume {volume_id}"
            )));
        }
        Ok(())
    }

    fn matching(&self, filter: &QueryFilter) -> Vec<VolumeRecord> {
        self.records
            .iter()
            .filter(|r| filter.volume_ids.is_empty() || filter.volume_ids.contains(&r.id))
            .filter(|r| filter.cluster_ids.is_empty() || filter.cluster_ids.contains(&r.cluster_id))
            .map(|r| r.value().clone())
            .collect()
    }

    async fn record_call(&self, call: CatalogCall) {
        self.calls.lock().await.push(call);
    }
}

/// Apply `incoming` entries to `stored` following the module merge rules.
pub fn merge_metadata(stored: &mut Vec<EntityMetadata>, incoming: Vec<EntityMetadata>) {
    for entry in incoming {
        if entry.delete_marker {
            stored.retain(|e| {
                !(e.entity_type == entry.entity_type
                    && e.entity_name == entry.entity_name
                    && e.namespace == entry.namespace)
            });
            continue;
        }
        match stored.iter_mut().find(|e| e.entity_type == entry.entity_type) {
            Some(existing) => {
                let same_entity = existing.entity_name == entry.entity_name
                    && existing.namespace == entry.namespace;
                let labels = match entry.labels {
                    None if same_entity => existing.labels.take(),
                    labels => labels,
                };
                *existing = EntityMetadata { labels, ..entry };
            }
            None => stored.push(entry),
        }
    }
}

#[async_trait]
impl VolumeCatalog for MemoryCatalog {
    #[instrument(skip_all, fields(name = %spec.name))]
    async fn create_volume(&self, spec: CreateSpec) -> Result<String, SyncError> {
        let volume_id = spec
            .backing
            .backing_disk_id
            .clone()
            .unwrap_or_else(|| format!("fcd-{}", uuid::Uuid::new_v4()));
        self.check_failing(&volume_id)?;

        let mut metadata = Vec::new();
        merge_metadata(&mut metadata, spec.metadata.clone());
        match self.records.entry(volume_id.clone()) {
            Entry::Occupied(_) => return Err(SyncError::VolumeAlreadyExists(volume_id)),
            Entry::Vacant(slot) => {
                slot.insert(VolumeRecord {
                    id: volume_id.clone(),
                    name: spec.name.clone(),
                    cluster_id: spec.cluster.cluster_id.clone(),
                    metadata,
                });
            }
        }
        self.record_call(CatalogCall::Create(spec)).await;
        info!(%volume_id, "volume registered");
        Ok(volume_id)
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, volume_id: &str, delete_disk: bool) -> Result<(), SyncError> {
        self.check_failing(volume_id)?;
        if self.records.remove(volume_id).is_none() {
            return Err(SyncError::VolumeNotFound(volume_id.to_owned()));
        }
        self.record_call(CatalogCall::Delete {
            volume_id: volume_id.to_owned(),
            delete_disk,
        })
        .await;
        info!(%volume_id, delete_disk, "volume removed");
        Ok(())
    }

    #[instrument(skip_all, fields(volume_id = %spec.volume_id))]
    async fn update_volume_metadata(&self, spec: UpdateSpec) -> Result<(), SyncError> {
        self.check_failing(&spec.volume_id)?;
        {
            let Some(mut record) = self.records.get_mut(&spec.volume_id) else {
                return Err(SyncError::VolumeNotFound(spec.volume_id.clone()));
            };
            merge_metadata(&mut record.metadata, spec.metadata.clone());
        }
        self.record_call(CatalogCall::Update(spec)).await;
        debug!("volume metadata merged");
        Ok(())
    }

    async fn query_volume(&self, filter: QueryFilter) -> Result<QueryResult, SyncError> {
        Ok(QueryResult {
            volumes: self.matching(&filter),
        })
    }

    async fn query_all_volumes(
        &self,
        filter: QueryFilter,
        selection: QuerySelection,
    ) -> Result<QueryResult, SyncError> {
        let mut volumes = self.matching(&filter);
        if !selection.include_metadata {
            volumes.iter_mut().for_each(|v| v.metadata.clear());
        }
        Ok(QueryResult { volumes })
    }
}

/// Orchestrator state held in memory. Every mutation is broadcast to the
/// current subscribers as a [`ClusterEvent`].
#[derive(Debug, Default)]
pub struct MemoryCluster {
    volumes: DashMap<String, OrchestratorVolume>,
    /// Keyed by `namespace/name`.
    claims: DashMap<String, OrchestratorClaim>,
    /// Keyed by `namespace/name`.
    pods: DashMap<String, OrchestratorPod>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ClusterEvent>>>,
    fail_listing: AtomicBool,
    fail_claims: AtomicBool,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `list_volumes` fail while `fail` is set.
    pub fn fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    /// Make `get_claim` fail with a non-"not found" error while `fail` is set.
    pub fn fail_claims(&self, fail: bool) {
        self.fail_claims.store(fail, Ordering::SeqCst);
    }

    pub async fn put_volume(&self, volume: OrchestratorVolume) {
        let event = match self.volumes.insert(volume.name.clone(), volume.clone()) {
            Some(old) => ClusterEvent::VolumeUpdated { old, new: volume },
            None => ClusterEvent::VolumeAdded(volume),
        };
        self.emit(event).await;
    }

    pub async fn remove_volume(&self, name: &str) {
        if let Some((_, volume)) = self.volumes.remove(name) {
            self.emit(ClusterEvent::VolumeDeleted(volume)).await;
        }
    }

    pub async fn put_claim(&self, claim: OrchestratorClaim) {
        let event = match self.claims.insert(claim.key(), claim.clone()) {
            Some(old) => ClusterEvent::ClaimUpdated { old, new: claim },
            None => ClusterEvent::ClaimAdded(claim),
        };
        self.emit(event).await;
    }

    pub async fn remove_claim(&self, namespace: &str, name: &str) {
        if let Some((_, claim)) = self.claims.remove(&claim_key(namespace, name)) {
            self.emit(ClusterEvent::ClaimDeleted(claim)).await;
        }
    }

    pub async fn put_pod(&self, pod: OrchestratorPod) {
        let key = claim_key(&pod.namespace, &pod.name);
        let event = match self.pods.insert(key, pod.clone()) {
            Some(old) => ClusterEvent::PodUpdated { old, new: pod },
            None => ClusterEvent::PodAdded(pod),
        };
        self.emit(event).await;
    }

    pub async fn remove_pod(&self, namespace: &str, name: &str) {
        if let Some((_, pod)) = self.pods.remove(&claim_key(namespace, name)) {
            self.emit(ClusterEvent::PodDeleted(pod)).await;
        }
    }

    async fn emit(&self, event: ClusterEvent) {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[async_trait]
impl ClusterState for MemoryCluster {
    async fn list_volumes(&self) -> Result<Vec<OrchestratorVolume>, SyncError> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(SyncError::Cluster("injected list failure".into()));
        }
        Ok(self.volumes.iter().map(|v| v.value().clone()).collect())
    }

    async fn get_volume(&self, name: &str) -> Result<OrchestratorVolume, SyncError> {
        self.volumes
            .get(name)
            .map(|v| v.clone())
            .ok_or_else(|| SyncError::object_not_found("PersistentVolume", name))
    }

    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<OrchestratorClaim, SyncError> {
        if self.fail_claims.load(Ordering::SeqCst) {
            return Err(SyncError::Cluster("injected claim failure".into()));
        }
        let key = claim_key(namespace, name);
        self.claims
            .get(&key)
            .map(|c| c.clone())
            .ok_or_else(|| SyncError::object_not_found("PersistentVolumeClaim", key))
    }

    async fn list_pods(
        &self,
        namespace: &str,
        phase: PodPhase,
    ) -> Result<Vec<OrchestratorPod>, SyncError> {
        Ok(self
            .pods
            .iter()
            .filter(|p| p.namespace == namespace && p.phase == phase)
            .map(|p| p.value().clone())
            .collect())
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<ClusterEvent>, SyncError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().await.push(tx);
        Ok(rx)
    }
}
