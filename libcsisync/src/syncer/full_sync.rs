//! Periodic full reconciliation between the orchestrator and the catalog.
//!
//! Each cycle snapshots both sides, classifies every volume, and then runs
//! the create, update and delete phases as three concurrent tasks.  Nothing
//! but the [`DeletionDebounce`] survives from one cycle to the next, so a
//! request that fails in one cycle is simply re-derived and retried in the
//! following one.
//!
//! ```text
//! Idle -> Snapshotting -> Classifying -> Executing -> Idle
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::catalog::VolumeCatalog;
use crate::cluster::ClusterState;
use crate::compare::{ChangeType, classify};
use crate::config::SyncConfig;
use crate::debounce::DeletionDebounce;
use crate::error::SyncError;
use crate::index::{ClusterIndex, build_index};
use crate::metadata::{build_metadata_list, tombstone};
use crate::types::*;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Outcome of one full-sync cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Individual requests that failed and will be retried next cycle.
    pub failed: usize,
    /// Volumes seen missing once and waiting for a second sighting.
    pub pending_deletion: usize,
}

/// Requests derived by the classify step.
#[derive(Debug, Default)]
pub(crate) struct SyncPlan {
    pub(crate) creates: Vec<CreateSpec>,
    pub(crate) updates: Vec<UpdateSpec>,
    pub(crate) deletes: Vec<String>,
}

#[derive(Debug, Default, Clone, Copy)]
struct PhaseOutcome {
    succeeded: usize,
    failed: usize,
}

/// Full-sync engine. One instance owns one debounce window.
pub struct FullSync {
    catalog: Arc<dyn VolumeCatalog>,
    cluster: Arc<dyn ClusterState>,
    config: SyncConfig,
    /// Held for the whole cycle, which also keeps cycles from overlapping.
    debounce: Mutex<DeletionDebounce>,
}

impl FullSync {
    pub fn new(
        catalog: Arc<dyn VolumeCatalog>,
        cluster: Arc<dyn ClusterState>,
        config: SyncConfig,
    ) -> Self {
        Self {
            catalog,
            cluster,
            config,
            debounce: Mutex::new(DeletionDebounce::new()),
        }
    }

    /// Whether `volume_id` has been seen missing once and awaits deletion.
    pub async fn is_pending_deletion(&self, volume_id: &str) -> bool {
        self.debounce.lock().await.contains(volume_id)
    }

    /// Run one complete cycle.
    ///
    /// Fails only when one of the two snapshots cannot be taken; individual
    /// request failures are logged and counted in the report.
    #[instrument(skip(self), fields(cluster_id = %self.config.cluster_id))]
    pub async fn run_cycle(&self) -> Result<SyncReport, SyncError> {
        let mut debounce = self.debounce.lock().await;
        info!("full sync started");

        let volumes = match self.snapshot_cluster().await {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "failed to list cluster volumes, aborting full sync");
                return Err(e);
            }
        };
        let catalog_volumes = match self
            .catalog
            .query_all_volumes(
                QueryFilter::by_cluster(self.config.cluster_id.clone()),
                QuerySelection::default(),
            )
            .await
        {
            Ok(result) => result.volumes,
            Err(e) => {
                error!(error = %e, "failed to query catalog volumes, aborting full sync");
                return Err(e);
            }
        };
        let index = build_index(&volumes, self.cluster.as_ref()).await;

        let plan = self
            .plan(&volumes, &catalog_volumes, &index, &mut debounce)
            .await;
        info!(
            cluster_volumes = volumes.len(),
            catalog_volumes = catalog_volumes.len(),
            creates = plan.creates.len(),
            updates = plan.updates.len(),
            deletes = plan.deletes.len(),
            "full sync classified volumes",
        );

        let create = tokio::spawn(create_phase(
            Arc::clone(&self.catalog),
            Arc::clone(&self.cluster),
            self.config.driver_name.clone(),
            plan.creates,
        ));
        let update = tokio::spawn(update_phase(Arc::clone(&self.catalog), plan.updates));
        let delete = tokio::spawn(delete_phase(Arc::clone(&self.catalog), plan.deletes));
        let (create, update, delete) = tokio::join!(create, update, delete);

        let create = phase_result("create", create);
        let update = phase_result("update", update);
        let delete = phase_result("delete", delete);

        let report = SyncReport {
            created: create.succeeded,
            updated: update.succeeded,
            deleted: delete.succeeded,
            failed: create.failed + update.failed + delete.failed,
            pending_deletion: debounce.len(),
        };
        info!(?report, "full sync finished");
        Ok(report)
    }

    /// Cluster volumes of this driver in a phase that can be reconciled.
    async fn snapshot_cluster(&self) -> Result<Vec<OrchestratorVolume>, SyncError> {
        let volumes = self.cluster.list_volumes().await?;
        Ok(volumes
            .into_iter()
            .filter(|v| is_eligible(v, &self.config.driver_name))
            .collect())
    }

    /// Classify every volume and build the requests for the three phases.
    pub(crate) async fn plan(
        &self,
        volumes: &[OrchestratorVolume],
        catalog_volumes: &[VolumeRecord],
        index: &ClusterIndex,
        debounce: &mut DeletionDebounce,
    ) -> SyncPlan {
        let mut plan = SyncPlan::default();
        let in_cluster: HashMap<&str, &OrchestratorVolume> = volumes
            .iter()
            .map(|v| (v.volume_handle.as_str(), v))
            .collect();
        let in_catalog: HashSet<&str> = catalog_volumes.iter().map(|r| r.id.as_str()).collect();

        for volume in volumes {
            if index.is_skipped(&volume.name) {
                warn!(
                    volume = %volume.name,
                    volume_id = %volume.volume_handle,
                    "claim lookup failed, leaving volume untouched this cycle",
                );
                continue;
            }
            if !in_catalog.contains(volume.volume_handle.as_str()) {
                debug!(
                    volume = %volume.name,
                    volume_id = %volume.volume_handle,
                    "classified create",
                );
                plan.creates.push(self.create_spec(volume, index));
                continue;
            }
            if let Some(spec) = self.classify_existing(volume, index).await {
                plan.updates.push(spec);
            }
        }

        for record in catalog_volumes {
            if in_cluster.contains_key(record.id.as_str()) {
                debounce.observe_present(&record.id);
            } else if debounce.observe_missing(&record.id) {
                plan.deletes.push(record.id.clone());
            }
        }
        debounce.retain_listed(in_catalog.iter().copied());

        plan
    }

    /// Fetch the catalog metadata of a volume present on both sides and turn
    /// the comparison into an update spec, if one is needed.
    async fn classify_existing(
        &self,
        volume: &OrchestratorVolume,
        index: &ClusterIndex,
    ) -> Option<UpdateSpec> {
        let volume_id = volume.volume_handle.as_str();
        let stored = match self
            .catalog
            .query_volume(QueryFilter::by_volume(volume_id))
            .await
        {
            Ok(result) => result.volumes.into_iter().find(|r| r.id == volume_id),
            Err(e) => {
                warn!(%volume_id, error = %e, "failed to query volume metadata, skipping");
                return None;
            }
        };
        let Some(stored) = stored else {
            warn!(%volume_id, "volume vanished from catalog during sync, skipping");
            return None;
        };

        let fresh = build_metadata_list(volume, index);
        let change = classify(&fresh, &stored.metadata, volume_id)?;
        debug!(%volume_id, ?change, "classified update");
        Some(self.update_spec(volume_id, fresh, change))
    }

    fn create_spec(&self, volume: &OrchestratorVolume, index: &ClusterIndex) -> CreateSpec {
        CreateSpec {
            name: volume.name.clone(),
            volume_type: self.config.volume_type.clone(),
            backing: BackingDetails {
                capacity_mb: volume.capacity_bytes / BYTES_PER_MB,
                backing_disk_id: Some(volume.volume_handle.clone()),
            },
            cluster: self.config.container_cluster(),
            metadata: build_metadata_list(volume, index),
        }
    }

    fn update_spec(
        &self,
        volume_id: &str,
        mut fresh: Vec<EntityMetadata>,
        change: ChangeType,
    ) -> UpdateSpec {
        let metadata = match change {
            ChangeType::Update => fresh,
            ChangeType::UpdateDeleteClaim(stale) => {
                fresh.truncate(1);
                if let Some(claim) = &stale.claim {
                    fresh.push(tombstone(EntityType::PersistentVolumeClaim, claim));
                }
                if let Some(pod) = &stale.pod {
                    fresh.push(tombstone(EntityType::Pod, pod));
                }
                fresh
            }
            ChangeType::UpdateDeletePod(stale) => {
                if let Some(pod) = &stale.pod {
                    fresh.push(tombstone(EntityType::Pod, pod));
                }
                fresh
            }
        };
        UpdateSpec {
            volume_id: volume_id.to_owned(),
            cluster: self.config.container_cluster(),
            metadata,
        }
    }
}

pub(crate) fn is_eligible(volume: &OrchestratorVolume, driver_name: &str) -> bool {
    volume.driver == driver_name
        && volume.phase.is_reconcilable()
        && !volume.volume_handle.is_empty()
}

fn phase_result(
    phase: &str,
    result: Result<PhaseOutcome, tokio::task::JoinError>,
) -> PhaseOutcome {
    result.unwrap_or_else(|e| {
        error!(phase, error = %e, "full sync phase task failed");
        PhaseOutcome::default()
    })
}

/// Register missing volumes, re-checking first that each still exists in the
/// cluster so an orchestrator delete racing the cycle does not resurrect it.
async fn create_phase(
    catalog: Arc<dyn VolumeCatalog>,
    cluster: Arc<dyn ClusterState>,
    driver_name: String,
    specs: Vec<CreateSpec>,
) -> PhaseOutcome {
    let mut outcome = PhaseOutcome::default();
    if specs.is_empty() {
        return outcome;
    }

    let present: HashSet<String> = match cluster.list_volumes().await {
        Ok(volumes) => volumes
            .into_iter()
            .filter(|v| is_eligible(v, &driver_name))
            .map(|v| v.volume_handle)
            .collect(),
        Err(e) => {
            warn!(error = %e, "failed to re-list cluster volumes, skipping create phase");
            return outcome;
        }
    };

    for spec in specs {
        let volume_id = spec.backing.backing_disk_id.clone().unwrap_or_default();
        if !present.contains(&volume_id) {
            info!(%volume_id, name = %spec.name, "volume left the cluster before create, skipping");
            continue;
        }
        match catalog.create_volume(spec).await {
            Ok(id) => {
                info!(volume_id = %id, "full sync registered volume");
                outcome.succeeded += 1;
            }
            Err(e) => {
                warn!(%volume_id, error = %e, "full sync create failed");
                outcome.failed += 1;
            }
        }
    }
    outcome
}

async fn update_phase(catalog: Arc<dyn VolumeCatalog>, specs: Vec<UpdateSpec>) -> PhaseOutcome {
    let mut outcome = PhaseOutcome::default();
    for spec in specs {
        let volume_id = spec.volume_id.clone();
        match catalog.update_volume_metadata(spec).await {
            Ok(()) => {
                info!(%volume_id, "full sync updated volume metadata");
                outcome.succeeded += 1;
            }
            Err(e) => {
                warn!(%volume_id, error = %e, "full sync metadata update failed");
                outcome.failed += 1;
            }
        }
    }
    outcome
}

/// Drop orphaned catalog entries. The disks themselves are kept.
async fn delete_phase(catalog: Arc<dyn VolumeCatalog>, volume_ids: Vec<String>) -> PhaseOutcome {
    let mut outcome = PhaseOutcome::default();
    for volume_id in volume_ids {
        match catalog.delete_volume(&volume_id, false).await {
            Ok(()) => {
                info!(%volume_id, "full sync removed orphaned volume");
                outcome.succeeded += 1;
            }
            Err(e) => {
                warn!(%volume_id, error = %e, "full sync delete failed");
                outcome.failed += 1;
            }
        }
    }
    outcome
}
