//! Cross-reference index from volumes to the claims and pods using them.
//!
//! The index is rebuilt from scratch at every full-sync cycle and is the only
//! place orchestrator relationships are resolved.  A claim that no longer
//! exists leaves a hole in the index and the volume is synced with a shorter
//! metadata list.  A claim that could not be fetched marks the volume as
//! skipped, and full sync leaves it untouched until the next cycle.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::cluster::ClusterState;
use crate::types::{OrchestratorClaim, OrchestratorPod, OrchestratorVolume, PodPhase, VolumePhase};

/// `volume name -> bound claim` and `namespace/claim -> mounting pod`.
#[derive(Debug, Clone, Default)]
pub struct ClusterIndex {
    claims_by_volume: HashMap<String, OrchestratorClaim>,
    pods_by_claim: HashMap<String, OrchestratorPod>,
    skipped: HashSet<String>,
}

impl ClusterIndex {
    pub fn claim_for_volume(&self, volume_name: &str) -> Option<&OrchestratorClaim> {
        self.claims_by_volume.get(volume_name)
    }

    pub fn pod_for_claim(&self, claim_key: &str) -> Option<&OrchestratorPod> {
        self.pods_by_claim.get(claim_key)
    }

    pub fn insert_claim(&mut self, volume_name: &str, claim: OrchestratorClaim) {
        self.claims_by_volume.insert(volume_name.to_owned(), claim);
    }

    /// Record `pod` for the claim unless another pod already holds the slot.
    pub fn insert_pod(&mut self, claim_key: &str, pod: OrchestratorPod) {
        self.pods_by_claim.entry(claim_key.to_owned()).or_insert(pod);
    }

    /// Mark a volume whose relationships could not be resolved this cycle.
    pub fn mark_skipped(&mut self, volume_name: &str) {
        self.skipped.insert(volume_name.to_owned());
    }

    pub fn is_skipped(&self, volume_name: &str) -> bool {
        self.skipped.contains(volume_name)
    }

    pub fn claim_count(&self) -> usize {
        self.claims_by_volume.len()
    }

    pub fn pod_count(&self) -> usize {
        self.pods_by_claim.len()
    }
}

/// Resolve claims and running pods for every bound volume in `volumes`.
///
/// Running pods are listed once per namespace.  The first running pod that
/// mounts a claim wins.
pub async fn build_index(
    volumes: &[OrchestratorVolume],
    cluster: &dyn ClusterState,
) -> ClusterIndex {
    let mut index = ClusterIndex::default();
    let mut pods_by_namespace: HashMap<String, Vec<OrchestratorPod>> = HashMap::new();

    for volume in volumes {
        if volume.phase != VolumePhase::Bound {
            continue;
        }
        let Some(claim_ref) = &volume.claim_ref else {
            continue;
        };

        let claim = match cluster.get_claim(&claim_ref.namespace, &claim_ref.name).await {
            Ok(claim) => claim,
            Err(e) if e.is_not_found() => {
                debug!(
                    volume = %volume.name,
                    claim = %claim_ref.key(),
                    "bound claim no longer exists",
                );
                continue;
            }
            Err(e) => {
                warn!(
                    volume = %volume.name,
                    claim = %claim_ref.key(),
                    error = %e,
                    "failed to fetch claim, skipping volume for this cycle",
                );
                index.mark_skipped(&volume.name);
                continue;
            }
        };

        if !pods_by_namespace.contains_key(&claim.namespace) {
            match cluster.list_pods(&claim.namespace, PodPhase::Running).await {
                Ok(pods) => {
                    pods_by_namespace.insert(claim.namespace.clone(), pods);
                }
                Err(e) => {
                    warn!(
                        namespace = %claim.namespace,
                        error = %e,
                        "failed to list running pods",
                    );
                }
            }
        }

        if let Some(pod) = pods_by_namespace
            .get(&claim.namespace)
            .and_then(|pods| pods.iter().find(|p| p.mounts_claim(&claim.name)))
        {
            index.insert_pod(&claim.key(), pod.clone());
        }
        index.insert_claim(&volume.name, claim);
    }

    debug!(
        claims = index.claim_count(),
        pods = index.pod_count(),
        skipped = index.skipped.len(),
        "cluster index built",
    );
    index
}
