//! Builders for catalog metadata entries.
//!
//! Entries are built from orchestrator objects only; nothing here looks at
//! catalog state.  The ordered list produced by [`build_metadata_list`] is
//! what the comparator measures, so its shape is fixed: the volume entry
//! first, then the claim entry, then the pod entry.

use crate::index::ClusterIndex;
use crate::types::{
    EntityMetadata, EntityRef, EntityType, Labels, OrchestratorClaim, OrchestratorVolume,
};

/// Build a single metadata entry.
///
/// `labels == None` omits the labels field entirely so an update keeps the
/// labels already stored in the catalog; `Some(empty)` clears them.
pub fn build(
    entity_name: &str,
    labels: Option<Labels>,
    delete_marker: bool,
    entity_type: EntityType,
    namespace: &str,
) -> EntityMetadata {
    EntityMetadata {
        entity_type,
        entity_name: entity_name.to_owned(),
        namespace: namespace.to_owned(),
        labels,
        delete_marker,
    }
}

/// Entry describing a persistent volume. Volumes are cluster scoped.
pub fn volume_entry(volume: &OrchestratorVolume) -> EntityMetadata {
    build(
        &volume.name,
        Some(volume.labels.clone()),
        false,
        EntityType::PersistentVolume,
        "",
    )
}

pub fn claim_entry(claim: &OrchestratorClaim, delete_marker: bool) -> EntityMetadata {
    build(
        &claim.name,
        Some(claim.labels.clone()),
        delete_marker,
        EntityType::PersistentVolumeClaim,
        &claim.namespace,
    )
}

/// Pods carry no labels worth recording.
pub fn pod_entry(name: &str, namespace: &str, delete_marker: bool) -> EntityMetadata {
    build(name, None, delete_marker, EntityType::Pod, namespace)
}

/// Tombstone for an entity the catalog still lists but the orchestrator no
/// longer has.
pub fn tombstone(entity_type: EntityType, entity: &EntityRef) -> EntityMetadata {
    build(&entity.name, None, true, entity_type, &entity.namespace)
}

/// Build the ordered metadata list for `volume`: the volume entry, then the
/// bound claim if the index has one, then the pod mounting that claim.
pub fn build_metadata_list(
    volume: &OrchestratorVolume,
    index: &ClusterIndex,
) -> Vec<EntityMetadata> {
    let mut list = vec![volume_entry(volume)];
    if let Some(claim) = index.claim_for_volume(&volume.name) {
        list.push(claim_entry(claim, false));
        if let Some(pod) = index.pod_for_claim(&claim.key()) {
            list.push(pod_entry(&pod.name, &pod.namespace, false));
        }
    }
    list
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClaimRef, OrchestratorPod, PodPhase, VolumePhase};
    use std::collections::HashMap;

    fn volume() -> OrchestratorVolume {
        OrchestratorVolume {
            name: "pv-1".into(),
            volume_handle: "fcd-1".into(),
            phase: VolumePhase::Bound,
            labels: HashMap::from([("tier".into(), "gold".into())]),
            claim_ref: Some(ClaimRef {
                namespace: "default".into(),
                name: "data".into(),
            }),
            ..Default::default()
        }
    }

    fn claim() -> OrchestratorClaim {
        OrchestratorClaim {
            name: "data".into(),
            namespace: "default".into(),
            labels: HashMap::from([("app".into(), "web".into())]),
            volume_name: Some("pv-1".into()),
            ..Default::default()
        }
    }

    #[test]
    fn volume_entry_is_cluster_scoped() {
        let entry = volume_entry(&volume());
        assert_eq!(entry.entity_type, EntityType::PersistentVolume);
        assert_eq!(entry.entity_name, "pv-1");
        assert!(entry.namespace.is_empty());
        assert_eq!(entry.labels.unwrap().get("tier").map(String::as_str), Some("gold"));
        assert!(!entry.delete_marker);
    }

    #[test]
    fn pod_entry_has_no_labels() {
        let entry = pod_entry("web-0", "default", true);
        assert!(entry.labels.is_none());
        assert!(entry.delete_marker);
    }

    #[test]
    fn list_shapes_follow_index() {
        let mut index = ClusterIndex::default();
        assert_eq!(build_metadata_list(&volume(), &index).len(), 1);

        index.insert_claim("pv-1", claim());
        let list = build_metadata_list(&volume(), &index);
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].entity_type, EntityType::PersistentVolumeClaim);

        index.insert_pod(
            "default/data",
            OrchestratorPod {
                name: "web-0".into(),
                namespace: "default".into(),
                phase: PodPhase::Running,
                claim_names: vec!["data".into()],
            },
        );
        let list = build_metadata_list(&volume(), &index);
        let types: Vec<_> = list.iter().map(|e| e.entity_type).collect();
        assert_eq!(
            types,
            vec![
                EntityType::PersistentVolume,
                EntityType::PersistentVolumeClaim,
                EntityType::Pod
            ]
        );
    }
}
