//! Metadata comparator.
//!
//! Decides whether the metadata list derived from the orchestrator matches
//! what the catalog stores for a volume and, if not, what kind of push is
//! needed.  Only three list shapes occur (volume, volume + claim, volume +
//! claim + pod), so the decision is driven by list lengths first and falls
//! back to an entry-by-entry comparison only when the lengths agree.

use std::collections::HashMap;

use tracing::debug;

use crate::types::{EntityMetadata, EntityRef, EntityType, Labels};

/// Catalog entities the orchestrator no longer has.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaleEntities {
    pub claim: Option<EntityRef>,
    pub pod: Option<EntityRef>,
}

impl StaleEntities {
    fn from_catalog(entries: &[EntityMetadata]) -> Self {
        let find = |ty: EntityType| {
            entries
                .iter()
                .find(|e| e.entity_type == ty)
                .map(|e| EntityRef::new(e.entity_name.clone(), e.namespace.clone()))
        };
        Self {
            claim: find(EntityType::PersistentVolumeClaim),
            pod: find(EntityType::Pod),
        }
    }
}

/// Kind of metadata push a volume needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeType {
    /// Push the fresh list as is.
    Update,
    /// Only the volume remains; drop the catalog's claim and pod entries.
    UpdateDeleteClaim(StaleEntities),
    /// Volume and claim remain; drop the catalog's pod entry.
    UpdateDeletePod(StaleEntities),
}

/// Compare the orchestrator-derived list with the catalog's list for
/// `volume_id`. `None` means nothing to do.
pub fn classify(
    fresh: &[EntityMetadata],
    catalog: &[EntityMetadata],
    volume_id: &str,
) -> Option<ChangeType> {
    if fresh.len() > catalog.len() {
        return Some(ChangeType::Update);
    }

    if fresh.len() < catalog.len() {
        let stale = StaleEntities::from_catalog(catalog);
        return match fresh.len() {
            1 => Some(ChangeType::UpdateDeleteClaim(stale)),
            2 => Some(ChangeType::UpdateDeletePod(stale)),
            n => {
                debug!(%volume_id, fresh = n, catalog = catalog.len(), "no deletion shape applies");
                None
            }
        };
    }

    let by_type: HashMap<EntityType, &EntityMetadata> =
        catalog.iter().map(|e| (e.entity_type, e)).collect();
    let mismatch = fresh.iter().any(|entry| match by_type.get(&entry.entity_type) {
        Some(stored) => !entries_match(entry, stored),
        None => true,
    });

    if mismatch {
        Some(ChangeType::Update)
    } else {
        debug!(%volume_id, "metadata in sync");
        None
    }
}

/// Two entries match when name, namespace, delete marker and label set agree.
pub fn entries_match(a: &EntityMetadata, b: &EntityMetadata) -> bool {
    a.entity_name == b.entity_name
        && a.namespace == b.namespace
        && a.delete_marker == b.delete_marker
        && labels_match(a.labels.as_ref(), b.labels.as_ref())
}

/// Label sets compare as unordered maps; an absent set equals an empty one.
fn labels_match(a: Option<&Labels>, b: Option<&Labels>) -> bool {
    let empty = Labels::new();
    a.unwrap_or(&empty) == b.unwrap_or(&empty)
}
