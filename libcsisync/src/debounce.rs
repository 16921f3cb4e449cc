//! Two-strike deletion guard.
//!
//! A catalog volume missing from the orchestrator is only deleted once it has
//! been seen missing by two consecutive full-sync cycles.  The first sighting
//! parks its id here; the second one promotes it to a deletion.  This keeps a
//! volume whose orchestrator object is still being created from being torn
//! down by a cycle that snapshotted too early.
//!
//! The set lives in memory only, so a restart reopens the window.

use std::collections::HashSet;

use tracing::debug;

#[derive(Debug, Default)]
pub struct DeletionDebounce {
    candidates: HashSet<String>,
}

impl DeletionDebounce {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `volume_id` is missing from the orchestrator.
    ///
    /// Returns `true` when this is the second consecutive sighting, in which
    /// case the id leaves the set and the volume should be deleted now.
    pub fn observe_missing(&mut self, volume_id: &str) -> bool {
        if self.candidates.remove(volume_id) {
            debug!(%volume_id, "volume missing for two cycles, promoting to delete");
            true
        } else {
            debug!(%volume_id, "volume missing from cluster, deferring delete");
            self.candidates.insert(volume_id.to_owned());
            false
        }
    }

    /// Record that `volume_id` is present in the orchestrator again.
    pub fn observe_present(&mut self, volume_id: &str) {
        if self.candidates.remove(volume_id) {
            debug!(%volume_id, "volume reappeared, no longer a delete candidate");
        }
    }

    /// Forget candidates the catalog no longer lists at all.
    pub fn retain_listed<'a>(&mut self, listed: impl IntoIterator<Item = &'a str>) {
        let listed: HashSet<&str> = listed.into_iter().collect();
        self.candidates.retain(|id| listed.contains(id.as_str()));
    }

    pub fn contains(&self, volume_id: &str) -> bool {
        self.candidates.contains(volume_id)
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_sighting_promotes() {
        let mut cache = DeletionDebounce::new();
        assert!(!cache.observe_missing("fcd-1"));
        assert!(cache.contains("fcd-1"));
        assert!(cache.observe_missing("fcd-1"));
        assert!(cache.is_empty());
    }

    #[test]
    fn reappearance_resets() {
        let mut cache = DeletionDebounce::new();
        assert!(!cache.observe_missing("fcd-1"));
        cache.observe_present("fcd-1");
        assert!(!cache.contains("fcd-1"));
        assert!(!cache.observe_missing("fcd-1"));
    }

    #[test]
    fn unlisted_candidates_are_pruned() {
        let mut cache = DeletionDebounce::new();
        cache.observe_missing("fcd-1");
        cache.observe_missing("fcd-2");
        cache.retain_listed(["fcd-2"]);
        assert!(!cache.contains("fcd-1"));
        assert!(cache.contains("fcd-2"));
        assert_eq!(cache.len(), 1);
    }
}
