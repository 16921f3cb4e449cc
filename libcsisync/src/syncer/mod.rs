//! Reconciliation runtime.
//!
//! [`MetadataSyncer`] drives two independent paths against one catalog:
//!
//! | Path | Trigger | Work |
//! |---|---|---|
//! | full sync | interval tick | [`FullSync::run_cycle`] on its own task |
//! | incremental | [`ClusterEvent`] from the cluster watch | [`EventHandlers::handle`] |
//!
//! The first tick fires at start-up.  A tick that arrives while the previous
//! cycle is still running is skipped, so event handling never waits on a
//! full sync.

pub mod full_sync;
pub mod handlers;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::catalog::VolumeCatalog;
use crate::cluster::{ClusterEvent, ClusterState};
use crate::config::SyncConfig;
use crate::error::SyncError;

pub use full_sync::{FullSync, SyncReport};
pub use handlers::EventHandlers;

pub struct MetadataSyncer {
    cluster: Arc<dyn ClusterState>,
    full_sync: Arc<FullSync>,
    handlers: Arc<EventHandlers>,
    interval: Duration,
}

impl MetadataSyncer {
    /// Validate `config` and wire both paths to the same catalog and cluster.
    pub fn new(
        catalog: Arc<dyn VolumeCatalog>,
        cluster: Arc<dyn ClusterState>,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let interval = config.full_sync_interval();
        let full_sync = FullSync::new(Arc::clone(&catalog), Arc::clone(&cluster), config.clone());
        let handlers = EventHandlers::new(catalog, Arc::clone(&cluster), config);
        Ok(Self {
            cluster,
            full_sync: Arc::new(full_sync),
            handlers: Arc::new(handlers),
            interval,
        })
    }

    /// Override the full-sync period taken from the configuration.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn full_sync(&self) -> &Arc<FullSync> {
        &self.full_sync
    }

    pub fn handlers(&self) -> &Arc<EventHandlers> {
        &self.handlers
    }

    /// Run until `shutdown` flips to `true` or the cluster event stream ends.
    ///
    /// An in-flight full-sync cycle is allowed to finish before returning.
    #[instrument(skip_all, fields(interval_secs = self.interval.as_secs()))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), SyncError> {
        let mut events = self.cluster.subscribe().await?;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cycle: Option<JoinHandle<()>> = None;

        info!("metadata syncer started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if cycle.as_ref().is_some_and(|h| !h.is_finished()) {
                        warn!("previous full sync still running; skipping tick");
                        continue;
                    }
                    cycle = Some(self.spawn_cycle());
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        info!("cluster event stream closed");
                        break;
                    };
                    self.dispatch(event).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutdown requested");
                        break;
                    }
                }
            }
        }

        if let Some(handle) = cycle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "full sync task did not complete");
        }
        info!("metadata syncer stopped");
        Ok(())
    }

    fn spawn_cycle(&self) -> JoinHandle<()> {
        let full_sync = Arc::clone(&self.full_sync);
        tokio::spawn(async move {
            // Failures are logged inside the cycle; the next tick retries.
            if let Ok(report) = full_sync.run_cycle().await {
                debug!(?report, "full sync cycle finished");
            }
        })
    }

    async fn dispatch(&self, event: ClusterEvent) {
        let label = event.describe();
        match self.handlers.handle(event).await {
            Ok(()) => debug!(event = %label, "event handled"),
            Err(e) => warn!(
                event = %label,
                error = %e,
                "event handling failed; full sync will reconcile",
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryCatalog, MemoryCluster};
    use crate::types::*;
    use std::collections::HashMap;

    fn config() -> SyncConfig {
        SyncConfig {
            cluster_id: "c1".into(),
            ..Default::default()
        }
    }

    async fn wait_for_record(
        catalog: &MemoryCatalog,
        volume_id: &str,
        check: impl Fn(&VolumeRecord) -> bool,
    ) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !catalog.record(volume_id).await.is_some_and(|r| check(&r)) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("catalog record not reached in time");
    }

    #[test]
    fn rejects_invalid_config() {
        let config = SyncConfig {
            cluster_id: String::new(),
            ..Default::default()
        };
        let result = MetadataSyncer::new(
            Arc::new(MemoryCatalog::new()),
            Arc::new(MemoryCluster::new()),
            config,
        );
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[tokio::test]
    async fn runs_full_sync_and_events_until_shutdown() {
        let catalog = Arc::new(MemoryCatalog::new());
        let cluster = Arc::new(MemoryCluster::new());
        let mut volume = OrchestratorVolume {
            name: "pv-1".into(),
            volume_handle: "fcd-1".into(),
            driver: config().driver_name,
            phase: VolumePhase::Available,
            capacity_bytes: 1 << 30,
            ..Default::default()
        };
        cluster.put_volume(volume.clone()).await;

        let syncer = Arc::new(
            MetadataSyncer::new(catalog.clone(), cluster.clone(), config())
                .unwrap()
                .with_interval(Duration::from_secs(3600)),
        );
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn({
            let syncer = Arc::clone(&syncer);
            async move { syncer.run(rx).await }
        });

        // The first tick is immediate and registers the volume.
        wait_for_record(&catalog, "fcd-1", |_| true).await;

        // A label change arrives through the event path.
        volume.labels = HashMap::from([("tier".to_owned(), "gold".to_owned())]);
        cluster.put_volume(volume.clone()).await;
        wait_for_record(&catalog, "fcd-1", |r| {
            r.metadata[0].labels.as_ref() == Some(&volume.labels)
        })
        .await;

        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }
}
