//! The syncer loop driving both the timer path and the event path.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use libcsisync::backend::memory::CatalogCall;
use libcsisync::types::*;
use libcsisync::MetadataSyncer;
use tokio::sync::watch;

async fn eventually<F>(mut check: F)
where
    F: AsyncFnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread")]
async fn pod_events_are_pushed_between_full_syncs() {
    let h = Harness::new();
    let (v, claim) = bound_pair("v1", "data-v1");
    h.cluster.put_volume(v).await;
    h.cluster.put_claim(claim).await;

    let syncer = Arc::new(
        MetadataSyncer::new(h.catalog.clone(), h.cluster.clone(), config())
            .unwrap()
            .with_interval(Duration::from_secs(3600)),
    );
    let (shutdown, rx) = watch::channel(false);
    let task = tokio::spawn({
        let syncer = Arc::clone(&syncer);
        async move { syncer.run(rx).await }
    });

    eventually(async || h.stored("fcd-v1").await.len() == 2).await;

    // Pod starts running: its entry is pushed right away.
    let mut pod = running_pod("web-0", "data-v1");
    pod.phase = PodPhase::Pending;
    h.cluster.put_pod(pod.clone()).await;
    pod.phase = PodPhase::Running;
    h.cluster.put_pod(pod.clone()).await;
    eventually(async || {
        h.stored("fcd-v1")
            .await
            .iter()
            .any(|m| m.entity_type == EntityType::Pod && m.entity_name == "web-0")
    })
    .await;

    // Pod goes away: tombstoned without waiting for the next full sync.
    h.cluster.remove_pod(NAMESPACE, "web-0").await;
    eventually(async || h.stored("fcd-v1").await.len() == 2).await;

    shutdown.send(true).unwrap();
    task.await.unwrap().unwrap();

    // Exactly one cycle ran, so no deletes were ever issued.
    assert!(
        h.catalog
            .calls()
            .await
            .iter()
            .all(|c| !matches!(c, CatalogCall::Delete { .. }))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn volume_delete_event_removes_catalog_entry() {
    let h = Harness::new();
    let mut v = volume("v2", VolumePhase::Available);
    v.reclaim_policy = ReclaimPolicy::Retain;
    h.cluster.put_volume(v).await;

    let syncer = Arc::new(
        MetadataSyncer::new(h.catalog.clone(), h.cluster.clone(), config())
            .unwrap()
            .with_interval(Duration::from_secs(3600)),
    );
    let (shutdown, rx) = watch::channel(false);
    let task = tokio::spawn({
        let syncer = Arc::clone(&syncer);
        async move { syncer.run(rx).await }
    });

    eventually(async || h.catalog.record("fcd-v2").await.is_some()).await;
    h.cluster.remove_volume("v2").await;
    eventually(async || h.catalog.record("fcd-v2").await.is_none()).await;

    // No claim reference: the disk itself is kept.
    let calls = h.catalog.calls().await;
    assert!(calls.contains(&CatalogCall::Delete {
        volume_id: "fcd-v2".into(),
        delete_disk: false,
    }));

    shutdown.send(true).unwrap();
    task.await.unwrap().unwrap();
}
