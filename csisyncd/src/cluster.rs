//! Kubernetes-backed [`ClusterState`].
//!
//! Reads persistent volumes, claims and pods through `kube`, and turns one
//! `kube::runtime::watcher` per kind into the [`ClusterEvent`] stream the
//! syncer consumes.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use kube::api::{Api, ListParams};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Client, Resource, ResourceExt};
use libcsisync::cluster::{ClusterEvent, ClusterState};
use libcsisync::types::*;
use libcsisync::SyncError;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct KubeClusterState {
    client: Client,
}

impl KubeClusterState {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn api_error(kind: &str, key: &str, e: kube::Error) -> SyncError {
    match e {
        kube::Error::Api(ref resp) if resp.code == 404 => SyncError::object_not_found(kind, key),
        e => SyncError::cluster(e),
    }
}

fn labels(map: &Option<BTreeMap<String, String>>) -> Labels {
    map.iter()
        .flatten()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Parse a Kubernetes quantity such as `10Gi` or `500M` into bytes.
pub fn parse_quantity(raw: &str) -> Option<u64> {
    const SUFFIXES: [(&str, u64); 12] = [
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("Pi", 1 << 50),
        ("k", 1_000),
        ("K", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
        ("P", 1_000_000_000_000_000),
        ("", 1),
    ];
    let raw = raw.trim();
    let (number, multiplier) = SUFFIXES
        .iter()
        .find_map(|(suffix, m)| raw.strip_suffix(suffix).map(|n| (n, *m)))?;
    if let Ok(n) = number.parse::<u64>() {
        return n.checked_mul(multiplier);
    }
    let n = number.parse::<f64>().ok().filter(|n| n.is_finite() && *n >= 0.0)?;
    Some((n * multiplier as f64) as u64)
}

pub fn volume_from(pv: &PersistentVolume) -> OrchestratorVolume {
    let spec = pv.spec.as_ref();
    let csi = spec.and_then(|s| s.csi.as_ref());
    OrchestratorVolume {
        name: pv.name_any(),
        volume_handle: csi.map(|c| c.volume_handle.clone()).unwrap_or_default(),
        driver: csi.map(|c| c.driver.clone()).unwrap_or_default(),
        phase: pv
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .and_then(|p| p.parse().ok())
            .unwrap_or_default(),
        labels: labels(&pv.metadata.labels),
        claim_ref: spec
            .and_then(|s| s.claim_ref.as_ref())
            .and_then(|r| match (&r.namespace, &r.name) {
                (Some(namespace), Some(name)) => Some(ClaimRef {
                    namespace: namespace.clone(),
                    name: name.clone(),
                }),
                _ => None,
            }),
        storage_class: spec
            .and_then(|s| s.storage_class_name.clone())
            .unwrap_or_default(),
        reclaim_policy: spec
            .and_then(|s| s.persistent_volume_reclaim_policy.as_deref())
            .and_then(|p| p.parse().ok())
            .unwrap_or_default(),
        capacity_bytes: spec
            .and_then(|s| s.capacity.as_ref())
            .and_then(|c| c.get("storage"))
            .and_then(|q| parse_quantity(&q.0))
            .unwrap_or_default(),
    }
}

pub fn claim_from(pvc: &PersistentVolumeClaim) -> OrchestratorClaim {
    OrchestratorClaim {
        name: pvc.name_any(),
        namespace: pvc.namespace().unwrap_or_default(),
        labels: labels(&pvc.metadata.labels),
        volume_name: pvc
            .spec
            .as_ref()
            .and_then(|s| s.volume_name.clone())
            .filter(|n| !n.is_empty()),
        phase: pvc
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .and_then(|p| p.parse().ok())
            .unwrap_or_default(),
    }
}

pub fn pod_from(pod: &Pod) -> OrchestratorPod {
    OrchestratorPod {
        name: pod.name_any(),
        namespace: pod.namespace().unwrap_or_default(),
        phase: pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .and_then(|p| p.parse().ok())
            .unwrap_or(PodPhase::Unknown),
        claim_names: pod
            .spec
            .iter()
            .flat_map(|s| s.volumes.iter().flatten())
            .filter_map(|v| v.persistent_volume_claim.as_ref())
            .map(|c| c.claim_name.clone())
            .collect(),
    }
}

#[async_trait]
impl ClusterState for KubeClusterState {
    async fn list_volumes(&self) -> Result<Vec<OrchestratorVolume>, SyncError> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(SyncError::cluster)?;
        Ok(list.items.iter().map(volume_from).collect())
    }

    async fn get_volume(&self, name: &str) -> Result<OrchestratorVolume, SyncError> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        let pv = api
            .get(name)
            .await
            .map_err(|e| api_error("PersistentVolume", name, e))?;
        Ok(volume_from(&pv))
    }

    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<OrchestratorClaim, SyncError> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let pvc = api
            .get(name)
            .await
            .map_err(|e| api_error("PersistentVolumeClaim", &claim_key(namespace, name), e))?;
        Ok(claim_from(&pvc))
    }

    async fn list_pods(
        &self,
        namespace: &str,
        phase: PodPhase,
    ) -> Result<Vec<OrchestratorPod>, SyncError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().fields(&format!("status.phase={phase}"));
        let list = api.list(&params).await.map_err(SyncError::cluster)?;
        Ok(list.items.iter().map(pod_from).collect())
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<ClusterEvent>, SyncError> {
        let (tx, rx) = mpsc::unbounded_channel();
        spawn_watcher::<OrchestratorVolume>(Api::all(self.client.clone()), tx.clone());
        spawn_watcher::<OrchestratorClaim>(Api::all(self.client.clone()), tx.clone());
        spawn_watcher::<OrchestratorPod>(Api::all(self.client.clone()), tx);
        Ok(rx)
    }
}

/// A domain object produced from one watched Kubernetes kind.
trait Watched: Clone + Send + 'static {
    type Resource: Resource<DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Send
        + Sync
        + 'static;

    fn convert(resource: &Self::Resource) -> Self;
    fn cache_key(&self) -> String;
    fn added(self) -> ClusterEvent;
    fn updated(old: Self, new: Self) -> ClusterEvent;
    fn deleted(self) -> ClusterEvent;
}

impl Watched for OrchestratorVolume {
    type Resource = PersistentVolume;

    fn convert(resource: &PersistentVolume) -> Self {
        volume_from(resource)
    }
    fn cache_key(&self) -> String {
        self.name.clone()
    }
    fn added(self) -> ClusterEvent {
        ClusterEvent::VolumeAdded(self)
    }
    fn updated(old: Self, new: Self) -> ClusterEvent {
        ClusterEvent::VolumeUpdated { old, new }
    }
    fn deleted(self) -> ClusterEvent {
        ClusterEvent::VolumeDeleted(self)
    }
}

impl Watched for OrchestratorClaim {
    type Resource = PersistentVolumeClaim;

    fn convert(resource: &PersistentVolumeClaim) -> Self {
        claim_from(resource)
    }
    fn cache_key(&self) -> String {
        self.key()
    }
    fn added(self) -> ClusterEvent {
        ClusterEvent::ClaimAdded(self)
    }
    fn updated(old: Self, new: Self) -> ClusterEvent {
        ClusterEvent::ClaimUpdated { old, new }
    }
    fn deleted(self) -> ClusterEvent {
        ClusterEvent::ClaimDeleted(self)
    }
}

impl Watched for OrchestratorPod {
    type Resource = Pod;

    fn convert(resource: &Pod) -> Self {
        pod_from(resource)
    }
    fn cache_key(&self) -> String {
        claim_key(&self.namespace, &self.name)
    }
    fn added(self) -> ClusterEvent {
        ClusterEvent::PodAdded(self)
    }
    fn updated(old: Self, new: Self) -> ClusterEvent {
        ClusterEvent::PodUpdated { old, new }
    }
    fn deleted(self) -> ClusterEvent {
        ClusterEvent::PodDeleted(self)
    }
}

/// Last-seen objects of one kind; turns watch events into cluster events.
///
/// A (re-)list builds a new map that replaces the old one once the list is
/// complete, so objects deleted while the watch was down are forgotten.
struct WatchCache<T> {
    seen: HashMap<String, T>,
    relist: Option<HashMap<String, T>>,
}

impl<T: Watched> WatchCache<T> {
    fn new() -> Self {
        Self {
            seen: HashMap::new(),
            relist: None,
        }
    }

    fn begin_relist(&mut self) {
        self.relist = Some(HashMap::new());
    }

    /// Listed objects only seed the cache.
    fn seed(&mut self, item: T) {
        let target = self.relist.as_mut().unwrap_or(&mut self.seen);
        target.insert(item.cache_key(), item);
    }

    /// Swap in the re-listed objects and return how many were dropped.
    fn finish_relist(&mut self) -> usize {
        let Some(listed) = self.relist.take() else {
            return 0;
        };
        let dropped = self.seen.keys().filter(|k| !listed.contains_key(*k)).count();
        self.seen = listed;
        dropped
    }

    fn apply(&mut self, item: T) -> ClusterEvent {
        match self.seen.insert(item.cache_key(), item.clone()) {
            Some(old) => T::updated(old, item),
            None => item.added(),
        }
    }

    fn delete(&mut self, item: T) -> ClusterEvent {
        self.seen.remove(&item.cache_key());
        item.deleted()
    }
}

fn spawn_watcher<T: Watched>(api: Api<T::Resource>, tx: mpsc::UnboundedSender<ClusterEvent>) {
    tokio::spawn(async move {
        let kind = T::Resource::kind(&()).to_string();
        let mut cache = WatchCache::<T>::new();
        let mut stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();

        while let Some(event) = stream.next().await {
            let event = match event {
                Ok(watcher::Event::Init) => {
                    debug!(%kind, "watch (re)listing");
                    cache.begin_relist();
                    continue;
                }
                Ok(watcher::Event::InitApply(obj)) => {
                    cache.seed(T::convert(&obj));
                    continue;
                }
                Ok(watcher::Event::InitDone) => {
                    let dropped = cache.finish_relist();
                    info!(%kind, cached = cache.seen.len(), dropped, "watch initialised");
                    continue;
                }
                Ok(watcher::Event::Apply(obj)) => cache.apply(T::convert(&obj)),
                Ok(watcher::Event::Delete(obj)) => cache.delete(T::convert(&obj)),
                Err(e) => {
                    warn!(%kind, error = %e, "watch error, retrying");
                    continue;
                }
            };
            if tx.send(event).is_err() {
                debug!(%kind, "event receiver dropped, stopping watch");
                return;
            }
        }
        warn!(%kind, "watch stream ended");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        CSIPersistentVolumeSource, ObjectReference, PersistentVolumeClaimSpec,
        PersistentVolumeClaimStatus, PersistentVolumeClaimVolumeSource, PersistentVolumeSpec,
        PersistentVolumeStatus, PodSpec, PodStatus, Volume,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use kube::api::ObjectMeta;

    #[test]
    fn quantities() {
        assert_eq!(parse_quantity("10Gi"), Some(10 << 30));
        assert_eq!(parse_quantity("512Mi"), Some(512 << 20));
        assert_eq!(parse_quantity("1T"), Some(1_000_000_000_000));
        assert_eq!(parse_quantity("1500k"), Some(1_500_000));
        assert_eq!(parse_quantity("1.5Gi"), Some(3 << 29));
        assert_eq!(parse_quantity("4096"), Some(4096));
        assert_eq!(parse_quantity("lots"), None);
    }

    #[test]
    fn persistent_volume_conversion() {
        let pv = PersistentVolume {
            metadata: ObjectMeta {
                name: Some("pv-1".into()),
                labels: Some(BTreeMap::from([("app".to_owned(), "db".to_owned())])),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                csi: Some(CSIPersistentVolumeSource {
                    driver: "csi.vsphere.vmware.com".into(),
                    volume_handle: "fcd-1".into(),
                    ..Default::default()
                }),
                claim_ref: Some(ObjectReference {
                    namespace: Some("default".into()),
                    name: Some("data".into()),
                    ..Default::default()
                }),
                capacity: Some(BTreeMap::from([(
                    "storage".to_owned(),
                    Quantity("2Gi".into()),
                )])),
                persistent_volume_reclaim_policy: Some("Retain".into()),
                storage_class_name: Some("fast".into()),
                ..Default::default()
            }),
            status: Some(PersistentVolumeStatus {
                phase: Some("Bound".into()),
                ..Default::default()
            }),
        };

        let volume = volume_from(&pv);
        assert_eq!(volume.volume_handle, "fcd-1");
        assert_eq!(volume.phase, VolumePhase::Bound);
        assert_eq!(volume.reclaim_policy, ReclaimPolicy::Retain);
        assert_eq!(volume.capacity_bytes, 2 << 30);
        assert_eq!(volume.claim_ref.unwrap().key(), "default/data");
        assert_eq!(volume.labels.get("app").map(String::as_str), Some("db"));
    }

    #[test]
    fn non_csi_volume_has_no_driver() {
        let volume = volume_from(&PersistentVolume::default());
        assert!(volume.driver.is_empty());
        assert_eq!(volume.phase, VolumePhase::Pending);
    }

    #[test]
    fn claim_and_pod_conversion() {
        let pvc = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("data".into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                volume_name: Some("pv-1".into()),
                ..Default::default()
            }),
            status: Some(PersistentVolumeClaimStatus {
                phase: Some("Bound".into()),
                ..Default::default()
            }),
        };
        let claim = claim_from(&pvc);
        assert_eq!(claim.phase, ClaimPhase::Bound);
        assert_eq!(claim.volume_name.as_deref(), Some("pv-1"));

        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("web-0".into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                volumes: Some(vec![
                    Volume {
                        name: "data".into(),
                        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                            claim_name: "data".into(),
                            read_only: None,
                        }),
                        ..Default::default()
                    },
                    Volume {
                        name: "scratch".into(),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".into()),
                ..Default::default()
            }),
        };
        let pod = pod_from(&pod);
        assert_eq!(pod.phase, PodPhase::Running);
        assert_eq!(pod.claim_names, vec!["data".to_owned()]);
    }

    #[test]
    fn watch_cache_pairs_updates_with_last_seen() {
        let mut cache = WatchCache::<OrchestratorPod>::new();
        let mut pod = OrchestratorPod {
            name: "web-0".into(),
            namespace: "default".into(),
            phase: PodPhase::Pending,
            claim_names: vec![],
        };
        cache.seed(pod.clone());

        pod.phase = PodPhase::Running;
        match cache.apply(pod.clone()) {
            ClusterEvent::PodUpdated { old, new } => {
                assert_eq!(old.phase, PodPhase::Pending);
                assert_eq!(new.phase, PodPhase::Running);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(cache.delete(pod.clone()), ClusterEvent::PodDeleted(_)));
        assert!(matches!(cache.apply(pod), ClusterEvent::PodAdded(_)));
    }

    #[test]
    fn relist_forgets_objects_deleted_while_disconnected() {
        let pod = |name: &str| OrchestratorPod {
            name: name.into(),
            namespace: "default".into(),
            phase: PodPhase::Running,
            claim_names: vec!["data".into()],
        };
        let mut cache = WatchCache::<OrchestratorPod>::new();
        cache.begin_relist();
        cache.seed(pod("web-0"));
        cache.seed(pod("web-1"));
        assert_eq!(cache.finish_relist(), 0);
        assert_eq!(cache.seen.len(), 2);

        // web-0 was deleted while the watch was down; only web-1 is re-listed.
        cache.begin_relist();
        cache.seed(pod("web-1"));
        assert_eq!(cache.seen.len(), 2);
        assert_eq!(cache.finish_relist(), 1);
        assert_eq!(cache.seen.len(), 1);

        // A recreated web-0 is new again and web-1 still pairs with its last copy.
        assert!(matches!(cache.apply(pod("web-0")), ClusterEvent::PodAdded(_)));
        assert!(matches!(
            cache.apply(pod("web-1")),
            ClusterEvent::PodUpdated { .. }
        ));

        // An empty re-list clears the cache.
        cache.begin_relist();
        assert_eq!(cache.finish_relist(), 2);
        assert!(cache.seen.is_empty());
    }
}
