//! Per-decoration rollout managers and the process-wide strategy cache.
//!
//! The cache is the read-side API the pod-admission and workload paths query
//! synchronously: "which decoration revisions must this pod carry right now?"
//! Each Decoration gets one manager tracking its selected pods and the
//! per-pod target revision under the configured rolling policy.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::anno::{get_decoration_group_revision_info, group_revision};
use super::crd::{Decoration, DecorationSpec, GroupSet, GROUPSET_KIND, LABEL_INSTANCE_ID};
use super::selector::{selector_matches, spec_selector_matches};
use crate::error::{Error, Result};

/// How often readiness and the sweep re-check their condition.
const SYNCED_POLL_PERIOD: Duration = Duration::from_millis(200);

// ==================== Pod predicates ====================

/// A pod counts as alive until it is deleted or reaches a terminal phase.
pub fn is_pod_active(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("");
    phase != "Succeeded" && phase != "Failed"
}

/// Ready condition is True.
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Name of the GroupSet controlling this pod.
pub fn owning_group_set(pod: &Pod) -> Option<String> {
    pod.metadata.owner_references.as_ref().and_then(|refs| {
        refs.iter()
            .find(|r| r.controller == Some(true) && r.kind == GROUPSET_KIND)
            .map(|r| r.name.clone())
    })
}

// ==================== Instance registry ====================

/// Lookup of the instance identities a workload currently holds allocated.
/// The operator reads GroupSet status; tests substitute the fake.
#[async_trait]
pub trait InstanceRegistry: Send + Sync {
    async fn allocated_ids(&self, namespace: &str, group_set: &str) -> Result<HashSet<String>>;
}

/// InstanceRegistry over the cluster API.
pub struct ApiInstanceRegistry {
    client: Client,
}

impl ApiInstanceRegistry {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl InstanceRegistry for ApiInstanceRegistry {
    async fn allocated_ids(&self, namespace: &str, group_set: &str) -> Result<HashSet<String>> {
        let api: Api<GroupSet> = Api::namespaced(self.client.clone(), namespace);
        let gs = api.get(group_set).await?;
        Ok(gs
            .status
            .map(|s| s.allocated_ids.into_iter().collect())
            .unwrap_or_default())
    }
}

/// In-memory InstanceRegistry for tests.
#[derive(Default)]
pub struct FakeInstanceRegistry {
    allocated: std::sync::Mutex<HashMap<(String, String), HashSet<String>>>,
}

impl FakeInstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_allocated<I: IntoIterator<Item = String>>(
        &self,
        namespace: &str,
        group_set: &str,
        ids: I,
    ) {
        self.allocated.lock().unwrap().insert(
            (namespace.to_string(), group_set.to_string()),
            ids.into_iter().collect(),
        );
    }
}

#[async_trait]
impl InstanceRegistry for FakeInstanceRegistry {
    async fn allocated_ids(&self, namespace: &str, group_set: &str) -> Result<HashSet<String>> {
        Ok(self
            .allocated
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), group_set.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

// ==================== Pod views ====================

/// Snapshot of the pod fields the manager needs. Copies, never references
/// into a shared informer cache.
#[derive(Debug, Clone)]
pub struct PodView {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    /// Owning GroupSet name.
    pub group_set: String,
    /// Stable per-slot identity from the instance-id label.
    pub instance_id: String,
    /// Revision the pod advertises for this decoration, empty if none.
    pub revision: String,
    /// Pod is gone but its instance identity is still allocated, so a
    /// replacement is expected to reappear under the same identity.
    pub is_deleted: bool,
}

impl PodView {
    fn from_pod(pod: &Pod, decoration: &Decoration) -> Result<Self> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let group_set =
            owning_group_set(pod).ok_or_else(|| Error::NotGroupSetPod(name.clone()))?;
        let labels = pod.metadata.labels.clone().unwrap_or_default();
        let info = get_decoration_group_revision_info(pod);
        let revision = group_revision(
            &info,
            decoration.group(),
            decoration.metadata.name.as_deref().unwrap_or(""),
        )
        .unwrap_or("")
        .to_string();
        Ok(Self {
            instance_id: labels.get(LABEL_INSTANCE_ID).cloned().unwrap_or_default(),
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            name,
            labels,
            group_set,
            revision,
            is_deleted: false,
        })
    }

    /// Identity key: the stable instance identity when present, otherwise the
    /// pod name (a pod without the label can never be tombstoned).
    fn instance_key(&self) -> &str {
        if self.instance_id.is_empty() {
            &self.name
        } else {
            &self.instance_id
        }
    }
}

/// Closed set of rollout gates; exactly one is active per Decoration.
#[derive(Debug, Clone)]
enum RolloutMode {
    /// Every matched pod gets the updated revision.
    All,
    /// The selector chooses which matched pods roll forward.
    BySelector(LabelSelector),
    /// The N least-recently-updated pods stay on the current revision.
    ByPartition(usize),
}

fn rollout_mode(spec: &DecorationSpec) -> RolloutMode {
    match &spec.update_strategy.rolling_update {
        None => RolloutMode::All,
        Some(rolling) => {
            if let Some(selector) = &rolling.selector {
                RolloutMode::BySelector(selector.clone())
            } else if let Some(partition) = rolling.partition {
                RolloutMode::ByPartition(partition.max(0) as usize)
            } else {
                RolloutMode::All
            }
        }
    }
}

// ==================== Per-decoration manager ====================

/// Tracks one Decoration's selected pods and their target revisions.
/// Only the cache can reach it for mutation.
pub struct DecorationManager {
    namespace: String,
    state: RwLock<ManagerState>,
}

#[derive(Default)]
struct ManagerState {
    latest: Option<Decoration>,
    pod_views: HashMap<String, PodView>,
    partition_old_pods: HashSet<String>,
}

impl DecorationManager {
    fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            state: RwLock::new(ManagerState::default()),
        }
    }

    /// Rebuilds the selected-pod set from a consistent (decoration, pods)
    /// view. Registry lookups happen before the write lock is taken.
    async fn refresh(
        &self,
        decoration: &Decoration,
        pods: &[Pod],
        registry: &dyn InstanceRegistry,
    ) -> Result<()> {
        let old_views: HashMap<String, PodView> = {
            let state = self.state.read().unwrap();
            state.pod_views.clone()
        };

        let mut new_views: HashMap<String, PodView> = HashMap::new();
        let mut seen_instances: HashSet<String> = HashSet::new();
        for pod in pods.iter().filter(|p| is_pod_active(p)) {
            let pod_name = pod.metadata.name.clone().unwrap_or_default();
            let view = match old_views.get(&pod_name) {
                Some(known) => known.clone(),
                None => PodView::from_pod(pod, decoration)?,
            };
            seen_instances.insert(view.instance_key().to_string());
            new_views.insert(pod_name, view);
        }

        // A vanished pod stays as a tombstone while its identity is still
        // allocated and the selector still covers it; the workload will
        // recreate a pod under the same identity.
        let mut allocated_cache: HashMap<String, HashSet<String>> = HashMap::new();
        for (pod_name, view) in &old_views {
            if new_views.contains_key(pod_name) || seen_instances.contains(view.instance_key()) {
                continue;
            }
            if view.instance_id.is_empty() {
                continue;
            }
            if !spec_selector_matches(decoration.spec.selector.as_ref(), &view.labels) {
                continue;
            }
            if !allocated_cache.contains_key(&view.group_set) {
                let ids = registry
                    .allocated_ids(&self.namespace, &view.group_set)
                    .await?;
                allocated_cache.insert(view.group_set.clone(), ids);
            }
            if allocated_cache[&view.group_set].contains(&view.instance_id) {
                let mut tombstone = view.clone();
                tombstone.is_deleted = true;
                new_views.insert(pod_name.clone(), tombstone);
            }
        }

        let partition_old_pods = match rollout_mode(&decoration.spec) {
            RolloutMode::ByPartition(partition) => {
                partition_old_revision_pods(&new_views, decoration.updated_revision(), partition)
            }
            _ => HashSet::new(),
        };

        let mut state = self.state.write().unwrap();
        state.latest = Some(decoration.clone());
        state.pod_views = new_views;
        state.partition_old_pods = partition_old_pods;
        Ok(())
    }

    /// Resolves the revision this pod must carry for this Decoration, and
    /// whether that is the updated one. None when the Decoration does not
    /// apply to the pod.
    pub fn target_revision_for(&self, pod: &Pod) -> Option<(String, bool)> {
        let state = self.state.read().unwrap();
        let latest = state.latest.as_ref()?;
        let labels = pod.metadata.labels.clone().unwrap_or_default();
        if !spec_selector_matches(latest.spec.selector.as_ref(), &labels) {
            return None;
        }
        let updated = latest.updated_revision().to_string();
        let current = latest.current_revision().to_string();
        match rollout_mode(&latest.spec) {
            RolloutMode::All => Some((updated, true)),
            RolloutMode::BySelector(selector) => {
                if selector_matches(&selector, &labels) {
                    Some((updated, true))
                } else {
                    Some((current, false))
                }
            }
            RolloutMode::ByPartition(_) => {
                let pod_name = pod.metadata.name.as_deref().unwrap_or("");
                if state.partition_old_pods.contains(pod_name) {
                    Some((current, false))
                } else {
                    Some((updated, true))
                }
            }
        }
    }

    /// Latest decoration snapshot held by this manager.
    pub fn latest(&self) -> Option<Decoration> {
        self.state.read().unwrap().latest.clone()
    }

    /// Names of pods held back on the current revision by the partition.
    pub fn partition_old_pods(&self) -> HashSet<String> {
        self.state.read().unwrap().partition_old_pods.clone()
    }

    /// Current pod views, for status aggregation and tests.
    pub fn pod_views(&self) -> Vec<PodView> {
        self.state.read().unwrap().pod_views.values().cloned().collect()
    }
}

/// Stable update order: pods already on the updated revision first, then by
/// name; the trailing `partition` pods stay on current.
fn partition_old_revision_pods(
    views: &HashMap<String, PodView>,
    updated_revision: &str,
    partition: usize,
) -> HashSet<String> {
    let mut ordered: Vec<&PodView> = views.values().collect();
    ordered.sort_by(|a, b| {
        let a_updated = !updated_revision.is_empty() && a.revision == updated_revision;
        let b_updated = !updated_revision.is_empty() && b.revision == updated_revision;
        b_updated
            .cmp(&a_updated)
            .then_with(|| a.name.cmp(&b.name))
    });
    let keep = ordered.len().saturating_sub(partition);
    ordered[keep..]
        .iter()
        .map(|view| view.name.clone())
        .collect()
}

// ==================== Strategy cache ====================

/// Process-wide registry namespace -> Decoration name -> manager, plus the
/// initial-sync gate. Constructed once and passed explicitly to the
/// reconciler and admission paths; tests substitute their own instance.
#[derive(Default)]
pub struct StrategyCache {
    managers: RwLock<HashMap<String, HashMap<String, Arc<DecorationManager>>>>,
    synced: AtomicBool,
}

impl StrategyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent for a given (decoration snapshot, pod set).
    pub async fn refresh(
        &self,
        decoration: &Decoration,
        pods: &[Pod],
        registry: &dyn InstanceRegistry,
    ) -> Result<()> {
        let manager = self.manager_for(decoration);
        manager.refresh(decoration, pods, registry).await
    }

    /// Drops the manager of a deleted Decoration.
    pub fn delete(&self, namespace: &str, name: &str) {
        let mut managers = self.managers.write().unwrap();
        if let Some(namespaced) = managers.get_mut(namespace) {
            namespaced.remove(name);
            if namespaced.is_empty() {
                managers.remove(namespace);
            }
        }
    }

    /// Most recent Decoration snapshots known for a namespace.
    pub fn latest(&self, namespace: &str) -> Vec<Decoration> {
        let managers = self.managers.read().unwrap();
        managers
            .get(namespace)
            .map(|namespaced| {
                namespaced
                    .values()
                    .filter_map(|manager| manager.latest())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Manager for one decoration, if present.
    pub fn manager(&self, namespace: &str, name: &str) -> Option<Arc<DecorationManager>> {
        self.managers
            .read()
            .unwrap()
            .get(namespace)
            .and_then(|namespaced| namespaced.get(name))
            .cloned()
    }

    /// Revision maps for a pod: decoration name -> revision, split into the
    /// updated revisions (pods targeted by the ongoing rollout) and the
    /// stable ones. Empty until the startup sweep has completed.
    pub fn effective_revisions(
        &self,
        pod: &Pod,
    ) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
        let mut updated = BTreeMap::new();
        let mut stable = BTreeMap::new();
        if !self.has_synced() {
            return (updated, stable);
        }
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let namespaced: Vec<(String, Arc<DecorationManager>)> = {
            let managers = self.managers.read().unwrap();
            managers
                .get(&namespace)
                .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default()
        };
        for (name, manager) in namespaced {
            let Some((revision, is_updated)) = manager.target_revision_for(pod) else {
                continue;
            };
            if revision.is_empty() {
                continue;
            }
            if is_updated {
                updated.insert(name, revision);
            } else {
                stable.insert(name, revision);
            }
        }
        (updated, stable)
    }

    fn manager_for(&self, decoration: &Decoration) -> Arc<DecorationManager> {
        let namespace = decoration.metadata.namespace.clone().unwrap_or_default();
        let name = decoration.metadata.name.clone().unwrap_or_default();
        let mut managers = self.managers.write().unwrap();
        let namespaced = managers.entry(namespace.clone()).or_default();
        namespaced
            .entry(name)
            .or_insert_with(|| Arc::new(DecorationManager::new(&namespace)))
            .clone()
    }

    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Marks the initial sweep complete.
    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }

    /// Blocks until the startup sweep has completed; false if cancelled first.
    pub async fn wait_ready(&self, cancel: &CancellationToken) -> bool {
        loop {
            if self.has_synced() {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(SYNCED_POLL_PERIOD) => {}
            }
        }
    }

    /// Startup sweep: enumerate every Decoration, list its pods, refresh its
    /// manager, then signal ready. Guards admission and workload logic from
    /// a cold cache.
    pub async fn start(
        &self,
        client: Client,
        registry: &dyn InstanceRegistry,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let result = self.sweep(client, registry, cancel).await;
        // Readiness is signalled even on a failed sweep; the per-key
        // reconciles will repair whatever the sweep missed.
        self.mark_synced();
        result
    }

    async fn sweep(
        &self,
        client: Client,
        registry: &dyn InstanceRegistry,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let all: Api<Decoration> = Api::all(client.clone());
        let list = all.list(&ListParams::default()).await?;
        let mut queue: std::collections::VecDeque<(String, String)> = list
            .items
            .iter()
            .filter(|d| d.metadata.deletion_timestamp.is_none())
            .filter_map(|d| Some((d.metadata.namespace.clone()?, d.metadata.name.clone()?)))
            .collect();

        while let Some((namespace, name)) = queue.pop_front() {
            if cancel.is_cancelled() {
                warn!("strategy cache sweep cancelled");
                return Ok(());
            }
            let api: Api<Decoration> = Api::namespaced(client.clone(), &namespace);
            let decoration = match api.get(&name).await {
                Ok(d) => d,
                Err(kube::Error::Api(ae)) if ae.code == 404 => continue,
                Err(err) => {
                    warn!(%namespace, %name, %err, "sweep failed to get decoration, requeueing");
                    queue.push_back((namespace, name));
                    tokio::time::sleep(SYNCED_POLL_PERIOD).await;
                    continue;
                }
            };
            let generation = decoration.metadata.generation.unwrap_or(0);
            let observed = decoration
                .status
                .as_ref()
                .map(|s| s.observed_generation)
                .unwrap_or(0);
            if generation != observed {
                info!(%namespace, %name, "waiting for decoration observedGeneration to catch up");
                queue.push_back((namespace, name));
                tokio::time::sleep(SYNCED_POLL_PERIOD).await;
                continue;
            }
            let pods = list_selected_pods(&client, &decoration).await?;
            if let Err(err) = self.refresh(&decoration, &pods, registry).await {
                warn!(%namespace, %name, %err, "sweep failed to refresh decoration manager");
            }
        }
        Ok(())
    }
}

/// Pods of the decoration's namespace matching its spec selector.
pub async fn list_selected_pods(client: &Client, decoration: &Decoration) -> Result<Vec<Pod>> {
    let namespace = decoration.metadata.namespace.clone().unwrap_or_default();
    let api: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    let pods = api.list(&ListParams::default()).await?;
    Ok(pods
        .items
        .into_iter()
        .filter(|pod| {
            spec_selector_matches(
                decoration.spec.selector.as_ref(),
                &pod.metadata.labels.clone().unwrap_or_default(),
            )
        })
        .collect())
}
