//! Decoration controller: the primary control loop.
//!
//! Triggered by Decoration changes, by pod events mapped through the spec
//! selectors of the namespace, and by GroupSet events mapped through status
//! details. One reconcile derives revisions, resolves group effectiveness,
//! refreshes the strategy cache, and republishes status.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, error, info, warn};

use super::anno::{get_decoration_group_revision_info, group_revision};
use super::crd::{
    Decoration, DecorationPodInfo, DecorationStatus, DecorationWorkloadDetail, GroupSet,
    FINALIZER_NAME,
};
use super::expectations::ResourceVersionExpectation;
use super::group::{heaviest_in_group, GroupIndex};
use super::revision::{construct_revisions, ApiRevisionClient, ConstructedRevisions};
use super::selector::spec_selector_matches;
use super::strategy::{
    is_pod_ready, list_selected_pods, owning_group_set, ApiInstanceRegistry, StrategyCache,
};
use crate::config::OperatorConfig;
use crate::error::{Error, Result};

/// Shared state handed to every reconcile.
pub struct Context {
    pub client: Client,
    pub cache: Arc<StrategyCache>,
    pub group_index: Arc<GroupIndex>,
    pub config: OperatorConfig,
    revisions: ApiRevisionClient,
    registry: ApiInstanceRegistry,
    expectations: ResourceVersionExpectation,
}

impl Context {
    pub fn new(client: Client, cache: Arc<StrategyCache>, config: OperatorConfig) -> Self {
        Self {
            revisions: ApiRevisionClient::new(client.clone()),
            registry: ApiInstanceRegistry::new(client.clone()),
            expectations: ResourceVersionExpectation::new(),
            group_index: Arc::new(GroupIndex::new()),
            client,
            cache,
            config,
        }
    }
}

/// Main reconciliation logic for Decoration resources.
pub async fn reconcile_decoration(
    decoration: Arc<Decoration>,
    ctx: Arc<Context>,
) -> Result<Action> {
    let namespace = decoration
        .namespace()
        .ok_or_else(|| Error::InvalidSpec("namespace required".to_string()))?;
    let name = decoration.name_any();
    let key = format!("{namespace}/{name}");
    debug!(%key, "reconciling decoration");

    let api: Api<Decoration> = Api::namespaced(ctx.client.clone(), &namespace);
    let instance = match api.get(&name).await {
        Ok(instance) => instance,
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            // Created revisions are garbage collected through the owner
            // reference; only the in-process state needs dropping.
            ctx.cache.delete(&namespace, &name);
            ctx.group_index.forget(&namespace, &name);
            ctx.expectations.delete(&key);
            info!(%key, "decoration gone, dropped manager");
            return Ok(Action::await_change());
        }
        Err(err) => return Err(err.into()),
    };

    if !ctx
        .expectations
        .satisfied(&key, &instance.resource_version().unwrap_or_default())
    {
        debug!(%key, "status write not yet observed, requeueing");
        return Ok(Action::requeue(Duration::from_secs(
            ctx.config.gate_requeue_secs,
        )));
    }

    let deleting = instance.metadata.deletion_timestamp.is_some();
    if deleting && is_escaped(&instance) {
        clear_protection(&api, &instance).await?;
        ctx.cache.delete(&namespace, &name);
        ctx.group_index.forget(&namespace, &name);
        ctx.expectations.delete(&key);
        info!(%key, "all pods shed decoration content, released finalizer");
        return Ok(Action::await_change());
    }
    if !deleting {
        protect(&api, &instance).await?;
    }

    let constructed = construct_revisions(&ctx.revisions, &instance).await?;

    ctx.group_index
        .observe(&namespace, &name, instance.group());
    let is_effective = resolve_effectiveness(&ctx, &instance, &namespace).await?;

    let pods = list_selected_pods(&ctx.client, &instance).await?;
    let affected = affected_workloads(&ctx.client, &instance, &pods).await?;

    let new_status = calculate_status(&instance, &constructed, is_effective, &affected);

    // The manager must see the freshly derived revisions, not the stale
    // status still on the API object.
    let mut snapshot = instance.clone();
    snapshot.status = Some(new_status.clone());
    ctx.cache
        .refresh(&snapshot, &pods, &ctx.registry)
        .await?;

    update_status(&api, &ctx, &key, instance, new_status).await?;

    Ok(Action::requeue(Duration::from_secs(ctx.config.resync_secs)))
}

/// Winner of the decoration's group in its namespace, compared by
/// (weight desc, creation asc, name asc). The namespace listing is served by
/// the group index consumers in-process; against the API we list and filter.
async fn resolve_effectiveness(
    ctx: &Context,
    instance: &Decoration,
    namespace: &str,
) -> Result<bool> {
    if instance.metadata.deletion_timestamp.is_some() {
        return Ok(false);
    }
    let api: Api<Decoration> = Api::namespaced(ctx.client.clone(), namespace);
    let list = api.list(&ListParams::default()).await?;
    let heaviest = heaviest_in_group(list.items.iter(), instance.group());
    Ok(heaviest.is_none_or(|winner| winner.name_any() == instance.name_any()))
}

/// Pods grouped under each affected GroupSet. A GroupSet is affected when it
/// owns a matched pod or when its template labels satisfy the selector.
async fn affected_workloads(
    client: &Client,
    instance: &Decoration,
    pods: &[Pod],
) -> Result<BTreeMap<String, Vec<Pod>>> {
    let mut affected: BTreeMap<String, Vec<Pod>> = BTreeMap::new();
    for pod in pods {
        let Some(owner) = owning_group_set(pod) else {
            continue;
        };
        affected.entry(owner).or_default().push(pod.clone());
    }

    let namespace = instance.metadata.namespace.clone().unwrap_or_default();
    let api: Api<GroupSet> = Api::namespaced(client.clone(), &namespace);
    for group_set in api.list(&ListParams::default()).await?.items {
        let template_labels = group_set
            .spec
            .template
            .as_ref()
            .and_then(|t| t.metadata.as_ref())
            .and_then(|m| m.labels.clone())
            .unwrap_or_default();
        if spec_selector_matches(instance.spec.selector.as_ref(), &template_labels) {
            affected.entry(group_set.name_any()).or_default();
        }
    }
    Ok(affected)
}

/// Aggregates the published status from the derived revisions and the pod
/// annotations. Promotion happens here: once every matched pod advertises
/// the updated revision, current catches up to it.
fn calculate_status(
    instance: &Decoration,
    constructed: &ConstructedRevisions,
    is_effective: bool,
    affected: &BTreeMap<String, Vec<Pod>>,
) -> DecorationStatus {
    let group = instance.group();
    let name = instance.name_any();

    let mut status = DecorationStatus {
        observed_generation: instance.metadata.generation.unwrap_or(0),
        current_revision: constructed.current.clone(),
        updated_revision: constructed.updated.clone(),
        collision_count: constructed.collision_count,
        is_effective: Some(is_effective),
        ..Default::default()
    };

    for (group_set, pods) in affected {
        let mut detail = DecorationWorkloadDetail {
            group_set: group_set.clone(),
            affected_replicas: pods.len() as i32,
            ..Default::default()
        };
        status.matched_pods += pods.len() as i32;
        for pod in pods {
            let info = get_decoration_group_revision_info(pod);
            let mut pod_info = DecorationPodInfo {
                name: pod.name_any(),
                ..Default::default()
            };
            match group_revision(&info, group, &name) {
                Some(revision) => {
                    pod_info.revision = revision.to_string();
                    if revision == constructed.updated {
                        status.updated_pods += 1;
                        if is_pod_ready(pod) {
                            status.updated_ready_pods += 1;
                        }
                    }
                }
                None => pod_info.is_not_injected = true,
            }
            detail.pods.push(pod_info);
        }
        status.details.push(detail);
    }

    if status.updated_pods == status.matched_pods {
        status.current_revision = status.updated_revision.clone();
    }
    status
}

/// Writes status when changed and registers the resulting resourceVersion
/// with the status-up-to-date gate. Conflicts retry on a fresh read.
async fn update_status(
    api: &Api<Decoration>,
    ctx: &Context,
    key: &str,
    mut instance: Decoration,
    status: DecorationStatus,
) -> Result<()> {
    if instance.status.as_ref() == Some(&status) {
        return Ok(());
    }
    let name = instance.name_any();
    let mut attempts = 0;
    loop {
        instance.status = Some(status.clone());
        let body = serde_json::to_vec(&instance)?;
        match api
            .replace_status(&name, &Default::default(), body)
            .await
        {
            Ok(written) => {
                if let Some(rv) = written.resource_version() {
                    ctx.expectations.expect_update(key, &rv);
                }
                debug!(%key, "status updated");
                return Ok(());
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 && attempts < 5 => {
                attempts += 1;
                instance = api.get(&name).await?;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Escaped: no pod in status still advertises any of this Decoration's
/// revisions, so deletion may proceed.
fn is_escaped(decoration: &Decoration) -> bool {
    decoration
        .status
        .as_ref()
        .map(|status| {
            status
                .details
                .iter()
                .all(|detail| detail.pods.iter().all(|pod| pod.is_not_injected))
        })
        .unwrap_or(true)
}

async fn protect(api: &Api<Decoration>, decoration: &Decoration) -> Result<()> {
    let mut finalizers = decoration.finalizers().to_vec();
    if finalizers.iter().any(|f| f == FINALIZER_NAME) {
        return Ok(());
    }
    finalizers.push(FINALIZER_NAME.to_string());
    patch_finalizers(api, decoration, finalizers).await
}

async fn clear_protection(api: &Api<Decoration>, decoration: &Decoration) -> Result<()> {
    let finalizers: Vec<String> = decoration
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != FINALIZER_NAME)
        .cloned()
        .collect();
    if finalizers.len() == decoration.finalizers().len() {
        return Ok(());
    }
    patch_finalizers(api, decoration, finalizers).await
}

async fn patch_finalizers(
    api: &Api<Decoration>,
    decoration: &Decoration,
    finalizers: Vec<String>,
) -> Result<()> {
    let patch = serde_json::json!({"metadata": {"finalizers": finalizers}});
    api.patch(
        &decoration.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

// ==================== Event mappers ====================

/// A pod event reconciles every Decoration of its namespace whose spec
/// selector matches the pod labels.
pub fn map_pod_to_decorations(cache: &StrategyCache, pod: &Pod) -> Vec<ObjectRef<Decoration>> {
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    let labels = pod.metadata.labels.clone().unwrap_or_default();
    cache
        .latest(&namespace)
        .into_iter()
        .filter(|decoration| spec_selector_matches(decoration.spec.selector.as_ref(), &labels))
        .map(|decoration| ObjectRef::new(&decoration.name_any()).within(&namespace))
        .collect()
}

/// A GroupSet event reconciles every Decoration currently claiming it in
/// status, plus any whose selector matches the template labels (a template
/// edit can newly attract a Decoration).
pub fn map_group_set_to_decorations(
    cache: &StrategyCache,
    group_set: &GroupSet,
) -> Vec<ObjectRef<Decoration>> {
    let namespace = group_set.metadata.namespace.clone().unwrap_or_default();
    let name = group_set.name_any();
    let template_labels = group_set
        .spec
        .template
        .as_ref()
        .and_then(|t| t.metadata.as_ref())
        .and_then(|m| m.labels.clone())
        .unwrap_or_default();
    cache
        .latest(&namespace)
        .into_iter()
        .filter(|decoration| {
            let claims = decoration
                .status
                .as_ref()
                .is_some_and(|s| s.details.iter().any(|d| d.group_set == name));
            claims
                || spec_selector_matches(decoration.spec.selector.as_ref(), &template_labels)
        })
        .map(|decoration| ObjectRef::new(&decoration.name_any()).within(&namespace))
        .collect()
}

// ==================== Controller runner ====================

/// Error handler for the controller.
fn error_policy(_decoration: Arc<Decoration>, err: &Error, ctx: Arc<Context>) -> Action {
    error!(%err, "reconciliation error");
    Action::requeue(Duration::from_secs(ctx.config.error_requeue_secs))
}

/// Starts the Decoration controller and blocks until the watch streams end.
pub async fn run_decoration_controller(ctx: Arc<Context>) -> Result<()> {
    let decorations: Api<Decoration> = Api::all(ctx.client.clone());
    let pods: Api<Pod> = Api::all(ctx.client.clone());
    let group_sets: Api<GroupSet> = Api::all(ctx.client.clone());

    info!("starting decoration controller");

    let pod_cache = ctx.cache.clone();
    let group_set_cache = ctx.cache.clone();
    Controller::new(decorations, WatcherConfig::default())
        .watches(pods, WatcherConfig::default(), move |pod: Pod| {
            map_pod_to_decorations(&pod_cache, &pod)
        })
        .watches(
            group_sets,
            WatcherConfig::default(),
            move |group_set: GroupSet| map_group_set_to_decorations(&group_set_cache, &group_set),
        )
        .run(reconcile_decoration, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _action)) => debug!(?obj, "reconciled"),
                Err(err) => warn!(%err, "reconciliation failed"),
            }
        })
        .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::crd::DecorationSpec;
    use crate::operator::strategy::FakeInstanceRegistry;
    use crate::operator::testutil::{decoration_with_selector, groupset_pod};

    fn constructed(current: &str, updated: &str) -> ConstructedRevisions {
        ConstructedRevisions {
            current: current.to_string(),
            updated: updated.to_string(),
            histories: vec![],
            collision_count: 0,
        }
    }

    #[test]
    fn status_counts_updated_and_not_injected() {
        let d = decoration_with_selector("dec", "g", &[("app", "foo")]);
        let injected = groupset_pod(
            "pod-a",
            "ws",
            "0",
            &[("app", "foo")],
            Some(("g", "dec", "dec-r2")),
        );
        let stale = groupset_pod(
            "pod-b",
            "ws",
            "1",
            &[("app", "foo")],
            Some(("g", "dec", "dec-r1")),
        );
        let bare = groupset_pod("pod-c", "ws", "2", &[("app", "foo")], None);
        let affected: BTreeMap<String, Vec<Pod>> =
            [("ws".to_string(), vec![injected, stale, bare])].into();

        let status = calculate_status(&d, &constructed("dec-r1", "dec-r2"), true, &affected);
        assert_eq!(status.matched_pods, 3);
        assert_eq!(status.updated_pods, 1);
        assert_eq!(status.is_effective, Some(true));
        // Rollout incomplete: current not promoted.
        assert_eq!(status.current_revision, "dec-r1");
        let detail = &status.details[0];
        assert_eq!(detail.group_set, "ws");
        assert_eq!(detail.affected_replicas, 3);
        assert!(detail.pods.iter().any(|p| p.is_not_injected));
    }

    #[test]
    fn status_promotes_current_when_rollout_complete() {
        let d = decoration_with_selector("dec", "g", &[("app", "foo")]);
        let pod = groupset_pod(
            "pod-a",
            "ws",
            "0",
            &[("app", "foo")],
            Some(("g", "dec", "dec-r2")),
        );
        let affected: BTreeMap<String, Vec<Pod>> = [("ws".to_string(), vec![pod])].into();

        let status = calculate_status(&d, &constructed("dec-r1", "dec-r2"), true, &affected);
        assert_eq!(status.updated_pods, 1);
        assert_eq!(status.current_revision, "dec-r2");
    }

    #[test]
    fn escape_requires_every_pod_shed() {
        let mut d = decoration_with_selector("dec", "g", &[("app", "foo")]);
        assert!(is_escaped(&d));

        d.status = Some(DecorationStatus {
            details: vec![DecorationWorkloadDetail {
                group_set: "ws".into(),
                pods: vec![
                    DecorationPodInfo {
                        name: "pod-a".into(),
                        is_not_injected: true,
                        ..Default::default()
                    },
                    DecorationPodInfo {
                        name: "pod-b".into(),
                        revision: "dec-r1".into(),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }],
            ..Default::default()
        });
        assert!(!is_escaped(&d));

        d.status.as_mut().unwrap().details[0].pods[1] = DecorationPodInfo {
            name: "pod-b".into(),
            is_not_injected: true,
            ..Default::default()
        };
        assert!(is_escaped(&d));
    }

    #[tokio::test]
    async fn pod_mapper_enqueues_matching_decorations() {
        let cache = StrategyCache::new();
        let registry = FakeInstanceRegistry::new();
        let foo = decoration_with_selector("foo-dec", "g1", &[("app", "foo")]);
        let bar = decoration_with_selector("bar-dec", "g2", &[("app", "bar")]);
        cache.refresh(&foo, &[], &registry).await.unwrap();
        cache.refresh(&bar, &[], &registry).await.unwrap();

        let pod = groupset_pod("pod-a", "ws", "0", &[("app", "foo")], None);
        let refs = map_pod_to_decorations(&cache, &pod);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "foo-dec");
    }

    #[tokio::test]
    async fn group_set_mapper_enqueues_claiming_decorations() {
        let cache = StrategyCache::new();
        let registry = FakeInstanceRegistry::new();
        let mut claiming = decoration_with_selector("claiming", "g1", &[("app", "other")]);
        claiming.status = Some(DecorationStatus {
            details: vec![DecorationWorkloadDetail {
                group_set: "ws".into(),
                ..Default::default()
            }],
            ..Default::default()
        });
        let unrelated = decoration_with_selector("unrelated", "g2", &[("app", "other")]);
        cache.refresh(&claiming, &[], &registry).await.unwrap();
        cache.refresh(&unrelated, &[], &registry).await.unwrap();

        let mut group_set = GroupSet::new("ws", Default::default());
        group_set.metadata.namespace = Some("default".into());
        let refs = map_group_set_to_decorations(&cache, &group_set);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "claiming");
    }

    #[test]
    fn validating_default_spec_parses() {
        // Spec defaults round-trip through serde the way the API server
        // would hand them back.
        let raw = serde_json::json!({
            "selector": {"matchLabels": {"app": "foo"}},
            "injectStrategy": {"group": "g", "weight": 10}
        });
        let spec: DecorationSpec = serde_json::from_value(raw).unwrap();
        assert_eq!(spec.history_limit, 20);
        assert_eq!(spec.inject_strategy.weight, Some(10));
        assert!(spec.update_strategy.rolling_update.is_none());
    }
}
