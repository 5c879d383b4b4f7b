//! Shared fixtures for the in-crate tests.

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};

use super::anno::DecorationInfo;
use super::crd::{
    Decoration, DecorationSpec, ANNOTATION_DECORATION_REVISIONS, GROUPSET_KIND, LABEL_INSTANCE_ID,
};

/// Decoration in the default namespace with a matchLabels selector.
pub fn decoration_with_selector(name: &str, group: &str, labels: &[(&str, &str)]) -> Decoration {
    let mut d = Decoration::new(name, DecorationSpec::default());
    d.metadata.namespace = Some("default".into());
    d.metadata.uid = Some(format!("uid-{name}"));
    d.spec.inject_strategy.group = group.to_string();
    d.spec.selector = Some(LabelSelector {
        match_labels: Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ),
        ..Default::default()
    });
    d
}

/// Pod owned by a GroupSet, carrying an instance identity and optionally a
/// decoration revision annotation for one (group, decoration) pair.
pub fn groupset_pod(
    name: &str,
    group_set: &str,
    instance_id: &str,
    labels: &[(&str, &str)],
    advertised: Option<(&str, &str, &str)>,
) -> Pod {
    let mut pod = Pod::default();
    pod.metadata.name = Some(name.to_string());
    pod.metadata.namespace = Some("default".into());
    let pod_labels = pod.metadata.labels.get_or_insert_with(Default::default);
    for (k, v) in labels {
        pod_labels.insert(k.to_string(), v.to_string());
    }
    pod_labels.insert(LABEL_INSTANCE_ID.to_string(), instance_id.to_string());
    pod.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "apps.groupset.dev/v1alpha1".into(),
        kind: GROUPSET_KIND.into(),
        name: group_set.to_string(),
        uid: format!("uid-{group_set}"),
        controller: Some(true),
        ..Default::default()
    }]);
    if let Some((group, decoration, revision)) = advertised {
        let info: super::anno::DecorationGroupRevisionInfo = [(
            group.to_string(),
            DecorationInfo {
                name: decoration.to_string(),
                revision: revision.to_string(),
            },
        )]
        .into();
        pod.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(
                ANNOTATION_DECORATION_REVISIONS.to_string(),
                serde_json::to_string(&info).unwrap(),
            );
    }
    pod
}
