//! The decoration-revision annotation: the inter-process contract recording
//! which decoration revisions are live on a pod.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};
use tracing::error;

use super::crd::{Decoration, DecorationSpec, ANNOTATION_DECORATION_REVISIONS};
use crate::error::Result;

/// Value of one group entry in the pod annotation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DecorationInfo {
    pub name: String,
    pub revision: String,
}

/// The full annotation payload: group -> {name, revision}.
pub type DecorationGroupRevisionInfo = BTreeMap<String, DecorationInfo>;

/// Reads the revision annotation off a pod. A missing or unparseable
/// annotation yields an empty map; parse failures are logged, not propagated,
/// since a garbled annotation must not wedge reconciliation.
pub fn get_decoration_group_revision_info(pod: &Pod) -> DecorationGroupRevisionInfo {
    let Some(val) = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_DECORATION_REVISIONS))
    else {
        return DecorationGroupRevisionInfo::new();
    };
    match serde_json::from_str(val) {
        Ok(info) => info,
        Err(err) => {
            error!(
                pod = %pod.metadata.name.as_deref().unwrap_or(""),
                %err,
                "failed to unmarshal decoration revision annotation"
            );
            DecorationGroupRevisionInfo::new()
        }
    }
}

/// The revision a pod advertises for a given (group, decoration name) pair,
/// or None when the pod was never injected by that decoration.
pub fn group_revision<'a>(
    info: &'a DecorationGroupRevisionInfo,
    group: &str,
    name: &str,
) -> Option<&'a str> {
    info.get(group)
        .filter(|entry| entry.name == name)
        .map(|entry| entry.revision.as_str())
}

/// Whether the annotation records this decoration at its updated revision.
pub fn check(info: &DecorationGroupRevisionInfo, decoration: &Decoration) -> (bool, bool) {
    let name = decoration.metadata.name.as_deref().unwrap_or("");
    let exist = info
        .get(decoration.group())
        .is_some_and(|entry| entry.name == name);
    let is_latest = exist
        && info.get(decoration.group()).unwrap().revision == decoration.updated_revision();
    (exist, is_latest)
}

/// Writes the annotation for a set of effective decorations, each at its
/// updated revision. Overwrites the previous payload wholesale.
pub fn set_decoration_info(pod: &mut Pod, decorations: &[&Decoration]) {
    let mut info = DecorationGroupRevisionInfo::new();
    for decoration in decorations {
        info.insert(
            decoration.group().to_string(),
            DecorationInfo {
                name: decoration.metadata.name.clone().unwrap_or_default(),
                revision: decoration.updated_revision().to_string(),
            },
        );
    }
    let payload = serde_json::to_string(&info).unwrap_or_default();
    pod.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(ANNOTATION_DECORATION_REVISIONS.to_string(), payload);
}

/// Whether a pod's annotation is stale against the given effective
/// decorations, i.e. any of them is missing or not at its updated revision.
pub fn should_update_decoration_info(pod: &Pod, decorations: &[&Decoration]) -> bool {
    let info = get_decoration_group_revision_info(pod);
    decorations.iter().any(|decoration| {
        let (exist, is_latest) = check(&info, decoration);
        !exist || !is_latest
    })
}

/// Reconstructs a Decoration from a stored revision: the revision data holds
/// the template patch, the owner reference names the Decoration. Used by
/// admission-side collaborators to materialize the decorations a pod
/// advertises without reading live Decoration specs.
pub fn decoration_from_revision(revision: &ControllerRevision) -> Result<Decoration> {
    let data = revision
        .data
        .as_ref()
        .map(|raw| raw.0.clone())
        .unwrap_or(serde_json::Value::Null);
    let spec: WrappedSpec = serde_json::from_value(data)?;

    let owner = revision
        .metadata
        .owner_references
        .as_ref()
        .and_then(|refs| {
            refs.iter()
                .find(|r| r.controller == Some(true))
                .or_else(|| refs.first())
        })
        .map(|r| r.name.clone())
        .unwrap_or_default();

    let mut decoration = Decoration::new(&owner, spec.spec);
    decoration.metadata.namespace = revision.metadata.namespace.clone();
    Ok(decoration)
}

#[derive(Deserialize)]
struct WrappedSpec {
    spec: DecorationSpec,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::crd::DecorationStatus;

    fn decoration(name: &str, group: &str, updated: &str) -> Decoration {
        let mut d = Decoration::new(name, DecorationSpec::default());
        d.spec.inject_strategy.group = group.to_string();
        d.status = Some(DecorationStatus {
            updated_revision: updated.to_string(),
            ..Default::default()
        });
        d
    }

    #[test]
    fn round_trip() {
        let d1 = decoration("sidecar", "mesh", "sidecar-0a1b2c3d4e");
        let d2 = decoration("logger", "logging", "logger-ffeeddccbb");
        let mut pod = Pod::default();
        set_decoration_info(&mut pod, &[&d1, &d2]);

        let info = get_decoration_group_revision_info(&pod);
        assert_eq!(info.len(), 2);
        assert_eq!(
            group_revision(&info, "mesh", "sidecar"),
            Some("sidecar-0a1b2c3d4e")
        );
        assert_eq!(
            group_revision(&info, "logging", "logger"),
            Some("logger-ffeeddccbb")
        );
    }

    #[test]
    fn missing_annotation_is_empty() {
        let pod = Pod::default();
        assert!(get_decoration_group_revision_info(&pod).is_empty());
    }

    #[test]
    fn garbled_annotation_is_empty() {
        let mut pod = Pod::default();
        pod.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(ANNOTATION_DECORATION_REVISIONS.into(), "{not json".into());
        assert!(get_decoration_group_revision_info(&pod).is_empty());
    }

    #[test]
    fn group_revision_requires_matching_name() {
        let d = decoration("sidecar", "mesh", "sidecar-0a1b2c3d4e");
        let mut pod = Pod::default();
        set_decoration_info(&mut pod, &[&d]);
        let info = get_decoration_group_revision_info(&pod);
        assert_eq!(group_revision(&info, "mesh", "other"), None);
    }

    #[test]
    fn decoration_reconstructed_from_revision() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
        use k8s_openapi::apimachinery::pkg::runtime::RawExtension;

        let data = serde_json::json!({"spec": {"template": {
            "metadata": [{"patchPolicy": "Retain", "labels": {"injected": "true"}}]
        }}});
        let revision = ControllerRevision {
            metadata: kube::api::ObjectMeta {
                name: Some("sidecar-0a1b2c3d4e".into()),
                namespace: Some("default".into()),
                owner_references: Some(vec![OwnerReference {
                    api_version: "apps.groupset.dev/v1alpha1".into(),
                    kind: "Decoration".into(),
                    name: "sidecar".into(),
                    uid: "uid-1".into(),
                    controller: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            data: Some(RawExtension(data)),
            revision: 3,
        };

        let decoration = decoration_from_revision(&revision).unwrap();
        assert_eq!(decoration.metadata.name.as_deref(), Some("sidecar"));
        assert_eq!(decoration.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(
            decoration.spec.template.metadata[0].labels.get("injected"),
            Some(&"true".to_string())
        );
    }

    #[test]
    fn stale_annotation_needs_update() {
        let mut d = decoration("sidecar", "mesh", "sidecar-0a1b2c3d4e");
        let mut pod = Pod::default();
        set_decoration_info(&mut pod, &[&d]);
        assert!(!should_update_decoration_info(&pod, &[&d]));

        // Revision moved on.
        d.status.as_mut().unwrap().updated_revision = "sidecar-9988776655".into();
        assert!(should_update_decoration_info(&pod, &[&d]));
    }
}
