//! Pure template patcher: merges a decoration template into a pod.
//!
//! No I/O, no clocks. Callers own conflict policy; this module only encodes
//! the merge rules. Patching the same pod with the same template twice is a
//! no-op the second time for every rule except metadata Overwrite, which is
//! idempotent anyway.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, Container, NodeAffinity, NodeSelector, Pod, PodSpec, Toleration, Volume,
};
use serde_json::Value;

use super::crd::{
    ContainerInjectPolicy, ContainerPatch, DecorationAffinity, DecorationPodTemplate,
    MetadataPatchPolicy, PrimaryContainerPatch, PrimaryContainerTargetPolicy,
    TemplateMetadataPatch,
};
use crate::error::{Error, Result};

/// Applies a decoration template to a pod in place.
pub fn patch_pod(pod: &mut Pod, template: &DecorationPodTemplate) -> Result<()> {
    if !template.metadata.is_empty() {
        patch_metadata(pod, &template.metadata)?;
    }
    if !template.init_containers.is_empty() {
        add_init_containers(pod, &template.init_containers);
    }
    if !template.primary_containers.is_empty() {
        patch_primary_containers(pod, &template.primary_containers)?;
    }
    if !template.containers.is_empty() {
        patch_containers(pod, &template.containers);
    }
    if !template.volumes.is_empty() {
        let spec = pod_spec(pod);
        let volumes = spec.volumes.take().unwrap_or_default();
        spec.volumes = Some(merge_volumes(volumes, &template.volumes));
    }
    if let Some(affinity) = &template.affinity {
        patch_affinity(pod, affinity);
    }
    if !template.tolerations.is_empty() {
        let spec = pod_spec(pod);
        let tolerations = spec.tolerations.take().unwrap_or_default();
        spec.tolerations = Some(merge_tolerations(tolerations, &template.tolerations));
    }
    if let Some(runtime_class) = &template.runtime_class_name {
        let spec = pod_spec(pod);
        if spec.runtime_class_name.is_none() {
            spec.runtime_class_name = Some(runtime_class.clone());
        }
    }
    Ok(())
}

fn pod_spec(pod: &mut Pod) -> &mut PodSpec {
    pod.spec.get_or_insert_with(Default::default)
}

// ==================== Metadata ====================

/// Patches pod annotations and labels by policy.
pub fn patch_metadata(pod: &mut Pod, patches: &[TemplateMetadataPatch]) -> Result<()> {
    let annotations = pod.metadata.annotations.get_or_insert_with(Default::default);
    let labels = pod.metadata.labels.get_or_insert_with(Default::default);
    for patch in patches {
        match patch.patch_policy {
            MetadataPatchPolicy::Retain => {
                retain_patch(annotations, &patch.annotations);
                retain_patch(labels, &patch.labels);
            }
            MetadataPatchPolicy::Overwrite => {
                overwrite_patch(annotations, &patch.annotations);
                overwrite_patch(labels, &patch.labels);
            }
            MetadataPatchPolicy::MergePatchJson => {
                merge_patch_json(annotations, &patch.annotations)?;
                merge_patch_json(labels, &patch.labels)?;
            }
        }
    }
    Ok(())
}

fn retain_patch(existing: &mut BTreeMap<String, String>, patch: &BTreeMap<String, String>) {
    for (k, v) in patch {
        existing.entry(k.clone()).or_insert_with(|| v.clone());
    }
}

fn overwrite_patch(existing: &mut BTreeMap<String, String>, patch: &BTreeMap<String, String>) {
    for (k, v) in patch {
        existing.insert(k.clone(), v.clone());
    }
}

fn merge_patch_json(
    existing: &mut BTreeMap<String, String>,
    patch: &BTreeMap<String, String>,
) -> Result<()> {
    for (key, patch_value) in patch {
        let old_value = existing.get(key).cloned().unwrap_or_default();
        if old_value.is_empty() {
            existing.insert(key.clone(), patch_value.clone());
            continue;
        }
        let patch_doc: Value =
            serde_json::from_str(patch_value).map_err(|source| Error::MalformedMergePatch {
                key: key.clone(),
                source,
            })?;
        let mut doc: Value =
            serde_json::from_str(&old_value).map_err(|source| Error::MalformedMergePatch {
                key: key.clone(),
                source,
            })?;
        json_patch::merge(&mut doc, &patch_doc);
        existing.insert(key.clone(), doc.to_string());
    }
    Ok(())
}

// ==================== Containers ====================

/// Appends init containers, skipping any whose name the pod already has.
pub fn add_init_containers(pod: &mut Pod, init_containers: &[Container]) {
    let spec = pod_spec(pod);
    let existing = spec.init_containers.get_or_insert_with(Default::default);
    for container in init_containers {
        if existing.iter().any(|c| c.name == container.name) {
            continue;
        }
        existing.push(container.clone());
    }
}

/// Injects sidecar containers around the primary block. A patch whose name
/// matches an existing container replaces it in place instead of moving it.
pub fn patch_containers(pod: &mut Pod, patches: &[ContainerPatch]) {
    let spec = pod_spec(pod);
    let mut before = Vec::new();
    let mut after = Vec::new();
    for patch in patches {
        if let Some(existing) = spec
            .containers
            .iter_mut()
            .find(|c| c.name == patch.container.name)
        {
            *existing = patch.container.clone();
            continue;
        }
        match patch.inject_policy {
            ContainerInjectPolicy::BeforePrimaryContainer => before.push(patch.container.clone()),
            ContainerInjectPolicy::AfterPrimaryContainer => after.push(patch.container.clone()),
        }
    }
    if !before.is_empty() {
        before.extend(spec.containers.drain(..));
        spec.containers = before;
    }
    spec.containers.extend(after);
}

/// Merges primary-container patches into the containers already on the pod.
pub fn patch_primary_containers(pod: &mut Pod, patches: &[PrimaryContainerPatch]) -> Result<()> {
    let spec = pod_spec(pod);
    for patch in patches {
        match patch.target_policy {
            PrimaryContainerTargetPolicy::ByName => {
                let name = patch.name.clone().unwrap_or_default();
                let target = spec
                    .containers
                    .iter_mut()
                    .find(|c| c.name == name)
                    .ok_or(Error::PrimaryContainerMissing(name))?;
                merge_primary(target, patch);
            }
            PrimaryContainerTargetPolicy::All => {
                for target in spec.containers.iter_mut() {
                    merge_primary(target, patch);
                }
            }
            PrimaryContainerTargetPolicy::First => {
                if let Some(target) = spec.containers.first_mut() {
                    merge_primary(target, patch);
                }
            }
            PrimaryContainerTargetPolicy::Last => {
                if let Some(target) = spec.containers.last_mut() {
                    merge_primary(target, patch);
                }
            }
        }
    }
    Ok(())
}

fn merge_primary(container: &mut Container, patch: &PrimaryContainerPatch) {
    if let Some(image) = &patch.image {
        container.image = Some(image.clone());
    }
    if !patch.env.is_empty() {
        let env = container.env.get_or_insert_with(Default::default);
        for var in &patch.env {
            if env.iter().any(|existing| existing.name == var.name) {
                continue;
            }
            env.push(var.clone());
        }
    }
    if !patch.volume_mounts.is_empty() {
        let mounts = container.volume_mounts.get_or_insert_with(Default::default);
        for mount in &patch.volume_mounts {
            if mounts
                .iter()
                .any(|existing| existing.mount_path == mount.mount_path)
            {
                continue;
            }
            mounts.push(mount.clone());
        }
    }
}

// ==================== Volumes / tolerations / affinity ====================

/// Appends decoration volumes, skipping duplicates by name.
pub fn merge_volumes(mut existing: Vec<Volume>, incoming: &[Volume]) -> Vec<Volume> {
    for volume in incoming {
        if existing.iter().any(|v| v.name == volume.name) {
            continue;
        }
        existing.push(volume.clone());
    }
    existing
}

/// Appends decoration tolerations, skipping duplicates by
/// (key, operator, value, effect).
pub fn merge_tolerations(
    mut existing: Vec<Toleration>,
    incoming: &[Toleration],
) -> Vec<Toleration> {
    for toleration in incoming {
        if existing.iter().any(|t| {
            t.key == toleration.key
                && t.operator == toleration.operator
                && t.value == toleration.value
                && t.effect == toleration.effect
        }) {
            continue;
        }
        existing.push(toleration.clone());
    }
    existing
}

/// Replaces the pod affinity wholesale, or appends node selector terms to
/// requiredDuringSchedulingIgnoredDuringExecution, deduplicated by term.
pub fn patch_affinity(pod: &mut Pod, decoration: &DecorationAffinity) {
    let spec = pod_spec(pod);
    if let Some(override_affinity) = &decoration.override_affinity {
        spec.affinity = Some(override_affinity.clone());
        return;
    }
    if decoration.node_selector_terms.is_empty() {
        return;
    }
    let affinity = spec.affinity.get_or_insert_with(Affinity::default);
    let node_affinity = affinity
        .node_affinity
        .get_or_insert_with(NodeAffinity::default);
    let required = node_affinity
        .required_during_scheduling_ignored_during_execution
        .get_or_insert_with(|| NodeSelector {
            node_selector_terms: Vec::new(),
        });
    for term in &decoration.node_selector_terms {
        if required.node_selector_terms.contains(term) {
            continue;
        }
        required.node_selector_terms.push(term.clone());
    }
}
