use k8s_openapi::api::core::v1::{
    Affinity, Container, EnvVar, NodeSelectorTerm, PodTemplateSpec, Toleration, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group shared by the Decoration and GroupSet resources.
pub const API_GROUP: &str = "apps.groupset.dev";

/// Annotation on decorated pods mapping group -> {name, revision}.
/// This is the authoritative record of which decoration revisions a pod
/// carries; both this controller and external consumers read it.
pub const ANNOTATION_DECORATION_REVISIONS: &str = "apps.groupset.dev/decoration-revisions";

/// Label carrying the stable per-slot instance identity, preserved by the
/// owning GroupSet across pod recreation.
pub const LABEL_INSTANCE_ID: &str = "apps.groupset.dev/instance-id";

/// Label set by workload reconcilers once a pod serves traffic. Read-only here.
pub const LABEL_SERVICE_AVAILABLE: &str = "apps.groupset.dev/service-available";

/// Finalizer guarding Decoration deletion until no pod advertises its revisions.
pub const FINALIZER_NAME: &str = "apps.groupset.dev/decoration-protection";

/// Owner kind recorded on pods managed by a GroupSet.
pub const GROUPSET_KIND: &str = "GroupSet";

// ==================== Decoration CRD ====================

#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "apps.groupset.dev",
    version = "v1alpha1",
    kind = "Decoration",
    plural = "decorations",
    shortname = "dec",
    status = "DecorationStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DecorationSpec {
    /// Number of historical revisions to conserve.
    #[serde(default = "default_history_limit")]
    pub history_limit: i32,

    /// Label query over pods that should be injected with this Decoration.
    /// Absent means the Decoration matches no pods.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    /// How new revisions are phased across the matched pods.
    #[serde(default)]
    pub update_strategy: DecorationUpdateStrategy,

    /// Group membership and priority for mutual exclusion.
    #[serde(default)]
    pub inject_strategy: DecorationInjectStrategy,

    /// What to merge into each matched pod.
    #[serde(default)]
    pub template: DecorationPodTemplate,
}

pub fn default_history_limit() -> i32 {
    20
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DecorationInjectStrategy {
    /// Name of the group this Decoration belongs to. Only one Decoration is
    /// effective when multiple Decorations share the same group value.
    #[serde(default)]
    pub group: String,

    /// Priority within the group; the greatest weight wins. Default 0.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DecorationUpdateStrategy {
    /// Rolling update gate. Absent means every matched pod gets the updated
    /// revision immediately.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<DecorationRollingUpdate>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DecorationRollingUpdate {
    /// Number of matched pods held back on the current revision, chosen as
    /// the trailing pods under the stable update ordering.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<i32>,

    /// Label selector choosing which matched pods get the updated revision.
    /// Absent means the rollout is not selector-gated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
}

// ==================== Decoration template ====================

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DecorationPodTemplate {
    /// Metadata patches applied to the pod, each with its own policy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<TemplateMetadataPatch>,

    /// Init containers appended to the pod. A container whose name already
    /// exists on the pod is skipped.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<Container>,

    /// Sidecar containers injected around the primary containers. A container
    /// with an existing name replaces that container entirely.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<ContainerPatch>,

    /// Merge instructions targeted at containers already present on the pod.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub primary_containers: Vec<PrimaryContainerPatch>,

    /// Volumes appended to the pod spec, deduplicated by name.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,

    /// Scheduling constraints merged into the pod.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affinity: Option<DecorationAffinity>,

    /// Tolerations appended to the pod, deduplicated by
    /// (key, operator, value, effect).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    /// RuntimeClass to run the pod with; only applied when the pod has none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_class_name: Option<String>,
}

/// Policy for merging decoration metadata into pod metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum MetadataPatchPolicy {
    /// Add keys absent on the pod, keep existing values.
    #[default]
    Retain,
    /// Replace existing values.
    Overwrite,
    /// Treat each value as a JSON document and apply an RFC 7396 merge.
    MergePatchJson,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMetadataPatch {
    /// How the labels and annotations below are merged into the pod.
    #[serde(default)]
    pub patch_policy: MetadataPatchPolicy,

    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub labels: std::collections::BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub annotations: std::collections::BTreeMap<String, String>,
}

/// Position of an injected sidecar relative to the primary containers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ContainerInjectPolicy {
    #[default]
    BeforePrimaryContainer,
    AfterPrimaryContainer,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPatch {
    /// Where to insert the container relative to the primary containers.
    #[serde(default)]
    pub inject_policy: ContainerInjectPolicy,

    #[serde(flatten)]
    pub container: Container,
}

/// Which existing container(s) a primary-container patch merges into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum PrimaryContainerTargetPolicy {
    /// Merge into the container matching `name`.
    ByName,
    /// Merge into every existing container.
    All,
    /// Merge into the first container.
    First,
    /// Merge into the last container.
    #[default]
    Last,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PrimaryContainerPatch {
    /// Which container(s) to merge into.
    #[serde(default)]
    pub target_policy: PrimaryContainerTargetPolicy,

    /// Target container name; required when the policy is ByName.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Replacement image, if set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Env vars appended to the target container; existing names win.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Volume mounts appended to the target container, deduplicated by
    /// mountPath; existing mounts win.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DecorationAffinity {
    /// Replaces the pod affinity wholesale when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub override_affinity: Option<Affinity>,

    /// Node selector terms appended to the existing
    /// requiredDuringSchedulingIgnoredDuringExecution.nodeSelectorTerms.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_selector_terms: Vec<NodeSelectorTerm>,
}

// ==================== Decoration status ====================

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DecorationStatus {
    /// Most recent generation observed by the controller.
    #[serde(default)]
    pub observed_generation: i64,

    /// Name of the promoted revision; trails updatedRevision during a rollout.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub current_revision: String,

    /// Name of the revision currently being rolled out.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub updated_revision: String,

    /// Count of hash collisions, used as salt when naming new revisions.
    #[serde(default)]
    pub collision_count: i32,

    /// Number of pods matched by the selector.
    #[serde(default)]
    pub matched_pods: i32,

    /// Number of matched pods advertising the updated revision.
    #[serde(default)]
    pub updated_pods: i32,

    /// Number of updated pods whose Ready condition is True.
    #[serde(default)]
    pub updated_ready_pods: i32,

    /// Whether this Decoration is the winner of its group.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_effective: Option<bool>,

    /// Per-workload injection detail.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<DecorationWorkloadDetail>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DecorationWorkloadDetail {
    /// Name of the owning GroupSet.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group_set: String,

    #[serde(default)]
    pub affected_replicas: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pods: Vec<DecorationPodInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DecorationPodInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Revision the pod advertises for this Decoration, if any.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub revision: String,

    /// True when the pod matches the selector but carries no revision yet.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_not_injected: bool,
}

// ==================== GroupSet CRD ====================

// The GroupSet reconciler lives elsewhere; this controller only reads the
// spec template labels and the allocated instance identities.

#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "apps.groupset.dev",
    version = "v1alpha1",
    kind = "GroupSet",
    plural = "groupsets",
    shortname = "gs",
    status = "GroupSetStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct GroupSetSpec {
    /// Number of desired pods.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Label query over the pods this GroupSet owns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    /// Pod template the GroupSet stamps out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<PodTemplateSpec>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GroupSetStatus {
    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default)]
    pub replicas: i32,

    /// Instance identities currently allocated to pod slots. An identity
    /// present here with no live pod means a replacement pod is expected.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allocated_ids: Vec<String>,
}

impl Decoration {
    /// Group this Decoration competes in.
    pub fn group(&self) -> &str {
        &self.spec.inject_strategy.group
    }

    /// Effective weight within the group; unset weight counts as 0.
    pub fn weight(&self) -> i32 {
        self.spec.inject_strategy.weight.unwrap_or(0)
    }

    pub fn current_revision(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.current_revision.as_str())
            .unwrap_or("")
    }

    pub fn updated_revision(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.updated_revision.as_str())
            .unwrap_or("")
    }
}
