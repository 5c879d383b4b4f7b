//! Revision store: content-addressed snapshots of a Decoration's template.
//!
//! Each template state is persisted as a ControllerRevision named
//! `<decoration>-<10 hex>` and owned (controller=true) by the Decoration.
//! The hash is salted with the status collision count, so a name collision
//! bumps the salt and lands on a fresh name without corrupting history.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::apimachinery::pkg::runtime::RawExtension;
use kube::api::{ListParams, ObjectMeta, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::crd::Decoration;
use crate::error::{Error, Result};

/// Outcome of one revision reconciliation.
#[derive(Debug, Clone)]
pub struct ConstructedRevisions {
    /// Name of the promoted revision (carried from status, or the updated
    /// one on first reconcile).
    pub current: String,
    /// Name of the revision matching the live spec template.
    pub updated: String,
    /// Revisions retained after pruning, ascending by revision number.
    pub histories: Vec<ControllerRevision>,
    /// Collision count after this reconcile; persisted on status by the caller.
    pub collision_count: i32,
}

/// Persistence seam for ControllerRevisions. The operator talks to the API
/// server; tests substitute the in-memory store.
#[async_trait]
pub trait RevisionClient: Send + Sync {
    /// Revisions owned by this Decoration (controller owner reference).
    async fn list_owned(&self, decoration: &Decoration) -> Result<Vec<ControllerRevision>>;
    async fn create(&self, revision: ControllerRevision) -> Result<ControllerRevision>;
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Canonical byte form of the fields that affect patching.
pub fn revision_data(decoration: &Decoration) -> Result<serde_json::Value> {
    Ok(serde_json::json!({"spec": {"template": decoration.spec.template}}))
}

/// Candidate revision name for the given salt.
pub fn revision_name(decoration_name: &str, data: &[u8], collision_count: i32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.update(collision_count.to_be_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{}-{}", decoration_name, &digest[..10])
}

/// Derives (current, updated) for a Decoration, creating the updated revision
/// if its template state has not been persisted yet, then prunes history
/// beyond the configured limit.
pub async fn construct_revisions(
    client: &dyn RevisionClient,
    decoration: &Decoration,
) -> Result<ConstructedRevisions> {
    let name = decoration
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::InvalidSpec("decoration has no name".to_string()))?;
    let data = revision_data(decoration)?;
    let bytes = serde_json::to_vec(&data)?;
    let mut collision_count = decoration
        .status
        .as_ref()
        .map(|s| s.collision_count)
        .unwrap_or(0);

    let mut revisions = client.list_owned(decoration).await?;
    revisions.sort_by_key(|r| r.revision);

    let updated = loop {
        let candidate = revision_name(name, &bytes, collision_count);
        match revisions.iter().find(|r| r.name_any() == candidate) {
            Some(existing) => {
                if revision_bytes_equal(existing, &data) {
                    break existing.clone();
                }
                // Same name, different template bytes: salt and retry.
                collision_count += 1;
                debug!(
                    decoration = name,
                    collision_count, "revision name collision, retrying with bumped salt"
                );
            }
            None => {
                let next_number = revisions.iter().map(|r| r.revision).max().unwrap_or(0) + 1;
                let revision = new_revision(decoration, &candidate, &data, next_number);
                match client.create(revision).await {
                    Ok(created) => {
                        info!(decoration = name, revision = %candidate, "created revision");
                        revisions.push(created.clone());
                        break created;
                    }
                    Err(err) if is_conflict(&err) => {
                        // Lost a race with ourselves; re-read and retry.
                        revisions = client.list_owned(decoration).await?;
                        revisions.sort_by_key(|r| r.revision);
                    }
                    Err(err) => return Err(err),
                }
            }
        }
    };

    let updated_name = updated.name_any();
    let current_name = {
        let carried = decoration.current_revision();
        if carried.is_empty() || !revisions.iter().any(|r| r.name_any() == carried) {
            updated_name.clone()
        } else {
            carried.to_string()
        }
    };

    let histories = prune_revisions(
        client,
        decoration,
        revisions,
        &current_name,
        &updated_name,
    )
    .await?;

    Ok(ConstructedRevisions {
        current: current_name,
        updated: updated_name,
        histories,
        collision_count,
    })
}

/// Deletes oldest-first beyond the history limit, never touching the current
/// or updated revision.
async fn prune_revisions(
    client: &dyn RevisionClient,
    decoration: &Decoration,
    mut revisions: Vec<ControllerRevision>,
    current: &str,
    updated: &str,
) -> Result<Vec<ControllerRevision>> {
    let limit = decoration.spec.history_limit.max(1) as usize;
    if revisions.len() <= limit {
        return Ok(revisions);
    }
    let namespace = decoration.metadata.namespace.clone().unwrap_or_default();
    let mut excess = revisions.len() - limit;
    let mut retained = Vec::with_capacity(limit);
    for revision in revisions.drain(..) {
        let name = revision.name_any();
        if excess > 0 && name != current && name != updated {
            client.delete(&namespace, &name).await?;
            excess -= 1;
        } else {
            retained.push(revision);
        }
    }
    Ok(retained)
}

fn revision_bytes_equal(revision: &ControllerRevision, data: &serde_json::Value) -> bool {
    revision.data.as_ref().map(|raw| &raw.0) == Some(data)
}

fn new_revision(
    decoration: &Decoration,
    name: &str,
    data: &serde_json::Value,
    number: i64,
) -> ControllerRevision {
    ControllerRevision {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: decoration.metadata.namespace.clone(),
            owner_references: Some(vec![owner_reference(decoration)]),
            ..Default::default()
        },
        data: Some(RawExtension(data.clone())),
        revision: number,
    }
}

fn owner_reference(decoration: &Decoration) -> OwnerReference {
    OwnerReference {
        api_version: Decoration::api_version(&()).to_string(),
        kind: Decoration::kind(&()).to_string(),
        name: decoration.metadata.name.clone().unwrap_or_default(),
        uid: decoration.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
        ..Default::default()
    }
}

fn is_conflict(err: &Error) -> bool {
    matches!(err, Error::Kube(kube::Error::Api(ae)) if ae.code == 409)
}

/// Whether the given revision is controlled by the decoration.
fn owned_by(revision: &ControllerRevision, decoration: &Decoration) -> bool {
    let name = decoration.metadata.name.as_deref().unwrap_or("");
    let uid = decoration.metadata.uid.as_deref();
    revision
        .metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| {
            refs.iter().any(|r| {
                r.controller == Some(true)
                    && r.name == name
                    && (uid.is_none() || uid == Some(r.uid.as_str()))
            })
        })
}

// ==================== API-backed client ====================

/// RevisionClient over the cluster API. Listing goes through the namespace
/// and filters by controller owner reference, the same shape the
/// owner-reference field index serves in the informer cache.
pub struct ApiRevisionClient {
    client: Client,
}

impl ApiRevisionClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<ControllerRevision> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl RevisionClient for ApiRevisionClient {
    async fn list_owned(&self, decoration: &Decoration) -> Result<Vec<ControllerRevision>> {
        let namespace = decoration.metadata.namespace.clone().unwrap_or_default();
        let list = self.api(&namespace).list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .filter(|r| owned_by(r, decoration))
            .collect())
    }

    async fn create(&self, revision: ControllerRevision) -> Result<ControllerRevision> {
        let namespace = revision.metadata.namespace.clone().unwrap_or_default();
        Ok(self
            .api(&namespace)
            .create(&PostParams::default(), &revision)
            .await?)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.api(namespace)
            .delete(name, &Default::default())
            .await?;
        Ok(())
    }
}

// ==================== In-memory client ====================

/// In-memory RevisionClient for tests and the scenario suite.
#[derive(Default)]
pub struct InMemoryRevisions {
    revisions: std::sync::Mutex<Vec<ControllerRevision>>,
}

impl InMemoryRevisions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.revisions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> Vec<String> {
        self.revisions
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.name_any())
            .collect()
    }

    /// Seeds a revision directly, bypassing construct_revisions.
    pub fn insert(&self, revision: ControllerRevision) {
        self.revisions.lock().unwrap().push(revision);
    }

    pub fn get(&self, name: &str) -> Option<ControllerRevision> {
        self.revisions
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.name_any() == name)
            .cloned()
    }
}

#[async_trait]
impl RevisionClient for InMemoryRevisions {
    async fn list_owned(&self, decoration: &Decoration) -> Result<Vec<ControllerRevision>> {
        Ok(self
            .revisions
            .lock()
            .unwrap()
            .iter()
            .filter(|r| owned_by(r, decoration))
            .cloned()
            .collect())
    }

    async fn create(&self, revision: ControllerRevision) -> Result<ControllerRevision> {
        self.revisions.lock().unwrap().push(revision.clone());
        Ok(revision)
    }

    async fn delete(&self, _namespace: &str, name: &str) -> Result<()> {
        self.revisions
            .lock()
            .unwrap()
            .retain(|r| r.name_any() != name);
        Ok(())
    }
}
