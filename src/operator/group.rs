//! Group resolution: one effective Decoration per group.
//!
//! Decorations sharing a group are mutually exclusive; the winner is picked
//! by weight, ties broken by earliest creation, then lexicographic name so
//! the outcome is stable across processes.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use kube::ResourceExt;

use super::crd::Decoration;

/// `(namespace, name)` pair identifying a Decoration.
pub type NamespacedName = (String, String);

/// Total order: (group asc, weight desc, creationTimestamp asc, name asc).
pub fn compare_decorations(a: &Decoration, b: &Decoration) -> Ordering {
    a.group()
        .cmp(b.group())
        .then_with(|| b.weight().cmp(&a.weight()))
        .then_with(|| {
            let a_created = a.metadata.creation_timestamp.as_ref();
            let b_created = b.metadata.creation_timestamp.as_ref();
            match (a_created, b_created) {
                (Some(x), Some(y)) => x.0.cmp(&y.0),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        })
        .then_with(|| a.name_any().cmp(&b.name_any()))
}

/// Sorts decorations into the canonical order.
pub fn sort_decorations(decorations: &mut [&Decoration]) {
    decorations.sort_by(|a, b| compare_decorations(a, b));
}

/// Picks the winner of every group. Deletion state plays no part in the
/// ranking; a deleting-but-present Decoration keeps its slot until the
/// object is actually gone. Only the reconciler forces the deleting
/// instance's own effectiveness false.
pub fn pick_group_winners<'a>(
    decorations: impl IntoIterator<Item = &'a Decoration>,
) -> BTreeMap<String, &'a Decoration> {
    let mut candidates: Vec<&Decoration> = decorations.into_iter().collect();
    sort_decorations(&mut candidates);
    let mut winners = BTreeMap::new();
    for decoration in candidates {
        winners
            .entry(decoration.group().to_string())
            .or_insert(decoration);
    }
    winners
}

/// The heaviest Decoration of one group, if any, deleting or not.
pub fn heaviest_in_group<'a>(
    decorations: impl IntoIterator<Item = &'a Decoration>,
    group: &str,
) -> Option<&'a Decoration> {
    let mut candidates: Vec<&Decoration> = decorations
        .into_iter()
        .filter(|d| d.group() == group)
        .collect();
    sort_decorations(&mut candidates);
    candidates.into_iter().next()
}

/// Group winners whose status claims the given GroupSet; what a workload
/// reconciler consults to learn which decorations its pods must carry.
pub fn effective_decorations_for_workload<'a>(
    decorations: impl IntoIterator<Item = &'a Decoration>,
    group_set: &str,
) -> Vec<&'a Decoration> {
    let affected = decorations.into_iter().filter(|d| {
        d.status
            .as_ref()
            .is_some_and(|s| s.details.iter().any(|detail| detail.group_set == group_set))
    });
    pick_group_winners(affected).into_values().collect()
}

// ==================== Group index ====================

/// Secondary index from group to the Decorations carrying it, kept current
/// by the reconciler. Lookups are O(log n) in the number of groups.
#[derive(Default)]
pub struct GroupIndex {
    inner: RwLock<GroupIndexInner>,
}

#[derive(Default)]
struct GroupIndexInner {
    by_group: BTreeMap<String, BTreeSet<NamespacedName>>,
    group_of: HashMap<NamespacedName, String>,
}

impl GroupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the group a Decoration currently carries, migrating it out of
    /// a previously observed group if the spec changed.
    pub fn observe(&self, namespace: &str, name: &str, group: &str) {
        let key = (namespace.to_string(), name.to_string());
        let mut inner = self.inner.write().unwrap();
        if let Some(previous) = inner.group_of.get(&key).cloned() {
            if previous == group {
                return;
            }
            if let Some(members) = inner.by_group.get_mut(&previous) {
                members.remove(&key);
                if members.is_empty() {
                    inner.by_group.remove(&previous);
                }
            }
        }
        inner.group_of.insert(key.clone(), group.to_string());
        inner.by_group.entry(group.to_string()).or_default().insert(key);
    }

    /// Drops a deleted Decoration from the index.
    pub fn forget(&self, namespace: &str, name: &str) {
        let key = (namespace.to_string(), name.to_string());
        let mut inner = self.inner.write().unwrap();
        if let Some(group) = inner.group_of.remove(&key) {
            if let Some(members) = inner.by_group.get_mut(&group) {
                members.remove(&key);
                if members.is_empty() {
                    inner.by_group.remove(&group);
                }
            }
        }
    }

    /// Decorations observed with the given group.
    pub fn members(&self, group: &str) -> Vec<NamespacedName> {
        self.inner
            .read()
            .unwrap()
            .by_group
            .get(group)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::crd::{DecorationSpec, DecorationStatus, DecorationWorkloadDetail};
    use chrono::{TimeZone, Utc};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn decoration(name: &str, group: &str, weight: i32, created_secs: i64) -> Decoration {
        let mut d = Decoration::new(name, DecorationSpec::default());
        d.spec.inject_strategy.group = group.to_string();
        d.spec.inject_strategy.weight = Some(weight);
        d.metadata.creation_timestamp =
            Some(Time(Utc.timestamp_opt(created_secs, 0).unwrap()));
        d
    }

    #[test]
    fn heaviest_weight_wins() {
        let d1 = decoration("d1", "g", 10, 100);
        let d2 = decoration("d2", "g", 5, 50);
        let winners = pick_group_winners([&d1, &d2]);
        assert_eq!(winners["g"].name_any(), "d1");
    }

    #[test]
    fn weight_tie_earliest_creation_wins() {
        let d1 = decoration("d1", "g", 10, 200);
        let d2 = decoration("d2", "g", 10, 100);
        let winners = pick_group_winners([&d1, &d2]);
        assert_eq!(winners["g"].name_any(), "d2");
    }

    #[test]
    fn full_tie_lexicographic_name_wins() {
        let d1 = decoration("zeta", "g", 10, 100);
        let d2 = decoration("alpha", "g", 10, 100);
        let winners = pick_group_winners([&d1, &d2]);
        assert_eq!(winners["g"].name_any(), "alpha");
    }

    #[test]
    fn one_winner_per_group() {
        let d1 = decoration("d1", "g1", 1, 100);
        let d2 = decoration("d2", "g1", 2, 100);
        let d3 = decoration("d3", "g2", 0, 100);
        let winners = pick_group_winners([&d1, &d2, &d3]);
        assert_eq!(winners.len(), 2);
        assert_eq!(winners["g1"].name_any(), "d2");
        assert_eq!(winners["g2"].name_any(), "d3");
    }

    #[test]
    fn deletion_pending_keeps_group_winner() {
        // A heavier Decoration mid-deletion (finalizer still present) keeps
        // winning its group; the lighter sibling must not take over until
        // the object is actually removed.
        let mut d1 = decoration("d1", "g", 10, 100);
        d1.metadata.deletion_timestamp = Some(Time(Utc.timestamp_opt(300, 0).unwrap()));
        let d2 = decoration("d2", "g", 5, 100);
        let winners = pick_group_winners([&d1, &d2]);
        assert_eq!(winners["g"].name_any(), "d1");
        assert_eq!(heaviest_in_group([&d1, &d2], "g").unwrap().name_any(), "d1");
    }

    #[test]
    fn workload_listing_picks_group_top() {
        let claim = |d: &mut Decoration, ws: &str| {
            d.status = Some(DecorationStatus {
                details: vec![DecorationWorkloadDetail {
                    group_set: ws.to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            });
        };
        let mut d1 = decoration("d1", "g", 10, 100);
        let mut d2 = decoration("d2", "g", 5, 100);
        let mut d3 = decoration("d3", "g", 20, 100);
        claim(&mut d1, "ws-a");
        claim(&mut d2, "ws-a");
        claim(&mut d3, "ws-b");

        let effective = effective_decorations_for_workload([&d1, &d2, &d3], "ws-a");
        assert_eq!(effective.len(), 1);
        assert_eq!(effective[0].name_any(), "d1");
    }

    #[test]
    fn index_tracks_group_migration() {
        let index = GroupIndex::new();
        index.observe("ns", "d1", "g1");
        index.observe("ns", "d2", "g1");
        assert_eq!(index.members("g1").len(), 2);

        index.observe("ns", "d1", "g2");
        assert_eq!(index.members("g1").len(), 1);
        assert_eq!(index.members("g2"), vec![("ns".to_string(), "d1".to_string())]);

        index.forget("ns", "d2");
        assert!(index.members("g1").is_empty());
    }
}
