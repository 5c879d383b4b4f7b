//! Label selector evaluation against pod label sets.
//!
//! The apimachinery selector grammar, evaluated in-process: matchLabels plus
//! the four matchExpressions operators. Two conventions are fixed here for
//! the whole crate: a Decoration spec selector of `None` matches nothing,
//! and a rolling-update selector of `None` means the rollout is not gated by
//! selector at all (callers never pass it down here).

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

/// Checks if a label selector matches the given labels.
///
/// An empty selector (no matchLabels, no matchExpressions) matches every
/// label set, per apimachinery semantics.
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                return false;
            }
        }
    }

    if let Some(match_expressions) = &selector.match_expressions {
        for expr in match_expressions {
            if !expression_matches(expr, labels) {
                return false;
            }
        }
    }

    true
}

/// Decoration spec selector: `None` matches no pods.
pub fn spec_selector_matches(
    selector: Option<&LabelSelector>,
    labels: &BTreeMap<String, String>,
) -> bool {
    match selector {
        Some(sel) => selector_matches(sel, labels),
        None => false,
    }
}

fn expression_matches(expr: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let label_value = labels.get(&expr.key);
    let empty = vec![];
    let values = expr.values.as_ref().unwrap_or(&empty);

    match expr.operator.as_str() {
        "In" => label_value.is_some_and(|value| values.contains(value)),
        "NotIn" => label_value.is_none_or(|value| !values.contains(value)),
        "Exists" => label_value.is_some(),
        "DoesNotExist" => label_value.is_none(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn match_labels(pairs: &[(&str, &str)]) -> LabelSelector {
        LabelSelector {
            match_labels: Some(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn match_labels_subset() {
        let sel = match_labels(&[("app", "foo")]);
        assert!(selector_matches(&sel, &labels(&[("app", "foo"), ("zone", "a")])));
        assert!(!selector_matches(&sel, &labels(&[("app", "bar")])));
        assert!(!selector_matches(&sel, &labels(&[])));
    }

    #[test]
    fn empty_selector_matches_all() {
        let sel = LabelSelector::default();
        assert!(selector_matches(&sel, &labels(&[("app", "foo")])));
        assert!(selector_matches(&sel, &labels(&[])));
    }

    #[test]
    fn nil_spec_selector_matches_none() {
        assert!(!spec_selector_matches(None, &labels(&[("app", "foo")])));
        assert!(!spec_selector_matches(None, &labels(&[])));
    }

    #[test]
    fn expressions() {
        let sel = LabelSelector {
            match_expressions: Some(vec![
                LabelSelectorRequirement {
                    key: "zone".into(),
                    operator: "In".into(),
                    values: Some(vec!["a".into(), "b".into()]),
                },
                LabelSelectorRequirement {
                    key: "canary".into(),
                    operator: "DoesNotExist".into(),
                    values: None,
                },
            ]),
            ..Default::default()
        };
        assert!(selector_matches(&sel, &labels(&[("zone", "a")])));
        assert!(!selector_matches(&sel, &labels(&[("zone", "c")])));
        assert!(!selector_matches(&sel, &labels(&[("zone", "a"), ("canary", "1")])));
    }

    #[test]
    fn not_in_without_label_matches() {
        let sel = LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "zone".into(),
                operator: "NotIn".into(),
                values: Some(vec!["a".into()]),
            }]),
            ..Default::default()
        };
        assert!(selector_matches(&sel, &labels(&[])));
        assert!(!selector_matches(&sel, &labels(&[("zone", "a")])));
    }
}
