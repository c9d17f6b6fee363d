//! Full Kubernetes `LabelSelector` matching (`matchLabels` + `matchExpressions`),
//! generalizing the teacher's `matchLabels`-only `node_matches`.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

pub fn node_matches(node: &Node, selector: &LabelSelector) -> bool {
    labels_match(label_map(node), selector)
}

fn label_map(node: &Node) -> &BTreeMap<String, String> {
    const EMPTY: &BTreeMap<String, String> = &BTreeMap::new();
    node.metadata.labels.as_ref().unwrap_or(EMPTY)
}

pub fn labels_match(labels: &BTreeMap<String, String>, selector: &LabelSelector) -> bool {
    let match_labels_ok = selector
        .match_labels
        .as_ref()
        .map(|required| {
            required
                .iter()
                .all(|(key, value)| labels.get(key).is_some_and(|v| v == value))
        })
        .unwrap_or(true);

    if !match_labels_ok {
        return false;
    }

    selector
        .match_expressions
        .as_ref()
        .map(|exprs| exprs.iter().all(|expr| requirement_matches(labels, expr)))
        .unwrap_or(true)
}

fn requirement_matches(
    labels: &BTreeMap<String, String>,
    requirement: &LabelSelectorRequirement,
) -> bool {
    let values = requirement.values.as_deref().unwrap_or(&[]);
    match requirement.operator.as_str() {
        "In" => labels
            .get(&requirement.key)
            .is_some_and(|v| values.iter().any(|candidate| candidate == v)),
        "NotIn" => !labels
            .get(&requirement.key)
            .is_some_and(|v| values.iter().any(|candidate| candidate == v)),
        "Exists" => labels.contains_key(&requirement.key),
        "DoesNotExist" => !labels.contains_key(&requirement.key),
        _ => false,
    }
}

/// Builds a requirement selecting nodes where `key`'s value is in neither `excluded_a` nor `excluded_b`.
pub fn not_in(key: &str, excluded_a: &str, excluded_b: &str) -> LabelSelectorRequirement {
    LabelSelectorRequirement {
        key: key.to_string(),
        operator: "NotIn".to_string(),
        values: Some(vec![excluded_a.to_string(), excluded_b.to_string()]),
    }
}

pub fn exists(key: &str) -> LabelSelectorRequirement {
    LabelSelectorRequirement {
        key: key.to_string(),
        operator: "Exists".to_string(),
        values: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_with_labels(pairs: &[(&str, &str)]) -> Node {
        let mut node = Node::default();
        node.metadata.labels = Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        node
    }

    #[test]
    fn test_match_labels_only() {
        let node = node_with_labels(&[("role", "worker")]);
        let selector = LabelSelector {
            match_labels: Some(BTreeMap::from([("role".to_string(), "worker".to_string())])),
            match_expressions: None,
        };

        assert!(node_matches(&node, &selector));
    }

    #[test]
    fn test_not_in_excludes_disabled_and_hash() {
        let node = node_with_labels(&[("plan.upgrade.cattle.io/test", "disabled")]);
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![not_in(
                "plan.upgrade.cattle.io/test",
                "disabled",
                "somehash",
            )]),
        };

        assert!(!node_matches(&node, &selector));
    }

    #[test]
    fn test_not_in_allows_untouched_node() {
        let node = node_with_labels(&[("kubernetes.io/hostname", "node-a")]);
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![
                exists("kubernetes.io/hostname"),
                not_in("plan.upgrade.cattle.io/test", "disabled", "somehash"),
            ]),
        };

        assert!(node_matches(&node, &selector));
    }

    #[test]
    fn test_exists_requires_key_present() {
        let node = node_with_labels(&[]);
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![exists("kubernetes.io/hostname")]),
        };

        assert!(!node_matches(&node, &selector));
    }
}
