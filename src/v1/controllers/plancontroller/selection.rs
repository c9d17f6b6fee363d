//! Picks the nodes to target in the current wave (component C5).

use std::collections::HashSet;

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::runtime::reflector::Lookup as _;
use sha2::{Digest, Sha256};

use crate::v1::{labels, resources::Plan};

use super::nodeselector;

fn hostname(node: &Node) -> String {
    node.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(labels::HOSTNAME_LABEL))
        .cloned()
        .unwrap_or_else(|| node.metadata.name.clone().unwrap_or_default())
}

fn effective_selector(plan: &Plan, latest_hash: &str) -> LabelSelector {
    let mut selector = plan.spec.node_selector.clone().unwrap_or_default();

    let mut expressions = selector.match_expressions.take().unwrap_or_default();
    expressions.push(nodeselector::exists(labels::HOSTNAME_LABEL));
    expressions.push(nodeselector::not_in(
        &labels::plan_label(plan.name_any().as_str()),
        labels::DISABLED_LABEL_VALUE,
        latest_hash,
    ));
    selector.match_expressions = Some(expressions);

    selector
}

/// Stable tie-break independent of list ordering or controller restarts.
fn ordering_key(node: &Node, plan: &Plan, latest_hash: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(node.metadata.uid.as_deref().unwrap_or_default().as_bytes());
    hasher.update(plan.metadata.uid.as_deref().unwrap_or_default().as_bytes());
    hasher.update(latest_hash.as_bytes());
    hasher.finalize().into()
}

/// Returns at most `spec.concurrency` nodes to target this wave, preferring
/// nodes already mid-wave (`status.applying`) and breaking remaining ties by
/// a deterministic hash so repeated resyncs re-select the same set.
pub fn select_candidates(plan: &Plan, nodes: &[Node], latest_hash: &str) -> Vec<Node> {
    let selector = effective_selector(plan, latest_hash);
    let concurrency = plan.spec.concurrency.max(1) as usize;

    let applying: HashSet<&str> = plan
        .status
        .as_ref()
        .and_then(|s| s.applying.as_ref())
        .map(|v| v.iter().map(String::as_str).collect())
        .unwrap_or_default();

    let matching: Vec<&Node> = nodes
        .iter()
        .filter(|node| nodeselector::node_matches(node, &selector))
        .collect();

    let mut preferred: Vec<&Node> = matching
        .iter()
        .copied()
        .filter(|node| applying.contains(hostname(node).as_str()))
        .collect();
    let mut rest: Vec<&Node> = matching
        .iter()
        .copied()
        .filter(|node| !applying.contains(hostname(node).as_str()))
        .collect();

    let key = |node: &&Node| ordering_key(node, plan, latest_hash);
    preferred.sort_by_key(key);
    rest.sort_by_key(key);

    let mut selected: Vec<Node> = preferred
        .into_iter()
        .chain(rest)
        .take(concurrency)
        .cloned()
        .collect();

    selected.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v1::resources::PlanSpec;
    use std::collections::BTreeMap;

    fn node(name: &str, uid: &str) -> Node {
        let mut node = Node::default();
        node.metadata.name = Some(name.to_string());
        node.metadata.uid = Some(uid.to_string());
        node.metadata.labels = Some(BTreeMap::from([(
            labels::HOSTNAME_LABEL.to_string(),
            name.to_string(),
        )]));
        node
    }

    fn plan(name: &str, concurrency: i64) -> Plan {
        let mut plan = Plan::new(
            name,
            PlanSpec {
                concurrency,
                upgrade: crate::v1::resources::ContainerSpec {
                    image: "rancher/kubectl:latest".into(),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        plan.metadata.uid = Some("plan-uid".to_string());
        plan
    }

    #[test]
    fn test_respects_concurrency_limit() {
        let p = plan("test", 2);
        let nodes = vec![
            node("a", "uid-a"),
            node("b", "uid-b"),
            node("c", "uid-c"),
        ];

        let selected = select_candidates(&p, &nodes, "hash1");
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn test_excludes_disabled_and_current_hash() {
        let p = plan("test", 5);
        let mut disabled = node("a", "uid-a");
        disabled
            .metadata
            .labels
            .as_mut()
            .unwrap()
            .insert(labels::plan_label("test"), "disabled".to_string());

        let mut done = node("b", "uid-b");
        done.metadata
            .labels
            .as_mut()
            .unwrap()
            .insert(labels::plan_label("test"), "hash1".to_string());

        let fresh = node("c", "uid-c");

        let selected = select_candidates(&p, &[disabled, done, fresh], "hash1");
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].metadata.name.as_deref(), Some("c"));
    }

    #[test]
    fn test_selection_is_deterministic_across_calls() {
        let p = plan("test", 1);
        let nodes = vec![node("a", "uid-a"), node("b", "uid-b"), node("c", "uid-c")];

        let first = select_candidates(&p, &nodes, "hash1");
        let second = select_candidates(&p, &nodes, "hash1");

        assert_eq!(
            first.iter().map(|n| n.metadata.name.clone()).collect::<Vec<_>>(),
            second.iter().map(|n| n.metadata.name.clone()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_applying_nodes_are_preferred() {
        let mut p = plan("test", 1);
        p.status = Some(crate::v1::resources::PlanStatus {
            applying: Some(vec!["b".to_string()]),
            ..Default::default()
        });
        let nodes = vec![node("a", "uid-a"), node("b", "uid-b"), node("c", "uid-c")];

        let selected = select_candidates(&p, &nodes, "hash1");
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].metadata.name.as_deref(), Some("b"));
    }
}
