//! Maps Node and Secret watch events back to the Plans that care about them
//! (component C10), so a label change or secret edit re-triggers the Plans
//! whose selector or secret list references it instead of waiting for the
//! next poll.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Secret};
use kube::runtime::reflector::ObjectRef;
use tracing::debug;

use crate::v1::controllers::nodeselector::node_matches;
use crate::v1::resources::Plan;

/// Returns a closure that maps a Node to every Plan whose `spec.nodeSelector`
/// matches it (or that has no selector at all, i.e. matches every node).
pub fn node_to_plans(
    plan_reflector_reader: Arc<kube::runtime::reflector::Store<Plan>>,
) -> impl Fn(Node) -> Vec<ObjectRef<Plan>> {
    move |node| {
        plan_reflector_reader
            .state()
            .iter()
            .filter(|plan| match &plan.spec.node_selector {
                Some(selector) => node_matches(&node, selector),
                None => true,
            })
            .map(|plan| ObjectRef::from(&**plan))
            .inspect(|object_ref| {
                debug!(
                    "Reconcile of {} triggered by node {}",
                    object_ref,
                    node.metadata.name.as_deref().unwrap_or_default()
                )
            })
            .collect::<Vec<_>>()
    }
}

/// Returns a closure that maps a Secret to every Plan that references it by
/// name in `spec.secrets`. A secret with `ignoreUpdates: true` does not
/// count: its contents are excluded from the digest, so changing it should
/// not re-trigger the Plan.
pub fn secret_to_plans(
    plan_reflector_reader: Arc<kube::runtime::reflector::Store<Plan>>,
) -> impl Fn(Secret) -> Vec<ObjectRef<Plan>> {
    move |secret| {
        let secret_name = secret.metadata.name.as_deref().unwrap_or_default();
        let secret_namespace = secret.metadata.namespace.as_deref();

        plan_reflector_reader
            .state()
            .iter()
            .filter(|plan| plan.metadata.namespace.as_deref() == secret_namespace)
            .filter(|plan| {
                plan.spec
                    .secrets
                    .as_ref()
                    .map(|secrets| {
                        secrets
                            .iter()
                            .any(|s| s.name == secret_name && !s.ignore_updates)
                    })
                    .unwrap_or(false)
            })
            .map(|plan| ObjectRef::from(&**plan))
            .inspect(|object_ref| {
                debug!("Reconcile of {} triggered by secret {}", object_ref, secret_name)
            })
            .collect::<Vec<_>>()
    }
}
