//! Label and annotation keys under this controller's group namespace.
//!
//! Grounded on the upstream `constants.go` of the project this plan/job
//! model was distilled from: a small set of labels stamped on Jobs so they
//! can be correlated back to their Plan, plus a per-plan label on Nodes that
//! records which revision they last absorbed.

pub const GROUP: &str = "upgrade.cattle.io";

pub const LABEL_CONTROLLER: &str = "upgrade.cattle.io/controller";
pub const LABEL_NODE: &str = "upgrade.cattle.io/node";
pub const LABEL_PLAN: &str = "upgrade.cattle.io/plan";
pub const LABEL_VERSION: &str = "upgrade.cattle.io/version";
pub const LABEL_EXCLUSIVE: &str = "upgrade.cattle.io/exclusive";

pub const ANNOTATION_TTL_SECONDS_AFTER_FINISHED: &str =
    "upgrade.cattle.io/ttl-seconds-after-finished";
pub const ANNOTATION_INCLUDE_IN_DIGEST: &str = "upgrade.cattle.io/include-in-digest";

const PLAN_LABEL_SUFFIX: &str = "plan.upgrade.cattle.io";

/// Per-node label recording the hash of the last plan revision absorbed by that node.
/// Value `"disabled"` excludes the node from future selection for this plan.
pub fn plan_label(plan_name: &str) -> String {
    format!("{PLAN_LABEL_SUFFIX}/{plan_name}")
}

pub const DISABLED_LABEL_VALUE: &str = "disabled";

pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";
