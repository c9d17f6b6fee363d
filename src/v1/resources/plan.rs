use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset};
use k8s_openapi::api::core::v1::{
    EnvFromSource, EnvVar, LocalObjectReference, SecurityContext, Toleration,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::utils::Condition;

/// Schema escape hatch for upstream Kubernetes types that do not implement
/// `schemars::JsonSchema` under the feature set this crate builds with.
/// Mirrors the field itself at the serde layer; the CRD schema just declares
/// an open object and lets the apiserver accept whatever shape the upstream
/// type serializes to.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(transparent)]
pub struct GenericMap(pub serde_json::Value);

impl JsonSchema for GenericMap {
    fn schema_name() -> String {
        "GenericMap".to_string()
    }

    fn json_schema(_gen: &mut schemars::SchemaGenerator) -> schemars::schema::Schema {
        use schemars::schema::{InstanceType, SchemaObject};
        use serde_json::json;

        let schema_obj = SchemaObject {
            instance_type: Some(InstanceType::Object.into()),
            ..Default::default()
        };

        let mut raw = serde_json::to_value(&schema_obj).unwrap();
        let obj = raw.as_object_mut().unwrap();
        obj.insert(
            "x-kubernetes-preserve-unknown-fields".to_string(),
            json!(true),
        );

        serde_json::from_value(raw).unwrap()
    }
}

#[derive(CustomResource, Debug, Serialize, Deserialize, Default, Clone, JsonSchema)]
#[kube(
    group = "upgrade.cattle.io",
    version = "v1",
    kind = "Plan",
    namespaced,
    status = "PlanStatus",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.upgrade.image"}"#,
    printcolumn = r#"{"name":"Channel","type":"string","jsonPath":".spec.channel"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Complete","type":"string","jsonPath":".status.conditions[?(@.type==\"Complete\")].status"}"#,
    printcolumn = r#"{"name":"Message","type":"string","jsonPath":".status.conditions[?(@.type==\"Complete\")].message"}"#,
    printcolumn = r#"{"name":"Applying","type":"string","jsonPath":".status.applying"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PlanSpec {
    /// HTTP channel that resolves to the latest version, mutually exclusive with `version`
    pub channel: Option<String>,

    /// Literal version to install, mutually exclusive with `channel`
    pub version: Option<String>,

    /// Maximum number of nodes worked on at once
    #[serde(default = "default_concurrency")]
    pub concurrency: i64,

    /// Selects which nodes are eligible for this plan
    #[schemars(with = "Option<GenericMap>")]
    pub node_selector: Option<LabelSelector>,

    /// Service account the per-node Job runs as
    pub service_account_name: Option<String>,

    /// Secrets mounted into the upgrade pod and mixed into the digest unless ignored
    pub secrets: Option<Vec<SecretSpec>>,

    #[schemars(with = "Option<Vec<GenericMap>>")]
    pub tolerations: Option<Vec<Toleration>>,

    #[schemars(with = "Option<Vec<GenericMap>>")]
    pub image_pull_secrets: Option<Vec<LocalObjectReference>>,

    /// Forbids co-scheduling this plan's pods with any other exclusive plan's pods on a node
    pub exclusive: Option<bool>,

    /// Restricts when new work may start
    pub window: Option<TimeWindowSpec>,

    /// Optional init container run before cordon/drain
    pub prepare: Option<ContainerSpec>,

    /// The container that performs the upgrade
    pub upgrade: ContainerSpec,

    /// Cordon the node before upgrading; superseded by `drain` if both are set
    pub cordon: Option<bool>,

    pub drain: Option<DrainSpec>,

    pub job_active_deadline_secs: Option<i64>,

    /// Go-style duration string (e.g. "30s", "5m"); node stays cordoned/unsynced this long after Job completion
    pub post_complete_delay: Option<String>,

    pub priority_class_name: Option<String>,
}

fn default_concurrency() -> i64 {
    1
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub image: String,
    pub command: Option<Vec<String>>,
    pub args: Option<Vec<String>>,

    #[schemars(with = "Option<Vec<GenericMap>>")]
    pub env: Option<Vec<EnvVar>>,

    #[schemars(with = "Option<Vec<GenericMap>>")]
    pub env_from: Option<Vec<EnvFromSource>>,

    pub volumes: Option<Vec<VolumeSpec>>,

    #[schemars(with = "Option<GenericMap>")]
    pub security_context: Option<SecurityContext>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    pub name: String,
    /// Host path mounted into the container at `/run/system-upgrade/volumes/<name>`
    pub host_path: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretSpec {
    pub name: String,
    /// Mount path; defaults to `/run/system-upgrade/secrets/<name>` if unset
    pub path: Option<String>,
    /// If true, the secret is mounted but its contents do not affect the plan's digest
    #[serde(default)]
    pub ignore_updates: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TimeWindowSpec {
    /// Day tokens, e.g. "mon", "1", "tuesday" - validated, not schema-enforced
    pub days: Vec<String>,
    pub start_time: String,
    pub end_time: String,
    /// IANA time zone name; defaults to UTC
    pub time_zone: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DrainSpec {
    pub delete_local_data: Option<bool>,
    pub delete_emptydir_data: Option<bool>,
    pub force: Option<bool>,
    pub grace_period: Option<i32>,
    #[serde(default = "default_true")]
    pub ignore_daemon_sets: bool,
    /// Go-style duration string
    pub timeout: Option<String>,
    /// Label selector expression, ANDed with "exclude controller-managed pods"
    pub pod_selector: Option<String>,
    pub disable_eviction: Option<bool>,
    pub skip_wait_for_delete_timeout: Option<i32>,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanStatus {
    pub conditions: Vec<PlanCondition>,
    pub latest_version: Option<String>,
    pub latest_hash: Option<String>,
    pub applying: Option<Vec<String>>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub reason: Option<String>,
    pub message: Option<String>,
    #[serde(with = "crate::v1::resources::custom_rfc3339")]
    #[schemars(with = "Option<String>")]
    pub last_updated: Option<DateTime<FixedOffset>>,
    #[serde(with = "crate::v1::resources::custom_rfc3339")]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<FixedOffset>>,
}

impl Condition for PlanCondition {
    fn type_(&self) -> &str {
        &self.type_
    }

    fn status(&self) -> &str {
        &self.status
    }

    fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }
}

/// Non-reserved labels/annotations of the Plan that should be copied onto the Jobs it generates.
pub fn copyable_metadata(map: &Option<BTreeMap<String, String>>) -> BTreeMap<String, String> {
    map.clone().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialization_round_trip() {
        let plan = Plan::new(
            "kernel-upgrade",
            PlanSpec {
                channel: Some("https://example.test/channels/stable".into()),
                version: None,
                concurrency: 2,
                node_selector: None,
                service_account_name: Some("system-upgrade".into()),
                secrets: Some(vec![SecretSpec {
                    name: "registry-creds".into(),
                    path: None,
                    ignore_updates: true,
                }]),
                tolerations: None,
                image_pull_secrets: None,
                exclusive: Some(true),
                window: Some(TimeWindowSpec {
                    days: vec!["mon".into(), "tue".into()],
                    start_time: "02:00:00".into(),
                    end_time: "04:00:00".into(),
                    time_zone: Some("UTC".into()),
                }),
                prepare: None,
                upgrade: ContainerSpec {
                    image: "rancher/kubectl:latest".into(),
                    command: Some(vec!["/usr/sbin/upgrade.sh".into()]),
                    ..Default::default()
                },
                cordon: Some(true),
                drain: None,
                job_active_deadline_secs: Some(900),
                post_complete_delay: Some("30s".into()),
                priority_class_name: None,
            },
        );

        let serialized = serde_yaml::to_string(&plan).unwrap();
        let deserialized: Plan = serde_yaml::from_str(&serialized).unwrap();

        assert_eq!(deserialized.spec.concurrency, 2);
        assert_eq!(
            deserialized.spec.upgrade.image,
            "rancher/kubectl:latest"
        );
    }

    #[test]
    fn test_condition_skips_unchanged_upsert() {
        use crate::utils::upsert_condition;

        let mut conditions = vec![PlanCondition {
            type_: "Validated".into(),
            status: "True".into(),
            reason: Some("PlanIsValid".into()),
            message: None,
            last_updated: None,
            last_transition_time: None,
        }];

        upsert_condition(
            &mut conditions,
            PlanCondition {
                type_: "Validated".into(),
                status: "True".into(),
                reason: Some("PlanIsValid".into()),
                message: Some("different message, same status/reason".into()),
                last_updated: None,
                last_transition_time: None,
            },
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].message, None);
    }
}
