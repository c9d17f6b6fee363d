//! Resolves a plan's desired version and maintains the `LatestResolved`,
//! `Validated`, and `Complete` conditions (component C7).
//!
//! Kept free of any direct cluster-API calls so it is trivially unit
//! testable: the reconciler fetches whatever inputs this needs (secrets,
//! the channel client) and feeds them in; this returns the new status plus
//! the events the reconciler should publish and whether the generating
//! handler (C8) may run this tick.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::events::EventType;

use crate::config::Config;
use crate::v1::controllers::plancontroller::channel::{ChannelClient, ResolveError};
use crate::v1::controllers::plancontroller::digest::digest_plan;
use crate::v1::controllers::plancontroller::validate;
use crate::v1::resources::{Plan, PlanCondition, PlanStatus};
use crate::utils::upsert_condition;

pub const COMPLETE: &str = "Complete";
pub const VALIDATED: &str = "Validated";
pub const LATEST_RESOLVED: &str = "LatestResolved";

pub struct PlanEvent {
    pub type_: EventType,
    pub reason: &'static str,
    pub note: String,
}

/// Outcome of one status-handler pass.
pub struct StatusOutcome {
    pub status: PlanStatus,
    /// True iff `Validated=True` and `LatestResolved=True`; the generating
    /// handler (C8) only runs when this is true.
    pub ready: bool,
    pub requeue_after: Option<Duration>,
    pub events: Vec<PlanEvent>,
    /// Set when channel resolution failed; the reconciler persists `status`
    /// regardless, then propagates this as an `Err` so the SDK retries with
    /// back-off (§7 "Resolution error").
    pub retry_error: Option<ResolveError>,
}

fn condition(type_: &str, status: &str, reason: Option<&str>, message: Option<&str>) -> PlanCondition {
    let now = Utc::now().fixed_offset();
    PlanCondition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.map(str::to_string),
        message: message.map(str::to_string),
        last_updated: Some(now),
        last_transition_time: Some(now),
    }
}

/// Upserts a condition, preserving the existing `lastTransitionTime` when the
/// status/reason didn't change. Returns whether this is a genuine transition
/// (for event-on-transition emission).
fn set_condition(
    conditions: &mut Vec<PlanCondition>,
    type_: &str,
    status: &str,
    reason: Option<&str>,
    message: Option<&str>,
) -> bool {
    let transitioned = conditions
        .iter()
        .find(|c| c.type_ == type_)
        .map(|c| c.status != status || c.reason.as_deref() != reason)
        .unwrap_or(true);

    let mut new_condition = condition(type_, status, reason, message);
    if !transitioned {
        if let Some(existing) = conditions.iter().find(|c| c.type_ == type_) {
            new_condition.last_transition_time = existing.last_transition_time;
        }
    }
    upsert_condition(conditions, new_condition);
    transitioned
}

/// Sets the `Complete` condition, preserving `lastTransitionTime` across a
/// no-op update. Returns whether this is a genuine transition, so callers
/// only emit an event when the condition actually changed. Shared by C8
/// (generating handler) and C9 (job handler), which both need to flip this
/// condition outside the main status-resolution pass above.
pub fn set_complete(status: &mut PlanStatus, value: &str, reason: &str) -> bool {
    set_condition(&mut status.conditions, COMPLETE, value, Some(reason), None)
}

/// Advances a condition's `lastUpdated` to now regardless of whether its
/// status/reason transitioned. `set_condition`/`upsert_condition` leave
/// `lastUpdated` frozen on a no-op update (so an unrelated caller's repeated
/// identical condition doesn't look like fresh activity); a successful
/// channel poll is activity the poll-interval gate below needs to see even
/// when it resolves to the same version.
fn touch_last_updated(conditions: &mut [PlanCondition], type_: &str) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        existing.last_updated = Some(Utc::now().fixed_offset());
    }
}

fn ensure_unknown(conditions: &mut Vec<PlanCondition>, type_: &str) {
    if !conditions.iter().any(|c| c.type_ == type_) {
        upsert_condition(conditions, condition(type_, "Unknown", None, None));
    }
}

fn condition_status(conditions: &[PlanCondition], type_: &str) -> Option<&str> {
    conditions
        .iter()
        .find(|c| c.type_ == type_)
        .map(|c| c.status.as_str())
}

#[allow(clippy::too_many_arguments)]
pub async fn reconcile_status(
    plan: &Plan,
    channel_client: &ChannelClient,
    cluster_id: &str,
    config: &Config,
    existing_secret_names: &BTreeSet<String>,
    secrets_by_name: &BTreeMap<String, Secret>,
) -> StatusOutcome {
    let mut status = plan.status.clone().unwrap_or_default();
    let mut events = Vec::new();

    ensure_unknown(&mut status.conditions, COMPLETE);
    ensure_unknown(&mut status.conditions, VALIDATED);

    let digest = |status: &PlanStatus| -> String {
        digest_plan(
            plan,
            status.latest_version.as_deref().unwrap_or_default(),
            secrets_by_name,
        )
    };

    match validate::validate(&plan.spec, existing_secret_names) {
        Err(message) => {
            if set_condition(&mut status.conditions, VALIDATED, "False", Some("Error"), Some(&message)) {
                events.push(PlanEvent {
                    type_: EventType::Warning,
                    reason: "ValidateFailed",
                    note: message.clone(),
                });
            }
            status.latest_hash = Some(digest(&status));
            return StatusOutcome {
                status,
                ready: false,
                requeue_after: None,
                events,
                retry_error: None,
            };
        }
        Ok(()) => {
            if set_condition(&mut status.conditions, VALIDATED, "True", Some("PlanIsValid"), None) {
                events.push(PlanEvent {
                    type_: EventType::Normal,
                    reason: "Validated",
                    note: "Plan is valid".to_string(),
                });
            }
        }
    }

    ensure_unknown(&mut status.conditions, LATEST_RESOLVED);

    let channel = plan.spec.channel.as_deref().filter(|s| !s.is_empty());
    let version = plan.spec.version.as_deref().filter(|s| !s.is_empty());

    if channel.is_none() && version.is_none() {
        set_condition(
            &mut status.conditions,
            LATEST_RESOLVED,
            "False",
            Some("Error"),
            Some("spec.channel and spec.version are both unset; exactly one must be set"),
        );
        status.latest_version = None;
        status.latest_hash = None;
        return StatusOutcome {
            status,
            ready: false,
            requeue_after: None,
            events,
            retry_error: None,
        };
    }

    if let Some(version) = version {
        let munged = crate::v1::controllers::plancontroller::channel::munge(version);
        if status.latest_version.as_deref() != Some(munged.as_str()) {
            status.latest_version = Some(munged.clone());
            if set_condition(&mut status.conditions, COMPLETE, "False", Some("Resolved"), None) {
                events.push(PlanEvent {
                    type_: EventType::Normal,
                    reason: "Resolved",
                    note: format!("Latest version resolved to {munged}"),
                });
            }
        }
        set_condition(&mut status.conditions, LATEST_RESOLVED, "True", Some("Version"), None);
        status.latest_hash = Some(digest(&status));

        let ready = condition_status(&status.conditions, VALIDATED) == Some("True");
        return StatusOutcome {
            status,
            ready,
            requeue_after: None,
            events,
            retry_error: None,
        };
    }

    let channel = channel.expect("channel branch: spec.channel is set");

    let already_resolved = condition_status(&status.conditions, LATEST_RESOLVED) == Some("True");
    if already_resolved {
        let last_updated = status
            .conditions
            .iter()
            .find(|c| c.type_ == LATEST_RESOLVED)
            .and_then(|c| c.last_updated);

        if let Some(last_updated) = last_updated {
            let elapsed = (Utc::now() - last_updated.to_utc())
                .to_std()
                .unwrap_or(Duration::ZERO);
            if elapsed < config.channel_polling_interval {
                return StatusOutcome {
                    status: plan.status.clone().unwrap_or_default(),
                    ready: true,
                    requeue_after: Some(config.channel_polling_interval - elapsed),
                    events,
                    retry_error: None,
                };
            }
        }
    }

    match channel_client
        .resolve(
            channel,
            status.latest_version.as_deref().unwrap_or_default(),
            cluster_id,
        )
        .await
    {
        Err(e) => {
            if set_condition(
                &mut status.conditions,
                LATEST_RESOLVED,
                "False",
                Some("Error"),
                Some(&e.to_string()),
            ) {
                events.push(PlanEvent {
                    type_: EventType::Warning,
                    reason: "ResolveChannel",
                    note: e.to_string(),
                });
            }
            StatusOutcome {
                status,
                ready: false,
                requeue_after: None,
                events,
                retry_error: Some(e),
            }
        }
        Ok(resolved) => {
            if status.latest_version.as_deref() != Some(resolved.as_str()) {
                status.latest_version = Some(resolved.clone());
                if set_condition(&mut status.conditions, COMPLETE, "False", Some("Resolved"), None) {
                    events.push(PlanEvent {
                        type_: EventType::Normal,
                        reason: "Resolved",
                        note: format!("Latest version resolved to {resolved}"),
                    });
                }
            }
            set_condition(&mut status.conditions, LATEST_RESOLVED, "True", Some("Channel"), None);
            // Every successful poll is fresh activity for the poll-interval
            // gate above, even when it resolves to the same version and so
            // doesn't count as a condition transition.
            touch_last_updated(&mut status.conditions, LATEST_RESOLVED);
            status.latest_hash = Some(digest(&status));

            let ready = condition_status(&status.conditions, VALIDATED) == Some("True");
            StatusOutcome {
                status,
                ready,
                requeue_after: None,
                events,
                retry_error: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v1::resources::{ContainerSpec, PlanSpec};

    fn plan_with_spec(spec: PlanSpec) -> Plan {
        Plan::new("test-plan", spec)
    }

    fn base_spec() -> PlanSpec {
        PlanSpec {
            version: Some("v1.2.3".into()),
            upgrade: ContainerSpec {
                image: "rancher/kubectl:latest".into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_unresolvable_when_neither_channel_nor_version() {
        let plan = plan_with_spec(PlanSpec {
            version: None,
            channel: None,
            upgrade: ContainerSpec {
                image: "rancher/kubectl:latest".into(),
                ..Default::default()
            },
            ..Default::default()
        });
        let client = ChannelClient::new(Duration::from_secs(5));
        let config = Config::default();

        let outcome = reconcile_status(
            &plan,
            &client,
            "",
            &config,
            &BTreeSet::new(),
            &BTreeMap::new(),
        )
        .await;

        assert!(!outcome.ready);
        assert_eq!(
            condition_status(&outcome.status.conditions, LATEST_RESOLVED),
            Some("False")
        );
        assert!(outcome.status.latest_version.is_none());
        assert!(outcome.status.latest_hash.is_none());
    }

    #[tokio::test]
    async fn test_literal_version_is_munged_and_resolved() {
        let plan = plan_with_spec(PlanSpec {
            version: Some("v1.2.3+test".into()),
            ..base_spec()
        });
        let client = ChannelClient::new(Duration::from_secs(5));
        let config = Config::default();

        let outcome = reconcile_status(
            &plan,
            &client,
            "",
            &config,
            &BTreeSet::new(),
            &BTreeMap::new(),
        )
        .await;

        assert!(outcome.ready);
        assert_eq!(outcome.status.latest_version.as_deref(), Some("v1.2.3-test"));
        assert_eq!(
            condition_status(&outcome.status.conditions, LATEST_RESOLVED),
            Some("True")
        );
    }

    #[tokio::test]
    async fn test_invalid_spec_short_circuits_before_resolution() {
        let mut spec = base_spec();
        spec.post_complete_delay = Some("-30s".into());
        let plan = plan_with_spec(spec);
        let client = ChannelClient::new(Duration::from_secs(5));
        let config = Config::default();

        let outcome = reconcile_status(
            &plan,
            &client,
            "",
            &config,
            &BTreeSet::new(),
            &BTreeMap::new(),
        )
        .await;

        assert!(!outcome.ready);
        assert_eq!(
            condition_status(&outcome.status.conditions, VALIDATED),
            Some("False")
        );
        // latestHash is still digested even on validation failure
        assert!(outcome.status.latest_hash.is_some());
    }

    #[tokio::test]
    async fn test_repeated_call_without_spec_change_is_idempotent() {
        let plan = plan_with_spec(base_spec());
        let client = ChannelClient::new(Duration::from_secs(5));
        let config = Config::default();

        let first = reconcile_status(
            &plan,
            &client,
            "",
            &config,
            &BTreeSet::new(),
            &BTreeMap::new(),
        )
        .await;

        let mut plan2 = plan.clone();
        plan2.status = Some(first.status);
        let second = reconcile_status(
            &plan2,
            &client,
            "",
            &config,
            &BTreeSet::new(),
            &BTreeMap::new(),
        )
        .await;

        assert_eq!(
            plan2.status.as_ref().unwrap().latest_version,
            second.status.latest_version
        );
    }
}
