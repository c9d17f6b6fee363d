//! Correlates per-node Jobs back to their Plan and Node (component C9).
//!
//! Rather than a standalone handler keyed on Job events, this is folded into
//! the single per-Plan reconcile: `Controller<Plan>::owns(jobs)` already
//! re-triggers the owning Plan's reconciliation on every Job change, which is
//! exactly "always enqueue the Plan at the end of a Job event" (§4.8 step 9)
//! expressed through `kube::runtime::Controller` instead of a second queue.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt as _;
use kube::runtime::events::EventType;

use crate::v1::controllers::plancontroller::duration;
use crate::v1::controllers::plancontroller::status::{set_complete, PlanEvent, COMPLETE};
use crate::v1::labels;
use crate::v1::resources::Plan;

/// One Job's worth of side effects for the reconciler to apply.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct JobAction {
    pub job_name: String,
    pub delete: bool,
    pub node_name: Option<String>,
    pub uncordon_node: bool,
    pub stamp_node_label: Option<String>,
}

pub struct JobsOutcome {
    pub events: Vec<PlanEvent>,
    pub actions: Vec<JobAction>,
    pub requeue_after: Option<Duration>,
}

fn job_condition<'a>(job: &'a Job, type_: &str) -> Option<&'a k8s_openapi::api::batch::v1::JobCondition> {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == type_ && c.status == "True"))
}

fn job_ttl(job: &Job) -> Option<Duration> {
    if let Some(ttl) = job.spec.as_ref().and_then(|s| s.ttl_seconds_after_finished) {
        return Some(Duration::from_secs(ttl.max(0) as u64));
    }

    job.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(labels::ANNOTATION_TTL_SECONDS_AFTER_FINISHED))
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn node_cordoned_by_plan(node: &Node, plan: &Plan) -> bool {
    let unschedulable = node.spec.as_ref().and_then(|s| s.unschedulable).unwrap_or(false);
    unschedulable && (plan.spec.cordon.unwrap_or(false) || plan.spec.drain.is_some())
}

/// Processes every Job currently labeled for this plan, folding terminal
/// states into node labels/cordon state and the `Complete` condition.
/// `status` is mutated in place (already carries C8's output); this may
/// override its `Complete` condition when a Job surfaces a failure.
pub fn reconcile_jobs(
    plan: &Plan,
    jobs: &[Job],
    nodes_by_name: &BTreeMap<String, Node>,
    status: &mut crate::v1::resources::PlanStatus,
    now: DateTime<Utc>,
) -> JobsOutcome {
    let mut events = Vec::new();
    let mut actions = Vec::new();
    let mut requeue_after: Option<Duration> = None;

    let latest_version = status.latest_version.clone().unwrap_or_default();
    let applying: std::collections::HashSet<&str> = status
        .applying
        .as_deref()
        .unwrap_or(&[])
        .iter()
        .map(String::as_str)
        .collect();

    for job in jobs {
        let job_name = job.name_any();
        let job_labels = job.metadata.labels.clone().unwrap_or_default();

        let plan_name = job_labels.get(labels::LABEL_PLAN);
        let node_name = job_labels.get(labels::LABEL_NODE);
        let job_version = job_labels.get(labels::LABEL_VERSION);

        let (plan_name, node_name) = match (plan_name, node_name) {
            (Some(p), Some(n)) => (p, n),
            _ => {
                actions.push(JobAction {
                    job_name,
                    delete: true,
                    ..Default::default()
                });
                continue;
            }
        };

        if plan_name != &plan.name_any() {
            continue;
        }

        if job_version.map(String::as_str) != Some(latest_version.as_str()) {
            actions.push(JobAction {
                job_name,
                delete: true,
                ..Default::default()
            });
            continue;
        }

        let node = match nodes_by_name.get(node_name) {
            Some(n) => n,
            None => {
                actions.push(JobAction {
                    job_name,
                    delete: true,
                    ..Default::default()
                });
                continue;
            }
        };

        if let Some(failed) = job_condition(job, "Failed") {
            let failed_at = failed.last_transition_time.as_ref().map(|t| t.0).unwrap_or(now);
            let message = format!(
                "Job {job_name} failed on node {node_name}: {}: {}",
                failed.reason.as_deref().unwrap_or("Unknown"),
                failed.message.as_deref().unwrap_or("")
            );
            if set_complete(status, "False", "JobFailed") {
                events.push(PlanEvent {
                    type_: EventType::Warning,
                    reason: "JobFailed",
                    note: message,
                });
            }

            match job_ttl(job) {
                Some(ttl) => {
                    let elapsed = (now - failed_at).to_std().unwrap_or(Duration::ZERO);
                    if elapsed < ttl {
                        requeue_after = Some(min_opt(requeue_after, ttl - elapsed));
                    } else {
                        actions.push(JobAction {
                            job_name,
                            delete: true,
                            ..Default::default()
                        });
                    }
                }
                None => {}
            }
            continue;
        }

        if let Some(completed) = job_condition(job, "Complete") {
            let completed_at = completed.last_transition_time.as_ref().map(|t| t.0).unwrap_or(now);

            let mut action = JobAction {
                job_name: job_name.clone(),
                node_name: Some(node_name.clone()),
                ..Default::default()
            };

            if node_cordoned_by_plan(node, plan) {
                action.uncordon_node = true;
            }

            let delay = plan
                .spec
                .post_complete_delay
                .as_deref()
                .and_then(|d| duration::parse_non_negative(d).ok());

            let stamp_now = match delay {
                Some(delay) => {
                    let elapsed = (now - completed_at).to_std().unwrap_or(Duration::ZERO);
                    if elapsed < delay {
                        events.push(PlanEvent {
                            type_: EventType::Normal,
                            reason: "JobCompleteWaiting",
                            note: format!("Waiting {delay:?} after completion before labeling node {node_name}"),
                        });
                        requeue_after = Some(min_opt(requeue_after, delay - elapsed));
                        false
                    } else {
                        true
                    }
                }
                None => true,
            };

            if stamp_now {
                let hash = job_labels
                    .get(&labels::plan_label(&plan.name_any()))
                    .cloned()
                    .or_else(|| status.latest_hash.clone())
                    .unwrap_or_default();
                action.stamp_node_label = Some(hash);
            }

            if action.uncordon_node || action.stamp_node_label.is_some() {
                actions.push(action);
            }

            if let Some(ttl) = job_ttl(job) {
                let elapsed = (now - completed_at).to_std().unwrap_or(Duration::ZERO);
                if elapsed >= ttl {
                    actions.push(JobAction {
                        job_name,
                        delete: true,
                        ..Default::default()
                    });
                } else {
                    requeue_after = Some(min_opt(requeue_after, ttl - elapsed));
                }
            }
            continue;
        }

        // Neither terminal: a Job outside the current wave is stale.
        if !applying.contains(node_name.as_str()) {
            actions.push(JobAction {
                job_name,
                delete: true,
                ..Default::default()
            });
        }
    }

    JobsOutcome {
        events,
        actions,
        requeue_after,
    }
}

fn min_opt(current: Option<Duration>, candidate: Duration) -> Duration {
    match current {
        Some(c) => c.min(candidate),
        None => candidate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v1::resources::{ContainerSpec, PlanSpec, PlanStatus};
    use k8s_openapi::api::batch::v1::JobCondition;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::collections::BTreeMap;

    fn plan() -> Plan {
        let mut plan = Plan::new(
            "test",
            PlanSpec {
                upgrade: ContainerSpec {
                    image: "alpine".into(),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        plan.metadata.uid = Some("plan-uid".into());
        plan
    }

    fn node(name: &str) -> Node {
        let mut node = Node::default();
        node.metadata.name = Some(name.to_string());
        node
    }

    fn job_with_condition(name: &str, node_name: &str, version: &str, cond_type: &str, when: DateTime<Utc>) -> Job {
        let mut job = Job::default();
        job.metadata.name = Some(name.to_string());
        job.metadata.labels = Some(BTreeMap::from([
            (labels::LABEL_PLAN.to_string(), "test".to_string()),
            (labels::LABEL_NODE.to_string(), node_name.to_string()),
            (labels::LABEL_VERSION.to_string(), version.to_string()),
        ]));
        job.status = Some(k8s_openapi::api::batch::v1::JobStatus {
            conditions: Some(vec![JobCondition {
                type_: cond_type.to_string(),
                status: "True".to_string(),
                last_transition_time: Some(Time(when)),
                ..Default::default()
            }]),
            ..Default::default()
        });
        job
    }

    #[test]
    fn test_stale_version_job_is_deleted() {
        let plan = plan();
        let mut status = PlanStatus {
            latest_version: Some("v2".to_string()),
            applying: Some(vec!["a".to_string()]),
            ..Default::default()
        };
        let job = job_with_condition("j1", "a", "v1", "Complete", Utc::now());
        let nodes = BTreeMap::from([("a".to_string(), node("a"))]);

        let outcome = reconcile_jobs(&plan, &[job], &nodes, &mut status, Utc::now());
        assert!(outcome.actions.iter().any(|a| a.delete));
    }

    #[test]
    fn test_failed_job_sets_complete_false() {
        let plan = plan();
        let mut status = PlanStatus {
            latest_version: Some("v1".to_string()),
            applying: Some(vec!["a".to_string()]),
            ..Default::default()
        };
        let job = job_with_condition("j1", "a", "v1", "Failed", Utc::now());
        let nodes = BTreeMap::from([("a".to_string(), node("a"))]);

        let outcome = reconcile_jobs(&plan, &[job], &nodes, &mut status, Utc::now());
        assert_eq!(
            status.conditions.iter().find(|c| c.type_ == COMPLETE).unwrap().reason.as_deref(),
            Some("JobFailed")
        );
        assert!(outcome.events.iter().any(|e| e.reason == "JobFailed"));
    }

    #[test]
    fn test_completed_job_without_delay_stamps_node() {
        let plan = plan();
        let mut status = PlanStatus {
            latest_version: Some("v1".to_string()),
            latest_hash: Some("hash1".to_string()),
            applying: Some(vec!["a".to_string()]),
            ..Default::default()
        };
        let job = job_with_condition("j1", "a", "v1", "Complete", Utc::now() - chrono::Duration::seconds(10));
        let nodes = BTreeMap::from([("a".to_string(), node("a"))]);

        let outcome = reconcile_jobs(&plan, &[job], &nodes, &mut status, Utc::now());
        let stamp = outcome
            .actions
            .iter()
            .find(|a| a.stamp_node_label.is_some())
            .expect("expected a stamp action");
        assert_eq!(stamp.stamp_node_label.as_deref(), Some("hash1"));
    }

    #[test]
    fn test_completed_job_with_delay_waits_before_stamping() {
        let mut plan = plan();
        plan.spec.post_complete_delay = Some("1h".to_string());
        let mut status = PlanStatus {
            latest_version: Some("v1".to_string()),
            latest_hash: Some("hash1".to_string()),
            applying: Some(vec!["a".to_string()]),
            ..Default::default()
        };
        let job = job_with_condition("j1", "a", "v1", "Complete", Utc::now());
        let nodes = BTreeMap::from([("a".to_string(), node("a"))]);

        let outcome = reconcile_jobs(&plan, &[job], &nodes, &mut status, Utc::now());
        assert!(outcome.actions.iter().all(|a| a.stamp_node_label.is_none()));
        assert!(outcome.requeue_after.is_some());
    }
}
