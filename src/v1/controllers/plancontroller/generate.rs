//! Turns a resolved plan into the wave of Jobs it wants this tick
//! (component C8). Runs only once C7 has both `Validated=True` and
//! `LatestResolved=True`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::events::EventType;

use crate::config::Config;
use crate::v1::controllers::plancontroller::selection::select_candidates;
use crate::v1::controllers::plancontroller::status::{set_complete, PlanEvent, COMPLETE};
use crate::v1::controllers::plancontroller::window::ParsedWindow;
use crate::v1::controllers::plancontroller::job_builder::build_job;
use crate::v1::resources::{Plan, PlanStatus};

pub struct GenerateOutcome {
    pub status: PlanStatus,
    pub jobs: Vec<Job>,
    pub events: Vec<PlanEvent>,
    pub requeue_after: Option<Duration>,
}

/// `ready` is the `StatusOutcome::ready` flag from C7 (§4.7 "runs only when
/// both Validated=True and LatestResolved=True").
pub fn generate(plan: &Plan, status_in: &PlanStatus, ready: bool, nodes: &[Node], now: DateTime<Utc>, config: &Config) -> GenerateOutcome {
    let mut status = status_in.clone();
    let mut events = Vec::new();

    if !ready {
        set_complete(&mut status, "False", "NotReady");
        return GenerateOutcome {
            status,
            jobs: Vec::new(),
            events,
            requeue_after: None,
        };
    }

    let latest_hash = status.latest_hash.clone().unwrap_or_default();

    let mut plan_with_status = plan.clone();
    plan_with_status.status = Some(status.clone());
    let candidates = select_candidates(&plan_with_status, nodes, &latest_hash);

    let previous_applying = status.applying.clone().unwrap_or_default();

    if candidates.is_empty() {
        if set_complete(&mut status, "True", "Complete") {
            events.push(PlanEvent {
                type_: EventType::Normal,
                reason: "Complete",
                note: format!("Plan is complete at {latest_hash}"),
            });
        }
        status.applying = Some(Vec::new());
        return GenerateOutcome {
            status,
            jobs: Vec::new(),
            events,
            requeue_after: None,
        };
    }

    if let Some(window) = &plan.spec.window {
        if previous_applying.is_empty() {
            match ParsedWindow::parse(window) {
                Ok(parsed) if !parsed.contains(now) => {
                    if set_complete(&mut status, "False", "Waiting") {
                        events.push(PlanEvent {
                            type_: EventType::Normal,
                            reason: "Waiting",
                            note: "Waiting for the configured time window".to_string(),
                        });
                    }
                    return GenerateOutcome {
                        status,
                        jobs: Vec::new(),
                        events,
                        requeue_after: Some(Duration::from_secs(60)),
                    };
                }
                _ => {}
            }
        }
    }

    let candidate_hostnames: Vec<String> = candidates
        .iter()
        .map(|n| n.metadata.name.clone().unwrap_or_default())
        .collect();

    if candidate_hostnames != previous_applying {
        events.push(PlanEvent {
            type_: EventType::Normal,
            reason: "SyncJob",
            note: format!("Syncing jobs for {} node(s)", candidate_hostnames.len()),
        });
    }
    status.applying = Some(candidate_hostnames);
    set_complete(&mut status, "False", "SyncJob");

    // `status.applying` above is what the reconciler persists before
    // applying these Jobs (see mod.rs), so every node this wave is already
    // recorded by the time its Job is live: no node here needs a separate
    // paused->unpaused pass (§9.1 "Pause/unpause atomicity").
    let jobs = candidates
        .iter()
        .map(|node| build_job(&plan_with_status, node, &latest_hash, false, config))
        .collect();

    GenerateOutcome {
        status,
        jobs,
        events,
        requeue_after: None,
    }
}
