//! Wires components C7-C10 into a single `Controller<Plan>` reconcile loop.

pub mod channel;
pub mod digest;
pub mod duration;
pub mod generate;
pub mod job_builder;
pub mod jobcontroller;
pub mod selection;
pub mod status;
pub mod triggers;
pub mod validate;
pub mod window;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{Stream, StreamExt as _};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Node, Secret};
use kube::api::{ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, Recorder, Reporter};
use kube::runtime::reflector::{store::Writer, ObjectRef};
use kube::runtime::{watcher, Controller};
use kube::{Api, ResourceExt as _};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::v1::controllers::plancontroller::channel::ChannelClient;
use crate::v1::controllers::plancontroller::generate::generate;
use crate::v1::controllers::plancontroller::jobcontroller::reconcile_jobs;
use crate::v1::controllers::plancontroller::status::reconcile_status;
use crate::v1::controllers::reconcile_error::ReconcileError;
use crate::v1::labels;
use crate::v1::resources::Plan;

const FIELD_MANAGER: &str = "system-upgrade-controller";

pub struct ReconciliationContext {
    pub client: kube::Client,
    pub config: Config,
    pub channel_client: ChannelClient,
    pub cluster_id: String,
    pub reporter: Reporter,
}

/// Builds the `Controller<Plan>` stream: owns Jobs (so Job events re-trigger
/// their Plan directly, satisfying "always enqueue the Plan at the end of a
/// Job event"), and watches Nodes/Secrets through the C10 mappers so label
/// or secret changes re-trigger the Plans that reference them.
///
/// Plans, Jobs and Secrets are namespaced resources and are scoped to
/// `namespace` (the controller's own operating namespace, per `--namespace`);
/// Nodes are cluster-scoped and are always watched across the whole cluster.
/// `threads` sets how many Plans this controller reconciles concurrently.
pub fn new(
    client: kube::Client,
    config: Config,
    cluster_id: String,
    namespace: &str,
    threads: usize,
) -> impl Stream<Item = Result<(ObjectRef<Plan>, Action), kube::runtime::controller::Error<ReconcileError, watcher::Error>>> {
    let context = Arc::new(ReconciliationContext {
        client: client.clone(),
        channel_client: ChannelClient::new(config.channel_request_timeout),
        config,
        cluster_id,
        reporter: Reporter::from("system-upgrade-controller"),
    });

    let plans_api: Api<Plan> = Api::namespaced(client.clone(), namespace);
    let jobs_api: Api<Job> = Api::namespaced(client.clone(), namespace);
    let nodes_api: Api<Node> = Api::all(client.clone());
    let secrets_api: Api<Secret> = Api::namespaced(client, namespace);

    let plan_reflector_reader = {
        let writer = Writer::<Plan>::default();
        let reader = Arc::new(writer.as_reader());
        let reflector = kube::runtime::reflector(writer, watcher(plans_api.clone(), watcher::Config::default()));

        tokio::spawn(async move {
            reflector
                .for_each(|event| async {
                    if let Err(e) = event {
                        warn!("Plan reflector error: {e:?}");
                    }
                })
                .await;
        });

        reader
    };

    Controller::new(plans_api, watcher::Config::default())
        .owns(jobs_api, watcher::Config::default())
        .watches(
            nodes_api,
            watcher::Config::default(),
            triggers::node_to_plans(Arc::clone(&plan_reflector_reader)),
        )
        .watches(
            secrets_api,
            watcher::Config::default(),
            triggers::secret_to_plans(Arc::clone(&plan_reflector_reader)),
        )
        .with_config(kube::runtime::controller::Config::default().concurrency(threads.max(1) as u16))
        .run(
            reconcile,
            |_, _, _| Action::requeue(Duration::from_secs(30)),
            context,
        )
}

async fn reconcile(plan: Arc<Plan>, ctx: Arc<ReconciliationContext>) -> Result<Action, ReconcileError> {
    if plan.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let namespace = plan
        .metadata
        .namespace
        .clone()
        .ok_or(ReconcileError::PreconditionFailed("namespace not set"))?;
    let plan_name = plan.name_any();

    let plans_api = Api::<Plan>::namespaced(ctx.client.clone(), &namespace);
    let jobs_api = Api::<Job>::namespaced(ctx.client.clone(), &namespace);
    let secrets_api = Api::<Secret>::namespaced(ctx.client.clone(), &namespace);
    let nodes_api = Api::<Node>::all(ctx.client.clone());

    let all_secrets = secrets_api.list(&ListParams::default()).await?;
    let existing_secret_names: BTreeSet<String> = all_secrets.iter().map(|s| s.name_any()).collect();
    let secrets_by_name: BTreeMap<String, k8s_openapi::api::core::v1::Secret> =
        all_secrets.into_iter().map(|s| (s.name_any(), s)).collect();

    let recorder = Recorder::new(ctx.client.clone(), ctx.reporter.clone());
    let plan_ref = plan.object_ref(&());

    let status_outcome = reconcile_status(
        &plan,
        &ctx.channel_client,
        &ctx.cluster_id,
        &ctx.config,
        &existing_secret_names,
        &secrets_by_name,
    )
    .await;

    let mut status = status_outcome.status;

    let all_nodes = nodes_api.list(&ListParams::default()).await?.items;
    let nodes_by_name: BTreeMap<String, Node> = all_nodes
        .iter()
        .map(|n| (n.metadata.name.clone().unwrap_or_default(), n.clone()))
        .collect();

    let generate_outcome = generate(&plan, &status, status_outcome.ready, &all_nodes, Utc::now(), &ctx.config);
    status = generate_outcome.status;

    // Persist status (including `status.applying`) before creating Jobs: the
    // generating handler built these Jobs unpaused on the assumption that by
    // the time they go live, `status.applying` already records them. The
    // returned object carries the bumped `resourceVersion`, which the second
    // persist below must use as its base or the apiserver rejects it with a
    // 409 conflict.
    let plan_after_first_persist = persist_status(&plans_api, &plan, status.clone()).await?;

    for job in generate_outcome.jobs {
        if jobs_api.get_opt(&job.name_any()).await?.is_none() {
            info!("Creating job {} for plan {plan_name}", job.name_any());
            jobs_api
                .create(
                    &PostParams {
                        field_manager: Some(FIELD_MANAGER.into()),
                        ..Default::default()
                    },
                    &job,
                )
                .await?;
        }
    }

    let owned_jobs = jobs_api
        .list(&ListParams::default().labels(&format!("{}={plan_name}", labels::LABEL_PLAN)))
        .await?
        .items;

    let jobs_outcome = reconcile_jobs(&plan, &owned_jobs, &nodes_by_name, &mut status, Utc::now());

    for action in &jobs_outcome.actions {
        if action.delete {
            debug!("Deleting stale job {}", action.job_name);
            jobs_api.delete(&action.job_name, &Default::default()).await?;
            continue;
        }

        if let Some(node_name) = &action.node_name {
            let patch = serde_json::json!({
                "spec": { "unschedulable": !action.uncordon_node },
            });
            if action.uncordon_node {
                nodes_api
                    .patch(
                        node_name,
                        &PatchParams::apply(FIELD_MANAGER),
                        &Patch::Merge(patch),
                    )
                    .await?;
            }

            if let Some(hash) = &action.stamp_node_label {
                let label_patch = serde_json::json!({
                    "metadata": {
                        "labels": { labels::plan_label(&plan_name): hash }
                    }
                });
                nodes_api
                    .patch(
                        node_name,
                        &PatchParams::apply(FIELD_MANAGER),
                        &Patch::Merge(label_patch),
                    )
                    .await?;
            }
        }
    }

    persist_status(&plans_api, &plan_after_first_persist, status).await?;

    for event in status_outcome
        .events
        .into_iter()
        .chain(generate_outcome.events)
        .chain(jobs_outcome.events)
    {
        recorder
            .publish(
                &Event {
                    type_: event.type_,
                    reason: event.reason.to_string(),
                    note: Some(event.note),
                    action: "Reconcile".to_string(),
                    secondary: None,
                },
                &plan_ref,
            )
            .await?;
    }

    if let Some(err) = status_outcome.retry_error {
        return Err(ReconcileError::Resolve(err));
    }

    let requeue_after = [
        status_outcome.requeue_after,
        generate_outcome.requeue_after,
        jobs_outcome.requeue_after,
    ]
    .into_iter()
    .flatten()
    .min()
    .unwrap_or(Duration::from_secs(60));

    Ok(Action::requeue(requeue_after))
}

/// Replaces `.status` and returns the apiserver's response, which carries the
/// freshly bumped `resourceVersion` - callers making a second persist later in
/// the same reconcile must base it on this return value, not the original
/// `plan`, or `replace_status` rejects the stale version with a 409 conflict.
async fn persist_status(api: &Api<Plan>, plan: &Plan, status: crate::v1::resources::PlanStatus) -> Result<Plan, ReconcileError> {
    let mut patched = plan.clone();
    patched.status = Some(status);
    let data = serde_json::to_vec(&patched)?;
    let updated = api.replace_status(&plan.name_any(), &PostParams::default(), data).await?;
    Ok(updated)
}
