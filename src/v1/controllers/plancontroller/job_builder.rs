//! Templates the per-node Job for a plan wave (component C6).

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Capabilities, Container, DownwardAPIVolumeFile, DownwardAPIVolumeSource, EnvVar,
    EnvVarSource, HostPathVolumeSource, Node, NodeAffinity, NodeSelector as NodeAffinitySelector,
    NodeSelectorRequirement, NodeSelectorTerm, ObjectFieldSelector, PodAffinityTerm,
    PodAntiAffinity, PodSpec, PodTemplateSpec, SecretVolumeSource, SecurityContext, Toleration,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use kube::ResourceExt as _;

use crate::config::Config;
use crate::v1::controllers::plancontroller::duration;
use crate::v1::labels;
use crate::v1::resources::{ContainerSpec, DrainSpec, Plan, SecretSpec, VolumeSpec};

const HOST_ROOT_MOUNT: &str = "/host";
const POD_INFO_MOUNT: &str = "/run/system-upgrade/pod";
const SECRETS_MOUNT_BASE: &str = "/run/system-upgrade/secrets";
const USER_VOLUME_MOUNT_BASE: &str = "/run/system-upgrade/volumes";
const UNSCHEDULABLE_TAINT: &str = "node.kubernetes.io/unschedulable";

fn safe_concat(parts: &[&str]) -> String {
    let joined = parts.join("-");
    if joined.len() <= 63 {
        joined
    } else {
        joined[..63].trim_end_matches('-').to_string()
    }
}

fn job_name(plan_name: &str, node_name: &str, latest_hash: &str) -> String {
    let hash_prefix: String = latest_hash.chars().take(8).collect();
    safe_concat(&["apply", plan_name, "on", node_name, &hash_prefix])
}

fn active_deadline_seconds(spec_value: Option<i64>, config: &Config) -> i64 {
    let deadline = spec_value.unwrap_or(config.job_active_deadline_seconds);
    match config.job_max_active_deadline_seconds {
        Some(max) => deadline.min(max),
        None => deadline,
    }
}

fn ttl_seconds_after_finished(plan: &Plan, config: &Config) -> i64 {
    let base = config.job_ttl_seconds_after_finished;
    match plan
        .spec
        .post_complete_delay
        .as_deref()
        .and_then(|d| duration::parse_non_negative(d).ok())
    {
        Some(delay) => base.max(delay.as_secs() as i64 + 60),
        None => base,
    }
}

fn secret_volume_name(secret_name: &str) -> String {
    safe_concat(&["secret", secret_name])
}

fn secret_mount_path(secret: &SecretSpec) -> String {
    match &secret.path {
        Some(p) if p.starts_with('/') => p.clone(),
        Some(p) => format!("{SECRETS_MOUNT_BASE}/{p}"),
        None => format!("{SECRETS_MOUNT_BASE}/{}", secret.name),
    }
}

fn user_volume_name(volume: &VolumeSpec) -> String {
    safe_concat(&["volume", &volume.name])
}

fn pod_info_downward_file() -> DownwardAPIVolumeFile {
    DownwardAPIVolumeFile {
        path: "labels".to_string(),
        field_ref: Some(ObjectFieldSelector {
            field_path: "metadata.labels".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn job_volumes(plan: &Plan) -> Vec<Volume> {
    let mut volumes = vec![
        Volume {
            name: "host-root".to_string(),
            host_path: Some(HostPathVolumeSource {
                path: "/".to_string(),
                type_: None,
            }),
            ..Default::default()
        },
        Volume {
            name: "pod-info".to_string(),
            downward_api: Some(DownwardAPIVolumeSource {
                items: Some(vec![
                    pod_info_downward_file(),
                    DownwardAPIVolumeFile {
                        path: "annotations".to_string(),
                        field_ref: Some(ObjectFieldSelector {
                            field_path: "metadata.annotations".to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];

    if let Some(secrets) = &plan.spec.secrets {
        for secret in secrets {
            volumes.push(Volume {
                name: secret_volume_name(&secret.name),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret.name.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
    }

    let mut seen_user_volumes = std::collections::HashSet::new();
    for container_spec in [&plan.spec.prepare, &Some(plan.spec.upgrade.clone())]
        .into_iter()
        .flatten()
    {
        if let Some(user_volumes) = &container_spec.volumes {
            for uv in user_volumes {
                if seen_user_volumes.insert(uv.name.clone()) {
                    volumes.push(Volume {
                        name: user_volume_name(uv),
                        host_path: Some(HostPathVolumeSource {
                            path: uv.host_path.clone(),
                            type_: None,
                        }),
                        ..Default::default()
                    });
                }
            }
        }
    }

    volumes
}

fn base_volume_mounts(spec: &ContainerSpec) -> Vec<VolumeMount> {
    let mut mounts = vec![
        VolumeMount {
            name: "host-root".to_string(),
            mount_path: HOST_ROOT_MOUNT.to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: "pod-info".to_string(),
            mount_path: POD_INFO_MOUNT.to_string(),
            read_only: Some(true),
            ..Default::default()
        },
    ];

    if let Some(volumes) = &spec.volumes {
        for uv in volumes {
            mounts.push(VolumeMount {
                name: user_volume_name(uv),
                mount_path: format!("{USER_VOLUME_MOUNT_BASE}/{}", uv.name),
                ..Default::default()
            });
        }
    }

    mounts
}

fn with_secret_mounts(mut mounts: Vec<VolumeMount>, secrets: &[SecretSpec]) -> Vec<VolumeMount> {
    for secret in secrets {
        mounts.push(VolumeMount {
            name: secret_volume_name(&secret.name),
            mount_path: secret_mount_path(secret),
            read_only: Some(true),
            ..Default::default()
        });
    }
    mounts
}

fn downward_env() -> Vec<EnvVar> {
    vec![
        EnvVar {
            name: "SYSTEM_UPGRADE_NODE_NAME".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "spec.nodeName".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
        EnvVar {
            name: "SYSTEM_UPGRADE_POD_NAME".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.name".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
        EnvVar {
            name: "SYSTEM_UPGRADE_POD_UID".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.uid".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
    ]
}

fn plan_env(plan_name: &str, latest_hash: &str, latest_version: &str) -> Vec<EnvVar> {
    vec![
        EnvVar {
            name: "SYSTEM_UPGRADE_PLAN_NAME".to_string(),
            value: Some(plan_name.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "SYSTEM_UPGRADE_PLAN_LATEST_HASH".to_string(),
            value: Some(latest_hash.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "SYSTEM_UPGRADE_PLAN_LATEST_VERSION".to_string(),
            value: Some(latest_version.to_string()),
            ..Default::default()
        },
    ]
}

/// Defaults a container's image tag to `latest_version` if the image was declared without one.
fn with_image_tag_default(image: &str, latest_version: &str) -> String {
    let (repo, has_tag) = match image.rsplit_once(':') {
        // a ':' that's part of a registry port (host:port/repo) doesn't count as a tag
        Some((repo, tag)) if !tag.contains('/') => (repo, true),
        _ => (image, false),
    };

    if has_tag {
        image.to_string()
    } else {
        format!("{repo}:{latest_version}")
    }
}

fn default_security_context(config: &Config) -> SecurityContext {
    SecurityContext {
        privileged: Some(config.privileged),
        capabilities: Some(Capabilities {
            add: Some(vec!["CAP_SYS_BOOT".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_container(
    name: &str,
    spec: &ContainerSpec,
    plan: &Plan,
    latest_hash: &str,
    latest_version: &str,
    config: &Config,
    is_upgrade_container: bool,
) -> Container {
    let mut mounts = base_volume_mounts(spec);
    if let Some(secrets) = &plan.spec.secrets {
        mounts = with_secret_mounts(mounts, secrets);
    }

    let mut env = downward_env();
    if is_upgrade_container {
        env.extend(plan_env(
            plan.name_any().as_str(),
            latest_hash,
            latest_version,
        ));
    }
    if let Some(user_env) = &spec.env {
        env.extend(user_env.clone());
    }

    let security_context = if config.allow_user_defined_security_context {
        spec.security_context
            .clone()
            .or_else(|| Some(default_security_context(config)))
    } else {
        Some(default_security_context(config))
    };

    Container {
        name: name.to_string(),
        image: Some(with_image_tag_default(&spec.image, latest_version)),
        image_pull_policy: Some(config.image_pull_policy.clone()),
        command: spec.command.clone(),
        args: spec.args.clone(),
        env: Some(env),
        env_from: spec.env_from.clone(),
        volume_mounts: Some(mounts),
        security_context,
        ..Default::default()
    }
}

fn drain_args(node_name: &str, drain: &DrainSpec) -> Vec<String> {
    let mut args = vec!["drain".to_string(), node_name.to_string()];
    args.push("--ignore-daemonsets".to_string());

    if drain.delete_emptydir_data.unwrap_or(false) {
        args.push("--delete-emptydir-data".to_string());
    }
    if drain.force.unwrap_or(false) {
        args.push("--force".to_string());
    }
    if drain.disable_eviction.unwrap_or(false) {
        args.push("--disable-eviction".to_string());
    }
    if let Some(grace) = drain.grace_period {
        args.push(format!("--grace-period={grace}"));
    }
    if let Some(timeout) = &drain.timeout {
        args.push(format!("--timeout={timeout}"));
    }
    if let Some(skip) = drain.skip_wait_for_delete_timeout {
        args.push(format!("--skip-wait-for-delete-timeout={skip}"));
    }

    let selector = match &drain.pod_selector {
        Some(user_selector) => format!("!{},{user_selector}", labels::LABEL_CONTROLLER),
        None => format!("!{}", labels::LABEL_CONTROLLER),
    };
    args.push(format!("--pod-selector={selector}"));

    args
}

fn init_containers(
    plan: &Plan,
    node_name: &str,
    latest_hash: &str,
    latest_version: &str,
    config: &Config,
) -> Vec<Container> {
    let mut containers = Vec::new();

    if let Some(prepare) = &plan.spec.prepare {
        containers.push(build_container(
            "prepare",
            prepare,
            plan,
            latest_hash,
            latest_version,
            config,
            false,
        ));
    }

    if let Some(drain) = &plan.spec.drain {
        containers.push(Container {
            name: "drain".to_string(),
            image: Some(config.kubectl_image.clone()),
            image_pull_policy: Some(config.image_pull_policy.clone()),
            command: Some(vec!["kubectl".to_string()]),
            args: Some(drain_args(node_name, drain)),
            ..Default::default()
        });
    } else if plan.spec.cordon.unwrap_or(false) {
        containers.push(Container {
            name: "cordon".to_string(),
            image: Some(config.kubectl_image.clone()),
            image_pull_policy: Some(config.image_pull_policy.clone()),
            command: Some(vec!["kubectl".to_string()]),
            args: Some(vec!["cordon".to_string(), node_name.to_string()]),
            ..Default::default()
        });
    }

    containers
}

fn node_affinity(plan_name: &str, node_name: &str, exclusive: bool) -> Affinity {
    let mut anti_affinity_terms = vec![PodAffinityTerm {
        label_selector: Some(LabelSelector {
            match_labels: Some(BTreeMap::from([(
                labels::LABEL_PLAN.to_string(),
                plan_name.to_string(),
            )])),
            match_expressions: None,
        }),
        topology_key: labels::HOSTNAME_LABEL.to_string(),
        ..Default::default()
    }];

    if exclusive {
        anti_affinity_terms.push(PodAffinityTerm {
            label_selector: Some(LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    labels::LABEL_EXCLUSIVE.to_string(),
                    "true".to_string(),
                )])),
                match_expressions: None,
            }),
            topology_key: labels::HOSTNAME_LABEL.to_string(),
            ..Default::default()
        });
    }

    Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeAffinitySelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_fields: Some(vec![NodeSelectorRequirement {
                        key: "metadata.name".to_string(),
                        operator: "In".to_string(),
                        values: Some(vec![node_name.to_string()]),
                    }]),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        }),
        pod_anti_affinity: Some(PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(anti_affinity_terms),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn tolerations(plan: &Plan) -> Vec<Toleration> {
    let mut tolerations = vec![Toleration {
        key: Some(UNSCHEDULABLE_TAINT.to_string()),
        operator: Some("Exists".to_string()),
        effect: Some("NoSchedule".to_string()),
        ..Default::default()
    }];

    if let Some(user_tolerations) = &plan.spec.tolerations {
        tolerations.extend(user_tolerations.clone());
    }

    tolerations
}

fn copy_metadata(source: &Option<BTreeMap<String, String>>) -> BTreeMap<String, String> {
    const RESERVED: &[&str] = &[
        labels::LABEL_CONTROLLER,
        labels::LABEL_NODE,
        labels::LABEL_PLAN,
        labels::LABEL_VERSION,
        labels::LABEL_EXCLUSIVE,
        labels::ANNOTATION_TTL_SECONDS_AFTER_FINISHED,
        labels::ANNOTATION_INCLUDE_IN_DIGEST,
    ];

    source
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|(k, _)| !RESERVED.contains(&k.as_str()))
        .collect()
}

/// Builds the Job for `node` in the current wave. `paused` controls whether
/// `parallelism` starts at `0` (the node is not yet recorded in
/// `status.applying`) or `1` (the two-pass unpause protocol's second pass).
pub fn build_job(
    plan: &Plan,
    node: &Node,
    latest_hash: &str,
    paused: bool,
    config: &Config,
) -> Job {
    let plan_name = plan.name_any();
    let latest_version = plan
        .status
        .as_ref()
        .and_then(|s| s.latest_version.as_deref())
        .unwrap_or_default();
    let node_name = node.metadata.name.clone().unwrap_or_default();

    let mut labels_map = copy_metadata(&plan.metadata.labels);
    labels_map.insert(labels::LABEL_CONTROLLER.to_string(), plan_name.clone());
    labels_map.insert(labels::LABEL_NODE.to_string(), node_name.clone());
    labels_map.insert(labels::LABEL_PLAN.to_string(), plan_name.clone());
    labels_map.insert(labels::LABEL_VERSION.to_string(), latest_version.to_string());
    labels_map.insert(
        labels::LABEL_EXCLUSIVE.to_string(),
        plan.spec.exclusive.unwrap_or(false).to_string(),
    );
    labels_map.insert(labels::plan_label(&plan_name), latest_hash.to_string());

    let mut annotations_map = copy_metadata(&plan.metadata.annotations);
    annotations_map.insert(
        labels::ANNOTATION_TTL_SECONDS_AFTER_FINISHED.to_string(),
        ttl_seconds_after_finished(plan, config).to_string(),
    );

    let owner = OwnerReference {
        api_version: "upgrade.cattle.io/v1".to_string(),
        kind: "Plan".to_string(),
        name: plan_name.clone(),
        uid: plan.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
        ..Default::default()
    };

    let upgrade_container = build_container(
        "upgrade",
        &plan.spec.upgrade,
        plan,
        latest_hash,
        latest_version,
        config,
        true,
    );

    let init_containers = init_containers(plan, &node_name, latest_hash, latest_version, config);

    let pod_spec = PodSpec {
        affinity: Some(node_affinity(&plan_name, &node_name, plan.spec.exclusive.unwrap_or(false))),
        tolerations: Some(tolerations(plan)),
        restart_policy: Some("Never".to_string()),
        host_ipc: Some(true),
        host_pid: Some(true),
        host_network: Some(true),
        dns_policy: Some("ClusterFirstWithHostNet".to_string()),
        service_account_name: plan.spec.service_account_name.clone(),
        priority_class_name: plan.spec.priority_class_name.clone(),
        image_pull_secrets: plan.spec.image_pull_secrets.clone(),
        init_containers: if init_containers.is_empty() {
            None
        } else {
            Some(init_containers)
        },
        containers: vec![upgrade_container],
        volumes: Some(job_volumes(plan)),
        ..Default::default()
    };

    let mut job = Job::default();
    job.metadata.name = Some(job_name(&plan_name, &node_name, latest_hash));
    job.metadata.namespace = plan.metadata.namespace.clone();
    job.metadata.labels = Some(labels_map);
    job.metadata.annotations = Some(annotations_map);
    job.metadata.owner_references = Some(vec![owner]);

    job.spec = Some(JobSpec {
        parallelism: Some(if paused { 0 } else { 1 }),
        completions: Some(1),
        backoff_limit: Some(config.job_backoff_limit),
        active_deadline_seconds: Some(active_deadline_seconds(
            plan.spec.job_active_deadline_secs,
            config,
        )),
        ttl_seconds_after_finished: Some(ttl_seconds_after_finished(plan, config)),
        pod_replacement_policy: Some(config.pod_replacement_policy.clone()),
        template: PodTemplateSpec {
            metadata: None,
            spec: Some(pod_spec),
        },
        ..Default::default()
    });

    job
}
