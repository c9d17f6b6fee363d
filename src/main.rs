use std::time::Duration;

use clap::Parser;
use futures_util::StreamExt as _;
use kube::CustomResourceExt as _;
use kube::config::KubeConfigOptions;
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use tracing::{debug, info, warn};
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt as _};

mod config;
mod utils;
mod v1;

#[derive(Parser, Debug, Clone)]
#[command(name = "system-upgrade-controller")]
struct Args {
    /// Name this controller reports itself as in Events and the leader-election lease
    #[arg(long, env = "SYSTEM_UPGRADE_CONTROLLER_NAME", default_value = "system-upgrade-controller")]
    name: String,

    /// Namespace to look for Plans, Jobs, and Secrets in, and to run leader election in
    #[arg(long, env = "SYSTEM_UPGRADE_CONTROLLER_NAMESPACE", default_value = "system-upgrade")]
    namespace: String,

    /// Path to a kubeconfig file; falls back to in-cluster config when unset
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<String>,

    /// Kubernetes API server URL override
    #[arg(long, env = "SYSTEM_UPGRADE_CONTROLLER_MASTER")]
    master: Option<String>,

    /// Reconciliation worker threads
    #[arg(long, env = "SYSTEM_UPGRADE_CONTROLLER_THREADS", default_value_t = 2)]
    threads: usize,

    /// Raise logging to debug level when RUST_LOG isn't set
    #[arg(long, env = "SYSTEM_UPGRADE_CONTROLLER_DEBUG", default_value_t = false)]
    debug: bool,

    /// Run leader election before starting the controller, so only one replica reconciles
    #[arg(long, env = "SYSTEM_UPGRADE_CONTROLLER_LEADER_ELECT", default_value_t = false)]
    leader_elect: bool,

    /// This replica's identity in the leader-election lease; defaults to the pod's hostname
    #[arg(long, env = "SYSTEM_UPGRADE_CONTROLLER_NODE_NAME")]
    node_name: Option<String>,

    /// Print the Plan CustomResourceDefinition as YAML and exit
    #[arg(long, default_value_t = false)]
    crd: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if args.crd {
        let crd = v1::Plan::crd();
        println!("{}", serde_yaml::to_string(&crd).unwrap());
        std::process::exit(0);
    }

    setup_tracing(args.debug);

    let kubernetes_client =
        kube::client::Client::try_from(discover_kubernetes_config(&args).await).unwrap();

    let cluster_id = v1::cluster_id::derive(&kubernetes_client)
        .await
        .unwrap_or_else(|e| {
            warn!("failed to derive cluster ID from kube-system namespace: {e}; continuing with an empty one");
            String::new()
        });

    let config = config::Config::from_env();

    if args.leader_elect {
        run_with_leader_election(kubernetes_client, config, cluster_id, &args).await;
    } else {
        run_controller(kubernetes_client, config, cluster_id, &args.namespace, args.threads).await;
    }
}

async fn run_controller(
    client: kube::Client,
    config: config::Config,
    cluster_id: String,
    namespace: &str,
    threads: usize,
) {
    let plan_controller =
        v1::controllers::plancontroller::new(client, config, cluster_id, namespace, threads);

    plan_controller
        .for_each(|res| async move {
            match res {
                Ok(o) => debug!("reconciled {:?}", o),
                Err(e) => warn!("reconcile failed: {:?}", e),
            }
        })
        .await;
}

/// Wraps the controller loop in a leader-election lease so that only one
/// replica is ever reconciling at a time; standby replicas retry acquisition
/// on an interval well inside the lease TTL.
async fn run_with_leader_election(
    client: kube::Client,
    config: config::Config,
    cluster_id: String,
    args: &Args,
) {
    let holder_id = args
        .node_name
        .clone()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| args.name.clone());

    let lease_ttl = Duration::from_secs(15);
    let renew_every = Duration::from_secs(5);

    let leadership = LeaseLock::new(
        client.clone(),
        &args.namespace,
        LeaseLockParams {
            holder_id,
            lease_name: format!("{}-lock", args.name),
            lease_ttl,
        },
    );

    let mut controller_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(renew_every);

    loop {
        tick.tick().await;

        let lease = match leadership.try_acquire_or_renew().await {
            Ok(lease) => lease,
            Err(e) => {
                warn!("leader election renew/acquire failed: {e}");
                if let Some(task) = controller_task.take() {
                    task.abort();
                    warn!("aborted controller after losing contact with the lease");
                }
                continue;
            }
        };

        if matches!(lease, LeaseLockResult::Acquired(_)) {
            if controller_task.is_none() {
                info!("acquired leadership; starting controller");
                let client = client.clone();
                let config = config.clone();
                let cluster_id = cluster_id.clone();
                let namespace = args.namespace.clone();
                let threads = args.threads;
                controller_task = Some(tokio::spawn(async move {
                    run_controller(client, config, cluster_id, &namespace, threads).await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            warn!("lost leadership; stopping controller");
            task.abort();
        }
    }
}

fn setup_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
        .expect("tracing-subscriber setup failed");
}

async fn discover_kubernetes_config(args: &Args) -> kube::Config {
    if let Some(kubeconfig) = &args.kubeconfig {
        let raw = kube::config::Kubeconfig::read_from(kubeconfig).expect("failed to read --kubeconfig");
        if let Ok(config) = kube::Config::from_custom_kubeconfig(raw, &KubeConfigOptions::default()).await {
            return with_master_override(config, args);
        }
    }

    let from_default_kubeconfig = kube::Config::from_kubeconfig(&KubeConfigOptions::default()).await;

    if let Ok(config) = from_default_kubeconfig {
        return with_master_override(config, args);
    }

    let from_incluster_env = kube::Config::incluster_env();

    if let Ok(config) = from_incluster_env {
        return with_master_override(config, args);
    }

    panic!("Failed to find a suitable Kubernetes client config.");
}

fn with_master_override(mut config: kube::Config, args: &Args) -> kube::Config {
    if let Some(master) = &args.master {
        config.cluster_url = master.parse().expect("--master is not a valid URL");
    }
    config
}
