//! Derives a stable per-cluster identifier from the `kube-system` namespace's
//! UID, mirroring the convention used to tag outbound channel requests with
//! `X-SUC-Cluster-ID` without requiring any cluster-scoped configuration.

use k8s_openapi::api::core::v1::Namespace;
use kube::Api;

pub async fn derive(client: &kube::Client) -> Result<String, kube::Error> {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let kube_system = namespaces.get("kube-system").await?;
    Ok(kube_system.metadata.uid.unwrap_or_default())
}
