//! Cluster access seam.
//!
//! Everything the engine does against a cluster goes through [`ClusterClient`],
//! so the same coordinator drives the host cluster, a nested sandbox, or an
//! in-memory fake in tests.

use std::collections::BTreeMap;

use {
    async_trait::async_trait,
    k8s_openapi::api::{
        batch::v1::Job,
        core::v1::{Event, Namespace, Node, Pod, Service},
    },
    kube::{
        Client,
        api::{
            Api, DeleteParams, DynamicObject, GroupVersionKind, ListParams, LogParams, Patch,
            PatchParams, PostParams, PropagationPolicy,
        },
        discovery::{self, Scope},
    },
    tracing::debug,
};

#[cfg(test)]
use mockall::automock;

use crate::{
    error::{Context, Error, Result, is_conflict, is_not_found},
    types::WorkloadKind,
};

/// Field manager recorded on every write.
pub const FIELD_MANAGER: &str = "mender-shadow";

/// Cluster operations used by the verification engine.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Server version string; used as a cheap reachability probe.
    async fn ping(&self) -> Result<String>;

    /// Create a namespace. An existing namespace with the same name is not an error.
    async fn create_namespace(&self, namespace: &Namespace) -> Result<()>;

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>>;

    async fn list_namespaces(&self, label_selector: &str) -> Result<Vec<Namespace>>;

    /// Merge labels and annotations into a namespace's metadata.
    async fn patch_namespace_metadata(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
        annotations: BTreeMap<String, String>,
    ) -> Result<()>;

    /// Delete a namespace. A missing namespace is not an error.
    async fn delete_namespace(&self, name: &str) -> Result<()>;

    async fn get_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    async fn create_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<()>;

    /// Strategic-merge patch a workload.
    async fn patch_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()>;

    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>>;

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<()>;

    /// List pods; an empty selector lists every pod in the namespace.
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        since_seconds: Option<i64>,
    ) -> Result<String>;

    async fn list_events(&self, namespace: &str) -> Result<Vec<Event>>;

    async fn list_nodes(&self) -> Result<Vec<Node>>;

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<()>;

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>>;

    /// Delete a job and its pods. A missing job is not an error.
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()>;

    /// Server-side apply a single manifest document into `namespace`.
    ///
    /// Namespaced documents always land in `namespace`, whatever they declare.
    /// Cluster-scoped documents are refused unless `allow_cluster_scoped`.
    async fn apply_manifest(
        &self,
        namespace: &str,
        manifest: &serde_json::Value,
        allow_cluster_scoped: bool,
    ) -> Result<()>;
}

/// Logs of every pod matching `label_selector`, each block headed by the pod name.
///
/// Pods whose logs cannot be fetched are noted inline instead of failing the call.
pub async fn logs_for_selector(
    client: &dyn ClusterClient,
    namespace: &str,
    label_selector: &str,
    since_seconds: Option<i64>,
) -> Result<String> {
    let pods = client.list_pods(namespace, label_selector).await?;
    let mut out = String::new();
    for pod in pods {
        let Some(name) = pod.metadata.name else {
            continue;
        };
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        match client.pod_logs(namespace, &name, since_seconds).await {
            Ok(logs) => out.push_str(&format!("==> {name} <==\n{logs}")),
            Err(e) => out.push_str(&format!("==> {name} <==\n(logs unavailable: {e})\n")),
        }
    }
    Ok(out)
}

/// Production [`ClusterClient`] backed by a `kube::Client`.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Client for the cluster selected by the ambient kubeconfig or in-cluster config.
    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    fn workloads(&self, kind: WorkloadKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &kind.api_resource())
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn ping(&self) -> Result<String> {
        let info = self.client.apiserver_version().await?;
        Ok(info.git_version)
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.create(&PostParams::default(), namespace).await {
            Ok(_) => Ok(()),
            Err(e) if is_conflict(&e) => {
                debug!(
                    namespace = namespace.metadata.name.as_deref().unwrap_or_default(),
                    "namespace already exists"
                );
                Ok(())
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn list_namespaces(&self, label_selector: &str) -> Result<Vec<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default().labels(label_selector)).await?;
        Ok(list.items)
    }

    async fn patch_namespace_metadata(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
        annotations: BTreeMap<String, String>,
    ) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let patch = serde_json::json!({
            "metadata": {
                "labels": labels,
                "annotations": annotations,
            }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        Ok(self.workloads(kind, namespace).get_opt(name).await?)
    }

    async fn create_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<()> {
        self.workloads(kind, namespace)
            .create(&PostParams::default(), object)
            .await?;
        Ok(())
    }

    async fn patch_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()> {
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.into()),
            ..PatchParams::default()
        };
        self.workloads(kind, namespace)
            .patch(name, &params, &Patch::Strategic(patch))
            .await?;
        Ok(())
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), service).await?;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut params = ListParams::default();
        if !label_selector.is_empty() {
            params = params.labels(label_selector);
        }
        Ok(api.list(&params).await?.items)
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        since_seconds: Option<i64>,
    ) -> Result<String> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = LogParams {
            since_seconds,
            tail_lines: Some(2000),
            ..LogParams::default()
        };
        Ok(api.logs(pod, &params).await?)
    }

    async fn list_events(&self, namespace: &str) -> Result<Vec<Event>> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<()> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), job).await?;
        Ok(())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..DeleteParams::default()
        };
        match api.delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_manifest(
        &self,
        namespace: &str,
        manifest: &serde_json::Value,
        allow_cluster_scoped: bool,
    ) -> Result<()> {
        let mut object: DynamicObject = serde_json::from_value(manifest.clone())?;
        let types = object
            .types
            .as_ref()
            .context("manifest is missing apiVersion/kind")?;
        let name = object
            .metadata
            .name
            .clone()
            .context("manifest is missing metadata.name")?;
        let gvk = GroupVersionKind::try_from(types)
            .map_err(|e| Error::external("invalid apiVersion", e))?;
        let (resource, caps) = discovery::pinned_kind(&self.client, &gvk).await?;

        let api: Api<DynamicObject> = match caps.scope {
            Scope::Namespaced => {
                object.metadata.namespace = Some(namespace.to_string());
                Api::namespaced_with(self.client.clone(), namespace, &resource)
            },
            Scope::Cluster if allow_cluster_scoped => {
                object.metadata.namespace = None;
                Api::all_with(self.client.clone(), &resource)
            },
            Scope::Cluster => {
                return Err(Error::message(format!(
                    "cluster-scoped {} {name} refused: the sandbox shares the host control plane",
                    gvk.kind
                )));
            },
        };
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&name, &params, &Patch::Apply(&object)).await?;
        debug!(kind = %gvk.kind, name = %name, namespace, "applied manifest");
        Ok(())
    }
}
