//! Copies a workload and its matching services into a sandbox namespace.

use std::collections::BTreeMap;

use {
    k8s_openapi::{api::core::v1::Service, apimachinery::pkg::apis::meta::v1::ObjectMeta},
    kube::api::DynamicObject,
    serde_json::Value,
    tracing::debug,
};

use crate::{
    cluster::ClusterClient,
    error::{Error, Result},
    types::WorkloadKind,
};

/// Label stamped on every cloned object, pointing back at the shadow.
pub const CLONED_FOR_LABEL: &str = "mender.io/shadow-id";

const DROPPED_ANNOTATIONS: &[&str] = &[
    "kubectl.kubernetes.io/last-applied-configuration",
    "deployment.kubernetes.io/revision",
];

/// What ended up in the sandbox.
#[derive(Debug, Clone, Default)]
pub struct CloneReport {
    pub workload: String,
    pub services: Vec<String>,
    pub pod_labels: BTreeMap<String, String>,
}

/// Where a clone comes from and goes to.
#[derive(Debug, Clone, Copy)]
pub struct CloneRequest<'a> {
    pub shadow_id: &'a str,
    pub kind: WorkloadKind,
    pub source_namespace: &'a str,
    pub name: &'a str,
    pub target_namespace: &'a str,
}

/// Clone the workload and every service selecting its pods.
pub async fn clone_workload(
    source: &dyn ClusterClient,
    target: &dyn ClusterClient,
    request: CloneRequest<'_>,
) -> Result<CloneReport> {
    let original = source
        .get_workload(request.kind, request.source_namespace, request.name)
        .await?
        .ok_or_else(|| {
            Error::provisioning(format!(
                "{} {}/{} not found",
                request.kind, request.source_namespace, request.name
            ))
        })?;

    let pod_labels = pod_template_labels(&original);
    let copy = sanitize_workload(&original, request.target_namespace, request.shadow_id);
    target
        .create_workload(request.kind, request.target_namespace, &copy)
        .await?;
    debug!(
        kind = %request.kind,
        name = request.name,
        namespace = request.target_namespace,
        "cloned workload"
    );

    let mut services = Vec::new();
    for svc in source.list_services(request.source_namespace).await? {
        let Some(selector) = svc.spec.as_ref().and_then(|s| s.selector.as_ref()) else {
            continue;
        };
        if !selector_matches(selector, &pod_labels) {
            continue;
        }
        let copy = sanitize_service(&svc, request.target_namespace, request.shadow_id);
        target.create_service(request.target_namespace, &copy).await?;
        services.push(copy.metadata.name.unwrap_or_default());
    }

    Ok(CloneReport {
        workload: request.name.to_string(),
        services,
        pod_labels,
    })
}

/// Labels on the workload's pod template.
#[must_use]
pub fn pod_template_labels(workload: &DynamicObject) -> BTreeMap<String, String> {
    workload
        .data
        .pointer("/spec/template/metadata/labels")
        .and_then(Value::as_object)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// `true` when every selector pair is present in `labels`. An empty selector
/// matches nothing.
#[must_use]
pub fn selector_matches(
    selector: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
) -> bool {
    !selector.is_empty()
        && selector
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|l| l == v))
}

/// Copy of a workload with server-owned fields removed, retargeted at `namespace`.
#[must_use]
pub fn sanitize_workload(
    original: &DynamicObject,
    namespace: &str,
    shadow_id: &str,
) -> DynamicObject {
    let mut copy = original.clone();
    copy.metadata = clean_metadata(&original.metadata, namespace, shadow_id);
    if let Some(data) = copy.data.as_object_mut() {
        data.remove("status");
    }
    if let Some(template_meta) = copy
        .data
        .pointer_mut("/spec/template/metadata")
        .and_then(Value::as_object_mut)
    {
        template_meta.remove("creationTimestamp");
    }
    copy
}

/// Copy of a service without cluster-assigned addresses or node ports.
///
/// External service types are downgraded to `ClusterIP` so a shadow never
/// claims a load balancer or node port.
#[must_use]
pub fn sanitize_service(original: &Service, namespace: &str, shadow_id: &str) -> Service {
    let mut copy = Service {
        metadata: clean_metadata(&original.metadata, namespace, shadow_id),
        spec: original.spec.clone(),
        status: None,
    };
    if let Some(spec) = copy.spec.as_mut() {
        spec.cluster_ip = None;
        spec.cluster_ips = None;
        spec.health_check_node_port = None;
        spec.load_balancer_ip = None;
        spec.external_ips = None;
        if matches!(spec.type_.as_deref(), Some("LoadBalancer" | "NodePort")) {
            spec.type_ = Some("ClusterIP".into());
            spec.external_traffic_policy = None;
            spec.load_balancer_source_ranges = None;
            spec.allocate_load_balancer_node_ports = None;
        }
        if let Some(ports) = spec.ports.as_mut() {
            for port in ports {
                port.node_port = None;
            }
        }
    }
    copy
}

fn clean_metadata(original: &ObjectMeta, namespace: &str, shadow_id: &str) -> ObjectMeta {
    let mut labels = original.labels.clone().unwrap_or_default();
    labels.insert(CLONED_FOR_LABEL.into(), shadow_id.into());
    let annotations: BTreeMap<String, String> = original
        .annotations
        .iter()
        .flatten()
        .filter(|(k, _)| !DROPPED_ANNOTATIONS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    ObjectMeta {
        name: original.name.clone(),
        namespace: Some(namespace.to_string()),
        labels: Some(labels),
        annotations: (!annotations.is_empty()).then_some(annotations),
        ..ObjectMeta::default()
    }
}
