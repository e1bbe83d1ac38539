//! Host namespace metadata: the only durable record of a shadow environment.
//!
//! A discovery label marks the namespace; annotations carry identity and the
//! last projected status. Everything else is lost on restart.

use std::collections::BTreeMap;

use {
    chrono::{DateTime, Utc},
    k8s_openapi::{api::core::v1::Namespace, apimachinery::pkg::apis::meta::v1::ObjectMeta},
    mender_config::ShadowRuntimeKind,
    tracing::{debug, warn},
};

use crate::{
    cluster::ClusterClient,
    error::Result,
    types::{ShadowEnvironment, ShadowStatus, WorkloadKind},
};

pub const DISCOVERY_LABEL: &str = "mender.io/shadow";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "mender";

pub const SHADOW_ID_ANNOTATION: &str = "mender.io/shadow-id";
pub const SOURCE_ANNOTATION: &str = "mender.io/source";
pub const RUNTIME_ANNOTATION: &str = "mender.io/runtime";
pub const TARGET_NAMESPACE_ANNOTATION: &str = "mender.io/target-namespace";
pub const STATUS_ANNOTATION: &str = "mender.io/status";
pub const STATUS_UPDATED_ANNOTATION: &str = "mender.io/status-updated-at";

/// Selector matching every shadow host namespace.
#[must_use]
pub fn discovery_selector() -> String {
    format!("{DISCOVERY_LABEL}=true")
}

fn status_annotations(status: ShadowStatus, at: DateTime<Utc>) -> BTreeMap<String, String> {
    BTreeMap::from([
        (STATUS_ANNOTATION.to_string(), status.as_str().to_string()),
        (STATUS_UPDATED_ANNOTATION.to_string(), at.to_rfc3339()),
    ])
}

/// Host namespace object for a new environment.
#[must_use]
pub fn host_namespace(env: &ShadowEnvironment) -> Namespace {
    let labels = BTreeMap::from([
        (DISCOVERY_LABEL.to_string(), "true".to_string()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
    ]);
    let mut annotations = status_annotations(env.status, Utc::now());
    annotations.extend([
        (SHADOW_ID_ANNOTATION.to_string(), env.id.clone()),
        (SOURCE_ANNOTATION.to_string(), env.source_ref()),
        (RUNTIME_ANNOTATION.to_string(), env.runtime.to_string()),
        (TARGET_NAMESPACE_ANNOTATION.to_string(), env.namespace.clone()),
    ]);
    Namespace {
        metadata: ObjectMeta {
            name: Some(env.host_namespace.clone()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..ObjectMeta::default()
        },
        ..Namespace::default()
    }
}

/// Write `status` onto the host namespace. Failures are logged, never returned.
pub async fn project_status(
    client: &dyn ClusterClient,
    host_namespace: &str,
    status: ShadowStatus,
) {
    let annotations = status_annotations(status, Utc::now());
    match client
        .patch_namespace_metadata(host_namespace, BTreeMap::new(), annotations)
        .await
    {
        Ok(()) => debug!(namespace = host_namespace, %status, "projected status"),
        Err(e) => {
            warn!(namespace = host_namespace, %status, error = %e, "failed to project status");
        },
    }
}

fn parse_source(raw: &str) -> Option<(String, WorkloadKind, String)> {
    let mut parts = raw.splitn(3, '/');
    let namespace = parts.next().filter(|s| !s.is_empty())?;
    let kind = parts.next()?.parse().ok()?;
    let name = parts.next().filter(|s| !s.is_empty())?;
    Some((namespace.to_string(), kind, name.to_string()))
}

fn is_terminating(ns: &Namespace) -> bool {
    ns.metadata.deletion_timestamp.is_some()
        || ns
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .is_some_and(|phase| phase == "Terminating")
}

/// Rebuild an environment from its host namespace.
///
/// Returns `None` for namespaces that are not shadows, are being deleted, or
/// carry unreadable annotations. Logs and evidence are not recoverable.
#[must_use]
pub fn environment_from_namespace(ns: &Namespace) -> Option<ShadowEnvironment> {
    let labels = ns.metadata.labels.as_ref()?;
    if labels.get(DISCOVERY_LABEL).map(String::as_str) != Some("true") || is_terminating(ns) {
        return None;
    }
    let host_namespace = ns.metadata.name.clone()?;
    let annotations = ns.metadata.annotations.as_ref()?;
    let id = annotations.get(SHADOW_ID_ANNOTATION)?.clone();
    let Some((source_namespace, kind, name)) =
        annotations.get(SOURCE_ANNOTATION).and_then(|s| parse_source(s))
    else {
        warn!(namespace = %host_namespace, "shadow namespace has no readable source annotation");
        return None;
    };
    let status = annotations
        .get(STATUS_ANNOTATION)
        .and_then(|s| s.parse().ok())
        .unwrap_or(ShadowStatus::Error);
    let runtime = annotations
        .get(RUNTIME_ANNOTATION)
        .and_then(|s| s.parse().ok())
        .unwrap_or(ShadowRuntimeKind::Vcluster);
    let namespace = annotations
        .get(TARGET_NAMESPACE_ANNOTATION)
        .cloned()
        .unwrap_or_else(|| source_namespace.clone());
    let created_at = ns
        .metadata
        .creation_timestamp
        .as_ref()
        .map_or_else(Utc::now, |t| t.0);

    Some(ShadowEnvironment {
        id,
        namespace,
        host_namespace,
        source_namespace,
        source_resource_name: name,
        source_resource_kind: kind,
        runtime,
        status,
        created_at,
        health_score: 0.0,
        logs: vec!["recovered from host namespace metadata".into()],
        error: None,
        test_results: None,
        credentials_ref: None,
    })
}

/// Every shadow environment visible in the host cluster.
pub async fn discover(client: &dyn ClusterClient) -> Result<Vec<ShadowEnvironment>> {
    let namespaces = client.list_namespaces(&discovery_selector()).await?;
    Ok(namespaces
        .iter()
        .filter_map(environment_from_namespace)
        .collect())
}
