//! Applies a change set to the cloned workload and waits for the rollout.

use std::time::Duration;

use {
    kube::api::DynamicObject,
    serde_json::{Value, json},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    cluster::ClusterClient,
    error::{Error, Result},
    intents::{NormalizedChange, normalize},
    types::{ApplyOutcome, ChangeSet, WorkloadKind},
    wait::{WaitOutcome, poll_until},
};

/// The workload a change is applied to.
#[derive(Debug, Clone, Copy)]
pub struct ApplyTarget<'a> {
    pub kind: WorkloadKind,
    pub namespace: &'a str,
    pub name: &'a str,
    /// Only a virtual control plane may take cluster-scoped objects; in the
    /// namespace runtime they would reach the host cluster.
    pub allow_cluster_scoped: bool,
}

/// Built-in kinds that have no namespace.
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "APIService",
    "CSIDriver",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "IngressClass",
    "MutatingWebhookConfiguration",
    "Namespace",
    "Node",
    "PersistentVolume",
    "PriorityClass",
    "RuntimeClass",
    "StorageClass",
    "ValidatingAdmissionPolicy",
    "ValidatingWebhookConfiguration",
    "VolumeAttachment",
];

pub struct ChangeApplicator {
    rollout_timeout: Duration,
    poll_interval: Duration,
}

impl ChangeApplicator {
    #[must_use]
    pub fn new(rollout_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            rollout_timeout,
            poll_interval,
        }
    }

    /// Apply `change` to `target`.
    ///
    /// Best effort: manifest and patch failures are recorded in the returned
    /// [`ApplyOutcome`] rather than failing the call, and a rollout that does
    /// not finish in time is noted, not fatal. Only cancellation and a missing
    /// target workload are errors.
    pub async fn apply(
        &self,
        client: &dyn ClusterClient,
        target: ApplyTarget<'_>,
        change: &ChangeSet,
        cancel: &CancellationToken,
    ) -> Result<ApplyOutcome> {
        let (normalized, warnings) = normalize(change);
        let mut outcome = ApplyOutcome {
            warnings,
            ..ApplyOutcome::default()
        };

        for (index, manifest) in normalized.manifests.iter().enumerate() {
            match split_documents(manifest) {
                Ok(documents) => {
                    for doc in documents {
                        let label = describe_document(&doc, index);
                        let doc = match place_document(doc, target) {
                            Ok(doc) => doc,
                            Err(reason) => {
                                warn!(document = %label, %reason, "manifest refused");
                                outcome.manifest_failures.push(format!("{label}: {reason}"));
                                continue;
                            },
                        };
                        match client
                            .apply_manifest(target.namespace, &doc, target.allow_cluster_scoped)
                            .await
                        {
                            Ok(()) => outcome.manifests_applied += 1,
                            Err(e) => {
                                warn!(document = %label, error = %e, "manifest apply failed");
                                outcome.manifest_failures.push(format!("{label}: {e}"));
                            },
                        }
                    }
                },
                Err(e) => outcome
                    .manifest_failures
                    .push(format!("manifest #{index}: invalid YAML: {e}")),
            }
        }

        if normalized.needs_patch() {
            let workload = client
                .get_workload(target.kind, target.namespace, target.name)
                .await?
                .ok_or_else(|| {
                    Error::message(format!(
                        "{} {}/{} disappeared before the change could be applied",
                        target.kind, target.namespace, target.name
                    ))
                })?;
            match build_patch(target.kind, &workload, &normalized) {
                Ok((patch, patch_warnings)) => {
                    outcome.warnings.extend(patch_warnings);
                    if let Some(patch) = patch {
                        match client
                            .patch_workload(target.kind, target.namespace, target.name, &patch)
                            .await
                        {
                            Ok(()) => {
                                outcome.patched = true;
                                info!(name = target.name, "patched workload");
                            },
                            Err(e) => {
                                warn!(name = target.name, error = %e, "workload patch failed");
                                outcome.warnings.push(format!("patch failed: {e}"));
                            },
                        }
                    }
                },
                Err(e) => outcome.warnings.push(e),
            }
        }

        outcome.rollout_complete = self.wait_for_rollout(client, target, cancel).await?;
        if !outcome.rollout_complete {
            outcome.warnings.push(format!(
                "rollout did not complete within {}s",
                self.rollout_timeout.as_secs()
            ));
        }
        Ok(outcome)
    }

    /// `true` once available replicas reach the desired count.
    async fn wait_for_rollout(
        &self,
        client: &dyn ClusterClient,
        target: ApplyTarget<'_>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let probe = move || async move {
            match client
                .get_workload(target.kind, target.namespace, target.name)
                .await
            {
                Ok(Some(obj)) => Ok(rollout_complete(target.kind, &obj).then_some(())),
                Ok(None) => Ok(None),
                Err(e) => {
                    debug!(error = %e, "rollout probe failed");
                    Ok(None)
                },
            }
        };
        let outcome = poll_until(self.poll_interval, self.rollout_timeout, cancel, probe).await?;
        Ok(matches!(outcome, WaitOutcome::Ready(())))
    }
}

/// Split a multi-document YAML string into JSON values, dropping empty documents.
pub fn split_documents(manifest: &str) -> Result<Vec<Value>> {
    use serde::Deserialize;

    let mut docs = Vec::new();
    for document in serde_yaml::Deserializer::from_str(manifest) {
        let value = Value::deserialize(document)?;
        if !value.is_null() {
            docs.push(value);
        }
    }
    Ok(docs)
}

/// Point a document at the target namespace.
///
/// Known cluster-scoped kinds lose their namespace instead, or are refused
/// when the target cannot hold them.
pub fn place_document(
    mut doc: Value,
    target: ApplyTarget<'_>,
) -> std::result::Result<Value, String> {
    let kind = doc.get("kind").and_then(Value::as_str).unwrap_or_default();
    let cluster_scoped = CLUSTER_SCOPED_KINDS.contains(&kind);
    if cluster_scoped && !target.allow_cluster_scoped {
        return Err(format!(
            "cluster-scoped {kind} refused: the sandbox shares the host control plane"
        ));
    }
    let Some(root) = doc.as_object_mut() else {
        return Err("document is not a mapping".to_string());
    };
    let metadata = root
        .entry("metadata")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    let Some(metadata) = metadata.as_object_mut() else {
        return Err("metadata is not a mapping".to_string());
    };
    if cluster_scoped {
        metadata.remove("namespace");
    } else {
        metadata.insert("namespace".into(), json!(target.namespace));
    }
    Ok(doc)
}

fn describe_document(doc: &Value, index: usize) -> String {
    let kind = doc.get("kind").and_then(Value::as_str).unwrap_or("?");
    let name = doc
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or("?");
    format!("manifest #{index} {kind}/{name}")
}

/// Name of the container a change targets: the named one, else the first.
pub fn resolve_container(workload: &DynamicObject, wanted: Option<&str>) -> Option<String> {
    let containers = workload
        .data
        .pointer("/spec/template/spec/containers")
        .and_then(Value::as_array)?;
    let mut names = containers
        .iter()
        .filter_map(|c| c.get("name").and_then(Value::as_str));
    match wanted {
        Some(wanted) => names.find(|n| *n == wanted).map(str::to_string),
        None => names.next().map(str::to_string),
    }
}

/// Build one strategic-merge patch for replicas, image and env.
///
/// Returns `Ok((None, _))` when nothing applicable remains, and warnings for
/// parts of the change that had to be dropped.
pub fn build_patch(
    kind: WorkloadKind,
    workload: &DynamicObject,
    change: &NormalizedChange,
) -> std::result::Result<(Option<Value>, Vec<String>), String> {
    let mut warnings = Vec::new();
    let mut spec = serde_json::Map::new();

    if let Some(replicas) = change.replicas {
        if kind.is_scalable() {
            spec.insert("replicas".into(), json!(replicas));
        } else {
            warnings.push(format!("{kind} has no replica count; ignoring scale to {replicas}"));
        }
    }

    if change.image.is_some() || !change.env.is_empty() {
        let Some(container) = resolve_container(workload, change.container.as_deref()) else {
            let msg = match change.container.as_deref() {
                Some(name) => format!("container {name:?} not found; image/env change skipped"),
                None => "workload has no containers; image/env change skipped".to_string(),
            };
            if spec.is_empty() {
                return Err(msg);
            }
            warnings.push(msg);
            return Ok((Some(json!({ "spec": spec })), warnings));
        };
        let mut entry = serde_json::Map::new();
        entry.insert("name".into(), json!(container));
        if let Some(image) = &change.image {
            entry.insert("image".into(), json!(image));
        }
        if !change.env.is_empty() {
            let env: Vec<Value> = change
                .env
                .iter()
                .map(|(k, v)| json!({ "name": k, "value": v }))
                .collect();
            entry.insert("env".into(), Value::Array(env));
        }
        spec.insert(
            "template".into(),
            json!({ "spec": { "containers": [Value::Object(entry)] } }),
        );
    }

    if spec.is_empty() {
        return Ok((None, warnings));
    }
    Ok((Some(json!({ "spec": spec })), warnings))
}

/// Whether the workload's status shows the desired replicas available.
#[must_use]
pub fn rollout_complete(kind: WorkloadKind, workload: &DynamicObject) -> bool {
    let data = &workload.data;
    let int = |path: &str| data.pointer(path).and_then(Value::as_i64);

    if let (Some(generation), Some(observed)) = (
        workload.metadata.generation,
        int("/status/observedGeneration"),
    ) && observed < generation
    {
        return false;
    }

    match kind {
        WorkloadKind::Deployment => {
            let desired = int("/spec/replicas").unwrap_or(1);
            int("/status/availableReplicas").unwrap_or(0) >= desired
                && int("/status/updatedReplicas").unwrap_or(desired) >= desired
        },
        WorkloadKind::StatefulSet => {
            let desired = int("/spec/replicas").unwrap_or(1);
            int("/status/readyReplicas").unwrap_or(0) >= desired
        },
        WorkloadKind::DaemonSet => {
            let desired = int("/status/desiredNumberScheduled").unwrap_or(0);
            int("/status/numberAvailable").unwrap_or(0) >= desired
        },
    }
}
