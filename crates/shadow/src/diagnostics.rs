//! Human-readable cluster snapshots attached to readiness failures.

use std::fmt::Write as _;

use k8s_openapi::api::core::v1::{Event, Node, Pod};

use crate::cluster::ClusterClient;

const MAX_EVENTS: usize = 10;

/// Pods, recent warning events and node readiness for `namespace`.
///
/// Never fails: sections that cannot be fetched say so.
pub async fn snapshot(client: &dyn ClusterClient, namespace: &str) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "pods in {namespace}:");
    match client.list_pods(namespace, "").await {
        Ok(pods) if pods.is_empty() => out.push_str("  (none)\n"),
        Ok(pods) => {
            for pod in &pods {
                let _ = writeln!(out, "  {}", describe_pod(pod));
            }
        },
        Err(e) => {
            let _ = writeln!(out, "  (unavailable: {e})");
        },
    }

    out.push_str("warning events:\n");
    match client.list_events(namespace).await {
        Ok(events) => {
            let lines = warning_events(&events);
            if lines.is_empty() {
                out.push_str("  (none)\n");
            }
            for line in lines {
                let _ = writeln!(out, "  {line}");
            }
        },
        Err(e) => {
            let _ = writeln!(out, "  (unavailable: {e})");
        },
    }

    out.push_str("nodes:\n");
    match client.list_nodes().await {
        Ok(nodes) => {
            for node in &nodes {
                let _ = writeln!(out, "  {}", describe_node(node));
            }
        },
        Err(e) => {
            let _ = writeln!(out, "  (unavailable: {e})");
        },
    }

    out
}

fn describe_pod(pod: &Pod) -> String {
    let name = pod.metadata.name.as_deref().unwrap_or("<unnamed>");
    let status = pod.status.as_ref();
    let phase = status
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Unknown");
    let containers = status
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| {
            statuses
                .iter()
                .map(|cs| {
                    let waiting = cs
                        .state
                        .as_ref()
                        .and_then(|st| st.waiting.as_ref())
                        .and_then(|w| w.reason.as_deref());
                    match waiting {
                        Some(reason) => format!("{}=waiting:{reason}", cs.name),
                        None if cs.ready => format!("{}=ready", cs.name),
                        None => format!("{}=not-ready", cs.name),
                    }
                })
                .collect::<Vec<_>>()
                .join(",")
        })
        .unwrap_or_default();
    format!("{name} phase={phase} [{containers}]")
}

fn warning_events(events: &[Event]) -> Vec<String> {
    let mut warnings: Vec<&Event> = events
        .iter()
        .filter(|e| e.type_.as_deref() == Some("Warning"))
        .collect();
    warnings.sort_by_key(|e| e.last_timestamp.as_ref().map(|t| t.0));
    warnings
        .iter()
        .rev()
        .take(MAX_EVENTS)
        .rev()
        .map(|e| {
            let object = e.involved_object.name.as_deref().unwrap_or_default();
            format!(
                "{} {}: {}",
                e.reason.as_deref().unwrap_or("Unknown"),
                object,
                e.message.as_deref().unwrap_or_default().trim()
            )
        })
        .collect()
}

fn describe_node(node: &Node) -> String {
    let name = node.metadata.name.as_deref().unwrap_or("<unnamed>");
    let ready = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| conds.iter().find(|c| c.type_ == "Ready"))
        .map_or("Unknown", |c| c.status.as_str());
    format!("{name} ready={ready}")
}
