//! Security gates: static manifest scan, image vulnerability scan and runtime
//! behavior monitoring.
//!
//! The static and image gates fail closed when their scanner cannot run; the
//! runtime gate fails open, because a silent monitor says nothing about the
//! change under test.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use {
    mender_config::SecurityConfig,
    serde::Deserialize,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use mender_metrics::{counter, labels, shadow as shadow_metrics};

use crate::{
    cluster::ClusterClient,
    error::Error,
    scanner::ScannerRunner,
    types::{
        ImageScan, ImageVulnerabilityResult, ManifestScan, RuntimeBehaviorResult, RuntimeEvent,
        StaticManifestResult,
    },
};

/// A gate result plus any infrastructure error hit while producing it.
#[derive(Debug, Clone, Default)]
pub struct GateRun<T> {
    pub result: T,
    pub error: Option<String>,
}

pub struct SecurityGateOrchestrator {
    config: SecurityConfig,
    scanner: Arc<dyn ScannerRunner>,
}

impl SecurityGateOrchestrator {
    #[must_use]
    pub fn new(config: SecurityConfig, scanner: Arc<dyn ScannerRunner>) -> Self {
        Self { config, scanner }
    }

    /// Scan raw manifests before anything is applied. Passes only when every
    /// document of every manifest passes.
    pub async fn scan_manifests(&self, manifests: &[String]) -> GateRun<StaticManifestResult> {
        let cfg = &self.config.static_manifest;
        if !cfg.enabled {
            return record_static(skipped_static("disabled by configuration"));
        }
        if manifests.is_empty() {
            return record_static(skipped_static("no manifests in change set"));
        }

        let timeout = Duration::from_secs(cfg.timeout_secs);
        let args = vec!["scan".to_string(), "/dev/stdin".to_string()];
        let mut result = StaticManifestResult {
            passed: true,
            ..StaticManifestResult::default()
        };

        for (index, manifest) in manifests.iter().enumerate() {
            let output = match self
                .scanner
                .run(&cfg.binary, &args, Some(manifest), timeout)
                .await
            {
                Ok(output) => output,
                Err(e) => {
                    warn!(tool = %cfg.binary, error = %e, "static manifest scan could not run");
                    result.passed = false;
                    result.reason = Some(format!("{} unavailable", cfg.binary));
                    return record_static(GateRun {
                        result,
                        error: Some(format!("static manifest scan: {e}")),
                    });
                },
            };
            match parse_kubesec(&output.stdout, index, cfg.min_score) {
                Ok(scans) if scans.is_empty() => {
                    result.passed = false;
                    result.scans.push(ManifestScan {
                        manifest: index,
                        message: Some("scanner returned no results".into()),
                        ..ManifestScan::default()
                    });
                },
                Ok(scans) => {
                    result.passed &= scans.iter().all(|s| s.passed);
                    result.scans.extend(scans);
                },
                Err(e) => {
                    result.passed = false;
                    result.reason = Some("unreadable scanner output".into());
                    return record_static(GateRun {
                        result,
                        error: Some(format!(
                            "static manifest scan: {e}; stderr: {}",
                            output.stderr.trim()
                        )),
                    });
                },
            }
        }

        info!(
            passed = result.passed,
            documents = result.scans.len(),
            "static manifest gate finished"
        );
        record_static(GateRun {
            result,
            error: None,
        })
    }

    /// Scan each distinct image used by the live workload.
    ///
    /// Cancelling stops the scanner in flight and returns [`Error::Cancelled`].
    pub async fn scan_images(
        &self,
        images: &[String],
        cancel: &CancellationToken,
    ) -> crate::error::Result<GateRun<ImageVulnerabilityResult>> {
        let cfg = &self.config.image_vulnerability;
        if !cfg.enabled {
            return Ok(record_image(skipped_image("disabled by configuration")));
        }
        let unique: BTreeSet<&str> = images.iter().map(String::as_str).collect();
        if unique.is_empty() {
            return Ok(record_image(skipped_image("workload declares no images")));
        }

        let timeout = Duration::from_secs(cfg.timeout_secs);
        let mut result = ImageVulnerabilityResult {
            passed: true,
            ..ImageVulnerabilityResult::default()
        };
        let mut errors = Vec::new();

        for image in unique {
            let args = vec![
                "image".to_string(),
                "--quiet".to_string(),
                "--format".to_string(),
                "json".to_string(),
                "--scanners".to_string(),
                "vuln".to_string(),
                "--timeout".to_string(),
                format!("{}s", cfg.timeout_secs),
                image.to_string(),
            ];
            let run = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                run = self.scanner.run(&cfg.binary, &args, None, timeout) => run,
            };
            let output = match run {
                Ok(output) => output,
                Err(e @ Error::ToolUnavailable { .. }) => {
                    warn!(tool = %cfg.binary, "image scanner unavailable");
                    result.passed = false;
                    result.reason = Some(format!("{} unavailable", cfg.binary));
                    return Ok(record_image(GateRun {
                        result,
                        error: Some(format!("image scan: {e}")),
                    }));
                },
                Err(e) => {
                    result.passed = false;
                    errors.push(format!("image scan {image}: {e}"));
                    result.images.push(ImageScan {
                        image: image.to_string(),
                        error: Some(e.to_string()),
                        ..ImageScan::default()
                    });
                    continue;
                },
            };

            let mut scan = match parse_trivy(&output.stdout) {
                Ok(scan) => scan,
                Err(e) => {
                    let message = format!("{e}; stderr: {}", output.stderr.trim());
                    errors.push(format!("image scan {image}: {message}"));
                    ImageScan {
                        error: Some(message),
                        ..ImageScan::default()
                    }
                },
            };
            scan.image = image.to_string();
            scan.passed = scan.error.is_none()
                && scan.critical <= cfg.max_critical
                && scan.high <= cfg.max_high;
            debug!(
                image,
                critical = scan.critical,
                high = scan.high,
                passed = scan.passed,
                "image scanned"
            );
            result.passed &= scan.passed;
            result.images.push(scan);
        }

        info!(
            passed = result.passed,
            images = result.images.len(),
            "image vulnerability gate finished"
        );
        Ok(record_image(GateRun {
            result,
            error: (!errors.is_empty()).then(|| errors.join("; ")),
        }))
    }

    /// Look for runtime monitor alerts about `namespaces` within `window`.
    pub async fn scan_runtime(
        &self,
        host: &dyn ClusterClient,
        namespaces: &[String],
        window: Duration,
    ) -> GateRun<RuntimeBehaviorResult> {
        let cfg = &self.config.runtime_behavior;
        if !cfg.enabled {
            return record_runtime(skipped_runtime("disabled by configuration".into()));
        }

        let pods = match host.list_pods(&cfg.namespace, &cfg.label_selector).await {
            Ok(pods) if pods.is_empty() => {
                return record_runtime(skipped_runtime(format!(
                    "no runtime monitor pods matching {} in {}",
                    cfg.label_selector, cfg.namespace
                )));
            },
            Ok(pods) => pods,
            Err(e) => {
                return record_runtime(skipped_runtime(format!(
                    "runtime monitor unreachable: {e}"
                )));
            },
        };

        let min_rank = priority_rank(&cfg.min_priority).unwrap_or(WARNING_RANK);
        let since = i64::try_from(window.as_secs().max(1)).unwrap_or(i64::MAX);
        let mut result = RuntimeBehaviorResult {
            passed: true,
            ..RuntimeBehaviorResult::default()
        };
        let mut fetched = 0usize;

        for pod in pods {
            let Some(name) = pod.metadata.name else {
                continue;
            };
            let logs = match host.pod_logs(&cfg.namespace, &name, Some(since)).await {
                Ok(logs) => logs,
                Err(e) => {
                    debug!(pod = %name, error = %e, "runtime monitor logs unavailable");
                    continue;
                },
            };
            fetched += 1;
            for event in parse_falco_events(&logs, namespaces) {
                if priority_rank(&event.priority).unwrap_or(WARNING_RANK) >= min_rank {
                    result.events.push(event);
                } else {
                    result.ignored += 1;
                }
            }
        }

        if fetched == 0 {
            return record_runtime(skipped_runtime(
                "runtime monitor logs unavailable".into(),
            ));
        }

        result.passed = result.events.is_empty();
        info!(
            passed = result.passed,
            events = result.events.len(),
            ignored = result.ignored,
            "runtime behavior gate finished"
        );
        record_runtime(GateRun {
            result,
            error: None,
        })
    }
}

// ── kubesec ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct KubesecReport {
    #[serde(default)]
    object: String,
    #[serde(default)]
    valid: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    score: i64,
    #[serde(default)]
    scoring: Option<KubesecScoring>,
}

#[derive(Debug, Default, Deserialize)]
struct KubesecScoring {
    #[serde(default)]
    critical: Option<Vec<KubesecRule>>,
}

#[derive(Debug, Deserialize)]
struct KubesecRule {
    #[serde(default)]
    id: String,
    #[serde(default)]
    reason: String,
}

/// Parse kubesec's JSON array; one entry per document in the manifest.
pub fn parse_kubesec(
    stdout: &str,
    manifest: usize,
    min_score: i64,
) -> Result<Vec<ManifestScan>, serde_json::Error> {
    let reports: Vec<KubesecReport> = serde_json::from_str(stdout.trim())?;
    Ok(reports
        .into_iter()
        .map(|r| {
            let critical: Vec<String> = r
                .scoring
                .and_then(|s| s.critical)
                .unwrap_or_default()
                .into_iter()
                .map(|rule| {
                    if rule.reason.is_empty() {
                        rule.id
                    } else {
                        format!("{}: {}", rule.id, rule.reason)
                    }
                })
                .collect();
            ManifestScan {
                manifest,
                passed: r.valid && r.score >= min_score && critical.is_empty(),
                object: r.object,
                score: r.score,
                critical,
                message: r.message.filter(|m| !m.is_empty()),
            }
        })
        .collect())
}

// ── trivy ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TrivyReport {
    #[serde(default)]
    results: Option<Vec<TrivyTarget>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TrivyTarget {
    #[serde(default)]
    vulnerabilities: Option<Vec<TrivyVulnerability>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TrivyVulnerability {
    #[serde(default)]
    severity: String,
}

/// Count vulnerabilities by severity in a trivy JSON report.
pub fn parse_trivy(stdout: &str) -> Result<ImageScan, serde_json::Error> {
    let report: TrivyReport = serde_json::from_str(stdout.trim())?;
    let mut scan = ImageScan::default();
    for vuln in report
        .results
        .into_iter()
        .flatten()
        .filter_map(|t| t.vulnerabilities)
        .flatten()
    {
        match vuln.severity.to_ascii_uppercase().as_str() {
            "CRITICAL" => scan.critical += 1,
            "HIGH" => scan.high += 1,
            "MEDIUM" => scan.medium += 1,
            "LOW" => scan.low += 1,
            _ => {},
        }
    }
    Ok(scan)
}

// ── falco ───────────────────────────────────────────────────────────────────

const WARNING_RANK: u8 = 3;

/// Rank of a falco priority name; higher is more severe.
#[must_use]
pub fn priority_rank(priority: &str) -> Option<u8> {
    Some(match priority.trim().to_ascii_lowercase().as_str() {
        "debug" => 0,
        "informational" | "info" => 1,
        "notice" => 2,
        "warning" | "warn" => WARNING_RANK,
        "error" => 4,
        "critical" => 5,
        "alert" => 6,
        "emergency" => 7,
        _ => return None,
    })
}

#[derive(Debug, Deserialize)]
struct FalcoLine {
    #[serde(default)]
    priority: String,
    #[serde(default)]
    rule: String,
    #[serde(default)]
    output: String,
    #[serde(default)]
    time: Option<String>,
    #[serde(default)]
    output_fields: serde_json::Map<String, serde_json::Value>,
}

/// Falco JSON alerts from `logs` that concern one of `namespaces`.
/// Non-JSON lines (startup banners and the like) are ignored.
#[must_use]
pub fn parse_falco_events(logs: &str, namespaces: &[String]) -> Vec<RuntimeEvent> {
    logs.lines()
        .filter_map(|line| {
            let line = line.trim();
            if !line.starts_with('{') {
                return None;
            }
            serde_json::from_str::<FalcoLine>(line).ok()
        })
        .filter(|event| concerns(event, namespaces))
        .map(|event| RuntimeEvent {
            rule: event.rule,
            priority: event.priority,
            output: event.output,
            time: event.time,
        })
        .collect()
}

fn concerns(event: &FalcoLine, namespaces: &[String]) -> bool {
    let field_ns = event
        .output_fields
        .get("k8s.ns.name")
        .and_then(serde_json::Value::as_str);
    if let Some(ns) = field_ns {
        return namespaces.iter().any(|n| n == ns);
    }
    event.output.split_whitespace().any(|token| {
        namespaces.iter().any(|n| {
            token.ends_with(&format!("k8s.ns={n}"))
                || token.ends_with(&format!("k8s_ns={n}"))
                || token.ends_with(&format!("k8s.ns.name={n}"))
        })
    })
}

// ── helpers ─────────────────────────────────────────────────────────────────

fn skipped_static(reason: &str) -> GateRun<StaticManifestResult> {
    GateRun {
        result: StaticManifestResult {
            passed: true,
            skipped: true,
            reason: Some(reason.into()),
            scans: Vec::new(),
        },
        error: None,
    }
}

fn skipped_image(reason: &str) -> GateRun<ImageVulnerabilityResult> {
    GateRun {
        result: ImageVulnerabilityResult {
            passed: true,
            skipped: true,
            reason: Some(reason.into()),
            images: Vec::new(),
        },
        error: None,
    }
}

fn skipped_runtime(reason: String) -> GateRun<RuntimeBehaviorResult> {
    debug!(%reason, "runtime behavior gate skipped");
    GateRun {
        result: RuntimeBehaviorResult {
            passed: true,
            skipped: true,
            reason: Some(reason),
            ..RuntimeBehaviorResult::default()
        },
        error: None,
    }
}

fn record_static(run: GateRun<StaticManifestResult>) -> GateRun<StaticManifestResult> {
    record_gate("static_manifest", run.result.passed, run.result.skipped);
    run
}

fn record_image(run: GateRun<ImageVulnerabilityResult>) -> GateRun<ImageVulnerabilityResult> {
    record_gate("image_vulnerability", run.result.passed, run.result.skipped);
    run
}

fn record_runtime(run: GateRun<RuntimeBehaviorResult>) -> GateRun<RuntimeBehaviorResult> {
    record_gate("runtime_behavior", run.result.passed, run.result.skipped);
    run
}

#[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
fn record_gate(gate: &'static str, passed: bool, skipped: bool) {
    #[cfg(feature = "metrics")]
    {
        let outcome = match (skipped, passed) {
            (true, _) => "skipped",
            (false, true) => "passed",
            (false, false) => "failed",
        };
        counter!(
            shadow_metrics::SECURITY_GATE_TOTAL,
            labels::GATE => gate,
            labels::OUTCOME => outcome
        )
        .increment(1);
    }
}
