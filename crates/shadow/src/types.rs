//! Engine data model: environments, change sets, plans and evidence records.

use std::collections::BTreeMap;

use {
    chrono::{DateTime, Utc},
    k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet},
    kube::api::ApiResource,
    mender_config::ShadowRuntimeKind,
    serde::{Deserialize, Serialize},
    tracing::info,
};

/// Lifecycle state of a shadow environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShadowStatus {
    Pending,
    Creating,
    Ready,
    Testing,
    Passed,
    Failed,
    Cleaning,
    Deleted,
    Error,
}

impl ShadowStatus {
    /// States that count toward the concurrency cap.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Creating | Self::Ready | Self::Testing)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Creating => "CREATING",
            Self::Ready => "READY",
            Self::Testing => "TESTING",
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
            Self::Cleaning => "CLEANING",
            Self::Deleted => "DELETED",
            Self::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for ShadowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ShadowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Self::Pending,
            "CREATING" => Self::Creating,
            "READY" => Self::Ready,
            "TESTING" => Self::Testing,
            "PASSED" => Self::Passed,
            "FAILED" => Self::Failed,
            "CLEANING" => Self::Cleaning,
            "DELETED" => Self::Deleted,
            "ERROR" => Self::Error,
            other => return Err(format!("unknown shadow status: {other}")),
        })
    }
}

/// Workload kinds the engine knows how to clone and patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
}

impl WorkloadKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deployment => "Deployment",
            Self::StatefulSet => "StatefulSet",
            Self::DaemonSet => "DaemonSet",
        }
    }

    /// API resource used to address this kind through a dynamic client.
    #[must_use]
    pub fn api_resource(self) -> ApiResource {
        match self {
            Self::Deployment => ApiResource::erase::<Deployment>(&()),
            Self::StatefulSet => ApiResource::erase::<StatefulSet>(&()),
            Self::DaemonSet => ApiResource::erase::<DaemonSet>(&()),
        }
    }

    /// Whether the kind has a `spec.replicas` field.
    #[must_use]
    pub fn is_scalable(self) -> bool {
        !matches!(self, Self::DaemonSet)
    }
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkloadKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deployment" | "deployments" | "deploy" => Ok(Self::Deployment),
            "statefulset" | "statefulsets" | "sts" => Ok(Self::StatefulSet),
            "daemonset" | "daemonsets" | "ds" => Ok(Self::DaemonSet),
            other => Err(format!("unsupported workload kind: {other}")),
        }
    }
}

/// The unit of work: one isolated copy of a production workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShadowEnvironment {
    pub id: String,
    /// Target namespace inside the sandbox.
    pub namespace: String,
    /// Host-cluster namespace holding the sandbox control plane.
    pub host_namespace: String,
    pub source_namespace: String,
    pub source_resource_name: String,
    pub source_resource_kind: WorkloadKind,
    pub runtime: ShadowRuntimeKind,
    pub status: ShadowStatus,
    pub created_at: DateTime<Utc>,
    pub health_score: f64,
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_results: Option<TestResults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_ref: Option<String>,
}

impl ShadowEnvironment {
    /// Append a line to the environment's trace and mirror it to the log.
    pub fn log(&mut self, line: impl Into<String>) {
        let line = line.into();
        info!(shadow_id = %self.id, "{line}");
        self.logs
            .push(format!("[{}] {line}", Utc::now().format("%Y-%m-%dT%H:%M:%SZ")));
    }

    /// `namespace/Kind/name` of the clone origin.
    #[must_use]
    pub fn source_ref(&self) -> String {
        format!(
            "{}/{}/{}",
            self.source_namespace, self.source_resource_kind, self.source_resource_name
        )
    }
}

/// Caller-proposed change to verify.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChangeSet {
    pub replicas: Option<i32>,
    pub image: Option<String>,
    /// Container to change; defaults to the first container.
    pub container: Option<String>,
    pub env: BTreeMap<String, String>,
    /// Raw YAML manifests, each possibly holding several documents.
    pub manifests: Vec<String>,
    /// Legacy command strings such as `kubectl scale deployment/api --replicas=3`.
    pub commands: Vec<String>,
}

impl ChangeSet {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.replicas.is_none()
            && self.image.is_none()
            && self.env.is_empty()
            && self.manifests.is_empty()
            && self.commands.is_empty()
    }
}

/// Which checks a verification run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationType {
    /// Smoke test, load test (when enabled) and health.
    #[default]
    Standard,
    /// Smoke test and health only.
    Smoke,
    /// Health sampling only; no test jobs.
    Health,
}

/// Optional test plan supplied with a change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VerificationPlan {
    pub verification_type: VerificationType,
    /// Overrides target discovery, e.g. `http://api.shop.svc:8080/health`.
    pub target_url: Option<String>,
    pub load_test: Option<LoadTestParams>,
    pub scenarios: Vec<String>,
    pub success_criteria: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoadTestParams {
    pub users: Option<u32>,
    pub spawn_rate: Option<u32>,
    pub duration_secs: Option<u64>,
    /// Full URL or path to load; defaults to the first probe path.
    pub url: Option<String>,
}

/// Outcome of one smoke or load job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunResult {
    pub passed: bool,
    pub target: String,
    pub duration_secs: f64,
    pub job_name: String,
    pub logs: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TestRunResult {
    /// A test that could not run at all.
    #[must_use]
    pub fn failed(target: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Evidence left by the change applicator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyOutcome {
    pub patched: bool,
    pub manifests_applied: usize,
    pub manifest_failures: Vec<String>,
    pub rollout_complete: bool,
    pub warnings: Vec<String>,
}

/// One kubesec finding for a manifest document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestScan {
    /// Index of the manifest in the change set.
    pub manifest: usize,
    pub object: String,
    pub passed: bool,
    pub score: i64,
    pub critical: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticManifestResult {
    pub passed: bool,
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub scans: Vec<ManifestScan>,
}

/// Severity counts for one image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageScan {
    pub image: String,
    pub passed: bool,
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageVulnerabilityResult {
    pub passed: bool,
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub images: Vec<ImageScan>,
}

/// A runtime monitor alert attributed to the shadow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeEvent {
    pub rule: String,
    pub priority: String,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeBehaviorResult {
    pub passed: bool,
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub events: Vec<RuntimeEvent>,
    /// Correlated events below the priority threshold.
    pub ignored: usize,
}

/// Aggregate of every security gate that ran.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityScanResults {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_manifest: Option<StaticManifestResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_vulnerability: Option<ImageVulnerabilityResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_behavior: Option<RuntimeBehaviorResult>,
    /// Infrastructure failures, as opposed to findings.
    pub errors: Vec<String>,
}

impl SecurityScanResults {
    /// `true` when the static gate ran (or was skipped) and passed, or never ran.
    #[must_use]
    pub fn static_passed(&self) -> bool {
        self.static_manifest.as_ref().is_none_or(|r| r.passed)
    }

    /// `true` when every post-apply gate that ran passed.
    #[must_use]
    pub fn post_apply_passed(&self) -> bool {
        self.image_vulnerability.as_ref().is_none_or(|r| r.passed)
            && self.runtime_behavior.as_ref().is_none_or(|r| r.passed)
    }

    /// Recompute `passed` from the individual gates.
    pub fn finalize(&mut self) {
        self.passed = self.static_passed() && self.post_apply_passed();
    }
}

/// Full evidence record of a verification run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResults {
    pub health_score: f64,
    pub health_samples: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smoke: Option<TestRunResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load: Option<TestRunResult>,
    pub security: SecurityScanResults,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply: Option<ApplyOutcome>,
    pub passed: bool,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}
