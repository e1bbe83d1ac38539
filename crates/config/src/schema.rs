/// Config schema types (shadow lifecycle, sandbox, verification, tests, security).
use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MenderConfig {
    pub shadow: ShadowConfig,
    pub sandbox: SandboxConfig,
    pub verification: VerificationConfig,
    pub tests: TestsConfig,
    pub security: SecurityConfig,
    pub metrics: MetricsConfig,
}

/// How a shadow environment is isolated from production.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShadowRuntimeKind {
    /// A virtual control plane nested in a host namespace.
    #[default]
    Vcluster,
    /// A plain namespace in the host cluster (weaker isolation).
    Namespace,
}

impl std::fmt::Display for ShadowRuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vcluster => f.write_str("vcluster"),
            Self::Namespace => f.write_str("namespace"),
        }
    }
}

impl std::str::FromStr for ShadowRuntimeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vcluster" => Ok(Self::Vcluster),
            "namespace" | "ns" => Ok(Self::Namespace),
            other => Err(format!("unknown shadow runtime: {other}")),
        }
    }
}

/// Lifecycle coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowConfig {
    /// Maximum number of simultaneously active shadow environments.
    pub max_concurrent_shadows: usize,
    pub runtime: ShadowRuntimeKind,
    /// Prefix for host namespaces. Always kept when the name is truncated.
    pub host_namespace_prefix: String,
    /// Namespace created inside the sandbox. Defaults to the source namespace.
    pub target_namespace: Option<String>,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            max_concurrent_shadows: 3,
            runtime: ShadowRuntimeKind::default(),
            host_namespace_prefix: "shadow-".into(),
            target_namespace: None,
        }
    }
}

/// Sandbox control plane settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub vcluster_binary: String,
    /// Extra arguments passed to `vcluster create`.
    pub extra_args: Vec<String>,
    pub ready_timeout_secs: u64,
    pub ready_poll_interval_secs: u64,
    /// Attempts at a trivial request before the sandbox API is declared unreachable.
    pub api_ready_attempts: u32,
    pub api_ready_interval_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            vcluster_binary: "vcluster".into(),
            extra_args: Vec::new(),
            ready_timeout_secs: 300,
            ready_poll_interval_secs: 5,
            api_ready_attempts: 30,
            api_ready_interval_secs: 2,
        }
    }
}

/// Verification run settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Length of the health sampling window.
    pub duration_secs: u64,
    pub sample_interval_secs: u64,
    /// Minimum health score for a passing verdict.
    pub pass_threshold: f64,
    pub rollout_timeout_secs: u64,
    pub rollout_poll_interval_secs: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            duration_secs: 60,
            sample_interval_secs: 5,
            pass_threshold: 0.8,
            rollout_timeout_secs: 180,
            rollout_poll_interval_secs: 5,
        }
    }
}

/// Smoke and load test job settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestsConfig {
    pub smoke_image: String,
    pub load_image: String,
    /// Per-request timeout used by the smoke test client.
    pub http_timeout_secs: u64,
    pub job_poll_interval_secs: u64,
    pub smoke_deadline_secs: u64,
    pub load_deadline_secs: u64,
    pub enable_load_test: bool,
    pub load_users: u32,
    pub load_spawn_rate: u32,
    pub load_duration_secs: u64,
    /// Highest tolerated failure rate for the load test (0.0..=1.0).
    pub max_failure_rate: f64,
    /// Probe paths used when the workload declares none.
    pub default_paths: Vec<String>,
}

impl Default for TestsConfig {
    fn default() -> Self {
        Self {
            smoke_image: "curlimages/curl:8.5.0".into(),
            load_image: "locustio/locust:2.24.0".into(),
            http_timeout_secs: 5,
            job_poll_interval_secs: 5,
            smoke_deadline_secs: 120,
            load_deadline_secs: 600,
            enable_load_test: true,
            load_users: 10,
            load_spawn_rate: 2,
            load_duration_secs: 30,
            max_failure_rate: 0.05,
            default_paths: vec![
                "/health".into(),
                "/ready".into(),
                "/healthz".into(),
                "/readyz".into(),
            ],
        }
    }
}

/// Security gate settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub static_manifest: StaticManifestConfig,
    pub image_vulnerability: ImageVulnerabilityConfig,
    pub runtime_behavior: RuntimeBehaviorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticManifestConfig {
    pub enabled: bool,
    pub binary: String,
    /// Minimum kubesec score for a manifest to pass.
    pub min_score: i64,
    pub timeout_secs: u64,
}

impl Default for StaticManifestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: "kubesec".into(),
            min_score: 0,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageVulnerabilityConfig {
    pub enabled: bool,
    pub binary: String,
    pub max_critical: u32,
    pub max_high: u32,
    pub timeout_secs: u64,
}

impl Default for ImageVulnerabilityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: "trivy".into(),
            max_critical: 0,
            max_high: 5,
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeBehaviorConfig {
    pub enabled: bool,
    /// Namespace of the runtime monitor in the host cluster.
    pub namespace: String,
    pub label_selector: String,
    /// Events below this priority are ignored (falco priority names).
    pub min_priority: String,
}

impl Default for RuntimeBehaviorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: "falco".into(),
            label_selector: "app.kubernetes.io/name=falco".into(),
            min_priority: "warning".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Extra labels attached to every exported metric.
    pub labels: Vec<(String, String)>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            labels: Vec::new(),
        }
    }
}
