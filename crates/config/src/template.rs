//! Default configuration template with all options documented.
//!
//! Written by `mender config init`. Every value matches the built-in default,
//! so an untouched file behaves exactly like no file at all.

/// Generate the default config template.
#[must_use]
pub fn default_config_template() -> String {
    r##"# Mender Configuration
# ====================
# Every option is listed with its default value.
# Environment variable substitution is supported: ${ENV_VAR} or ${ENV_VAR:-fallback}

# ══════════════════════════════════════════════════════════════════════════════
# SHADOW LIFECYCLE
# ══════════════════════════════════════════════════════════════════════════════

[shadow]
max_concurrent_shadows = 3        # Creates beyond this many active shadows are rejected
runtime = "vcluster"              # "vcluster" (virtual control plane) or "namespace"
host_namespace_prefix = "shadow-" # Host namespaces are named <prefix><id>
# target_namespace = "staging"    # Namespace inside the sandbox (default: source namespace)

# ══════════════════════════════════════════════════════════════════════════════
# SANDBOX
# ══════════════════════════════════════════════════════════════════════════════

[sandbox]
vcluster_binary = "vcluster"
extra_args = []                   # Appended to `vcluster create`
ready_timeout_secs = 300          # Control plane readiness budget
ready_poll_interval_secs = 5
api_ready_attempts = 30           # Probes of the sandbox API before giving up
api_ready_interval_secs = 2

# ══════════════════════════════════════════════════════════════════════════════
# VERIFICATION
# ══════════════════════════════════════════════════════════════════════════════

[verification]
duration_secs = 60                # Health sampling window
sample_interval_secs = 5
pass_threshold = 0.8              # Minimum mean ready ratio for a passing verdict
rollout_timeout_secs = 180
rollout_poll_interval_secs = 5

# ══════════════════════════════════════════════════════════════════════════════
# SMOKE AND LOAD TESTS
# ══════════════════════════════════════════════════════════════════════════════

[tests]
smoke_image = "curlimages/curl:8.5.0"
load_image = "locustio/locust:2.24.0"
http_timeout_secs = 5
job_poll_interval_secs = 5
smoke_deadline_secs = 120
load_deadline_secs = 600
enable_load_test = true
load_users = 10
load_spawn_rate = 2
load_duration_secs = 30
max_failure_rate = 0.05           # Load test fails above this request failure rate
default_paths = ["/health", "/ready", "/healthz", "/readyz"]

# ══════════════════════════════════════════════════════════════════════════════
# SECURITY GATES
# ══════════════════════════════════════════════════════════════════════════════

[security.static_manifest]        # kubesec, before the change is applied
enabled = true
binary = "kubesec"
min_score = 0
timeout_secs = 60

[security.image_vulnerability]    # trivy, on every image of the patched workload
enabled = true
binary = "trivy"
max_critical = 0
max_high = 5
timeout_secs = 300

[security.runtime_behavior]       # falco alerts; skipped when falco is not installed
enabled = true
namespace = "falco"
label_selector = "app.kubernetes.io/name=falco"
min_priority = "warning"

# ══════════════════════════════════════════════════════════════════════════════
# METRICS
# ══════════════════════════════════════════════════════════════════════════════

[metrics]
enabled = true
labels = []                       # e.g. [["cluster", "prod-eu"]]
"##
    .to_string()
}
