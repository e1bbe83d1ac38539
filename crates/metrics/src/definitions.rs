//! Metric name and label definitions.
//!
//! Every metric the verification engine emits is named here so dashboards and
//! alerts have a single place to look.

/// Shadow environment lifecycle and verification metrics
pub mod shadow {
    /// Number of shadow environments currently in CREATING, READY or TESTING
    pub const ACTIVE: &str = "mender_shadow_environments_active";
    /// Total number of shadow environments successfully created
    pub const CREATED_TOTAL: &str = "mender_shadow_environments_created_total";
    /// Total number of failed `create` calls (capacity rejections included)
    pub const CREATE_FAILURES_TOTAL: &str = "mender_shadow_create_failures_total";
    /// Time from `create` to READY in seconds
    pub const CREATE_DURATION_SECONDS: &str = "mender_shadow_create_duration_seconds";
    /// Total number of verification runs, labelled by result and reason
    pub const VERIFICATIONS_TOTAL: &str = "mender_shadow_verifications_total";
    /// Duration of a whole verification run in seconds
    pub const VERIFICATION_DURATION_SECONDS: &str = "mender_shadow_verification_duration_seconds";
    /// Duration of an individual smoke or load test in seconds
    pub const TEST_DURATION_SECONDS: &str = "mender_shadow_test_duration_seconds";
    /// Total number of smoke/load test runs, labelled by test and result
    pub const TEST_RUNS_TOTAL: &str = "mender_shadow_test_runs_total";
    /// Last computed health score
    pub const HEALTH_SCORE: &str = "mender_shadow_health_score";
    /// Security gate outcomes, labelled by gate and outcome
    pub const SECURITY_GATE_TOTAL: &str = "mender_shadow_security_gate_total";
    /// Total number of completed cleanups
    pub const CLEANUPS_TOTAL: &str = "mender_shadow_cleanups_total";
}

/// Common label keys
pub mod labels {
    pub const RESULT: &str = "result";
    pub const REASON: &str = "reason";
    pub const TEST: &str = "test";
    pub const GATE: &str = "gate";
    pub const OUTCOME: &str = "outcome";
    pub const RUNTIME: &str = "runtime";
}

/// Standard histogram buckets for different metric types
pub mod buckets {
    /// Test job duration buckets (in seconds)
    /// Covers 1s to 15 minutes
    pub const TEST_DURATION: [f64; 12] = [
        1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0, 180.0, 300.0, 600.0, 900.0,
    ];

    /// Environment provisioning and verification buckets (in seconds)
    /// Covers 5s to 30 minutes
    pub const LIFECYCLE_DURATION: [f64; 11] = [
        5.0, 10.0, 30.0, 60.0, 120.0, 180.0, 300.0, 600.0, 900.0, 1200.0, 1800.0,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_share_prefix() {
        for name in [
            shadow::ACTIVE,
            shadow::CREATED_TOTAL,
            shadow::CREATE_FAILURES_TOTAL,
            shadow::CREATE_DURATION_SECONDS,
            shadow::VERIFICATIONS_TOTAL,
            shadow::VERIFICATION_DURATION_SECONDS,
            shadow::TEST_DURATION_SECONDS,
            shadow::TEST_RUNS_TOTAL,
            shadow::HEALTH_SCORE,
            shadow::SECURITY_GATE_TOTAL,
            shadow::CLEANUPS_TOTAL,
        ] {
            assert!(name.starts_with("mender_shadow_"), "{name}");
        }
    }

    #[test]
    fn buckets_are_sorted() {
        assert!(buckets::TEST_DURATION.windows(2).all(|w| w[0] < w[1]));
        assert!(buckets::LIFECYCLE_DURATION.windows(2).all(|w| w[0] < w[1]));
    }
}
