use serde::{Deserialize, Serialize};

/// Why a verification passed or failed. The first failing check wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictReason {
    Passed,
    StaticGateFailed,
    SecurityGateFailed,
    SmokeTestFailed,
    LoadTestFailed,
    HealthBelowThreshold,
}

impl VerdictReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::StaticGateFailed => "static_gate_failed",
            Self::SecurityGateFailed => "security_gate_failed",
            Self::SmokeTestFailed => "smoke_test_failed",
            Self::LoadTestFailed => "load_test_failed",
            Self::HealthBelowThreshold => "health_below_threshold",
        }
    }
}

impl std::fmt::Display for VerdictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the verdict depends on. `None` means the test did not run.
#[derive(Debug, Clone, Copy)]
pub struct VerdictInputs {
    pub health_score: f64,
    pub pass_threshold: f64,
    pub smoke: Option<bool>,
    pub load: Option<bool>,
    pub static_gate: bool,
    pub post_gates: bool,
}

/// Pass iff health meets the threshold, every test that ran passed and every
/// executed security gate passed.
#[must_use]
pub fn evaluate(inputs: &VerdictInputs) -> (bool, VerdictReason) {
    let reason = if !inputs.static_gate {
        VerdictReason::StaticGateFailed
    } else if !inputs.post_gates {
        VerdictReason::SecurityGateFailed
    } else if inputs.smoke == Some(false) {
        VerdictReason::SmokeTestFailed
    } else if inputs.load == Some(false) {
        VerdictReason::LoadTestFailed
    } else if inputs.health_score < inputs.pass_threshold {
        VerdictReason::HealthBelowThreshold
    } else {
        VerdictReason::Passed
    };
    (reason == VerdictReason::Passed, reason)
}
