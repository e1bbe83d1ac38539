//! Semantic validation of a loaded configuration.
//!
//! Parsing already rejects type errors; this catches values that parse but
//! would make the engine misbehave (zero intervals, thresholds out of range).

use crate::schema::MenderConfig;

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Category: "range", "interval", "naming", "security"
    pub category: &'static str,
    /// Dotted path, e.g. "verification.pass_threshold"
    pub path: String,
    pub message: String,
}

/// Result of validating a configuration.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    fn push(
        &mut self,
        severity: Severity,
        category: &'static str,
        path: &str,
        message: impl Into<String>,
    ) {
        self.diagnostics.push(Diagnostic {
            severity,
            category,
            path: path.to_string(),
            message: message.into(),
        });
    }
}

/// Validate a configuration and collect every problem found.
#[must_use]
pub fn validate(config: &MenderConfig) -> ValidationResult {
    let mut result = ValidationResult::default();

    if config.shadow.max_concurrent_shadows == 0 {
        result.push(
            Severity::Error,
            "range",
            "shadow.max_concurrent_shadows",
            "must be at least 1, otherwise every create is rejected",
        );
    }

    let prefix = &config.shadow.host_namespace_prefix;
    let prefix_ok = prefix.len() <= 40
        && prefix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !prefix.starts_with('-');
    if !prefix_ok {
        result.push(
            Severity::Error,
            "naming",
            "shadow.host_namespace_prefix",
            "must be lowercase alphanumeric or '-', not start with '-', at most 40 characters",
        );
    }

    for (path, value) in [
        (
            "verification.pass_threshold",
            config.verification.pass_threshold,
        ),
        ("tests.max_failure_rate", config.tests.max_failure_rate),
    ] {
        if !(0.0..=1.0).contains(&value) {
            result.push(
                Severity::Error,
                "range",
                path,
                format!("must be within 0.0..=1.0, got {value}"),
            );
        }
    }

    for (path, value) in [
        (
            "verification.sample_interval_secs",
            config.verification.sample_interval_secs,
        ),
        (
            "verification.rollout_poll_interval_secs",
            config.verification.rollout_poll_interval_secs,
        ),
        (
            "sandbox.ready_poll_interval_secs",
            config.sandbox.ready_poll_interval_secs,
        ),
        (
            "sandbox.api_ready_interval_secs",
            config.sandbox.api_ready_interval_secs,
        ),
        (
            "tests.job_poll_interval_secs",
            config.tests.job_poll_interval_secs,
        ),
    ] {
        if value == 0 {
            result.push(Severity::Error, "interval", path, "must be non-zero");
        }
    }

    if config.verification.sample_interval_secs > config.verification.duration_secs {
        result.push(
            Severity::Warning,
            "interval",
            "verification.duration_secs",
            "shorter than one sample interval; health is scored from a single sample",
        );
    }

    if config.tests.load_duration_secs >= config.tests.load_deadline_secs {
        result.push(
            Severity::Warning,
            "interval",
            "tests.load_deadline_secs",
            "load test deadline does not leave time beyond the test duration",
        );
    }

    if !config.security.static_manifest.enabled || !config.security.image_vulnerability.enabled {
        result.push(
            Severity::Warning,
            "security",
            "security",
            "a fail-closed security gate is disabled; changes will not be scanned",
        );
    }

    result
}
