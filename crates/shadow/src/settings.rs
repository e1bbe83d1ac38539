use std::time::Duration;

use mender_config::{
    MenderConfig, SandboxConfig, SecurityConfig, ShadowRuntimeKind, TestsConfig,
    VerificationConfig,
};

/// Engine-local view of the configuration.
#[derive(Debug, Clone)]
pub struct ShadowSettings {
    pub max_concurrent_shadows: usize,
    pub runtime: ShadowRuntimeKind,
    pub host_namespace_prefix: String,
    pub target_namespace: Option<String>,
    pub sandbox: SandboxConfig,
    pub verification: VerificationConfig,
    pub tests: TestsConfig,
    pub security: SecurityConfig,
}

impl Default for ShadowSettings {
    fn default() -> Self {
        Self::from(&MenderConfig::default())
    }
}

impl From<&MenderConfig> for ShadowSettings {
    fn from(config: &MenderConfig) -> Self {
        Self {
            max_concurrent_shadows: config.shadow.max_concurrent_shadows,
            runtime: config.shadow.runtime,
            host_namespace_prefix: config.shadow.host_namespace_prefix.clone(),
            target_namespace: config.shadow.target_namespace.clone(),
            sandbox: config.sandbox.clone(),
            verification: config.verification.clone(),
            tests: config.tests.clone(),
            security: config.security.clone(),
        }
    }
}

impl ShadowSettings {
    #[must_use]
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.sandbox.ready_timeout_secs)
    }

    #[must_use]
    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_secs(self.sandbox.ready_poll_interval_secs.max(1))
    }

    #[must_use]
    pub fn api_ready_interval(&self) -> Duration {
        Duration::from_secs(self.sandbox.api_ready_interval_secs.max(1))
    }

    /// Overall budget for the sandbox API probe: attempts × interval.
    #[must_use]
    pub fn api_ready_timeout(&self) -> Duration {
        self.api_ready_interval() * self.sandbox.api_ready_attempts.max(1)
    }

    #[must_use]
    pub fn verification_window(&self) -> Duration {
        Duration::from_secs(self.verification.duration_secs)
    }

    #[must_use]
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.verification.sample_interval_secs.max(1))
    }

    #[must_use]
    pub fn rollout_timeout(&self) -> Duration {
        Duration::from_secs(self.verification.rollout_timeout_secs)
    }

    #[must_use]
    pub fn rollout_poll_interval(&self) -> Duration {
        Duration::from_secs(self.verification.rollout_poll_interval_secs.max(1))
    }

    #[must_use]
    pub fn job_poll_interval(&self) -> Duration {
        Duration::from_secs(self.tests.job_poll_interval_secs.max(1))
    }
}
