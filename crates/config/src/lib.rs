//! Configuration loading, validation and env substitution.
//!
//! Config files: `mender.toml`, `mender.yaml`, or `mender.json`
//! Searched in `./` then `~/.config/mender/`.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod template;
pub mod validate;

pub use {
    loader::{
        apply_env_overrides, config_dir, discover_and_load, find_config_file, load_config,
    },
    schema::{
        ImageVulnerabilityConfig, MenderConfig, MetricsConfig, RuntimeBehaviorConfig,
        SandboxConfig, SecurityConfig, ShadowConfig, ShadowRuntimeKind, StaticManifestConfig,
        TestsConfig, VerificationConfig,
    },
    template::default_config_template,
    validate::{Diagnostic, Severity, ValidationResult, validate},
};
