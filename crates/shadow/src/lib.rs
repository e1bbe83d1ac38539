//! Shadow verification engine.
//!
//! Clones a production workload into a disposable sandbox, applies a proposed
//! change to the copy, runs security gates, smoke and load tests and a health
//! monitor against it, and renders a pass/fail verdict with the evidence.
//!
//! # Example
//!
//! ```ignore
//! use mender_shadow::{ChangeSet, CreateRequest, ShadowContext, ShadowManager, WorkloadKind};
//!
//! let manager = ShadowManager::new(ShadowContext::from_config(&config).await?);
//! let env = manager
//!     .create(CreateRequest {
//!         source_namespace: "shop".into(),
//!         name: "checkout".into(),
//!         kind: WorkloadKind::Deployment,
//!         id: None,
//!     })
//!     .await?;
//! let change = ChangeSet { replicas: Some(3), ..Default::default() };
//! let passed = manager.run_verification(&env.id, &change, None).await?;
//! manager.cleanup(&env.id).await?;
//! ```

pub mod applier;
pub mod cloner;
pub mod cluster;
pub mod diagnostics;
pub mod error;
pub mod health;
pub mod intents;
pub mod manager;
pub mod naming;
pub mod process;
pub mod projection;
pub mod sandbox;
pub mod scanner;
pub mod security;
pub mod settings;
pub mod test_runner;
pub mod types;
pub mod verdict;
pub mod wait;

pub use {
    cluster::{ClusterClient, KubeClusterClient},
    error::{Error, Result},
    manager::{CreateRequest, ShadowContext, ShadowManager},
    process::ToolOutput,
    sandbox::{SandboxConnection, SandboxProvisioner},
    scanner::{ProcessScannerRunner, ScannerRunner},
    settings::ShadowSettings,
    types::{
        ChangeSet, LoadTestParams, SecurityScanResults, ShadowEnvironment, ShadowStatus,
        TestResults, TestRunResult, VerificationPlan, VerificationType, WorkloadKind,
    },
};
