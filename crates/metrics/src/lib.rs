//! Metrics definitions and export for mender.
//!
//! This crate provides a unified metrics interface using the `metrics` crate facade.
//! When the `prometheus` feature is enabled, metrics are exported in Prometheus format.
//!
//! # Usage
//!
//! ```rust,ignore
//! use mender_metrics::{counter, gauge, histogram, shadow};
//!
//! gauge!(shadow::ACTIVE).set(2.0);
//! counter!(shadow::VERIFICATIONS_TOTAL, "result" => "passed", "reason" => "ok").increment(1);
//! histogram!(shadow::TEST_DURATION_SECONDS, "test" => "smoke").record(4.2);
//! ```

mod definitions;
mod recorder;

pub use {
    definitions::*,
    recorder::{MetricsHandle, MetricsRecorderConfig, init_metrics},
};

// Re-export metrics macros for convenience
pub use metrics::{counter, gauge, histogram};
