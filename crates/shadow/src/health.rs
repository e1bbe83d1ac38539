//! Pod-readiness health scoring.

use std::time::Duration;

use {
    k8s_openapi::api::core::v1::Pod,
    serde::{Deserialize, Serialize},
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use crate::{
    cluster::ClusterClient, error::Result, test_runner::TEST_KIND_LABEL, wait::sleep_or_cancel,
};

/// Samples and their mean.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub score: f64,
    pub samples: Vec<f64>,
}

/// `true` when the pod is Running and every container reports ready.
#[must_use]
pub fn is_pod_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    status.phase.as_deref() == Some("Running")
        && status
            .container_statuses
            .as_ref()
            .is_some_and(|cs| !cs.is_empty() && cs.iter().all(|c| c.ready))
}

/// Fraction of ready pods; an empty namespace scores 0.0.
#[must_use]
pub fn ready_ratio(pods: &[Pod]) -> f64 {
    if pods.is_empty() {
        return 0.0;
    }
    let ready = pods.iter().filter(|p| is_pod_ready(p)).count();
    ready as f64 / pods.len() as f64
}

/// Drop pods belonging to our own test jobs; they finish and would read as unready.
fn workload_pods(pods: Vec<Pod>) -> Vec<Pod> {
    pods.into_iter()
        .filter(|p| {
            !p.metadata
                .labels
                .as_ref()
                .is_some_and(|labels| labels.contains_key(TEST_KIND_LABEL))
        })
        .collect()
}

/// Arithmetic mean; no samples scores 0.0.
#[must_use]
pub fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

pub struct HealthMonitor {
    interval: Duration,
    window: Duration,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(interval: Duration, window: Duration) -> Self {
        Self { interval, window }
    }

    /// Number of samples taken over the window (at least one).
    #[must_use]
    pub fn sample_count(&self) -> usize {
        let interval = self.interval.as_millis().max(1);
        usize::try_from(self.window.as_millis().div_ceil(interval))
            .unwrap_or(usize::MAX)
            .max(1)
    }

    /// Sample `namespace` every interval for the window and score it.
    ///
    /// API errors count as a 0.0 sample. Returns [`Error::Cancelled`](crate::Error::Cancelled)
    /// when `cancel` fires.
    pub async fn monitor(
        &self,
        client: &dyn ClusterClient,
        namespace: &str,
        cancel: &CancellationToken,
    ) -> Result<HealthReport> {
        let count = self.sample_count();
        let mut samples = Vec::with_capacity(count);
        for i in 0..count {
            let sample = match client.list_pods(namespace, "").await {
                Ok(pods) => ready_ratio(&workload_pods(pods)),
                Err(e) => {
                    warn!(namespace, error = %e, "health sample failed, scoring 0.0");
                    0.0
                },
            };
            debug!(namespace, sample, index = i, "health sample");
            samples.push(sample);
            if i + 1 < count {
                sleep_or_cancel(self.interval, cancel).await?;
            }
        }
        Ok(HealthReport {
            score: mean(&samples),
            samples,
        })
    }
}
