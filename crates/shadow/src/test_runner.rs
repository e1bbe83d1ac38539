//! Smoke and load tests, run as short-lived jobs inside the sandbox.

use std::{collections::BTreeMap, time::Duration};

use {
    k8s_openapi::{
        api::{
            batch::v1::{Job, JobSpec},
            core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec, ServicePort},
        },
        apimachinery::pkg::apis::meta::v1::ObjectMeta,
    },
    kube::api::DynamicObject,
    mender_config::TestsConfig,
    regex::Regex,
    serde_json::Value,
    tokio::time::Instant,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use mender_metrics::{counter, histogram, labels, shadow as shadow_metrics};

use crate::{
    cloner::{CLONED_FOR_LABEL, pod_template_labels, selector_matches},
    cluster::{ClusterClient, logs_for_selector},
    error::{Error, Result},
    naming,
    types::{LoadTestParams, TestRunResult, VerificationPlan},
    wait::{WaitOutcome, poll_until},
};

/// Label carried by every test job and its pods.
pub const TEST_KIND_LABEL: &str = "mender.io/test";

/// Extra time allowed past a job's `activeDeadlineSeconds` before giving up on it.
const DEADLINE_GRACE: Duration = Duration::from_secs(30);

/// Where tests send traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestTarget {
    /// Scheme, host and port, without a trailing slash.
    pub base_url: String,
    pub paths: Vec<String>,
    pub service: Option<String>,
}

impl TestTarget {
    #[must_use]
    pub fn describe(&self) -> String {
        match self.paths.first() {
            Some(path) if self.paths.len() == 1 => format!("{}{path}", self.base_url),
            _ => self.base_url.clone(),
        }
    }
}

/// Pick the port tests should use: one named `http`, else 80, else the first.
#[must_use]
pub fn choose_port(ports: &[ServicePort]) -> Option<i32> {
    ports
        .iter()
        .find(|p| p.name.as_deref() == Some("http"))
        .or_else(|| ports.iter().find(|p| p.port == 80))
        .or_else(|| ports.first())
        .map(|p| p.port)
}

/// HTTP paths declared on the workload's readiness and liveness probes.
#[must_use]
pub fn probe_paths(workload: &DynamicObject) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    let containers = workload
        .data
        .pointer("/spec/template/spec/containers")
        .and_then(Value::as_array);
    for container in containers.into_iter().flatten() {
        for probe in ["readinessProbe", "livenessProbe"] {
            let path = container
                .get(probe)
                .and_then(|p| p.pointer("/httpGet/path"))
                .and_then(Value::as_str);
            if let Some(path) = path
                && !paths.iter().any(|p| p == path)
            {
                paths.push(path.to_string());
            }
        }
    }
    paths
}

/// Resolve the base URL and paths for a workload's tests.
pub async fn resolve_target(
    client: &dyn ClusterClient,
    namespace: &str,
    workload: &DynamicObject,
    plan: Option<&VerificationPlan>,
    default_paths: &[String],
) -> Result<TestTarget> {
    let mut paths = probe_paths(workload);
    if paths.is_empty() {
        paths = default_paths.to_vec();
    }

    if let Some(raw) = plan.and_then(|p| p.target_url.as_deref()) {
        let url = url::Url::parse(raw).map_err(|e| Error::external("invalid target URL", e))?;
        let base_url = url.origin().ascii_serialization();
        if url.path() != "/" {
            paths = vec![url.path().to_string()];
        }
        return Ok(TestTarget {
            base_url,
            paths,
            service: None,
        });
    }

    let pod_labels = pod_template_labels(workload);
    let services = client.list_services(namespace).await?;
    let service = services
        .iter()
        .find(|svc| {
            svc.spec
                .as_ref()
                .and_then(|s| s.selector.as_ref())
                .is_some_and(|sel| selector_matches(sel, &pod_labels))
        })
        .ok_or_else(|| Error::message("no service selects the workload's pods"))?;
    let name = service.metadata.name.clone().unwrap_or_default();
    let port = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_deref())
        .and_then(choose_port)
        .ok_or_else(|| Error::message(format!("service {name} exposes no ports")))?;

    Ok(TestTarget {
        base_url: format!("http://{name}.{namespace}.svc.cluster.local:{port}"),
        paths,
        service: Some(name),
    })
}

/// Aggregate line of a locust summary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSummary {
    pub requests: u64,
    pub failures: u64,
    pub failure_rate: f64,
}

/// Parse the last `Aggregated` row of locust's stats table.
#[must_use]
pub fn parse_locust_summary(logs: &str) -> Option<LoadSummary> {
    let re = Regex::new(r"(?m)^\s*Aggregated\s+(\d+)\s+(\d+)\((\d+(?:\.\d+)?)%\)").ok()?;
    let caps = re.captures_iter(logs).last()?;
    let requests = caps.get(1)?.as_str().parse().ok()?;
    let failures = caps.get(2)?.as_str().parse().ok()?;
    let pct: f64 = caps.get(3)?.as_str().parse().ok()?;
    Some(LoadSummary {
        requests,
        failures,
        failure_rate: pct / 100.0,
    })
}

const SMOKE_SCRIPT: &str = r#"set -u
for p in $PROBE_PATHS; do
  url="${BASE_URL}${p}"
  code=$(curl -sS -o /dev/null -w '%{http_code}' --max-time "$HTTP_TIMEOUT" "$url") || { echo "FAIL $url: request error"; exit 1; }
  echo "GET $url -> $code"
  case "$code" in
    2*|3*) ;;
    *) echo "FAIL $url: HTTP $code"; exit 1 ;;
  esac
done
echo "smoke test passed"
"#;

const LOAD_SCRIPT: &str = r#"printf '%s\n' "$LOCUSTFILE" > /tmp/locustfile.py && exec locust -f /tmp/locustfile.py --headless -u "$USERS" -r "$SPAWN_RATE" -t "${DURATION}s" --host "$BASE_URL" --only-summary --exit-code-on-error 0"#;

/// Single-file locust script hitting `path`.
#[must_use]
pub fn locustfile(path: &str) -> String {
    // JSON string literals are valid Python string literals for this input.
    let literal = serde_json::to_string(path).unwrap_or_else(|_| "\"/\"".into());
    format!(
        "from locust import HttpUser, task, between\n\n\
         class ShadowUser(HttpUser):\n    \
             wait_time = between(0.5, 1.5)\n\n    \
             @task\n    \
             def probe(self):\n        \
                 self.client.get({literal}, name={literal})\n"
    )
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        ..EnvVar::default()
    }
}

/// Shared job skeleton: one container, no retries, bounded lifetime.
fn job(
    name: &str,
    shadow_id: &str,
    kind: &str,
    container: Container,
    deadline: Duration,
) -> Job {
    let labels = BTreeMap::from([
        ("app.kubernetes.io/managed-by".to_string(), "mender".to_string()),
        (CLONED_FOR_LABEL.to_string(), shadow_id.to_string()),
        (TEST_KIND_LABEL.to_string(), kind.to_string()),
    ]);
    Job {
        metadata: ObjectMeta {
            name: Some(name.into()),
            labels: Some(labels.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            active_deadline_seconds: Some(i64::try_from(deadline.as_secs()).unwrap_or(i64::MAX)),
            ttl_seconds_after_finished: Some(600),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".into()),
                    containers: vec![container],
                    ..PodSpec::default()
                }),
            },
            ..JobSpec::default()
        }),
        status: None,
    }
}

/// Job that GETs every path once and fails on the first error.
#[must_use]
pub fn build_smoke_job(
    name: &str,
    shadow_id: &str,
    config: &TestsConfig,
    target: &TestTarget,
) -> Job {
    let container = Container {
        name: "smoke".into(),
        image: Some(config.smoke_image.clone()),
        command: Some(vec!["sh".into(), "-c".into(), SMOKE_SCRIPT.into()]),
        env: Some(vec![
            env("BASE_URL", target.base_url.clone()),
            env("PROBE_PATHS", target.paths.join(" ")),
            env("HTTP_TIMEOUT", config.http_timeout_secs.to_string()),
        ]),
        ..Container::default()
    };
    job(
        name,
        shadow_id,
        "smoke",
        container,
        Duration::from_secs(config.smoke_deadline_secs),
    )
}

/// Resolved load test parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSpec {
    pub base_url: String,
    pub path: String,
    pub users: u32,
    pub spawn_rate: u32,
    pub duration_secs: u64,
}

impl LoadSpec {
    /// Merge plan overrides over configured defaults.
    pub fn resolve(
        config: &TestsConfig,
        target: &TestTarget,
        params: Option<&LoadTestParams>,
    ) -> Result<Self> {
        let mut base_url = target.base_url.clone();
        let mut path = target.paths.first().cloned().unwrap_or_else(|| "/".into());
        if let Some(raw) = params.and_then(|p| p.url.as_deref()) {
            if raw.starts_with("http://") || raw.starts_with("https://") {
                let url = url::Url::parse(raw)
                    .map_err(|e| Error::external("invalid load test URL", e))?;
                base_url = url.origin().ascii_serialization();
                path = url.path().to_string();
            } else {
                path = raw.to_string();
            }
        }
        Ok(Self {
            base_url,
            path,
            users: params.and_then(|p| p.users).unwrap_or(config.load_users),
            spawn_rate: params
                .and_then(|p| p.spawn_rate)
                .unwrap_or(config.load_spawn_rate),
            duration_secs: params
                .and_then(|p| p.duration_secs)
                .unwrap_or(config.load_duration_secs),
        })
    }

    #[must_use]
    pub fn url(&self) -> String {
        format!("{}{}", self.base_url, self.path)
    }
}

/// Job running locust headless against one path.
#[must_use]
pub fn build_load_job(name: &str, shadow_id: &str, config: &TestsConfig, spec: &LoadSpec) -> Job {
    let container = Container {
        name: "load".into(),
        image: Some(config.load_image.clone()),
        command: Some(vec!["sh".into(), "-c".into(), LOAD_SCRIPT.into()]),
        env: Some(vec![
            env("LOCUSTFILE", locustfile(&spec.path)),
            env("BASE_URL", spec.base_url.clone()),
            env("USERS", spec.users.to_string()),
            env("SPAWN_RATE", spec.spawn_rate.to_string()),
            env("DURATION", spec.duration_secs.to_string()),
        ]),
        ..Container::default()
    };
    // The job must outlive the test itself.
    let deadline = config.load_deadline_secs.max(spec.duration_secs + 60);
    job(
        name,
        shadow_id,
        "load",
        container,
        Duration::from_secs(deadline),
    )
}

/// Outcome of driving one job to completion.
#[derive(Debug, Clone, Default)]
struct JobRun {
    succeeded: bool,
    logs: String,
    duration: Duration,
    error: Option<String>,
}

/// `Some(true)` once succeeded, `Some(false)` once failed, `None` while running.
fn job_finished(job: &Job) -> Option<bool> {
    let status = job.status.as_ref()?;
    if status.succeeded.unwrap_or(0) > 0 {
        return Some(true);
    }
    let failed_condition = status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == "Failed" && c.status == "True");
    if status.failed.unwrap_or(0) > 0 || failed_condition {
        return Some(false);
    }
    None
}

pub struct VerificationTestRunner {
    config: TestsConfig,
    poll_interval: Duration,
}

impl VerificationTestRunner {
    #[must_use]
    pub fn new(config: TestsConfig, poll_interval: Duration) -> Self {
        Self {
            config,
            poll_interval,
        }
    }

    #[must_use]
    pub fn load_enabled(&self) -> bool {
        self.config.enable_load_test
    }

    /// Run the smoke job. Failures are reported in the result; only
    /// cancellation is an error.
    pub async fn run_smoke(
        &self,
        client: &dyn ClusterClient,
        namespace: &str,
        shadow_id: &str,
        target: &TestTarget,
        cancel: &CancellationToken,
    ) -> Result<TestRunResult> {
        let name = naming::job_name("smoke", shadow_id);
        let job = build_smoke_job(&name, shadow_id, &self.config, target);
        let deadline = Duration::from_secs(self.config.smoke_deadline_secs);
        info!(job = %name, target = %target.describe(), "starting smoke test");

        let run = self.run_job(client, namespace, &name, &job, deadline, cancel).await?;
        let result = TestRunResult {
            passed: run.succeeded,
            target: target.describe(),
            duration_secs: run.duration.as_secs_f64(),
            job_name: name,
            logs: run.logs,
            success_rate: None,
            requests: None,
            error: run.error,
        };
        record_test("smoke", &result);
        Ok(result)
    }

    /// Run the load job and judge its failure rate.
    pub async fn run_load(
        &self,
        client: &dyn ClusterClient,
        namespace: &str,
        shadow_id: &str,
        target: &TestTarget,
        params: Option<&LoadTestParams>,
        cancel: &CancellationToken,
    ) -> Result<TestRunResult> {
        let spec = match LoadSpec::resolve(&self.config, target, params) {
            Ok(spec) => spec,
            Err(e) => return Ok(TestRunResult::failed(target.describe(), e.to_string())),
        };
        let name = naming::job_name("load", shadow_id);
        let job = build_load_job(&name, shadow_id, &self.config, &spec);
        let deadline = Duration::from_secs(
            job.spec
                .as_ref()
                .and_then(|s| s.active_deadline_seconds)
                .and_then(|s| u64::try_from(s).ok())
                .unwrap_or(self.config.load_deadline_secs),
        );
        info!(
            job = %name,
            target = %spec.url(),
            users = spec.users,
            duration_secs = spec.duration_secs,
            "starting load test"
        );

        let run = self.run_job(client, namespace, &name, &job, deadline, cancel).await?;
        let summary = parse_locust_summary(&run.logs);
        let mut error = run.error;
        let passed = match summary {
            Some(s) if run.succeeded && s.requests > 0 => {
                s.failure_rate <= self.config.max_failure_rate
            },
            Some(_) if run.succeeded => {
                error.get_or_insert_with(|| "load test sent no requests".into());
                false
            },
            None if run.succeeded => {
                error.get_or_insert_with(|| "no aggregate summary in load test output".into());
                false
            },
            _ => false,
        };
        let result = TestRunResult {
            passed,
            target: spec.url(),
            duration_secs: run.duration.as_secs_f64(),
            job_name: name,
            logs: run.logs,
            success_rate: summary.map(|s| 1.0 - s.failure_rate),
            requests: summary.map(|s| s.requests),
            error,
        };
        record_test("load", &result);
        Ok(result)
    }

    async fn run_job(
        &self,
        client: &dyn ClusterClient,
        namespace: &str,
        name: &str,
        job: &Job,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<JobRun> {
        let started = Instant::now();
        if let Err(e) = client.create_job(namespace, job).await {
            warn!(job = name, error = %e, "failed to create test job");
            return Ok(JobRun {
                error: Some(format!("failed to create job: {e}")),
                duration: started.elapsed(),
                ..JobRun::default()
            });
        }

        let probe = move || async move {
            match client.get_job(namespace, name).await {
                Ok(Some(job)) => Ok(job_finished(&job)),
                Ok(None) => Ok(Some(false)),
                Err(e) => {
                    debug!(job = name, error = %e, "job status probe failed");
                    Ok(None)
                },
            }
        };
        let outcome =
            match poll_until(self.poll_interval, deadline + DEADLINE_GRACE, cancel, probe).await {
                Ok(outcome) => outcome,
                Err(Error::Cancelled) => {
                    if let Err(e) = client.delete_job(namespace, name).await {
                        warn!(job = name, error = %e, "failed to delete cancelled job");
                    }
                    return Err(Error::Cancelled);
                },
                Err(e) => return Err(e),
            };

        let (succeeded, mut error) = match outcome {
            WaitOutcome::Ready(succeeded) => (
                succeeded,
                (!succeeded).then(|| "job failed".to_string()),
            ),
            WaitOutcome::TimedOut => {
                if let Err(e) = client.delete_job(namespace, name).await {
                    warn!(job = name, error = %e, "failed to delete timed-out job");
                }
                (
                    false,
                    Some(format!("job did not finish within {}s", deadline.as_secs())),
                )
            },
        };

        let logs = match logs_for_selector(client, namespace, &format!("job-name={name}"), None)
            .await
        {
            Ok(logs) => logs,
            Err(e) => {
                error.get_or_insert_with(|| format!("failed to fetch job logs: {e}"));
                String::new()
            },
        };

        Ok(JobRun {
            succeeded,
            logs,
            duration: started.elapsed(),
            error,
        })
    }
}

fn record_test(test: &'static str, result: &TestRunResult) {
    info!(
        test,
        passed = result.passed,
        duration_secs = result.duration_secs,
        job = %result.job_name,
        "test finished"
    );
    #[cfg(feature = "metrics")]
    {
        histogram!(shadow_metrics::TEST_DURATION_SECONDS, labels::TEST => test)
            .record(result.duration_secs);
        counter!(
            shadow_metrics::TEST_RUNS_TOTAL,
            labels::TEST => test,
            labels::RESULT => if result.passed { "passed" } else { "failed" }
        )
        .increment(1);
    }
}
