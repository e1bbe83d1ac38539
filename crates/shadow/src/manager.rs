//! Shadow lifecycle coordinator.
//!
//! Owns the environment registry and the concurrency cap, drives each
//! environment through its state machine and assembles the verification
//! verdict from the gates, tests and health monitor.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use {
    chrono::Utc,
    k8s_openapi::{api::core::v1::Namespace, apimachinery::pkg::apis::meta::v1::ObjectMeta},
    kube::api::DynamicObject,
    mender_config::{MenderConfig, ShadowRuntimeKind},
    serde_json::Value,
    tokio::{
        sync::{Mutex, RwLock},
        time::Instant,
    },
    tokio_util::sync::CancellationToken,
    tracing::{Instrument, debug, error, info, info_span, instrument, warn},
};

#[cfg(feature = "metrics")]
use mender_metrics::{counter, gauge, histogram, labels, shadow as shadow_metrics};

use crate::{
    applier::{ApplyTarget, ChangeApplicator},
    cloner::{CLONED_FOR_LABEL, CloneRequest, clone_workload},
    cluster::{ClusterClient, KubeClusterClient},
    diagnostics,
    error::{Error, Result},
    health::{HealthMonitor, is_pod_ready},
    naming,
    projection::{self, MANAGED_BY, MANAGED_BY_LABEL},
    sandbox::{SandboxConnection, SandboxProvisioner, provisioner_for},
    scanner::{ProcessScannerRunner, ScannerRunner},
    security::SecurityGateOrchestrator,
    settings::ShadowSettings,
    test_runner::{VerificationTestRunner, resolve_target},
    types::{
        ChangeSet, SecurityScanResults, ShadowEnvironment, ShadowStatus, TestResults,
        TestRunResult, VerificationPlan, VerificationType, WorkloadKind,
    },
    verdict::{self, VerdictInputs, VerdictReason},
    wait::{WaitOutcome, poll_until, sleep_or_cancel},
};

/// Collaborators the manager is built from.
pub struct ShadowContext {
    pub host: Arc<dyn ClusterClient>,
    pub provisioner: Arc<dyn SandboxProvisioner>,
    pub scanner: Arc<dyn ScannerRunner>,
    pub settings: ShadowSettings,
}

impl ShadowContext {
    /// Production wiring: in-cluster or kubeconfig credentials, the configured
    /// sandbox runtime and scanners run as local processes.
    pub async fn from_config(config: &MenderConfig) -> Result<Self> {
        let settings = ShadowSettings::from(config);
        let host: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::try_default().await?);
        let provisioner = provisioner_for(settings.runtime, &settings.sandbox, Arc::clone(&host));
        Ok(Self {
            host,
            provisioner,
            scanner: Arc::new(ProcessScannerRunner::default()),
            settings,
        })
    }
}

/// What to clone into a new environment.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub source_namespace: String,
    pub name: String,
    pub kind: WorkloadKind,
    /// Caller-chosen id; sanitized. Generated when absent.
    pub id: Option<String>,
}

struct ShadowSlot {
    env: RwLock<ShadowEnvironment>,
    connection: RwLock<Option<SandboxConnection>>,
    cancel: CancellationToken,
    /// Serializes create, verify and cleanup on one environment.
    op: Mutex<()>,
}

impl ShadowSlot {
    fn new(env: ShadowEnvironment, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            env: RwLock::new(env),
            connection: RwLock::new(None),
            cancel,
            op: Mutex::new(()),
        })
    }

    async fn snapshot(&self) -> ShadowEnvironment {
        self.env.read().await.clone()
    }

    async fn log(&self, line: impl Into<String>) {
        self.env.write().await.log(line);
    }
}

#[derive(Default)]
struct Registry {
    slots: HashMap<String, Arc<ShadowSlot>>,
    /// Ids currently in CREATING, READY or TESTING.
    active: HashSet<String>,
    /// Ids whose cleanup finished, so repeated cleanups are no-ops.
    deleted: HashSet<String>,
}

pub struct ShadowManager {
    host: Arc<dyn ClusterClient>,
    provisioner: Arc<dyn SandboxProvisioner>,
    settings: ShadowSettings,
    security: SecurityGateOrchestrator,
    applicator: ChangeApplicator,
    tests: VerificationTestRunner,
    health: HealthMonitor,
    registry: Mutex<Registry>,
    shutdown: CancellationToken,
}

impl ShadowManager {
    #[must_use]
    pub fn new(ctx: ShadowContext) -> Self {
        let ShadowContext {
            host,
            provisioner,
            scanner,
            settings,
        } = ctx;
        Self {
            security: SecurityGateOrchestrator::new(settings.security.clone(), scanner),
            applicator: ChangeApplicator::new(
                settings.rollout_timeout(),
                settings.rollout_poll_interval(),
            ),
            tests: VerificationTestRunner::new(settings.tests.clone(), settings.job_poll_interval()),
            health: HealthMonitor::new(settings.sample_interval(), settings.verification_window()),
            host,
            provisioner,
            settings,
            registry: Mutex::new(Registry::default()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Number of environments in CREATING, READY or TESTING.
    pub async fn active_count(&self) -> usize {
        self.registry.lock().await.active.len()
    }

    // ── create ─────────────────────────────────────────────────────────────

    /// Provision a sandbox and clone the source workload into it.
    ///
    /// Rejects with [`Error::Capacity`] before any side effect when the cap is
    /// reached. On failure the environment ends in ERROR, partial resources are
    /// removed best-effort and the error is returned.
    #[instrument(skip_all, fields(source = %format!("{}/{}", request.source_namespace, request.name)))]
    pub async fn create(&self, request: CreateRequest) -> Result<ShadowEnvironment> {
        let started = Instant::now();
        let id = request
            .id
            .as_deref()
            .map_or_else(naming::generate_id, naming::sanitize);
        let host_namespace = naming::host_namespace_for(&self.settings.host_namespace_prefix, &id);
        let namespace = match self.provisioner.runtime() {
            ShadowRuntimeKind::Namespace => host_namespace.clone(),
            ShadowRuntimeKind::Vcluster => naming::sanitize(
                self.settings
                    .target_namespace
                    .as_deref()
                    .unwrap_or(&request.source_namespace),
            ),
        };

        let env = ShadowEnvironment {
            id: id.clone(),
            namespace,
            host_namespace,
            source_namespace: request.source_namespace,
            source_resource_name: request.name,
            source_resource_kind: request.kind,
            runtime: self.provisioner.runtime(),
            status: ShadowStatus::Pending,
            created_at: Utc::now(),
            health_score: 0.0,
            logs: Vec::new(),
            error: None,
            test_results: None,
            credentials_ref: None,
        };

        let slot = self.reserve(env).await.inspect_err(|e| {
            warn!(shadow_id = %id, error = %e, "create rejected");
            record_create_failure();
        })?;
        let _op = slot.op.lock().await;

        match self.provision(&slot).await {
            Ok(()) => {
                self.set_status(&slot, ShadowStatus::Ready).await;
                slot.log("shadow environment ready").await;
                record_created(started.elapsed());
                Ok(slot.snapshot().await)
            },
            Err(e) => {
                error!(shadow_id = %id, error = %e, "shadow creation failed");
                slot.env.write().await.error = Some(e.to_string());
                slot.log(format!("creation failed: {e}")).await;
                self.set_status(&slot, ShadowStatus::Error).await;
                self.teardown(&slot).await;
                record_create_failure();
                Err(e)
            },
        }
    }

    /// Register a new environment in CREATING, enforcing uniqueness and the cap
    /// under one lock.
    async fn reserve(&self, mut env: ShadowEnvironment) -> Result<Arc<ShadowSlot>> {
        let mut registry = self.registry.lock().await;
        if let Some(existing) = registry.slots.get(&env.id) {
            let status = existing.env.read().await.status;
            return Err(Error::AlreadyExists {
                id: env.id,
                status: status.to_string(),
            });
        }
        let max = self.settings.max_concurrent_shadows;
        if registry.active.len() >= max {
            return Err(Error::Capacity {
                active: registry.active.len(),
                max,
            });
        }

        env.log(format!("creating shadow of {}", env.source_ref()));
        env.status = ShadowStatus::Creating;
        let id = env.id.clone();
        let slot = ShadowSlot::new(env, self.shutdown.child_token());
        registry.deleted.remove(&id);
        registry.active.insert(id.clone());
        registry.slots.insert(id, Arc::clone(&slot));
        record_active(registry.active.len());
        Ok(slot)
    }

    async fn provision(&self, slot: &ShadowSlot) -> Result<()> {
        let env = slot.snapshot().await;
        let sandbox = naming::sandbox_name(&env.id);
        let cancel = &slot.cancel;

        slot.log(format!("creating host namespace {}", env.host_namespace))
            .await;
        self.host
            .create_namespace(&projection::host_namespace(&env))
            .await
            .map_err(|e| {
                Error::provisioning(format!(
                    "create host namespace {}: {e}",
                    env.host_namespace
                ))
            })?;

        slot.log(format!(
            "provisioning {} sandbox {sandbox} in {}",
            env.runtime, env.host_namespace
        ))
        .await;
        self.provisioner
            .provision(&env.host_namespace, &sandbox)
            .await?;

        if let Some(selector) = self.provisioner.readiness_selector(&sandbox) {
            slot.log("waiting for sandbox control plane").await;
            self.wait_for_sandbox(&env.host_namespace, &selector, cancel)
                .await?;
        }

        let connection = self
            .provisioner
            .connect(&env.host_namespace, &sandbox)
            .await?;
        slot.log(format!(
            "obtained sandbox credentials ({})",
            connection.credentials_ref
        ))
        .await;
        slot.env.write().await.credentials_ref = Some(connection.credentials_ref.clone());
        let client = Arc::clone(&connection.client);
        *slot.connection.write().await = Some(connection);

        let version = self
            .wait_for_api(client.as_ref(), &env.host_namespace, cancel)
            .await?;
        slot.log(format!("sandbox API reachable (version {version})"))
            .await;

        if env.namespace != env.host_namespace {
            client
                .create_namespace(&target_namespace(&env))
                .await
                .map_err(|e| {
                    Error::provisioning(format!("create namespace {}: {e}", env.namespace))
                })?;
            slot.log(format!("created namespace {} in sandbox", env.namespace))
                .await;
        }

        let report = clone_workload(self.host.as_ref(), client.as_ref(), CloneRequest {
            shadow_id: &env.id,
            kind: env.source_resource_kind,
            source_namespace: &env.source_namespace,
            name: &env.source_resource_name,
            target_namespace: &env.namespace,
        })
        .await?;
        slot.log(format!(
            "cloned {} {} and {} service(s) [{}] into {}",
            env.source_resource_kind,
            report.workload,
            report.services.len(),
            report.services.join(", "),
            env.namespace
        ))
        .await;
        Ok(())
    }

    async fn wait_for_sandbox(
        &self,
        host_namespace: &str,
        selector: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let host = self.host.as_ref();
        let probe = move || async move {
            match host.list_pods(host_namespace, selector).await {
                Ok(pods) if !pods.is_empty() && pods.iter().all(is_pod_ready) => Ok(Some(())),
                Ok(_) => Ok(None),
                Err(e) => {
                    debug!(namespace = host_namespace, error = %e, "sandbox readiness probe failed");
                    Ok(None)
                },
            }
        };
        match poll_until(
            self.settings.ready_poll_interval(),
            self.settings.ready_timeout(),
            cancel,
            probe,
        )
        .await?
        {
            WaitOutcome::Ready(()) => Ok(()),
            WaitOutcome::TimedOut => Err(Error::ReadinessTimeout {
                what: format!("sandbox control plane in {host_namespace}"),
                diagnostics: diagnostics::snapshot(host, host_namespace).await,
            }),
        }
    }

    async fn wait_for_api(
        &self,
        client: &dyn ClusterClient,
        host_namespace: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let probe = move || async move {
            match client.ping().await {
                Ok(version) => Ok(Some(version)),
                Err(e) => {
                    debug!(error = %e, "sandbox API not answering yet");
                    Ok(None)
                },
            }
        };
        match poll_until(
            self.settings.api_ready_interval(),
            self.settings.api_ready_timeout(),
            cancel,
            probe,
        )
        .await?
        {
            WaitOutcome::Ready(version) => Ok(version),
            WaitOutcome::TimedOut => Err(Error::ReadinessTimeout {
                what: "sandbox API".into(),
                diagnostics: diagnostics::snapshot(self.host.as_ref(), host_namespace).await,
            }),
        }
    }

    /// Best-effort removal of everything an environment may have created.
    /// Returns the failures, if any.
    async fn teardown(&self, slot: &ShadowSlot) -> Vec<String> {
        let env = slot.snapshot().await;
        let mut failures = Vec::new();
        if env.runtime == self.provisioner.runtime() {
            let sandbox = naming::sandbox_name(&env.id);
            if let Err(e) = self.provisioner.destroy(&env.host_namespace, &sandbox).await {
                warn!(shadow_id = %env.id, error = %e, "failed to destroy sandbox");
                failures.push(format!("destroy sandbox {sandbox}: {e}"));
            }
        }
        if let Err(e) = self.host.delete_namespace(&env.host_namespace).await {
            warn!(shadow_id = %env.id, error = %e, "failed to delete host namespace");
            failures.push(format!("delete namespace {}: {e}", env.host_namespace));
        }
        slot.connection.write().await.take();
        failures
    }

    // ── verification ───────────────────────────────────────────────────────

    /// Apply `change` to the environment and judge it.
    ///
    /// Returns the verdict. Failures inside the run never escape: they leave
    /// the environment in ERROR and yield `false`. Only an unknown id or an
    /// environment in a state that cannot be verified is an error.
    #[instrument(skip_all, fields(shadow_id = %id))]
    pub async fn run_verification(
        &self,
        id: &str,
        change: &ChangeSet,
        plan: Option<&VerificationPlan>,
    ) -> Result<bool> {
        let slot = self.slot(id).await?;
        let outcome = {
            let _op = slot.op.lock().await;
            let status = slot.env.read().await.status;
            if !matches!(
                status,
                ShadowStatus::Ready | ShadowStatus::Creating | ShadowStatus::Pending
            ) {
                return Err(Error::InvalidState {
                    id: id.to_string(),
                    status: status.to_string(),
                    expected: "READY",
                });
            }
            let started = Instant::now();
            let outcome = self.verify(&slot, change, plan).await;
            let (result_label, reason_label) = verification_labels(outcome.as_ref());
            record_verification(result_label, reason_label, started.elapsed());
            match outcome {
                Ok(results) => {
                    let passed = results.passed;
                    {
                        let mut env = slot.env.write().await;
                        env.health_score = results.health_score;
                        env.log(format!(
                            "verification {}: {} (health {:.2})",
                            if passed { "passed" } else { "failed" },
                            results.reason,
                            results.health_score
                        ));
                        env.test_results = Some(results);
                    }
                    let status = if passed {
                        ShadowStatus::Passed
                    } else {
                        ShadowStatus::Failed
                    };
                    self.set_status(&slot, status).await;
                    Ok(passed)
                },
                Err(e) => {
                    error!(error = %e, "verification aborted");
                    {
                        let mut env = slot.env.write().await;
                        env.error = Some(e.to_string());
                        env.log(format!("verification aborted: {e}"));
                    }
                    self.set_status(&slot, ShadowStatus::Error).await;
                    Err(e)
                },
            }
        };

        match outcome {
            Ok(passed) => Ok(passed),
            Err(Error::Cancelled) => {
                info!("verification cancelled, cleaning up");
                if let Err(e) = self.cleanup(id).await {
                    warn!(error = %e, "cleanup after cancellation failed");
                }
                Ok(false)
            },
            Err(_) => Ok(false),
        }
    }

    /// Reconnect to the sandbox when the client bundle is gone (recovered
    /// environments, or callers racing `create`).
    async fn connection(&self, slot: &ShadowSlot) -> Result<SandboxConnection> {
        if let Some(connection) = slot.connection.read().await.clone() {
            return Ok(connection);
        }
        let env = slot.snapshot().await;
        slot.log("rehydrating sandbox client").await;
        let connection = self
            .provisioner
            .connect(&env.host_namespace, &naming::sandbox_name(&env.id))
            .await?;
        *slot.connection.write().await = Some(connection.clone());
        Ok(connection)
    }

    async fn verify(
        &self,
        slot: &ShadowSlot,
        change: &ChangeSet,
        plan: Option<&VerificationPlan>,
    ) -> Result<TestResults> {
        let connection = self.connection(slot).await?;
        let client = connection.client.as_ref();
        self.set_status(slot, ShadowStatus::Testing).await;
        let env = slot.snapshot().await;
        let cancel = &slot.cancel;
        let mut security = SecurityScanResults::default();

        if !change.manifests.is_empty() {
            slot.log(format!(
                "scanning {} manifest(s) before apply",
                change.manifests.len()
            ))
            .await;
            let run = self.security.scan_manifests(&change.manifests).await;
            security.errors.extend(run.error);
            security.static_manifest = Some(run.result);
            if !security.static_passed() {
                security.finalize();
                slot.log("static manifest gate failed; change not applied")
                    .await;
                return Ok(TestResults {
                    health_score: 0.0,
                    health_samples: Vec::new(),
                    smoke: None,
                    load: None,
                    security,
                    apply: None,
                    passed: false,
                    reason: VerdictReason::StaticGateFailed.to_string(),
                    timestamp: Utc::now(),
                });
            }
        }

        let target = ApplyTarget {
            kind: env.source_resource_kind,
            namespace: &env.namespace,
            name: &env.source_resource_name,
            allow_cluster_scoped: matches!(env.runtime, ShadowRuntimeKind::Vcluster),
        };
        let apply = self.applicator.apply(client, target, change, cancel).await?;
        slot.log(format!(
            "applied change: patched={} manifests={} failures={} rollout_complete={}",
            apply.patched,
            apply.manifests_applied,
            apply.manifest_failures.len(),
            apply.rollout_complete
        ))
        .await;
        for warning in &apply.warnings {
            slot.log(format!("apply warning: {warning}")).await;
        }

        let workload = client
            .get_workload(env.source_resource_kind, &env.namespace, &env.source_resource_name)
            .await?
            .ok_or_else(|| {
                Error::message(format!(
                    "{} {}/{} vanished after apply",
                    env.source_resource_kind, env.namespace, env.source_resource_name
                ))
            })?;
        let images = container_images(&workload);
        let verification_type = plan.map(|p| p.verification_type).unwrap_or_default();
        slot.log(format!(
            "running {} verification for {}s",
            verification_type_name(verification_type),
            self.settings.verification_window().as_secs()
        ))
        .await;

        let tests = self
            .run_tests(client, &env, &workload, plan, verification_type, cancel)
            .instrument(info_span!("tests"));
        let health = self.health.monitor(client, &env.namespace, cancel);
        let image_gate = self.security.scan_images(&images, cancel);
        let runtime_namespaces = vec![env.namespace.clone(), env.host_namespace.clone()];
        let runtime_gate = async {
            let window = self.settings.verification_window();
            sleep_or_cancel(window, cancel).await?;
            Ok::<_, Error>(
                self.security
                    .scan_runtime(self.host.as_ref(), &runtime_namespaces, window)
                    .await,
            )
        };
        let (tests, health, image_run, runtime_run) =
            tokio::join!(tests, health, image_gate, runtime_gate);
        let (smoke, load) = tests?;
        let health = health?;
        let image_run = image_run?;
        let runtime_run = runtime_run?;

        security.errors.extend(image_run.error);
        security.image_vulnerability = Some(image_run.result);
        security.errors.extend(runtime_run.error);
        security.runtime_behavior = Some(runtime_run.result);
        security.finalize();

        let (passed, reason) = verdict::evaluate(&VerdictInputs {
            health_score: health.score,
            pass_threshold: self.settings.verification.pass_threshold,
            smoke: smoke.as_ref().map(|r| r.passed),
            load: load.as_ref().map(|r| r.passed),
            static_gate: security.static_passed(),
            post_gates: security.post_apply_passed(),
        });
        #[cfg(feature = "metrics")]
        gauge!(shadow_metrics::HEALTH_SCORE).set(health.score);

        Ok(TestResults {
            health_score: health.score,
            health_samples: health.samples,
            smoke,
            load,
            security,
            apply: Some(apply),
            passed,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        })
    }

    /// Smoke first, then load when smoke passed. A target that cannot be
    /// resolved fails the smoke test rather than the run.
    async fn run_tests(
        &self,
        client: &dyn ClusterClient,
        env: &ShadowEnvironment,
        workload: &DynamicObject,
        plan: Option<&VerificationPlan>,
        verification_type: VerificationType,
        cancel: &CancellationToken,
    ) -> Result<(Option<TestRunResult>, Option<TestRunResult>)> {
        if verification_type == VerificationType::Health {
            return Ok((None, None));
        }
        let target = match resolve_target(
            client,
            &env.namespace,
            workload,
            plan,
            &self.settings.tests.default_paths,
        )
        .await
        {
            Ok(target) => target,
            Err(e) => {
                warn!(shadow_id = %env.id, error = %e, "could not resolve test target");
                return Ok((
                    Some(TestRunResult::failed(
                        env.source_resource_name.clone(),
                        format!("no test target: {e}"),
                    )),
                    None,
                ));
            },
        };

        let smoke = self
            .tests
            .run_smoke(client, &env.namespace, &env.id, &target, cancel)
            .await?;
        let run_load = verification_type == VerificationType::Standard
            && self.tests.load_enabled()
            && smoke.passed;
        let load = if run_load {
            Some(
                self.tests
                    .run_load(
                        client,
                        &env.namespace,
                        &env.id,
                        &target,
                        plan.and_then(|p| p.load_test.as_ref()),
                        cancel,
                    )
                    .await?,
            )
        } else {
            None
        };
        Ok((Some(smoke), load))
    }

    // ── cleanup ────────────────────────────────────────────────────────────

    /// Delete the environment's sandbox and host namespace.
    ///
    /// Idempotent: cleaning an environment that is already gone succeeds.
    /// Environments only known through discovery are adopted first.
    #[instrument(skip_all, fields(shadow_id = %id))]
    pub async fn cleanup(&self, id: &str) -> Result<()> {
        let slot = {
            let registry = self.registry.lock().await;
            if registry.deleted.contains(id) {
                debug!("already cleaned up");
                return Ok(());
            }
            registry.slots.get(id).cloned()
        };
        let slot = match slot {
            Some(slot) => slot,
            None => self.adopt(id).await?,
        };

        let _op = slot.op.lock().await;
        if slot.env.read().await.status == ShadowStatus::Deleted {
            return Ok(());
        }
        self.set_status(&slot, ShadowStatus::Cleaning).await;
        slot.log("cleaning up").await;

        let failures = self.teardown(&slot).await;
        if failures.is_empty() {
            slot.log("shadow environment deleted").await;
            self.set_status(&slot, ShadowStatus::Deleted).await;
            let mut registry = self.registry.lock().await;
            registry.slots.remove(id);
            registry.deleted.insert(id.to_string());
            record_cleanup("deleted");
            Ok(())
        } else {
            let message = failures.join("; ");
            {
                let mut env = slot.env.write().await;
                env.error = Some(message.clone());
                env.log(format!("cleanup failed: {message}"));
            }
            self.set_status(&slot, ShadowStatus::Error).await;
            record_cleanup("error");
            Err(Error::message(format!("cleanup of {id} failed: {message}")))
        }
    }

    /// Register an environment found through discovery.
    async fn adopt(&self, id: &str) -> Result<Arc<ShadowSlot>> {
        let env = projection::discover(self.host.as_ref())
            .await?
            .into_iter()
            .find(|env| env.id == id)
            .ok_or_else(|| Error::not_found(id))?;
        Ok(self.insert_recovered(env).await)
    }

    async fn insert_recovered(&self, env: ShadowEnvironment) -> Arc<ShadowSlot> {
        let mut registry = self.registry.lock().await;
        if let Some(existing) = registry.slots.get(&env.id) {
            return Arc::clone(existing);
        }
        let id = env.id.clone();
        if env.status.is_active() {
            registry.active.insert(id.clone());
            record_active(registry.active.len());
        }
        let slot = ShadowSlot::new(env, self.shutdown.child_token());
        registry.slots.insert(id, Arc::clone(&slot));
        slot
    }

    // ── queries ────────────────────────────────────────────────────────────

    /// Every known environment: the registry merged with discovery.
    ///
    /// Discovery failures are logged and the registry alone is returned.
    pub async fn list_environments(&self) -> Vec<ShadowEnvironment> {
        let slots: Vec<Arc<ShadowSlot>> = {
            let registry = self.registry.lock().await;
            registry.slots.values().cloned().collect()
        };
        let mut envs = Vec::with_capacity(slots.len());
        for slot in slots {
            envs.push(slot.snapshot().await);
        }

        match projection::discover(self.host.as_ref()).await {
            Ok(discovered) => {
                let registry = self.registry.lock().await;
                envs.extend(discovered.into_iter().filter(|env| {
                    !registry.slots.contains_key(&env.id) && !registry.deleted.contains(&env.id)
                }));
            },
            Err(e) => warn!(error = %e, "shadow discovery failed"),
        }
        envs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        envs
    }

    pub async fn get_environment(&self, id: &str) -> Result<ShadowEnvironment> {
        let slot = {
            let registry = self.registry.lock().await;
            if registry.deleted.contains(id) {
                return Err(Error::not_found(id));
            }
            registry.slots.get(id).cloned()
        };
        if let Some(slot) = slot {
            return Ok(slot.snapshot().await);
        }
        projection::discover(self.host.as_ref())
            .await?
            .into_iter()
            .find(|env| env.id == id)
            .ok_or_else(|| Error::not_found(id))
    }

    async fn slot(&self, id: &str) -> Result<Arc<ShadowSlot>> {
        let slot = self.registry.lock().await.slots.get(id).cloned();
        match slot {
            Some(slot) => Ok(slot),
            None => self.adopt(id).await,
        }
    }

    // ── recovery & shutdown ────────────────────────────────────────────────

    /// Load every discovered environment into the registry. Returns how many
    /// were added. Recovered environments in an active state count toward the
    /// cap.
    pub async fn recover(&self) -> Result<usize> {
        let discovered = projection::discover(self.host.as_ref()).await?;
        let mut added = 0;
        for env in discovered {
            let known = {
                let registry = self.registry.lock().await;
                registry.slots.contains_key(&env.id) || registry.deleted.contains(&env.id)
            };
            if known {
                continue;
            }
            info!(shadow_id = %env.id, status = %env.status, "recovered shadow environment");
            self.insert_recovered(env).await;
            added += 1;
        }
        Ok(added)
    }

    /// Clean up discovered environments older than `max_age` that nobody is
    /// working on. Returns the ids removed.
    pub async fn reconcile_orphans(&self, max_age: Duration) -> Result<Vec<String>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age)
                .map_err(|e| Error::external("invalid max age", e))?;
        let mut removed = Vec::new();
        for env in projection::discover(self.host.as_ref()).await? {
            if env.created_at > cutoff {
                continue;
            }
            let busy = {
                let registry = self.registry.lock().await;
                registry
                    .slots
                    .get(&env.id)
                    .is_some_and(|slot| slot.op.try_lock().is_err())
            };
            if busy {
                debug!(shadow_id = %env.id, "skipping busy environment");
                continue;
            }
            info!(shadow_id = %env.id, created_at = %env.created_at, "reconciling orphaned shadow");
            match self.cleanup(&env.id).await {
                Ok(()) => removed.push(env.id),
                Err(e) => warn!(shadow_id = %env.id, error = %e, "orphan cleanup failed"),
            }
        }
        Ok(removed)
    }

    /// Cancel outstanding work on one environment. A running verification
    /// stops its waits and jobs, then cleans up.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let slot = self
            .registry
            .lock()
            .await
            .slots
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(id))?;
        info!(shadow_id = id, "cancelling shadow environment");
        slot.cancel.cancel();
        Ok(())
    }

    /// Stop outstanding work and drop every client bundle. Environments are
    /// left in place and remain discoverable.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let slots: Vec<Arc<ShadowSlot>> = self.registry.lock().await.slots.values().cloned().collect();
        for slot in &slots {
            slot.connection.write().await.take();
        }
        info!(environments = slots.len(), "shadow manager shut down");
    }

    // ── state ──────────────────────────────────────────────────────────────

    /// Move an environment to `status`, keep the active set in step and
    /// project the status onto the host namespace.
    async fn set_status(&self, slot: &ShadowSlot, status: ShadowStatus) {
        let (id, host_namespace, previous) = {
            let mut env = slot.env.write().await;
            let previous = env.status;
            env.status = status;
            (env.id.clone(), env.host_namespace.clone(), previous)
        };
        {
            let mut registry = self.registry.lock().await;
            if status.is_active() {
                registry.active.insert(id.clone());
            } else {
                registry.active.remove(&id);
            }
            record_active(registry.active.len());
        }
        info!(shadow_id = %id, from = %previous, to = %status, "status changed");
        if status != ShadowStatus::Deleted {
            projection::project_status(self.host.as_ref(), &host_namespace, status).await;
        }
    }
}

fn target_namespace(env: &ShadowEnvironment) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(env.namespace.clone()),
            labels: Some(BTreeMap::from([
                (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
                (CLONED_FOR_LABEL.to_string(), env.id.clone()),
            ])),
            ..ObjectMeta::default()
        },
        ..Namespace::default()
    }
}

/// Every distinct image in the workload's pod template.
fn container_images(workload: &DynamicObject) -> Vec<String> {
    let mut images: Vec<String> = Vec::new();
    for field in ["initContainers", "containers"] {
        let containers = workload
            .data
            .pointer(&format!("/spec/template/spec/{field}"))
            .and_then(Value::as_array);
        for image in containers
            .into_iter()
            .flatten()
            .filter_map(|c| c.get("image").and_then(Value::as_str))
        {
            if !images.iter().any(|i| i == image) {
                images.push(image.to_string());
            }
        }
    }
    images
}

fn verification_type_name(kind: VerificationType) -> &'static str {
    match kind {
        VerificationType::Standard => "standard",
        VerificationType::Smoke => "smoke",
        VerificationType::Health => "health",
    }
}

#[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
fn record_active(count: usize) {
    #[cfg(feature = "metrics")]
    gauge!(shadow_metrics::ACTIVE).set(count as f64);
}

#[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
fn record_created(elapsed: Duration) {
    #[cfg(feature = "metrics")]
    {
        counter!(shadow_metrics::CREATED_TOTAL).increment(1);
        histogram!(shadow_metrics::CREATE_DURATION_SECONDS).record(elapsed.as_secs_f64());
    }
}

fn record_create_failure() {
    #[cfg(feature = "metrics")]
    counter!(shadow_metrics::CREATE_FAILURES_TOTAL).increment(1);
}

/// `result` and `reason` labels for a finished verification run.
fn verification_labels(
    outcome: std::result::Result<&TestResults, &Error>,
) -> (&'static str, String) {
    match outcome {
        Ok(results) if results.passed => ("passed", results.reason.clone()),
        Ok(results) => ("failed", results.reason.clone()),
        Err(e) => ("error", e.kind().to_string()),
    }
}

#[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
fn record_verification(result: &'static str, reason: String, elapsed: Duration) {
    #[cfg(feature = "metrics")]
    {
        counter!(
            shadow_metrics::VERIFICATIONS_TOTAL,
            labels::RESULT => result,
            labels::REASON => reason
        )
        .increment(1);
        histogram!(shadow_metrics::VERIFICATION_DURATION_SECONDS).record(elapsed.as_secs_f64());
    }
}

#[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
fn record_cleanup(outcome: &'static str) {
    #[cfg(feature = "metrics")]
    counter!(shadow_metrics::CLEANUPS_TOTAL, labels::OUTCOME => outcome).increment(1);
}
