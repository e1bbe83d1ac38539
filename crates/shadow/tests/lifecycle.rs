//! End-to-end lifecycle tests for the shadow manager against in-memory fakes.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    async_trait::async_trait,
    chrono::Utc,
    k8s_openapi::{
        api::{
            batch::v1::{Job, JobStatus},
            core::v1::{
                ContainerStatus, Event, Namespace, Node, Pod, PodStatus, Service, ServicePort,
                ServiceSpec,
            },
        },
        apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time},
    },
    kube::api::DynamicObject,
    mender_config::ShadowRuntimeKind,
    mender_shadow::{
        ChangeSet, ClusterClient, CreateRequest, Error, Result, SandboxConnection,
        SandboxProvisioner, ScannerRunner, ShadowContext, ShadowEnvironment, ShadowManager,
        ShadowSettings, ShadowStatus, ToolOutput, VerificationPlan, VerificationType,
        WorkloadKind, projection, test_runner::TEST_KIND_LABEL,
    },
    serde_json::{Value, json},
};

// ── Fake cluster ────────────────────────────────────────────────────────────

#[derive(Default)]
struct ClusterState {
    namespaces: BTreeMap<String, Namespace>,
    workloads: HashMap<(String, String, String), DynamicObject>,
    services: Vec<Service>,
    jobs: BTreeMap<(String, String), Job>,
    /// Pods returned for a specific `(namespace, selector)` pair.
    extra_pods: HashMap<(String, String), Vec<Pod>>,
    pod_logs: HashMap<String, String>,
    patches: Vec<Value>,
    applied: Vec<Value>,
    deleted_namespaces: Vec<String>,
}

/// In-memory cluster. Workloads are always rolled out; their pods are ready
/// unless `unhealthy` is set.
#[derive(Default)]
struct FakeCluster {
    state: Mutex<ClusterState>,
    unhealthy: Mutex<bool>,
    smoke_fails: Mutex<bool>,
    load_output: Mutex<String>,
}

fn key(kind: WorkloadKind, namespace: &str, name: &str) -> (String, String, String) {
    (kind.to_string(), namespace.to_string(), name.to_string())
}

fn ready_pod(name: &str, ready: bool, labels: BTreeMap<String, String>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.into()),
            labels: Some(labels),
            ..ObjectMeta::default()
        },
        status: Some(PodStatus {
            phase: Some("Running".into()),
            container_statuses: Some(vec![ContainerStatus {
                name: "app".into(),
                ready,
                ..ContainerStatus::default()
            }]),
            ..PodStatus::default()
        }),
        ..Pod::default()
    }
}

impl FakeCluster {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn seed_checkout(&self) {
        let ar = WorkloadKind::Deployment.api_resource();
        let mut deployment = DynamicObject::new("checkout", &ar).within("shop");
        deployment.data = json!({
            "spec": {
                "replicas": 3,
                "selector": {"matchLabels": {"app": "checkout"}},
                "template": {
                    "metadata": {"labels": {"app": "checkout"}},
                    "spec": {"containers": [{
                        "name": "app",
                        "image": "shop/checkout:1.4",
                        "readinessProbe": {"httpGet": {"path": "/ready", "port": 8080}}
                    }]}
                }
            },
            "status": {"replicas": 3, "availableReplicas": 3, "updatedReplicas": 3}
        });
        let service = Service {
            metadata: ObjectMeta {
                name: Some("checkout".into()),
                namespace: Some("shop".into()),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(BTreeMap::from([("app".into(), "checkout".into())])),
                ports: Some(vec![ServicePort {
                    name: Some("http".into()),
                    port: 80,
                    ..ServicePort::default()
                }]),
                cluster_ip: Some("10.0.0.12".into()),
                ..ServiceSpec::default()
            }),
            status: None,
        };
        let unrelated = Service {
            metadata: ObjectMeta {
                name: Some("payments".into()),
                namespace: Some("shop".into()),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(BTreeMap::from([("app".into(), "payments".into())])),
                ..ServiceSpec::default()
            }),
            status: None,
        };
        let mut state = self.state();
        state
            .workloads
            .insert(key(WorkloadKind::Deployment, "shop", "checkout"), deployment);
        state.services.push(service);
        state.services.push(unrelated);
    }

    fn seed_falco(&self, logs: &str) {
        let mut state = self.state();
        state.extra_pods.insert(
            ("falco".into(), "app.kubernetes.io/name=falco".into()),
            vec![ready_pod("falco-0", true, BTreeMap::new())],
        );
        state.pod_logs.insert("falco-0".into(), logs.into());
    }

    fn seed_namespace(&self, namespace: Namespace) {
        let name = namespace.metadata.name.clone().unwrap();
        self.state().namespaces.insert(name, namespace);
    }

    fn has_namespace(&self, name: &str) -> bool {
        self.state().namespaces.contains_key(name)
    }

    fn annotation(&self, namespace: &str, key: &str) -> Option<String> {
        self.state()
            .namespaces
            .get(namespace)?
            .metadata
            .annotations
            .as_ref()?
            .get(key)
            .cloned()
    }

    fn workload_pods(&self, namespace: &str) -> Vec<Pod> {
        let unhealthy = *self.unhealthy.lock().unwrap();
        let state = self.state();
        let mut pods = Vec::new();
        for ((_, ns, name), object) in &state.workloads {
            if ns != namespace {
                continue;
            }
            let replicas = object
                .data
                .pointer("/spec/replicas")
                .and_then(Value::as_i64)
                .unwrap_or(1);
            for i in 0..replicas {
                pods.push(ready_pod(&format!("{name}-{i}"), !unhealthy, BTreeMap::new()));
            }
        }
        for (ns, name) in state.jobs.keys() {
            if ns == namespace {
                pods.push(job_pod(name));
            }
        }
        pods
    }
}

fn job_pod(name: &str) -> Pod {
    let kind = name.split('-').next().unwrap_or("smoke");
    let mut pod = ready_pod(
        &format!("{name}-pod"),
        false,
        BTreeMap::from([
            ("job-name".to_string(), name.to_string()),
            (TEST_KIND_LABEL.to_string(), kind.to_string()),
        ]),
    );
    pod.status.as_mut().unwrap().phase = Some("Succeeded".into());
    pod
}

const LOCUST_CLEAN: &str = "\
Type     Name      # reqs      # fails |    Avg     Min     Max    Med |   req/s  failures/s
--------|---------|-------|-------------|-------|-------|-------|-------|--------|-----------
GET      /ready       240     0(0.00%) |      4       1      31      3 |    8.00        0.00
--------|---------|-------|-------------|-------|-------|-------|-------|--------|-----------
         Aggregated   240     0(0.00%) |      4       1      31      3 |    8.00        0.00
";

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn ping(&self) -> Result<String> {
        Ok("v1.32.0".into())
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<()> {
        let mut namespace = namespace.clone();
        namespace.metadata.creation_timestamp = Some(Time(Utc::now()));
        let name = namespace.metadata.name.clone().unwrap();
        self.state().namespaces.entry(name).or_insert(namespace);
        Ok(())
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        Ok(self.state().namespaces.get(name).cloned())
    }

    async fn list_namespaces(&self, label_selector: &str) -> Result<Vec<Namespace>> {
        let (k, v) = label_selector.split_once('=').unwrap();
        Ok(self
            .state()
            .namespaces
            .values()
            .filter(|ns| {
                ns.metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(k))
                    .is_some_and(|l| l == v)
            })
            .cloned()
            .collect())
    }

    async fn patch_namespace_metadata(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
        annotations: BTreeMap<String, String>,
    ) -> Result<()> {
        let mut state = self.state();
        let ns = state
            .namespaces
            .get_mut(name)
            .ok_or_else(|| Error::message(format!("namespaces \"{name}\" not found")))?;
        ns.metadata.labels.get_or_insert_default().extend(labels);
        ns.metadata
            .annotations
            .get_or_insert_default()
            .extend(annotations);
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        state.namespaces.remove(name);
        state.deleted_namespaces.push(name.to_string());
        Ok(())
    }

    async fn get_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        let state = self.state();
        let Some(object) = state.workloads.get(&key(kind, namespace, name)) else {
            return Ok(None);
        };
        let mut object = object.clone();
        let replicas = object
            .data
            .pointer("/spec/replicas")
            .cloned()
            .unwrap_or(json!(1));
        object.data["status"] = json!({
            "replicas": replicas,
            "availableReplicas": replicas,
            "updatedReplicas": replicas,
            "readyReplicas": replicas
        });
        Ok(Some(object))
    }

    async fn create_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<()> {
        let name = object.metadata.name.clone().unwrap();
        self.state()
            .workloads
            .insert(key(kind, namespace, &name), object.clone());
        Ok(())
    }

    async fn patch_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<()> {
        let mut state = self.state();
        state.patches.push(patch.clone());
        let object = state
            .workloads
            .get_mut(&key(kind, namespace, name))
            .ok_or_else(|| Error::message("not found"))?;
        if let Some(replicas) = patch.pointer("/spec/replicas") {
            object.data["spec"]["replicas"] = replicas.clone();
        }
        Ok(())
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>> {
        Ok(self
            .state()
            .services
            .iter()
            .filter(|s| s.metadata.namespace.as_deref() == Some(namespace))
            .cloned()
            .collect())
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<()> {
        let mut service = service.clone();
        service.metadata.namespace = Some(namespace.to_string());
        self.state().services.push(service);
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        if label_selector.is_empty() {
            return Ok(self.workload_pods(namespace));
        }
        if let Some(job) = label_selector.strip_prefix("job-name=") {
            let state = self.state();
            return Ok(state
                .jobs
                .get(&(namespace.to_string(), job.to_string()))
                .map(|_| vec![job_pod(job)])
                .unwrap_or_default());
        }
        Ok(self
            .state()
            .extra_pods
            .get(&(namespace.to_string(), label_selector.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn pod_logs(
        &self,
        _namespace: &str,
        pod: &str,
        _since_seconds: Option<i64>,
    ) -> Result<String> {
        if pod.starts_with("smoke-") {
            return Ok("GET http://checkout.shop.svc.cluster.local:80/ready -> 200\n".into());
        }
        if pod.starts_with("load-") {
            return Ok(self.load_output.lock().unwrap().clone());
        }
        Ok(self.state().pod_logs.get(pod).cloned().unwrap_or_default())
    }

    async fn list_events(&self, _namespace: &str) -> Result<Vec<Event>> {
        Ok(Vec::new())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(Vec::new())
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<()> {
        let name = job.metadata.name.clone().unwrap();
        let failed = name.starts_with("smoke-") && *self.smoke_fails.lock().unwrap();
        let mut job = job.clone();
        job.status = Some(JobStatus {
            succeeded: (!failed).then_some(1),
            failed: failed.then_some(1),
            ..JobStatus::default()
        });
        self.state()
            .jobs
            .insert((namespace.to_string(), name), job);
        Ok(())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        Ok(self
            .state()
            .jobs
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        self.state()
            .jobs
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn apply_manifest(
        &self,
        _namespace: &str,
        manifest: &Value,
        _allow_cluster_scoped: bool,
    ) -> Result<()> {
        self.state().applied.push(manifest.clone());
        Ok(())
    }
}

// ── Fake sandbox provisioner ────────────────────────────────────────────────

struct FakeProvisioner {
    sandbox: Arc<FakeCluster>,
    readiness_selector: Option<String>,
    provisioned: Mutex<Vec<String>>,
    destroyed: Mutex<Vec<String>>,
}

impl FakeProvisioner {
    fn new(sandbox: Arc<FakeCluster>) -> Arc<Self> {
        Arc::new(Self {
            sandbox,
            readiness_selector: None,
            provisioned: Mutex::new(Vec::new()),
            destroyed: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl SandboxProvisioner for FakeProvisioner {
    fn runtime(&self) -> ShadowRuntimeKind {
        ShadowRuntimeKind::Vcluster
    }

    fn readiness_selector(&self, name: &str) -> Option<String> {
        self.readiness_selector
            .as_ref()
            .map(|s| format!("{s},release={name}"))
    }

    async fn provision(&self, _host_namespace: &str, name: &str) -> Result<()> {
        self.provisioned.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn connect(&self, host_namespace: &str, name: &str) -> Result<SandboxConnection> {
        Ok(SandboxConnection {
            client: Arc::clone(&self.sandbox) as Arc<dyn ClusterClient>,
            credentials_ref: format!("secret/{host_namespace}/{name}-kubeconfig"),
        })
    }

    async fn destroy(&self, _host_namespace: &str, name: &str) -> Result<()> {
        self.destroyed.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

// ── Fake scanners ───────────────────────────────────────────────────────────

/// Responses keyed by program; a missing program is "not installed".
#[derive(Default)]
struct FakeScanner {
    outputs: HashMap<String, String>,
}

impl FakeScanner {
    fn with(mut self, program: &str, stdout: &str) -> Self {
        self.outputs.insert(program.into(), stdout.into());
        self
    }
}

#[async_trait]
impl ScannerRunner for FakeScanner {
    async fn run(
        &self,
        program: &str,
        _args: &[String],
        _stdin: Option<&str>,
        _timeout: Duration,
    ) -> Result<ToolOutput> {
        match self.outputs.get(program) {
            Some(stdout) => Ok(ToolOutput {
                exit_code: 0,
                stdout: stdout.clone(),
                stderr: String::new(),
            }),
            None => Err(Error::ToolUnavailable {
                tool: program.into(),
            }),
        }
    }
}

const KUBESEC_PRIVILEGED: &str = r#"[{"object":"Deployment/checkout.shop","valid":true,"message":"Failed with a score of -30 points","score":-30,"scoring":{"critical":[{"id":"Privileged","reason":"Privileged containers can allow almost completely unrestricted host access"}]}}]"#;
const TRIVY_CLEAN: &str = r#"{"SchemaVersion":2,"Results":[{"Target":"shop/checkout:1.4","Vulnerabilities":null}]}"#;
const FALCO_UNRELATED: &str = r#"{"priority":"Critical","rule":"Terminal shell in container","output":"shell spawned","output_fields":{"k8s.ns.name":"billing"}}"#;

// ── Harness ─────────────────────────────────────────────────────────────────

struct Harness {
    host: Arc<FakeCluster>,
    sandbox: Arc<FakeCluster>,
    provisioner: Arc<FakeProvisioner>,
    manager: ShadowManager,
}

fn settings(max: usize) -> ShadowSettings {
    let mut settings = ShadowSettings::default();
    settings.max_concurrent_shadows = max;
    settings.verification.duration_secs = 20;
    settings.verification.sample_interval_secs = 5;
    settings.verification.rollout_timeout_secs = 30;
    settings.verification.rollout_poll_interval_secs = 1;
    settings.sandbox.ready_timeout_secs = 30;
    settings.sandbox.ready_poll_interval_secs = 1;
    settings.sandbox.api_ready_attempts = 3;
    settings.sandbox.api_ready_interval_secs = 1;
    settings.tests.job_poll_interval_secs = 1;
    settings
}

fn harness_with(
    settings: ShadowSettings,
    scanner: FakeScanner,
    configure: impl FnOnce(&mut FakeProvisioner),
) -> Harness {
    let host = FakeCluster::new();
    host.seed_checkout();
    let sandbox = FakeCluster::new();
    *sandbox.load_output.lock().unwrap() = LOCUST_CLEAN.into();
    let mut provisioner = FakeProvisioner {
        sandbox: Arc::clone(&sandbox),
        readiness_selector: None,
        provisioned: Mutex::new(Vec::new()),
        destroyed: Mutex::new(Vec::new()),
    };
    configure(&mut provisioner);
    let provisioner = Arc::new(provisioner);
    let manager = ShadowManager::new(ShadowContext {
        host: Arc::clone(&host) as Arc<dyn ClusterClient>,
        provisioner: Arc::clone(&provisioner) as Arc<dyn SandboxProvisioner>,
        scanner: Arc::new(scanner),
        settings,
    });
    Harness {
        host,
        sandbox,
        provisioner,
        manager,
    }
}

fn harness(max: usize) -> Harness {
    harness_with(
        settings(max),
        FakeScanner::default()
            .with("kubesec", "[]")
            .with("trivy", TRIVY_CLEAN),
        |_| {},
    )
}

fn checkout(id: &str) -> CreateRequest {
    CreateRequest {
        source_namespace: "shop".into(),
        name: "checkout".into(),
        kind: WorkloadKind::Deployment,
        id: Some(id.into()),
    }
}

fn scale_to(replicas: i32) -> ChangeSet {
    ChangeSet {
        replicas: Some(replicas),
        ..ChangeSet::default()
    }
}

// ── Scenarios ───────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn create_clones_workload_into_ready_sandbox() {
    let h = harness(3);
    let env = h.manager.create(checkout("Fix/42")).await.unwrap();

    assert_eq!(env.id, "fix-42");
    assert_eq!(env.status, ShadowStatus::Ready);
    assert_eq!(env.host_namespace, "shadow-fix-42");
    assert_eq!(env.namespace, "shop");
    assert_eq!(
        env.credentials_ref.as_deref(),
        Some("secret/shadow-fix-42/vc-fix-42-kubeconfig")
    );
    assert!(
        env.logs
            .iter()
            .any(|l| l.contains("creating host namespace shadow-fix-42"))
    );
    assert!(env.logs.iter().any(|l| l.contains("cloned Deployment checkout")));
    assert_eq!(h.manager.active_count().await, 1);

    assert!(h.host.has_namespace("shadow-fix-42"));
    assert_eq!(
        h.host.annotation("shadow-fix-42", projection::STATUS_ANNOTATION).as_deref(),
        Some("READY")
    );
    assert_eq!(
        h.host.annotation("shadow-fix-42", projection::SOURCE_ANNOTATION).as_deref(),
        Some("shop/Deployment/checkout")
    );

    let sandbox = h.sandbox.state();
    assert!(
        sandbox
            .workloads
            .contains_key(&key(WorkloadKind::Deployment, "shop", "checkout"))
    );
    let cloned: Vec<_> = sandbox
        .services
        .iter()
        .filter_map(|s| s.metadata.name.as_deref())
        .collect();
    assert_eq!(cloned, vec!["checkout"]);
    let svc = &sandbox.services[0];
    assert!(svc.spec.as_ref().unwrap().cluster_ip.is_none());
}

#[tokio::test(start_paused = true)]
async fn failing_static_gate_never_applies_the_change() {
    let h = harness_with(
        settings(3),
        FakeScanner::default()
            .with("kubesec", KUBESEC_PRIVILEGED)
            .with("trivy", TRIVY_CLEAN),
        |_| {},
    );
    let env = h.manager.create(checkout("fix-b")).await.unwrap();
    let change = ChangeSet {
        replicas: Some(5),
        manifests: vec![
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: checkout\n".into(),
        ],
        ..ChangeSet::default()
    };

    let passed = h
        .manager
        .run_verification(&env.id, &change, None)
        .await
        .unwrap();
    assert!(!passed);

    let env = h.manager.get_environment(&env.id).await.unwrap();
    assert_eq!(env.status, ShadowStatus::Failed);
    let results = env.test_results.unwrap();
    assert!(!results.passed);
    assert_eq!(results.reason, "static_gate_failed");
    assert!(!results.security.static_manifest.as_ref().unwrap().passed);
    assert!(results.smoke.is_none());
    assert!(results.apply.is_none());

    let sandbox = h.sandbox.state();
    assert!(sandbox.patches.is_empty());
    assert!(sandbox.applied.is_empty());
    assert!(sandbox.jobs.is_empty());
}

#[tokio::test(start_paused = true)]
async fn healthy_change_with_passing_tests_and_gates_passes() {
    let h = harness(3);
    h.host.seed_falco(FALCO_UNRELATED);
    let env = h.manager.create(checkout("fix-c")).await.unwrap();

    let passed = h
        .manager
        .run_verification(&env.id, &scale_to(4), None)
        .await
        .unwrap();
    assert!(passed);

    let env = h.manager.get_environment(&env.id).await.unwrap();
    assert_eq!(env.status, ShadowStatus::Passed);
    assert!((env.health_score - 1.0).abs() < f64::EPSILON);
    let results = env.test_results.unwrap();
    assert!(results.passed);
    assert_eq!(results.reason, "passed");
    assert_eq!(results.health_samples.len(), 4);

    let smoke = results.smoke.unwrap();
    assert!(smoke.passed, "{smoke:?}");
    assert!(smoke.job_name.starts_with("smoke-fix-c-"));
    assert!(smoke.logs.contains("-> 200"));
    let load = results.load.unwrap();
    assert!(load.passed, "{load:?}");
    assert_eq!(load.requests, Some(240));

    let security = results.security;
    assert!(security.passed);
    assert!(security.image_vulnerability.unwrap().passed);
    let runtime = security.runtime_behavior.unwrap();
    assert!(runtime.passed && !runtime.skipped);
    assert!(runtime.events.is_empty());

    let apply = results.apply.unwrap();
    assert!(apply.patched && apply.rollout_complete);
    assert_eq!(h.sandbox.state().patches.len(), 1);
    // Verdict reached; the slot is free again.
    assert_eq!(h.manager.active_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn absent_runtime_monitor_is_skipped_not_failed() {
    let h = harness(3);
    let env = h.manager.create(checkout("fix-d")).await.unwrap();

    let passed = h
        .manager
        .run_verification(&env.id, &scale_to(3), None)
        .await
        .unwrap();
    assert!(passed);

    let results = h
        .manager
        .get_environment(&env.id)
        .await
        .unwrap()
        .test_results
        .unwrap();
    let runtime = results.security.runtime_behavior.unwrap();
    assert!(runtime.skipped);
    assert!(runtime.passed);
    assert!(results.security.passed);
}

#[tokio::test(start_paused = true)]
async fn create_at_capacity_is_rejected_without_side_effects() {
    let h = harness(1);
    h.manager.create(checkout("first")).await.unwrap();

    let err = h.manager.create(checkout("second")).await.unwrap_err();
    assert!(matches!(err, Error::Capacity { active: 1, max: 1 }));
    assert!(!h.host.has_namespace("shadow-second"));
    assert_eq!(h.provisioner.provisioned.lock().unwrap().len(), 1);
    assert_eq!(h.manager.active_count().await, 1);
    assert!(matches!(
        h.manager.get_environment("second").await,
        Err(Error::NotFound { .. })
    ));
}

// ── Lifecycle properties ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn active_count_never_exceeds_cap() {
    let h = harness(2);
    for i in 0..5 {
        let _ = h.manager.create(checkout(&format!("cap-{i}"))).await;
        assert!(h.manager.active_count().await <= 2);
    }
    assert_eq!(h.manager.active_count().await, 2);

    h.manager.cleanup("cap-0").await.unwrap();
    assert_eq!(h.manager.active_count().await, 1);
    h.manager.create(checkout("cap-5")).await.unwrap();
    assert_eq!(h.manager.active_count().await, 2);
}

#[tokio::test(start_paused = true)]
async fn cleanup_is_idempotent_and_terminal() {
    let h = harness(2);
    let env = h.manager.create(checkout("fix-e")).await.unwrap();
    h.manager.create(checkout("other")).await.unwrap();
    assert_eq!(h.manager.active_count().await, 2);

    h.manager.cleanup(&env.id).await.unwrap();
    assert_eq!(h.manager.active_count().await, 1);
    assert!(!h.host.has_namespace("shadow-fix-e"));
    assert_eq!(*h.provisioner.destroyed.lock().unwrap(), vec!["vc-fix-e"]);

    h.manager.cleanup(&env.id).await.unwrap();
    assert_eq!(h.manager.active_count().await, 1);
    assert_eq!(h.provisioner.destroyed.lock().unwrap().len(), 1);
    assert!(matches!(
        h.manager.get_environment(&env.id).await,
        Err(Error::NotFound { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn duplicate_id_is_rejected() {
    let h = harness(3);
    h.manager.create(checkout("dup")).await.unwrap();
    let err = h.manager.create(checkout("DUP")).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyExists { .. }));
    assert_eq!(h.manager.active_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn sandbox_readiness_timeout_reports_diagnostics_and_cleans_up() {
    let h = harness_with(
        settings(3),
        FakeScanner::default(),
        |p| p.readiness_selector = Some("app=vcluster".into()),
    );

    let err = h.manager.create(checkout("stuck")).await.unwrap_err();
    let Error::ReadinessTimeout { diagnostics, .. } = &err else {
        panic!("unexpected error: {err}");
    };
    assert!(diagnostics.contains("pods in shadow-stuck"));
    assert!(diagnostics.contains("nodes:"));

    let env = h.manager.get_environment("stuck").await.unwrap();
    assert_eq!(env.status, ShadowStatus::Error);
    assert!(env.error.unwrap().contains("timed out waiting for"));
    assert!(!h.host.has_namespace("shadow-stuck"));
    assert_eq!(*h.provisioner.destroyed.lock().unwrap(), vec!["vc-stuck"]);
    assert_eq!(h.manager.active_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn missing_source_workload_fails_create() {
    let h = harness(3);
    let err = h
        .manager
        .create(CreateRequest {
            source_namespace: "shop".into(),
            name: "ghost".into(),
            kind: WorkloadKind::Deployment,
            id: Some("ghost".into()),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Provisioning(_)));
    assert!(!h.host.has_namespace("shadow-ghost"));
    assert_eq!(h.manager.active_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn failing_smoke_test_fails_verification_and_skips_load() {
    let h = harness(3);
    *h.sandbox.smoke_fails.lock().unwrap() = true;
    let env = h.manager.create(checkout("smoke")).await.unwrap();

    let passed = h
        .manager
        .run_verification(&env.id, &scale_to(3), None)
        .await
        .unwrap();
    assert!(!passed);
    let env = h.manager.get_environment(&env.id).await.unwrap();
    assert_eq!(env.status, ShadowStatus::Failed);
    let results = env.test_results.unwrap();
    assert_eq!(results.reason, "smoke_test_failed");
    assert!(!results.smoke.unwrap().passed);
    assert!(results.load.is_none());
}

#[tokio::test(start_paused = true)]
async fn unhealthy_pods_fail_on_health_threshold() {
    let h = harness(3);
    *h.sandbox.unhealthy.lock().unwrap() = true;
    let env = h.manager.create(checkout("sick")).await.unwrap();
    let plan = VerificationPlan {
        verification_type: VerificationType::Health,
        ..VerificationPlan::default()
    };

    let passed = h
        .manager
        .run_verification(&env.id, &scale_to(3), Some(&plan))
        .await
        .unwrap();
    assert!(!passed);
    let results = h
        .manager
        .get_environment(&env.id)
        .await
        .unwrap()
        .test_results
        .unwrap();
    assert!(results.health_score.abs() < f64::EPSILON);
    assert_eq!(results.reason, "health_below_threshold");
    assert!(results.smoke.is_none());
    assert!(h.sandbox.state().jobs.is_empty());
}

#[tokio::test(start_paused = true)]
async fn verifying_twice_is_an_invalid_state() {
    let h = harness(3);
    let env = h.manager.create(checkout("twice")).await.unwrap();
    h.manager
        .run_verification(&env.id, &scale_to(3), None)
        .await
        .unwrap();
    let err = h
        .manager
        .run_verification(&env.id, &scale_to(3), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_verification_and_cleans_up() {
    let h = harness(3);
    let env = h.manager.create(checkout("cancel-me")).await.unwrap();
    let change = scale_to(3);

    let (passed, cancelled) = tokio::join!(
        h.manager.run_verification(&env.id, &change, None),
        async {
            tokio::time::sleep(Duration::from_secs(7)).await;
            h.manager.cancel(&env.id).await
        }
    );
    cancelled.unwrap();
    assert!(!passed.unwrap());
    assert!(!h.host.has_namespace("shadow-cancel-me"));
    assert_eq!(h.manager.active_count().await, 0);
    assert!(matches!(
        h.manager.get_environment(&env.id).await,
        Err(Error::NotFound { .. })
    ));
}

// ── Recovery ────────────────────────────────────────────────────────────────

fn orphan(id: &str, status: ShadowStatus, age: chrono::Duration) -> Namespace {
    let env = ShadowEnvironment {
        id: id.into(),
        namespace: "shop".into(),
        host_namespace: format!("shadow-{id}"),
        source_namespace: "shop".into(),
        source_resource_name: "checkout".into(),
        source_resource_kind: WorkloadKind::Deployment,
        runtime: ShadowRuntimeKind::Vcluster,
        status,
        created_at: Utc::now(),
        health_score: 0.0,
        logs: Vec::new(),
        error: None,
        test_results: None,
        credentials_ref: None,
    };
    let mut ns = projection::host_namespace(&env);
    ns.metadata.creation_timestamp = Some(Time(Utc::now() - age));
    ns
}

#[tokio::test(start_paused = true)]
async fn recovered_environments_are_listed_and_count_toward_cap() {
    let h = harness(2);
    h.host
        .seed_namespace(orphan("old-ready", ShadowStatus::Ready, chrono::Duration::minutes(5)));
    h.host
        .seed_namespace(orphan("old-failed", ShadowStatus::Failed, chrono::Duration::minutes(5)));

    let listed = h.manager.list_environments().await;
    assert_eq!(listed.len(), 2);
    assert_eq!(h.manager.active_count().await, 0);

    assert_eq!(h.manager.recover().await.unwrap(), 2);
    assert_eq!(h.manager.recover().await.unwrap(), 0);
    assert_eq!(h.manager.active_count().await, 1);

    let env = h.manager.get_environment("old-ready").await.unwrap();
    assert_eq!(env.status, ShadowStatus::Ready);
    assert_eq!(env.source_ref(), "shop/Deployment/checkout");

    h.manager.create(checkout("fresh")).await.unwrap();
    assert!(matches!(
        h.manager.create(checkout("one-too-many")).await,
        Err(Error::Capacity { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn discovered_environment_can_be_cleaned_without_recover() {
    let h = harness(2);
    h.host
        .seed_namespace(orphan("stray", ShadowStatus::Testing, chrono::Duration::minutes(1)));
    h.manager.cleanup("stray").await.unwrap();
    assert!(!h.host.has_namespace("shadow-stray"));
    assert_eq!(h.manager.active_count().await, 0);
    assert!(matches!(
        h.manager.cleanup("never-existed").await,
        Err(Error::NotFound { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn reconcile_removes_only_old_orphans() {
    let h = harness(3);
    h.host
        .seed_namespace(orphan("ancient", ShadowStatus::Failed, chrono::Duration::hours(3)));
    h.host
        .seed_namespace(orphan("recent", ShadowStatus::Ready, chrono::Duration::minutes(2)));

    let removed = h
        .manager
        .reconcile_orphans(Duration::from_secs(3600))
        .await
        .unwrap();
    assert_eq!(removed, vec!["ancient"]);
    assert!(!h.host.has_namespace("shadow-ancient"));
    assert!(h.host.has_namespace("shadow-recent"));
}

#[tokio::test(start_paused = true)]
async fn shutdown_leaves_environments_discoverable() {
    let h = harness(3);
    let env = h.manager.create(checkout("keep")).await.unwrap();
    h.manager.shutdown().await;
    assert!(h.host.has_namespace(&env.host_namespace));

    let fresh = ShadowManager::new(ShadowContext {
        host: Arc::clone(&h.host) as Arc<dyn ClusterClient>,
        provisioner: FakeProvisioner::new(Arc::clone(&h.sandbox)),
        scanner: Arc::new(FakeScanner::default()),
        settings: settings(3),
    });
    assert_eq!(fresh.recover().await.unwrap(), 1);
    assert_eq!(
        fresh.get_environment("keep").await.unwrap().status,
        ShadowStatus::Ready
    );
}
