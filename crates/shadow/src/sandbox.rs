//! Sandbox control plane client.
//!
//! A sandbox is where the cloned workload runs: a virtual cluster nested in a
//! host namespace (`vcluster` runtime) or the host namespace itself
//! (`namespace` runtime).

use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    kube::config::{KubeConfigOptions, Kubeconfig},
    mender_config::{SandboxConfig, ShadowRuntimeKind},
    tracing::{debug, info, warn},
};

use crate::{
    cluster::{ClusterClient, KubeClusterClient},
    error::{Error, Result},
    process::{DEFAULT_MAX_OUTPUT_BYTES, run_tool},
};

/// Client bundle for one sandbox; owned by exactly one shadow environment.
#[derive(Clone)]
pub struct SandboxConnection {
    pub client: Arc<dyn ClusterClient>,
    /// Opaque handle to where the credentials live (e.g. the kubeconfig secret).
    pub credentials_ref: String,
}

impl std::fmt::Debug for SandboxConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxConnection")
            .field("credentials_ref", &self.credentials_ref)
            .finish_non_exhaustive()
    }
}

/// Creates, connects to and destroys sandboxes.
#[async_trait]
pub trait SandboxProvisioner: Send + Sync {
    fn runtime(&self) -> ShadowRuntimeKind;

    /// Label selector for the sandbox's own pods in the host namespace.
    /// `None` when there is no nested control plane to wait for.
    fn readiness_selector(&self, name: &str) -> Option<String>;

    /// Start the sandbox control plane inside `host_namespace`.
    async fn provision(&self, host_namespace: &str, name: &str) -> Result<()>;

    /// Obtain a client bundle for the sandbox API.
    async fn connect(&self, host_namespace: &str, name: &str) -> Result<SandboxConnection>;

    /// Tear the sandbox control plane down. Missing sandboxes are not an error.
    async fn destroy(&self, host_namespace: &str, name: &str) -> Result<()>;
}

// ── vcluster ────────────────────────────────────────────────────────────────

/// Drives the `vcluster` CLI.
pub struct VClusterProvisioner {
    binary: String,
    extra_args: Vec<String>,
    command_timeout: Duration,
}

impl VClusterProvisioner {
    #[must_use]
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            binary: config.vcluster_binary.clone(),
            extra_args: config.extra_args.clone(),
            command_timeout: Duration::from_secs(config.ready_timeout_secs.max(60)),
        }
    }

    fn create_args(&self, host_namespace: &str, name: &str) -> Vec<String> {
        let mut args: Vec<String> = [
            "create",
            name,
            "--namespace",
            host_namespace,
            "--connect=false",
            "--update-current=false",
        ]
        .iter()
        .map(|s| (*s).to_string())
        .collect();
        args.extend(self.extra_args.iter().cloned());
        args
    }

    fn connect_args(host_namespace: &str, name: &str) -> Vec<String> {
        ["connect", name, "--namespace", host_namespace, "--print", "--silent"]
            .iter()
            .map(|s| (*s).to_string())
            .collect()
    }

    fn delete_args(host_namespace: &str, name: &str) -> Vec<String> {
        ["delete", name, "--namespace", host_namespace]
            .iter()
            .map(|s| (*s).to_string())
            .collect()
    }

    async fn run(&self, args: &[String]) -> Result<crate::process::ToolOutput> {
        run_tool(
            &self.binary,
            args,
            None,
            self.command_timeout,
            DEFAULT_MAX_OUTPUT_BYTES,
        )
        .await
    }
}

#[async_trait]
impl SandboxProvisioner for VClusterProvisioner {
    fn runtime(&self) -> ShadowRuntimeKind {
        ShadowRuntimeKind::Vcluster
    }

    fn readiness_selector(&self, name: &str) -> Option<String> {
        Some(format!("app=vcluster,release={name}"))
    }

    async fn provision(&self, host_namespace: &str, name: &str) -> Result<()> {
        info!(name, host_namespace, "creating vcluster");
        let out = self.run(&self.create_args(host_namespace, name)).await?;
        if !out.success() {
            return Err(Error::provisioning(format!(
                "vcluster create {name} exited with {}: {}",
                out.exit_code,
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn connect(&self, host_namespace: &str, name: &str) -> Result<SandboxConnection> {
        let out = self.run(&Self::connect_args(host_namespace, name)).await?;
        if !out.success() {
            return Err(Error::provisioning(format!(
                "vcluster connect {name} exited with {}: {}",
                out.exit_code,
                out.stderr.trim()
            )));
        }
        let kubeconfig = Kubeconfig::from_yaml(&out.stdout)
            .map_err(|e| Error::external("parse sandbox kubeconfig", e))?;
        let config =
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::external("load sandbox kubeconfig", e))?;
        let client = kube::Client::try_from(config)?;
        debug!(name, host_namespace, "connected to vcluster");
        Ok(SandboxConnection {
            client: Arc::new(KubeClusterClient::new(client)),
            credentials_ref: format!("secret/{host_namespace}/vc-{name}"),
        })
    }

    async fn destroy(&self, host_namespace: &str, name: &str) -> Result<()> {
        info!(name, host_namespace, "deleting vcluster");
        let out = self.run(&Self::delete_args(host_namespace, name)).await?;
        if out.success() {
            return Ok(());
        }
        let stderr = out.stderr.to_ascii_lowercase();
        if stderr.contains("not found") || stderr.contains("couldn't find") {
            warn!(name, host_namespace, "vcluster already gone");
            return Ok(());
        }
        Err(Error::message(format!(
            "vcluster delete {name} exited with {}: {}",
            out.exit_code,
            out.stderr.trim()
        )))
    }
}

// ── plain namespace ─────────────────────────────────────────────────────────

/// No nested control plane: the shadow lives directly in a host namespace.
pub struct NamespaceProvisioner {
    host: Arc<dyn ClusterClient>,
}

impl NamespaceProvisioner {
    #[must_use]
    pub fn new(host: Arc<dyn ClusterClient>) -> Self {
        Self { host }
    }
}

#[async_trait]
impl SandboxProvisioner for NamespaceProvisioner {
    fn runtime(&self) -> ShadowRuntimeKind {
        ShadowRuntimeKind::Namespace
    }

    fn readiness_selector(&self, _name: &str) -> Option<String> {
        None
    }

    async fn provision(&self, _host_namespace: &str, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn connect(&self, host_namespace: &str, _name: &str) -> Result<SandboxConnection> {
        Ok(SandboxConnection {
            client: Arc::clone(&self.host),
            credentials_ref: format!("host/{host_namespace}"),
        })
    }

    async fn destroy(&self, _host_namespace: &str, _name: &str) -> Result<()> {
        Ok(())
    }
}

/// Build the provisioner matching the configured runtime.
#[must_use]
pub fn provisioner_for(
    runtime: ShadowRuntimeKind,
    config: &SandboxConfig,
    host: Arc<dyn ClusterClient>,
) -> Arc<dyn SandboxProvisioner> {
    match runtime {
        ShadowRuntimeKind::Vcluster => Arc::new(VClusterProvisioner::new(config)),
        ShadowRuntimeKind::Namespace => Arc::new(NamespaceProvisioner::new(host)),
    }
}
