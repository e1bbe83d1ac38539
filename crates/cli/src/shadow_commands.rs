use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use {
    anyhow::{Context, Result},
    clap::{Args, Subcommand},
    mender_config::MenderConfig,
    mender_shadow::{
        ChangeSet, CreateRequest, ShadowContext, ShadowEnvironment, ShadowManager,
        VerificationPlan, VerificationType, WorkloadKind,
    },
    serde::de::DeserializeOwned,
    tracing::{info, warn},
};

#[derive(Subcommand)]
pub enum ShadowAction {
    /// Clone a workload into a new shadow environment.
    Create {
        #[command(flatten)]
        workload: WorkloadArgs,
    },
    /// Verify a change against an existing shadow environment.
    Verify {
        id: String,
        #[command(flatten)]
        change: ChangeArgs,
    },
    /// Create, verify and clean up in one go.
    Run {
        #[command(flatten)]
        workload: WorkloadArgs,
        #[command(flatten)]
        change: ChangeArgs,
        /// Leave the environment in place after the verdict.
        #[arg(long)]
        keep: bool,
    },
    /// List shadow environments.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show one environment, including its evidence.
    Get { id: String },
    /// Delete an environment's sandbox and host namespace.
    Cleanup { id: String },
    /// Clean up environments older than the given age.
    Reconcile {
        /// Minimum age in seconds.
        #[arg(long, default_value_t = 3600)]
        max_age_secs: u64,
    },
}

#[derive(Args)]
pub struct WorkloadArgs {
    /// Workload name in the source namespace.
    name: String,
    #[arg(short, long, default_value = "default")]
    namespace: String,
    /// Deployment, StatefulSet or DaemonSet.
    #[arg(long, default_value = "deployment")]
    kind: WorkloadKind,
    /// Shadow id; generated when omitted.
    #[arg(long)]
    id: Option<String>,
}

#[derive(Args)]
pub struct ChangeArgs {
    #[arg(long)]
    replicas: Option<i32>,
    #[arg(long)]
    image: Option<String>,
    /// Container targeted by --image and --env (default: first container).
    #[arg(long)]
    container: Option<String>,
    /// Environment variable to set, KEY=VALUE. Repeatable.
    #[arg(long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,
    /// Manifest file to apply. Repeatable.
    #[arg(long = "manifest", value_name = "PATH")]
    manifests: Vec<PathBuf>,
    /// Legacy kubectl command, e.g. "kubectl scale deploy/api --replicas=3". Repeatable.
    #[arg(long = "command", value_name = "CMD")]
    commands: Vec<String>,
    /// Change set as a JSON or YAML file; flags are merged on top.
    #[arg(long)]
    change_file: Option<PathBuf>,
    /// Verification plan as a JSON or YAML file.
    #[arg(long)]
    plan: Option<PathBuf>,
    /// standard, smoke or health.
    #[arg(long = "type", value_name = "TYPE")]
    verification_type: Option<String>,
    /// Test this URL instead of the discovered service.
    #[arg(long)]
    target_url: Option<String>,
}

impl ChangeArgs {
    fn change_set(&self) -> Result<ChangeSet> {
        let mut change: ChangeSet = match &self.change_file {
            Some(path) => read_document(path)?,
            None => ChangeSet::default(),
        };
        if self.replicas.is_some() {
            change.replicas = self.replicas;
        }
        if self.image.is_some() {
            change.image.clone_from(&self.image);
        }
        if self.container.is_some() {
            change.container.clone_from(&self.container);
        }
        for pair in &self.env {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("--env expects KEY=VALUE, got {pair:?}"))?;
            change.env.insert(key.to_string(), value.to_string());
        }
        for path in &self.manifests {
            change.manifests.push(
                std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
            );
        }
        change.commands.extend(self.commands.iter().cloned());
        if change.is_empty() {
            anyhow::bail!(
                "no change given; pass --replicas, --image, --env, --manifest, --command or \
                 --change-file"
            );
        }
        Ok(change)
    }

    fn plan(&self) -> Result<Option<VerificationPlan>> {
        let mut plan: Option<VerificationPlan> = match &self.plan {
            Some(path) => Some(read_document(path)?),
            None => None,
        };
        if let Some(raw) = &self.verification_type {
            plan.get_or_insert_default().verification_type = parse_verification_type(raw)?;
        }
        if self.target_url.is_some() {
            plan.get_or_insert_default()
                .target_url
                .clone_from(&self.target_url);
        }
        Ok(plan)
    }
}

fn parse_verification_type(raw: &str) -> Result<VerificationType> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "standard" => Ok(VerificationType::Standard),
        "smoke" => Ok(VerificationType::Smoke),
        "health" => Ok(VerificationType::Health),
        other => anyhow::bail!("unknown verification type: {other}"),
    }
}

/// Read a JSON or YAML file, chosen by extension.
fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let parsed = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&raw)?,
        _ => serde_yaml::from_str(&raw)?,
    };
    Ok(parsed)
}

impl WorkloadArgs {
    fn request(self) -> CreateRequest {
        CreateRequest {
            source_namespace: self.namespace,
            name: self.name,
            kind: self.kind,
            id: self.id,
        }
    }
}

pub async fn handle_shadow(action: ShadowAction, config: &MenderConfig) -> Result<()> {
    let manager = Arc::new(ShadowManager::new(ShadowContext::from_config(config).await?));

    match action {
        ShadowAction::Create { workload } => {
            let env = manager.create(workload.request()).await?;
            print_json(&env)
        },
        ShadowAction::Verify { id, change } => {
            let change_set = change.change_set()?;
            let plan = change.plan()?;
            let passed = verify_with_interrupt(&manager, &id, &change_set, plan.as_ref()).await?;
            print_json(&manager.get_environment(&id).await?)?;
            exit_on_failure(passed);
            Ok(())
        },
        ShadowAction::Run {
            workload,
            change,
            keep,
        } => {
            let change_set = change.change_set()?;
            let plan = change.plan()?;
            let env = manager.create(workload.request()).await?;
            info!(shadow_id = %env.id, "shadow environment created");
            let passed =
                verify_with_interrupt(&manager, &env.id, &change_set, plan.as_ref()).await?;
            // A cancelled run has already been cleaned up.
            if let Ok(env) = manager.get_environment(&env.id).await {
                print_json(&env)?;
                if !keep {
                    manager.cleanup(&env.id).await?;
                }
            }
            exit_on_failure(passed);
            Ok(())
        },
        ShadowAction::List { json } => {
            let envs = manager.list_environments().await;
            if json {
                print_json(&envs)
            } else {
                print_table(&envs);
                Ok(())
            }
        },
        ShadowAction::Get { id } => print_json(&manager.get_environment(&id).await?),
        ShadowAction::Cleanup { id } => {
            manager.cleanup(&id).await?;
            eprintln!("Deleted {id}");
            Ok(())
        },
        ShadowAction::Reconcile { max_age_secs } => {
            let removed = manager
                .reconcile_orphans(Duration::from_secs(max_age_secs))
                .await?;
            if removed.is_empty() {
                eprintln!("No orphaned environments older than {max_age_secs}s.");
            }
            for id in removed {
                println!("{id}");
            }
            Ok(())
        },
    }
}

/// Run a verification, cancelling it (and cleaning up) on Ctrl-C.
async fn verify_with_interrupt(
    manager: &Arc<ShadowManager>,
    id: &str,
    change: &ChangeSet,
    plan: Option<&VerificationPlan>,
) -> Result<bool> {
    let watcher = {
        let manager = Arc::clone(manager);
        let id = id.to_string();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(shadow_id = %id, "interrupted, cancelling verification");
                if let Err(e) = manager.cancel(&id).await {
                    warn!(error = %e, "cancel failed");
                }
            }
        })
    };
    let result = manager.run_verification(id, change, plan).await;
    watcher.abort();
    Ok(result?)
}

fn exit_on_failure(passed: bool) {
    if !passed {
        std::process::exit(2);
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_table(envs: &[ShadowEnvironment]) {
    if envs.is_empty() {
        println!("No shadow environments.");
        return;
    }
    println!(
        "{:<24} {:<9} {:<10} {:<40} HOST NAMESPACE",
        "ID", "STATUS", "RUNTIME", "SOURCE"
    );
    for env in envs {
        println!(
            "{:<24} {:<9} {:<10} {:<40} {}",
            env.id,
            env.status,
            env.runtime,
            env.source_ref(),
            env.host_namespace
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change_args() -> ChangeArgs {
        ChangeArgs {
            replicas: None,
            image: None,
            container: None,
            env: Vec::new(),
            manifests: Vec::new(),
            commands: Vec::new(),
            change_file: None,
            plan: None,
            verification_type: None,
            target_url: None,
        }
    }

    #[test]
    fn flags_merge_over_change_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("change.yaml");
        std::fs::write(&path, "replicas: 2\nenv:\n  LOG_LEVEL: info\n").unwrap();
        let args = ChangeArgs {
            replicas: Some(4),
            env: vec!["LOG_LEVEL=debug".into(), "FEATURE_X=on".into()],
            change_file: Some(path),
            ..change_args()
        };
        let change = args.change_set().unwrap();
        assert_eq!(change.replicas, Some(4));
        assert_eq!(change.env["LOG_LEVEL"], "debug");
        assert_eq!(change.env["FEATURE_X"], "on");
    }

    #[test]
    fn empty_change_is_rejected() {
        assert!(change_args().change_set().is_err());
        let bad_env = ChangeArgs {
            env: vec!["NOEQUALS".into()],
            ..change_args()
        };
        assert!(bad_env.change_set().is_err());
    }

    #[test]
    fn type_and_target_build_a_plan() {
        assert!(change_args().plan().unwrap().is_none());
        let args = ChangeArgs {
            verification_type: Some("Health".into()),
            target_url: Some("http://api.shop.svc:8080/healthz".into()),
            ..change_args()
        };
        let plan = args.plan().unwrap().unwrap();
        assert_eq!(plan.verification_type, VerificationType::Health);
        assert_eq!(
            plan.target_url.as_deref(),
            Some("http://api.shop.svc:8080/healthz")
        );
        assert!(parse_verification_type("chaos").is_err());
    }
}
