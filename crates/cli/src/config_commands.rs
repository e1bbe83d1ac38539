use std::path::{Path, PathBuf};

use {
    anyhow::{Context, Result},
    clap::Subcommand,
    tracing::warn,
};

use mender_config::{MenderConfig, Severity, default_config_template, validate};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Validate the configuration file and report errors/warnings.
    Check,
    /// Print the effective configuration (file, env overrides and defaults).
    Show,
    /// Write a documented default config file.
    Init {
        /// Destination; defaults to ./mender.toml.
        #[arg(long)]
        path: Option<PathBuf>,
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

/// Load the config from `explicit`, or discover it, then apply `MENDER_*`
/// overrides. Returns the file used, if any.
pub fn load(explicit: Option<&Path>) -> Result<(MenderConfig, Option<PathBuf>)> {
    let path = explicit
        .map(Path::to_path_buf)
        .or_else(mender_config::find_config_file);
    let mut config = match &path {
        Some(path) => mender_config::load_config(path)?,
        None => MenderConfig::default(),
    };
    mender_config::apply_env_overrides(&mut config);
    Ok((config, path))
}

/// Refuse to drive the engine with a configuration that has validation errors.
pub fn ensure_valid(config: &MenderConfig) -> Result<()> {
    let result = validate(config);
    let mut errors = Vec::new();
    for d in &result.diagnostics {
        match d.severity {
            Severity::Error => errors.push(format!("{}: {}", d.path, d.message)),
            Severity::Warning => warn!(path = %d.path, "{}", d.message),
        }
    }
    if !errors.is_empty() {
        anyhow::bail!(
            "invalid configuration, see `mender config check`: {}",
            errors.join("; ")
        );
    }
    Ok(())
}

pub fn handle_config(action: ConfigAction, explicit: Option<&Path>) -> Result<()> {
    match action {
        ConfigAction::Check => check(explicit),
        ConfigAction::Show => {
            let (config, _) = load(explicit)?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        },
        ConfigAction::Init { path, force } => init(path, force),
    }
}

/// ANSI color codes.
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

fn check(explicit: Option<&Path>) -> Result<()> {
    let (config, path) = load(explicit)?;

    if let Some(ref path) = path {
        eprintln!("Checking {}\n", path.display());
    } else {
        eprintln!("No config file found; checking defaults.\n");
    }

    let result = validate(&config);
    for d in &result.diagnostics {
        let (color, label) = match d.severity {
            Severity::Error => (RED, "error"),
            Severity::Warning => (YELLOW, "warning"),
        };
        eprintln!("  {BOLD}{color}{label}{RESET} {}: {}", d.path, d.message);
    }

    let errors = result.count(Severity::Error);
    let warnings = result.count(Severity::Warning);

    if !result.diagnostics.is_empty() {
        eprintln!();
    }

    if errors == 0 && warnings == 0 {
        eprintln!("No issues found.");
    } else {
        eprintln!("{errors} error(s), {warnings} warning(s)");
    }

    if errors > 0 {
        std::process::exit(1);
    }

    Ok(())
}

fn init(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = path.unwrap_or_else(|| PathBuf::from("mender.toml"));
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    std::fs::write(&path, default_config_template())
        .with_context(|| format!("failed to write {}", path.display()))?;
    eprintln!("Wrote {}", path.display());
    Ok(())
}
