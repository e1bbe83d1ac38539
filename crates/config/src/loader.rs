use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::MenderConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["mender.toml", "mender.yaml", "mender.yml", "mender.json"];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<MenderConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./mender.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/mender/mender.{toml,yaml,yml,json}` (user-global)
///
/// Returns `MenderConfig::default()` if no config file is found.
pub fn discover_and_load() -> MenderConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    MenderConfig::default()
}

/// Find the first config file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    if let Some(dir) = config_dir() {
        for name in CONFIG_FILENAMES {
            let p = dir.join(name);
            if p.exists() {
                return Some(p);
            }
        }
    }

    None
}

/// Returns the user-global config directory (`~/.config/mender/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "mender").map(|d| d.config_dir().to_path_buf())
}

/// Apply `MENDER_*` environment overrides on top of a loaded config.
///
/// Unparseable values are logged and ignored.
pub fn apply_env_overrides(config: &mut MenderConfig) {
    apply_env_overrides_with(config, |name| std::env::var(name).ok());
}

fn apply_env_overrides_with(config: &mut MenderConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(raw) = lookup("MENDER_MAX_CONCURRENT_SHADOWS") {
        match raw.trim().parse::<usize>() {
            Ok(n) => config.shadow.max_concurrent_shadows = n,
            Err(e) => warn!(value = %raw, error = %e, "ignoring MENDER_MAX_CONCURRENT_SHADOWS"),
        }
    }
    if let Some(raw) = lookup("MENDER_SHADOW_RUNTIME") {
        match raw.parse() {
            Ok(kind) => config.shadow.runtime = kind,
            Err(e) => warn!(value = %raw, error = %e, "ignoring MENDER_SHADOW_RUNTIME"),
        }
    }
    if let Some(raw) = lookup("MENDER_VCLUSTER_BINARY")
        && !raw.trim().is_empty()
    {
        config.sandbox.vcluster_binary = raw.trim().to_string();
    }
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<MenderConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}
