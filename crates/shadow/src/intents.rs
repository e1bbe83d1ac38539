//! Legacy command strings parsed into typed change intents.
//!
//! Accepted forms (leading `kubectl` optional):
//! `scale <kind>/<name> --replicas=N`, `set image <kind>/<name> <container>=<image>`,
//! `set env <kind>/<name> [-c <container>] KEY=VALUE...`.

use std::collections::BTreeMap;

use crate::types::ChangeSet;

/// One typed change extracted from a command string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeIntent {
    Scale {
        replicas: i32,
    },
    SetImage {
        container: String,
        image: String,
    },
    SetEnv {
        container: Option<String>,
        vars: BTreeMap<String, String>,
    },
}

/// Parse a single command string.
pub fn parse_intent(command: &str) -> Result<ChangeIntent, String> {
    let words = shell_words::split(command).map_err(|e| format!("{command:?}: {e}"))?;
    let mut words: &[String] = &words;
    if words.first().is_some_and(|w| w == "kubectl") {
        words = &words[1..];
    }
    match words {
        [verb, rest @ ..] if verb == "scale" => parse_scale(rest),
        [verb, sub, rest @ ..] if verb == "set" && sub == "image" => parse_set_image(rest),
        [verb, sub, rest @ ..] if verb == "set" && sub == "env" => parse_set_env(rest),
        _ => Err(format!("unsupported command: {command:?}")),
    }
    .map_err(|e| {
        if e.starts_with("unsupported") {
            e
        } else {
            format!("{command:?}: {e}")
        }
    })
}

fn parse_scale(args: &[String]) -> Result<ChangeIntent, String> {
    let mut replicas = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(value) = arg.strip_prefix("--replicas=") {
            replicas = Some(value.to_string());
        } else if arg == "--replicas" {
            replicas = iter.next().cloned();
        }
    }
    let raw = replicas.ok_or("missing --replicas")?;
    let replicas: i32 = raw
        .parse()
        .map_err(|_| format!("invalid replica count {raw:?}"))?;
    if replicas < 0 {
        return Err(format!("invalid replica count {raw:?}"));
    }
    Ok(ChangeIntent::Scale { replicas })
}

fn parse_set_image(args: &[String]) -> Result<ChangeIntent, String> {
    // args[0] is the resource; the first KEY=VALUE after it is the assignment.
    let assignment = args
        .iter()
        .skip(1)
        .find(|a| !a.starts_with('-') && a.contains('='))
        .ok_or("missing <container>=<image>")?;
    let (container, image) = assignment
        .split_once('=')
        .filter(|(c, i)| !c.is_empty() && !i.is_empty())
        .ok_or_else(|| format!("invalid image assignment {assignment:?}"))?;
    Ok(ChangeIntent::SetImage {
        container: container.to_string(),
        image: image.to_string(),
    })
}

fn parse_set_env(args: &[String]) -> Result<ChangeIntent, String> {
    let mut container = None;
    let mut vars = BTreeMap::new();
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "-c" || arg == "--container" {
            container = iter.next().cloned();
        } else if let Some(value) = arg.strip_prefix("--container=") {
            container = Some(value.to_string());
        } else if arg.starts_with('-') {
            continue;
        } else if let Some((key, value)) = arg.split_once('=') {
            if key.is_empty() {
                return Err(format!("invalid env assignment {arg:?}"));
            }
            vars.insert(key.to_string(), value.to_string());
        }
    }
    if vars.is_empty() {
        return Err("missing KEY=VALUE".into());
    }
    Ok(ChangeIntent::SetEnv { container, vars })
}

/// A change set with intents folded into the typed fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedChange {
    pub replicas: Option<i32>,
    pub image: Option<String>,
    pub container: Option<String>,
    pub env: BTreeMap<String, String>,
    pub manifests: Vec<String>,
}

impl NormalizedChange {
    /// Whether anything must be patched onto the workload itself.
    #[must_use]
    pub fn needs_patch(&self) -> bool {
        self.replicas.is_some() || self.image.is_some() || !self.env.is_empty()
    }
}

/// Fold command intents into the typed fields; typed fields win.
///
/// Returns the normalized change and one warning per unusable command.
#[must_use]
pub fn normalize(change: &ChangeSet) -> (NormalizedChange, Vec<String>) {
    let mut from_intents = NormalizedChange::default();
    let mut warnings = Vec::new();

    for command in &change.commands {
        match parse_intent(command) {
            Ok(ChangeIntent::Scale { replicas }) => from_intents.replicas = Some(replicas),
            Ok(ChangeIntent::SetImage { container, image }) => {
                from_intents.image = Some(image);
                from_intents.container = Some(container);
            },
            Ok(ChangeIntent::SetEnv { container, vars }) => {
                if from_intents.container.is_none() {
                    from_intents.container = container;
                }
                from_intents.env.extend(vars);
            },
            Err(e) => warnings.push(format!("skipped command intent: {e}")),
        }
    }

    let mut env = from_intents.env;
    env.extend(change.env.clone());
    let normalized = NormalizedChange {
        replicas: change.replicas.or(from_intents.replicas),
        image: change.image.clone().or(from_intents.image),
        container: change.container.clone().or(from_intents.container),
        env,
        manifests: change.manifests.clone(),
    };
    (normalized, warnings)
}
