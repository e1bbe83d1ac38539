//! Out-of-process tool execution (vcluster, scanners).

use std::{process::Stdio, time::Duration};

use {
    mender_common::text::truncate_output,
    serde::{Deserialize, Serialize},
    tokio::io::AsyncWriteExt,
    tracing::debug,
};

use crate::error::{Error, Result};

/// Default cap on captured stdout/stderr.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 4 * 1024 * 1024;

/// Captured result of a finished tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run `program` with `args`, optionally feeding `stdin`, bounded by `timeout`.
///
/// A missing binary maps to [`Error::ToolUnavailable`]; a timeout kills the child.
pub async fn run_tool(
    program: &str,
    args: &[String],
    stdin: Option<&str>,
    timeout: Duration,
    max_output_bytes: usize,
) -> Result<ToolOutput> {
    debug!(program, ?args, "running tool");
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::ToolUnavailable {
            tool: program.to_string(),
        },
        _ => Error::external(format!("failed to spawn {program}"), e),
    })?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes()).await?;
        pipe.shutdown().await?;
    }

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => output?,
        Err(_) => {
            return Err(Error::message(format!(
                "{program} timed out after {}s",
                timeout.as_secs()
            )));
        },
    };

    Ok(ToolOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: truncate_output(
            String::from_utf8_lossy(&output.stdout).into_owned(),
            max_output_bytes,
        ),
        stderr: truncate_output(
            String::from_utf8_lossy(&output.stderr).into_owned(),
            max_output_bytes,
        ),
    })
}
