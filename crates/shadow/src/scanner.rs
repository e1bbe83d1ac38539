use std::time::Duration;

use async_trait::async_trait;

use crate::{
    error::Result,
    process::{DEFAULT_MAX_OUTPUT_BYTES, ToolOutput, run_tool},
};

/// Runs an external security scanner.
#[async_trait]
pub trait ScannerRunner: Send + Sync {
    /// Run `program` to completion. A missing binary is
    /// [`Error::ToolUnavailable`](crate::Error::ToolUnavailable).
    async fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&str>,
        timeout: Duration,
    ) -> Result<ToolOutput>;
}

/// [`ScannerRunner`] that spawns local processes.
pub struct ProcessScannerRunner {
    max_output_bytes: usize,
}

impl ProcessScannerRunner {
    #[must_use]
    pub fn new(max_output_bytes: usize) -> Self {
        Self { max_output_bytes }
    }
}

impl Default for ProcessScannerRunner {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OUTPUT_BYTES)
    }
}

#[async_trait]
impl ScannerRunner for ProcessScannerRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&str>,
        timeout: Duration,
    ) -> Result<ToolOutput> {
        run_tool(program, args, stdin, timeout, self.max_output_bytes).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn output_is_capped() {
        let runner = ProcessScannerRunner::new(8);
        let out = runner
            .run(
                "sh",
                &["-c".into(), "printf 'abcdefghijklmnop'".into()],
                None,
                Duration::from_secs(10),
            )
            .await
            .unwrap();
        assert!(out.stdout.starts_with("abcdefgh"));
        assert!(out.stdout.ends_with(mender_common::text::TRUNCATION_MARKER));
    }
}
