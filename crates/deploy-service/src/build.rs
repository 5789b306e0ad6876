//! Build execution
//!
//! Runs the install-and-build command for a project directory as a child
//! process under a wall-clock timeout. A zero exit is not enough to count
//! as success: the expected output directory must contain the entry
//! document afterwards, because a build command can "succeed" without
//! producing servable output.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{error, info};

use crate::detect::{ENTRY_DOCUMENT, OUTPUT_DIR};

/// Default install-and-build command
pub const BUILD_COMMAND: &str = "npm install && npm run build";

/// Outcome of one build run
#[derive(Debug)]
pub enum BuildOutcome {
    /// Exit zero and the output directory holds an entry document
    Completed,
    /// The process was killed after exceeding the timeout
    TimedOut,
    /// Non-zero exit; stderr is kept for server-side diagnostics only
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },
    /// Exit zero but no entry document under the output directory
    MissingOutput,
}

/// Timeout-bound build runner
pub struct BuildExecutor {
    command: String,
    timeout: Duration,
}

impl BuildExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            command: BUILD_COMMAND.to_string(),
            timeout,
        }
    }

    /// Override the build command. Used by tests and single-purpose sweeps.
    pub fn with_command(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    /// Run the build in `project_dir` and judge the outcome.
    ///
    /// Only failures to spawn surface as `Err`; every process-level result
    /// is a [`BuildOutcome`].
    pub async fn run(&self, project_dir: &Path) -> Result<BuildOutcome> {
        info!(
            "Running build in {} (timeout {:?})",
            project_dir.display(),
            self.timeout
        );

        let child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn build command")?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.context("Failed to wait for build command")?,
            Err(_) => {
                error!(
                    "Build in {} timed out after {:?}",
                    project_dir.display(),
                    self.timeout
                );
                return Ok(BuildOutcome::TimedOut);
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            error!(
                "Build in {} failed (status {:?}): {}",
                project_dir.display(),
                output.status.code(),
                stderr.trim()
            );
            return Ok(BuildOutcome::Failed {
                exit_code: output.status.code(),
                stderr,
            });
        }

        if !project_dir.join(OUTPUT_DIR).join(ENTRY_DOCUMENT).is_file() {
            error!(
                "Build in {} exited zero but produced no {}/{}",
                project_dir.display(),
                OUTPUT_DIR,
                ENTRY_DOCUMENT
            );
            return Ok(BuildOutcome::MissingOutput);
        }

        info!("Build in {} completed", project_dir.display());
        Ok(BuildOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completed_when_output_is_produced() {
        let dir = tempfile::tempdir().unwrap();
        let executor = BuildExecutor::with_command(
            "mkdir -p dist && echo '<html></html>' > dist/index.html",
            Duration::from_secs(10),
        );

        let outcome = executor.run(dir.path()).await.unwrap();
        assert!(matches!(outcome, BuildOutcome::Completed));
        assert!(dir.path().join("dist/index.html").is_file());
    }

    #[tokio::test]
    async fn zero_exit_without_output_is_missing_output() {
        let dir = tempfile::tempdir().unwrap();
        let executor = BuildExecutor::with_command("true", Duration::from_secs(10));

        let outcome = executor.run(dir.path()).await.unwrap();
        assert!(matches!(outcome, BuildOutcome::MissingOutput));
    }

    #[tokio::test]
    async fn nonzero_exit_is_failed_with_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let executor =
            BuildExecutor::with_command("echo boom >&2; exit 3", Duration::from_secs(10));

        let outcome = executor.run(dir.path()).await.unwrap();
        match outcome {
            BuildOutcome::Failed { exit_code, stderr } => {
                assert_eq!(exit_code, Some(3));
                assert!(stderr.contains("boom"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn overlong_build_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let executor = BuildExecutor::with_command("sleep 5", Duration::from_millis(200));

        let outcome = executor.run(dir.path()).await.unwrap();
        assert!(matches!(outcome, BuildOutcome::TimedOut));
    }
}
