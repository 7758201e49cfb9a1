//! External process execution.

use crate::error::{CiError, Result};
use crate::step::{StepConfig, StepKind};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Result of a step execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Step name.
    pub step_name: String,

    pub kind: StepKind,

    /// Exit code (0 = success, -1 = killed by signal or never started).
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,

    /// Whether execution succeeded.
    pub success: bool,
}

impl StepResult {
    /// Whether this step passed (exit code 0).
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == 0
    }

    /// Result for a step whose process could not be started.
    pub fn not_started(config: &StepConfig, error: &CiError) -> Self {
        Self {
            step_name: config.name.clone(),
            kind: config.kind,
            exit_code: -1,
            stdout: String::new(),
            stderr: error.to_string(),
            duration_ms: 0,
            success: false,
        }
    }
}

/// Runs external commands, logging each invocation before it starts.
pub struct StepRunner;

impl StepRunner {
    /// Execute a single step and return the result.
    ///
    /// A non-zero exit is not an error here; callers decide what it means
    /// from the step's kind. Only a failure to spawn or wait is returned as
    /// `Err`.
    pub async fn execute_step(config: &StepConfig) -> Result<StepResult> {
        let start = Instant::now();

        let Some((exe, args)) = config.command.split_first() else {
            return Err(CiError::Spawn {
                program: String::new(),
                reason: format!("step {} has empty command", config.name),
            });
        };

        info!(
            step = %config.name,
            cwd = ?config.cwd,
            "$ {}",
            config.display_command()
        );

        let mut command = Command::new(exe);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }

        let child = command.spawn().map_err(|e| CiError::Spawn {
            program: exe.clone(),
            reason: e.to_string(),
        })?;
        let output = child.wait_with_output().await?;

        let duration_ms = start.elapsed().as_millis() as u64;
        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let success = output.status.success();

        for line in stdout.lines() {
            info!(step = %config.name, "| {line}");
        }
        for line in stderr.lines() {
            debug!(step = %config.name, "! {line}");
        }

        if success {
            info!(step = %config.name, exit_code, duration_ms, "Step finished");
        } else {
            warn!(
                step = %config.name,
                exit_code,
                duration_ms,
                command = %config.display_command(),
                "Step failed"
            );
        }

        Ok(StepResult {
            step_name: config.name.clone(),
            kind: config.kind,
            exit_code,
            stdout,
            stderr,
            duration_ms,
            success,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_result_passed() {
        let result = StepResult {
            step_name: "export_tests".to_string(),
            kind: StepKind::Critical,
            exit_code: 0,
            stdout: "".to_string(),
            stderr: "".to_string(),
            duration_ms: 100,
            success: true,
        };
        assert!(result.passed());
    }

    #[test]
    fn test_step_result_failed() {
        let result = StepResult {
            step_name: "export_tests".to_string(),
            kind: StepKind::Critical,
            exit_code: 1,
            stdout: "".to_string(),
            stderr: "error".to_string(),
            duration_ms: 100,
            success: false,
        };
        assert!(!result.passed());
    }

    #[tokio::test]
    async fn test_execute_simple_command() {
        let config = StepConfig::custom(
            "echo_test".to_string(),
            vec!["echo".to_string(), "hello".to_string()],
            StepKind::Critical,
        );

        let result = StepRunner::execute_step(&config).await.expect("execute failed");
        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_execute_failing_command() {
        let config = StepConfig::custom(
            "false_test".to_string(),
            vec!["false".to_string()],
            StepKind::Advisory,
        );

        let result = StepRunner::execute_step(&config).await.expect("execute failed");
        assert!(!result.success);
        assert_ne!(result.exit_code, 0);
        assert_eq!(result.kind, StepKind::Advisory);
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let config = StepConfig::custom(
            "missing".to_string(),
            vec!["/nonexistent/gr3d-godot-binary".to_string()],
            StepKind::Critical,
        );
        let err = StepRunner::execute_step(&config).await.unwrap_err();
        assert!(matches!(err, CiError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let config = StepConfig::custom("empty".to_string(), vec![], StepKind::Critical);
        assert!(StepRunner::execute_step(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = StepConfig::custom(
            "pwd".to_string(),
            vec!["pwd".to_string()],
            StepKind::Surfaced,
        )
        .in_dir(dir.path());

        let result = StepRunner::execute_step(&config).await.expect("execute failed");
        let reported = std::path::PathBuf::from(result.stdout.trim());
        assert_eq!(
            reported.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }
}
