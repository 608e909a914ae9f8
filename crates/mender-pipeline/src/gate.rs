//! Quality-gate and fixer capabilities, plus the shell-command gate.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mender_tools::{findings_from_output, ExecutionEnvironment};
use mender_types::{CheckResult, FixerOutput, MenderError, Phase, Result};
use serde::Serialize;

use crate::context::ContextView;

/// Maximum diagnostic lines kept from a failing gate.
pub const MAX_FINDING_LINES: usize = 30;

/// Maximum characters per finding.
pub const MAX_FINDING_CHARS: usize = 2000;

/// Exit code a shell reports when the command does not exist.
const COMMAND_NOT_FOUND: i32 = 127;

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// A quality check.
///
/// `Ok` means the gate ran and reached a verdict (passed or failed). `Err`
/// means the gate itself could not run and is treated as an infra failure.
#[async_trait]
pub trait Gate: Send + Sync {
    async fn invoke(&self, check: &str, timeout: Duration) -> Result<CheckResult>;
}

/// Runs a shell command; exit code 0 passes.
pub struct CommandGate {
    env: Arc<dyn ExecutionEnvironment>,
    command: String,
}

impl CommandGate {
    pub fn new(env: Arc<dyn ExecutionEnvironment>, command: impl Into<String>) -> Self {
        Self {
            env,
            command: command.into(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl Gate for CommandGate {
    async fn invoke(&self, check: &str, timeout: Duration) -> Result<CheckResult> {
        let started = Instant::now();
        let result = self
            .env
            .exec_command(&self.command, timeout, None, None)
            .await
            .map_err(|e| MenderError::GateError {
                check: check.to_string(),
                message: e.to_string(),
            })?;

        if result.timed_out {
            return Err(MenderError::CommandTimeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        if result.exit_code == COMMAND_NOT_FOUND {
            return Err(MenderError::GateError {
                check: check.to_string(),
                message: format!("command not found: {}", self.command),
            });
        }

        let duration = started.elapsed();
        if result.success() {
            tracing::debug!(check = %check, duration_ms = duration.as_millis() as u64, "Gate passed");
            return Ok(CheckResult::passed(check, duration));
        }

        let mut details =
            findings_from_output(&result.combined_output(), MAX_FINDING_LINES, MAX_FINDING_CHARS);
        if details.is_empty() {
            details.push(format!("`{}` exited with code {}", self.command, result.exit_code));
        }
        tracing::debug!(
            check = %check,
            exit_code = result.exit_code,
            findings = details.len(),
            "Gate failed"
        );
        Ok(CheckResult::failed(check, details, duration))
    }
}

// ---------------------------------------------------------------------------
// Fixer
// ---------------------------------------------------------------------------

/// Input handed to a fixer after a gate failure.
#[derive(Debug, Clone, Serialize)]
pub struct FixRequest {
    pub check: String,
    pub phase: Phase,
    pub findings: Vec<String>,
    /// 0 for the first fix attempt within this check invocation.
    pub retry_index: u32,
    pub context: ContextView,
    /// Time left before the run deadline, `None` when the run is unbounded.
    #[serde(skip)]
    pub time_left: Option<Duration>,
}

impl FixRequest {
    /// `limit`, shortened to what is left of the run.
    pub fn budget(&self, limit: Duration) -> Duration {
        match self.time_left {
            Some(left) => left.min(limit),
            None => limit,
        }
    }
}

/// Attempts to repair the findings of a failed gate by editing files.
///
/// An `Err` means the fixer could not run at all; the caller records it as a
/// warning and moves on to the next retry.
#[async_trait]
pub trait Fixer: Send + Sync {
    async fn fix(&self, request: &FixRequest) -> Result<FixerOutput>;
}
