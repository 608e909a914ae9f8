//! Invocation of a coding agent CLI in print mode.
//!
//! Shared by the agent fixer, the review gate and the post-run analyzer:
//! `<program> -p <prompt> --output-format json [extra args...]`, parsed into
//! the agent's `{result, is_error, subtype}` reply.

use std::sync::Arc;
use std::time::Duration;

use mender_tools::{truncate_output, ExecutionEnvironment, TruncationMode};
use serde::Deserialize;

/// Base budget for one agent call in the first outer iteration.
pub const AGENT_BASE_TIMEOUT: Duration = Duration::from_secs(120);

/// Ceiling for one agent call regardless of iteration.
pub const AGENT_MAX_TIMEOUT: Duration = Duration::from_secs(600);

/// Growth of the agent budget per outer iteration.
pub const AGENT_TIMEOUT_GROWTH: f64 = 1.5;

/// Reply shape from `<agent> -p --output-format json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentReply {
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub subtype: String,
}

impl AgentReply {
    pub fn is_failure(&self) -> bool {
        self.is_error || self.subtype == "error"
    }
}

/// Outcome of one agent process.
#[derive(Debug)]
pub struct AgentRun {
    pub reply: AgentReply,
    /// The process exited with status 0.
    pub exited_cleanly: bool,
}

pub struct AgentCli {
    env: Arc<dyn ExecutionEnvironment>,
    program: String,
    extra_args: Vec<String>,
}

impl AgentCli {
    pub fn new(env: Arc<dyn ExecutionEnvironment>, program: impl Into<String>) -> Self {
        Self {
            env,
            program: program.into(),
            extra_args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn env(&self) -> &dyn ExecutionEnvironment {
        self.env.as_ref()
    }

    fn command_args(&self, prompt: String) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            prompt,
            "--output-format".to_string(),
            "json".to_string(),
        ];
        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// Run the agent once. `Err` carries a message for the caller's error
    /// variant: spawn failure, timeout, or unparseable output.
    pub async fn run(&self, prompt: String, timeout: Duration) -> Result<AgentRun, String> {
        let result = self
            .env
            .exec_program(&self.program, &self.command_args(prompt), timeout)
            .await
            .map_err(|e| format!("failed to run {}: {e}", self.program))?;
        if result.timed_out {
            return Err(format!(
                "{} timed out after {}s",
                self.program,
                timeout.as_secs()
            ));
        }
        let reply = parse_reply(&result.stdout, &result.stderr)?;
        Ok(AgentRun {
            reply,
            exited_cleanly: result.success(),
        })
    }
}

pub(crate) fn parse_reply(stdout: &str, stderr: &str) -> Result<AgentReply, String> {
    if stdout.trim().is_empty() {
        return Err(format!(
            "agent produced no output. stderr: {}",
            truncate_output(stderr.trim(), 500, TruncationMode::Tail)
        ));
    }
    serde_json::from_str(stdout.trim()).map_err(|e| {
        format!(
            "failed to parse agent output: {e}; raw: {}",
            truncate_output(stdout.trim(), 500, TruncationMode::HeadTail)
        )
    })
}

/// Agent budget for an outer iteration: `base * growth^(iteration - 1)`,
/// capped at `max`.
pub fn iteration_timeout(base: Duration, max: Duration, iteration: u32) -> Duration {
    let exponent = i32::try_from(iteration.saturating_sub(1)).unwrap_or(i32::MAX);
    let secs = base.as_secs_f64() * AGENT_TIMEOUT_GROWTH.powi(exponent);
    if !secs.is_finite() || secs >= max.as_secs_f64() {
        return max;
    }
    Duration::from_secs_f64(secs.max(0.0))
}

/// The outermost `{...}` block of free text, for agents that wrap JSON in prose.
pub(crate) fn json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start < end).then(|| &text[start..=end])
}
