//! Post-run analysis: an agent reads the final context and writes a
//! narrative for the run's outcome.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use mender_tools::{truncate_output, TruncationMode};
use mender_types::{FinalStatus, MenderError, Result};
use serde::Serialize;

use crate::agent::{iteration_timeout, AgentCli, AGENT_BASE_TIMEOUT, AGENT_MAX_TIMEOUT};
use crate::context::ContextView;
use crate::patterns::PatternSummary;

/// Longest analysis kept in the report.
const MAX_ANALYSIS_CHARS: usize = 8000;

/// What an analyzer sees once the run has finished and the snapshot has been
/// committed or restored.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRequest {
    pub status: FinalStatus,
    pub context: ContextView,
    pub patterns: PatternSummary,
    pub files_modified: Vec<String>,
    pub critical_errors: Vec<String>,
    #[serde(skip)]
    pub time_left: Option<Duration>,
}

#[async_trait]
pub trait RunAnalyzer: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<String>;
}

/// Template file name under `<prompts_dir>/analysis/` for each outcome.
pub fn analysis_template_name(status: FinalStatus) -> &'static str {
    match status {
        FinalStatus::Success => "success.md",
        FinalStatus::SuccessWithRetries => "success-with-issues.md",
        FinalStatus::Failure => "failure.md",
    }
}

pub struct AgentAnalyzer {
    agent: AgentCli,
    templates: Option<std::path::PathBuf>,
    base_timeout: Duration,
    max_timeout: Duration,
}

impl AgentAnalyzer {
    pub fn new(agent: AgentCli) -> Self {
        Self {
            agent,
            templates: None,
            base_timeout: AGENT_BASE_TIMEOUT,
            max_timeout: AGENT_MAX_TIMEOUT,
        }
    }

    /// Directory holding `success.md`, `success-with-issues.md` and `failure.md`.
    pub fn with_templates(mut self, dir: impl AsRef<Path>) -> Self {
        self.templates = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_timeouts(mut self, base: Duration, max: Duration) -> Self {
        self.base_timeout = base;
        self.max_timeout = max.max(base);
        self
    }

    fn instructions(&self, status: FinalStatus) -> String {
        self.templates
            .as_ref()
            .and_then(|dir| std::fs::read_to_string(dir.join(analysis_template_name(status))).ok())
            .unwrap_or_else(|| default_instructions(status).to_string())
    }

    pub fn build_prompt(&self, request: &AnalysisRequest) -> String {
        let context = serde_json::to_string_pretty(request).unwrap_or_else(|_| "{}".to_string());
        format!(
            "{}\n\n## Current Pipeline Context\n\n```json\n{context}\n```\n\n## Task\n\n\
             Analyze the run above and respond with a short summary for the people who \
             will review these changes. Do not edit any files.",
            self.instructions(request.status)
        )
    }
}

fn default_instructions(status: FinalStatus) -> &'static str {
    match status {
        FinalStatus::Success => {
            "# Run Analysis: success\n\nEvery check passed on the first attempt. Summarize \
             what was validated and note anything worth watching."
        }
        FinalStatus::SuccessWithRetries => {
            "# Run Analysis: success with repairs\n\nThe run succeeded only after fixers \
             edited files. Explain what was repaired, which checks needed help, and any \
             recurring or flaky failures that deserve a permanent fix."
        }
        FinalStatus::Failure => {
            "# Run Analysis: failure\n\nThe run failed and the working tree was rolled back. \
             Explain the most likely root cause, which checks never converged, and what a \
             human should look at first."
        }
    }
}

#[async_trait]
impl RunAnalyzer for AgentAnalyzer {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<String> {
        let timeout = iteration_timeout(self.base_timeout, self.max_timeout, request.context.iteration);
        let timeout = request.time_left.map_or(timeout, |left| left.min(timeout));
        tracing::info!(status = ?request.status, timeout_ms = timeout.as_millis() as u64, "Running analysis agent");

        let run = self
            .agent
            .run(self.build_prompt(request), timeout)
            .await
            .map_err(MenderError::AnalysisError)?;
        if run.reply.is_failure() || !run.exited_cleanly {
            return Err(MenderError::AnalysisError(format!(
                "analysis agent reported an error: {}",
                truncate_output(&run.reply.result, 500, TruncationMode::Tail)
            )));
        }
        Ok(truncate_output(
            run.reply.result.trim(),
            MAX_ANALYSIS_CHARS,
            TruncationMode::HeadTail,
        ))
    }
}
