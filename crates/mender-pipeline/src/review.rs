//! Agent-driven review gate for the deep-analysis phase.
//!
//! The agent reads the pending changes and answers with a JSON verdict
//! `{"passed": bool, "findings": [..]}`. It must not edit files; repairs are
//! the fixer's job.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use mender_tools::{truncate_output, TruncationMode};
use mender_types::{CheckResult, MenderError, Result};
use serde::Deserialize;

use crate::agent::{json_object, AgentCli};
use crate::gate::{Gate, MAX_FINDING_CHARS, MAX_FINDING_LINES};

#[derive(Debug, Deserialize)]
struct Verdict {
    passed: bool,
    #[serde(default)]
    findings: Vec<String>,
}

pub struct ReviewGate {
    agent: AgentCli,
    template: Option<String>,
}

impl ReviewGate {
    pub fn new(agent: AgentCli) -> Self {
        Self {
            agent,
            template: None,
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn build_prompt(&self, check: &str) -> String {
        let instructions = self
            .template
            .clone()
            .unwrap_or_else(|| default_review_instructions(check));
        format!(
            "{instructions}\n\n\
             ## Task\n\n\
             Review the uncommitted changes in this repository (`git diff HEAD` and \
             untracked files) for the `{check}` check. Do not edit any files.\n\n\
             Reply with a single JSON object and nothing else:\n\n\
             {{\"passed\": true | false, \"findings\": [\"one concrete problem per entry, with file:line\"]}}"
        )
    }
}

fn default_review_instructions(check: &str) -> String {
    let focus = match check {
        "code-review" => {
            "Check the changes against Rust conventions: error propagation instead of \
             panics, ownership and borrowing that reads naturally, no dead code, naming \
             consistent with the surrounding module."
        }
        "testing" => {
            "Check that the changed behaviour is covered by tests, that edge cases and \
             error paths are exercised, and that no test was weakened or skipped."
        }
        "security-audit" => {
            "Look for injection through shell commands, secrets in code or logs, unchecked \
             input reaching the filesystem, and `unsafe` blocks without a stated invariant."
        }
        "integration" => {
            "Check that the changes fit the rest of the system: public APIs keep their \
             contracts, configuration and callers are updated together, and nothing \
             depends on state the change removed."
        }
        _ => "Review the changes for correctness and maintainability.",
    };
    format!("# Review: {check}\n\n{focus}")
}

fn parse_verdict(text: &str) -> std::result::Result<Verdict, String> {
    let body = json_object(text).ok_or_else(|| "review reply contains no JSON verdict".to_string())?;
    serde_json::from_str(body).map_err(|e| format!("unreadable review verdict: {e}"))
}

#[async_trait]
impl Gate for ReviewGate {
    async fn invoke(&self, check: &str, timeout: Duration) -> Result<CheckResult> {
        let started = Instant::now();
        let gate_error = |message: String| MenderError::GateError {
            check: check.to_string(),
            message,
        };

        tracing::info!(check = %check, program = %self.agent.program(), "Requesting agent review");
        let run = self
            .agent
            .run(self.build_prompt(check), timeout)
            .await
            .map_err(gate_error)?;
        if run.reply.is_failure() || !run.exited_cleanly {
            return Err(gate_error(format!(
                "review agent reported an error: {}",
                truncate_output(&run.reply.result, 500, TruncationMode::Tail)
            )));
        }

        let verdict = parse_verdict(&run.reply.result).map_err(gate_error)?;
        let duration = started.elapsed();
        if verdict.passed {
            return Ok(CheckResult::passed(check, duration));
        }

        let mut details: Vec<String> = verdict
            .findings
            .into_iter()
            .filter(|f| !f.trim().is_empty())
            .take(MAX_FINDING_LINES)
            .map(|f| truncate_output(&f, MAX_FINDING_CHARS, TruncationMode::Tail))
            .collect();
        if details.is_empty() {
            details.push(format!("{check} review failed without findings"));
        }
        tracing::debug!(check = %check, findings = details.len(), "Review failed");
        Ok(CheckResult::failed(check, details, duration))
    }
}
