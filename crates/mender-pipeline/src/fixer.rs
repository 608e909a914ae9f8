//! Concrete fixers: no-op, deterministic auto-fix command, coding agent CLI,
//! and the composite that chains them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mender_tools::{extract_diagnostics, truncate_output, ExecutionEnvironment, TruncationMode};
use mender_types::{FixerOutput, MenderError, Result};
use sha2::{Digest, Sha256};

use crate::agent::{iteration_timeout, AgentCli, AGENT_BASE_TIMEOUT, AGENT_MAX_TIMEOUT};
use crate::gate::{FixRequest, Fixer, MAX_FINDING_CHARS, MAX_FINDING_LINES};

/// Default budget for one auto-fix command.
pub const DEFAULT_FIXER_TIMEOUT: Duration = Duration::from_secs(600);

const GIT_STATUS_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Dirty-tree fingerprinting
// ---------------------------------------------------------------------------

/// Path → fingerprint of every dirty or untracked file.
///
/// `None` when the directory is not a git work tree.
async fn dirty_files(env: &dyn ExecutionEnvironment) -> Option<BTreeMap<String, String>> {
    let args: Vec<String> = ["status", "--porcelain", "-z", "--untracked-files=all"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let status = env.exec_program("git", &args, GIT_STATUS_TIMEOUT).await.ok()?;
    if !status.success() {
        return None;
    }

    let mut files = BTreeMap::new();
    for (code, path) in parse_porcelain_z(&status.stdout) {
        let mut hasher = Sha256::new();
        hasher.update(code.as_bytes());
        if let Ok(bytes) = tokio::fs::read(env.working_directory().join(&path)).await {
            hasher.update(&bytes);
        }
        files.insert(path, format!("{:x}", hasher.finalize()));
    }
    Some(files)
}

/// Entries of `git status --porcelain -z`: `XY <path>` fields, unquoted. A
/// rename or copy is followed by its origin path as a separate field.
fn parse_porcelain_z(output: &str) -> Vec<(String, String)> {
    let mut entries = Vec::new();
    let mut fields = output.split('\0');
    while let Some(field) = fields.next() {
        let (Some(code), Some(path)) = (field.get(..2), field.get(3..)) else {
            continue;
        };
        if path.is_empty() {
            continue;
        }
        if code.contains('R') || code.contains('C') {
            fields.next();
        }
        entries.push((code.to_string(), path.to_string()));
    }
    entries
}

/// Files whose dirty state differs between two fingerprints.
fn changed_between(
    before: &BTreeMap<String, String>,
    after: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut changed = BTreeSet::new();
    for (path, print) in after {
        if before.get(path) != Some(print) {
            changed.insert(path.clone());
        }
    }
    for path in before.keys() {
        if !after.contains_key(path) {
            changed.insert(path.clone());
        }
    }
    changed.into_iter().collect()
}

async fn detect_changes(
    env: &dyn ExecutionEnvironment,
    before: Option<BTreeMap<String, String>>,
) -> Vec<String> {
    match (before, dirty_files(env).await) {
        (Some(before), Some(after)) => changed_between(&before, &after),
        _ => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// NoOpFixer
// ---------------------------------------------------------------------------

/// Reports no change. Used for checks that have nothing to repair with.
pub struct NoOpFixer;

#[async_trait]
impl Fixer for NoOpFixer {
    async fn fix(&self, request: &FixRequest) -> Result<FixerOutput> {
        tracing::debug!(check = %request.check, "No fixer configured");
        Ok(FixerOutput {
            success: true,
            ..FixerOutput::default()
        })
    }
}

// ---------------------------------------------------------------------------
// CommandFixer
// ---------------------------------------------------------------------------

/// Runs a deterministic auto-fix command such as `cargo fmt --all`.
pub struct CommandFixer {
    env: Arc<dyn ExecutionEnvironment>,
    command: String,
    timeout: Duration,
}

impl CommandFixer {
    pub fn new(env: Arc<dyn ExecutionEnvironment>, command: impl Into<String>) -> Self {
        Self {
            env,
            command: command.into(),
            timeout: DEFAULT_FIXER_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Fixer for CommandFixer {
    async fn fix(&self, request: &FixRequest) -> Result<FixerOutput> {
        let timeout = request.budget(self.timeout);
        tracing::info!(check = %request.check, command = %self.command, timeout_ms = timeout.as_millis() as u64, "Running auto-fix");
        let before = dirty_files(self.env.as_ref()).await;
        let result = self
            .env
            .exec_command(&self.command, timeout, None, None)
            .await
            .map_err(|e| MenderError::FixerError {
                check: request.check.clone(),
                message: e.to_string(),
            })?;
        if result.timed_out {
            return Err(MenderError::FixerError {
                check: request.check.clone(),
                message: format!("`{}` timed out", self.command),
            });
        }

        let files_modified = detect_changes(self.env.as_ref(), before).await;
        let summary = if result.success() {
            format!("`{}` completed", self.command)
        } else {
            format!(
                "`{}` exited with code {}: {}",
                self.command,
                result.exit_code,
                truncate_output(result.stderr.trim(), 500, TruncationMode::Tail)
            )
        };
        Ok(FixerOutput {
            files_modified,
            success: result.success(),
            summary: Some(summary),
        })
    }
}

// ---------------------------------------------------------------------------
// AgentFixer
// ---------------------------------------------------------------------------

/// Delegates the repair to a coding agent CLI.
///
/// The per-call budget grows with the outer iteration, since later
/// iterations carry harder problems, and never exceeds the run deadline.
pub struct AgentFixer {
    agent: AgentCli,
    template: Option<String>,
    base_timeout: Duration,
    max_timeout: Duration,
}

impl AgentFixer {
    pub fn new(env: Arc<dyn ExecutionEnvironment>, program: impl Into<String>) -> Self {
        Self {
            agent: AgentCli::new(env, program),
            template: None,
            base_timeout: AGENT_BASE_TIMEOUT,
            max_timeout: AGENT_MAX_TIMEOUT,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.agent = self.agent.with_args(args);
        self
    }

    /// Role instructions placed at the top of every prompt.
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    /// Budget for the first iteration; later iterations scale it up.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.base_timeout = timeout;
        self
    }

    pub fn with_max_timeout(mut self, timeout: Duration) -> Self {
        self.max_timeout = timeout;
        self
    }

    /// Budget for one call made with `request`.
    pub fn timeout_for(&self, request: &FixRequest) -> Duration {
        let max = self.max_timeout.max(self.base_timeout);
        request.budget(iteration_timeout(self.base_timeout, max, request.context.iteration))
    }

    pub fn build_prompt(&self, request: &FixRequest) -> String {
        let instructions = self
            .template
            .clone()
            .unwrap_or_else(|| default_instructions(&request.check));
        let context = serde_json::to_string_pretty(&request.context)
            .unwrap_or_else(|_| "{}".to_string());
        format!(
            "{instructions}\n\n\
             ## Current Issue\n\n\
             The `{check}` check ({phase}) failed with:\n\n```\n{findings}\n```\n\n\
             ## Pipeline Context\n\n```json\n{context}\n```\n\n\
             ## Task\n\n\
             Fix the issues above by editing files in this repository. \
             Make the smallest change that makes the check pass. \
             Do not disable, skip or weaken the check itself.",
            check = request.check,
            phase = request.context.current_phase.title(),
            findings = condense_findings(&request.findings),
        )
    }
}

/// Findings as one block, reduced to diagnostic lines when long.
fn condense_findings(findings: &[String]) -> String {
    let joined = findings.join("\n");
    if joined.len() <= MAX_FINDING_CHARS {
        return joined;
    }
    let diagnostics = extract_diagnostics(&joined, MAX_FINDING_LINES);
    if diagnostics.is_empty() {
        truncate_output(&joined, MAX_FINDING_CHARS, TruncationMode::HeadTail)
    } else {
        diagnostics.join("\n")
    }
}

fn default_instructions(check: &str) -> String {
    let role = match check {
        "compilation" => "You fix Rust compilation errors.",
        "tests" | "testing" | "integration" => "You fix failing Rust tests.",
        "formatting" => "You fix Rust formatting issues.",
        "linting" | "code-review" => "You fix Clippy lints and code review findings in Rust code.",
        "docs" => "You fix rustdoc warnings and missing documentation.",
        "security-audit" => "You fix security advisories in Rust dependencies.",
        _ => "You fix quality-check failures in a Rust repository.",
    };
    format!("# Fixer: {check}\n\n{role}")
}

#[async_trait]
impl Fixer for AgentFixer {
    async fn fix(&self, request: &FixRequest) -> Result<FixerOutput> {
        let prompt = self.build_prompt(request);
        let timeout = self.timeout_for(request);
        tracing::info!(
            check = %request.check,
            program = %self.agent.program(),
            retry_index = request.retry_index,
            iteration = request.context.iteration,
            timeout_ms = timeout.as_millis() as u64,
            prompt_len = prompt.len(),
            "Invoking fixer agent"
        );

        let before = dirty_files(self.agent.env()).await;
        let run = self
            .agent
            .run(prompt, timeout)
            .await
            .map_err(|message| MenderError::FixerError {
                check: request.check.clone(),
                message,
            })?;
        let files_modified = detect_changes(self.agent.env(), before).await;
        let success = run.exited_cleanly && !run.reply.is_failure();

        tracing::info!(
            check = %request.check,
            success,
            files = files_modified.len(),
            "Fixer agent finished"
        );
        Ok(FixerOutput {
            files_modified,
            success,
            summary: Some(truncate_output(&run.reply.result, MAX_FINDING_CHARS, TruncationMode::HeadTail)),
        })
    }
}

// ---------------------------------------------------------------------------
// CompositeFixer
// ---------------------------------------------------------------------------

/// Tries the auto-fix on the first retry, then hands over to the agent.
pub struct CompositeFixer {
    auto_fix: Option<Arc<dyn Fixer>>,
    agent: Option<Arc<dyn Fixer>>,
}

impl CompositeFixer {
    pub fn new(auto_fix: Option<Arc<dyn Fixer>>, agent: Option<Arc<dyn Fixer>>) -> Self {
        Self { auto_fix, agent }
    }
}

#[async_trait]
impl Fixer for CompositeFixer {
    async fn fix(&self, request: &FixRequest) -> Result<FixerOutput> {
        let mut files = BTreeSet::new();

        if let Some(auto_fix) = self.auto_fix.as_ref().filter(|_| request.retry_index == 0) {
            match auto_fix.fix(request).await {
                Ok(output) if output.success && !output.files_modified.is_empty() => {
                    return Ok(output);
                }
                Ok(output) => files.extend(output.files_modified),
                Err(e) => {
                    tracing::warn!(check = %request.check, error = %e, "Auto-fix failed, trying agent");
                }
            }
        }

        let Some(agent) = &self.agent else {
            return Ok(FixerOutput {
                success: !files.is_empty(),
                files_modified: files.into_iter().collect(),
                summary: None,
            });
        };
        let mut output = agent.fix(request).await?;
        files.extend(output.files_modified);
        output.files_modified = files.into_iter().collect();
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PipelineContext;
    use mender_tools::LocalExecutionEnvironment;
    use mender_types::Phase;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request(check: &str, retry_index: u32, findings: Vec<String>) -> FixRequest {
        let mut ctx = PipelineContext::new(3);
        ctx.begin_iteration();
        ctx.set_phase(Phase::Phase2);
        FixRequest {
            check: check.into(),
            phase: Phase::Phase2,
            findings,
            retry_index,
            context: ctx.view(),
            time_left: None,
        }
    }

    struct Scripted {
        calls: Arc<AtomicUsize>,
        output: FixerOutput,
    }

    #[async_trait]
    impl Fixer for Scripted {
        async fn fix(&self, _request: &FixRequest) -> Result<FixerOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.output.clone())
        }
    }

    #[test]
    fn porcelain_entries_are_split_on_nul() {
        let out = " M src/lib.rs\0R  new.rs\0old.rs\0?? with space.rs\0?? caf\u{e9}.rs\0";
        assert_eq!(
            parse_porcelain_z(out),
            vec![
                (" M".to_string(), "src/lib.rs".to_string()),
                ("R ".to_string(), "new.rs".to_string()),
                ("??".to_string(), "with space.rs".to_string()),
                ("??".to_string(), "caf\u{e9}.rs".to_string()),
            ]
        );
        assert!(parse_porcelain_z("").is_empty());
    }

    #[tokio::test]
    async fn non_ascii_paths_are_detected_unquoted() {
        let dir = tempfile::tempdir().unwrap();
        let git = |args: &[&str]| {
            let ok = std::process::Command::new("git")
                .args(args)
                .current_dir(dir.path())
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false);
            assert!(ok, "git {args:?} failed");
        };
        git(&["init", "-q"]);
        let env = Arc::new(LocalExecutionEnvironment::new(dir.path()));
        let fixer = CommandFixer::new(env, "echo x > 'r\u{e9}sum\u{e9}.rs'");
        let out = fixer.fix(&request("formatting", 0, vec![])).await.unwrap();
        assert_eq!(out.files_modified, vec!["r\u{e9}sum\u{e9}.rs".to_string()]);
    }

    #[test]
    fn changed_between_sees_new_edited_and_reverted_files() {
        let print = |s: &str| s.to_string();
        let before = BTreeMap::from([(print("a.rs"), print("1")), (print("b.rs"), print("2"))]);
        let after = BTreeMap::from([
            (print("a.rs"), print("1")),
            (print("b.rs"), print("3")),
            (print("c.rs"), print("4")),
        ]);
        assert_eq!(changed_between(&before, &after), vec!["b.rs", "c.rs"]);

        let reverted = BTreeMap::from([(print("a.rs"), print("1"))]);
        assert_eq!(changed_between(&before, &reverted), vec!["b.rs"]);
    }

    #[test]
    fn prompt_has_issue_context_and_task_sections() {
        let dir = tempfile::tempdir().unwrap();
        let fixer = AgentFixer::new(Arc::new(LocalExecutionEnvironment::new(dir.path())), "claude")
            .with_template("# Compilation Fixer\n\nKeep edits minimal.");
        let prompt = fixer.build_prompt(&request(
            "compilation",
            0,
            vec!["error[E0425]: cannot find value `x`".into()],
        ));
        assert!(prompt.starts_with("# Compilation Fixer"));
        assert!(prompt.contains("## Current Issue"));
        assert!(prompt.contains("error[E0425]"));
        assert!(prompt.contains("## Pipeline Context"));
        assert!(prompt.contains("\"iteration\": 1"));
        assert!(prompt.contains("## Task"));
    }

    #[test]
    fn long_findings_are_reduced_to_diagnostics() {
        let mut findings = vec!["noise ".repeat(500)];
        findings.push("error: real problem".into());
        let condensed = condense_findings(&findings);
        assert_eq!(condensed, "error: real problem");
    }

    #[test]
    fn agent_budget_scales_with_iteration_and_respects_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let fixer = AgentFixer::new(Arc::new(LocalExecutionEnvironment::new(dir.path())), "claude");

        let mut req = request("tests", 0, vec![]);
        assert_eq!(fixer.timeout_for(&req), Duration::from_secs(120));
        req.context.iteration = 3;
        assert_eq!(fixer.timeout_for(&req), Duration::from_secs(270));
        req.time_left = Some(Duration::from_secs(30));
        assert_eq!(fixer.timeout_for(&req), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn command_fixer_is_cut_off_at_the_run_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let env = Arc::new(LocalExecutionEnvironment::new(dir.path()));
        let mut req = request("formatting", 0, vec![]);
        req.time_left = Some(Duration::from_millis(200));

        let err = CommandFixer::new(env, "sleep 1; echo late > late.txt")
            .fix(&req)
            .await
            .unwrap_err();
        assert!(matches!(err, MenderError::FixerError { .. }));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("late.txt").exists());
    }

    #[tokio::test]
    async fn agent_fixer_missing_binary_is_fixer_error() {
        let dir = tempfile::tempdir().unwrap();
        let fixer = AgentFixer::new(
            Arc::new(LocalExecutionEnvironment::new(dir.path())),
            "definitely-not-an-agent-xyz",
        );
        let err = fixer.fix(&request("tests", 0, vec![])).await.unwrap_err();
        assert!(matches!(err, MenderError::FixerError { .. }));
        assert!(err.is_infra());
    }

    #[tokio::test]
    async fn command_fixer_reports_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let env = Arc::new(LocalExecutionEnvironment::new(dir.path()));
        let ok = CommandFixer::new(env.clone(), "true")
            .fix(&request("formatting", 0, vec![]))
            .await
            .unwrap();
        assert!(ok.success);
        // Not a git tree, so no change detection.
        assert!(ok.files_modified.is_empty());

        let bad = CommandFixer::new(env, "echo nope >&2; exit 1")
            .fix(&request("formatting", 0, vec![]))
            .await
            .unwrap();
        assert!(!bad.success);
        assert!(bad.summary.unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn composite_uses_auto_fix_only_on_first_retry() {
        let auto_calls = Arc::new(AtomicUsize::new(0));
        let agent_calls = Arc::new(AtomicUsize::new(0));
        let composite = CompositeFixer::new(
            Some(Arc::new(Scripted {
                calls: auto_calls.clone(),
                output: FixerOutput::modified(["src/lib.rs"]),
            })),
            Some(Arc::new(Scripted {
                calls: agent_calls.clone(),
                output: FixerOutput::modified(["src/main.rs"]),
            })),
        );

        let first = composite.fix(&request("formatting", 0, vec![])).await.unwrap();
        assert_eq!(first.files_modified, vec!["src/lib.rs"]);
        assert_eq!(agent_calls.load(Ordering::SeqCst), 0);

        let second = composite.fix(&request("formatting", 1, vec![])).await.unwrap();
        assert_eq!(second.files_modified, vec!["src/main.rs"]);
        assert_eq!(auto_calls.load(Ordering::SeqCst), 1);
        assert_eq!(agent_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn composite_falls_through_when_auto_fix_changes_nothing() {
        let agent_calls = Arc::new(AtomicUsize::new(0));
        let composite = CompositeFixer::new(
            Some(Arc::new(Scripted {
                calls: Arc::new(AtomicUsize::new(0)),
                output: FixerOutput::unchanged(),
            })),
            Some(Arc::new(Scripted {
                calls: agent_calls.clone(),
                output: FixerOutput::modified(["src/lib.rs"]),
            })),
        );
        let out = composite.fix(&request("linting", 0, vec![])).await.unwrap();
        assert_eq!(out.files_modified, vec!["src/lib.rs"]);
        assert_eq!(agent_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn noop_fixer_changes_nothing() {
        let out = NoOpFixer.fix(&request("docs", 0, vec![])).await.unwrap();
        assert!(out.success);
        assert!(out.files_modified.is_empty());
    }
}
