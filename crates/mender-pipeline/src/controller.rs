//! Two-phase validation controller.
//!
//! Takes the run lock and a snapshot, runs Phase 1 then Phase 2, loops back
//! to Phase 1 when Phase 2 needed repairs, and finally commits or restores the
//! snapshot exactly once.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mender_types::{duration_serde, FinalStatus, MenderError, Phase, Result};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::analysis::{AnalysisRequest, RunAnalyzer};
use crate::backoff::BackoffPolicy;
use crate::context::{ChangeRecord, CheckOutcome, CheckRecord, Phase2Attempt, PipelineContext};
use crate::deadline::Deadline;
use crate::events::{EventEmitter, PipelineEvent};
use crate::lock::RunLock;
use crate::patterns::{analyze, PatternSummary, DEFAULT_BOTTLENECK_THRESHOLD};
use crate::registry::CheckRegistry;
use crate::runner::CheckRunner;
use crate::snapshot::SnapshotManager;

pub const DEFAULT_MAX_PIPELINE_ITERATIONS: u32 = 3;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub max_pipeline_iterations: u32,
    pub backoff: BackoffPolicy,
    /// Budget for the whole run, shared by every gate, fixer and wait.
    pub run_deadline: Option<Duration>,
    pub bottleneck_threshold: f64,
    pub lock_dir: PathBuf,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_pipeline_iterations: DEFAULT_MAX_PIPELINE_ITERATIONS,
            backoff: BackoffPolicy::default(),
            run_deadline: None,
            bottleneck_threshold: DEFAULT_BOTTLENECK_THRESHOLD,
            lock_dir: std::env::temp_dir(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControllerState {
    Init,
    Phase1Running,
    Phase2Running,
    Succeeded,
    Failed,
}

/// Everything downstream reporting needs about a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub final_status: FinalStatus,
    pub iteration: u32,
    pub phase1_results: Vec<CheckRecord>,
    pub phase2_attempts: Vec<Phase2Attempt>,
    pub files_modified: BTreeSet<String>,
    pub changes_applied: Vec<ChangeRecord>,
    pub critical_errors: Vec<String>,
    pub warnings: Vec<String>,
    pub patterns: PatternSummary,
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    /// Human-readable digest of the run.
    pub analysis: Vec<String>,
    /// Narrative from the post-run analyzer, when one is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_analysis: Option<String>,
}

impl RunReport {
    fn from_context(ctx: &PipelineContext, status: FinalStatus, patterns: PatternSummary) -> Self {
        let mut report = Self {
            run_id: ctx.run_id().to_string(),
            started_at: ctx.started_at(),
            final_status: status,
            iteration: ctx.iteration(),
            phase1_results: ctx.phase1_results().to_vec(),
            phase2_attempts: ctx.phase2_attempts(),
            files_modified: ctx.files_modified().clone(),
            changes_applied: ctx.changes_applied().to_vec(),
            critical_errors: ctx.critical_errors().to_vec(),
            warnings: ctx.warnings().to_vec(),
            patterns,
            total_duration: ctx.total_duration(),
            analysis: Vec::new(),
            agent_analysis: None,
        };
        report.analysis = report.summary_lines();
        report
    }

    pub fn is_success(&self) -> bool {
        self.final_status.is_success()
    }

    pub fn fixer_invocations(&self) -> usize {
        let p1: usize = self.phase1_results.iter().map(|c| c.fixer_invocations.len()).sum();
        let p2: usize = self
            .phase2_attempts
            .iter()
            .flat_map(|a| a.checks.iter())
            .map(|c| c.fixer_invocations.len())
            .sum();
        p1 + p2
    }

    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "{} after {} iteration(s) in {:.1}s",
            match self.final_status {
                FinalStatus::Success => "All checks passed",
                FinalStatus::SuccessWithRetries => "All checks passed with retries",
                FinalStatus::Failure => "Validation failed, changes rolled back",
            },
            self.iteration,
            self.total_duration.as_secs_f64()
        )];
        if !self.files_modified.is_empty() {
            lines.push(format!("Fixers modified {} file(s)", self.files_modified.len()));
        }
        for error in &self.critical_errors {
            lines.push(format!("Critical: {error}"));
        }
        if !self.patterns.consistent_failures.is_empty() {
            lines.push(format!(
                "Consistently failing: {}",
                self.patterns.consistent_failures.join(", ")
            ));
        }
        if !self.patterns.flakey_checks.is_empty() {
            lines.push(format!("Flaky: {}", self.patterns.flakey_checks.join(", ")));
        }
        for b in &self.patterns.performance_bottlenecks {
            lines.push(format!(
                "Slow {:?} for '{}' in iteration {}: {:.1}s ({:.0}% of run)",
                b.kind,
                b.check,
                b.iteration,
                b.duration.as_secs_f64(),
                b.share * 100.0
            ));
        }
        lines
    }
}

pub struct PipelineController {
    repo: PathBuf,
    registry: CheckRegistry,
    snapshots: Arc<dyn SnapshotManager>,
    config: ControllerConfig,
    events: EventEmitter,
    analyzer: Option<Arc<dyn RunAnalyzer>>,
}

impl PipelineController {
    pub fn new(
        repo: impl Into<PathBuf>,
        registry: CheckRegistry,
        snapshots: Arc<dyn SnapshotManager>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            repo: repo.into(),
            registry,
            snapshots,
            config,
            events: EventEmitter::default(),
            analyzer: None,
        }
    }

    /// Run `analyzer` once the snapshot has been committed or restored.
    pub fn with_analyzer(mut self, analyzer: Arc<dyn RunAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn registry(&self) -> &CheckRegistry {
        &self.registry
    }

    /// Run the full validation.
    ///
    /// `Ok` carries the report for both successful and failed runs; `Err` is
    /// reserved for fatal problems (lock, snapshot, restore, configuration).
    pub async fn run(&self) -> Result<RunReport> {
        self.registry.validate()?;
        let _lock = RunLock::acquire(&self.config.lock_dir, &self.repo)?;

        let started = Instant::now();
        let deadline = Deadline::from_budget(self.config.run_deadline);
        let mut ctx = PipelineContext::new(self.config.max_pipeline_iterations);
        let run_id = ctx.run_id().to_string();
        self.events.emit(PipelineEvent::RunStarted {
            run_id: run_id.clone(),
            check_count: self.registry.len(),
        });
        tracing::info!(run_id = %run_id, repo = %self.repo.display(), checks = self.registry.len(), "Validation run started");

        let mut snapshot = match self.snapshots.checkpoint().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(error = %e, "Could not snapshot working tree");
                self.events.emit(PipelineEvent::RunFailed {
                    run_id,
                    error: e.to_string(),
                });
                return Err(e);
            }
        };
        self.events.emit(PipelineEvent::SnapshotCreated {
            snapshot_id: snapshot.id.clone(),
        });

        let runner = CheckRunner::new(self.config.backoff.clone(), self.events.clone());
        let status = self.drive(&runner, &mut ctx, deadline).await;
        ctx.finalize(status, started.elapsed());

        if status.is_success() {
            match self.snapshots.commit(&mut snapshot).await {
                Ok(()) => self.events.emit(PipelineEvent::SnapshotCommitted {
                    snapshot_id: snapshot.id.clone(),
                }),
                Err(e) => {
                    tracing::warn!(error = %e, "Fixes kept, but snapshot cleanup failed");
                    ctx.add_warning(format!("Snapshot cleanup failed: {e}"));
                }
            }
        } else {
            if let Err(e) = self.snapshots.restore(&mut snapshot).await {
                tracing::error!(error = %e, "Restore failed");
                self.events.emit(PipelineEvent::RunFailed {
                    run_id,
                    error: e.to_string(),
                });
                return Err(e);
            }
            self.events.emit(PipelineEvent::SnapshotRestored {
                snapshot_id: snapshot.id.clone(),
            });
        }

        let patterns = analyze(&ctx, self.config.bottleneck_threshold);
        let mut report = RunReport::from_context(&ctx, status, patterns);
        if let Some(analyzer) = &self.analyzer {
            self.run_analysis(analyzer.as_ref(), &ctx, &mut report, deadline).await;
        }
        self.events.emit(PipelineEvent::RunCompleted {
            run_id,
            status,
            iterations: report.iteration,
            duration_ms: report.total_duration.as_millis() as u64,
        });
        tracing::info!(
            status = ?status,
            iterations = report.iteration,
            files_modified = report.files_modified.len(),
            duration_ms = report.total_duration.as_millis() as u64,
            "Validation run finished"
        );
        Ok(report)
    }

    /// Analyzer failures only add a warning; the verdict is already final.
    async fn run_analysis(
        &self,
        analyzer: &dyn RunAnalyzer,
        ctx: &PipelineContext,
        report: &mut RunReport,
        deadline: Deadline,
    ) {
        if deadline.is_expired() {
            report.warnings.push("Run analysis skipped: deadline expired".into());
            return;
        }
        let request = AnalysisRequest {
            status: report.final_status,
            context: ctx.view(),
            patterns: report.patterns.clone(),
            files_modified: report.files_modified.iter().cloned().collect(),
            critical_errors: report.critical_errors.clone(),
            time_left: deadline.remaining(),
        };
        let call = analyzer.analyze(&request);
        let result = match deadline.remaining() {
            Some(left) => tokio::time::timeout(left, call).await.unwrap_or_else(|_| {
                Err(MenderError::AnalysisError("run deadline expired".into()))
            }),
            None => call.await,
        };
        match result {
            Ok(text) => report.agent_analysis = Some(text),
            Err(e) => {
                tracing::warn!(error = %e, "Run analysis failed");
                report.warnings.push(format!("Run analysis failed: {e}"));
            }
        }
    }

    /// The phase state machine. Returns the terminal status.
    async fn drive(
        &self,
        runner: &CheckRunner,
        ctx: &mut PipelineContext,
        deadline: Deadline,
    ) -> FinalStatus {
        let mut state = ControllerState::Init;
        loop {
            state = match state {
                ControllerState::Init if self.begin_iteration(ctx) => ControllerState::Phase1Running,
                ControllerState::Init => ControllerState::Failed,
                ControllerState::Phase1Running => self.run_phase1(runner, ctx, deadline).await,
                ControllerState::Phase2Running => self.run_phase2(runner, ctx, deadline).await,
                ControllerState::Succeeded if ctx.iteration() <= 1 => return FinalStatus::Success,
                ControllerState::Succeeded => return FinalStatus::SuccessWithRetries,
                ControllerState::Failed => return FinalStatus::Failure,
            };
        }
    }

    fn begin_iteration(&self, ctx: &mut PipelineContext) -> bool {
        match ctx.begin_iteration() {
            Some(iteration) => {
                self.events.emit(PipelineEvent::IterationStarted { iteration });
                tracing::info!(iteration, max = ctx.max_iterations(), "Starting iteration");
                true
            }
            None => false,
        }
    }

    async fn run_phase1(
        &self,
        runner: &CheckRunner,
        ctx: &mut PipelineContext,
        deadline: Deadline,
    ) -> ControllerState {
        self.enter_phase(ctx, Phase::Phase1);
        for check in self.registry.phase(Phase::Phase1) {
            let record = runner.run(check, ctx, deadline).await;
            let outcome = record.outcome;
            let detail = record
                .last_result()
                .and_then(|r| r.details.first().cloned())
                .unwrap_or_default();
            ctx.record_check(record);
            if !outcome.is_passed() {
                ctx.add_critical_error(format!(
                    "{} check '{}' {} in iteration {}{}",
                    Phase::Phase1.title(),
                    check.name,
                    outcome,
                    ctx.iteration(),
                    if detail.is_empty() { String::new() } else { format!(": {detail}") }
                ));
                tracing::error!(check = %check.name, outcome = %outcome, "Phase 1 check did not pass, failing run");
                return ControllerState::Failed;
            }
        }
        ControllerState::Phase2Running
    }

    async fn run_phase2(
        &self,
        runner: &CheckRunner,
        ctx: &mut PipelineContext,
        deadline: Deadline,
    ) -> ControllerState {
        self.enter_phase(ctx, Phase::Phase2);
        let mut trigger: Option<String> = None;
        for check in self.registry.phase(Phase::Phase2) {
            let record = runner.run(check, ctx, deadline).await;
            let outcome = record.outcome;
            ctx.record_check(record);
            match outcome {
                CheckOutcome::Passed => {}
                // Repaired locally: finish the phase, but re-validate from Phase 1.
                CheckOutcome::PassedAfterRetries => {
                    trigger.get_or_insert_with(|| check.name.clone());
                }
                CheckOutcome::Escalated | CheckOutcome::Errored => {
                    trigger = Some(check.name.clone());
                    break;
                }
            }
        }

        let Some(trigger) = trigger else {
            return ControllerState::Succeeded;
        };

        ctx.mark_loop_triggered();
        let from_iteration = ctx.iteration();
        if !self.begin_iteration(ctx) {
            ctx.add_critical_error(format!(
                "Pipeline did not converge after {} iterations; last trigger was '{}'",
                from_iteration, trigger
            ));
            tracing::error!(iterations = from_iteration, check = %trigger, "Iteration limit reached");
            return ControllerState::Failed;
        }
        self.events.emit(PipelineEvent::PipelineLooped {
            from_iteration,
            trigger: trigger.clone(),
        });
        tracing::warn!(check = %trigger, from_iteration, "Phase 2 needed repairs, restarting at Phase 1");
        ControllerState::Phase1Running
    }

    fn enter_phase(&self, ctx: &mut PipelineContext, phase: Phase) {
        ctx.set_phase(phase);
        self.events.emit(PipelineEvent::PhaseStarted {
            iteration: ctx.iteration(),
            phase,
        });
        tracing::info!(iteration = ctx.iteration(), phase = %phase, title = phase.title(), "Entering phase");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.max_pipeline_iterations, 3);
        assert_eq!(config.backoff, BackoffPolicy::default());
        assert!(config.run_deadline.is_none());
        assert!((config.bottleneck_threshold - 0.30).abs() < f64::EPSILON);
    }

    #[test]
    fn summary_lines_mention_patterns() {
        let report = RunReport {
            run_id: "r".into(),
            started_at: Utc::now(),
            final_status: FinalStatus::Failure,
            iteration: 3,
            phase1_results: vec![],
            phase2_attempts: vec![],
            files_modified: BTreeSet::from(["src/lib.rs".to_string()]),
            changes_applied: vec![],
            critical_errors: vec!["Pipeline did not converge".into()],
            warnings: vec![],
            patterns: PatternSummary {
                consistent_failures: vec!["linting".into()],
                ..Default::default()
            },
            total_duration: Duration::from_secs(12),
            analysis: vec![],
            agent_analysis: None,
        };
        let lines = report.summary_lines();
        assert!(lines[0].starts_with("Validation failed, changes rolled back after 3 iteration(s)"));
        assert!(lines.iter().any(|l| l == "Fixers modified 1 file(s)"));
        assert!(lines.iter().any(|l| l == "Consistently failing: linting"));
        assert!(!report.is_success());
    }
}
