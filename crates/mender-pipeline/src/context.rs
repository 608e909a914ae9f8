//! Run-wide state record shared by the controller, check runner and pattern detector.
//!
//! The context is append-only from the outside: components read it through
//! getters and [`ContextView`], and only this crate mutates it.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use mender_types::{duration_serde, CheckResult, FinalStatus, Phase};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Consumed retry count per check name.
pub type RetryCounter = BTreeMap<String, u32>;

/// How a single check invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    /// Passed on the first gate invocation.
    Passed,
    /// Passed after at least one fixer round.
    PassedAfterRetries,
    /// Still failing when the local retry budget ran out.
    Escalated,
    /// The gate could not run.
    Errored,
}

impl CheckOutcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, CheckOutcome::Passed | CheckOutcome::PassedAfterRetries)
    }
}

impl std::fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CheckOutcome::Passed => "passed",
            CheckOutcome::PassedAfterRetries => "passed after retries",
            CheckOutcome::Escalated => "escalated",
            CheckOutcome::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// One call into a fixer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixerInvocation {
    pub check: String,
    pub iteration: u32,
    pub retry_index: u32,
    pub files_modified: Vec<String>,
    pub success: bool,
    /// Set when the fixer itself could not run.
    pub error: Option<String>,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

/// Everything that happened while running one check once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRecord {
    pub name: String,
    pub phase: Phase,
    pub iteration: u32,
    pub outcome: CheckOutcome,
    /// Local retries consumed by this invocation.
    pub retries: u32,
    /// Every gate result, in order. The last one is the final verdict.
    pub attempts: Vec<CheckResult>,
    pub fixer_invocations: Vec<FixerInvocation>,
}

impl CheckRecord {
    pub fn last_result(&self) -> Option<&CheckResult> {
        self.attempts.last()
    }

    /// Gate plus fixer time spent on this check. Backoff waits excluded.
    pub fn busy_time(&self) -> Duration {
        let gates: Duration = self.attempts.iter().map(|a| a.duration).sum();
        let fixers: Duration = self.fixer_invocations.iter().map(|f| f.duration).sum();
        gates + fixers
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub phase1: Vec<CheckRecord>,
    pub phase2: Vec<CheckRecord>,
    /// Set when this iteration ended by looping back to Phase 1.
    pub triggered_loop: bool,
}

impl IterationRecord {
    pub fn checks(&self) -> impl Iterator<Item = &CheckRecord> {
        self.phase1.iter().chain(self.phase2.iter())
    }
}

/// A fixer invocation that changed files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub phase: Phase,
    pub check: String,
    pub iteration: u32,
    pub description: String,
    pub files: Vec<String>,
}

/// Phase 2 as run in one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase2Attempt {
    pub iteration: u32,
    pub checks: Vec<CheckRecord>,
    pub triggered_loop: bool,
}

/// Read-only projection handed to fixers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextView {
    pub run_id: String,
    pub iteration: u32,
    pub max_iterations: u32,
    pub current_phase: Phase,
    pub phase1_retries: RetryCounter,
    pub phase2_retries: RetryCounter,
    pub files_modified: Vec<String>,
    pub warnings: Vec<String>,
    pub critical_errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PipelineContext {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    iteration: u32,
    max_iterations: u32,
    current_phase: Phase,
    phase1_retries: RetryCounter,
    phase2_retries: RetryCounter,
    warnings: Vec<String>,
    critical_errors: Vec<String>,
    files_modified: BTreeSet<String>,
    changes_applied: Vec<ChangeRecord>,
    history: Vec<IterationRecord>,
    final_status: Option<FinalStatus>,
    total_duration: Duration,
}

impl PipelineContext {
    pub fn new(max_iterations: u32) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            iteration: 0,
            max_iterations,
            current_phase: Phase::Phase1,
            phase1_retries: RetryCounter::new(),
            phase2_retries: RetryCounter::new(),
            warnings: Vec::new(),
            critical_errors: Vec::new(),
            files_modified: BTreeSet::new(),
            changes_applied: Vec::new(),
            history: Vec::new(),
            final_status: None,
            total_duration: Duration::ZERO,
        }
    }

    // --- getters ---

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// 1-based iteration number. 0 before the first iteration begins.
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn current_phase(&self) -> Phase {
        self.current_phase
    }

    pub fn retries(&self, phase: Phase) -> &RetryCounter {
        match phase {
            Phase::Phase1 => &self.phase1_retries,
            Phase::Phase2 => &self.phase2_retries,
        }
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn critical_errors(&self) -> &[String] {
        &self.critical_errors
    }

    pub fn files_modified(&self) -> &BTreeSet<String> {
        &self.files_modified
    }

    pub fn changes_applied(&self) -> &[ChangeRecord] {
        &self.changes_applied
    }

    pub fn history(&self) -> &[IterationRecord] {
        &self.history
    }

    pub fn final_status(&self) -> Option<FinalStatus> {
        self.final_status
    }

    pub fn total_duration(&self) -> Duration {
        self.total_duration
    }

    /// Phase 1 results of the most recent iteration that ran Phase 1.
    pub fn phase1_results(&self) -> &[CheckRecord] {
        self.history
            .iter()
            .rev()
            .find(|it| !it.phase1.is_empty())
            .map(|it| it.phase1.as_slice())
            .unwrap_or(&[])
    }

    /// Every iteration that reached Phase 2, in order.
    pub fn phase2_attempts(&self) -> Vec<Phase2Attempt> {
        self.history
            .iter()
            .filter(|it| !it.phase2.is_empty())
            .map(|it| Phase2Attempt {
                iteration: it.iteration,
                checks: it.phase2.clone(),
                triggered_loop: it.triggered_loop,
            })
            .collect()
    }

    pub fn view(&self) -> ContextView {
        ContextView {
            run_id: self.run_id.to_string(),
            iteration: self.iteration,
            max_iterations: self.max_iterations,
            current_phase: self.current_phase,
            phase1_retries: self.phase1_retries.clone(),
            phase2_retries: self.phase2_retries.clone(),
            files_modified: self.files_modified.iter().cloned().collect(),
            warnings: self.warnings.clone(),
            critical_errors: self.critical_errors.clone(),
        }
    }

    // --- mutators ---

    /// Start the next outer iteration.
    ///
    /// Returns `None` once `max_iterations` has been reached. Phase 1 retry
    /// counters start from zero in every iteration.
    pub(crate) fn begin_iteration(&mut self) -> Option<u32> {
        if self.iteration >= self.max_iterations {
            return None;
        }
        self.iteration += 1;
        self.current_phase = Phase::Phase1;
        self.phase1_retries.clear();
        self.history.push(IterationRecord {
            iteration: self.iteration,
            ..Default::default()
        });
        Some(self.iteration)
    }

    pub(crate) fn set_phase(&mut self, phase: Phase) {
        self.current_phase = phase;
    }

    pub(crate) fn add_retry(&mut self, phase: Phase, check: &str) -> u32 {
        let counter = match phase {
            Phase::Phase1 => &mut self.phase1_retries,
            Phase::Phase2 => &mut self.phase2_retries,
        };
        let slot = counter.entry(check.to_string()).or_insert(0);
        *slot += 1;
        *slot
    }

    pub(crate) fn merge_files<I, S>(&mut self, files: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files_modified.extend(files.into_iter().map(Into::into));
    }

    pub(crate) fn record_change(&mut self, change: ChangeRecord) {
        self.changes_applied.push(change);
    }

    pub(crate) fn record_check(&mut self, record: CheckRecord) {
        if let Some(current) = self.history.last_mut() {
            match record.phase {
                Phase::Phase1 => current.phase1.push(record),
                Phase::Phase2 => current.phase2.push(record),
            }
        }
    }

    pub(crate) fn mark_loop_triggered(&mut self) {
        if let Some(current) = self.history.last_mut() {
            current.triggered_loop = true;
        }
    }

    pub(crate) fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub(crate) fn add_critical_error(&mut self, error: impl Into<String>) {
        self.critical_errors.push(error.into());
    }

    /// Set the terminal status. Only the first call takes effect.
    pub(crate) fn finalize(&mut self, status: FinalStatus, total_duration: Duration) -> bool {
        if self.final_status.is_some() {
            return false;
        }
        self.final_status = Some(status);
        self.total_duration = total_duration;
        true
    }
}
