//! Post-run analysis of recurring failures, flaky checks and slow operations.

use std::collections::BTreeMap;
use std::time::Duration;

use mender_types::duration_serde;
use serde::{Deserialize, Serialize};

use crate::context::PipelineContext;

/// Default share of total run time above which an operation is a bottleneck.
pub const DEFAULT_BOTTLENECK_THRESHOLD: f64 = 0.30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Gate,
    Fixer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bottleneck {
    pub check: String,
    pub kind: OperationKind,
    pub iteration: u32,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Fraction of the total run duration.
    pub share: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternSummary {
    pub consistent_failures: Vec<String>,
    pub flakey_checks: Vec<String>,
    pub performance_bottlenecks: Vec<Bottleneck>,
}

impl PatternSummary {
    pub fn is_empty(&self) -> bool {
        self.consistent_failures.is_empty()
            && self.flakey_checks.is_empty()
            && self.performance_bottlenecks.is_empty()
    }
}

/// Summarize the run. Reads the context only.
///
/// - consistent failure: the check ran in every iteration and never passed.
/// - flaky: passed in one iteration and did not pass in another.
/// - bottleneck: one gate or fixer call longer than `threshold` of the run.
pub fn analyze(ctx: &PipelineContext, threshold: f64) -> PatternSummary {
    let history = ctx.history();

    // Per check, in first-seen order: pass/fail verdict for each iteration it ran in.
    let mut order: Vec<&str> = Vec::new();
    let mut verdicts: BTreeMap<&str, Vec<bool>> = BTreeMap::new();
    for iteration in history {
        for record in iteration.checks() {
            let entry = verdicts.entry(record.name.as_str()).or_insert_with(|| {
                order.push(record.name.as_str());
                Vec::new()
            });
            entry.push(record.outcome.is_passed());
        }
    }

    let iterations = history.len();
    let mut summary = PatternSummary::default();
    for name in order {
        let runs = &verdicts[name];
        let passed = runs.iter().filter(|p| **p).count();
        if iterations > 0 && runs.len() == iterations && passed == 0 {
            summary.consistent_failures.push(name.to_string());
        }
        if passed > 0 && passed < runs.len() {
            summary.flakey_checks.push(name.to_string());
        }
    }

    let total = ctx.total_duration();
    if !total.is_zero() {
        let limit = total.as_secs_f64() * threshold;
        let mut push = |check: &str, kind, iteration, duration: Duration| {
            if duration.as_secs_f64() > limit {
                summary.performance_bottlenecks.push(Bottleneck {
                    check: check.to_string(),
                    kind,
                    iteration,
                    duration,
                    share: duration.as_secs_f64() / total.as_secs_f64(),
                });
            }
        };
        for iteration in history {
            for record in iteration.checks() {
                for attempt in &record.attempts {
                    push(&record.name, OperationKind::Gate, record.iteration, attempt.duration);
                }
                for fix in &record.fixer_invocations {
                    push(&record.name, OperationKind::Fixer, record.iteration, fix.duration);
                }
            }
        }
    }

    summary
}
