//! Gate → fixer → backoff loop for a single check invocation.

use std::time::Duration;

use mender_types::{CheckResult, CheckStatus, MenderError, Result};
use tokio::time::Instant;

use crate::backoff::BackoffPolicy;
use crate::context::{ChangeRecord, CheckOutcome, CheckRecord, FixerInvocation, PipelineContext};
use crate::deadline::Deadline;
use crate::events::{EventEmitter, PipelineEvent};
use crate::gate::FixRequest;
use crate::registry::CheckDescriptor;

/// Slack given to a gate past its own timeout so it can kill its children.
const GATE_GRACE: Duration = Duration::from_secs(5);

pub struct CheckRunner {
    backoff: BackoffPolicy,
    events: EventEmitter,
}

impl CheckRunner {
    pub fn new(backoff: BackoffPolicy, events: EventEmitter) -> Self {
        Self { backoff, events }
    }

    /// Run one check to a verdict, repairing failures within its local budget.
    ///
    /// Never fails: infra problems end as [`CheckOutcome::Errored`], fixer
    /// problems become context warnings.
    pub async fn run(
        &self,
        check: &CheckDescriptor,
        ctx: &mut PipelineContext,
        deadline: Deadline,
    ) -> CheckRecord {
        let iteration = ctx.iteration();
        self.events.emit(PipelineEvent::CheckStarted {
            check: check.name.clone(),
            phase: check.phase,
            iteration,
        });
        tracing::info!(check = %check.name, phase = %check.phase, iteration, "Running check");

        let mut record = CheckRecord {
            name: check.name.clone(),
            phase: check.phase,
            iteration,
            outcome: CheckOutcome::Errored,
            retries: 0,
            attempts: Vec::new(),
            fixer_invocations: Vec::new(),
        };

        let mut retry_index = 0u32;
        let outcome = loop {
            let result = self.invoke_gate(check, deadline).await;
            let status = result.status;
            let findings = result.details.clone();
            record.attempts.push(result);

            match status {
                CheckStatus::Passed if retry_index == 0 => break CheckOutcome::Passed,
                CheckStatus::Passed => break CheckOutcome::PassedAfterRetries,
                CheckStatus::Errored => break CheckOutcome::Errored,
                CheckStatus::Failed if retry_index >= check.local_retry_budget => {
                    tracing::warn!(
                        check = %check.name,
                        retries = retry_index,
                        "Local retry budget exhausted, escalating"
                    );
                    break CheckOutcome::Escalated;
                }
                CheckStatus::Failed => {}
            }

            ctx.add_retry(check.phase, &check.name);
            record.retries += 1;
            let invocation = self
                .invoke_fixer(check, ctx, findings, retry_index, deadline)
                .await;
            record.fixer_invocations.push(invocation);

            let delay = self.backoff.delay(retry_index);
            if deadline.would_expire_during(delay) {
                let expired = MenderError::DeadlineExceeded {
                    check: check.name.clone(),
                };
                record
                    .attempts
                    .push(CheckResult::errored(&check.name, expired.to_string(), Duration::ZERO));
                break CheckOutcome::Errored;
            }

            retry_index += 1;
            self.events.emit(PipelineEvent::CheckRetrying {
                check: check.name.clone(),
                attempt: retry_index,
                delay_ms: delay.as_millis() as u64,
            });
            tracing::info!(
                check = %check.name,
                attempt = retry_index,
                delay_ms = delay.as_millis() as u64,
                "Re-running gate after fix"
            );
            tokio::time::sleep(delay).await;
        };

        record.outcome = outcome;
        self.events.emit(PipelineEvent::CheckCompleted {
            check: check.name.clone(),
            outcome,
            duration_ms: record.busy_time().as_millis() as u64,
        });
        tracing::info!(
            check = %check.name,
            outcome = %outcome,
            retries = record.retries,
            "Check finished"
        );
        record
    }

    /// Gate call bounded by the run deadline. Infra failures become `Errored`.
    async fn invoke_gate(&self, check: &CheckDescriptor, deadline: Deadline) -> CheckResult {
        let started = Instant::now();
        let outcome = if deadline.is_expired() {
            Err(MenderError::DeadlineExceeded {
                check: check.name.clone(),
            })
        } else {
            let timeout = deadline.bound(check.gate_timeout);
            match tokio::time::timeout(timeout + GATE_GRACE, check.gate.invoke(&check.name, timeout)).await {
                Ok(result) => result,
                Err(_) => Err(MenderError::CommandTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                }),
            }
        };

        match outcome {
            Ok(result) => result,
            Err(err) => {
                let err = match err {
                    MenderError::CommandTimeout { .. } if deadline.is_expired() => {
                        MenderError::DeadlineExceeded {
                            check: check.name.clone(),
                        }
                    }
                    other => other,
                };
                tracing::warn!(check = %check.name, error = %err, "Gate could not run");
                CheckResult::errored(&check.name, err.to_string(), started.elapsed())
            }
        }
    }

    async fn invoke_fixer(
        &self,
        check: &CheckDescriptor,
        ctx: &mut PipelineContext,
        findings: Vec<String>,
        retry_index: u32,
        deadline: Deadline,
    ) -> FixerInvocation {
        let request = FixRequest {
            check: check.name.clone(),
            phase: check.phase,
            findings,
            retry_index,
            context: ctx.view(),
            time_left: deadline.remaining(),
        };

        let started = Instant::now();
        let result: Result<_> = match deadline.remaining() {
            Some(left) => tokio::time::timeout(left, check.fixer.fix(&request))
                .await
                .unwrap_or_else(|_| {
                    Err(MenderError::DeadlineExceeded {
                        check: check.name.clone(),
                    })
                }),
            None => check.fixer.fix(&request).await,
        };
        let duration = started.elapsed();

        let mut invocation = FixerInvocation {
            check: check.name.clone(),
            iteration: ctx.iteration(),
            retry_index,
            files_modified: Vec::new(),
            success: false,
            error: None,
            duration,
        };

        match result {
            Ok(output) => {
                ctx.merge_files(output.files_modified.iter().cloned());
                if !output.files_modified.is_empty() {
                    let description = output.summary.clone().unwrap_or_else(|| {
                        format!(
                            "{} fixer modified {} file(s)",
                            check.name,
                            output.files_modified.len()
                        )
                    });
                    ctx.record_change(ChangeRecord {
                        phase: check.phase,
                        check: check.name.clone(),
                        iteration: ctx.iteration(),
                        description,
                        files: output.files_modified.clone(),
                    });
                }
                if !output.success {
                    ctx.add_warning(format!(
                        "Fixer for '{}' did not complete on attempt {}",
                        check.name,
                        retry_index + 1
                    ));
                }
                invocation.files_modified = output.files_modified;
                invocation.success = output.success;
            }
            Err(err) => {
                tracing::warn!(check = %check.name, error = %err, "Fixer could not run");
                ctx.add_warning(format!("Fixer for '{}' could not run: {}", check.name, err));
                invocation.error = Some(err.to_string());
            }
        }

        self.events.emit(PipelineEvent::FixerInvoked {
            check: check.name.clone(),
            files_modified: invocation.files_modified.clone(),
            success: invocation.success,
        });
        invocation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::{Fixer, Gate};
    use async_trait::async_trait;
    use mender_types::{FixerOutput, Phase};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Fails the first `failures` invocations, then passes.
    struct FlakyGate {
        failures: usize,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Gate for FlakyGate {
        async fn invoke(&self, check: &str, _timeout: Duration) -> Result<CheckResult> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Ok(CheckResult::failed(check, vec![format!("error: failure {n}")], Duration::from_millis(5)))
            } else {
                Ok(CheckResult::passed(check, Duration::from_millis(5)))
            }
        }
    }

    struct BrokenGate;

    #[async_trait]
    impl Gate for BrokenGate {
        async fn invoke(&self, check: &str, _timeout: Duration) -> Result<CheckResult> {
            Err(MenderError::GateError {
                check: check.into(),
                message: "cargo missing".into(),
            })
        }
    }

    struct HangingGate;

    #[async_trait]
    impl Gate for HangingGate {
        async fn invoke(&self, _check: &str, _timeout: Duration) -> Result<CheckResult> {
            std::future::pending().await
        }
    }

    struct EditingFixer {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Fixer for EditingFixer {
        async fn fix(&self, request: &FixRequest) -> Result<FixerOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(FixerOutput::modified([format!("src/{}.rs", request.check)]))
        }
    }

    struct CrashingFixer;

    #[async_trait]
    impl Fixer for CrashingFixer {
        async fn fix(&self, request: &FixRequest) -> Result<FixerOutput> {
            Err(MenderError::FixerError {
                check: request.check.clone(),
                message: "agent not installed".into(),
            })
        }
    }

    fn context() -> PipelineContext {
        let mut ctx = PipelineContext::new(3);
        ctx.begin_iteration();
        ctx.set_phase(Phase::Phase2);
        ctx
    }

    fn runner() -> CheckRunner {
        CheckRunner::new(BackoffPolicy::default(), EventEmitter::default())
    }

    #[tokio::test(start_paused = true)]
    async fn first_try_pass_invokes_no_fixer() {
        let fixer_calls = Arc::new(AtomicUsize::new(0));
        let check = CheckDescriptor::new(
            "compilation",
            Phase::Phase2,
            Arc::new(FlakyGate { failures: 0, calls: Arc::new(AtomicUsize::new(0)) }),
            Arc::new(EditingFixer { calls: fixer_calls.clone() }),
        );
        let mut ctx = context();
        let record = runner().run(&check, &mut ctx, Deadline::none()).await;
        assert_eq!(record.outcome, CheckOutcome::Passed);
        assert_eq!(record.attempts.len(), 1);
        assert_eq!(fixer_calls.load(Ordering::SeqCst), 0);
        assert!(ctx.retries(Phase::Phase2).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failure_is_fixed_after_backoff() {
        let fixer_calls = Arc::new(AtomicUsize::new(0));
        let check = CheckDescriptor::new(
            "compilation",
            Phase::Phase2,
            Arc::new(FlakyGate { failures: 2, calls: Arc::new(AtomicUsize::new(0)) }),
            Arc::new(EditingFixer { calls: fixer_calls.clone() }),
        );
        let mut ctx = context();
        let started = Instant::now();
        let record = runner().run(&check, &mut ctx, Deadline::none()).await;

        assert_eq!(record.outcome, CheckOutcome::PassedAfterRetries);
        assert_eq!(record.retries, 2);
        assert_eq!(record.attempts.len(), 3);
        assert_eq!(fixer_calls.load(Ordering::SeqCst), 2);
        // 1s + 2s of backoff.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(ctx.retries(Phase::Phase2)["compilation"], 2);
        assert_eq!(ctx.files_modified().len(), 1);
        assert_eq!(ctx.changes_applied().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_exhaustion_escalates() {
        let check = CheckDescriptor::new(
            "linting",
            Phase::Phase2,
            Arc::new(FlakyGate { failures: usize::MAX, calls: Arc::new(AtomicUsize::new(0)) }),
            Arc::new(EditingFixer { calls: Arc::new(AtomicUsize::new(0)) }),
        );
        let mut ctx = context();
        let started = Instant::now();
        let record = runner().run(&check, &mut ctx, Deadline::none()).await;

        assert_eq!(record.outcome, CheckOutcome::Escalated);
        assert_eq!(record.retries, 3);
        assert_eq!(record.attempts.len(), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(1 + 2 + 4));
        assert_eq!(record.last_result().unwrap().status, CheckStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_infra_error_consumes_no_retry() {
        let check = CheckDescriptor::new(
            "docs",
            Phase::Phase2,
            Arc::new(BrokenGate),
            Arc::new(EditingFixer { calls: Arc::new(AtomicUsize::new(0)) }),
        );
        let mut ctx = context();
        let record = runner().run(&check, &mut ctx, Deadline::none()).await;
        assert_eq!(record.outcome, CheckOutcome::Errored);
        assert_eq!(record.retries, 0);
        assert!(record.attempts[0].details[0].contains("cargo missing"));
    }

    #[tokio::test(start_paused = true)]
    async fn fixer_infra_error_is_warning_and_still_retries() {
        let check = CheckDescriptor::new(
            "tests",
            Phase::Phase2,
            Arc::new(FlakyGate { failures: 1, calls: Arc::new(AtomicUsize::new(0)) }),
            Arc::new(CrashingFixer),
        );
        let mut ctx = context();
        let record = runner().run(&check, &mut ctx, Deadline::none()).await;
        assert_eq!(record.outcome, CheckOutcome::PassedAfterRetries);
        assert_eq!(record.fixer_invocations[0].error.as_deref().map(|e| e.contains("agent not installed")), Some(true));
        assert_eq!(ctx.warnings().len(), 1);
        assert!(ctx.files_modified().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_gate_is_cut_off_by_deadline() {
        let check = CheckDescriptor::new(
            "tests",
            Phase::Phase2,
            Arc::new(HangingGate),
            Arc::new(EditingFixer { calls: Arc::new(AtomicUsize::new(0)) }),
        );
        let mut ctx = context();
        let deadline = Deadline::after(Duration::from_secs(10));
        let record = runner().run(&check, &mut ctx, deadline).await;
        assert_eq!(record.outcome, CheckOutcome::Errored);
        assert!(record.attempts[0].details[0].contains("deadline"));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_past_deadline_errors_instead_of_sleeping() {
        let gate_calls = Arc::new(AtomicUsize::new(0));
        let check = CheckDescriptor::new(
            "formatting",
            Phase::Phase2,
            Arc::new(FlakyGate { failures: usize::MAX, calls: gate_calls.clone() }),
            Arc::new(EditingFixer { calls: Arc::new(AtomicUsize::new(0)) }),
        );
        let mut ctx = context();
        // Room for the 1s wait but not the following 2s one.
        let deadline = Deadline::after(Duration::from_millis(2500));
        let record = runner().run(&check, &mut ctx, deadline).await;
        assert_eq!(record.outcome, CheckOutcome::Errored);
        assert_eq!(gate_calls.load(Ordering::SeqCst), 2);
        assert_eq!(record.retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn events_report_retries() {
        let events = EventEmitter::new(32);
        let mut rx = events.subscribe();
        let check = CheckDescriptor::new(
            "compilation",
            Phase::Phase2,
            Arc::new(FlakyGate { failures: 1, calls: Arc::new(AtomicUsize::new(0)) }),
            Arc::new(EditingFixer { calls: Arc::new(AtomicUsize::new(0)) }),
        );
        let mut ctx = context();
        CheckRunner::new(BackoffPolicy::default(), events)
            .run(&check, &mut ctx, Deadline::none())
            .await;

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(match event {
                PipelineEvent::CheckStarted { .. } => "started",
                PipelineEvent::FixerInvoked { .. } => "fixer",
                PipelineEvent::CheckRetrying { delay_ms, .. } => {
                    assert_eq!(delay_ms, 1000);
                    "retrying"
                }
                PipelineEvent::CheckCompleted { .. } => "completed",
                _ => "other",
            });
        }
        assert_eq!(kinds, vec!["started", "fixer", "retrying", "completed"]);
    }
}
