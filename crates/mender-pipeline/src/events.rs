//! Run event system for observability.
//!
//! Emits [`PipelineEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! reporters (CLI progress, chat transports, metrics) can follow a validation
//! run without coupling to the controller internals.

use mender_types::{FinalStatus, Phase};
use serde::{Deserialize, Serialize};

use crate::context::CheckOutcome;

/// Events emitted during a validation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    RunStarted {
        run_id: String,
        check_count: usize,
    },
    RunCompleted {
        run_id: String,
        status: FinalStatus,
        iterations: u32,
        duration_ms: u64,
    },
    RunFailed {
        run_id: String,
        error: String,
    },
    IterationStarted {
        iteration: u32,
    },
    PhaseStarted {
        iteration: u32,
        phase: Phase,
    },
    CheckStarted {
        check: String,
        phase: Phase,
        iteration: u32,
    },
    CheckRetrying {
        check: String,
        attempt: u32,
        delay_ms: u64,
    },
    FixerInvoked {
        check: String,
        files_modified: Vec<String>,
        success: bool,
    },
    CheckCompleted {
        check: String,
        outcome: CheckOutcome,
        duration_ms: u64,
    },
    PipelineLooped {
        from_iteration: u32,
        trigger: String,
    },
    SnapshotCreated {
        snapshot_id: String,
    },
    SnapshotCommitted {
        snapshot_id: String,
    },
    SnapshotRestored {
        snapshot_id: String,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_sees_check_events_in_order() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();

        emitter.emit(PipelineEvent::CheckStarted {
            check: "compilation".into(),
            phase: Phase::Phase2,
            iteration: 1,
        });
        emitter.emit(PipelineEvent::CheckRetrying {
            check: "compilation".into(),
            attempt: 1,
            delay_ms: 1000,
        });

        match rx.recv().await.unwrap() {
            PipelineEvent::CheckStarted { check, phase, .. } => {
                assert_eq!(check, "compilation");
                assert_eq!(phase, Phase::Phase2);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.recv().await.unwrap() {
            PipelineEvent::CheckRetrying { delay_ms, .. } => assert_eq!(delay_ms, 1000),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let emitter = EventEmitter::new(4);
        emitter.emit(PipelineEvent::RunFailed {
            run_id: "r".into(),
            error: "restore failed".into(),
        });
    }

    #[test]
    fn completed_event_serializes_outcome() {
        let event = PipelineEvent::CheckCompleted {
            check: "docs".into(),
            outcome: CheckOutcome::PassedAfterRetries,
            duration_ms: 42,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["CheckCompleted"]["outcome"], "passed_after_retries");
    }
}
