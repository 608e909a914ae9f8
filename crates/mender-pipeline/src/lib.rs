//! Self-healing validation controller.
//!
//! This crate implements the Mender run loop: ordered quality gates in two
//! phases, fixer delegation with capped exponential backoff, Phase 2 → Phase 1
//! escalation with bounded iterations, snapshot commit/restore, post-run
//! pattern detection and an optional agent-written analysis.

pub mod agent;
pub mod analysis;
pub mod backoff;
pub mod config;
pub mod context;
pub mod controller;
pub mod deadline;
pub mod events;
pub mod fixer;
pub mod gate;
pub mod lock;
pub mod patterns;
pub mod registry;
pub mod review;
pub mod runner;
pub mod snapshot;

pub use agent::{iteration_timeout, AgentCli, AGENT_BASE_TIMEOUT, AGENT_MAX_TIMEOUT};
pub use analysis::{analysis_template_name, AgentAnalyzer, AnalysisRequest, RunAnalyzer};
pub use backoff::{BackoffPolicy, BASE_TIMEOUT, MAX_TIMEOUT};
pub use config::{
    standard_checks, AgentSettings, CheckOverride, CheckSpec, MenderConfig, CONFIG_FILE_NAME,
};
pub use context::{
    ChangeRecord, CheckOutcome, CheckRecord, ContextView, FixerInvocation, IterationRecord,
    Phase2Attempt, PipelineContext, RetryCounter,
};
pub use controller::{ControllerConfig, PipelineController, RunReport, DEFAULT_MAX_PIPELINE_ITERATIONS};
pub use deadline::Deadline;
pub use events::{EventEmitter, PipelineEvent};
pub use fixer::{AgentFixer, CommandFixer, CompositeFixer, NoOpFixer};
pub use gate::{CommandGate, FixRequest, Fixer, Gate};
pub use lock::RunLock;
pub use patterns::{analyze, Bottleneck, OperationKind, PatternSummary};
pub use registry::{CheckDescriptor, CheckRegistry, PHASE1_CHECKS, PHASE2_CHECKS};
pub use review::ReviewGate;
pub use runner::CheckRunner;
pub use snapshot::{
    DirectorySnapshotManager, GitSnapshotManager, RecordingSnapshotManager, Snapshot,
    SnapshotManager, SnapshotState,
};
