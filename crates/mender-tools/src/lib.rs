//! Execution environment and output helpers for Mender gates and fixers.
//!
//! Provides the `ExecutionEnvironment` trait, the `LocalExecutionEnvironment`
//! implementation (bash commands and direct program spawns with process-group
//! timeouts), and truncation helpers that turn tool output into findings.

pub mod environment;
pub mod local_env;
pub mod truncation;

pub use environment::{ExecResult, ExecutionEnvironment};
pub use local_env::LocalExecutionEnvironment;
pub use truncation::{extract_diagnostics, findings_from_output, truncate_output, TruncationMode};
