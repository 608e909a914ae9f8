//! Shared types, errors, and check outcomes for the Mender validation controller.
//!
//! This crate provides the foundational types used across all other Mender crates:
//! - `MenderError` — unified error taxonomy (infra vs. fatal)
//! - `CheckResult` — immutable outcome of one quality-gate invocation
//! - `FixerOutput` — what a fixer agent reports after editing files
//! - `Phase` / `FinalStatus` — pipeline phase and terminal run status

pub mod duration_serde;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Unified error type for all Mender subsystems.
#[derive(Debug, thiserror::Error)]
pub enum MenderError {
    // === Infra Errors (a collaborator could not run) ===
    #[error("Gate '{check}' could not run: {message}")]
    GateError { check: String, message: String },

    #[error("Fixer for '{check}' could not run: {message}")]
    FixerError { check: String, message: String },

    #[error("Command timed out after {timeout_ms}ms")]
    CommandTimeout { timeout_ms: u64 },

    #[error("Run deadline expired during '{check}'")]
    DeadlineExceeded { check: String },

    #[error("Run analysis could not run: {0}")]
    AnalysisError(String),

    // === Fatal Errors ===
    #[error("Snapshot error: {0}")]
    SnapshotError(String),

    #[error("Restore failed, working tree may be corrupted: {0}")]
    RestoreError(String),

    #[error("Another validation run already holds the lock for {repo}")]
    ConcurrentRun { repo: String },

    // === Configuration ===
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl MenderError {
    /// Returns `true` if a gate or fixer tool itself failed to execute.
    ///
    /// Infra failures never count as content failures: a gate infra error is
    /// reported as [`CheckStatus::Errored`].
    pub fn is_infra(&self) -> bool {
        matches!(
            self,
            MenderError::GateError { .. }
                | MenderError::FixerError { .. }
                | MenderError::CommandTimeout { .. }
                | MenderError::DeadlineExceeded { .. }
                | MenderError::AnalysisError(_)
                | MenderError::Io(_)
        )
    }

    /// Returns `true` if the run must abort without any further checks.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MenderError::SnapshotError(_)
                | MenderError::RestoreError(_)
                | MenderError::ConcurrentRun { .. }
        )
    }
}

/// A convenience alias for `Result<T, MenderError>`.
pub type Result<T> = std::result::Result<T, MenderError>;

// ---------------------------------------------------------------------------
// Phase — which group of gates is running
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Deep analysis: code review, testing, security, integration.
    Phase1,
    /// Toolchain compliance: compilation, tests, formatting, linting, docs.
    Phase2,
}

impl Phase {
    pub fn title(&self) -> &'static str {
        match self {
            Phase::Phase1 => "Advanced Quality Assurance",
            Phase::Phase2 => "Core Compliance Checks",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Phase1 => write!(f, "phase1"),
            Phase::Phase2 => write!(f, "phase2"),
        }
    }
}

// ---------------------------------------------------------------------------
// CheckResult — outcome of one gate invocation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    /// The gate ran and found nothing to report.
    Passed,
    /// The gate ran and reported violations.
    Failed,
    /// The gate itself could not execute (infra failure or timeout).
    Errored,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub details: Vec<String>,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl CheckResult {
    /// A passing result with no findings.
    pub fn passed(name: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Passed,
            details: Vec::new(),
            duration,
        }
    }

    /// A content failure with the gate's findings.
    pub fn failed(name: impl Into<String>, details: Vec<String>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Failed,
            details,
            duration,
        }
    }

    /// An infra failure; the single detail is the error message.
    pub fn errored(name: impl Into<String>, message: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Errored,
            details: vec![message.into()],
            duration,
        }
    }

    pub fn is_passed(&self) -> bool {
        self.status == CheckStatus::Passed
    }
}

// ---------------------------------------------------------------------------
// FixerOutput — reported by a fixer after an attempted repair
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixerOutput {
    /// Paths (relative to the repository root) the fixer touched.
    pub files_modified: Vec<String>,
    /// Whether the fixer ran to completion. Says nothing about the gate.
    pub success: bool,
    /// Free-form explanation returned by the agent, if any.
    pub summary: Option<String>,
}

impl FixerOutput {
    pub fn unchanged() -> Self {
        Self::default()
    }

    pub fn modified<I, S>(files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            files_modified: files.into_iter().map(Into::into).collect(),
            success: true,
            summary: None,
        }
    }
}

// ---------------------------------------------------------------------------
// FinalStatus — terminal status of a run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    /// Every check passed on the first iteration.
    Success,
    /// Every check passed, but only after at least one outer-loop restart.
    SuccessWithRetries,
    /// Repair was not achieved; the working tree was restored.
    Failure,
}

impl FinalStatus {
    pub fn is_success(&self) -> bool {
        !matches!(self, FinalStatus::Failure)
    }
}
