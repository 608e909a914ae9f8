use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

/// Result of executing a command.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
    pub duration: Duration,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }

    /// Stdout and stderr joined, stderr last.
    pub fn combined_output(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Abstraction over where gate and fixer commands run.
#[async_trait]
pub trait ExecutionEnvironment: Send + Sync {
    /// Run `command` through `bash -c`.
    async fn exec_command(
        &self,
        command: &str,
        timeout: Duration,
        cwd: Option<&Path>,
        env_vars: Option<&HashMap<String, String>>,
    ) -> mender_types::Result<ExecResult>;

    /// Run `program` directly with an explicit argument vector (no shell).
    async fn exec_program(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> mender_types::Result<ExecResult>;

    fn working_directory(&self) -> &Path;
}
