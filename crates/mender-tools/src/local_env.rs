use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use mender_types::MenderError;
use tokio::io::AsyncReadExt;

use crate::environment::{ExecResult, ExecutionEnvironment};

/// Grace period between SIGTERM and SIGKILL for a timed-out process group.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Concrete execution environment that runs on the local filesystem.
pub struct LocalExecutionEnvironment {
    working_dir: PathBuf,
}

impl LocalExecutionEnvironment {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    pub fn current_dir() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_dir()?))
    }

    /// Resolve a path relative to the working directory if it is not absolute.
    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.working_dir.join(path)
        }
    }

    /// Filter environment variables, removing secrets and keeping safe defaults.
    fn filtered_env() -> HashMap<String, String> {
        let exclude_suffixes: &[&str] = &[
            "_api_key",
            "_secret",
            "_token",
            "_password",
            "_credential",
        ];
        let always_include: &[&str] = &[
            "PATH", "HOME", "USER", "SHELL", "LANG", "TERM", "TMPDIR",
        ];

        let mut result = HashMap::new();
        for (key, value) in std::env::vars() {
            let lower = key.to_lowercase();
            if always_include.contains(&key.as_str())
                || !exclude_suffixes.iter().any(|s| lower.ends_with(s))
            {
                result.insert(key, value);
            }
        }
        result
    }
}

#[async_trait]
impl ExecutionEnvironment for LocalExecutionEnvironment {
    async fn exec_command(
        &self,
        command: &str,
        timeout: Duration,
        cwd: Option<&Path>,
        env_vars: Option<&HashMap<String, String>>,
    ) -> mender_types::Result<ExecResult> {
        let work_dir = cwd
            .map(|p| self.resolve(p))
            .unwrap_or_else(|| self.working_dir.clone());

        let mut cmd = tokio::process::Command::new("bash");
        cmd.args(["-c", command])
            .current_dir(&work_dir)
            .env_clear()
            .envs(Self::filtered_env());
        if let Some(vars) = env_vars {
            cmd.envs(vars);
        }

        tracing::debug!(command = %command, cwd = %work_dir.display(), "Executing command");
        run_with_timeout(cmd, timeout).await
    }

    async fn exec_program(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> mender_types::Result<ExecResult> {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .current_dir(&self.working_dir)
            .env_clear()
            .envs(Self::filtered_env());

        tracing::debug!(program = %program, args = args.len(), "Executing program");
        run_with_timeout(cmd, timeout).await
    }

    fn working_directory(&self) -> &Path {
        &self.working_dir
    }
}

/// Spawn `cmd`, capture its output, and kill its process group on timeout.
async fn run_with_timeout(
    mut cmd: tokio::process::Command,
    timeout: Duration,
) -> mender_types::Result<ExecResult> {
    cmd.stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    // On Unix, use process_group for clean kill
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }
    cmd.kill_on_drop(true);

    let start = tokio::time::Instant::now();
    let mut child = cmd.spawn()?;
    // Armed until the child exits on its own; a cancelled caller takes the
    // whole group down, not just the direct child.
    let mut group = ProcessGroupGuard::new(child.id());

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| MenderError::Other("child stdout was not captured".into()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| MenderError::Other("child stderr was not captured".into()))?;

    // Drain both pipes concurrently so a chatty child cannot block on a full pipe.
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf).await;
        buf
    });

    tokio::select! {
        status = child.wait() => {
            let status = status?;
            let stdout_buf = stdout_task.await.unwrap_or_default();
            let stderr_buf = stderr_task.await.unwrap_or_default();
            group.disarm();
            Ok(ExecResult {
                stdout: String::from_utf8_lossy(&stdout_buf).to_string(),
                stderr: String::from_utf8_lossy(&stderr_buf).to_string(),
                exit_code: status.code().unwrap_or(-1),
                timed_out: false,
                duration: start.elapsed(),
            })
        }
        _ = tokio::time::sleep(timeout) => {
            // Timeout: try graceful termination first
            group.signal(Signal::Terminate);
            tokio::select! {
                _ = child.wait() => {}
                _ = tokio::time::sleep(KILL_GRACE) => {
                    let _ = child.kill().await;
                }
            }
            // Stragglers that ignored SIGTERM.
            group.signal(Signal::Kill);
            group.disarm();
            stdout_task.abort();
            stderr_task.abort();

            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "Command timed out");
            Ok(ExecResult {
                stdout: String::new(),
                stderr: format!("Command timed out after {}ms", timeout.as_millis()),
                exit_code: -1,
                timed_out: true,
                duration: start.elapsed(),
            })
        }
    }
}

#[derive(Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

/// Signals a spawned child's process group; sends SIGKILL on drop unless
/// disarmed.
struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    fn signal(&self, signal: Signal) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            let sig = match signal {
                Signal::Terminate => libc::SIGTERM,
                Signal::Kill => libc::SIGKILL,
            };
            // SAFETY: signalling the process group we created for our own child.
            unsafe {
                libc::kill(-(pgid as i32), sig);
            }
        }
        #[cfg(not(unix))]
        let _ = signal;
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if self.pgid.is_some() {
            tracing::debug!(pgid = ?self.pgid, "Killing process group of cancelled command");
            self.signal(Signal::Kill);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exec_command_captures_stdout_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let env = LocalExecutionEnvironment::new(dir.path());
        let result = env
            .exec_command("echo hello; exit 3", Duration::from_secs(10), None, None)
            .await
            .unwrap();
        assert_eq!(result.stdout.trim(), "hello");
        assert_eq!(result.exit_code, 3);
        assert!(!result.timed_out);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn exec_command_runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let env = LocalExecutionEnvironment::new(dir.path());
        let result = env
            .exec_command("ls", Duration::from_secs(10), None, None)
            .await
            .unwrap();
        assert!(result.stdout.contains("marker.txt"));
        assert!(result.success());
    }

    #[tokio::test]
    async fn exec_command_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let env = LocalExecutionEnvironment::new(dir.path());
        let result = env
            .exec_command("sleep 5", Duration::from_millis(100), None, None)
            .await
            .unwrap();
        assert!(result.timed_out);
        assert_eq!(result.exit_code, -1);
        assert!(result.stderr.contains("timed out"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancelled_command_takes_its_children_down() {
        let dir = tempfile::tempdir().unwrap();
        let env = LocalExecutionEnvironment::new(dir.path());
        let pending = env.exec_command(
            "sleep 1; echo late > late.txt",
            Duration::from_secs(30),
            None,
            None,
        );
        assert!(tokio::time::timeout(Duration::from_millis(200), pending)
            .await
            .is_err());

        tokio::time::sleep(Duration::from_millis(1800)).await;
        assert!(!dir.path().join("late.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timed_out_command_leaves_no_background_writer() {
        let dir = tempfile::tempdir().unwrap();
        let env = LocalExecutionEnvironment::new(dir.path());
        let result = env
            .exec_command(
                "(trap '' TERM; sleep 1; echo late > late.txt) & wait",
                Duration::from_millis(200),
                None,
                None,
            )
            .await
            .unwrap();
        assert!(result.timed_out);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("late.txt").exists());
    }

    #[tokio::test]
    async fn exec_program_passes_arguments_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let env = LocalExecutionEnvironment::new(dir.path());
        let args = vec!["a b; echo injected".to_string()];
        let result = env
            .exec_program("echo", &args, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(result.stdout.trim(), "a b; echo injected");
    }

    #[tokio::test]
    async fn exec_program_missing_binary_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let env = LocalExecutionEnvironment::new(dir.path());
        let err = env
            .exec_program("definitely-not-a-real-binary-xyz", &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MenderError::Io(_)));
    }

    #[test]
    fn filtered_env_drops_secrets() {
        std::env::set_var("MENDER_TEST_API_KEY", "sekrit");
        let env = LocalExecutionEnvironment::filtered_env();
        assert!(!env.contains_key("MENDER_TEST_API_KEY"));
        assert!(env.contains_key("PATH"));
    }
}
