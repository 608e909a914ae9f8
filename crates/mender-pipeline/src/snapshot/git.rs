use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mender_tools::{ExecResult, ExecutionEnvironment};
use mender_types::{MenderError, Result};
use serde_json::json;

use super::{Snapshot, SnapshotManager};

const GIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Markers of an operation git cannot stash across.
const IN_PROGRESS_MARKERS: [(&str, &str); 5] = [
    ("MERGE_HEAD", "merge"),
    ("rebase-merge", "rebase"),
    ("rebase-apply", "rebase"),
    ("CHERRY_PICK_HEAD", "cherry-pick"),
    ("REVERT_HEAD", "revert"),
];

/// Snapshots a git work tree as a stash object plus the recorded HEAD.
///
/// Pending changes (tracked and untracked) are stashed and immediately
/// re-applied, so the tree is unchanged after `checkpoint`. Ignored files are
/// not captured.
pub struct GitSnapshotManager {
    env: Arc<dyn ExecutionEnvironment>,
}

impl GitSnapshotManager {
    pub fn new(env: Arc<dyn ExecutionEnvironment>) -> Self {
        Self { env }
    }

    async fn git(&self, args: &[&str]) -> Result<ExecResult> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.env.exec_program("git", &args, GIT_TIMEOUT).await
    }

    /// Run git and return trimmed stdout, mapping any failure with `err`.
    async fn git_ok(&self, args: &[&str], err: fn(String) -> MenderError) -> Result<String> {
        let result = self
            .git(args)
            .await
            .map_err(|e| err(format!("git {}: {e}", args.join(" "))))?;
        if !result.success() {
            return Err(err(format!(
                "git {} failed: {}",
                args.join(" "),
                result.stderr.trim()
            )));
        }
        Ok(result.stdout.trim().to_string())
    }

    async fn stash_ref(&self) -> Option<String> {
        let result = self.git(&["rev-parse", "-q", "--verify", "refs/stash"]).await.ok()?;
        result.success().then(|| result.stdout.trim().to_string())
    }

    async fn ensure_stashable(&self) -> Result<()> {
        let git_dir = self
            .git_ok(&["rev-parse", "--git-dir"], MenderError::SnapshotError)
            .await?;
        let git_dir = self.env.working_directory().join(git_dir);
        for (marker, operation) in IN_PROGRESS_MARKERS {
            if tokio::fs::try_exists(git_dir.join(marker)).await.unwrap_or(false) {
                return Err(MenderError::SnapshotError(format!(
                    "a {operation} is in progress; finish or abort it before validating"
                )));
            }
        }
        Ok(())
    }

    /// Drop the stash entry whose commit is `sha`. Missing entries are ignored.
    async fn drop_stash(&self, sha: &str) -> Result<()> {
        let list = self
            .git_ok(&["stash", "list", "--format=%H"], MenderError::SnapshotError)
            .await?;
        let Some(index) = list.lines().position(|line| line.trim() == sha) else {
            tracing::debug!(stash = %sha, "Snapshot stash already gone");
            return Ok(());
        };
        let entry = format!("stash@{{{index}}}");
        self.git_ok(&["stash", "drop", &entry], MenderError::SnapshotError)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotManager for GitSnapshotManager {
    async fn checkpoint(&self) -> Result<Snapshot> {
        self.ensure_stashable().await?;
        let head = self
            .git_ok(&["rev-parse", "--verify", "HEAD"], |m| {
                MenderError::SnapshotError(format!("repository has no commit to restore to ({m})"))
            })
            .await?;

        let before = self.stash_ref().await;
        let id = uuid::Uuid::new_v4();
        let message = format!("mender-snapshot-{id}");
        self.git_ok(
            &[
                "-c",
                "user.name=mender",
                "-c",
                "user.email=mender@localhost",
                "stash",
                "push",
                "--include-untracked",
                "--message",
                &message,
            ],
            MenderError::SnapshotError,
        )
        .await?;

        let after = self.stash_ref().await;
        let stash = match after {
            Some(sha) if Some(&sha) != before.as_ref() => {
                // Put the pending changes back; the stash keeps a copy.
                self.git_ok(&["stash", "apply", "--index", &sha], |m| {
                    MenderError::SnapshotError(format!("could not re-apply pending changes: {m}"))
                })
                .await?;
                Some(sha)
            }
            _ => None,
        };

        tracing::info!(head = %head, stash = ?stash, "Git snapshot created");
        let mut snapshot = Snapshot::new(json!({ "head": head, "stash": stash }));
        snapshot.id = id.to_string();
        Ok(snapshot)
    }

    async fn commit(&self, snapshot: &mut Snapshot) -> Result<()> {
        if !snapshot.ensure_committable()? {
            return Ok(());
        }
        if let Some(stash) = snapshot.data()["stash"].as_str() {
            self.drop_stash(stash).await?;
        }
        snapshot.mark_committed();
        tracing::info!(snapshot = %snapshot.id, "Git snapshot committed");
        Ok(())
    }

    async fn restore(&self, snapshot: &mut Snapshot) -> Result<()> {
        snapshot.ensure_restorable()?;
        let head = snapshot.data()["head"]
            .as_str()
            .ok_or_else(|| MenderError::RestoreError("snapshot has no recorded HEAD".into()))?
            .to_string();
        let stash = snapshot.data()["stash"].as_str().map(String::from);

        let head_commit = format!("{head}^{{commit}}");
        self.git_ok(&["cat-file", "-e", &head_commit], MenderError::RestoreError)
            .await?;
        if let Some(stash) = &stash {
            self.git_ok(&["cat-file", "-e", stash], MenderError::RestoreError)
                .await?;
        }

        self.git_ok(&["reset", "--hard", &head], MenderError::RestoreError)
            .await?;
        self.git_ok(&["clean", "-fd"], MenderError::RestoreError).await?;
        if let Some(stash) = &stash {
            self.git_ok(&["stash", "apply", "--index", stash], MenderError::RestoreError)
                .await?;
            if let Err(e) = self.drop_stash(stash).await {
                tracing::warn!(error = %e, "Restored, but the snapshot stash could not be dropped");
            }
        }

        snapshot.mark_restored();
        tracing::info!(snapshot = %snapshot.id, head = %head, "Git snapshot restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SnapshotState;
    use mender_tools::LocalExecutionEnvironment;
    use std::path::Path;
    use std::process::Command;

    fn git(dir: &Path, args: &[&str]) -> String {
        let out = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .expect("git is installed");
        assert!(out.status.success(), "git {:?}: {}", args, String::from_utf8_lossy(&out.stderr));
        String::from_utf8_lossy(&out.stdout).to_string()
    }

    fn init_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        git(dir.path(), &["init", "-q"]);
        git(dir.path(), &["config", "user.email", "test@example.com"]);
        git(dir.path(), &["config", "user.name", "Test"]);
        std::fs::write(dir.path().join("lib.rs"), "fn main() {}\n").unwrap();
        std::fs::write(dir.path().join("gone.rs"), "// to be deleted\n").unwrap();
        git(dir.path(), &["add", "."]);
        git(dir.path(), &["commit", "-q", "-m", "init"]);
        dir
    }

    fn manager(dir: &Path) -> GitSnapshotManager {
        GitSnapshotManager::new(Arc::new(LocalExecutionEnvironment::new(dir)))
    }

    #[tokio::test]
    async fn restore_reverts_edits_creations_and_deletions() {
        let repo = init_repo();
        let snapshots = manager(repo.path());
        let mut snapshot = snapshots.checkpoint().await.unwrap();
        assert!(snapshot.data()["stash"].is_null());

        std::fs::write(repo.path().join("lib.rs"), "broken(\n").unwrap();
        std::fs::write(repo.path().join("new.rs"), "// new\n").unwrap();
        std::fs::remove_file(repo.path().join("gone.rs")).unwrap();

        snapshots.restore(&mut snapshot).await.unwrap();
        assert_eq!(snapshot.state(), SnapshotState::Restored);
        assert_eq!(
            std::fs::read_to_string(repo.path().join("lib.rs")).unwrap(),
            "fn main() {}\n"
        );
        assert!(!repo.path().join("new.rs").exists());
        assert!(repo.path().join("gone.rs").exists());
    }

    #[tokio::test]
    async fn pending_changes_survive_checkpoint_and_restore() {
        let repo = init_repo();
        std::fs::write(repo.path().join("lib.rs"), "fn main() { pending(); }\n").unwrap();
        std::fs::write(repo.path().join("draft.rs"), "// untracked\n").unwrap();

        let snapshots = manager(repo.path());
        let mut snapshot = snapshots.checkpoint().await.unwrap();
        assert!(snapshot.data()["stash"].is_string());
        // Tree untouched by the checkpoint itself.
        assert!(repo.path().join("draft.rs").exists());
        assert!(std::fs::read_to_string(repo.path().join("lib.rs"))
            .unwrap()
            .contains("pending"));

        std::fs::write(repo.path().join("lib.rs"), "garbage").unwrap();
        std::fs::remove_file(repo.path().join("draft.rs")).unwrap();
        snapshots.restore(&mut snapshot).await.unwrap();

        assert!(std::fs::read_to_string(repo.path().join("lib.rs"))
            .unwrap()
            .contains("pending"));
        assert!(repo.path().join("draft.rs").exists());
        assert!(git(repo.path(), &["stash", "list"]).trim().is_empty());
    }

    #[tokio::test]
    async fn commit_keeps_changes_and_drops_stash() {
        let repo = init_repo();
        std::fs::write(repo.path().join("lib.rs"), "fn main() { pending(); }\n").unwrap();
        let snapshots = manager(repo.path());
        let mut snapshot = snapshots.checkpoint().await.unwrap();

        std::fs::write(repo.path().join("lib.rs"), "fn main() { fixed(); }\n").unwrap();
        snapshots.commit(&mut snapshot).await.unwrap();
        snapshots.commit(&mut snapshot).await.unwrap();

        assert_eq!(snapshot.state(), SnapshotState::Committed);
        assert!(std::fs::read_to_string(repo.path().join("lib.rs"))
            .unwrap()
            .contains("fixed"));
        assert!(git(repo.path(), &["stash", "list"]).trim().is_empty());
        assert!(snapshots.restore(&mut snapshot).await.is_err());
    }

    #[tokio::test]
    async fn checkpoint_refuses_mid_merge() {
        let repo = init_repo();
        let head = git(repo.path(), &["rev-parse", "HEAD"]);
        std::fs::write(repo.path().join(".git/MERGE_HEAD"), head).unwrap();
        let err = manager(repo.path()).checkpoint().await.unwrap_err();
        assert!(matches!(err, MenderError::SnapshotError(ref m) if m.contains("merge")));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn checkpoint_outside_git_is_snapshot_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = manager(dir.path()).checkpoint().await.unwrap_err();
        assert!(matches!(err, MenderError::SnapshotError(_)));
    }

    #[tokio::test]
    async fn missing_stash_object_is_restore_error() {
        let repo = init_repo();
        let snapshots = manager(repo.path());
        let mut snapshot = Snapshot::new(json!({
            "head": git(repo.path(), &["rev-parse", "HEAD"]).trim(),
            "stash": "0000000000000000000000000000000000000001",
        }));
        let err = snapshots.restore(&mut snapshot).await.unwrap_err();
        assert!(matches!(err, MenderError::RestoreError(_)));
        assert_eq!(snapshot.state(), SnapshotState::Active);
    }
}
