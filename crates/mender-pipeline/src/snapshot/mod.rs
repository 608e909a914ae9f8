//! Working-tree snapshots taken before validation and resolved exactly once:
//! committed when the run succeeds, restored when it fails.

mod directory;
mod git;

pub use directory::DirectorySnapshotManager;
pub use git::GitSnapshotManager;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mender_types::{MenderError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotState {
    Active,
    Committed,
    Restored,
}

/// Opaque, restorable handle to the pre-run state of the working tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    /// RFC 3339 creation time.
    pub created_at: String,
    state: SnapshotState,
    /// Manager-specific restore data.
    data: serde_json::Value,
}

impl Snapshot {
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            state: SnapshotState::Active,
            data,
        }
    }

    pub fn state(&self) -> SnapshotState {
        self.state
    }

    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }

    /// `Ok(false)` when already committed, so a second commit is a no-op.
    pub fn ensure_committable(&self) -> Result<bool> {
        match self.state {
            SnapshotState::Active => Ok(true),
            SnapshotState::Committed => Ok(false),
            SnapshotState::Restored => Err(MenderError::SnapshotError(format!(
                "snapshot {} was already restored",
                self.id
            ))),
        }
    }

    pub fn ensure_restorable(&self) -> Result<()> {
        match self.state {
            SnapshotState::Active => Ok(()),
            other => Err(MenderError::SnapshotError(format!(
                "snapshot {} is {:?} and cannot be restored",
                self.id, other
            ))),
        }
    }

    pub fn mark_committed(&mut self) {
        self.state = SnapshotState::Committed;
    }

    pub fn mark_restored(&mut self) {
        self.state = SnapshotState::Restored;
    }
}

/// Checkpoint, commit and restore of the repository working tree.
///
/// Implementations must work with zero pending changes, treat a second
/// `commit` as a no-op, and fail any other reuse of a terminal snapshot.
#[async_trait]
pub trait SnapshotManager: Send + Sync {
    async fn checkpoint(&self) -> Result<Snapshot>;

    async fn commit(&self, snapshot: &mut Snapshot) -> Result<()>;

    /// Revert every change made since `checkpoint`, including created and
    /// deleted files. A `RestoreError` means the tree may be corrupted.
    async fn restore(&self, snapshot: &mut Snapshot) -> Result<()>;
}

/// Counts calls and optionally delegates to a real manager.
///
/// Without an inner manager it only tracks snapshot state, which is enough
/// for controller tests that use scripted gates.
#[derive(Default)]
pub struct RecordingSnapshotManager {
    inner: Option<Arc<dyn SnapshotManager>>,
    checkpoints: AtomicUsize,
    commits: AtomicUsize,
    restores: AtomicUsize,
}

impl RecordingSnapshotManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wrapping(inner: Arc<dyn SnapshotManager>) -> Self {
        Self {
            inner: Some(inner),
            ..Self::default()
        }
    }

    pub fn checkpoint_count(&self) -> usize {
        self.checkpoints.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn restore_count(&self) -> usize {
        self.restores.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotManager for RecordingSnapshotManager {
    async fn checkpoint(&self) -> Result<Snapshot> {
        self.checkpoints.fetch_add(1, Ordering::SeqCst);
        match &self.inner {
            Some(inner) => inner.checkpoint().await,
            None => Ok(Snapshot::new(serde_json::Value::Null)),
        }
    }

    async fn commit(&self, snapshot: &mut Snapshot) -> Result<()> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        match &self.inner {
            Some(inner) => inner.commit(snapshot).await,
            None => {
                if snapshot.ensure_committable()? {
                    snapshot.mark_committed();
                }
                Ok(())
            }
        }
    }

    async fn restore(&self, snapshot: &mut Snapshot) -> Result<()> {
        self.restores.fetch_add(1, Ordering::SeqCst);
        match &self.inner {
            Some(inner) => inner.restore(snapshot).await,
            None => {
                snapshot.ensure_restorable()?;
                snapshot.mark_restored();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn commit_twice_is_noop() {
        let manager = RecordingSnapshotManager::new();
        let mut snapshot = manager.checkpoint().await.unwrap();
        manager.commit(&mut snapshot).await.unwrap();
        manager.commit(&mut snapshot).await.unwrap();
        assert_eq!(snapshot.state(), SnapshotState::Committed);
        assert_eq!(manager.commit_count(), 2);
    }

    #[tokio::test]
    async fn terminal_snapshot_cannot_be_restored() {
        let manager = RecordingSnapshotManager::new();
        let mut snapshot = manager.checkpoint().await.unwrap();
        manager.commit(&mut snapshot).await.unwrap();
        let err = manager.restore(&mut snapshot).await.unwrap_err();
        assert!(matches!(err, MenderError::SnapshotError(_)));

        let mut snapshot = manager.checkpoint().await.unwrap();
        manager.restore(&mut snapshot).await.unwrap();
        assert!(manager.restore(&mut snapshot).await.is_err());
        assert!(manager.commit(&mut snapshot).await.is_err());
        assert_eq!(manager.checkpoint_count(), 2);
    }
}
