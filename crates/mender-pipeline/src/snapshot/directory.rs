use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use mender_types::{MenderError, Result};
use serde_json::json;
use walkdir::{DirEntry, WalkDir};

use super::{Snapshot, SnapshotManager};

/// Snapshots a plain directory tree by copying it into a backup directory.
///
/// For trees that are not git work trees. Entries whose name is in the
/// exclude list (build output, VCS metadata) are neither copied nor touched
/// on restore.
pub struct DirectorySnapshotManager {
    root: PathBuf,
    backup_root: PathBuf,
    exclude: Vec<String>,
}

impl DirectorySnapshotManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            backup_root: std::env::temp_dir().join("mender-snapshots"),
            exclude: vec![".git".into(), "target".into()],
        }
    }

    pub fn with_backup_root(mut self, backup_root: impl Into<PathBuf>) -> Self {
        self.backup_root = backup_root.into();
        self
    }

    pub fn with_exclude(mut self, exclude: Vec<String>) -> Self {
        self.exclude = exclude;
        self
    }

    fn backup_dir(snapshot: &Snapshot) -> Option<PathBuf> {
        snapshot.data()["backup"].as_str().map(PathBuf::from)
    }
}

/// Relative paths of all files and directories below `root`, parents first.
fn walk(root: &Path, exclude: &[String]) -> io::Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    let entries = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_excluded(e, exclude));
    for entry in entries {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
            .to_path_buf();
        if entry.file_type().is_dir() {
            dirs.push(rel);
        } else {
            files.push(rel);
        }
    }
    dirs.sort();
    files.sort();
    Ok((files, dirs))
}

fn is_excluded(entry: &DirEntry, exclude: &[String]) -> bool {
    let name = entry.file_name().to_str();
    exclude.iter().any(|e| name == Some(e.as_str()))
}

fn copy_entry(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let meta = std::fs::symlink_metadata(from)?;
    if meta.file_type().is_symlink() {
        #[cfg(unix)]
        {
            let target = std::fs::read_link(from)?;
            if std::fs::symlink_metadata(to).is_ok() {
                std::fs::remove_file(to)?;
            }
            std::os::unix::fs::symlink(target, to)?;
        }
        return Ok(());
    }
    std::fs::copy(from, to)?;
    Ok(())
}

fn copy_tree(from: &Path, to: &Path, exclude: &[String]) -> io::Result<()> {
    let (files, dirs) = walk(from, exclude)?;
    std::fs::create_dir_all(to)?;
    for dir in dirs {
        std::fs::create_dir_all(to.join(dir))?;
    }
    for file in files {
        copy_entry(&from.join(&file), &to.join(&file))?;
    }
    Ok(())
}

/// Make `root` match `backup` again, leaving excluded entries alone.
fn restore_tree(root: &Path, backup: &Path, exclude: &[String]) -> io::Result<()> {
    let (saved_files, saved_dirs) = walk(backup, exclude)?;
    let (current_files, current_dirs) = walk(root, exclude)?;
    let saved_files: HashSet<_> = saved_files.into_iter().collect();
    let saved_dirs: HashSet<_> = saved_dirs.into_iter().collect();

    for file in current_files.iter().filter(|f| !saved_files.contains(*f)) {
        std::fs::remove_file(root.join(file))?;
    }
    // Deepest first so children go before parents.
    for dir in current_dirs.iter().rev().filter(|d| !saved_dirs.contains(*d)) {
        std::fs::remove_dir_all(root.join(dir))?;
    }
    for dir in &saved_dirs {
        std::fs::create_dir_all(root.join(dir))?;
    }
    for file in &saved_files {
        copy_entry(&backup.join(file), &root.join(file))?;
    }
    Ok(())
}

async fn blocking<T, F>(f: F, err: fn(String) -> MenderError) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> io::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| err(e.to_string()))?
        .map_err(|e| err(e.to_string()))
}

#[async_trait]
impl SnapshotManager for DirectorySnapshotManager {
    async fn checkpoint(&self) -> Result<Snapshot> {
        if !tokio::fs::metadata(&self.root).await.is_ok_and(|m| m.is_dir()) {
            return Err(MenderError::SnapshotError(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }
        let mut snapshot = Snapshot::new(serde_json::Value::Null);
        let backup = self.backup_root.join(&snapshot.id);
        let (root, to, exclude) = (self.root.clone(), backup.clone(), self.exclude.clone());
        blocking(move || copy_tree(&root, &to, &exclude), MenderError::SnapshotError).await?;

        snapshot = Snapshot {
            data: json!({ "backup": backup }),
            ..snapshot
        };
        tracing::info!(backup = %backup.display(), "Directory snapshot created");
        Ok(snapshot)
    }

    async fn commit(&self, snapshot: &mut Snapshot) -> Result<()> {
        if !snapshot.ensure_committable()? {
            return Ok(());
        }
        if let Some(backup) = Self::backup_dir(snapshot) {
            if tokio::fs::try_exists(&backup).await.unwrap_or(false) {
                tokio::fs::remove_dir_all(&backup)
                    .await
                    .map_err(|e| MenderError::SnapshotError(e.to_string()))?;
            }
        }
        snapshot.mark_committed();
        Ok(())
    }

    async fn restore(&self, snapshot: &mut Snapshot) -> Result<()> {
        snapshot.ensure_restorable()?;
        let backup = Self::backup_dir(snapshot)
            .ok_or_else(|| MenderError::RestoreError("snapshot has no backup path".into()))?;
        if !tokio::fs::try_exists(&backup).await.unwrap_or(false) {
            return Err(MenderError::RestoreError(format!(
                "backup {} is missing",
                backup.display()
            )));
        }

        let (root, from, exclude) = (self.root.clone(), backup.clone(), self.exclude.clone());
        blocking(move || restore_tree(&root, &from, &exclude), MenderError::RestoreError).await?;
        if let Err(e) = tokio::fs::remove_dir_all(&backup).await {
            tracing::warn!(backup = %backup.display(), error = %e, "Could not remove snapshot backup");
        }
        snapshot.mark_restored();
        tracing::info!(snapshot = %snapshot.id, "Directory snapshot restored");
        Ok(())
    }
}
