//! Run-scoped exclusive lock: one validation run per repository at a time.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use mender_types::{MenderError, Result};
use sha2::{Digest, Sha256};

/// Held for the lifetime of a run; released on drop.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Take the lock for `repo` without waiting.
    ///
    /// The lock file lives in `lock_dir`, outside the working tree, so a
    /// snapshot restore never touches it.
    pub fn acquire(lock_dir: &Path, repo: &Path) -> Result<Self> {
        let canonical = repo.canonicalize().unwrap_or_else(|_| repo.to_path_buf());
        std::fs::create_dir_all(lock_dir)?;
        let path = lock_dir.join(lock_file_name(&canonical));

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        if let Err(err) = FileExt::try_lock_exclusive(&file) {
            let contended = err.kind() == ErrorKind::WouldBlock
                || err.raw_os_error() == fs2::lock_contended_error().raw_os_error();
            if contended {
                tracing::warn!(repo = %canonical.display(), lock = %path.display(), "Validation run already in progress");
                return Err(MenderError::ConcurrentRun {
                    repo: canonical.display().to_string(),
                });
            }
            return Err(err.into());
        }

        // Diagnostic only; the flock is what matters.
        let _ = file.set_len(0);
        let _ = writeln!(file, "pid={} repo={}", std::process::id(), canonical.display());

        tracing::debug!(lock = %path.display(), "Run lock acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Stable across builds: every mender binary picks the same file for a repo.
fn lock_file_name(repo: &Path) -> String {
    let digest = Sha256::digest(repo.as_os_str().as_encoded_bytes());
    let hex = format!("{:x}", digest);
    format!("mender-{}.lock", &hex[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_fast() {
        let locks = tempfile::tempdir().unwrap();
        let repo = tempfile::tempdir().unwrap();
        let first = RunLock::acquire(locks.path(), repo.path()).unwrap();
        let err = RunLock::acquire(locks.path(), repo.path()).unwrap_err();
        assert!(matches!(err, MenderError::ConcurrentRun { .. }));
        assert!(err.is_fatal());
        drop(first);
        assert!(RunLock::acquire(locks.path(), repo.path()).is_ok());
    }

    #[test]
    fn lock_file_name_is_a_fixed_digest_of_the_path() {
        assert_eq!(lock_file_name(Path::new("/srv/repo")), "mender-203fce37fbfc82f3.lock");
        assert_ne!(
            lock_file_name(Path::new("/srv/repo")),
            lock_file_name(Path::new("/srv/other"))
        );
    }

    #[test]
    fn different_repos_do_not_contend() {
        let locks = tempfile::tempdir().unwrap();
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let _la = RunLock::acquire(locks.path(), a.path()).unwrap();
        let lb = RunLock::acquire(locks.path(), b.path()).unwrap();
        assert!(lb.path().starts_with(locks.path()));
    }
}
