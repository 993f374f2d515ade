//! Single-instance advisory lock.
//!
//! Exactly one process may hold the lock file at a time. The lock is held
//! for as long as the [`InstanceLock`] lives and released when it drops,
//! which includes process exit on a signal (the kernel closes the fd).

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{MachinedError, Result};

/// An exclusively held lock file.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    file: File,
}

impl InstanceLock {
    /// Take the exclusive lock on `path`, creating the file if needed.
    ///
    /// Fails with [`MachinedError::LockError`] when another holder has it,
    /// or the file cannot be created or opened.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| MachinedError::lock(path, format!("create parent: {}", e)))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| MachinedError::lock(path, format!("open: {}", e)))?;

        file.try_lock_exclusive().map_err(|e| {
            if e.kind() == fs2::lock_contended_error().kind() {
                MachinedError::lock(path, "already held by another instance")
            } else {
                MachinedError::lock(path, e)
            }
        })?;

        tracing::debug!(path = %path.display(), "Instance lock acquired");

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Path of the held lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release instance lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("x.lock");

        let lock = InstanceLock::acquire(&path).unwrap();
        assert!(path.exists());
        assert_eq!(lock.path(), path.as_path());
    }

    #[test]
    fn test_second_acquire_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.lock");

        let _held = InstanceLock::acquire(&path).unwrap();
        let err = InstanceLock::acquire(&path).unwrap_err();
        assert!(matches!(err, MachinedError::LockError { .. }));
        assert!(err.to_string().contains("already held"));
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.lock");

        let first = InstanceLock::acquire(&path).unwrap();
        drop(first);

        assert!(InstanceLock::acquire(&path).is_ok());
    }

    #[test]
    fn test_existing_contents_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.lock");
        std::fs::write(&path, "12345\n").unwrap();

        let _lock = InstanceLock::acquire(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "12345\n");
    }

    #[test]
    fn test_concurrent_acquire_admits_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.lock");
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    let lock = InstanceLock::acquire(&path);
                    let won = lock.is_ok();
                    // Hold the winner until every contender has tried.
                    barrier.wait();
                    won
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_unwritable_location_is_lock_error() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file cannot be a parent directory.
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "").unwrap();

        let err = InstanceLock::acquire(blocker.join("x.lock")).unwrap_err();
        assert!(matches!(err, MachinedError::LockError { .. }));
    }
}
