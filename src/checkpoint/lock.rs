//! Advisory lock guarding a checkpoint namespace against concurrent runs.

use crate::models::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const LOCK_FILE: &str = ".lock";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockOwner {
    pub pid: u32,
    pub run_id: String,
    pub acquired_at: chrono::DateTime<chrono::Utc>,
}

/// Held for the lifetime of a run; released on drop.
#[derive(Debug)]
pub struct NamespaceLock {
    path: PathBuf,
}

impl NamespaceLock {
    /// Take the lock or fail with `CheckpointLocked`.
    pub fn acquire(checkpoint_dir: &Path, run_id: &str) -> Result<Self> {
        Self::acquire_with(checkpoint_dir, run_id, Self::write_owner)
    }

    /// Create the lock file, then record the owner with `write`. The file is
    /// removed again if `write` fails.
    fn acquire_with<W>(checkpoint_dir: &Path, run_id: &str, write: W) -> Result<Self>
    where
        W: FnOnce(&mut File, &LockOwner) -> Result<()>,
    {
        fs::create_dir_all(checkpoint_dir)
            .map_err(|e| EngineError::io("creating checkpoint dir", e))?;
        let path = checkpoint_dir.join(LOCK_FILE);

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if let Some(owner) = Self::owner(checkpoint_dir) {
                    warn!(pid = owner.pid, run_id = %owner.run_id, "Checkpoint namespace is locked");
                }
                return Err(EngineError::CheckpointLocked(checkpoint_dir.to_path_buf()));
            }
            Err(e) => return Err(EngineError::io("creating lock file", e)),
        };

        let owner = LockOwner {
            pid: std::process::id(),
            run_id: run_id.to_string(),
            acquired_at: chrono::Utc::now(),
        };
        if let Err(e) = write(&mut file, &owner) {
            drop(file);
            if let Err(cleanup) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %cleanup, "Failed to remove half-written lock");
            }
            return Err(e);
        }

        debug!(path = %path.display(), "Checkpoint lock acquired");
        Ok(Self { path })
    }

    fn write_owner(file: &mut File, owner: &LockOwner) -> Result<()> {
        let content = serde_json::to_string(owner)
            .map_err(|e| EngineError::Serialization(format!("lock owner: {e}")))?;
        file.write_all(content.as_bytes())
            .map_err(|e| EngineError::io("writing lock file", e))
    }

    /// Current holder, if the lock file is readable.
    pub fn owner(checkpoint_dir: &Path) -> Option<LockOwner> {
        let content = fs::read_to_string(checkpoint_dir.join(LOCK_FILE)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Remove a stale lock left by a killed process. Returns whether one existed.
    pub fn force_release(checkpoint_dir: &Path) -> Result<bool> {
        match fs::remove_file(checkpoint_dir.join(LOCK_FILE)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(EngineError::io("removing lock file", e)),
        }
    }
}

impl Drop for NamespaceLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to release checkpoint lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_fails_until_release() {
        let temp_dir = TempDir::new().unwrap();
        let lock = NamespaceLock::acquire(temp_dir.path(), "a").unwrap();
        assert_eq!(NamespaceLock::owner(temp_dir.path()).unwrap().run_id, "a");

        assert!(matches!(
            NamespaceLock::acquire(temp_dir.path(), "b"),
            Err(EngineError::CheckpointLocked(_))
        ));

        drop(lock);
        assert!(NamespaceLock::acquire(temp_dir.path(), "b").is_ok());
    }

    #[test]
    fn test_failed_owner_write_leaves_no_lock() {
        let temp_dir = TempDir::new().unwrap();
        let result = NamespaceLock::acquire_with(temp_dir.path(), "a", |_, _| {
            Err(EngineError::io(
                "writing lock file",
                std::io::Error::other("disk full"),
            ))
        });

        assert!(matches!(result, Err(EngineError::Io { .. })));
        assert!(!temp_dir.path().join(LOCK_FILE).exists());
        assert!(NamespaceLock::acquire(temp_dir.path(), "b").is_ok());
    }

    #[test]
    fn test_force_release() {
        let temp_dir = TempDir::new().unwrap();
        let lock = NamespaceLock::acquire(temp_dir.path(), "a").unwrap();
        std::mem::forget(lock);

        assert!(NamespaceLock::force_release(temp_dir.path()).unwrap());
        assert!(!NamespaceLock::force_release(temp_dir.path()).unwrap());
    }
}
