//! Checkpoint store: the persisted (done set, cursor) pair.
//!
//! - State is written atomically (backup, write temp, rename).
//! - A missing or corrupt checkpoint never fails a run; it degrades to the
//!   backup and then to empty state, with a warning.
//! - Commits are monotonic: the done set only grows, the cursor never moves
//!   back.
//!
//! Epistemic foundation:
//! - K_i: The done set and cursor are written together, or not at all
//! - B_i: Checkpoint file may not exist yet → empty state
//! - I^B: Crash during write → backup file provides recovery

use crate::models::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Identifiers with a confirmed successful resolution. Serialized sorted.
pub type DoneSet = BTreeSet<String>;

/// How far the planner has advanced through the input collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cursor {
    /// Index of the first item not yet covered by a committed batch
    pub last_index: usize,
    /// Number of committed batches
    pub batch_index: u64,
}

impl Cursor {
    pub fn new(last_index: usize, batch_index: u64) -> Self {
        Self {
            last_index,
            batch_index,
        }
    }
}

/// Persisted checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub done: DoneSet,
    pub cursor: Cursor,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Durable home of the checkpoint for one namespace directory.
pub struct CheckpointStore {
    /// Directory for checkpoint files
    dir: PathBuf,
    /// Path to main checkpoint file
    checkpoint_path: PathBuf,
    /// Path to backup file
    backup_path: PathBuf,
    /// Last state loaded or committed
    committed: CheckpointState,
}

impl CheckpointStore {
    /// Open a checkpoint namespace, creating the directory if needed.
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| EngineError::io("creating checkpoint dir", e))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            checkpoint_path: dir.join("checkpoint.json"),
            backup_path: dir.join("checkpoint.backup.json"),
            committed: CheckpointState::default(),
        })
    }

    /// Check if a checkpoint exists.
    pub fn exists(&self) -> bool {
        self.checkpoint_path.exists()
    }

    /// Load persisted state, falling back to backup and then to empty state.
    pub fn load(&mut self) -> CheckpointState {
        let state = match Self::read_state(&self.checkpoint_path) {
            Ok(Some(state)) => state,
            Ok(None) => {
                debug!(path = %self.checkpoint_path.display(), "No checkpoint, starting fresh");
                CheckpointState::default()
            }
            Err(reason) => {
                warn!(
                    path = %self.checkpoint_path.display(),
                    reason = %reason,
                    "Checkpoint is corrupt, trying backup"
                );
                match Self::read_state(&self.backup_path) {
                    Ok(Some(state)) => state,
                    Ok(None) => {
                        warn!("No checkpoint backup, restarting from zero");
                        CheckpointState::default()
                    }
                    Err(reason) => {
                        warn!(reason = %reason, "Checkpoint backup is corrupt, restarting from zero");
                        CheckpointState::default()
                    }
                }
            }
        };

        info!(
            done = state.done.len(),
            last_index = state.cursor.last_index,
            batch_index = state.cursor.batch_index,
            "Checkpoint loaded"
        );
        self.committed = state.clone();
        state
    }

    /// `Ok(None)` when absent, `Err(reason)` when unreadable.
    fn read_state(path: &Path) -> std::result::Result<Option<CheckpointState>, String> {
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(path).map_err(|e| e.to_string())?;
        serde_json::from_reader(BufReader::new(file))
            .map(Some)
            .map_err(|e| e.to_string())
    }

    /// Persist the merged state atomically.
    ///
    /// The done set is unioned with what is already committed and the cursor
    /// is never allowed below the committed one.
    pub fn commit(&mut self, done: &DoneSet, cursor: Cursor) -> Result<&CheckpointState> {
        let mut next = self.committed.clone();
        next.done.extend(done.iter().cloned());
        if cursor < next.cursor {
            warn!(
                requested = cursor.last_index,
                committed = next.cursor.last_index,
                "Refusing to move cursor backwards"
            );
        } else {
            next.cursor = cursor;
        }
        next.updated_at = Some(Utc::now());

        self.write_atomic(&next)?;
        self.committed = next;

        debug!(
            done = self.committed.done.len(),
            last_index = self.committed.cursor.last_index,
            "Checkpoint committed"
        );
        Ok(&self.committed)
    }

    fn write_atomic(&self, state: &CheckpointState) -> Result<()> {
        // Backup existing checkpoint
        if self.checkpoint_path.exists() {
            fs::copy(&self.checkpoint_path, &self.backup_path)
                .map_err(|e| EngineError::io("backing up checkpoint", e))?;
        }

        let temp_path = self.dir.join("checkpoint.tmp.json");
        {
            let file = File::create(&temp_path)
                .map_err(|e| EngineError::io("creating temp checkpoint", e))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, state)
                .map_err(|e| EngineError::Serialization(format!("checkpoint: {e}")))?;
            writer
                .flush()
                .map_err(|e| EngineError::io("flushing temp checkpoint", e))?;
            writer
                .get_ref()
                .sync_all()
                .map_err(|e| EngineError::io("syncing temp checkpoint", e))?;
        }

        fs::rename(&temp_path, &self.checkpoint_path)
            .map_err(|e| EngineError::io("renaming checkpoint", e))?;
        Ok(())
    }

    /// Last loaded or committed state.
    pub fn state(&self) -> &CheckpointState {
        &self.committed
    }
}
