//! Write-ahead batch journal.
//!
//! A pending entry is written when a batch starts processing and removed
//! once its checkpoint is committed. An entry found at startup means the
//! previous run stopped mid-batch; the cursor was not advanced, so the batch
//! is simply planned again.
//!
//! Epistemic foundation:
//! - K_i: A pending entry exists exactly while a batch is uncommitted
//! - I^R: Entries left behind are counted as recovered batches

use crate::models::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Journal entry persisted to disk for recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub run_id: String,
    pub batch_index: u64,
    pub start: usize,
    pub end: usize,
    pub started_at: DateTime<Utc>,
}

/// Intent record for one in-flight batch.
pub struct BatchJournal {
    entry: JournalEntry,
    pending_path: PathBuf,
    finished: bool,
}

impl BatchJournal {
    fn journal_dir(checkpoint_dir: &Path) -> PathBuf {
        checkpoint_dir.join("journal")
    }

    /// Record that a batch is about to be processed.
    pub fn begin(
        checkpoint_dir: &Path,
        run_id: &str,
        batch_index: u64,
        start: usize,
        end: usize,
    ) -> Result<Self> {
        let dir = Self::journal_dir(checkpoint_dir);
        fs::create_dir_all(&dir).map_err(|e| EngineError::io("creating journal dir", e))?;

        let entry = JournalEntry {
            run_id: run_id.to_string(),
            batch_index,
            start,
            end,
            started_at: Utc::now(),
        };
        let pending_path = dir.join(format!("batch_{batch_index}_{run_id}.pending.json"));

        let content = serde_json::to_string_pretty(&entry)
            .map_err(|e| EngineError::Serialization(format!("journal entry: {e}")))?;
        fs::write(&pending_path, content)
            .map_err(|e| EngineError::io("writing journal entry", e))?;

        debug!(batch_index, start, end, "Batch journal opened");
        Ok(Self {
            entry,
            pending_path,
            finished: false,
        })
    }

    /// Find entries left by interrupted runs and clear them.
    pub fn recover(checkpoint_dir: &Path) -> Result<Vec<JournalEntry>> {
        let pattern = Self::journal_dir(checkpoint_dir).join("batch_*.pending.json");
        let pattern_str = pattern.to_string_lossy();

        let pending_files: Vec<_> = glob::glob(&pattern_str)
            .map_err(|e| EngineError::Internal(format!("Invalid glob pattern: {e}")))?
            .filter_map(|r| r.ok())
            .collect();

        let mut recovered = Vec::new();
        for path in pending_files {
            match fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|c| serde_json::from_str::<JournalEntry>(&c).map_err(|e| e.to_string()))
            {
                Ok(entry) => {
                    warn!(
                        run_id = %entry.run_id,
                        batch_index = entry.batch_index,
                        start = entry.start,
                        end = entry.end,
                        "Previous run stopped mid-batch, batch will be re-derived"
                    );
                    recovered.push(entry);
                }
                Err(reason) => {
                    warn!(path = %path.display(), reason = %reason, "Unreadable journal entry");
                }
            }

            fs::remove_file(&path).map_err(|e| EngineError::io("removing journal entry", e))?;
        }

        recovered.sort_by_key(|e| (e.batch_index, e.started_at));
        Ok(recovered)
    }

    /// Close the entry after the checkpoint commit.
    pub fn finish(mut self) -> Result<()> {
        if self.pending_path.exists() {
            fs::remove_file(&self.pending_path)
                .map_err(|e| EngineError::io("removing journal entry", e))?;
        }
        self.finished = true;
        debug!(batch_index = self.entry.batch_index, "Batch journal closed");
        Ok(())
    }
}

impl Drop for BatchJournal {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                batch_index = self.entry.batch_index,
                "Batch left uncommitted - will be re-derived on restart"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_finished_journal_leaves_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let journal = BatchJournal::begin(temp_dir.path(), "run1", 0, 0, 3).unwrap();
        journal.finish().unwrap();

        assert!(BatchJournal::recover(temp_dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_dropped_journal_is_recovered_once() {
        let temp_dir = TempDir::new().unwrap();
        {
            let _journal = BatchJournal::begin(temp_dir.path(), "run1", 2, 6, 9).unwrap();
        }

        let recovered = BatchJournal::recover(temp_dir.path()).unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].batch_index, 2);
        assert_eq!((recovered[0].start, recovered[0].end), (6, 9));

        assert!(BatchJournal::recover(temp_dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_unreadable_entry_is_cleared() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("journal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("batch_0_x.pending.json");
        fs::write(&path, "garbage").unwrap();

        assert!(BatchJournal::recover(temp_dir.path()).unwrap().is_empty());
        assert!(!path.exists());
    }
}
