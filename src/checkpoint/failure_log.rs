//! Append-only failure log (JSON Lines).
//!
//! Epistemic foundation:
//! - B_i: The last line may be torn by a crash → newline before the next append
//! - I^B: A logged failure may have since resolved → filtered by the done set

use super::DoneSet;
use crate::models::{EngineError, FailureRecord, InputItem, Result};
use serde_json::Value;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Failure records accumulated across runs.
pub struct FailureLog {
    path: PathBuf,
}

impl FailureLog {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// Append records and sync them to disk.
    pub fn append(&self, records: &[FailureRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| EngineError::io("creating failure log dir", e))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| EngineError::io("opening failure log", e))?;
        let torn = ends_mid_line(&mut file)
            .map_err(|e| EngineError::io("inspecting failure log tail", e))?;

        let mut writer = BufWriter::new(file);
        if torn {
            warn!(path = %self.path.display(), "Failure log ends mid-line, starting a new line");
            writeln!(writer).map_err(|e| EngineError::io("writing failure log", e))?;
        }
        for record in records {
            let line = serde_json::to_string(record)
                .map_err(|e| EngineError::Serialization(format!("failure record: {e}")))?;
            writeln!(writer, "{line}").map_err(|e| EngineError::io("writing failure log", e))?;
        }
        writer
            .flush()
            .map_err(|e| EngineError::io("flushing failure log", e))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| EngineError::io("syncing failure log", e))?;

        debug!(count = records.len(), "Failure log appended");
        Ok(())
    }

    /// Read every readable record. Corrupt lines are skipped with a warning.
    pub fn read_all(&self) -> Vec<FailureRecord> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failure log unreadable");
                return Vec::new();
            }
        };

        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .filter_map(|(idx, line)| match serde_json::from_str(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(line = idx + 1, error = %e, "Skipping corrupt failure log line");
                    None
                }
            })
            .collect()
    }

    /// Failed items not resolved since, first-seen order, one per identifier.
    pub fn unresolved_items(&self, done: &DoneSet) -> Vec<InputItem> {
        let mut seen = HashSet::new();
        self.read_all()
            .into_iter()
            .filter(|r| !done.contains(&r.identifier))
            .filter(|r| seen.insert(r.identifier.clone()))
            .map(|r| r.to_input())
            .collect()
    }

    /// Failed identifiers not resolved since, first-seen order.
    pub fn unresolved_ids(&self, done: &DoneSet) -> Vec<String> {
        self.unresolved_items(done)
            .into_iter()
            .map(|item| item.id)
            .collect()
    }

    /// Write unresolved items to `output` as a JSON array accepted by
    /// `load_input`. Returns how many were written.
    pub fn export_unresolved(&self, done: &DoneSet, output: &Path) -> Result<usize> {
        let values: Vec<Value> = self
            .unresolved_items(done)
            .iter()
            .map(InputItem::to_value)
            .collect();

        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| EngineError::io("creating export dir", e))?;
        }
        let content = serde_json::to_string_pretty(&values)
            .map_err(|e| EngineError::Serialization(format!("failure export: {e}")))?;
        fs::write(output, content).map_err(|e| EngineError::io("writing failure export", e))?;

        info!(count = values.len(), path = %output.display(), "Exported unresolved failures");
        Ok(values.len())
    }
}

/// Whether the file is non-empty and its last byte is not a newline.
fn ends_mid_line(file: &mut File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FailureStage, ResolveError, load_input};
    use tempfile::TempDir;

    fn record(id: &str) -> FailureRecord {
        FailureRecord::new(
            &InputItem::slug(id),
            FailureStage::SearchFailed,
            &ResolveError::UpstreamStatus { status: 500 },
            3,
            0,
        )
    }

    #[test]
    fn test_append_across_runs() {
        let temp_dir = TempDir::new().unwrap();
        let log = FailureLog::new(&temp_dir.path().join("nested").join("failures.jsonl"));

        log.append(&[record("a"), record("b")]).unwrap();
        log.append(&[record("c")]).unwrap();

        let ids: Vec<_> = log.read_all().into_iter().map(|r| r.identifier).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_corrupt_lines_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("failures.jsonl");
        let log = FailureLog::new(&path);
        log.append(&[record("a")]).unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{ truncated").unwrap();
        drop(file);
        log.append(&[record("b")]).unwrap();

        assert_eq!(log.read_all().len(), 2);
    }

    #[test]
    fn test_torn_tail_does_not_swallow_next_record() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("failures.jsonl");
        let log = FailureLog::new(&path);
        log.append(&[record("a")]).unwrap();

        // Crash mid-write: partial line, no trailing newline
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "{{\"identifier\":\"b\",\"rea").unwrap();
        drop(file);

        log.append(&[record("c")]).unwrap();
        log.append(&[record("d")]).unwrap();

        let ids: Vec<_> = log.read_all().into_iter().map(|r| r.identifier).collect();
        assert_eq!(ids, vec!["a", "c", "d"]);
    }

    #[test]
    fn test_unresolved_ids_excludes_done_and_duplicates() {
        let temp_dir = TempDir::new().unwrap();
        let log = FailureLog::new(&temp_dir.path().join("failures.jsonl"));
        log.append(&[record("a"), record("b")]).unwrap();
        log.append(&[record("a"), record("c")]).unwrap();

        let done: DoneSet = ["b".to_string()].into_iter().collect();
        assert_eq!(log.unresolved_ids(&done), vec!["a", "c"]);
    }

    #[test]
    fn test_export_keeps_titles_for_retry() {
        let temp_dir = TempDir::new().unwrap();
        let log = FailureLog::new(&temp_dir.path().join("failures.jsonl"));
        let titled = InputItem::titled("101", "My Love");
        let failure = FailureRecord::new(
            &titled,
            FailureStage::DetailsFailed,
            &ResolveError::UpstreamStatus { status: 502 },
            3,
            1,
        )
        .with_matched_key(Some("101-my-love".into()));
        log.append(&[record("a"), failure, record("done")]).unwrap();

        let done: DoneSet = ["done".to_string()].into_iter().collect();
        let output = temp_dir.path().join("retry").join("input.json");
        assert_eq!(log.export_unresolved(&done, &output).unwrap(), 2);

        let reloaded = load_input(&output).unwrap();
        assert_eq!(reloaded, vec![InputItem::slug("a"), titled]);
        assert_eq!(
            log.read_all()[1].matched_key.as_deref(),
            Some("101-my-love")
        );
    }

    #[test]
    fn test_missing_log_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let log = FailureLog::new(&temp_dir.path().join("none.jsonl"));
        assert!(log.read_all().is_empty());
    }
}
