//! Batch runner: the engine's state machine.
//!
//! ```text
//! Idle → Loading → Planning → Processing → Committing → Done | Aborted
//!                     ↑                          │
//!                     └──── (max_batches > 1) ───┘
//! ```
//!
//! Commit order per batch:
//! 1. output artifact (temp file + rename)
//! 2. failure log append
//! 3. checkpoint (done set + advanced cursor)
//! 4. journal entry removed
//!
//! A crash anywhere before step 3 leaves the cursor where it was, so the
//! batch is planned again on restart and rewrites the same artifact.
//!
//! Epistemic foundation:
//! - K_i: The cursor only advances after outputs are durable
//! - K_i: Items in the done set are never requested again
//! - B_i: A run may stop at any point → Aborted with a reason, never a panic
//! - I^R: Interrupted batches are re-derived from the unchanged cursor

use crate::checkpoint::{BatchJournal, CheckpointStore, DoneSet, FailureLog, NamespaceLock};
use crate::client::{Lookup, Resolver};
use crate::models::{
    BatchReport, EngineConfig, EngineError, FailureRecord, InputItem, ResolvedRecord, Result,
    RunReport, load_input,
};
use crate::planner::{BatchPlan, BatchPlanner, Plan};
use crate::pool::{ResolverPool, ShutdownSignal};
use crate::retry::{Outcome, RetryPolicy};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Runner lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Loading,
    Planning,
    Processing,
    Committing,
    Done,
    Aborted,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Aborted)
    }
}

/// Why a run stopped before reaching `Done`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// Input collection or configuration unusable
    FatalInput(String),
    /// Durable state could not be written
    Persistence(String),
    /// Shutdown requested mid-run
    Cancelled,
    Internal(String),
}

impl From<&EngineError> for AbortReason {
    fn from(err: &EngineError) -> Self {
        match err {
            EngineError::Cancelled => AbortReason::Cancelled,
            EngineError::FatalInput { .. } | EngineError::Config(_) => {
                AbortReason::FatalInput(err.to_string())
            }
            e if e.is_persistence() => AbortReason::Persistence(e.to_string()),
            e => AbortReason::Internal(e.to_string()),
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::FatalInput(msg) => write!(f, "fatal input: {msg}"),
            AbortReason::Persistence(msg) => write!(f, "persistence failure: {msg}"),
            AbortReason::Cancelled => write!(f, "cancelled"),
            AbortReason::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

/// Terminal result of [`BatchRunner::run`].
#[derive(Debug)]
pub enum RunOutcome {
    Done(RunReport),
    /// Batches committed before the abort are listed in `report`
    Aborted {
        reason: AbortReason,
        report: RunReport,
    },
}

impl RunOutcome {
    pub fn report(&self) -> &RunReport {
        match self {
            RunOutcome::Done(report) | RunOutcome::Aborted { report, .. } => report,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, RunOutcome::Done(_))
    }
}

/// Settled contents of one batch, ready to commit.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub records: Vec<ResolvedRecord>,
    pub failures: Vec<FailureRecord>,
    /// Identifiers resolved in this batch
    pub resolved_ids: Vec<String>,
    pub skipped: usize,
    pub attempts: u64,
}

pub struct BatchRunner {
    config: EngineConfig,
    planner: BatchPlanner,
    pool: ResolverPool,
    shutdown: ShutdownSignal,
    run_id: String,
    state: RunState,
}

impl BatchRunner {
    pub fn new(
        config: EngineConfig,
        resolver: Arc<dyn Resolver>,
        lookup: Lookup,
        shutdown: ShutdownSignal,
    ) -> Self {
        let planner = BatchPlanner::new(config.batch_size, config.max_total);
        let pool = ResolverPool::new(
            resolver,
            lookup,
            RetryPolicy::from(&config),
            config.workers,
            config.request_delay,
        );
        Self {
            config,
            planner,
            pool,
            shutdown,
            run_id: uuid::Uuid::new_v4().to_string(),
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, next: RunState) {
        debug!(from = ?self.state, to = ?next, "Runner state");
        self.state = next;
    }

    /// Run up to `max_batches` batches.
    ///
    /// Never panics or returns an error; failures surface as
    /// [`RunOutcome::Aborted`] with the batches committed so far.
    pub async fn run(&mut self) -> RunOutcome {
        let mut report = RunReport {
            run_id: self.run_id.clone(),
            ..Default::default()
        };

        info!(
            run_id = %self.run_id,
            batch_size = self.config.batch_size,
            workers = self.pool.workers(),
            max_batches = self.config.max_batches,
            "Starting run"
        );

        match self.run_batches(&mut report).await {
            Ok(()) => {
                self.transition(RunState::Done);
                info!(
                    batches = report.batches.len(),
                    resolved = report.resolved(),
                    failed = report.failed(),
                    skipped = report.skipped(),
                    exhausted = report.exhausted,
                    "Run complete"
                );
                RunOutcome::Done(report)
            }
            Err(e) => {
                let reason = AbortReason::from(&e);
                self.transition(RunState::Aborted);
                match reason {
                    AbortReason::Cancelled => warn!("Run cancelled, no partial batch committed"),
                    _ => error!(error = %e, "Run aborted"),
                }
                RunOutcome::Aborted { reason, report }
            }
        }
    }

    async fn run_batches(&mut self, report: &mut RunReport) -> Result<()> {
        self.transition(RunState::Loading);
        let checkpoint_dir = self.config.checkpoint_dir.clone();
        let _lock = NamespaceLock::acquire(&checkpoint_dir, &self.run_id)?;

        report.recovered_batches = BatchJournal::recover(&checkpoint_dir)?.len();

        let items = load_input(&self.config.input_path)?;
        let mut store = CheckpointStore::new(&checkpoint_dir)?;
        let loaded = store.load();
        info!(
            items = items.len(),
            done = loaded.done.len(),
            last_index = loaded.cursor.last_index,
            "Loaded input and checkpoint"
        );
        let failure_log = FailureLog::new(&self.config.failure_log);

        for _ in 0..self.config.max_batches {
            self.shutdown.check()?;
            self.transition(RunState::Planning);

            let (plan, slice) = match self.planner.next_slice(&items, store.state().cursor) {
                Plan::Exhausted => {
                    info!("Nothing left to do");
                    report.exhausted = true;
                    return Ok(());
                }
                Plan::Slice { plan, items } => (plan, items),
            };

            let started = Instant::now();
            self.transition(RunState::Processing);
            let journal = BatchJournal::begin(
                &checkpoint_dir,
                &self.run_id,
                plan.batch_index,
                plan.start,
                plan.end,
            )?;
            let result = self.process(&plan, slice, &store.state().done).await?;

            self.transition(RunState::Committing);
            let artifact = self.commit(&plan, &result, &mut store, &failure_log)?;
            journal.finish()?;

            let batch = BatchReport {
                run_id: self.run_id.clone(),
                batch_index: plan.batch_index,
                start: plan.start,
                end: plan.end,
                slice_len: plan.len(),
                skipped: result.skipped,
                resolved: result.records.len(),
                failed: result.failures.len(),
                attempts: result.attempts,
                artifact,
                runtime_secs: started.elapsed().as_secs_f64(),
            };
            info!(
                batch_index = batch.batch_index,
                start = batch.start,
                end = batch.end,
                resolved = batch.resolved,
                failed = batch.failed,
                skipped = batch.skipped,
                runtime = format!("{:.1}s", batch.runtime_secs),
                "Batch committed"
            );
            report.batches.push(batch);
        }

        // Budget spent; report whether anything remains.
        report.exhausted = matches!(
            self.planner.next_slice(&items, store.state().cursor),
            Plan::Exhausted
        );
        Ok(())
    }

    /// Resolve every item of the slice not already in `done`.
    async fn process(
        &self,
        plan: &BatchPlan,
        slice: &[InputItem],
        done: &DoneSet,
    ) -> Result<BatchResult> {
        let mut queued = HashSet::new();
        let pending: Vec<InputItem> = slice
            .iter()
            .filter(|item| !done.contains(&item.id) && queued.insert(item.id.as_str()))
            .cloned()
            .collect();
        let skipped = slice.len() - pending.len();
        if skipped > 0 {
            debug!(skipped, "Skipping items already done");
        }

        let pb = self.progress_bar(pending.len() as u64, plan);
        let outcomes = self.pool.resolve_all(pending, &self.shutdown, &pb).await;
        pb.finish_and_clear();
        let outcomes = outcomes?;

        let mut result = BatchResult {
            skipped,
            ..Default::default()
        };
        for (item, outcome) in outcomes {
            result.attempts += u64::from(outcome.attempts());
            match outcome {
                Outcome::Success { record, .. } => {
                    result.records.push(record);
                    result.resolved_ids.push(item.id);
                }
                Outcome::Failure { error, attempts } => {
                    result.failures.push(
                        FailureRecord::new(
                            &item,
                            error.stage,
                            &error.error,
                            attempts,
                            plan.batch_index,
                        )
                        .with_matched_key(error.matched_key),
                    );
                }
            }
        }
        Ok(result)
    }

    fn progress_bar(&self, len: u64, plan: &BatchPlan) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len);
        if let Ok(style) = ProgressStyle::with_template(
            "[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}",
        ) {
            pb.set_style(style.progress_chars("##-"));
        }
        pb.set_message(format!("batch {} [{}..{})", plan.batch_index, plan.start, plan.end));
        pb
    }

    /// Persist one settled batch in crash-safe order.
    fn commit(
        &self,
        plan: &BatchPlan,
        result: &BatchResult,
        store: &mut CheckpointStore,
        failure_log: &FailureLog,
    ) -> Result<Option<PathBuf>> {
        let artifact = if result.records.is_empty() {
            None
        } else {
            Some(write_artifact(&self.config.output_dir, plan, &result.records)?)
        };

        failure_log.append(&result.failures)?;

        let newly_done: DoneSet = result.resolved_ids.iter().cloned().collect();
        store.commit(&newly_done, plan.completed_cursor())?;
        Ok(artifact)
    }
}

/// Write the batch's records to `output_dir/batch_{start}-{end}.json`.
///
/// Re-running the same batch replaces the file with identical content.
pub fn write_artifact(
    output_dir: &Path,
    plan: &BatchPlan,
    records: &[ResolvedRecord],
) -> Result<PathBuf> {
    fs::create_dir_all(output_dir).map_err(|e| EngineError::io("creating output dir", e))?;
    let path = output_dir.join(plan.artifact_name());
    let temp_path = output_dir.join(format!(".{}.tmp", plan.artifact_name()));

    {
        let file =
            File::create(&temp_path).map_err(|e| EngineError::io("creating temp artifact", e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, records)
            .map_err(|e| EngineError::Serialization(format!("batch artifact: {e}")))?;
        writer
            .flush()
            .map_err(|e| EngineError::io("flushing temp artifact", e))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| EngineError::io("syncing temp artifact", e))?;
    }

    fs::rename(&temp_path, &path).map_err(|e| EngineError::io("renaming artifact", e))?;
    debug!(path = %path.display(), records = records.len(), "Artifact written");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConfigError;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_abort_reason_mapping() {
        assert_eq!(AbortReason::from(&EngineError::Cancelled), AbortReason::Cancelled);
        assert!(matches!(
            AbortReason::from(&EngineError::fatal_input("in.json", "missing")),
            AbortReason::FatalInput(_)
        ));
        assert!(matches!(
            AbortReason::from(&EngineError::Config(ConfigError::Invalid("x".into()))),
            AbortReason::FatalInput(_)
        ));
        assert!(matches!(
            AbortReason::from(&EngineError::io(
                "writing",
                std::io::Error::other("disk full")
            )),
            AbortReason::Persistence(_)
        ));
        assert!(matches!(
            AbortReason::from(&EngineError::Internal("boom".into())),
            AbortReason::Internal(_)
        ));
    }

    #[test]
    fn test_write_artifact_replaces_atomically() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("output");
        let plan = BatchPlan {
            batch_index: 0,
            start: 0,
            end: 3,
        };
        let records = vec![ResolvedRecord(json!({"slug": "a"})), ResolvedRecord(json!({"slug": "b"}))];

        let first = write_artifact(&out, &plan, &records).unwrap();
        let first_bytes = fs::read(&first).unwrap();
        let second = write_artifact(&out, &plan, &records).unwrap();

        assert_eq!(first, out.join("batch_0-3.json"));
        assert_eq!(first, second);
        assert_eq!(fs::read(&second).unwrap(), first_bytes);
        assert!(!out.join(".batch_0-3.json.tmp").exists());

        let parsed: Vec<serde_json::Value> = serde_json::from_slice(&first_bytes).unwrap();
        assert_eq!(parsed, vec![json!({"slug": "a"}), json!({"slug": "b"})]);
    }

    #[test]
    fn test_terminal_states() {
        assert!(RunState::Done.is_terminal());
        assert!(RunState::Aborted.is_terminal());
        assert!(!RunState::Committing.is_terminal());
        assert!(!RunState::Idle.is_terminal());
    }
}
