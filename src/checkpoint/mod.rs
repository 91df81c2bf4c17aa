//! Durable state for resumable runs.
//!
//! Provides:
//! - `CheckpointStore`: done set + cursor, committed atomically
//! - `FailureLog`: append-only record of failed identifiers
//! - `BatchJournal`: write-ahead marker for in-flight batches
//! - `NamespaceLock`: single-writer guard per checkpoint directory

mod failure_log;
mod journal;
mod lock;
mod store;

pub use failure_log::*;
pub use journal::*;
pub use lock::*;
pub use store::*;
