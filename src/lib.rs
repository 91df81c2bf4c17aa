//! batchwise - resumable batch resolution of identifiers against a remote lookup API.
//!
//! ## Architecture
//!
//! - **Checkpoint Store**: done set + cursor, committed atomically
//! - **Batch Planner**: next contiguous slice of the input collection
//! - **Retry Controller**: bounded attempts with a fixed delay
//! - **Resolver Pool**: one or more polite request streams
//! - **Batch Runner**: `Idle → Loading → Planning → Processing → Committing → Done | Aborted`
//!
//! ## Durability
//!
//! Output artifacts and the failure log are written before the checkpoint
//! advances. A crash mid-commit re-derives the same batch on restart; it never
//! loses results or skips items.

pub mod checkpoint;
pub mod client;
pub mod models;
pub mod planner;
pub mod pool;
pub mod retry;
pub mod runner;

// Re-exports for convenience
pub use checkpoint::{CheckpointState, CheckpointStore, Cursor, DoneSet, FailureLog};
pub use client::{HttpResolver, Lookup, RateLimiter, Resolver};
pub use models::{Config, EngineConfig, EngineError, InputItem, ResolveError, Result, RunReport};
pub use planner::{BatchPlan, BatchPlanner, Plan};
pub use pool::{ResolverPool, ShutdownSignal};
pub use retry::{Outcome, RetryPolicy};
pub use runner::{AbortReason, BatchRunner, RunOutcome, RunState};
