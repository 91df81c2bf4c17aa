//! Worker pool resolving the pending items of one batch.
//!
//! - One worker: items are resolved sequentially, in input order.
//! - N workers: N request streams pull the next index from a shared
//!   counter. Each stream waits `request_delay` between its own requests,
//!   so the per-stream politeness contract is kept.
//!
//! Outcomes are always returned in input order. The pool never touches the
//! done set; the runner applies outcomes after the whole batch settles.

use super::ShutdownSignal;
use crate::client::{Lookup, Resolver};
use crate::models::{EngineError, InputItem, Result};
use crate::retry::{Outcome, RetryPolicy};
use indicatif::ProgressBar;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

pub struct ResolverPool {
    resolver: Arc<dyn Resolver>,
    lookup: Arc<Lookup>,
    policy: RetryPolicy,
    /// Number of request streams
    workers: usize,
    /// Delay between consecutive requests of one stream
    request_delay: Duration,
}

impl ResolverPool {
    pub fn new(
        resolver: Arc<dyn Resolver>,
        lookup: Lookup,
        policy: RetryPolicy,
        workers: usize,
        request_delay: Duration,
    ) -> Self {
        Self {
            resolver,
            lookup: Arc::new(lookup),
            policy,
            workers: workers.max(1),
            request_delay,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Resolve every item, returning outcomes in input order.
    ///
    /// Returns `Err(Cancelled)` if shutdown is requested before all items
    /// settle; partial outcomes are discarded.
    pub async fn resolve_all(
        &self,
        items: Vec<InputItem>,
        shutdown: &ShutdownSignal,
        progress: &ProgressBar,
    ) -> Result<Vec<(InputItem, Outcome)>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        if self.workers == 1 || items.len() == 1 {
            return self.resolve_sequential(items, shutdown, progress).await;
        }
        self.resolve_parallel(items, shutdown, progress).await
    }

    async fn resolve_sequential(
        &self,
        items: Vec<InputItem>,
        shutdown: &ShutdownSignal,
        progress: &ProgressBar,
    ) -> Result<Vec<(InputItem, Outcome)>> {
        let lookup: &Lookup = &self.lookup;
        let resolver: &dyn Resolver = self.resolver.as_ref();
        let mut outcomes = Vec::with_capacity(items.len());

        for (idx, item) in items.into_iter().enumerate() {
            if idx > 0 {
                shutdown.sleep(self.request_delay).await?;
            }
            let item_ref = &item;
            let outcome = self
                .policy
                .resolve(shutdown, move || lookup.attempt(resolver, item_ref))
                .await?;
            log_outcome(&item, &outcome);
            progress.inc(1);
            outcomes.push((item, outcome));
        }

        Ok(outcomes)
    }

    async fn resolve_parallel(
        &self,
        items: Vec<InputItem>,
        shutdown: &ShutdownSignal,
        progress: &ProgressBar,
    ) -> Result<Vec<(InputItem, Outcome)>> {
        let items = Arc::new(items);
        let next = Arc::new(AtomicUsize::new(0));
        let streams = self.workers.min(items.len());
        let mut handles = Vec::with_capacity(streams);

        for stream in 0..streams {
            let items = Arc::clone(&items);
            let next = Arc::clone(&next);
            let resolver = Arc::clone(&self.resolver);
            let lookup = Arc::clone(&self.lookup);
            let policy = self.policy;
            let delay = self.request_delay;
            let shutdown = shutdown.clone();
            let progress = progress.clone();

            handles.push(tokio::spawn(async move {
                let lookup: &Lookup = &lookup;
                let resolver: &dyn Resolver = resolver.as_ref();
                let mut settled = Vec::new();

                loop {
                    let idx = next.fetch_add(1, Ordering::SeqCst);
                    let Some(item) = items.get(idx) else {
                        break;
                    };
                    if !settled.is_empty() {
                        shutdown.sleep(delay).await?;
                    }
                    let outcome = policy
                        .resolve(&shutdown, move || lookup.attempt(resolver, item))
                        .await?;
                    log_outcome(item, &outcome);
                    progress.inc(1);
                    settled.push((idx, outcome));
                }

                debug!(stream, resolved = settled.len(), "Worker stream finished");
                Ok::<_, EngineError>(settled)
            }));
        }

        let mut indexed = Vec::with_capacity(items.len());
        let mut failure = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(settled)) => indexed.extend(settled),
                Ok(Err(e)) => {
                    shutdown.trigger();
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    warn!(error = %e, "Worker task panicked");
                    shutdown.trigger();
                    failure.get_or_insert(EngineError::Internal(format!("worker task failed: {e}")));
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        indexed.sort_by_key(|(idx, _)| *idx);
        Ok(indexed
            .into_iter()
            .map(|(idx, outcome)| (items[idx].clone(), outcome))
            .collect())
    }
}

fn log_outcome(item: &InputItem, outcome: &Outcome) {
    match outcome {
        Outcome::Success { attempts, .. } => {
            debug!(id = %item.id, attempts, "Resolved");
        }
        Outcome::Failure { error, attempts } => {
            warn!(id = %item.id, attempts, error = %error, "Resolution failed");
        }
    }
}
