//! The lookup capability the engine depends on.

use crate::models::ResolveError;
use async_trait::async_trait;
use serde_json::Value;

/// Remote lookup service.
///
/// The engine never sees the wire format: it only searches, picks a
/// canonical match (see `Lookup`), and optionally fetches its detail record.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Run a search and return the raw response body.
    async fn search(&self, query: &str) -> Result<Value, ResolveError>;

    /// Fetch the full record for a matched key.
    async fn fetch_detail(&self, key: &str) -> Result<Value, ResolveError>;
}

