//! One resolution attempt: item → query → canonical match → record.

use super::Resolver;
use crate::models::{FailureStage, InputItem, LookupSpec, QuerySource, ResolveError, ResolvedRecord};
use serde_json::Value;
use tracing::debug;

/// A failed attempt together with the step it failed at.
#[derive(Debug, Clone, PartialEq)]
pub struct StageError {
    pub stage: FailureStage,
    pub error: ResolveError,
    /// Key of the matched entry, once the search step has succeeded
    pub matched_key: Option<String>,
}

impl StageError {
    pub fn new(stage: FailureStage, error: ResolveError) -> Self {
        Self {
            stage,
            error,
            matched_key: None,
        }
    }

    pub fn with_key(mut self, key: &str) -> Self {
        self.matched_key = Some(key.to_string());
        self
    }
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.stage, self.error)
    }
}

/// Applies a `LookupSpec` to items.
#[derive(Debug, Clone, Default)]
pub struct Lookup {
    spec: LookupSpec,
}

impl Lookup {
    pub fn new(spec: LookupSpec) -> Self {
        Self { spec }
    }

    /// Search query for an item.
    pub fn query_for(&self, item: &InputItem) -> String {
        match self.spec.query_from {
            QuerySource::Slug => item.id.replace('-', " "),
            QuerySource::Title => {
                let title = item.title.as_deref().unwrap_or(&item.id);
                normalize_title(title)
            }
        }
    }

    /// Identity value a matching candidate must carry.
    pub fn expected_identity(&self, item: &InputItem) -> String {
        self.spec.identity_format.replace("{id}", &item.id)
    }

    /// Candidate whose identity field equals `expected`.
    pub fn find_match<'a>(&self, response: &'a Value, expected: &str) -> Option<&'a Value> {
        let candidates = if self.spec.results_pointer.is_empty() {
            Some(response)
        } else {
            response.pointer(&self.spec.results_pointer)
        }?;

        candidates.as_array()?.iter().find(|candidate| {
            match candidate.get(&self.spec.identity_field) {
                Some(Value::String(s)) => s == expected,
                Some(Value::Number(n)) => n.to_string() == expected,
                _ => false,
            }
        })
    }

    /// Run one attempt for `item` against `resolver`.
    pub async fn attempt<R: Resolver + ?Sized>(
        &self,
        resolver: &R,
        item: &InputItem,
    ) -> Result<ResolvedRecord, StageError> {
        let query = self.query_for(item);
        let response = resolver
            .search(&query)
            .await
            .map_err(|e| StageError::new(FailureStage::SearchFailed, e))?;

        let expected = self.expected_identity(item);
        let matched = self.find_match(&response, &expected).ok_or_else(|| {
            StageError::new(
                FailureStage::IdNotMatched,
                ResolveError::NoMatch {
                    expected: expected.clone(),
                },
            )
        })?;

        let Some(key_field) = &self.spec.detail_key_field else {
            return Ok(ResolvedRecord(matched.clone()));
        };

        let key = matched
            .get(key_field)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                StageError::new(
                    FailureStage::DetailsFailed,
                    ResolveError::InvalidResponse(format!(
                        "matched entry has no string field '{key_field}'"
                    )),
                )
            })?;
        debug!(id = %item.id, key = %key, "Matched, fetching detail");

        resolver
            .fetch_detail(key)
            .await
            .map(ResolvedRecord)
            .map_err(|e| StageError::new(FailureStage::DetailsFailed, e).with_key(key))
    }
}

/// Lowercase a title and replace spaces with dashes.
pub fn normalize_title(title: &str) -> String {
    title.to_lowercase().replace(' ', "-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct Fixed {
        search: Result<Value, ResolveError>,
        detail: Result<Value, ResolveError>,
    }

    #[async_trait]
    impl Resolver for Fixed {
        async fn search(&self, _query: &str) -> Result<Value, ResolveError> {
            self.search.clone()
        }

        async fn fetch_detail(&self, _key: &str) -> Result<Value, ResolveError> {
            self.detail.clone()
        }
    }

    fn id_lookup() -> Lookup {
        Lookup::new(LookupSpec {
            query_from: QuerySource::Title,
            results_pointer: "/results/dramas".into(),
            identity_field: "mdl_id".into(),
            identity_format: "mdl-{id}".into(),
            detail_key_field: Some("slug".into()),
        })
    }

    #[test]
    fn test_queries() {
        let slug = Lookup::default();
        assert_eq!(slug.query_for(&InputItem::slug("my-love-story")), "my love story");

        let by_title = id_lookup();
        assert_eq!(
            by_title.query_for(&InputItem::titled("42", "My Love Story")),
            "my-love-story"
        );
        assert_eq!(by_title.expected_identity(&InputItem::slug("42")), "mdl-42");
    }

    #[test]
    fn test_find_match_by_identity() {
        let lookup = Lookup::default();
        let response = json!([{"slug": "other"}, {"slug": "wanted", "title": "W"}]);
        let found = lookup.find_match(&response, "wanted").unwrap();
        assert_eq!(found["title"], "W");
        assert!(lookup.find_match(&response, "missing").is_none());
        assert!(lookup.find_match(&json!({"not": "array"}), "wanted").is_none());
    }

    #[tokio::test]
    async fn test_slug_attempt_returns_match() {
        let resolver = Fixed {
            search: Ok(json!([{"slug": "a-b", "rating": 9}])),
            detail: Err(ResolveError::Transport("unused".into())),
        };
        let record = Lookup::default()
            .attempt(&resolver, &InputItem::slug("a-b"))
            .await
            .unwrap();
        assert_eq!(record.0["rating"], 9);
    }

    #[tokio::test]
    async fn test_id_attempt_fetches_detail() {
        let resolver = Fixed {
            search: Ok(json!({"results": {"dramas": [{"mdl_id": "mdl-42", "slug": "42-x"}]}})),
            detail: Ok(json!({"slug": "42-x", "episodes": 16})),
        };
        let record = id_lookup()
            .attempt(&resolver, &InputItem::titled("42", "X"))
            .await
            .unwrap();
        assert_eq!(record.0["episodes"], 16);
    }

    #[tokio::test]
    async fn test_attempt_failure_stages() {
        let item = InputItem::titled("42", "X");

        let no_match = Fixed {
            search: Ok(json!({"results": {"dramas": [{"mdl_id": "mdl-1", "slug": "1"}]}})),
            detail: Ok(json!({})),
        };
        let err = id_lookup().attempt(&no_match, &item).await.unwrap_err();
        assert_eq!(err.stage, FailureStage::IdNotMatched);
        assert!(matches!(err.error, ResolveError::NoMatch { .. }));
        assert_eq!(err.matched_key, None);

        let bad_detail = Fixed {
            search: Ok(json!({"results": {"dramas": [{"mdl_id": "mdl-42", "slug": "42-x"}]}})),
            detail: Err(ResolveError::UpstreamStatus { status: 502 }),
        };
        let err = id_lookup().attempt(&bad_detail, &item).await.unwrap_err();
        assert_eq!(err.stage, FailureStage::DetailsFailed);
        assert_eq!(err.matched_key.as_deref(), Some("42-x"));

        let down = Fixed {
            search: Err(ResolveError::Timeout(std::time::Duration::from_secs(10))),
            detail: Ok(json!({})),
        };
        let err = id_lookup().attempt(&down, &item).await.unwrap_err();
        assert_eq!(err.stage, FailureStage::SearchFailed);
    }
}
