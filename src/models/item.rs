//! Items, records and reports flowing through the engine.

use super::error::{EngineError, FailureKind, ResolveError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// One entry of the input collection.
///
/// `id` is the identity key used by the done set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputItem {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Remaining fields of an object entry, passed through untouched
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl InputItem {
    /// Item identified by a bare slug.
    pub fn slug(slug: impl Into<String>) -> Self {
        Self {
            id: slug.into(),
            title: None,
            extra: Map::new(),
        }
    }

    /// Item with an id and a display title.
    pub fn titled(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: Some(title.into()),
            extra: Map::new(),
        }
    }

    /// Build an item from one element of the input collection.
    ///
    /// Strings are slugs. Objects need `id` (string or number) or `slug`.
    pub fn from_value(value: Value) -> std::result::Result<Self, String> {
        match value {
            Value::String(s) if !s.trim().is_empty() => Ok(Self::slug(s)),
            Value::String(_) => Err("empty identifier".to_string()),
            Value::Object(mut map) => {
                let id = match map.remove("id").or_else(|| map.remove("slug")) {
                    Some(Value::String(s)) if !s.trim().is_empty() => s,
                    Some(Value::Number(n)) => n.to_string(),
                    Some(other) => return Err(format!("unsupported id value: {other}")),
                    None => return Err("object entry without `id` or `slug`".to_string()),
                };
                let title = match map.remove("title") {
                    Some(Value::String(s)) => Some(s),
                    _ => None,
                };
                Ok(Self {
                    id,
                    title,
                    extra: map,
                })
            }
            other => Err(format!("unsupported entry: {other}")),
        }
    }

    /// Inverse of [`InputItem::from_value`]: a bare string when the item is
    /// only a slug, otherwise an object with `id`, `title` and extra fields.
    pub fn to_value(&self) -> Value {
        if self.title.is_none() && self.extra.is_empty() {
            return Value::String(self.id.clone());
        }
        let mut map = Map::new();
        map.insert("id".to_string(), Value::String(self.id.clone()));
        if let Some(title) = &self.title {
            map.insert("title".to_string(), Value::String(title.clone()));
        }
        for (key, value) in &self.extra {
            map.entry(key.clone()).or_insert_with(|| value.clone());
        }
        Value::Object(map)
    }
}

/// Load the full input collection.
///
/// Accepts a JSON array or JSON Lines. Any problem is a fatal input error.
pub fn load_input(path: &Path) -> Result<Vec<InputItem>> {
    let content = fs::read_to_string(path)
        .map_err(|e| EngineError::fatal_input(path, format!("cannot read: {e}")))?;

    let trimmed = content.trim_start();
    let values: Vec<Value> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)
            .map_err(|e| EngineError::fatal_input(path, format!("invalid JSON array: {e}")))?
    } else {
        let mut values = Vec::new();
        for (line_num, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let value = serde_json::from_str(line).map_err(|e| {
                EngineError::fatal_input(path, format!("line {}: {e}", line_num + 1))
            })?;
            values.push(value);
        }
        values
    };

    let items = values
        .into_iter()
        .enumerate()
        .map(|(idx, value)| {
            InputItem::from_value(value)
                .map_err(|reason| EngineError::fatal_input(path, format!("entry {idx}: {reason}")))
        })
        .collect::<Result<Vec<_>>>()?;

    info!(count = items.len(), path = %path.display(), "Loaded input collection");
    Ok(items)
}

/// Record produced by the resolver for one item. Opaque JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResolvedRecord(pub Value);

/// Step of a lookup that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    SearchFailed,
    IdNotMatched,
    DetailsFailed,
}

/// Identifier that exhausted its attempts or was rejected permanently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub identifier: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Remaining input fields, kept so the item can be retried as-is
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,

    /// Key of the matched entry when the detail fetch failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_key: Option<String>,

    pub reason: FailureKind,
    pub stage: FailureStage,
    pub detail: String,
    pub attempts: u32,
    pub batch_index: u64,
    pub failed_at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(
        item: &InputItem,
        stage: FailureStage,
        error: &ResolveError,
        attempts: u32,
        batch_index: u64,
    ) -> Self {
        Self {
            identifier: item.id.clone(),
            title: item.title.clone(),
            extra: item.extra.clone(),
            matched_key: None,
            reason: error.kind(),
            stage,
            detail: error.to_string(),
            attempts,
            batch_index,
            failed_at: Utc::now(),
        }
    }

    pub fn with_matched_key(mut self, key: Option<String>) -> Self {
        self.matched_key = key;
        self
    }

    /// The input item this failure came from, ready to be retried.
    pub fn to_input(&self) -> InputItem {
        InputItem {
            id: self.identifier.clone(),
            title: self.title.clone(),
            extra: self.extra.clone(),
        }
    }
}

/// Counts for one processed batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub run_id: String,
    pub batch_index: u64,
    pub start: usize,
    pub end: usize,
    pub slice_len: usize,
    /// Items already in the done set, not sent to the resolver
    pub skipped: usize,
    pub resolved: usize,
    pub failed: usize,
    /// Resolver invocations across the batch
    pub attempts: u64,
    pub artifact: Option<PathBuf>,
    pub runtime_secs: f64,
}

/// Counts for one invocation, possibly spanning several batches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub batches: Vec<BatchReport>,
    /// Interrupted batches found on startup
    pub recovered_batches: usize,
    /// Planner reported nothing left to do
    pub exhausted: bool,
}

impl RunReport {
    pub fn resolved(&self) -> usize {
        self.batches.iter().map(|b| b.resolved).sum()
    }

    pub fn failed(&self) -> usize {
        self.batches.iter().map(|b| b.failed).sum()
    }

    pub fn skipped(&self) -> usize {
        self.batches.iter().map(|b| b.skipped).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_item_from_string_and_object() {
        let item = InputItem::from_value(json!("my-drama")).unwrap();
        assert_eq!(item.id, "my-drama");
        assert!(item.title.is_none());

        let item =
            InputItem::from_value(json!({"id": 12345, "title": "My Drama", "year": 2020})).unwrap();
        assert_eq!(item.id, "12345");
        assert_eq!(item.title.as_deref(), Some("My Drama"));
        assert_eq!(item.extra.get("year"), Some(&json!(2020)));
    }

    #[test]
    fn test_item_without_identity_rejected() {
        assert!(InputItem::from_value(json!({"title": "x"})).is_err());
        assert!(InputItem::from_value(json!("")).is_err());
        assert!(InputItem::from_value(json!(42)).is_err());
    }

    #[test]
    fn test_load_json_array_and_jsonl() {
        let dir = TempDir::new().unwrap();

        let array = dir.path().join("slugs.json");
        fs::write(&array, r#"["a-b", "c-d"]"#).unwrap();
        let items = load_input(&array).unwrap();
        assert_eq!(items, vec![InputItem::slug("a-b"), InputItem::slug("c-d")]);

        let lines = dir.path().join("ids.jsonl");
        fs::write(&lines, "{\"id\": 1, \"title\": \"One\"}\n\n{\"id\": 2, \"title\": \"Two\"}\n")
            .unwrap();
        let items = load_input(&lines).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1], InputItem::titled("2", "Two"));
    }

    #[test]
    fn test_load_input_failures_are_fatal() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(
            load_input(&missing),
            Err(EngineError::FatalInput { .. })
        ));

        let broken = dir.path().join("broken.json");
        fs::write(&broken, "[\"a\", ").unwrap();
        assert!(matches!(
            load_input(&broken),
            Err(EngineError::FatalInput { .. })
        ));
    }

    #[test]
    fn test_failure_record_from_error() {
        let err = ResolveError::NoMatch {
            expected: "mdl-7".into(),
        };
        let item = InputItem::titled("7", "My Drama");
        let record = FailureRecord::new(&item, FailureStage::IdNotMatched, &err, 3, 0);
        assert_eq!(record.reason, FailureKind::NoMatchError);
        assert_eq!(record.attempts, 3);
        assert!(record.detail.contains("mdl-7"));
        assert_eq!(record.to_input(), item);
    }

    #[test]
    fn test_to_value_round_trips_through_from_value() {
        let slug = InputItem::slug("my-drama");
        assert_eq!(slug.to_value(), json!("my-drama"));
        assert_eq!(InputItem::from_value(slug.to_value()).unwrap(), slug);

        let item =
            InputItem::from_value(json!({"id": 12345, "title": "My Drama", "year": 2020})).unwrap();
        assert_eq!(
            item.to_value(),
            json!({"id": "12345", "title": "My Drama", "year": 2020})
        );
        assert_eq!(InputItem::from_value(item.to_value()).unwrap(), item);
    }

    #[test]
    fn test_failure_record_reads_older_lines() {
        let line = r#"{"identifier":"a","reason":"transport_error","stage":"search_failed","detail":"x","attempts":3,"batch_index":0,"failed_at":"2026-01-01T00:00:00Z"}"#;
        let record: FailureRecord = serde_json::from_str(line).unwrap();
        assert_eq!(record.title, None);
        assert!(record.extra.is_empty());
        assert_eq!(record.to_input(), InputItem::slug("a"));
    }
}
