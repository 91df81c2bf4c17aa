//! Configuration models for batchwise.
//!
//! The file form (`Config`) is what users write; `EngineConfig` is the
//! validated, explicit value handed to the runner. Nothing is global.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Remote lookup service
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Batching and retry behaviour
    #[serde(default)]
    pub engine: EngineSettings,

    /// Where state and artifacts live
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Remote lookup service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Base URL of the lookup API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Search path template, `{query}` is substituted
    #[serde(default = "default_search_path")]
    pub search_path: String,

    /// Detail path template, `{key}` is substituted
    #[serde(default = "default_detail_path")]
    pub detail_path: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// User-Agent header
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Extra headers. Values can contain ${ENV_VAR}.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// How an item is turned into a query and matched
    #[serde(default)]
    pub lookup: LookupSpec,
}

fn default_base_url() -> String {
    "https://mdl-pi.vercel.app".to_string()
}

fn default_search_path() -> String {
    "/search/q/{query}".to_string()
}

fn default_detail_path() -> String {
    "/id/{key}".to_string()
}

fn default_timeout() -> u64 {
    10
}

fn default_user_agent() -> String {
    "Mozilla/5.0".to_string()
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            search_path: default_search_path(),
            detail_path: default_detail_path(),
            timeout_secs: default_timeout(),
            user_agent: default_user_agent(),
            headers: HashMap::new(),
            lookup: LookupSpec::default(),
        }
    }
}

/// Which item field feeds the search query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuerySource {
    /// Identifier is a slug; dashes become spaces
    #[default]
    Slug,
    /// Item title, lowercased with spaces turned into dashes
    Title,
}

/// Mapping from an input item to a search query and a canonical match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupSpec {
    #[serde(default)]
    pub query_from: QuerySource,

    /// JSON pointer to the candidate array ("" = whole response)
    #[serde(default)]
    pub results_pointer: String,

    /// Candidate field compared against the expected identity
    #[serde(default = "default_identity_field")]
    pub identity_field: String,

    /// Expected identity, `{id}` is substituted with the item id
    #[serde(default = "default_identity_format")]
    pub identity_format: String,

    /// If set, the matched candidate's field keys a detail fetch
    #[serde(default)]
    pub detail_key_field: Option<String>,
}

fn default_identity_field() -> String {
    "slug".to_string()
}

fn default_identity_format() -> String {
    "{id}".to_string()
}

impl Default for LookupSpec {
    fn default() -> Self {
        Self {
            query_from: QuerySource::default(),
            results_pointer: String::new(),
            identity_field: default_identity_field(),
            identity_format: default_identity_format(),
            detail_key_field: None,
        }
    }
}

/// Batching and retry settings as written in the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Absolute index cap on the input collection
    #[serde(default)]
    pub max_total: Option<usize>,

    /// First attempt plus retries
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_delay_ms")]
    pub retry_delay_ms: u64,

    /// Delay between consecutive requests of one worker stream
    #[serde(default = "default_delay_ms")]
    pub request_delay_ms: u64,

    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Treat "no match" as permanent after the first attempt
    #[serde(default)]
    pub no_match_is_permanent: bool,

    /// Batches processed per invocation
    #[serde(default = "default_max_batches")]
    pub max_batches: usize,
}

fn default_batch_size() -> usize {
    4000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    1000
}

fn default_workers() -> usize {
    1
}

fn default_max_batches() -> usize {
    1
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_total: None,
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_delay_ms(),
            request_delay_ms: default_delay_ms(),
            workers: default_workers(),
            no_match_is_permanent: false,
            max_batches: default_max_batches(),
        }
    }
}

/// Storage locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Input collection (JSON array or JSONL)
    #[serde(default = "default_input")]
    pub input: PathBuf,

    /// Checkpoint namespace directory
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,

    /// Directory for per-batch output artifacts
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Append-only failure log (defaults into the checkpoint dir)
    #[serde(default)]
    pub failure_log: Option<PathBuf>,
}

fn default_input() -> PathBuf {
    PathBuf::from("input.json")
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoint")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            input: default_input(),
            checkpoint_dir: default_checkpoint_dir(),
            output_dir: default_output_dir(),
            failure_log: None,
        }
    }
}

impl StorageConfig {
    /// Resolved failure log path.
    pub fn failure_log_path(&self) -> PathBuf {
        self.failure_log
            .clone()
            .unwrap_or_else(|| self.checkpoint_dir.join("failures.jsonl"))
    }
}

/// Validated configuration passed to the batch runner.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub batch_size: usize,
    pub max_total: Option<usize>,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub request_delay: Duration,
    pub workers: usize,
    pub no_match_is_permanent: bool,
    pub max_batches: usize,
    pub input_path: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub output_dir: PathBuf,
    pub failure_log: PathBuf,
    pub show_progress: bool,
}

impl EngineConfig {
    /// Config rooted at `dir` with file defaults and no delays. Handy for tests.
    pub fn in_dir(dir: &Path, input_path: &Path) -> Self {
        let settings = EngineSettings::default();
        Self {
            batch_size: settings.batch_size,
            max_total: None,
            max_attempts: settings.max_attempts,
            retry_delay: Duration::ZERO,
            request_delay: Duration::ZERO,
            workers: 1,
            no_match_is_permanent: false,
            max_batches: 1,
            input_path: input_path.to_path_buf(),
            checkpoint_dir: dir.join("checkpoint"),
            output_dir: dir.join("output"),
            failure_log: dir.join("checkpoint").join("failures.jsonl"),
            show_progress: false,
        }
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("engine.batch_size must be > 0".into()));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("engine.max_attempts must be > 0".into()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("engine.workers must be > 0".into()));
        }
        if self.max_batches == 0 {
            return Err(ConfigError::Invalid("engine.max_batches must be > 0".into()));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::Toml(source) => ConfigError::Parse {
                path: path.to_owned(),
                source,
            },
            other => other,
        })
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content).map_err(ConfigError::Toml)?;
        config.resolver.headers = expand_headers(&config.resolver.headers);
        Ok(config)
    }

    /// Build the validated engine configuration.
    pub fn engine_config(&self, show_progress: bool) -> Result<EngineConfig, ConfigError> {
        let engine = EngineConfig {
            batch_size: self.engine.batch_size,
            max_total: self.engine.max_total,
            max_attempts: self.engine.max_attempts,
            retry_delay: Duration::from_millis(self.engine.retry_delay_ms),
            request_delay: Duration::from_millis(self.engine.request_delay_ms),
            workers: self.engine.workers,
            no_match_is_permanent: self.engine.no_match_is_permanent,
            max_batches: self.engine.max_batches,
            input_path: self.storage.input.clone(),
            checkpoint_dir: self.storage.checkpoint_dir.clone(),
            output_dir: self.storage.output_dir.clone(),
            failure_log: self.storage.failure_log_path(),
            show_progress,
        };
        engine.validate()?;
        Ok(engine)
    }
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let Ok(re) = regex::Regex::new(r"\$\{([^}]+)\}") else {
        return s.to_string();
    };

    let mut result = s.to_string();
    for cap in re.captures_iter(s) {
        if let Ok(value) = std::env::var(&cap[1]) {
            result = result.replace(&cap[0], &value);
        }
    }
    result
}

/// Expand environment variables in all headers.
pub fn expand_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.clone(), expand_env_vars(v)))
        .collect()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to parse config: {0}")]
    Toml(toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
