//! Error types for batchwise.
//!
//! Two layers:
//! - `ResolveError`: one failed resolution attempt. Never aborts a batch.
//! - `EngineError`: run-level failures (input, persistence, cancellation).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single resolution attempt against the upstream service.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResolveError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Upstream returned status {status}")]
    UpstreamStatus { status: u16 },

    #[error("Rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: f64 },

    #[error("No entry matched expected identity '{expected}'")]
    NoMatch { expected: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Longest server-provided wait that is honoured, in seconds.
pub const MAX_RETRY_AFTER_SECS: f64 = 600.0;

impl ResolveError {
    /// Classified kind recorded in the failure log.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Transport(_) | Self::Timeout(_) => FailureKind::TransportError,
            Self::UpstreamStatus { .. } | Self::RateLimited { .. } => {
                FailureKind::UpstreamStatusError
            }
            Self::NoMatch { .. } => FailureKind::NoMatchError,
            Self::InvalidResponse(_) => FailureKind::InvalidResponse,
        }
    }

    /// Server-provided wait hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after_secs } => {
                Duration::try_from_secs_f64(retry_after_secs.clamp(0.0, MAX_RETRY_AFTER_SECS)).ok()
            }
            _ => None,
        }
    }
}

/// Failure classification persisted alongside each failed identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TransportError,
    UpstreamStatusError,
    NoMatchError,
    InvalidResponse,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::TransportError => "transport_error",
            FailureKind::UpstreamStatusError => "upstream_status_error",
            FailureKind::NoMatchError => "no_match_error",
            FailureKind::InvalidResponse => "invalid_response",
        };
        f.write_str(s)
    }
}

/// Top-level error type for batchwise.
#[derive(Debug, Error)]
pub enum EngineError {
    // ═══════════════════════════════════════════════════════════════════
    // Input and configuration
    // ═══════════════════════════════════════════════════════════════════
    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Cannot load input collection {path}: {reason}")]
    FatalInput { path: PathBuf, reason: String },

    // ═══════════════════════════════════════════════════════════════════
    // Persistence
    // ═══════════════════════════════════════════════════════════════════
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Checkpoint namespace {0} is locked by another run")]
    CheckpointLocked(PathBuf),

    // ═══════════════════════════════════════════════════════════════════
    // Control flow
    // ═══════════════════════════════════════════════════════════════════
    #[error("Run cancelled by shutdown signal")]
    Cancelled,

    #[error("Network client error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a fatal input error.
    pub fn fatal_input(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::FatalInput {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error happened while writing durable state.
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Serialization(_) | Self::CheckpointLocked(_)
        )
    }
}

/// Result type alias for batchwise.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            ResolveError::Transport("reset".into()).kind(),
            FailureKind::TransportError
        );
        assert_eq!(
            ResolveError::Timeout(Duration::from_secs(10)).kind(),
            FailureKind::TransportError
        );
        assert_eq!(
            ResolveError::UpstreamStatus { status: 503 }.kind(),
            FailureKind::UpstreamStatusError
        );
        assert_eq!(
            ResolveError::NoMatch {
                expected: "mdl-1".into()
            }
            .kind(),
            FailureKind::NoMatchError
        );
    }

    #[test]
    fn test_retry_after_hint() {
        let err = ResolveError::RateLimited {
            retry_after_secs: 2.5,
        };
        assert_eq!(err.retry_after(), Some(Duration::from_millis(2500)));
        assert_eq!(ResolveError::Transport("x".into()).retry_after(), None);
    }

    #[test]
    fn test_retry_after_hint_is_capped() {
        let huge = ResolveError::RateLimited {
            retry_after_secs: 1e20,
        };
        assert_eq!(huge.retry_after(), Some(Duration::from_secs(600)));

        let nan = ResolveError::RateLimited {
            retry_after_secs: f64::NAN,
        };
        assert_eq!(nan.retry_after(), None);
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&FailureKind::NoMatchError).unwrap();
        assert_eq!(json, "\"no_match_error\"");
        assert_eq!(FailureKind::UpstreamStatusError.to_string(), "upstream_status_error");
    }
}
