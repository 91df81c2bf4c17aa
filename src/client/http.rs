//! HTTP implementation of the `Resolver` capability.
//!
//! One call is one request: retries belong to the retry controller, so this
//! client only classifies what happened.

use super::{RateLimiter, Resolver, parse_retry_after};
use crate::models::{ConfigError, EngineError, ResolveError, ResolverConfig, Result};
use async_trait::async_trait;
use reqwest::Url;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct HttpResolver {
    client: reqwest::Client,
    base_url: Url,
    search_path: String,
    detail_path: String,
    timeout: Duration,
    /// Rate limiter key
    host: String,
    rate_limiter: Arc<RateLimiter>,
}

impl HttpResolver {
    /// Build a resolver from configuration.
    pub fn new(config: &ResolverConfig, rate_limiter: Option<Arc<RateLimiter>>) -> Result<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            ConfigError::Invalid(format!("resolver.base_url '{}': {e}", config.base_url))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(ConfigError::Invalid(format!(
                "resolver.base_url '{}' cannot carry a path",
                config.base_url
            ))
            .into());
        }

        let mut headers = HeaderMap::new();
        let user_agent = HeaderValue::from_str(&config.user_agent)
            .map_err(|e| ConfigError::Invalid(format!("resolver.user_agent: {e}")))?;
        headers.insert(USER_AGENT, user_agent);
        for (key, value) in &config.headers {
            let name = HeaderName::try_from(key.as_str())
                .map_err(|e| ConfigError::Invalid(format!("header name '{key}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ConfigError::Invalid(format!("header '{key}': {e}")))?;
            headers.insert(name, value);
        }

        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(EngineError::Network)?;

        Ok(Self {
            host: base_url.host_str().unwrap_or("default").to_string(),
            client,
            base_url,
            search_path: config.search_path.clone(),
            detail_path: config.detail_path.clone(),
            timeout,
            rate_limiter: rate_limiter.unwrap_or_default(),
        })
    }

    /// Substitute `placeholder` in a path template, percent-encoding each segment.
    pub fn build_url(&self, template: &str, placeholder: &str, value: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty();
            for segment in template.split('/').filter(|s| !s.is_empty()) {
                segments.push(&segment.replace(placeholder, value));
            }
        }
        url
    }

    async fn get_json(&self, url: Url) -> std::result::Result<Value, ResolveError> {
        self.rate_limiter.wait_if_needed(&self.host).await;
        debug!(url = %url, "GET");

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                ResolveError::Timeout(self.timeout)
            } else {
                ResolveError::Transport(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        self.rate_limiter
            .record_response(&self.host, status, retry_after);

        if status == 429 {
            return Err(ResolveError::RateLimited {
                retry_after_secs: retry_after.map_or(1.0, |d| d.as_secs_f64()),
            });
        }
        if !response.status().is_success() {
            return Err(ResolveError::UpstreamStatus { status });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| ResolveError::InvalidResponse(format!("Failed to parse response: {e}")))
    }
}

#[async_trait]
impl Resolver for HttpResolver {
    async fn search(&self, query: &str) -> std::result::Result<Value, ResolveError> {
        let url = self.build_url(&self.search_path, "{query}", query);
        self.get_json(url).await
    }

    async fn fetch_detail(&self, key: &str) -> std::result::Result<Value, ResolveError> {
        let url = self.build_url(&self.detail_path, "{key}", key);
        self.get_json(url).await
    }
}
