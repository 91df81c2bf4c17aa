//! Adaptive rate limiter for the lookup API.
//!
//! Epistemic foundation:
//! - K_i: 429 responses require backing off before the next request
//! - K_i: Backoff never exceeds `MAX_RETRY_AFTER_SECS`
//! - B_i: `Retry-After` may be missing, malformed or absurd → parsed and capped
//! - I^B: The service's real quota is unknowable → exponential backoff per host

use crate::models::MAX_RETRY_AFTER_SECS;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Backoff ceiling after repeated 429s.
const MAX_BACKOFF_SECS: f64 = 60.0;

/// Rate limit state for a single host.
#[derive(Debug, Default)]
pub struct HostRateLimitState {
    /// Consecutive 429 errors (for backoff)
    pub consecutive_429s: u32,
    /// Backoff until this time
    pub backoff_until: Option<Instant>,
}

impl HostRateLimitState {
    /// Get time to wait before proceeding.
    pub fn wait_time(&self) -> Duration {
        let now = Instant::now();
        self.backoff_until
            .filter(|&t| t > now)
            .map_or(Duration::ZERO, |t| t - now)
    }

    /// Record a 429 and compute the backoff.
    pub fn record_429(&mut self, retry_after: Option<Duration>) {
        self.consecutive_429s += 1;
        let exponential = 2.0_f64.powi(self.consecutive_429s as i32).min(MAX_BACKOFF_SECS);
        let backoff = retry_after
            .map_or(exponential, |d| d.as_secs_f64().max(exponential))
            .min(MAX_RETRY_AFTER_SECS);
        let wait = Duration::try_from_secs_f64(backoff).unwrap_or(Duration::ZERO);
        self.backoff_until = Instant::now().checked_add(wait);
        warn!(
            consecutive_429s = self.consecutive_429s,
            backoff_secs = backoff,
            "Rate limited (429), backing off"
        );
    }

    /// Record a successful request.
    pub fn record_success(&mut self) {
        if self.consecutive_429s > 0 {
            self.consecutive_429s = 0;
            self.backoff_until = None;
        }
    }
}

/// Parse a `Retry-After` value given in seconds, capped at `MAX_RETRY_AFTER_SECS`.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs = value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)?;
    Duration::try_from_secs_f64(secs.min(MAX_RETRY_AFTER_SECS)).ok()
}

/// Shared limiter, safe to use from every worker stream.
#[derive(Debug, Default)]
pub struct RateLimiter {
    states: DashMap<String, HostRateLimitState>,
    total_requests: AtomicU64,
    total_429s: AtomicU64,
    total_wait_ms: AtomicU64,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait if the host is backing off. Returns the duration waited.
    pub async fn wait_if_needed(&self, host: &str) -> Duration {
        let wait_time = {
            let state = self.states.entry(host.to_string()).or_default();
            state.wait_time()
        };

        if wait_time > Duration::ZERO {
            debug!(host = host, wait_ms = wait_time.as_millis(), "Waiting for rate limit");
            self.total_wait_ms
                .fetch_add(wait_time.as_millis() as u64, Ordering::Relaxed);
            tokio::time::sleep(wait_time).await;
        }

        wait_time
    }

    /// Record a response status.
    pub fn record_response(&self, host: &str, status: u16, retry_after: Option<Duration>) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let mut state = self.states.entry(host.to_string()).or_default();

        if status == 429 {
            self.total_429s.fetch_add(1, Ordering::Relaxed);
            state.record_429(retry_after);
        } else if status < 400 {
            state.record_success();
        }
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_429s: self.total_429s.load(Ordering::Relaxed),
            total_wait_secs: self.total_wait_ms.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub total_429s: u64,
    pub total_wait_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_resets() {
        let mut state = HostRateLimitState::default();
        assert_eq!(state.wait_time(), Duration::ZERO);

        state.record_429(None);
        assert!(state.wait_time() > Duration::from_secs(1));
        state.record_429(None);
        assert_eq!(state.consecutive_429s, 2);
        assert!(state.wait_time() > Duration::from_secs(3));

        state.record_success();
        assert_eq!(state.wait_time(), Duration::ZERO);
    }

    #[test]
    fn test_retry_after_extends_backoff() {
        let mut state = HostRateLimitState::default();
        state.record_429(Some(Duration::from_secs(30)));
        assert!(state.wait_time() > Duration::from_secs(25));
    }

    #[test]
    fn test_huge_retry_after_is_capped() {
        assert_eq!(parse_retry_after("1e20"), Some(Duration::from_secs(600)));
        assert_eq!(parse_retry_after(" 2.5 "), Some(Duration::from_millis(2500)));
        assert_eq!(parse_retry_after("inf"), None);
        assert_eq!(parse_retry_after("-3"), None);
        assert_eq!(parse_retry_after("Wed, 21 Oct 2026 07:28:00 GMT"), None);

        let mut state = HostRateLimitState::default();
        state.record_429(Some(Duration::MAX));
        assert!(state.wait_time() <= Duration::from_secs(600));
        assert!(state.wait_time() > Duration::from_secs(590));
    }

    #[test]
    fn test_stats_count_per_status() {
        let limiter = RateLimiter::new();
        limiter.record_response("api", 200, None);
        limiter.record_response("api", 429, None);
        limiter.record_response("api", 500, None);

        let stats = limiter.stats();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.total_429s, 1);
    }
}
