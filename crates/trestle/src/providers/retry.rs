//! Retry classification and exponential back-off.

use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

/// Statuses worth retrying: rate limiting and transient server-side
/// failures. Everything else is a client or protocol problem.
const RETRYABLE_STATUS_CODES: [StatusCode; 5] = [
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

pub fn is_retryable_status(code: u16) -> bool {
    StatusCode::from_u16(code)
        .map(|status| RETRYABLE_STATUS_CODES.contains(&status))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Additional attempts after the first call.
    pub max_retries: usize,
    pub initial_interval_ms: u64,
    pub backoff_multiplier: f64,
    pub max_interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 0,
            initial_interval_ms: 500,
            backoff_multiplier: 2.0,
            max_interval_ms: 10_000,
        }
    }
}

/// The capped exponential interval for the given zero-based attempt, before
/// jitter. Non-decreasing in `attempt`.
pub fn backoff_interval(attempt: usize, config: &RetryConfig) -> u64 {
    let base = config.initial_interval_ms as f64
        * config.backoff_multiplier.powi(attempt.min(i32::MAX as usize) as i32);
    base.min(config.max_interval_ms as f64) as u64
}

/// Full-jitter back-off: uniform in [0, capped interval].
pub fn calculate_backoff(attempt: usize, config: &RetryConfig) -> Duration {
    let interval = backoff_interval(attempt, config);
    Duration::from_millis(rand::thread_rng().gen_range(0..=interval))
}
