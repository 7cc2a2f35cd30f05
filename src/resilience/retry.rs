// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry with exponential backoff.
//!
//! Every backend call goes through [`retry`] or [`retry_if`] with one of the
//! presets below:
//!
//! | Preset      | Attempts | Delays        | Used for                         |
//! |-------------|----------|---------------|----------------------------------|
//! | `startup()` | 5        | 200ms .. 2s   | connecting pools, creating schema|
//! | `query()`   | 3        | 100ms .. 2s   | single store / lock statements   |
//! | `source()`  | 4        | 500ms .. 10s  | authoritative page fetches       |
//!
//! # Example
//!
//! ```
//! use inventory_sync::RetryConfig;
//! use std::time::Duration;
//!
//! let source = RetryConfig::source()
//!     .with_max_retries(2)
//!     .with_initial_delay(Duration::from_millis(50));
//! assert_eq!(source.max_retries, Some(2));
//! assert_eq!(source.next_delay(Duration::from_millis(50)), Duration::from_millis(100));
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

/// Backoff schedule for one kind of operation.
///
/// `max_retries` counts attempts in total, the first one included; `None`
/// retries until success.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: Option<usize>,
}

impl RetryConfig {
    /// Connecting at startup: surface a wrong URL within a few seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// A single statement against the store or lock backend.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Bounded retry for authoritative-source reads.
    /// A run that exhausts these attempts fails and keeps its checkpoint.
    #[must_use]
    pub fn source() -> Self {
        Self {
            max_retries: Some(4),
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
        }
    }

    /// Override the attempt bound (`0` is treated as a single attempt).
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = Some(max_retries.max(1));
        self
    }

    #[must_use]
    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self.max_delay = self.max_delay.max(initial_delay);
        self
    }

    /// The delay that follows `current`, capped at `max_delay`.
    #[must_use]
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.mul_f64(self.factor).min(self.max_delay)
    }

    /// Longest time a bounded schedule can take when every attempt runs for
    /// `per_attempt`: all attempts plus the pauses between them. `None` when
    /// retries are unbounded.
    #[must_use]
    pub fn worst_case(&self, per_attempt: Duration) -> Option<Duration> {
        let attempts = self.max_retries?;
        let mut total = per_attempt.saturating_mul(u32::try_from(attempts).unwrap_or(u32::MAX));
        let mut delay = self.initial_delay;
        for _ in 1..attempts {
            total = total.saturating_add(delay);
            delay = self.next_delay(delay);
        }
        Some(total)
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }
}

/// Run `operation` until it succeeds or the attempts in `config` run out.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(operation_name, config, operation, |_| true).await
}

/// Like [`retry`], but only retries errors for which `is_retryable` holds.
/// Any other error is returned immediately.
pub async fn retry_if<F, Fut, T, E, P>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!(operation = operation_name, retries = attempts, "Operation recovered");
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                if !is_retryable(&err) {
                    return Err(err);
                }

                match config.max_retries {
                    Some(max) if attempts >= max => {
                        warn!(operation = operation_name, attempts, error = %err, "Giving up");
                        return Err(err);
                    }
                    Some(max) => warn!(
                        operation = operation_name,
                        attempt = attempts,
                        max,
                        error = %err,
                        retry_in = ?delay,
                        "Operation failed, retrying"
                    ),
                    None => warn!(
                        operation = operation_name,
                        attempt = attempts,
                        error = %err,
                        retry_in = ?delay,
                        "Operation failed, retrying until it succeeds"
                    ),
                }

                sleep(delay).await;
                delay = config.next_delay(delay);
            }
        }
    }
}
