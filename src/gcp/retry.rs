//! Retrying transport
//!
//! Retries transport-level failures, 429 and 5xx responses with
//! exponential backoff. Other statuses pass through on the first attempt.

use super::http::{is_retryable_status, ApiError, ApiRequest, Transport};
use async_trait::async_trait;
use reqwest::Response;
use std::time::Duration;

/// Default number of retries after the first attempt
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_millis(100);

/// Retry bound and backoff schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay before retry number `retry` (0-indexed): `2^retry * base`, no jitter
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(retry))
    }
}

fn should_retry(result: &Result<Response, ApiError>) -> bool {
    match result {
        Ok(response) => is_retryable_status(response.status()),
        Err(err) => err.is_retryable(),
    }
}

fn describe(result: &Result<Response, ApiError>) -> String {
    match result {
        Ok(response) => response.status().to_string(),
        Err(err) => err.to_string(),
    }
}

/// Transport that retries the wrapped transport on transient failures
pub struct RetryTransport<T> {
    inner: T,
    policy: RetryPolicy,
}

impl<T> RetryTransport<T> {
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<T: Transport> Transport for RetryTransport<T> {
    async fn execute(&self, mut request: ApiRequest) -> Result<Response, ApiError> {
        let mut retry = 0;

        loop {
            // Keep a pristine copy for the next attempt. Streaming bodies
            // can't be replayed, so those get a single attempt.
            let (attempt, spare) = if retry >= self.policy.max_retries {
                (request, None)
            } else {
                match request.try_clone() {
                    Some(copy) => (copy, Some(request)),
                    None => (request, None),
                }
            };

            let result = self.inner.execute(attempt).await;

            let Some(next) = spare else {
                return result;
            };
            if next.is_cancelled() || !should_retry(&result) {
                return result;
            }

            let delay = self.policy.delay_for(retry);
            tracing::warn!(
                request_id = %next.id,
                attempt = retry + 1,
                delay_ms = delay.as_millis() as u64,
                "Retrying {} after {}",
                next.request.url(),
                describe(&result)
            );

            // Dropping the discarded response releases its connection
            drop(result);

            tokio::select! {
                biased;
                _ = next.cancel.cancelled() => return Err(ApiError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }

            request = next;
            retry += 1;
        }
    }
}
