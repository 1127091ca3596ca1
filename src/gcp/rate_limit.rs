//! Client-side rate limiting
//!
//! A token bucket paces outbound calls to a steady rate while allowing
//! short bursts. [`RateLimitedTransport`] admits each logical call once,
//! before any retry attempts made by the transport it wraps.

use super::http::{ApiError, ApiRequest, Transport};
use async_trait::async_trait;
use reqwest::Response;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Lowest accepted refill rate (tokens/second)
const MIN_RATE: f64 = 0.001;

/// Top up `tokens` for `elapsed_secs` of refill, never exceeding `capacity`
pub fn refill(tokens: f64, capacity: f64, rate: f64, elapsed_secs: f64) -> f64 {
    (tokens + elapsed_secs.max(0.0) * rate).min(capacity)
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, capacity: f64, rate: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = refill(self.tokens, capacity, rate, elapsed);
        self.last_refill = now;
    }
}

/// Token bucket limiter shared by every caller of the pipeline
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket. `rate` is tokens/second, `capacity` the burst size.
    pub fn new(rate: f64, capacity: f64) -> Self {
        let rate = if rate.is_finite() { rate.max(MIN_RATE) } else { MIN_RATE };
        let capacity = if capacity.is_finite() { capacity.max(1.0) } else { 1.0 };

        Self {
            rate,
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Tokens currently available (after refill)
    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        state.refill(self.capacity, self.rate);
        state.tokens
    }

    /// Take a token if one is available right now
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        state.refill(self.capacity, self.rate);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait until a token is available or `cancel` fires.
    ///
    /// The lock is released while sleeping; every wake-up re-measures the
    /// bucket instead of assuming the sleep produced a token.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), ApiError> {
        loop {
            if cancel.is_cancelled() {
                return Err(ApiError::Cancelled);
            }

            let wait = {
                let mut state = self.state.lock().await;
                state.refill(self.capacity, self.rate);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.rate)
            };

            tracing::trace!(wait_ms = wait.as_millis() as u64, "Rate limiter waiting for token");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ApiError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

/// Transport that admits each call through a [`TokenBucket`] first
pub struct RateLimitedTransport<T> {
    limiter: Arc<TokenBucket>,
    inner: T,
}

impl<T> RateLimitedTransport<T> {
    pub fn new(limiter: Arc<TokenBucket>, inner: T) -> Self {
        Self { limiter, inner }
    }
}

#[async_trait]
impl<T: Transport> Transport for RateLimitedTransport<T> {
    async fn execute(&self, request: ApiRequest) -> Result<Response, ApiError> {
        self.limiter.acquire(&request.cancel).await?;
        self.inner.execute(request).await
    }
}
