//! Rate limiting for exchange endpoints.
//!
//! Token bucket for bursts plus a sliding window of request timestamps for the
//! sustained rate. A request passes only when both agree.

use crate::types::Timestamp;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RateLimitConfig {
    /// Steady refill rate of the bucket.
    pub requests_per_second: u32,
    /// Bucket capacity.
    pub burst_limit: u32,
    /// Sliding window length in milliseconds.
    pub window_ms: i64,
    /// Attempts `acquire` makes before giving up.
    pub max_wait_attempts: u32,
    /// Upper bound on the total time `acquire` may sleep, in milliseconds.
    pub max_total_wait_ms: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10,
            burst_limit: 20,
            window_ms: 1_000,
            max_wait_attempts: 5,
            max_total_wait_ms: 10_000,
        }
    }
}

impl RateLimitConfig {
    // requests allowed inside one window
    pub fn window_limit(&self) -> usize {
        let per_window = self.requests_per_second as i64 * self.window_ms / 1_000;
        per_window.max(1) as usize
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.requests_per_second == 0 || self.burst_limit == 0 {
            return Err("requests_per_second and burst_limit must be positive".to_string());
        }
        if self.window_ms <= 0 {
            return Err("window_ms must be positive".to_string());
        }
        if self.max_wait_attempts == 0 {
            return Err("max_wait_attempts must be at least 1".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limited, retry after {retry_after_ms}ms")]
    Limited { retry_after_ms: i64 },

    #[error("rate limit still exceeded after {attempts} attempts ({waited_ms}ms waited)")]
    Exhausted { attempts: u32, waited_ms: i64 },
}

#[derive(Debug)]
struct LimiterState {
    available_tokens: Decimal,
    last_refill: Timestamp,
    request_timestamps: VecDeque<Timestamp>,
}

/// Limiter for one logical endpoint. Shared between concurrent callers.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::starting_at(config, Timestamp::now())
    }

    /// Limiter whose bucket was last refilled at `start`, full.
    pub fn starting_at(config: RateLimitConfig, start: Timestamp) -> Self {
        let tokens = Decimal::from(config.burst_limit);
        Self {
            config,
            state: Mutex::new(LimiterState {
                available_tokens: tokens,
                last_refill: start,
                request_timestamps: VecDeque::new(),
            }),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn refill(&self, state: &mut LimiterState, now: Timestamp) {
        let elapsed = now.millis_since(state.last_refill);
        if elapsed > 0 {
            let rate = Decimal::from(self.config.requests_per_second);
            let added = rate * Decimal::from(elapsed) / Decimal::from(1_000);
            let cap = Decimal::from(self.config.burst_limit);
            state.available_tokens = (state.available_tokens + added).min(cap);
            state.last_refill = now;
        }

        let cutoff = now.as_millis() - self.config.window_ms;
        while let Some(ts) = state.request_timestamps.front() {
            if ts.as_millis() <= cutoff {
                state.request_timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Take a slot if one is free, otherwise report how long to wait.
    pub fn check_at(&self, now: Timestamp) -> Result<(), RateLimitError> {
        let mut state = self.lock();
        self.refill(&mut state, now);

        let mut retry_after_ms = 0i64;

        if state.available_tokens < Decimal::ONE {
            let missing = Decimal::ONE - state.available_tokens;
            let rate = Decimal::from(self.config.requests_per_second);
            let wait = (missing * Decimal::from(1_000) / rate).ceil();
            retry_after_ms = retry_after_ms.max(wait.to_i64().unwrap_or(1_000));
        }

        if state.request_timestamps.len() >= self.config.window_limit() {
            if let Some(oldest) = state.request_timestamps.front() {
                let frees_at = oldest.plus_millis(self.config.window_ms);
                retry_after_ms = retry_after_ms.max(frees_at.millis_since(now).max(1));
            }
        }

        if retry_after_ms > 0 {
            return Err(RateLimitError::Limited { retry_after_ms });
        }

        state.available_tokens -= Decimal::ONE;
        state.request_timestamps.push_back(now);
        Ok(())
    }

    pub fn try_acquire(&self) -> Result<(), RateLimitError> {
        self.check_at(Timestamp::now())
    }

    /// Wait for a slot. Bounded by `max_wait_attempts` and `max_total_wait_ms`.
    pub async fn acquire(&self) -> Result<(), RateLimitError> {
        let mut waited_ms = 0i64;
        for attempt in 1..=self.config.max_wait_attempts {
            let retry_after_ms = match self.check_at(Timestamp::now()) {
                Ok(()) => return Ok(()),
                Err(RateLimitError::Limited { retry_after_ms }) => retry_after_ms,
                Err(e) => return Err(e),
            };

            if attempt == self.config.max_wait_attempts
                || waited_ms + retry_after_ms > self.config.max_total_wait_ms
            {
                return Err(RateLimitError::Exhausted { attempts: attempt, waited_ms });
            }

            debug!(attempt, retry_after_ms, "rate limited, waiting");
            tokio::time::sleep(Duration::from_millis(retry_after_ms as u64)).await;
            waited_ms += retry_after_ms;
        }

        Err(RateLimitError::Exhausted {
            attempts: self.config.max_wait_attempts,
            waited_ms,
        })
    }

    pub fn available_tokens_at(&self, now: Timestamp) -> Decimal {
        let mut state = self.lock();
        self.refill(&mut state, now);
        state.available_tokens
    }
}
