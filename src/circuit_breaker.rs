//! Circuit breakers for unreliable collaborators.
//!
//! A three-state machine (closed, open, half-open) wrapped around one fallible
//! endpoint. Failures inside the monitoring window trip the breaker; while open
//! every call fails fast without reaching the endpoint. After the timeout one
//! probe is let through and a run of successes closes it again.

use crate::types::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Thresholds for a single breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BreakerConfig {
    /// Failures inside the monitoring window that trip the breaker.
    pub failure_threshold: u32,
    /// Consecutive half-open successes needed to close again.
    pub success_threshold: u32,
    /// How long the breaker stays open before allowing a probe, in milliseconds.
    pub timeout_ms: i64,
    /// Failures older than this are forgotten, in milliseconds.
    pub monitoring_window_ms: i64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_ms: 60_000,
            monitoring_window_ms: 60_000,
        }
    }
}

impl BreakerConfig {
    pub fn new(failure_threshold: u32, success_threshold: u32, timeout_ms: i64, monitoring_window_ms: i64) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            timeout_ms,
            monitoring_window_ms,
        }
    }

    // swaps commit capital so they trip sooner and stay open longer
    pub fn swap_default() -> Self {
        Self::new(3, 2, 120_000, 300_000)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be at least 1".to_string());
        }
        if self.success_threshold == 0 {
            return Err("success_threshold must be at least 1".to_string());
        }
        if self.timeout_ms <= 0 || self.monitoring_window_ms <= 0 {
            return Err("timeout_ms and monitoring_window_ms must be positive".to_string());
        }
        Ok(())
    }
}

/// Per-endpoint breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BreakerSetConfig {
    pub health: BreakerConfig,
    pub quote: BreakerConfig,
    pub swap: BreakerConfig,
}

impl Default for BreakerSetConfig {
    fn default() -> Self {
        Self {
            health: BreakerConfig::default(),
            quote: BreakerConfig::default(),
            swap: BreakerConfig::swap_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "CLOSED"),
            BreakerState::Open => write!(f, "OPEN"),
            BreakerState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("circuit '{name}' is open, next attempt in {retry_after_ms}ms")]
    Open { name: String, retry_after_ms: i64 },

    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }
}

/// Read-only view of a breaker for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    /// Failures currently inside the monitoring window.
    pub failure_count: u32,
    pub success_count: u32,
    pub consecutive_failures: u32,
    pub next_attempt_at: Option<Timestamp>,
    pub total_trips: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub last_failure: Option<String>,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_timestamps: VecDeque<Timestamp>,
    success_count: u32,
    consecutive_failures: u32,
    next_attempt_at: Option<Timestamp>,
    total_trips: u64,
    total_failures: u64,
    total_successes: u64,
    last_failure: Option<String>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_timestamps: VecDeque::new(),
            success_count: 0,
            consecutive_failures: 0,
            next_attempt_at: None,
            total_trips: 0,
            total_failures: 0,
            total_successes: 0,
            last_failure: None,
        }
    }

    fn prune(&mut self, now: Timestamp, window_ms: i64) {
        let cutoff = now.as_millis() - window_ms;
        while let Some(ts) = self.failure_timestamps.front() {
            if ts.as_millis() < cutoff {
                self.failure_timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn open(&mut self, now: Timestamp, timeout_ms: i64) {
        self.state = BreakerState::Open;
        self.success_count = 0;
        self.next_attempt_at = Some(now.plus_millis(timeout_ms));
        self.total_trips += 1;
    }
}

/// Circuit breaker shared by every caller of one endpoint.
///
/// State lives behind a mutex that is never held across an await, so the
/// breaker can be shared between the cycle loop and concurrent manual trades.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current state without triggering the open to half-open transition.
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Gate a call attempt. Moves an expired open breaker to half-open.
    pub fn try_acquire_at(&self, now: Timestamp) -> Result<(), BreakerError<std::convert::Infallible>> {
        let mut inner = self.lock();
        if inner.state != BreakerState::Open {
            return Ok(());
        }

        let next = inner.next_attempt_at.unwrap_or(now);
        if now < next {
            return Err(BreakerError::Open {
                name: self.name.clone(),
                retry_after_ms: next.millis_since(now),
            });
        }

        inner.state = BreakerState::HalfOpen;
        inner.success_count = 0;
        info!(breaker = %self.name, "circuit half-open, probing");
        Ok(())
    }

    pub fn record_success_at(&self, _now: Timestamp) {
        let mut inner = self.lock();
        inner.total_successes += 1;
        inner.consecutive_failures = 0;

        match inner.state {
            BreakerState::Closed => {
                inner.failure_timestamps.clear();
            }
            BreakerState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.success_count = 0;
                    inner.failure_timestamps.clear();
                    inner.next_attempt_at = None;
                    info!(breaker = %self.name, "circuit closed");
                }
            }
            // a call admitted before the breaker tripped finished late
            BreakerState::Open => {}
        }
    }

    pub fn record_failure_at(&self, now: Timestamp, description: &str) {
        let mut inner = self.lock();
        inner.total_failures += 1;
        inner.consecutive_failures += 1;
        inner.last_failure = Some(description.to_string());

        match inner.state {
            BreakerState::Closed => {
                inner.failure_timestamps.push_back(now);
                inner.prune(now, self.config.monitoring_window_ms);
                let count = inner.failure_timestamps.len() as u32;
                debug!(breaker = %self.name, failures = count, "failure recorded");
                if count >= self.config.failure_threshold {
                    inner.open(now, self.config.timeout_ms);
                    warn!(
                        breaker = %self.name,
                        failures = count,
                        timeout_ms = self.config.timeout_ms,
                        last_error = description,
                        "circuit opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.open(now, self.config.timeout_ms);
                warn!(breaker = %self.name, last_error = description, "probe failed, circuit re-opened");
            }
            // open window is not extended by stragglers
            BreakerState::Open => {}
        }
    }

    /// Run `op` through the breaker, recording its outcome.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        if let Err(BreakerError::Open { name, retry_after_ms }) = self.try_acquire_at(Timestamp::now()) {
            return Err(BreakerError::Open { name, retry_after_ms });
        }

        match op().await {
            Ok(value) => {
                self.record_success_at(Timestamp::now());
                Ok(value)
            }
            Err(e) => {
                self.record_failure_at(Timestamp::now(), &e.to_string());
                Err(BreakerError::Inner(e))
            }
        }
    }

    pub fn snapshot_at(&self, now: Timestamp) -> BreakerSnapshot {
        let mut inner = self.lock();
        inner.prune(now, self.config.monitoring_window_ms);
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_timestamps.len() as u32,
            success_count: inner.success_count,
            consecutive_failures: inner.consecutive_failures,
            next_attempt_at: inner.next_attempt_at,
            total_trips: inner.total_trips,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            last_failure: inner.last_failure.clone(),
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        self.snapshot_at(Timestamp::now())
    }

    /// Operator reset back to closed. Lifetime totals are kept.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = BreakerState::Closed;
        inner.failure_timestamps.clear();
        inner.success_count = 0;
        inner.consecutive_failures = 0;
        inner.next_attempt_at = None;
        info!(breaker = %self.name, "circuit reset");
    }
}

/// The breakers owned by the orchestrator, one per network endpoint.
#[derive(Debug, Clone)]
pub struct BreakerSet {
    pub health: Arc<CircuitBreaker>,
    pub quote: Arc<CircuitBreaker>,
    pub swap: Arc<CircuitBreaker>,
}

impl BreakerSet {
    pub fn new(config: &BreakerSetConfig) -> Self {
        Self {
            health: Arc::new(CircuitBreaker::new("health", config.health.clone())),
            quote: Arc::new(CircuitBreaker::new("quote", config.quote.clone())),
            swap: Arc::new(CircuitBreaker::new("swap", config.swap.clone())),
        }
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let now = Timestamp::now();
        vec![
            self.health.snapshot_at(now),
            self.quote.snapshot_at(now),
            self.swap.snapshot_at(now),
        ]
    }

    /// Consecutive failures across endpoints, used by the API failure trigger.
    pub fn consecutive_api_failures(&self) -> u32 {
        self.health
            .consecutive_failures()
            .max(self.quote.consecutive_failures())
            .max(self.swap.consecutive_failures())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new("test", BreakerConfig::new(threshold, 2, 10_000, 60_000))
    }

    fn at(ms: i64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    #[test]
    fn opens_after_threshold_failures() {
        let cb = breaker(5);
        for i in 0..4 {
            cb.record_failure_at(at(i * 1_000), "timeout");
            assert_eq!(cb.state(), BreakerState::Closed);
        }
        cb.record_failure_at(at(4_000), "timeout");
        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(cb.snapshot_at(at(4_000)).next_attempt_at, Some(at(14_000)));
    }

    #[test]
    fn old_failures_fall_out_of_window() {
        let cb = breaker(3);
        cb.record_failure_at(at(0), "a");
        cb.record_failure_at(at(1_000), "b");
        // first two are outside the 60s window by now
        cb.record_failure_at(at(70_000), "c");
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.snapshot_at(at(70_000)).failure_count, 1);
    }

    #[test]
    fn open_rejects_until_timeout() {
        let cb = breaker(1);
        cb.record_failure_at(at(0), "boom");

        let err = cb.try_acquire_at(at(5_000)).unwrap_err();
        assert!(matches!(err, BreakerError::Open { retry_after_ms: 5_000, .. }));
        assert_eq!(cb.state(), BreakerState::Open);

        assert!(cb.try_acquire_at(at(10_000)).is_ok());
        assert_eq!(cb.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn half_open_closes_after_successes() {
        let cb = breaker(1);
        cb.record_failure_at(at(0), "boom");
        cb.try_acquire_at(at(10_000)).unwrap();

        cb.record_success_at(at(10_001));
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.record_success_at(at(10_002));
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let cb = breaker(1);
        cb.record_failure_at(at(0), "boom");
        cb.try_acquire_at(at(10_000)).unwrap();
        cb.record_success_at(at(10_001));
        cb.record_failure_at(at(10_002), "again");

        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(cb.snapshot_at(at(10_002)).next_attempt_at, Some(at(20_002)));
        assert_eq!(cb.snapshot_at(at(10_002)).total_trips, 2);
    }

    #[test]
    fn success_in_closed_clears_failures() {
        let cb = breaker(3);
        cb.record_failure_at(at(0), "a");
        cb.record_failure_at(at(1), "b");
        cb.record_success_at(at(2));
        cb.record_failure_at(at(3), "c");
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.consecutive_failures(), 1);
    }

    #[test]
    fn reset_closes_breaker() {
        let cb = breaker(1);
        cb.record_failure_at(at(0), "boom");
        cb.reset();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.snapshot_at(at(1)).total_trips, 1);
    }

    #[test]
    fn swap_defaults_are_stricter() {
        let set = BreakerSetConfig::default();
        assert!(set.swap.failure_threshold < set.quote.failure_threshold);
        assert!(set.swap.timeout_ms > set.quote.timeout_ms);
    }

    #[tokio::test]
    async fn call_skips_operation_when_open() {
        let cb = breaker(1);
        let first: Result<(), BreakerError<String>> = cb.call(|| async { Err("down".to_string()) }).await;
        assert!(matches!(first, Err(BreakerError::Inner(_))));

        let mut invoked = false;
        let second: Result<(), BreakerError<String>> = cb
            .call(|| {
                invoked = true;
                async { Ok(()) }
            })
            .await;
        assert!(second.unwrap_err().is_open());
        assert!(!invoked);
    }
}
