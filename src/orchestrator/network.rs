// 9.1 orchestrator/network.rs: every exchange call goes limiter -> breaker -> timeout.
// a timeout is recorded against the breaker like any other failure.

use super::results::CallError;
use crate::circuit_breaker::{BreakerSet, BreakerState, CircuitBreaker};
use crate::collaborators::{NetworkClient, NetworkError, SwapQuote, SwapReceipt};
use crate::rate_limiter::{RateLimitConfig, RateLimiter};
use crate::types::{Quote, TokenId};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub(super) struct GuardedNetwork {
    client: Arc<dyn NetworkClient>,
    pub(super) breakers: BreakerSet,
    limiter: RateLimiter,
    timeout: Duration,
}

impl GuardedNetwork {
    pub(super) fn new(
        client: Arc<dyn NetworkClient>,
        breakers: BreakerSet,
        rate_limit: RateLimitConfig,
        timeout_ms: u64,
    ) -> Self {
        Self {
            client,
            breakers,
            limiter: RateLimiter::new(rate_limit),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    async fn timed<T, Fut>(&self, fut: Fut) -> Result<T, NetworkError>
    where
        Fut: Future<Output = Result<T, NetworkError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Timeout(self.timeout.as_millis() as u64)),
        }
    }

    async fn guarded<T, F, Fut>(&self, breaker: &CircuitBreaker, rate_limited: bool, op: F) -> Result<T, CallError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, NetworkError>>,
    {
        if rate_limited {
            self.limiter.acquire().await?;
        }

        let before = breaker.state();
        let result = breaker.call(|| self.timed(op())).await;
        let after = breaker.state();
        if before != after {
            warn!(breaker = breaker.name(), from = %before, to = %after, "breaker state changed");
        }
        result.map_err(CallError::from)
    }

    /// Health probe. An unhealthy answer counts as a failure.
    pub(super) async fn health_check(&self) -> Result<(), CallError> {
        self.guarded(&self.breakers.health, false, || async {
            match self.client.health_check().await? {
                true => Ok(()),
                false => Err(NetworkError::Unavailable("health check reported unhealthy".to_string())),
            }
        })
        .await
    }

    pub(super) async fn get_quote(&self, token_in: &TokenId, token_out: &TokenId, amount_in: Quote) -> Result<SwapQuote, CallError> {
        self.guarded(&self.breakers.quote, true, || self.client.get_quote(token_in, token_out, amount_in))
            .await
    }

    pub(super) async fn get_prices(&self, tokens: &[TokenId]) -> Result<HashMap<TokenId, Decimal>, CallError> {
        self.guarded(&self.breakers.quote, true, || self.client.get_prices(tokens)).await
    }

    pub(super) async fn execute_swap(&self, quote: &SwapQuote, slippage: Decimal) -> Result<SwapReceipt, CallError> {
        self.guarded(&self.breakers.swap, true, || self.client.execute_swap(quote, slippage))
            .await
    }

    /// Liquidation bypasses the limiter and breakers; only the timeout applies.
    pub(super) async fn liquidate_positions(&self) -> Result<Vec<SwapReceipt>, CallError> {
        self.timed(self.client.liquidate_positions()).await.map_err(CallError::from)
    }

    pub(super) fn breaker_states(&self) -> [(String, BreakerState); 3] {
        [
            (self.breakers.health.name().to_string(), self.breakers.health.state()),
            (self.breakers.quote.name().to_string(), self.breakers.quote.state()),
            (self.breakers.swap.name().to_string(), self.breakers.swap.state()),
        ]
    }
}
