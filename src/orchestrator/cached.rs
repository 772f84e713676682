// 9.5 orchestrator/cached.rs: decorator over the base orchestrator.
// adds a TTL price cache and runs batches in parallel up to the trade parallelism cap.

use super::core::{lock, Orchestrator};
use super::results::{CallError, ManualTradeResult, OrchestratorError, SystemStatus};
use super::TradingControl;
use crate::config::{ConfigError, SystemConfig};
use crate::limits::TradeRequest;
use crate::price_cache::PriceCache;
use crate::types::{Timestamp, TokenId};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug)]
pub struct CachedOrchestrator {
    inner: Orchestrator,
    cache: Mutex<PriceCache>,
}

impl CachedOrchestrator {
    pub fn new(inner: Orchestrator) -> Self {
        let ttl_ms = inner.price_cache_ttl_ms();
        Self {
            inner,
            cache: Mutex::new(PriceCache::new(ttl_ms)),
        }
    }

    pub fn inner(&self) -> &Orchestrator {
        &self.inner
    }

    /// (hits, misses) since construction.
    pub fn cache_stats(&self) -> (u64, u64) {
        let cache = lock(&self.cache);
        (cache.hit_count(), cache.miss_count())
    }

    pub fn clear_cache(&self) {
        lock(&self.cache).clear();
    }
}

#[async_trait]
impl TradingControl for CachedOrchestrator {
    async fn start(&self) -> Result<(), OrchestratorError> {
        self.inner.start().await
    }

    async fn stop(&self) {
        self.inner.stop().await;
    }

    async fn execute_manual_trade(&self, trade: TradeRequest, bypass_risk_check: bool) -> ManualTradeResult {
        self.inner.execute_manual_trade(trade, bypass_risk_check).await
    }

    /// Parallel batch. The semaphore inside each trade bounds concurrency;
    /// results come back in request order.
    async fn execute_batch(&self, trades: Vec<TradeRequest>) -> Vec<ManualTradeResult> {
        let runs = trades
            .into_iter()
            .map(|trade| self.inner.execute_manual_trade(trade, false));
        futures::future::join_all(runs).await
    }

    async fn emergency_stop(&self, reason: &str, liquidate_positions: bool) {
        self.inner.emergency_stop(reason, liquidate_positions).await;
    }

    async fn deactivate_emergency_stop(&self, reason: &str) {
        self.inner.deactivate_emergency_stop(reason);
    }

    async fn get_status(&self) -> SystemStatus {
        self.inner.status().await
    }

    async fn token_prices(&self, tokens: &[TokenId]) -> Result<HashMap<TokenId, Decimal>, CallError> {
        // the TTL follows the applied config, so a staged change lands with the next cycle
        let ttl_ms = self.inner.price_cache_ttl_ms();
        let lookup = {
            let mut cache = lock(&self.cache);
            cache.set_ttl(ttl_ms);
            cache.lookup(tokens, Timestamp::now())
        };
        if lookup.missing.is_empty() {
            return Ok(lookup.hits);
        }

        debug!(missing = lookup.missing.len(), cached = lookup.hits.len(), "fetching uncached prices");
        let fetched = self.inner.token_prices(&lookup.missing).await?;
        lock(&self.cache).store(&fetched, Timestamp::now());

        let mut prices = lookup.hits;
        prices.extend(fetched);
        Ok(prices)
    }

    fn update_config(&self, config: SystemConfig) -> Result<(), ConfigError> {
        self.inner.stage_config(config)
    }
}
