//! In-memory collaborators with scriptable failures.
//!
//! Used by the `sentinel-sim` binary and the integration tests. Every knob is
//! interior-mutable so a scenario can flip it while the loop is running.

use crate::collaborators::{
    LiquidityClass, MarketAnalyzer, MarketCondition, NetworkClient, NetworkError, PortfolioSnapshot, PortfolioSource,
    Strategy, StrategyKind, SwapQuote, SwapReceipt, Trend, VolatilityClass,
};
use crate::orchestrator::Collaborators;
use crate::types::{Quote, Timestamp, TokenId};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
pub struct SimNetwork {
    healthy: AtomicBool,
    swaps_fail: AtomicBool,
    liquidation_fails: AtomicBool,
    latency: Mutex<Duration>,
    prices: Mutex<HashMap<TokenId, Decimal>>,
    health_calls: AtomicU64,
    quote_calls: AtomicU64,
    price_calls: AtomicU64,
    swap_calls: AtomicU64,
    liquidations: AtomicU64,
    tx_seq: AtomicU64,
}

impl Default for SimNetwork {
    fn default() -> Self {
        let prices = [("WRON", dec!(2.10)), ("AXS", dec!(7.50)), ("SLP", dec!(0.004)), ("USDC", dec!(1))]
            .into_iter()
            .map(|(t, p)| (TokenId::new(t), p))
            .collect();
        Self {
            healthy: AtomicBool::new(true),
            swaps_fail: AtomicBool::new(false),
            liquidation_fails: AtomicBool::new(false),
            latency: Mutex::new(Duration::ZERO),
            prices: Mutex::new(prices),
            health_calls: AtomicU64::new(0),
            quote_calls: AtomicU64::new(0),
            price_calls: AtomicU64::new(0),
            swap_calls: AtomicU64::new(0),
            liquidations: AtomicU64::new(0),
            tx_seq: AtomicU64::new(0),
        }
    }
}

impl SimNetwork {
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_swaps_fail(&self, fail: bool) {
        self.swaps_fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_liquidation_fails(&self, fail: bool) {
        self.liquidation_fails.store(fail, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    pub fn set_price(&self, token: impl Into<TokenId>, price: Decimal) {
        lock(&self.prices).insert(token.into(), price);
    }

    pub fn health_calls(&self) -> u64 {
        self.health_calls.load(Ordering::SeqCst)
    }

    pub fn quote_calls(&self) -> u64 {
        self.quote_calls.load(Ordering::SeqCst)
    }

    pub fn price_calls(&self) -> u64 {
        self.price_calls.load(Ordering::SeqCst)
    }

    pub fn swap_calls(&self) -> u64 {
        self.swap_calls.load(Ordering::SeqCst)
    }

    pub fn liquidations(&self) -> u64 {
        self.liquidations.load(Ordering::SeqCst)
    }

    async fn delay(&self) {
        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl NetworkClient for SimNetwork {
    async fn health_check(&self) -> Result<bool, NetworkError> {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        if self.healthy.load(Ordering::SeqCst) {
            Ok(true)
        } else {
            Err(NetworkError::Unavailable("simulated outage".to_string()))
        }
    }

    async fn get_quote(&self, token_in: &TokenId, token_out: &TokenId, amount_in: Quote) -> Result<SwapQuote, NetworkError> {
        self.quote_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        let price_out = lock(&self.prices).get(token_out).copied();
        let Some(price_out) = price_out.filter(|p| *p > Decimal::ZERO) else {
            return Err(NetworkError::Rejected(format!("no pool for {}", token_out)));
        };
        Ok(SwapQuote {
            token_in: token_in.clone(),
            token_out: token_out.clone(),
            amount_in,
            expected_out: amount_in.value() / price_out,
            price_impact: dec!(0.001),
        })
    }

    async fn get_prices(&self, tokens: &[TokenId]) -> Result<HashMap<TokenId, Decimal>, NetworkError> {
        self.price_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        let prices = lock(&self.prices);
        Ok(tokens
            .iter()
            .filter_map(|t| prices.get(t).map(|p| (t.clone(), *p)))
            .collect())
    }

    async fn execute_swap(&self, quote: &SwapQuote, slippage_tolerance: Decimal) -> Result<SwapReceipt, NetworkError> {
        self.swap_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        if self.swaps_fail.load(Ordering::SeqCst) {
            return Err(NetworkError::Rejected("simulated swap revert".to_string()));
        }
        let seq = self.tx_seq.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SwapReceipt {
            transaction_id: format!("0xsim{:08x}", seq),
            amount_in: quote.amount_in,
            amount_out: quote.expected_out * (Decimal::ONE - slippage_tolerance / dec!(2)),
        })
    }

    async fn liquidate_positions(&self) -> Result<Vec<SwapReceipt>, NetworkError> {
        self.liquidations.fetch_add(1, Ordering::SeqCst);
        if self.liquidation_fails.load(Ordering::SeqCst) {
            return Err(NetworkError::Unavailable("simulated liquidation failure".to_string()));
        }
        Ok(Vec::new())
    }
}

#[derive(Debug)]
struct PortfolioValues {
    total: Quote,
    baseline: Quote,
    daily_start: Quote,
    max_concentration: Decimal,
}

#[derive(Debug)]
pub struct SimPortfolio {
    values: Mutex<PortfolioValues>,
    fails: AtomicBool,
    calls: AtomicU64,
}

impl SimPortfolio {
    pub fn new(total: Decimal, baseline: Decimal, daily_start: Decimal, max_concentration: Decimal) -> Self {
        Self {
            values: Mutex::new(PortfolioValues {
                total: Quote::new(total),
                baseline: Quote::new(baseline),
                daily_start: Quote::new(daily_start),
                max_concentration,
            }),
            fails: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        }
    }

    pub fn set_total(&self, total: Decimal) {
        lock(&self.values).total = Quote::new(total);
    }

    pub fn set_concentration(&self, max_concentration: Decimal) {
        lock(&self.values).max_concentration = max_concentration;
    }

    pub fn set_fails(&self, fail: bool) {
        self.fails.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for SimPortfolio {
    fn default() -> Self {
        Self::new(dec!(10000), dec!(10000), dec!(10000), dec!(0.10))
    }
}

#[async_trait]
impl PortfolioSource for SimPortfolio {
    async fn get_portfolio_snapshot(&self, _wallet: &str) -> Result<PortfolioSnapshot, NetworkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fails.load(Ordering::SeqCst) {
            return Err(NetworkError::Unavailable("portfolio indexer down".to_string()));
        }
        let v = lock(&self.values);
        Ok(PortfolioSnapshot::new(v.total, v.baseline, v.daily_start, v.max_concentration, Timestamp::now()))
    }
}

#[derive(Debug)]
pub struct SimMarket {
    condition: Mutex<MarketCondition>,
    favorable: AtomicBool,
    delay: Mutex<Duration>,
    calls: AtomicU64,
}

impl SimMarket {
    pub fn new(condition: MarketCondition) -> Self {
        Self {
            condition: Mutex::new(condition),
            favorable: AtomicBool::new(true),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicU64::new(0),
        }
    }

    pub fn set_condition(&self, condition: MarketCondition) {
        *lock(&self.condition) = condition;
    }

    pub fn set_favorable(&self, favorable: bool) {
        self.favorable.store(favorable, Ordering::SeqCst);
    }

    /// Slow down analysis, to hold a cycle open.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for SimMarket {
    fn default() -> Self {
        Self::new(MarketCondition {
            trend: Trend::Bullish,
            volatility: VolatilityClass::Low,
            liquidity: LiquidityClass::High,
            confidence: 80,
        })
    }
}

#[async_trait]
impl MarketAnalyzer for SimMarket {
    async fn analyze_market(&self) -> Result<MarketCondition, NetworkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(*lock(&self.condition))
    }

    async fn is_favorable_for_trading(&self) -> Result<bool, NetworkError> {
        Ok(self.favorable.load(Ordering::SeqCst))
    }
}

#[derive(Debug)]
pub struct SimStrategy {
    kind: StrategyKind,
    runs: AtomicU64,
    fails: AtomicBool,
}

impl SimStrategy {
    pub fn new(kind: StrategyKind) -> Self {
        Self {
            kind,
            runs: AtomicU64::new(0),
            fails: AtomicBool::new(false),
        }
    }

    pub fn set_fails(&self, fail: bool) {
        self.fails.store(fail, Ordering::SeqCst);
    }

    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Strategy for SimStrategy {
    fn kind(&self) -> StrategyKind {
        self.kind
    }

    async fn execute(&self) -> Result<(), NetworkError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.fails.load(Ordering::SeqCst) {
            return Err(NetworkError::Rejected(format!("{} found nothing to do", self.kind)));
        }
        Ok(())
    }

    fn status(&self) -> String {
        format!("{} ran {} times", self.kind, self.runs())
    }
}

/// One of everything, with handles kept for scripting.
#[derive(Debug, Clone)]
pub struct SimWorld {
    pub network: Arc<SimNetwork>,
    pub portfolio: Arc<SimPortfolio>,
    pub market: Arc<SimMarket>,
    pub strategies: Vec<Arc<SimStrategy>>,
}

impl Default for SimWorld {
    fn default() -> Self {
        Self {
            network: Arc::new(SimNetwork::default()),
            portfolio: Arc::new(SimPortfolio::default()),
            market: Arc::new(SimMarket::default()),
            strategies: [
                StrategyKind::Arbitrage,
                StrategyKind::MarketMaking,
                StrategyKind::NftAnalytics,
                StrategyKind::CrossGame,
            ]
            .into_iter()
            .map(|kind| Arc::new(SimStrategy::new(kind)))
            .collect(),
        }
    }
}

impl SimWorld {
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            network: self.network.clone(),
            portfolio: self.portfolio.clone(),
            market: self.market.clone(),
            strategies: self
                .strategies
                .iter()
                .map(|s| s.clone() as Arc<dyn Strategy>)
                .collect(),
        }
    }

    pub fn strategy(&self, kind: StrategyKind) -> Option<&Arc<SimStrategy>> {
        self.strategies.iter().find(|s| s.kind() == kind)
    }

    pub fn total_strategy_runs(&self) -> u64 {
        self.strategies.iter().map(|s| s.runs()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_network_failures() {
        let net = SimNetwork::default();
        assert!(net.health_check().await.unwrap());
        net.set_healthy(false);
        assert!(net.health_check().await.is_err());
        assert_eq!(net.health_calls(), 2);
    }

    #[tokio::test]
    async fn quotes_need_a_price() {
        let net = SimNetwork::default();
        let quote = net
            .get_quote(&TokenId::new("USDC"), &TokenId::new("AXS"), Quote::new(dec!(75)))
            .await
            .unwrap();
        assert_eq!(quote.expected_out, dec!(10));
        assert!(net
            .get_quote(&TokenId::new("USDC"), &TokenId::new("NOPE"), Quote::new(dec!(1)))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn portfolio_snapshot_reflects_script() {
        let p = SimPortfolio::new(dec!(540), dec!(1000), dec!(1000), dec!(0.1));
        let snap = p.get_portfolio_snapshot("w").await.unwrap();
        assert_eq!(snap.daily_loss_ratio(), dec!(0.46));
        p.set_fails(true);
        assert!(p.get_portfolio_snapshot("w").await.is_err());
    }
}
