// 8.0 collaborators.rs: capability interfaces for everything the control loop does not own.
// exchange client, strategies, market analysis, portfolio valuation. all async, all fallible.

use crate::types::{Quote, Timestamp, TokenId};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("rate limited: {0}")]
    RateLimited(String),
}

/// 8.1: immutable valuation produced once per cycle by the portfolio collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub total_value: Quote,
    pub daily_pnl: Quote,
    pub total_pnl: Quote,
    pub baseline_value: Quote,
    pub daily_start_value: Quote,
    /// Largest single-token share of the portfolio (0.4 = 40%).
    pub max_concentration: Decimal,
    pub timestamp: Timestamp,
}

impl PortfolioSnapshot {
    /// Builds a snapshot deriving both pnl figures from the reference values.
    pub fn new(
        total_value: Quote,
        baseline_value: Quote,
        daily_start_value: Quote,
        max_concentration: Decimal,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            total_value,
            daily_pnl: total_value.sub(daily_start_value),
            total_pnl: total_value.sub(baseline_value),
            baseline_value,
            daily_start_value,
            max_concentration,
            timestamp,
        }
    }

    /// Daily pnl as a fraction of the day's starting value. -0.46 = down 46%.
    pub fn daily_pnl_ratio(&self) -> Decimal {
        self.daily_pnl.ratio_to(self.daily_start_value).unwrap_or(Decimal::ZERO)
    }

    pub fn total_pnl_ratio(&self) -> Decimal {
        self.total_pnl.ratio_to(self.baseline_value).unwrap_or(Decimal::ZERO)
    }

    /// Loss fractions are positive numbers, zero when in profit.
    pub fn daily_loss_ratio(&self) -> Decimal {
        (-self.daily_pnl_ratio()).max(Decimal::ZERO)
    }

    pub fn total_loss_ratio(&self) -> Decimal {
        (-self.total_pnl_ratio()).max(Decimal::ZERO)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapQuote {
    pub token_in: TokenId,
    pub token_out: TokenId,
    pub amount_in: Quote,
    pub expected_out: Decimal,
    /// Expected price impact as a fraction.
    pub price_impact: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapReceipt {
    pub transaction_id: String,
    pub amount_in: Quote,
    pub amount_out: Decimal,
}

/// 8.2: exchange client. every call goes through a breaker owned by the caller.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    async fn health_check(&self) -> Result<bool, NetworkError>;

    async fn get_quote(&self, token_in: &TokenId, token_out: &TokenId, amount_in: Quote) -> Result<SwapQuote, NetworkError>;

    async fn get_prices(&self, tokens: &[TokenId]) -> Result<HashMap<TokenId, Decimal>, NetworkError>;

    async fn execute_swap(&self, quote: &SwapQuote, slippage_tolerance: Decimal) -> Result<SwapReceipt, NetworkError>;

    /// Close every open position back to the quote asset.
    async fn liquidate_positions(&self) -> Result<Vec<SwapReceipt>, NetworkError>;
}

#[async_trait]
pub trait PortfolioSource: Send + Sync {
    async fn get_portfolio_snapshot(&self, wallet: &str) -> Result<PortfolioSnapshot, NetworkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Bullish,
    Bearish,
    Sideways,
}

// ordered so comparisons read naturally: Low < Extreme
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolatilityClass {
    Low,
    Medium,
    High,
    Extreme,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiquidityClass {
    Low,
    Medium,
    High,
}

/// 8.3: market analysis output consumed by the decision matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketCondition {
    pub trend: Trend,
    pub volatility: VolatilityClass,
    pub liquidity: LiquidityClass,
    /// 0-100.
    pub confidence: u8,
}

impl fmt::Display for MarketCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{:?} volatility/{:?} liquidity/{}% confidence",
            self.trend, self.volatility, self.liquidity, self.confidence
        )
    }
}

#[async_trait]
pub trait MarketAnalyzer: Send + Sync {
    async fn analyze_market(&self) -> Result<MarketCondition, NetworkError>;

    async fn is_favorable_for_trading(&self) -> Result<bool, NetworkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Arbitrage,
    MarketMaking,
    NftAnalytics,
    CrossGame,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StrategyKind::Arbitrage => "arbitrage",
            StrategyKind::MarketMaking => "market_making",
            StrategyKind::NftAnalytics => "nft_analytics",
            StrategyKind::CrossGame => "cross_game",
        };
        write!(f, "{}", s)
    }
}

/// 8.4: strategies run fire-and-forget. status is reported through `status`, not the loop.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    async fn execute(&self) -> Result<(), NetworkError>;

    fn status(&self) -> String {
        format!("{} idle", self.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn snapshot_derives_pnl() {
        let snap = PortfolioSnapshot::new(
            Quote::new(dec!(540)),
            Quote::new(dec!(1000)),
            Quote::new(dec!(1000)),
            dec!(0.2),
            Timestamp::from_millis(0),
        );
        assert_eq!(snap.daily_pnl, Quote::new(dec!(-460)));
        assert_eq!(snap.daily_pnl_ratio(), dec!(-0.46));
        assert_eq!(snap.daily_loss_ratio(), dec!(0.46));
    }

    #[test]
    fn profit_is_not_a_loss() {
        let snap = PortfolioSnapshot::new(
            Quote::new(dec!(1200)),
            Quote::new(dec!(1000)),
            Quote::new(dec!(1100)),
            dec!(0.1),
            Timestamp::from_millis(0),
        );
        assert_eq!(snap.total_loss_ratio(), Decimal::ZERO);
        assert_eq!(snap.daily_loss_ratio(), Decimal::ZERO);
    }

    #[test]
    fn zero_reference_values_do_not_divide() {
        let snap = PortfolioSnapshot::new(Quote::zero(), Quote::zero(), Quote::zero(), dec!(0), Timestamp::from_millis(0));
        assert_eq!(snap.total_pnl_ratio(), Decimal::ZERO);
    }

    #[test]
    fn volatility_classes_are_ordered() {
        assert!(VolatilityClass::Extreme > VolatilityClass::High);
        assert!(LiquidityClass::Low < LiquidityClass::High);
    }
}
