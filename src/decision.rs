//! Strategy selection.
//!
//! An ordered table of rules keyed by market condition and risk level. The
//! first rule whose every criterion matches decides which strategies run;
//! no match means the cycle dispatches nothing. High and critical risk never
//! dispatch, whatever the table says.

use crate::collaborators::{LiquidityClass, MarketCondition, StrategyKind, Trend, VolatilityClass};
use crate::types::RiskLevel;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecisionRule {
    pub name: String,
    /// None matches any trend.
    #[serde(default)]
    pub trend: Option<Trend>,
    pub min_confidence: u8,
    pub max_volatility: VolatilityClass,
    pub min_liquidity: LiquidityClass,
    pub max_risk_level: RiskLevel,
    pub strategies: Vec<StrategyKind>,
}

impl DecisionRule {
    pub fn matches(&self, condition: &MarketCondition, risk_level: RiskLevel) -> bool {
        self.trend.map_or(true, |t| t == condition.trend)
            && condition.confidence >= self.min_confidence
            && condition.volatility <= self.max_volatility
            && condition.liquidity >= self.min_liquidity
            && risk_level <= self.max_risk_level
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub rule: Option<String>,
    pub strategies: Vec<StrategyKind>,
}

impl Decision {
    fn none() -> Self {
        Self {
            rule: None,
            strategies: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DecisionMatrix {
    pub rules: Vec<DecisionRule>,
}

impl Default for DecisionMatrix {
    fn default() -> Self {
        use LiquidityClass as L;
        use StrategyKind as S;
        use VolatilityClass as V;

        let rule = |name: &str,
                    trend: Option<Trend>,
                    min_confidence: u8,
                    max_volatility: V,
                    min_liquidity: L,
                    max_risk_level: RiskLevel,
                    strategies: Vec<S>| DecisionRule {
            name: name.to_string(),
            trend,
            min_confidence,
            max_volatility,
            min_liquidity,
            max_risk_level,
            strategies,
        };

        Self {
            rules: vec![
                rule(
                    "bullish_low_risk",
                    Some(Trend::Bullish),
                    60,
                    V::High,
                    L::Medium,
                    RiskLevel::Low,
                    vec![S::Arbitrage, S::MarketMaking, S::CrossGame],
                ),
                rule(
                    "sideways_low_risk",
                    Some(Trend::Sideways),
                    50,
                    V::Medium,
                    L::Medium,
                    RiskLevel::Low,
                    vec![S::MarketMaking, S::Arbitrage],
                ),
                rule(
                    "bearish_low_risk",
                    Some(Trend::Bearish),
                    60,
                    V::Medium,
                    L::High,
                    RiskLevel::Low,
                    vec![S::Arbitrage],
                ),
                rule(
                    "thin_market_analytics",
                    None,
                    40,
                    V::High,
                    L::Low,
                    RiskLevel::Low,
                    vec![S::NftAnalytics],
                ),
                // medium risk requires confidence >= 70
                rule(
                    "medium_risk_confident",
                    None,
                    70,
                    V::Medium,
                    L::Medium,
                    RiskLevel::Medium,
                    vec![S::Arbitrage],
                ),
            ],
        }
    }
}

impl DecisionMatrix {
    pub fn validate(&self) -> Result<(), String> {
        for rule in &self.rules {
            if rule.min_confidence > 100 {
                return Err(format!("rule '{}': min_confidence above 100", rule.name));
            }
            if rule.max_risk_level.blocks_trading() {
                return Err(format!(
                    "rule '{}': max_risk_level {} would dispatch at blocked risk",
                    rule.name, rule.max_risk_level
                ));
            }
            if rule.strategies.is_empty() {
                return Err(format!("rule '{}': no strategies", rule.name));
            }
        }
        Ok(())
    }

    /// First matching rule wins.
    pub fn select(&self, condition: &MarketCondition, risk_level: RiskLevel) -> Decision {
        if risk_level.blocks_trading() {
            return Decision::none();
        }
        self.rules
            .iter()
            .find(|r| r.matches(condition, risk_level))
            .map(|r| Decision {
                rule: Some(r.name.clone()),
                strategies: r.strategies.clone(),
            })
            .unwrap_or_else(Decision::none)
    }
}
