//! Risk monitoring for the portfolio as a whole.
//!
//! Recomputes a composite risk score every cycle from the latest portfolio
//! snapshot and classifies it into a risk level. Hard limits override the
//! composite score: one breached limit stops trading even when the score is low.

use crate::collaborators::{NetworkError, PortfolioSnapshot, PortfolioSource};
use crate::limits::TradeRequest;
use crate::types::{Quote, RiskLevel, Timestamp};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Relative weight of each factor in the composite score. Must sum to 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RiskWeights {
    pub daily_loss: Decimal,
    pub total_loss: Decimal,
    pub concentration: Decimal,
    pub volatility: Decimal,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            daily_loss: dec!(0.35),
            total_loss: dec!(0.30),
            concentration: dec!(0.20),
            volatility: dec!(0.15),
        }
    }
}

impl RiskWeights {
    pub fn sum(&self) -> Decimal {
        self.daily_loss + self.total_loss + self.concentration + self.volatility
    }
}

/// Risk parameters for scoring and hard limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RiskParams {
    pub weights: RiskWeights,
    /// Scores below this are low risk (score range is 0-100).
    pub low_cutoff: Decimal,
    pub medium_cutoff: Decimal,
    /// Scores at or above this are critical.
    pub high_cutoff: Decimal,
    /// Daily loss fraction that stops trading outright.
    pub max_daily_loss_pct: Decimal,
    /// Loss fraction against baseline that requests liquidation.
    pub max_total_loss_pct: Decimal,
    /// Single-token share that asks for exposure reduction.
    pub max_concentration_pct: Decimal,
    /// Window range (max-min)/min treated as fully volatile.
    pub max_volatility: Decimal,
    /// Largest trade as a fraction of portfolio value.
    pub max_trade_pct: Decimal,
    /// Volatility history window in milliseconds.
    pub volatility_window_ms: i64,
    pub max_history: usize,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            weights: RiskWeights::default(),
            low_cutoff: dec!(25),
            medium_cutoff: dec!(50),
            high_cutoff: dec!(75),
            max_daily_loss_pct: dec!(0.15),
            max_total_loss_pct: dec!(0.30),
            max_concentration_pct: dec!(0.50),
            max_volatility: dec!(0.20),
            max_trade_pct: dec!(0.10),
            volatility_window_ms: 3_600_000,
            max_history: 1_000,
        }
    }
}

impl RiskParams {
    pub fn validate(&self) -> Result<(), String> {
        if self.weights.sum() != Decimal::ONE {
            return Err(format!("risk weights must sum to 1, got {}", self.weights.sum()));
        }
        if !(Decimal::ZERO < self.low_cutoff && self.low_cutoff < self.medium_cutoff && self.medium_cutoff < self.high_cutoff && self.high_cutoff <= dec!(100)) {
            return Err("cutoffs must satisfy 0 < low < medium < high <= 100".to_string());
        }
        for (name, value) in [
            ("max_daily_loss_pct", self.max_daily_loss_pct),
            ("max_total_loss_pct", self.max_total_loss_pct),
            ("max_concentration_pct", self.max_concentration_pct),
            ("max_volatility", self.max_volatility),
            ("max_trade_pct", self.max_trade_pct),
        ] {
            if value <= Decimal::ZERO || value > Decimal::ONE {
                return Err(format!("{} must be in (0, 1]", name));
            }
        }
        if self.volatility_window_ms <= 0 || self.max_history < 2 {
            return Err("volatility window must be positive and history at least 2".to_string());
        }
        Ok(())
    }

    pub fn classify(&self, score: Decimal) -> RiskLevel {
        if score < self.low_cutoff {
            RiskLevel::Low
        } else if score < self.medium_cutoff {
            RiskLevel::Medium
        } else if score < self.high_cutoff {
            RiskLevel::High
        } else {
            RiskLevel::Critical
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmergencyAction {
    StopAllTrading,
    EmergencyLiquidation,
    ReduceExposure,
}

/// Fresh result of one risk check. Never merged with earlier assessments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub risk_level: RiskLevel,
    pub risk_score: Decimal,
    pub alerts: Vec<String>,
    pub emergency_actions: BTreeSet<EmergencyAction>,
    pub should_continue_trading: bool,
    /// Volatility proxy the score was computed with.
    pub volatility: Decimal,
    pub assessed_at: Timestamp,
}

/// Verdict of `validate_trade`. `adjusted_amount` is advisory only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeValidation {
    pub approved: bool,
    pub reason: Option<String>,
    pub adjusted_amount: Option<Quote>,
}

impl TradeValidation {
    fn approve() -> Self {
        Self {
            approved: true,
            reason: None,
            adjusted_amount: None,
        }
    }

    fn reject(reason: String, adjusted_amount: Option<Quote>) -> Self {
        Self {
            approved: false,
            reason: Some(reason),
            adjusted_amount,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RiskMonitor {
    params: RiskParams,
    /// Recent portfolio values for the volatility proxy.
    value_history: Vec<(Timestamp, Quote)>,
    latest: Option<RiskAssessment>,
    checks_run: u64,
}

impl RiskMonitor {
    pub fn new(params: RiskParams) -> Self {
        Self {
            params,
            value_history: Vec::with_capacity(64),
            latest: None,
            checks_run: 0,
        }
    }

    pub fn params(&self) -> &RiskParams {
        &self.params
    }

    pub fn set_params(&mut self, params: RiskParams) {
        self.params = params;
    }

    /// Last assessment, kept for inspection only.
    pub fn latest_assessment(&self) -> Option<&RiskAssessment> {
        self.latest.as_ref()
    }

    pub fn current_level(&self) -> Option<RiskLevel> {
        self.latest.as_ref().map(|a| a.risk_level)
    }

    pub fn checks_run(&self) -> u64 {
        self.checks_run
    }

    /// Fetch a snapshot for `wallet` and assess it.
    pub async fn perform_risk_check(
        &mut self,
        portfolio: &dyn PortfolioSource,
        wallet: &str,
    ) -> Result<RiskAssessment, NetworkError> {
        let snapshot = portfolio.get_portfolio_snapshot(wallet).await?;
        Ok(self.assess(&snapshot))
    }

    fn record_value(&mut self, snapshot: &PortfolioSnapshot) {
        self.value_history.push((snapshot.timestamp, snapshot.total_value));

        let cutoff = snapshot.timestamp.as_millis() - self.params.volatility_window_ms;
        self.value_history.retain(|(ts, _)| ts.as_millis() >= cutoff);

        if self.value_history.len() > self.params.max_history {
            let excess = self.value_history.len() - self.params.max_history;
            self.value_history.drain(0..excess);
        }
    }

    /// Range of portfolio values in the window relative to its low.
    pub fn volatility(&self) -> Decimal {
        if self.value_history.len() < 2 {
            return Decimal::ZERO;
        }
        let values = self.value_history.iter().map(|(_, v)| *v);
        let (Some(min), Some(max)) = (values.clone().min(), values.max()) else {
            return Decimal::ZERO;
        };
        (max.sub(min)).ratio_to(min).unwrap_or(Decimal::ZERO)
    }

    /// Score the snapshot, classify it and decide whether trading may continue.
    pub fn assess(&mut self, snapshot: &PortfolioSnapshot) -> RiskAssessment {
        self.record_value(snapshot);
        self.checks_run += 1;

        let p = &self.params;
        let daily_loss = snapshot.daily_loss_ratio();
        let total_loss = snapshot.total_loss_ratio();
        let concentration = snapshot.max_concentration.max(Decimal::ZERO);
        let volatility = self.volatility();

        let factor = |value: Decimal, limit: Decimal| (value / limit).min(Decimal::ONE);
        let risk_score = (dec!(100)
            * (p.weights.daily_loss * factor(daily_loss, p.max_daily_loss_pct)
                + p.weights.total_loss * factor(total_loss, p.max_total_loss_pct)
                + p.weights.concentration * factor(concentration, p.max_concentration_pct)
                + p.weights.volatility * factor(volatility, p.max_volatility)))
            .round_dp(2);
        let risk_level = p.classify(risk_score);

        let mut alerts = Vec::new();
        let mut actions = BTreeSet::new();

        if daily_loss >= p.max_daily_loss_pct {
            alerts.push(format!(
                "Daily loss {:.2}% breaches limit {:.2}%",
                daily_loss * dec!(100),
                p.max_daily_loss_pct * dec!(100)
            ));
            actions.insert(EmergencyAction::StopAllTrading);
        }
        if total_loss >= p.max_total_loss_pct {
            alerts.push(format!(
                "Total loss {:.2}% breaches limit {:.2}%",
                total_loss * dec!(100),
                p.max_total_loss_pct * dec!(100)
            ));
            actions.insert(EmergencyAction::StopAllTrading);
            actions.insert(EmergencyAction::EmergencyLiquidation);
        }
        if concentration > p.max_concentration_pct {
            alerts.push(format!(
                "Concentration {:.2}% above {:.2}%",
                concentration * dec!(100),
                p.max_concentration_pct * dec!(100)
            ));
            actions.insert(EmergencyAction::ReduceExposure);
        }

        match risk_level {
            RiskLevel::High => {
                alerts.push(format!("High risk score {}", risk_score));
                actions.insert(EmergencyAction::StopAllTrading);
            }
            RiskLevel::Critical => {
                alerts.push(format!("Critical risk score {}", risk_score));
                actions.insert(EmergencyAction::StopAllTrading);
                actions.insert(EmergencyAction::EmergencyLiquidation);
            }
            RiskLevel::Low | RiskLevel::Medium => {}
        }

        let should_continue_trading = actions.is_empty();

        if should_continue_trading {
            debug!(score = %risk_score, level = %risk_level, "risk check passed");
        } else {
            warn!(score = %risk_score, level = %risk_level, ?actions, "risk check halted trading");
        }

        let assessment = RiskAssessment {
            risk_level,
            risk_score,
            alerts,
            emergency_actions: actions,
            should_continue_trading,
            volatility,
            assessed_at: snapshot.timestamp,
        };
        self.latest = Some(assessment.clone());
        assessment
    }

    /// Check one trade against the current snapshot. May suggest a smaller amount.
    pub fn validate_trade(&self, trade: &TradeRequest, snapshot: &PortfolioSnapshot) -> TradeValidation {
        let p = &self.params;

        if !trade.amount_in.is_positive() {
            return TradeValidation::reject("Trade amount must be positive".to_string(), None);
        }
        if !snapshot.total_value.is_positive() {
            return TradeValidation::reject("Portfolio has no value".to_string(), None);
        }

        let daily_loss = snapshot.daily_loss_ratio();
        if daily_loss >= p.max_daily_loss_pct {
            return TradeValidation::reject(
                format!("Daily loss {:.2}% already at limit", daily_loss * dec!(100)),
                None,
            );
        }

        let level = self.current_level().unwrap_or(RiskLevel::Low);
        if level.blocks_trading() {
            return TradeValidation::reject(format!("Risk level is {}", level), None);
        }

        // medium risk halves the per-trade allowance
        let trade_pct = if level == RiskLevel::Medium {
            p.max_trade_pct / dec!(2)
        } else {
            p.max_trade_pct
        };
        let mut allowed = snapshot.total_value.mul(trade_pct);

        let concentration_room = p.max_concentration_pct - snapshot.max_concentration;
        allowed = allowed.min(snapshot.total_value.mul(concentration_room.max(Decimal::ZERO)));

        if trade.amount_in <= allowed {
            return TradeValidation::approve();
        }

        let adjusted = Quote::new(allowed.value().round_dp_with_strategy(2, rust_decimal::RoundingStrategy::ToZero));
        let suggestion = adjusted.is_positive().then_some(adjusted);
        TradeValidation::reject(
            format!(
                "Trade of {} exceeds risk-adjusted allowance {} at {} risk",
                trade.amount_in, adjusted, level
            ),
            suggestion,
        )
    }
}
