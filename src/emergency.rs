//! Emergency stop.
//!
//! Evaluates portfolio-level trigger rules each cycle and owns the latched
//! system-wide halt. Once latched, the halt stays until an explicit
//! deactivation; metrics recovering never clear it.
//!
//! Trigger rules, highest priority first (only the first match fires):
//! 1. total loss beyond the critical threshold: portfolio loss, critical, liquidate
//! 2. daily loss beyond its threshold: portfolio loss, error
//! 3. concentration beyond its threshold: concentration, warning
//! 4. volatility beyond its threshold: volatility, warning
//! 5. consecutive API failures beyond the threshold: API failure, error

use crate::collaborators::PortfolioSnapshot;
use crate::risk::EmergencyAction;
use crate::types::{Severity, Timestamp};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmergencyType {
    ManualStop,
    PortfolioLoss,
    ApiFailure,
    Volatility,
    Concentration,
    RiskLimit,
}

impl fmt::Display for EmergencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EmergencyType::ManualStop => "MANUAL_STOP",
            EmergencyType::PortfolioLoss => "PORTFOLIO_LOSS",
            EmergencyType::ApiFailure => "API_FAILURE",
            EmergencyType::Volatility => "VOLATILITY",
            EmergencyType::Concentration => "CONCENTRATION",
            EmergencyType::RiskLimit => "RISK_LIMIT",
        };
        write!(f, "{}", s)
    }
}

/// Per-rule trigger thresholds. Loss and concentration values are fractions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EmergencyThresholds {
    pub critical_total_loss_pct: Decimal,
    pub daily_loss_pct: Decimal,
    pub concentration_pct: Decimal,
    pub volatility: Decimal,
    pub max_consecutive_api_failures: u32,
    /// Alerts retained in memory.
    pub max_alerts: usize,
}

impl Default for EmergencyThresholds {
    fn default() -> Self {
        Self {
            critical_total_loss_pct: dec!(0.50),
            daily_loss_pct: dec!(0.20),
            concentration_pct: dec!(0.70),
            volatility: dec!(0.35),
            max_consecutive_api_failures: 5,
            max_alerts: 500,
        }
    }
}

impl EmergencyThresholds {
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("critical_total_loss_pct", self.critical_total_loss_pct),
            ("daily_loss_pct", self.daily_loss_pct),
            ("concentration_pct", self.concentration_pct),
        ] {
            if value <= Decimal::ZERO || value > Decimal::ONE {
                return Err(format!("{} must be in (0, 1]", name));
            }
        }
        if self.volatility <= Decimal::ZERO {
            return Err("volatility threshold must be positive".to_string());
        }
        if self.max_consecutive_api_failures == 0 || self.max_alerts == 0 {
            return Err("max_consecutive_api_failures and max_alerts must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Inputs to the trigger rules for one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyMetrics {
    pub total_loss_ratio: Decimal,
    pub daily_loss_ratio: Decimal,
    pub concentration: Decimal,
    pub volatility: Decimal,
    pub consecutive_api_failures: u32,
}

impl EmergencyMetrics {
    pub fn from_snapshot(snapshot: &PortfolioSnapshot, volatility: Decimal, consecutive_api_failures: u32) -> Self {
        Self {
            total_loss_ratio: snapshot.total_loss_ratio(),
            daily_loss_ratio: snapshot.daily_loss_ratio(),
            concentration: snapshot.max_concentration,
            volatility,
            consecutive_api_failures,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyCheck {
    pub should_trigger: bool,
    pub emergency_type: Option<EmergencyType>,
    pub reason: Option<String>,
    pub severity: Severity,
    pub liquidate: bool,
}

impl EmergencyCheck {
    fn clear() -> Self {
        Self {
            should_trigger: false,
            emergency_type: None,
            reason: None,
            severity: Severity::Info,
            liquidate: false,
        }
    }

    fn trigger(emergency_type: EmergencyType, severity: Severity, liquidate: bool, reason: String) -> Self {
        Self {
            should_trigger: true,
            emergency_type: Some(emergency_type),
            reason: Some(reason),
            severity,
            liquidate,
        }
    }
}

/// The latch. Inactive at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyState {
    pub is_active: bool,
    pub emergency_type: Option<EmergencyType>,
    pub reason: Option<String>,
    pub activated_at: Option<Timestamp>,
    pub liquidation_requested: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyAlert {
    pub at: Timestamp,
    pub severity: Severity,
    pub emergency_type: Option<EmergencyType>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// The latch engaged now.
    Activated { liquidation_requested: bool },
    /// Already latched; nothing changed.
    AlreadyActive,
}

#[derive(Debug, Clone)]
pub struct EmergencyController {
    thresholds: EmergencyThresholds,
    state: EmergencyState,
    alerts: Vec<EmergencyAlert>,
    incidents: u64,
}

impl EmergencyController {
    pub fn new(thresholds: EmergencyThresholds) -> Self {
        Self {
            thresholds,
            state: EmergencyState::default(),
            alerts: Vec::new(),
            incidents: 0,
        }
    }

    pub fn thresholds(&self) -> &EmergencyThresholds {
        &self.thresholds
    }

    pub fn set_thresholds(&mut self, thresholds: EmergencyThresholds) {
        self.thresholds = thresholds;
    }

    pub fn state(&self) -> &EmergencyState {
        &self.state
    }

    pub fn alerts(&self) -> &[EmergencyAlert] {
        &self.alerts
    }

    pub fn incidents(&self) -> u64 {
        self.incidents
    }

    pub fn is_emergency_stop_enabled(&self) -> bool {
        self.state.is_active
    }

    /// Run the rule list against `metrics`. Pure: never touches the latch.
    pub fn check_emergency_conditions(&self, metrics: &EmergencyMetrics) -> EmergencyCheck {
        let t = &self.thresholds;
        let pct = |v: Decimal| (v * dec!(100)).round_dp(2);

        if metrics.total_loss_ratio >= t.critical_total_loss_pct {
            return EmergencyCheck::trigger(
                EmergencyType::PortfolioLoss,
                Severity::Critical,
                true,
                format!(
                    "Total loss {}% beyond critical threshold {}%",
                    pct(metrics.total_loss_ratio),
                    pct(t.critical_total_loss_pct)
                ),
            );
        }
        if metrics.daily_loss_ratio >= t.daily_loss_pct {
            return EmergencyCheck::trigger(
                EmergencyType::PortfolioLoss,
                Severity::Error,
                false,
                format!(
                    "Daily loss {}% beyond threshold {}%",
                    pct(metrics.daily_loss_ratio),
                    pct(t.daily_loss_pct)
                ),
            );
        }
        if metrics.concentration >= t.concentration_pct {
            return EmergencyCheck::trigger(
                EmergencyType::Concentration,
                Severity::Warning,
                false,
                format!(
                    "Concentration {}% beyond threshold {}%",
                    pct(metrics.concentration),
                    pct(t.concentration_pct)
                ),
            );
        }
        if metrics.volatility >= t.volatility {
            return EmergencyCheck::trigger(
                EmergencyType::Volatility,
                Severity::Warning,
                false,
                format!(
                    "Volatility {}% beyond threshold {}%",
                    pct(metrics.volatility),
                    pct(t.volatility)
                ),
            );
        }
        if metrics.consecutive_api_failures >= t.max_consecutive_api_failures {
            return EmergencyCheck::trigger(
                EmergencyType::ApiFailure,
                Severity::Error,
                false,
                format!(
                    "{} consecutive API failures (limit {})",
                    metrics.consecutive_api_failures, t.max_consecutive_api_failures
                ),
            );
        }

        EmergencyCheck::clear()
    }

    fn push_alert(&mut self, alert: EmergencyAlert) {
        self.alerts.push(alert);
        if self.alerts.len() > self.thresholds.max_alerts {
            let drain = self.alerts.len() - self.thresholds.max_alerts;
            self.alerts.drain(0..drain);
        }
    }

    /// Latch the halt. Idempotent while active: the first activation wins.
    pub fn activate_emergency_stop_at(
        &mut self,
        now: Timestamp,
        emergency_type: EmergencyType,
        reason: &str,
        liquidate: bool,
    ) -> Activation {
        if self.state.is_active {
            info!(
                active_type = ?self.state.emergency_type,
                requested = %emergency_type,
                "emergency stop already active"
            );
            return Activation::AlreadyActive;
        }

        self.state = EmergencyState {
            is_active: true,
            emergency_type: Some(emergency_type),
            reason: Some(reason.to_string()),
            activated_at: Some(now),
            liquidation_requested: liquidate,
        };
        self.incidents += 1;

        let severity = if liquidate { Severity::Critical } else { Severity::Error };
        self.push_alert(EmergencyAlert {
            at: now,
            severity,
            emergency_type: Some(emergency_type),
            message: format!("Emergency stop activated: {}", reason),
        });
        error!(%emergency_type, reason, liquidate, "EMERGENCY STOP ACTIVATED");

        Activation::Activated {
            liquidation_requested: liquidate,
        }
    }

    /// Clear the latch. Returns false when nothing was active.
    pub fn deactivate_emergency_stop_at(&mut self, now: Timestamp, reason: &str) -> bool {
        if !self.state.is_active {
            info!(reason, "emergency stop not active, nothing to deactivate");
            return false;
        }

        let previous = self.state.emergency_type;
        self.state = EmergencyState::default();
        self.push_alert(EmergencyAlert {
            at: now,
            severity: Severity::Info,
            emergency_type: previous,
            message: format!("Emergency stop deactivated: {}", reason),
        });
        warn!(?previous, reason, "emergency stop deactivated");
        true
    }

    /// Apply the risk monitor's requested actions. Exposure reduction only alerts.
    pub fn handle_actions(
        &mut self,
        now: Timestamp,
        actions: &BTreeSet<EmergencyAction>,
        reason: &str,
    ) -> Option<Activation> {
        if actions.contains(&EmergencyAction::EmergencyLiquidation) {
            return Some(self.activate_emergency_stop_at(now, EmergencyType::RiskLimit, reason, true));
        }
        if actions.contains(&EmergencyAction::StopAllTrading) {
            return Some(self.activate_emergency_stop_at(now, EmergencyType::RiskLimit, reason, false));
        }
        if actions.contains(&EmergencyAction::ReduceExposure) {
            self.push_alert(EmergencyAlert {
                at: now,
                severity: Severity::Warning,
                emergency_type: Some(EmergencyType::Concentration),
                message: format!("Reduce exposure: {}", reason),
            });
            warn!(reason, "exposure reduction requested");
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Quote;

    fn controller() -> EmergencyController {
        EmergencyController::new(EmergencyThresholds::default())
    }

    fn quiet() -> EmergencyMetrics {
        EmergencyMetrics {
            total_loss_ratio: Decimal::ZERO,
            daily_loss_ratio: Decimal::ZERO,
            concentration: dec!(0.1),
            volatility: dec!(0.01),
            consecutive_api_failures: 0,
        }
    }

    #[test]
    fn quiet_metrics_do_not_trigger() {
        let check = controller().check_emergency_conditions(&quiet());
        assert!(!check.should_trigger);
        assert_eq!(check.severity, Severity::Info);
    }

    #[test]
    fn daily_loss_scenario() {
        let snap = PortfolioSnapshot::new(
            Quote::new(dec!(540)),
            Quote::new(dec!(1000)),
            Quote::new(dec!(1000)),
            dec!(0.1),
            Timestamp::from_millis(0),
        );
        let metrics = EmergencyMetrics::from_snapshot(&snap, Decimal::ZERO, 0);
        let check = controller().check_emergency_conditions(&metrics);

        assert!(check.should_trigger);
        assert_eq!(check.emergency_type, Some(EmergencyType::PortfolioLoss));
        assert_eq!(check.severity, Severity::Error);
        assert!(!check.liquidate);
    }

    #[test]
    fn critical_total_loss_wins_priority() {
        let mut m = quiet();
        m.total_loss_ratio = dec!(0.6);
        m.daily_loss_ratio = dec!(0.3);
        m.consecutive_api_failures = 10;
        let check = controller().check_emergency_conditions(&m);
        assert_eq!(check.severity, Severity::Critical);
        assert!(check.liquidate);
    }

    #[test]
    fn lower_priority_rules() {
        let c = controller();

        let mut m = quiet();
        m.concentration = dec!(0.8);
        m.volatility = dec!(0.9);
        let check = c.check_emergency_conditions(&m);
        assert_eq!(check.emergency_type, Some(EmergencyType::Concentration));
        assert_eq!(check.severity, Severity::Warning);

        let mut m = quiet();
        m.volatility = dec!(0.5);
        assert_eq!(c.check_emergency_conditions(&m).emergency_type, Some(EmergencyType::Volatility));

        let mut m = quiet();
        m.consecutive_api_failures = 5;
        let check = c.check_emergency_conditions(&m);
        assert_eq!(check.emergency_type, Some(EmergencyType::ApiFailure));
        assert_eq!(check.severity, Severity::Error);
    }

    #[test]
    fn activation_is_idempotent() {
        let mut c = controller();
        let first = c.activate_emergency_stop_at(Timestamp::from_millis(100), EmergencyType::ManualStop, "operator", false);
        assert_eq!(first, Activation::Activated { liquidation_requested: false });

        let second = c.activate_emergency_stop_at(Timestamp::from_millis(900), EmergencyType::PortfolioLoss, "again", true);
        assert_eq!(second, Activation::AlreadyActive);

        assert_eq!(c.state().activated_at, Some(Timestamp::from_millis(100)));
        assert_eq!(c.state().emergency_type, Some(EmergencyType::ManualStop));
        assert!(!c.state().liquidation_requested);
        assert_eq!(c.alerts().len(), 1);
        assert_eq!(c.incidents(), 1);
    }

    #[test]
    fn deactivation_rearms() {
        let mut c = controller();
        assert!(!c.deactivate_emergency_stop_at(Timestamp::from_millis(0), "nothing"));

        c.activate_emergency_stop_at(Timestamp::from_millis(1), EmergencyType::Volatility, "spike", false);
        assert!(c.is_emergency_stop_enabled());
        assert!(c.deactivate_emergency_stop_at(Timestamp::from_millis(2), "reviewed"));
        assert!(!c.is_emergency_stop_enabled());
        assert_eq!(c.state(), &EmergencyState::default());

        c.activate_emergency_stop_at(Timestamp::from_millis(3), EmergencyType::Volatility, "spike", false);
        assert_eq!(c.incidents(), 2);
    }

    #[test]
    fn risk_actions_map_onto_latch() {
        let mut c = controller();
        let reduce: BTreeSet<_> = [EmergencyAction::ReduceExposure].into_iter().collect();
        assert!(c.handle_actions(Timestamp::from_millis(0), &reduce, "concentrated").is_none());
        assert!(!c.is_emergency_stop_enabled());
        assert_eq!(c.alerts().len(), 1);

        let liquidate: BTreeSet<_> = [EmergencyAction::StopAllTrading, EmergencyAction::EmergencyLiquidation]
            .into_iter()
            .collect();
        let outcome = c.handle_actions(Timestamp::from_millis(1), &liquidate, "critical");
        assert_eq!(outcome, Some(Activation::Activated { liquidation_requested: true }));
        assert_eq!(c.state().emergency_type, Some(EmergencyType::RiskLimit));
    }

    #[test]
    fn alert_history_is_bounded() {
        let mut thresholds = EmergencyThresholds::default();
        thresholds.max_alerts = 2;
        let mut c = EmergencyController::new(thresholds);
        for i in 0..3 {
            c.activate_emergency_stop_at(Timestamp::from_millis(i), EmergencyType::ManualStop, "x", false);
            c.deactivate_emergency_stop_at(Timestamp::from_millis(i), "y");
        }
        assert_eq!(c.alerts().len(), 2);
    }
}
