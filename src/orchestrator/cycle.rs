// 9.2 orchestrator/cycle.rs: one pass of the control loop.
// steps short-circuit on the first failing condition; a skipped cycle is logged, never an error.
//   1 emergency latched          5 market + portfolio refresh, emergency triggers
//   2 health probe               6 extreme volatility
//   3 risk check                 7 market favorability
//   4 aggregate gate limits      8 decision matrix -> strategies

use super::core::{lock, Orchestrator};
use super::results::CycleOutcome;
use crate::collaborators::{MarketCondition, StrategyKind, VolatilityClass};
use crate::emergency::{EmergencyMetrics, EmergencyType};
use crate::events::{CycleSkippedEvent, EventPayload, RiskAssessedEvent, SkipReason, StrategiesDispatchedEvent};
use crate::risk::RiskAssessment;
use crate::types::{RiskLevel, Severity, Timestamp};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

struct Skip {
    reason: SkipReason,
    detail: Option<String>,
}

impl Skip {
    fn new(reason: SkipReason) -> Self {
        Self { reason, detail: None }
    }

    fn with(reason: SkipReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: Some(detail.into()),
        }
    }
}

// clears the in-cycle flag however the cycle ends
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Orchestrator {
    /// Run one cycle now. If a cycle is already running this one is dropped.
    pub async fn run_cycle(&self) -> CycleOutcome {
        if self
            .shared
            .in_cycle
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("cycle already in progress, tick dropped");
            let outcome = CycleOutcome::Overlapped;
            lock(&self.shared.stats).record(&outcome);
            return outcome;
        }
        let _guard = CycleGuard(&self.shared.in_cycle);

        let cycle = self.shared.cycle_seq.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut stats = lock(&self.shared.stats);
            stats.cycles_started += 1;
            stats.last_cycle_at = Some(Timestamp::now());
        }

        let outcome = match self.cycle_body(cycle).await {
            Ok(strategies) => CycleOutcome::Dispatched(strategies),
            Err(skip) => {
                match skip.reason {
                    SkipReason::HealthCheckFailed | SkipReason::RiskCheckFailed | SkipReason::MarketDataUnavailable => {
                        warn!(cycle, reason = %skip.reason, detail = ?skip.detail, "cycle skipped")
                    }
                    _ => info!(cycle, reason = %skip.reason, detail = ?skip.detail, "cycle skipped"),
                }
                self.emit(EventPayload::CycleSkipped(CycleSkippedEvent {
                    cycle,
                    reason: skip.reason,
                    detail: skip.detail,
                }));
                CycleOutcome::Skipped(skip.reason)
            }
        };

        lock(&self.shared.stats).record(&outcome);
        outcome
    }

    async fn cycle_body(&self, cycle: u64) -> Result<Vec<StrategyKind>, Skip> {
        self.apply_staged_config().await;
        lock(&self.shared.gate).roll_day_if_needed(Timestamp::now());

        if self.is_emergency_stop_enabled() {
            return Err(Skip::new(SkipReason::EmergencyActive));
        }

        // read-only probes run together
        let breakers_before = self.shared.net.breaker_states();
        let (health, risk, condition) = tokio::join!(
            self.shared.net.health_check(),
            self.perform_risk_check(),
            self.analyze_market(),
        );
        self.note_breaker_changes(&breakers_before);

        if let Err(e) = health {
            return Err(Skip::with(SkipReason::HealthCheckFailed, e.to_string()));
        }

        let assessment = risk.map_err(|e| Skip::with(SkipReason::RiskCheckFailed, e))?;
        self.emit(EventPayload::RiskAssessed(RiskAssessedEvent {
            cycle,
            risk_level: assessment.risk_level,
            risk_score: assessment.risk_score,
            should_continue_trading: assessment.should_continue_trading,
        }));
        if !assessment.should_continue_trading {
            self.escalate(&assessment).await;
            return Err(Skip::with(
                SkipReason::RiskTooHigh,
                format!("{} risk, score {}", assessment.risk_level, assessment.risk_score),
            ));
        }

        let aggregate = lock(&self.shared.gate).check_aggregate();
        if !aggregate.allowed {
            let reason = aggregate.reason.unwrap_or_default();
            self.alert(Severity::Warning, reason.clone());
            return Err(Skip::with(SkipReason::AggregateLimit, reason));
        }

        let condition = condition.map_err(|e| Skip::with(SkipReason::MarketDataUnavailable, e))?;
        let snapshot = self
            .fetch_snapshot()
            .await
            .map_err(|e| Skip::with(SkipReason::MarketDataUnavailable, e))?;
        lock(&self.shared.gate).set_portfolio_value(snapshot.total_value);

        let metrics = EmergencyMetrics::from_snapshot(
            &snapshot,
            assessment.volatility,
            self.shared.net.breakers.consecutive_api_failures(),
        );
        let check = lock(&self.shared.emergency).check_emergency_conditions(&metrics);
        if check.should_trigger {
            let emergency_type = check.emergency_type.unwrap_or(EmergencyType::RiskLimit);
            let reason = check.reason.unwrap_or_default();
            self.alert(check.severity, reason.clone());
            self.latch_emergency(emergency_type, &reason, check.liquidate).await;
            return Err(Skip::with(SkipReason::EmergencyTriggered, reason));
        }

        if condition.volatility == VolatilityClass::Extreme {
            self.alert(Severity::Warning, "extreme market volatility, trading paused for this cycle");
            return Err(Skip::with(SkipReason::ExtremeVolatility, condition.to_string()));
        }

        let favorable = tokio::time::timeout(self.network_timeout(), self.shared.market.is_favorable_for_trading()).await;
        match favorable {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => return Err(Skip::with(SkipReason::Unfavorable, condition.to_string())),
            Ok(Err(e)) => return Err(Skip::with(SkipReason::MarketDataUnavailable, e.to_string())),
            Err(_) => {
                return Err(Skip::with(
                    SkipReason::MarketDataUnavailable,
                    "favorability check timed out".to_string(),
                ))
            }
        }

        self.dispatch(cycle, &condition, assessment.risk_level)
    }

    fn dispatch(&self, cycle: u64, condition: &MarketCondition, risk_level: RiskLevel) -> Result<Vec<StrategyKind>, Skip> {
        let decision = self.decision_matrix().select(condition, risk_level);
        if decision.is_empty() {
            return Err(Skip::with(
                SkipReason::NoStrategyMatched,
                format!("{} risk, {}", risk_level, condition),
            ));
        }

        // an operator stop may have landed while probes were in flight
        if self.is_emergency_stop_enabled() {
            return Err(Skip::new(SkipReason::EmergencyActive));
        }

        let mut dispatched = Vec::new();
        for strategy in &self.shared.strategies {
            let kind = strategy.kind();
            if !decision.strategies.contains(&kind) {
                continue;
            }
            dispatched.push(kind);
            let strategy = strategy.clone();
            tokio::spawn(async move {
                if let Err(e) = strategy.execute().await {
                    warn!(strategy = %kind, error = %e, "strategy execution failed");
                }
            });
        }

        if dispatched.is_empty() {
            return Err(Skip::with(
                SkipReason::NoStrategyMatched,
                format!("no registered strategy for rule {}", decision.rule.unwrap_or_default()),
            ));
        }

        info!(cycle, rule = ?decision.rule, strategies = ?dispatched, %risk_level, "strategies dispatched");
        self.emit(EventPayload::StrategiesDispatched(StrategiesDispatchedEvent {
            cycle,
            strategies: dispatched.clone(),
            risk_level,
        }));
        Ok(dispatched)
    }

    // hands the monitor's requested actions to the emergency controller
    async fn escalate(&self, assessment: &RiskAssessment) {
        let reason = if assessment.alerts.is_empty() {
            format!("{} risk, score {}", assessment.risk_level, assessment.risk_score)
        } else {
            assessment.alerts.join("; ")
        };
        let activation = lock(&self.shared.emergency).handle_actions(
            Timestamp::now(),
            &assessment.emergency_actions,
            &reason,
        );
        if let Some(activation) = activation {
            self.after_activation(activation, EmergencyType::RiskLimit, &reason).await;
        }
    }

    /// On-demand risk check against a fresh snapshot.
    pub async fn perform_risk_check(&self) -> Result<RiskAssessment, String> {
        let mut monitor = self.shared.risk.lock().await;
        let check = monitor.perform_risk_check(self.shared.portfolio.as_ref(), &self.shared.wallet);
        match tokio::time::timeout(self.network_timeout(), check).await {
            Ok(Ok(assessment)) => Ok(assessment),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("risk check timed out".to_string()),
        }
    }

    async fn analyze_market(&self) -> Result<MarketCondition, String> {
        match tokio::time::timeout(self.network_timeout(), self.shared.market.analyze_market()).await {
            Ok(Ok(condition)) => Ok(condition),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("market analysis timed out".to_string()),
        }
    }
}
