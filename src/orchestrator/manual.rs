// 9.4 orchestrator/manual.rs: operator-facing trades and emergency controls.
// manual trades pass the same latch and gate as the loop; bypassing only skips risk validation.

use super::core::{lock, Orchestrator};
use super::results::{CallError, ManualTradeResult};
use crate::emergency::EmergencyType;
use crate::events::{EmergencyDeactivatedEvent, EventPayload, TradeExecutedEvent, TradeRejectedEvent};
use crate::limits::{LimitViolation, TradeRequest};
use crate::types::{Quote, Timestamp, TokenId};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{info, warn};

impl Orchestrator {
    pub async fn execute_manual_trade(&self, trade: TradeRequest, bypass_risk_check: bool) -> ManualTradeResult {
        let Ok(_permit) = self.shared.trade_slots.acquire().await else {
            return self.reject(&trade, "trade slots closed".to_string(), None);
        };

        if self.is_emergency_stop_enabled() {
            return self.reject(&trade, LimitViolation::EmergencyStopActive.to_string(), None);
        }

        let snapshot = match self.fetch_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => return self.reject(&trade, format!("Portfolio unavailable: {}", e), None),
        };

        let decision = {
            let mut gate = lock(&self.shared.gate);
            gate.set_portfolio_value(snapshot.total_value);
            gate.check_limits(&trade)
        };
        if !decision.allowed {
            let reason = decision.reason.unwrap_or_else(|| "Rejected by admission gate".to_string());
            return self.reject(&trade, reason, None);
        }

        if bypass_risk_check {
            warn!(token_in = %trade.token_in, token_out = %trade.token_out, "risk validation bypassed");
        } else {
            let validation = self.shared.risk.lock().await.validate_trade(&trade, &snapshot);
            if !validation.approved {
                let reason = validation.reason.unwrap_or_else(|| "Rejected by risk monitor".to_string());
                return self.reject(&trade, reason, validation.adjusted_amount);
            }
        }

        // the latch may have engaged while we were waiting on the network
        if self.is_emergency_stop_enabled() {
            return self.reject(&trade, LimitViolation::EmergencyStopActive.to_string(), None);
        }

        let breakers_before = self.shared.net.breaker_states();
        let quote = self
            .shared
            .net
            .get_quote(&trade.token_in, &trade.token_out, trade.amount_in)
            .await;
        let result = match quote {
            // a stop latched during the quote must still win over the swap
            Ok(_) if self.is_emergency_stop_enabled() => {
                self.note_breaker_changes(&breakers_before);
                return self.reject(&trade, LimitViolation::EmergencyStopActive.to_string(), None);
            }
            Ok(quote) => self.shared.net.execute_swap(&quote, trade.slippage_tolerance).await,
            Err(e) => Err(e),
        };
        self.note_breaker_changes(&breakers_before);

        match result {
            Ok(receipt) => {
                lock(&self.shared.gate).record_fill(&trade);
                lock(&self.shared.stats).trades_executed += 1;
                info!(
                    tx = %receipt.transaction_id,
                    token_in = %trade.token_in,
                    token_out = %trade.token_out,
                    amount = %trade.amount_in,
                    "manual trade executed"
                );
                self.emit(EventPayload::TradeExecuted(TradeExecutedEvent {
                    token_in: trade.token_in.clone(),
                    token_out: trade.token_out.clone(),
                    amount_in: trade.amount_in,
                    transaction_id: receipt.transaction_id.clone(),
                }));
                ManualTradeResult::executed(receipt.transaction_id)
            }
            Err(e) => self.reject(&trade, format!("Execution failed: {}", e), None),
        }
    }

    fn reject(&self, trade: &TradeRequest, reason: String, adjusted_amount: Option<Quote>) -> ManualTradeResult {
        lock(&self.shared.stats).trades_rejected += 1;
        warn!(
            token_in = %trade.token_in,
            token_out = %trade.token_out,
            amount = %trade.amount_in,
            reason = %reason,
            "manual trade rejected"
        );
        self.emit(EventPayload::TradeRejected(TradeRejectedEvent {
            token_in: trade.token_in.clone(),
            token_out: trade.token_out.clone(),
            amount_in: trade.amount_in,
            reason: reason.clone(),
        }));
        ManualTradeResult::failed(reason).with_adjusted_amount(adjusted_amount)
    }

    /// Sequential batch. Each trade is checked independently.
    pub async fn execute_batch(&self, trades: Vec<TradeRequest>) -> Vec<ManualTradeResult> {
        let mut results = Vec::with_capacity(trades.len());
        for trade in trades {
            results.push(self.execute_manual_trade(trade, false).await);
        }
        results
    }

    /// Latch the stop. Always latches, even if the liquidation that follows fails.
    pub async fn emergency_stop(&self, reason: &str, liquidate_positions: bool) {
        warn!(reason, liquidate_positions, "manual emergency stop requested");
        self.latch_emergency(EmergencyType::ManualStop, reason, liquidate_positions)
            .await;
    }

    pub fn deactivate_emergency_stop(&self, reason: &str) {
        let cleared = lock(&self.shared.emergency).deactivate_emergency_stop_at(Timestamp::now(), reason);
        if cleared {
            self.emit(EventPayload::EmergencyDeactivated(EmergencyDeactivatedEvent {
                reason: reason.to_string(),
            }));
        }
    }

    /// Current prices straight from the network collaborator.
    pub async fn token_prices(&self, tokens: &[TokenId]) -> Result<HashMap<TokenId, Decimal>, CallError> {
        let breakers_before = self.shared.net.breaker_states();
        let prices = self.shared.net.get_prices(tokens).await;
        self.note_breaker_changes(&breakers_before);
        prices
    }
}
