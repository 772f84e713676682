// 9.0: cycle orchestrator. runs the periodic control loop, owns the breakers, gate,
// risk monitor and emergency latch, and exposes the operator surface.
// base Orchestrator and the CachedOrchestrator decorator both implement TradingControl.

mod cached;
mod core;
mod cycle;
mod lifecycle;
mod manual;
mod network;
mod results;

pub use cached::CachedOrchestrator;
pub use self::core::{Collaborators, Orchestrator};
pub use results::{CallError, CycleOutcome, CycleStats, ManualTradeResult, OrchestratorError, SystemStatus};

use crate::config::{ConfigError, SystemConfig};
use crate::limits::TradeRequest;
use crate::types::TokenId;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Operator surface of the control loop. Callers do not care which variant they hold.
#[async_trait]
pub trait TradingControl: Send + Sync {
    async fn start(&self) -> Result<(), OrchestratorError>;

    async fn stop(&self);

    async fn execute_manual_trade(&self, trade: TradeRequest, bypass_risk_check: bool) -> ManualTradeResult;

    async fn execute_batch(&self, trades: Vec<TradeRequest>) -> Vec<ManualTradeResult>;

    async fn emergency_stop(&self, reason: &str, liquidate_positions: bool);

    async fn deactivate_emergency_stop(&self, reason: &str);

    async fn get_status(&self) -> SystemStatus;

    async fn token_prices(&self, tokens: &[TokenId]) -> Result<HashMap<TokenId, Decimal>, CallError>;

    /// Validated now, applied at the start of the next cycle.
    fn update_config(&self, config: SystemConfig) -> Result<(), ConfigError>;
}

#[async_trait]
impl TradingControl for Orchestrator {
    async fn start(&self) -> Result<(), OrchestratorError> {
        Orchestrator::start(self).await
    }

    async fn stop(&self) {
        Orchestrator::stop(self).await;
    }

    async fn execute_manual_trade(&self, trade: TradeRequest, bypass_risk_check: bool) -> ManualTradeResult {
        Orchestrator::execute_manual_trade(self, trade, bypass_risk_check).await
    }

    async fn execute_batch(&self, trades: Vec<TradeRequest>) -> Vec<ManualTradeResult> {
        Orchestrator::execute_batch(self, trades).await
    }

    async fn emergency_stop(&self, reason: &str, liquidate_positions: bool) {
        Orchestrator::emergency_stop(self, reason, liquidate_positions).await;
    }

    async fn deactivate_emergency_stop(&self, reason: &str) {
        Orchestrator::deactivate_emergency_stop(self, reason);
    }

    async fn get_status(&self) -> SystemStatus {
        self.status().await
    }

    async fn token_prices(&self, tokens: &[TokenId]) -> Result<HashMap<TokenId, Decimal>, CallError> {
        Orchestrator::token_prices(self, tokens).await
    }

    fn update_config(&self, config: SystemConfig) -> Result<(), ConfigError> {
        self.stage_config(config)
    }
}
