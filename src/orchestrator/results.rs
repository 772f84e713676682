// 9.0.2: result types and errors for orchestrator operations.

use crate::circuit_breaker::{BreakerError, BreakerSnapshot};
use crate::collaborators::{NetworkError, StrategyKind};
use crate::config::ConfigError;
use crate::emergency::{EmergencyAlert, EmergencyState};
use crate::events::SkipReason;
use crate::limits::{GateSnapshot, ProtectionLimits};
use crate::rate_limiter::RateLimitError;
use crate::risk::RiskAssessment;
use crate::types::{Quote, RiskLevel, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome of a manual or batch trade. Failures are values, never errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualTradeResult {
    pub success: bool,
    pub transaction_id: Option<String>,
    pub error: Option<String>,
    /// Smaller amount the risk monitor would approve, if any.
    pub adjusted_amount: Option<Quote>,
}

impl ManualTradeResult {
    pub fn executed(transaction_id: String) -> Self {
        Self {
            success: true,
            transaction_id: Some(transaction_id),
            error: None,
            adjusted_amount: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            transaction_id: None,
            error: Some(error.into()),
            adjusted_amount: None,
        }
    }

    pub fn with_adjusted_amount(mut self, amount: Option<Quote>) -> Self {
        self.adjusted_amount = amount;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleOutcome {
    Skipped(SkipReason),
    Dispatched(Vec<StrategyKind>),
    /// Another cycle was still running; this one was dropped.
    Overlapped,
}

impl CycleOutcome {
    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            CycleOutcome::Skipped(reason) => Some(*reason),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleStats {
    pub cycles_started: u64,
    pub cycles_dispatched: u64,
    pub cycles_dropped: u64,
    pub cycles_skipped: BTreeMap<SkipReason, u64>,
    pub strategies_dispatched: u64,
    pub trades_executed: u64,
    pub trades_rejected: u64,
    pub last_cycle_at: Option<Timestamp>,
}

impl CycleStats {
    pub fn skipped_total(&self) -> u64 {
        self.cycles_skipped.values().sum()
    }

    pub(super) fn record(&mut self, outcome: &CycleOutcome) {
        match outcome {
            CycleOutcome::Skipped(reason) => *self.cycles_skipped.entry(*reason).or_insert(0) += 1,
            CycleOutcome::Dispatched(strategies) => {
                self.cycles_dispatched += 1;
                self.strategies_dispatched += strategies.len() as u64;
            }
            CycleOutcome::Overlapped => self.cycles_dropped += 1,
        }
    }
}

/// Read-only composite view for operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub is_running: bool,
    pub risk_level: Option<RiskLevel>,
    pub latest_assessment: Option<RiskAssessment>,
    pub emergency_state: EmergencyState,
    pub limits: ProtectionLimits,
    pub gate: GateSnapshot,
    pub breaker_states: Vec<BreakerSnapshot>,
    pub stats: CycleStats,
    pub recent_alerts: Vec<EmergencyAlert>,
    pub config_pending: bool,
}

/// Failure of a guarded network call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("circuit '{name}' open, retry in {retry_after_ms}ms")]
    CircuitOpen { name: String, retry_after_ms: i64 },

    #[error("{0}")]
    RateLimited(#[from] RateLimitError),

    #[error("{0}")]
    Network(#[from] NetworkError),
}

impl From<BreakerError<NetworkError>> for CallError {
    fn from(e: BreakerError<NetworkError>) -> Self {
        match e {
            BreakerError::Open { name, retry_after_ms } => CallError::CircuitOpen { name, retry_after_ms },
            BreakerError::Inner(inner) => CallError::Network(inner),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestratorError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("start requires a running tokio runtime")]
    NoRuntime,
}
