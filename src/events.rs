// 11.0: every decision the control loop makes produces an event. used for the audit trail
// exposed through status and for tests asserting why a cycle did or did not trade.

use crate::circuit_breaker::BreakerState;
use crate::collaborators::StrategyKind;
use crate::emergency::EmergencyType;
use crate::types::{Quote, RiskLevel, Severity, Timestamp, TokenId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: Timestamp,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(id: EventId, timestamp: Timestamp, payload: EventPayload) -> Self {
        Self {
            id,
            timestamp,
            payload,
        }
    }
}

/// Why a cycle stopped before dispatching strategies. One per short-circuit step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    EmergencyActive,
    HealthCheckFailed,
    RiskCheckFailed,
    RiskTooHigh,
    AggregateLimit,
    MarketDataUnavailable,
    EmergencyTriggered,
    ExtremeVolatility,
    Unfavorable,
    NoStrategyMatched,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::EmergencyActive => "emergency stop active",
            SkipReason::HealthCheckFailed => "health check failed",
            SkipReason::RiskCheckFailed => "risk check failed",
            SkipReason::RiskTooHigh => "risk too high to continue",
            SkipReason::AggregateLimit => "aggregate limits reached",
            SkipReason::MarketDataUnavailable => "market data unavailable",
            SkipReason::EmergencyTriggered => "emergency condition triggered",
            SkipReason::ExtremeVolatility => "extreme volatility",
            SkipReason::Unfavorable => "market not favorable",
            SkipReason::NoStrategyMatched => "no strategy matched",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    // Lifecycle events
    Started,
    Stopped,
    ConfigApplied,

    // Cycle events
    CycleSkipped(CycleSkippedEvent),
    StrategiesDispatched(StrategiesDispatchedEvent),
    RiskAssessed(RiskAssessedEvent),

    // Trade events
    TradeExecuted(TradeExecutedEvent),
    TradeRejected(TradeRejectedEvent),

    // Safety events
    EmergencyActivated(EmergencyActivatedEvent),
    EmergencyDeactivated(EmergencyDeactivatedEvent),
    LiquidationFailed(LiquidationFailedEvent),
    BreakerStateChanged(BreakerStateChangedEvent),
    Alert(AlertEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleSkippedEvent {
    pub cycle: u64,
    pub reason: SkipReason,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategiesDispatchedEvent {
    pub cycle: u64,
    pub strategies: Vec<StrategyKind>,
    pub risk_level: RiskLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessedEvent {
    pub cycle: u64,
    pub risk_level: RiskLevel,
    pub risk_score: Decimal,
    pub should_continue_trading: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeExecutedEvent {
    pub token_in: TokenId,
    pub token_out: TokenId,
    pub amount_in: Quote,
    pub transaction_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRejectedEvent {
    pub token_in: TokenId,
    pub token_out: TokenId,
    pub amount_in: Quote,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyActivatedEvent {
    pub emergency_type: EmergencyType,
    pub reason: String,
    pub liquidation_requested: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyDeactivatedEvent {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationFailedEvent {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerStateChangedEvent {
    pub breaker: String,
    pub from: BreakerState,
    pub to: BreakerState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub severity: Severity,
    pub message: String,
}

pub trait EventEmitter {
    fn emit(&mut self, timestamp: Timestamp, payload: EventPayload) -> EventId;
}

/// Bounded in-memory event log. Oldest events are dropped past `max_events`.
#[derive(Debug)]
pub struct EventCollector {
    events: VecDeque<Event>,
    next_id: u64,
    max_events: usize,
}

impl EventCollector {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: VecDeque::new(),
            next_id: 1,
            max_events: max_events.max(1),
        }
    }

    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn recent(&self, count: usize) -> Vec<Event> {
        let start = self.events.len().saturating_sub(count);
        self.events.iter().skip(start).cloned().collect()
    }

    pub fn set_max_events(&mut self, max_events: usize) {
        self.max_events = max_events.max(1);
        self.truncate();
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    fn truncate(&mut self) {
        while self.events.len() > self.max_events {
            self.events.pop_front();
        }
    }
}

impl EventEmitter for EventCollector {
    fn emit(&mut self, timestamp: Timestamp, payload: EventPayload) -> EventId {
        let id = EventId(self.next_id);
        self.next_id += 1;
        self.events.push_back(Event::new(id, timestamp, payload));
        self.truncate();
        id
    }
}
