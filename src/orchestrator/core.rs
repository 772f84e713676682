// 9.0 orchestrator/core.rs: the control loop's owned state. everything mutable lives here,
// behind one Arc so the timer task, manual trades and operators share it.

use super::network::GuardedNetwork;
use super::results::{CycleStats, OrchestratorError, SystemStatus};
use crate::circuit_breaker::{BreakerSet, BreakerState};
use crate::collaborators::{MarketAnalyzer, NetworkClient, PortfolioSnapshot, PortfolioSource, Strategy};
use crate::config::{ConfigError, SystemConfig};
use crate::decision::DecisionMatrix;
use crate::emergency::{Activation, EmergencyController, EmergencyType};
use crate::events::{
    AlertEvent, BreakerStateChangedEvent, EmergencyActivatedEvent, Event, EventCollector, EventEmitter,
    EventPayload, LiquidationFailedEvent,
};
use crate::limits::AdmissionGate;
use crate::risk::RiskMonitor;
use crate::types::{Severity, Timestamp};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// External capabilities the loop drives.
#[derive(Clone)]
pub struct Collaborators {
    pub network: Arc<dyn NetworkClient>,
    pub portfolio: Arc<dyn PortfolioSource>,
    pub market: Arc<dyn MarketAnalyzer>,
    pub strategies: Vec<Arc<dyn Strategy>>,
}

pub(super) struct LoopHandle {
    pub(super) shutdown: CancellationToken,
    pub(super) task: JoinHandle<()>,
}

// recovers the guard if a previous holder panicked
pub(super) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(super) struct Shared {
    pub(super) wallet: String,
    pub(super) portfolio: Arc<dyn PortfolioSource>,
    pub(super) market: Arc<dyn MarketAnalyzer>,
    pub(super) strategies: Vec<Arc<dyn Strategy>>,
    pub(super) net: GuardedNetwork,

    pub(super) config: Mutex<SystemConfig>,
    pub(super) staged: Mutex<Option<SystemConfig>>,
    pub(super) gate: Mutex<AdmissionGate>,
    pub(super) risk: tokio::sync::Mutex<RiskMonitor>,
    pub(super) emergency: Mutex<EmergencyController>,
    pub(super) events: Mutex<EventCollector>,
    pub(super) stats: Mutex<CycleStats>,

    pub(super) running: AtomicBool,
    pub(super) in_cycle: AtomicBool,
    pub(super) cycle_seq: AtomicU64,
    pub(super) trade_slots: Semaphore,
    pub(super) lifecycle: tokio::sync::Mutex<Option<LoopHandle>>,
}

/** 9.0.1: base orchestrator. cheap to clone; clones share state */
#[derive(Clone)]
pub struct Orchestrator {
    pub(super) shared: Arc<Shared>,
}

impl Orchestrator {
    /// Validate the config and resolve credentials. Fails fast on either.
    pub fn new(config: SystemConfig, collaborators: Collaborators) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let wallet = config.require_wallet()?;

        let breakers = BreakerSet::new(&config.breakers);
        let net = GuardedNetwork::new(
            collaborators.network,
            breakers,
            config.rate_limit.clone(),
            config.cycle.network_timeout_ms,
        );

        let shared = Shared {
            wallet,
            portfolio: collaborators.portfolio,
            market: collaborators.market,
            strategies: collaborators.strategies,
            net,
            gate: Mutex::new(AdmissionGate::new(config.limits.clone())),
            risk: tokio::sync::Mutex::new(RiskMonitor::new(config.risk.clone())),
            emergency: Mutex::new(EmergencyController::new(config.emergency.clone())),
            events: Mutex::new(EventCollector::new(config.cycle.max_events)),
            stats: Mutex::new(CycleStats::default()),
            trade_slots: Semaphore::new(config.cycle.max_parallel_trades),
            config: Mutex::new(config),
            staged: Mutex::new(None),
            running: AtomicBool::new(false),
            in_cycle: AtomicBool::new(false),
            cycle_seq: AtomicU64::new(0),
            lifecycle: tokio::sync::Mutex::new(None),
        };

        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn is_emergency_stop_enabled(&self) -> bool {
        lock(&self.shared.emergency).is_emergency_stop_enabled()
    }

    pub fn config(&self) -> SystemConfig {
        lock(&self.shared.config).clone()
    }

    pub(super) fn decision_matrix(&self) -> DecisionMatrix {
        lock(&self.shared.config).decision.clone()
    }

    pub(super) fn price_cache_ttl_ms(&self) -> i64 {
        lock(&self.shared.config).cycle.price_cache_ttl_ms
    }

    pub(super) fn interval(&self) -> Duration {
        Duration::from_millis(lock(&self.shared.config).cycle.interval_ms)
    }

    pub(super) fn network_timeout(&self) -> Duration {
        Duration::from_millis(lock(&self.shared.config).cycle.network_timeout_ms)
    }

    pub fn events(&self) -> Vec<Event> {
        lock(&self.shared.events).events().cloned().collect()
    }

    pub fn recent_events(&self, count: usize) -> Vec<Event> {
        lock(&self.shared.events).recent(count)
    }

    pub fn stats(&self) -> CycleStats {
        lock(&self.shared.stats).clone()
    }

    pub(super) fn emit(&self, payload: EventPayload) {
        lock(&self.shared.events).emit(Timestamp::now(), payload);
    }

    pub(super) fn alert(&self, severity: Severity, message: impl Into<String>) {
        self.emit(EventPayload::Alert(AlertEvent {
            severity,
            message: message.into(),
        }));
    }

    /// Validate now, apply at the start of the next cycle.
    pub fn stage_config(&self, config: SystemConfig) -> Result<(), ConfigError> {
        config.validate()?;
        *lock(&self.shared.staged) = Some(config);
        info!("configuration staged for next cycle");
        Ok(())
    }

    pub fn has_staged_config(&self) -> bool {
        lock(&self.shared.staged).is_some()
    }

    /// Swap in a staged config. Breakers, rate limits and the cycle interval
    /// are fixed for the life of the orchestrator.
    pub(super) async fn apply_staged_config(&self) -> bool {
        let staged = lock(&self.shared.staged).take();
        let Some(config) = staged else {
            return false;
        };

        let updated = lock(&self.shared.gate).update_limits(config.limits.clone());
        if let Err(reason) = updated {
            // validated when staged; only reachable if limits rules changed in between
            warn!(reason, "staged limits rejected");
            return false;
        }
        self.shared.risk.lock().await.set_params(config.risk.clone());
        lock(&self.shared.emergency).set_thresholds(config.emergency.clone());
        lock(&self.shared.events).set_max_events(config.cycle.max_events);
        *lock(&self.shared.config) = config;

        self.emit(EventPayload::ConfigApplied);
        info!("staged configuration applied");
        true
    }

    pub(super) async fn fetch_snapshot(&self) -> Result<PortfolioSnapshot, String> {
        let fetch = self.shared.portfolio.get_portfolio_snapshot(&self.shared.wallet);
        match tokio::time::timeout(self.network_timeout(), fetch).await {
            Ok(Ok(snapshot)) => Ok(snapshot),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("portfolio snapshot timed out".to_string()),
        }
    }

    /// Latch the emergency stop and, if this activation asked for it, liquidate.
    /// The latch holds whether or not liquidation succeeds.
    pub(super) async fn latch_emergency(&self, emergency_type: EmergencyType, reason: &str, liquidate: bool) -> Activation {
        let activation = lock(&self.shared.emergency).activate_emergency_stop_at(Timestamp::now(), emergency_type, reason, liquidate);
        self.after_activation(activation, emergency_type, reason).await;
        activation
    }

    pub(super) async fn after_activation(&self, activation: Activation, emergency_type: EmergencyType, reason: &str) {
        let Activation::Activated { liquidation_requested } = activation else {
            return;
        };

        self.emit(EventPayload::EmergencyActivated(EmergencyActivatedEvent {
            emergency_type,
            reason: reason.to_string(),
            liquidation_requested,
        }));

        if liquidation_requested {
            match self.shared.net.liquidate_positions().await {
                Ok(receipts) => info!(closed = receipts.len(), "emergency liquidation complete"),
                Err(e) => {
                    error!(error = %e, "emergency liquidation failed, stop remains latched");
                    self.emit(EventPayload::LiquidationFailed(LiquidationFailedEvent { error: e.to_string() }));
                }
            }
        }
    }

    pub(super) fn note_breaker_changes(&self, before: &[(String, BreakerState); 3]) {
        let after = self.shared.net.breaker_states();
        for ((name, from), (_, to)) in before.iter().zip(after.iter()) {
            if from != to {
                self.emit(EventPayload::BreakerStateChanged(BreakerStateChangedEvent {
                    breaker: name.clone(),
                    from: *from,
                    to: *to,
                }));
            }
        }
    }

    pub async fn status(&self) -> SystemStatus {
        let latest_assessment = self.shared.risk.lock().await.latest_assessment().cloned();
        let (emergency_state, recent_alerts) = {
            let emergency = lock(&self.shared.emergency);
            let alerts = emergency.alerts();
            let start = alerts.len().saturating_sub(20);
            (emergency.state().clone(), alerts[start..].to_vec())
        };
        let gate = lock(&self.shared.gate).snapshot();

        SystemStatus {
            is_running: self.is_running(),
            risk_level: latest_assessment.as_ref().map(|a| a.risk_level),
            latest_assessment,
            emergency_state,
            limits: gate.limits.clone(),
            gate,
            breaker_states: self.shared.net.breakers.snapshots(),
            stats: self.stats(),
            recent_alerts,
            config_pending: self.has_staged_config(),
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("wallet", &self.shared.wallet)
            .field("running", &self.is_running())
            .field("strategies", &self.shared.strategies.len())
            .finish()
    }
}
