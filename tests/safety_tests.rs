//! Safety tests for the control loop.
//!
//! Each test drives a full orchestrator against simulated collaborators and
//! checks that a halt, a failed check or an open breaker always wins over a trade.

use dex_sentinel::sim::{SimPortfolio, SimWorld};
use dex_sentinel::*;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

fn orchestrator(world: &SimWorld) -> Orchestrator {
    Orchestrator::new(SystemConfig::default(), world.collaborators()).unwrap()
}

fn trade(amount: rust_decimal::Decimal) -> TradeRequest {
    TradeRequest::new("USDC", "AXS", Quote::new(amount), dec!(0.01))
}

/// Stop latched by the operator or by a trigger.
mod latch_tests {
    use super::*;

    #[tokio::test]
    async fn latch_blocks_cycles_and_trades() {
        let world = SimWorld::default();
        let orch = orchestrator(&world);

        orch.emergency_stop("operator halt", false).await;
        assert!(orch.is_emergency_stop_enabled());

        assert_eq!(orch.run_cycle().await, CycleOutcome::Skipped(SkipReason::EmergencyActive));
        let result = orch.execute_manual_trade(trade(dec!(10)), false).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Emergency stop is active"));

        // bypassing risk does not bypass the latch
        let result = orch.execute_manual_trade(trade(dec!(10)), true).await;
        assert!(!result.success);

        assert_eq!(world.network.swap_calls(), 0);
        assert_eq!(world.network.health_calls(), 0);

        orch.deactivate_emergency_stop("reviewed");
        assert!(!orch.is_emergency_stop_enabled());
        assert!(matches!(orch.run_cycle().await, CycleOutcome::Dispatched(_)));
    }

    #[tokio::test]
    async fn activation_is_idempotent() {
        let world = SimWorld::default();
        let orch = orchestrator(&world);

        orch.emergency_stop("first", false).await;
        orch.emergency_stop("second", true).await;

        let state = orch.status().await.emergency_state;
        assert!(state.is_active);
        assert_eq!(state.emergency_type, Some(EmergencyType::ManualStop));
        assert_eq!(state.reason.as_deref(), Some("first"));
        assert!(!state.liquidation_requested);
        assert_eq!(world.network.liquidations(), 0);

        let activations = orch
            .events()
            .iter()
            .filter(|e| matches!(e.payload, EventPayload::EmergencyActivated(_)))
            .count();
        assert_eq!(activations, 1);
    }

    #[tokio::test]
    async fn failed_liquidation_keeps_latch() {
        let world = SimWorld::default();
        world.network.set_liquidation_fails(true);
        let orch = orchestrator(&world);

        orch.emergency_stop("exploit suspected", true).await;

        assert!(orch.is_emergency_stop_enabled());
        assert_eq!(world.network.liquidations(), 1);
        assert!(orch
            .events()
            .iter()
            .any(|e| matches!(e.payload, EventPayload::LiquidationFailed(_))));
    }

    #[tokio::test]
    async fn deactivating_inactive_latch_is_noop() {
        let world = SimWorld::default();
        let orch = orchestrator(&world);

        orch.deactivate_emergency_stop("nothing to clear");

        assert!(!orch.is_emergency_stop_enabled());
        assert!(!orch
            .events()
            .iter()
            .any(|e| matches!(e.payload, EventPayload::EmergencyDeactivated(_))));
    }
}

/// Loss, concentration and API failure triggers fired from a cycle.
mod trigger_tests {
    use super::*;

    #[tokio::test]
    async fn daily_loss_latches_without_liquidation() {
        // 540 against 1000 at day start: a 46% daily loss
        let world = SimWorld {
            portfolio: Arc::new(SimPortfolio::new(dec!(540), dec!(1000), dec!(1000), dec!(0.10))),
            ..SimWorld::default()
        };
        // loosen the monitor so the emergency rules decide
        let mut config = SystemConfig::default();
        config.risk.max_daily_loss_pct = dec!(1);
        config.risk.max_total_loss_pct = dec!(1);
        let orch = Orchestrator::new(config, world.collaborators()).unwrap();

        let outcome = orch.run_cycle().await;
        assert_eq!(outcome, CycleOutcome::Skipped(SkipReason::EmergencyTriggered));

        let status = orch.status().await;
        assert!(status.emergency_state.is_active);
        assert_eq!(status.emergency_state.emergency_type, Some(EmergencyType::PortfolioLoss));
        assert!(!status.emergency_state.liquidation_requested);
        assert_eq!(status.recent_alerts.last().map(|a| a.severity), Some(Severity::Error));
        assert_eq!(world.network.liquidations(), 0);
        assert_eq!(world.total_strategy_runs(), 0);
    }

    #[tokio::test]
    async fn hard_loss_limit_requests_liquidation() {
        let world = SimWorld {
            portfolio: Arc::new(SimPortfolio::new(dec!(540), dec!(1000), dec!(1000), dec!(0.10))),
            ..SimWorld::default()
        };
        let orch = orchestrator(&world);

        let outcome = orch.run_cycle().await;
        assert_eq!(outcome, CycleOutcome::Skipped(SkipReason::RiskTooHigh));

        let state = orch.status().await.emergency_state;
        assert!(state.is_active);
        assert_eq!(state.emergency_type, Some(EmergencyType::RiskLimit));
        assert!(state.liquidation_requested);
        assert_eq!(world.network.liquidations(), 1);
    }

    #[tokio::test]
    async fn over_concentration_pauses_without_latching() {
        let world = SimWorld::default();
        world.portfolio.set_concentration(dec!(0.60));
        let orch = orchestrator(&world);

        assert_eq!(orch.run_cycle().await, CycleOutcome::Skipped(SkipReason::RiskTooHigh));
        assert!(!orch.is_emergency_stop_enabled());
    }

    #[tokio::test]
    async fn consecutive_quote_failures_trigger_api_emergency() {
        let world = SimWorld::default();
        let orch = orchestrator(&world);

        // no pool for this token, so every quote fails
        for _ in 0..5 {
            let t = TradeRequest::new("USDC", "NOPE", Quote::new(dec!(10)), dec!(0.01));
            let result = orch.execute_manual_trade(t, false).await;
            assert!(!result.success);
        }

        let outcome = orch.run_cycle().await;
        assert_eq!(outcome, CycleOutcome::Skipped(SkipReason::EmergencyTriggered));
        let state = orch.status().await.emergency_state;
        assert_eq!(state.emergency_type, Some(EmergencyType::ApiFailure));
    }
}

/// Breaker behaviour seen through the cycle.
mod breaker_tests {
    use super::*;

    #[tokio::test]
    async fn open_health_breaker_skips_probe() {
        let world = SimWorld::default();
        world.network.set_healthy(false);
        let orch = orchestrator(&world);

        for _ in 0..5 {
            assert_eq!(orch.run_cycle().await, CycleOutcome::Skipped(SkipReason::HealthCheckFailed));
        }
        assert_eq!(world.network.health_calls(), 5);

        // breaker is open: the sixth cycle fails fast without touching the network
        assert_eq!(orch.run_cycle().await, CycleOutcome::Skipped(SkipReason::HealthCheckFailed));
        assert_eq!(world.network.health_calls(), 5);

        let status = orch.status().await;
        let health = status.breaker_states.iter().find(|b| b.name == "health").unwrap();
        assert_eq!(health.state, BreakerState::Open);
        assert_eq!(world.total_strategy_runs(), 0);
        // health failures stop the cycle before the emergency rules run
        assert!(!status.emergency_state.is_active);
    }

    #[tokio::test]
    async fn breaker_change_is_recorded() {
        let world = SimWorld::default();
        world.network.set_healthy(false);
        let orch = orchestrator(&world);

        for _ in 0..5 {
            orch.run_cycle().await;
        }

        assert!(orch.events().iter().any(|e| matches!(
            &e.payload,
            EventPayload::BreakerStateChanged(c) if c.breaker == "health" && c.to == BreakerState::Open
        )));
    }
}

/// Admission gate and risk validation on manual trades.
mod gate_tests {
    use super::*;

    #[tokio::test]
    async fn oversized_trade_is_rejected() {
        let world = SimWorld::default();
        let mut config = SystemConfig::default();
        config.limits.max_position_size = Quote::new(dec!(50));
        let orch = Orchestrator::new(config, world.collaborators()).unwrap();

        let result = orch.execute_manual_trade(trade(dec!(100)), false).await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("Position size limit exceeded"));
        assert_eq!(world.network.quote_calls(), 0);
        assert_eq!(world.network.swap_calls(), 0);
    }

    #[tokio::test]
    async fn bypass_skips_only_risk_validation() {
        let world = SimWorld::default();
        let orch = orchestrator(&world);

        // 10% of 10000 is the per-trade allowance; 1000 is at the position limit
        let big = trade(dec!(1000));
        assert!(orch.execute_manual_trade(big.clone(), false).await.success);

        let bigger = TradeRequest::new("USDC", "WRON", Quote::new(dec!(1001)), dec!(0.01));
        let rejected = orch.execute_manual_trade(bigger.clone(), true).await;
        assert!(!rejected.success, "gate still applies when risk is bypassed");

        let over_allowance = TradeRequest::new("USDC", "SLP", Quote::new(dec!(1000.5)), dec!(0.01));
        let mut config = SystemConfig::default();
        config.limits.max_position_size = Quote::new(dec!(2000));
        let orch = Orchestrator::new(config, world.collaborators()).unwrap();
        let refused = orch.execute_manual_trade(over_allowance.clone(), false).await;
        assert!(!refused.success);
        assert_eq!(refused.adjusted_amount, Some(Quote::new(dec!(1000))));
        assert!(orch.execute_manual_trade(over_allowance, true).await.success);
    }

    #[tokio::test]
    async fn fills_count_toward_limits() {
        let world = SimWorld::default();
        let orch = orchestrator(&world);

        for _ in 0..3 {
            assert!(orch.execute_manual_trade(trade(dec!(300)), false).await.success);
        }
        // 900 held, 300 more would pass the position limit of 1000
        let result = orch.execute_manual_trade(trade(dec!(300)), false).await;
        assert!(!result.success);

        let status = orch.status().await;
        assert_eq!(status.gate.total_exposure, Quote::new(dec!(900)));
        assert_eq!(status.stats.trades_executed, 3);
        assert_eq!(status.stats.trades_rejected, 1);
    }
}

/// Decision matrix outcomes.
mod decision_tests {
    use super::*;

    #[tokio::test]
    async fn medium_risk_low_confidence_dispatches_nothing() {
        let world = SimWorld::default();
        world.portfolio.set_total(dec!(9000));
        world.portfolio.set_concentration(dec!(0.20));
        world.market.set_condition(MarketCondition {
            trend: Trend::Bullish,
            volatility: VolatilityClass::Low,
            liquidity: LiquidityClass::High,
            confidence: 60,
        });
        let orch = orchestrator(&world);

        let outcome = orch.run_cycle().await;

        assert_eq!(orch.status().await.risk_level, Some(RiskLevel::Medium));
        assert_eq!(outcome, CycleOutcome::Skipped(SkipReason::NoStrategyMatched));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(world.total_strategy_runs(), 0);
    }

    #[tokio::test]
    async fn low_risk_bullish_dispatches_rule_strategies() {
        let world = SimWorld::default();
        let orch = orchestrator(&world);

        let outcome = orch.run_cycle().await;
        assert_eq!(
            outcome,
            CycleOutcome::Dispatched(vec![StrategyKind::Arbitrage, StrategyKind::MarketMaking, StrategyKind::CrossGame])
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(world.strategy(StrategyKind::Arbitrage).unwrap().runs(), 1);
        assert_eq!(world.strategy(StrategyKind::NftAnalytics).unwrap().runs(), 0);
    }

    #[tokio::test]
    async fn extreme_volatility_and_unfavorable_skip() {
        let world = SimWorld::default();
        let orch = orchestrator(&world);

        world.market.set_condition(MarketCondition {
            trend: Trend::Bullish,
            volatility: VolatilityClass::Extreme,
            liquidity: LiquidityClass::High,
            confidence: 90,
        });
        assert_eq!(orch.run_cycle().await, CycleOutcome::Skipped(SkipReason::ExtremeVolatility));

        world.market.set_condition(MarketCondition {
            trend: Trend::Bullish,
            volatility: VolatilityClass::Low,
            liquidity: LiquidityClass::High,
            confidence: 90,
        });
        world.market.set_favorable(false);
        assert_eq!(orch.run_cycle().await, CycleOutcome::Skipped(SkipReason::Unfavorable));
        assert!(!orch.is_emergency_stop_enabled());
    }

    #[tokio::test]
    async fn portfolio_outage_skips_without_tripping_breakers() {
        let world = SimWorld::default();
        world.portfolio.set_fails(true);
        let orch = orchestrator(&world);

        for _ in 0..6 {
            assert_eq!(orch.run_cycle().await, CycleOutcome::Skipped(SkipReason::RiskCheckFailed));
        }
        let status = orch.status().await;
        assert!(status.breaker_states.iter().all(|b| b.state == BreakerState::Closed));
        assert!(!status.emergency_state.is_active);
    }
}

/// Config staging and lifecycle.
mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn staged_config_applies_at_next_cycle() {
        let world = SimWorld::default();
        let orch = orchestrator(&world);

        let mut tighter = SystemConfig::default();
        tighter.limits.max_position_size = Quote::new(dec!(50));
        TradingControl::update_config(&orch, tighter).unwrap();
        assert!(orch.status().await.config_pending);

        // still on the old limits until a cycle starts
        assert!(orch.execute_manual_trade(trade(dec!(100)), false).await.success);

        orch.run_cycle().await;
        assert!(!orch.status().await.config_pending);
        assert_eq!(orch.config().limits.max_position_size, Quote::new(dec!(50)));

        let t = TradeRequest::new("USDC", "WRON", Quote::new(dec!(100)), dec!(0.01));
        assert!(!orch.execute_manual_trade(t, false).await.success);
    }

    #[tokio::test]
    async fn invalid_update_is_refused() {
        let world = SimWorld::default();
        let orch = orchestrator(&world);

        let mut bad = SystemConfig::default();
        bad.limits.max_slippage_tolerance = dec!(0.9);
        assert!(matches!(
            TradingControl::update_config(&orch, bad),
            Err(ConfigError::InvalidLimits { .. })
        ));
        assert!(!orch.has_staged_config());
    }

    #[test]
    fn construction_validates_config_and_wallet() {
        let world = SimWorld::default();

        let mut bad = SystemConfig::default();
        bad.risk.low_cutoff = dec!(80);
        assert!(matches!(
            Orchestrator::new(bad, world.collaborators()),
            Err(OrchestratorError::Config(ConfigError::InvalidRisk { .. }))
        ));

        let mainnet = SystemConfig::mainnet_conservative();
        assert!(matches!(
            Orchestrator::new(mainnet.clone(), world.collaborators()),
            Err(OrchestratorError::Config(ConfigError::MissingCredential(_)))
        ));

        let mut funded = mainnet;
        funded.wallet = Some("0xabc".to_string());
        assert!(Orchestrator::new(funded, world.collaborators()).is_ok());
    }

    #[test]
    fn start_needs_a_runtime() {
        let world = SimWorld::default();
        let orch = orchestrator(&world);
        let started = futures::executor::block_on(orch.start());
        assert_eq!(started, Err(OrchestratorError::NoRuntime));
        assert!(!orch.is_running());
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let world = SimWorld::default();
        let mut config = SystemConfig::default();
        config.cycle.interval_ms = 10;
        let orch = Orchestrator::new(config, world.collaborators()).unwrap();

        orch.start().await.unwrap();
        orch.start().await.unwrap();
        assert!(orch.is_running());

        tokio::time::sleep(Duration::from_millis(50)).await;

        orch.stop().await;
        orch.stop().await;
        assert!(!orch.is_running());

        let stats = orch.stats();
        assert!(stats.cycles_started >= 1);
        let events = orch.events();
        let started = events.iter().filter(|e| matches!(e.payload, EventPayload::Started)).count();
        let stopped = events.iter().filter(|e| matches!(e.payload, EventPayload::Stopped)).count();
        assert_eq!((started, stopped), (1, 1));

        // no cycles after stop
        let after = orch.stats().cycles_started;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(orch.stats().cycles_started, after);
    }
}
