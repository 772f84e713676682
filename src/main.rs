//! Sentinel control loop simulation.
//!
//! Drives the orchestrator against simulated collaborators through the
//! scenarios the control loop must get right: breaker trips, gate rejections,
//! loss-triggered emergency stops and decision-matrix skips.
//!
//! Usage:
//!   sentinel-sim [--config FILE] [--scenario NAME] [--cycles N] [--log-level LEVEL] [--json-logs]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use dex_sentinel::logging::setup_logging;
use dex_sentinel::sim::SimWorld;
use dex_sentinel::*;
use rust_decimal_macros::dec;

#[derive(Parser, Debug)]
#[command(name = "sentinel-sim")]
#[command(about = "Run the risk-gated control loop against simulated collaborators")]
#[command(version)]
struct Args {
    /// TOML config file (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter, a bare level or a full directive string
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Cycles to run in the loop scenario
    #[arg(long, default_value_t = 3)]
    cycles: u32,

    #[arg(long, value_enum, default_value_t = Scenario::All)]
    scenario: Scenario,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    All,
    Breaker,
    Gate,
    DailyLoss,
    Decision,
    Loop,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level, args.json_logs).context("failed to initialize logging")?;

    let config = match &args.config {
        Some(path) => SystemConfig::from_file(path).with_context(|| format!("failed to load {}", path.display()))?,
        None => SystemConfig::default(),
    }
    .with_env_credentials();
    config.require_wallet().context("startup credentials")?;

    println!("Sentinel Control Loop Simulation ({:?})\n", config.environment);

    let run = |s: Scenario| args.scenario == Scenario::All || args.scenario == s;
    if run(Scenario::Breaker) {
        scenario_breaker_trip(&config).await?;
    }
    if run(Scenario::Gate) {
        scenario_gate_rejection(&config).await?;
    }
    if run(Scenario::DailyLoss) {
        scenario_daily_loss(&config).await?;
    }
    if run(Scenario::Decision) {
        scenario_medium_risk_skip(&config).await?;
    }
    if run(Scenario::Loop) {
        scenario_loop(&config, args.cycles).await?;
    }

    println!("\nAll scenarios completed.");
    Ok(())
}

fn orchestrator(config: &SystemConfig, world: &SimWorld) -> Result<Orchestrator> {
    Orchestrator::new(config.clone(), world.collaborators()).context("failed to build orchestrator")
}

/// Five health failures open the breaker; the sixth probe never reaches the network.
async fn scenario_breaker_trip(config: &SystemConfig) -> Result<()> {
    println!("Scenario: Health Breaker Trip\n");

    let world = SimWorld::default();
    world.network.set_healthy(false);
    let orch = orchestrator(config, &world)?;

    let threshold = config.breakers.health.failure_threshold;
    for _ in 0..threshold {
        let outcome = orch.run_cycle().await;
        println!("  cycle: {:?}", outcome);
    }
    let calls = world.network.health_calls();
    let outcome = orch.run_cycle().await;
    println!("  cycle: {:?}", outcome);

    let status = orch.status().await;
    for b in &status.breaker_states {
        println!("  breaker {:<6} {} (trips {})", b.name, b.state, b.total_trips);
    }
    println!(
        "  health probes: {} before the extra cycle, {} after\n",
        calls,
        world.network.health_calls()
    );
    Ok(())
}

/// A trade larger than the position limit is refused with a size reason.
async fn scenario_gate_rejection(config: &SystemConfig) -> Result<()> {
    println!("Scenario: Admission Gate\n");

    let mut config = config.clone();
    config.limits.max_position_size = Quote::new(dec!(50));
    config.limits.min_trade_amount = Quote::new(dec!(1));
    let world = SimWorld::default();
    let orch = orchestrator(&config, &world)?;

    let amount = TradeRequest::parse_amount("100")?;
    let trade = TradeRequest::new("USDC", "AXS", amount, dec!(0.01));
    let result = orch.execute_manual_trade(trade, false).await;
    println!("  100 USDC -> AXS with max position 50: success={} error={:?}", result.success, result.error);

    let trade = TradeRequest::new("USDC", "AXS", Quote::new(dec!(40)), dec!(0.01));
    let result = orch.execute_manual_trade(trade, false).await;
    println!("  40 USDC -> AXS: success={} tx={:?}\n", result.success, result.transaction_id);
    Ok(())
}

/// A 46% daily drawdown latches the emergency stop.
async fn scenario_daily_loss(config: &SystemConfig) -> Result<()> {
    println!("Scenario: Daily Loss Emergency\n");

    let snapshot = PortfolioSnapshot::new(
        Quote::new(dec!(540)),
        Quote::new(dec!(1000)),
        Quote::new(dec!(1000)),
        dec!(0.10),
        Timestamp::now(),
    );
    let controller = EmergencyController::new(config.emergency.clone());
    let check = controller.check_emergency_conditions(&EmergencyMetrics::from_snapshot(&snapshot, dec!(0), 0));
    println!(
        "  check: trigger={} type={:?} severity={}",
        check.should_trigger, check.emergency_type, check.severity
    );

    let world = SimWorld::default();
    world.portfolio.set_total(dec!(5400));
    let orch = orchestrator(config, &world)?;
    let outcome = orch.run_cycle().await;
    let status = orch.status().await;
    println!("  cycle: {:?}", outcome);
    println!(
        "  emergency active={} type={:?}",
        status.emergency_state.is_active, status.emergency_state.emergency_type
    );

    let trade = TradeRequest::new("USDC", "AXS", Quote::new(dec!(10)), dec!(0.01));
    let result = orch.execute_manual_trade(trade.clone(), false).await;
    println!("  manual trade while latched: success={} error={:?}", result.success, result.error);

    orch.deactivate_emergency_stop("operator reviewed drawdown");
    println!("  after deactivation active={}\n", orch.is_emergency_stop_enabled());
    Ok(())
}

/// Medium risk with 60% confidence matches no rule, so nothing is dispatched.
async fn scenario_medium_risk_skip(config: &SystemConfig) -> Result<()> {
    println!("Scenario: Decision Matrix Skip\n");

    let world = SimWorld::default();
    world.portfolio.set_total(dec!(9000));
    world.portfolio.set_concentration(dec!(0.20));
    world.market.set_condition(MarketCondition {
        trend: Trend::Bullish,
        volatility: VolatilityClass::Low,
        liquidity: LiquidityClass::High,
        confidence: 60,
    });

    let orch = orchestrator(config, &world)?;
    let outcome = orch.run_cycle().await;
    let status = orch.status().await;
    println!("  risk level: {:?}", status.risk_level);
    println!("  cycle: {:?}", outcome);
    println!("  strategy runs: {}\n", world.total_strategy_runs());
    Ok(())
}

/// Run the timer loop for a few cycles, then stop cleanly.
async fn scenario_loop(config: &SystemConfig, cycles: u32) -> Result<()> {
    println!("Scenario: Timed Loop ({} cycles)\n", cycles);

    let mut config = config.clone();
    config.cycle.interval_ms = 200;
    let world = SimWorld::default();
    let control = CachedOrchestrator::new(orchestrator(&config, &world)?);

    control.start().await?;
    tokio::time::sleep(std::time::Duration::from_millis(200 * cycles as u64 + 50)).await;

    let tokens = [TokenId::new("WRON"), TokenId::new("AXS")];
    let prices = control.token_prices(&tokens).await?;
    let _ = control.token_prices(&tokens).await?;
    let (hits, misses) = control.cache_stats();
    println!("  prices: {:?} (cache hits {}, misses {})", prices, hits, misses);

    control.stop().await;
    control.stop().await;

    let status = control.get_status().await;
    println!(
        "  cycles started {}, dispatched {}, skipped {}",
        status.stats.cycles_started,
        status.stats.cycles_dispatched,
        status.stats.skipped_total()
    );
    println!("  strategy runs: {}", world.total_strategy_runs());
    println!("  running after stop: {}", status.is_running);
    Ok(())
}
