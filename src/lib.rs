// dex-sentinel: risk-gated trading control loop for a decentralized token exchange.
// safety first: an emergency latch or a failed check always wins over a trade.
// decision logic takes explicit timestamps; only the orchestrator touches the clock and network.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: TokenId, Quote, Timestamp, RiskLevel, Severity
//   2.x  circuit_breaker.rs: three-state breaker, per-endpoint breaker set
//   2.1  rate_limiter.rs: token bucket + sliding window, bounded acquire
//   3.x  limits.rs: admission gate, protection limits, trade requests
//   4.x  risk.rs: composite risk score, hard limits, trade validation
//   5.x  emergency.rs: trigger rules and the latched emergency stop
//   6.x  decision.rs: strategy decision matrix
//   7.x  config.rs: system config, TOML loading, env presets
//   8.x  collaborators.rs: network, portfolio, market, strategy interfaces
//   9.x  orchestrator/: cycle loop, manual trades, lifecycle, cached decorator
//   10.x price_cache.rs: TTL token price cache
//   11.x events.rs: audit trail of control loop decisions
//   12.x logging.rs, sim.rs: tracing setup, simulated collaborators

// core control modules
pub mod circuit_breaker;
pub mod decision;
pub mod emergency;
pub mod limits;
pub mod orchestrator;
pub mod rate_limiter;
pub mod risk;
pub mod types;

// integration modules
pub mod collaborators;
pub mod config;
pub mod events;
pub mod logging;
pub mod price_cache;
pub mod sim;

// re exports for convenience
pub use circuit_breaker::{BreakerConfig, BreakerError, BreakerSet, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use collaborators::*;
pub use config::{ConfigError, CycleConfig, Environment, SystemConfig};
pub use decision::{Decision, DecisionMatrix, DecisionRule};
pub use emergency::*;
pub use events::*;
pub use limits::*;
pub use orchestrator::*;
pub use rate_limiter::{RateLimitConfig, RateLimitError, RateLimiter};
pub use risk::*;
pub use types::*;
