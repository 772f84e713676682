use std::str::FromStr;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber. A bare level ("debug") is used as the base
/// directive; strings containing ',' or '=' are passed through as-is.
/// Returns an error when a subscriber is already installed.
pub fn setup_logging(log_level: &str, json_format: bool) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter_spec = log_level.trim();
    let filter = EnvFilter::from_str(filter_spec).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::registry().with(filter);

    if json_format {
        let json_layer = fmt::layer().json().with_target(false).with_current_span(false);
        subscriber.with(json_layer).try_init()?;
    } else {
        let fmt_layer = fmt::layer().with_target(true).compact();
        subscriber.with(fmt_layer).try_init()?;
    }

    tracing::info!(
        filter = filter_spec,
        format = if json_format { "json" } else { "compact" },
        "logging initialized"
    );
    Ok(())
}
