//! Telemetry and Observability
//!
//! Sets up `tracing-subscriber` for structured logging. The level comes from
//! `RUST_LOG`, then the `--log` flag or config, then "info". Debug builds log
//! pretty-printed to stderr; release builds log JSON with the current span.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn filter_for(log_level: &str) -> EnvFilter {
    let default_filter = format!("{},waypoint_engine={}", log_level, log_level);
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Initialize the tracing subscriber with the given log level.
///
/// Only the first call in a process installs a subscriber; later calls are
/// no-ops.
pub fn init_telemetry_with_level(log_level: &str) {
    let env_filter = filter_for(log_level);

    #[cfg(debug_assertions)]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }

    #[cfg(not(debug_assertions))]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_current_span(true).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}

pub fn init_telemetry() {
    init_telemetry_with_level("info");
}
