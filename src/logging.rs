//! Structured logging set-up.
//!
//! Installs a global `tracing` subscriber with an [`EnvFilter`] (`RUST_LOG`
//! takes precedence over `[logging].level`) and either a human-readable or
//! a JSON formatter. Logs go to stderr so that CLI commands can print
//! machine-readable results on stdout.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Initialize the global logger. Calling it twice is harmless; the second
/// call is ignored.
pub fn init_logging(config: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(env_filter);

    let _ = if config.format == "json" {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .try_init()
    };
}
