//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Filter used when `RUST_LOG` is not set: this crate at the configured level,
/// dependencies at warn.
pub fn default_filter(config: &LoggingConfig) -> String {
    format!("authpipe={},warn", config.level)
}

/// Install the global `fmt` subscriber.
///
/// `RUST_LOG` takes precedence over the config. Fails if a global subscriber
/// is already installed.
pub fn init_tracing(
    config: &LoggingConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(config)));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if config.json {
        subscriber.json().try_init()
    } else {
        subscriber.try_init()
    }
}
