//! tracing subscriber setup

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Configuration for the logging system
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter used when `RUST_LOG` is not set
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `config.level`.
///
/// Output goes to stderr; a provider's stdout carries protocol frames.
///
/// Returns false if a subscriber was already installed.
pub fn init_logging(config: &LogConfig) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);

    if config.json {
        registry
            .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
            .try_init()
            .is_ok()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr)
                    .compact(),
            )
            .try_init()
            .is_ok()
    }
}
