//! # Structured Logging Module
//!
//! Environment-aware tracing initialization shared by the host process and
//! spawned worker processes. All output goes to stderr: worker children own
//! stdout for the wire protocol, and the parent pool forwards their stderr
//! lines as `stderr` events.

use std::sync::OnceLock;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::Environment;
use crate::constants::env;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize tracing with environment-specific configuration.
///
/// Safe to call more than once and from tests; only the first call installs
/// a subscriber. Honors `OFFLOAD_LOG`, then `RUST_LOG`, then a default
/// derived from the deployment environment.
pub fn init_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = Environment::detect();
        let filter = env_filter(&environment);

        let initialized = if environment.is_production() {
            tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(true)
                        .with_ansi(false)
                        .json()
                        .with_filter(filter),
                )
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(true)
                        .with_thread_ids(true)
                        .compact()
                        .with_filter(filter),
                )
                .try_init()
        };

        // A subscriber may already be installed by an embedding application;
        // that is not an error.
        if initialized.is_ok() {
            tracing::debug!(
                pid = std::process::id(),
                environment = %environment,
                "🔧 LOGGING: initialized"
            );
        }
    });
}

fn env_filter(environment: &Environment) -> EnvFilter {
    EnvFilter::try_from_env(env::LOG_FILTER)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_log_level(environment)))
}

fn default_log_level(environment: &Environment) -> &'static str {
    match environment {
        Environment::Production => "info",
        Environment::Development | Environment::Test => "debug",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_mapping() {
        assert_eq!(default_log_level(&Environment::Test), "debug");
        assert_eq!(default_log_level(&Environment::Development), "debug");
        assert_eq!(default_log_level(&Environment::Production), "info");
    }

    #[test]
    fn init_is_idempotent() {
        init_logging();
        init_logging();
    }
}
