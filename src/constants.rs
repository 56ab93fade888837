//! # System Constants
//!
//! Reserved exit codes, environment variable names, and operational defaults
//! shared across the pool engine, the cluster composition, and the worker
//! entry point.

use std::time::Duration;

/// Exit code a process uses when its error-density limiter has tripped.
///
/// Chosen to be distinguishable from an ordinary crash: Rust panics exit
/// with 101 and signal deaths carry no code at all, so a supervising parent
/// that sees this code knows "too many errors", not "single crash". The
/// value sits in the BSD `sysexits` software-error range.
pub const FATAL_EXIT_CODE: i32 = 70;

/// Reserved adapter module path for the cluster's process→thread bridge.
pub const BRIDGE_MODULE_PATH: &str = "offload.cluster.bridge";

/// Environment variable names recognized by the runtime.
pub mod env {
    /// Marker set on spawned worker processes; its value is the worker slot
    /// id assigned by the parent pool.
    pub const WORKER_SLOT: &str = "OFFLOAD_WORKER_SLOT";

    /// Deployment environment: `development`, `test`, or `production`.
    pub const ENVIRONMENT: &str = "OFFLOAD_ENV";

    /// Log filter directive, takes precedence over `RUST_LOG`.
    pub const LOG_FILTER: &str = "OFFLOAD_LOG";

    /// Set to `1` or `true` to force thread pools down to a single worker
    /// for deterministic debugging.
    pub const SINGLE_WORKER: &str = "OFFLOAD_SINGLE_WORKER";

    /// Path to an optional TOML configuration file for binaries.
    pub const CONFIG_PATH: &str = "OFFLOAD_CONFIG_PATH";
}

/// Default per-request timeout applied when a pool is built without one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(30_000);

/// How long a worker process gets to exit after a shutdown frame before it
/// is killed outright.
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Default sliding window for the error-density limiter.
pub const DEFAULT_OBSERVATION_PERIOD: Duration = Duration::from_millis(60_000);

/// Default error count the limiter tolerates within its window.
pub const DEFAULT_REGISTRATION_LIMIT: usize = 10;

/// Capacity of the broadcast channel carrying pool lifecycle events.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default worker concurrency: available parallelism minus one, reserving a
/// core for the dispatching side, never below one.
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_concurrency_is_at_least_one() {
        assert!(default_concurrency() >= 1);
    }

    #[test]
    fn fatal_exit_code_is_not_a_panic_code() {
        assert_ne!(FATAL_EXIT_CODE, 101);
        assert_ne!(FATAL_EXIT_CODE, 0);
    }
}
