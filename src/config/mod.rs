//! # Configuration System
//!
//! Pool and limiter options with explicit validation, plus deployment
//! environment detection. Options are plain serde structs so they can be
//! built programmatically, loaded from a TOML file, or overridden through
//! `OFFLOAD__`-prefixed environment variables (see [`loader`]).
//!
//! ## Usage
//!
//! ```rust
//! use offload_core::config::PoolOptions;
//! use std::time::Duration;
//!
//! let options = PoolOptions {
//!     concurrency_limit: Some(4),
//!     request_timeout_ms: 5_000,
//!     ..PoolOptions::default()
//! };
//! options.validate().unwrap();
//! assert_eq!(options.request_timeout(), Duration::from_millis(5_000));
//! ```

pub mod loader;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    self, DEFAULT_OBSERVATION_PERIOD, DEFAULT_REGISTRATION_LIMIT, DEFAULT_REQUEST_TIMEOUT,
};
use crate::error::{OffloadError, Result};

pub use loader::ConfigLoader;

/// Deployment environment, detected from `OFFLOAD_ENV`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Test,
    Production,
}

impl Environment {
    /// Detect the environment from `OFFLOAD_ENV`, defaulting to development.
    pub fn detect() -> Self {
        match std::env::var(constants::env::ENVIRONMENT).as_deref() {
            Ok("test") => Environment::Test,
            Ok("production") => Environment::Production,
            _ => Environment::Development,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Test => write!(f, "test"),
            Environment::Production => write!(f, "production"),
        }
    }
}

/// Error-density limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterOptions {
    /// Sliding observation window in milliseconds.
    pub observation_period_ms: u64,
    /// Error count tolerated within the window; one more trips the limiter.
    pub registration_limit: usize,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            observation_period_ms: DEFAULT_OBSERVATION_PERIOD.as_millis() as u64,
            registration_limit: DEFAULT_REGISTRATION_LIMIT,
        }
    }
}

impl LimiterOptions {
    pub fn observation_period(&self) -> Duration {
        Duration::from_millis(self.observation_period_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.observation_period_ms == 0 {
            return Err(OffloadError::configuration(
                "limiter observation_period_ms must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Options shared by thread and process pools. Immutable once a pool is
/// constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Maximum live workers. `None` means available parallelism minus one,
    /// clamped to at least 1.
    pub concurrency_limit: Option<usize>,
    /// Per-request timeout in milliseconds.
    pub request_timeout_ms: u64,
    /// Maximum backlog of assignments that cannot begin immediately.
    /// `None` means unbounded.
    pub max_pending: Option<usize>,
    /// Development mode for thread pools: forces a single worker for
    /// deterministic debugging. Also enabled by `OFFLOAD_SINGLE_WORKER=1`.
    /// Ignored by process pools.
    pub single_worker: bool,
    /// Program spawned for process-pool workers. `None` means the current
    /// executable (which must call `worker::run_if_spawned` early in main).
    /// Ignored by thread pools.
    pub worker_program: Option<PathBuf>,
    /// Extra environment variables for process-pool workers. Ignored by
    /// thread pools.
    pub worker_env: HashMap<String, String>,
    /// Error-density limiter settings.
    pub limiter: LimiterOptions,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: None,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            max_pending: None,
            single_worker: single_worker_env(),
            worker_program: None,
            worker_env: HashMap::new(),
            limiter: LimiterOptions::default(),
        }
    }
}

impl PoolOptions {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Concurrency limit for a process pool.
    pub fn process_concurrency(&self) -> usize {
        self.concurrency_limit
            .unwrap_or_else(constants::default_concurrency)
            .max(1)
    }

    /// Concurrency limit for a thread pool; the single-worker development
    /// mode overrides any configured value.
    pub fn thread_concurrency(&self) -> usize {
        if self.single_worker {
            return 1;
        }
        self.process_concurrency()
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency_limit == Some(0) {
            return Err(OffloadError::configuration(
                "concurrency_limit must be at least 1",
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(OffloadError::configuration(
                "request_timeout_ms must be at least 1",
            ));
        }
        self.limiter.validate()
    }
}

fn single_worker_env() -> bool {
    matches!(
        std::env::var(constants::env::SINGLE_WORKER).as_deref(),
        Ok("1") | Ok("true")
    )
}

/// Top-level configuration for binaries, loadable from TOML plus
/// environment overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OffloadConfig {
    pub pool: PoolOptions,
}

impl OffloadConfig {
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()
    }
}
