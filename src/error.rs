//! # Error Types
//!
//! Structured error handling for the dispatch runtime using thiserror.
//! `OffloadError` covers construction and infrastructure failures;
//! `AssignError` is the per-assignment failure taxonomy surfaced by
//! `assign()`.

use serde_json::Value;
use thiserror::Error;

/// Infrastructure and construction errors.
#[derive(Error, Debug)]
pub enum OffloadError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("No handler registered for module path: {module_path}")]
    HandlerNotFound { module_path: String },

    #[error("Handler load failed for {module_path}: {message}")]
    HandlerLoad { module_path: String, message: String },

    #[error("Worker spawn failed: {message}")]
    Spawn { message: String },

    #[error("Wire protocol error: {message}")]
    Wire { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OffloadError {
    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a handler load error
    pub fn handler_load(module_path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::HandlerLoad {
            module_path: module_path.into(),
            message: message.into(),
        }
    }

    /// Create a worker spawn error
    pub fn spawn(message: impl Into<String>) -> Self {
        Self::Spawn {
            message: message.into(),
        }
    }

    /// Create a wire protocol error
    pub fn wire(message: impl Into<String>) -> Self {
        Self::Wire {
            message: message.into(),
        }
    }
}

/// Failure kinds a single `assign()` call can settle with.
///
/// Individual assignment failures reach only their caller and never abort
/// the pool; systemic failure escalates separately through the
/// error-density limiter.
#[derive(Error, Debug)]
pub enum AssignError {
    /// Backlog was full at call time; no worker was touched.
    #[error("Pending backlog is full")]
    MaxPending,

    /// No worker response arrived within the per-request timeout.
    #[error("Assignment timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The assigned worker terminated before responding.
    #[error("Worker exited before responding")]
    WorkerExit,

    /// The handler reported a failure; the worker itself survived.
    #[error("Handler error: {message}")]
    Handler {
        message: String,
        detail: Option<Value>,
    },

    /// The pool was destroyed before the assignment settled.
    #[error("Pool is destroyed")]
    PoolClosed,
}

impl AssignError {
    /// Create a handler error with no structured detail
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
            detail: None,
        }
    }

    /// Create a handler error carrying a structured diagnostic payload
    pub fn handler_with_detail(message: impl Into<String>, detail: Value) -> Self {
        Self::Handler {
            message: message.into(),
            detail: Some(detail),
        }
    }
}

pub type Result<T> = std::result::Result<T, OffloadError>;
