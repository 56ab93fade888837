//! # Adapter Layer
//!
//! The bridge from a module path plus an options value to a loaded handler.
//! Workers resolve their handler exactly once at startup, before signalling
//! readiness; identical machinery runs inside a worker process and inside a
//! worker thread.
//!
//! Loading is backed by a compiled [`HandlerRegistry`](registry::HandlerRegistry):
//! module paths are registered up front and resolved to
//! [`HandlerFactory`] instances at spawn time. Factories receive the options
//! value from the [`AdapterConfig`] and may perform async setup (open
//! connections, warm caches) before returning the handler.
//!
//! ## Usage
//!
//! ```rust
//! use async_trait::async_trait;
//! use offload_core::adapter::{AdapterConfig, Handler, HandlerFactory, HandlerResult};
//! use offload_core::adapter::registry::HandlerRegistry;
//! use offload_core::error::Result;
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! struct Doubler;
//!
//! #[async_trait]
//! impl Handler for Doubler {
//!     async fn handle(&self, payload: Value) -> HandlerResult {
//!         let n = payload.as_i64().unwrap_or(0);
//!         Ok(json!(n * 2))
//!     }
//! }
//!
//! struct DoublerFactory;
//!
//! #[async_trait]
//! impl HandlerFactory for DoublerFactory {
//!     async fn load(&self, _options: &Value) -> Result<Arc<dyn Handler>> {
//!         Ok(Arc::new(Doubler))
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let registry = HandlerRegistry::new();
//! registry.register("math.doubler", Arc::new(DoublerFactory));
//!
//! let config = AdapterConfig::new("math.doubler", json!(null));
//! let handler = registry.load(&config).await.unwrap();
//! assert_eq!(handler.handle(json!(21)).await.unwrap(), json!(42));
//! # });
//! ```

pub mod registry;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::{AssignError, Result};

pub use registry::HandlerRegistry;

/// What a worker loads at spawn time: a registered module path and the
/// options handed to its factory. Value-copied to every worker, so each
/// worker owns an independent handler instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub module_path: String,
    #[serde(default)]
    pub options: Value,
}

impl AdapterConfig {
    pub fn new(module_path: impl Into<String>, options: Value) -> Self {
        Self {
            module_path: module_path.into(),
            options,
        }
    }
}

/// A handler failure. The worker survives it; the failure travels back as
/// the assignment's error payload.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub detail: Option<Value>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(message: impl Into<String>, detail: Value) -> Self {
        Self {
            message: message.into(),
            detail: Some(detail),
        }
    }
}

impl From<HandlerError> for AssignError {
    fn from(err: HandlerError) -> Self {
        AssignError::Handler {
            message: err.message,
            detail: err.detail,
        }
    }
}

pub type HandlerResult = std::result::Result<Value, HandlerError>;

/// A loaded unit-of-work processor. One instance per worker, invoked for
/// every work message the worker receives.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, payload: Value) -> HandlerResult;
}

/// Builds handlers from an options value. Registered in a
/// [`HandlerRegistry`] under a module path.
#[async_trait]
pub trait HandlerFactory: Send + Sync {
    async fn load(&self, options: &Value) -> Result<Arc<dyn Handler>>;
}
