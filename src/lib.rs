#![allow(clippy::doc_markdown)] // Allow technical terms like JSON, SIGTERM in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Offload Core
//!
//! Request-dispatch runtime that pushes JSON work units to pools of
//! workers: threads inside the process, child processes over stdio, or a
//! cluster of both.
//!
//! ## Overview
//!
//! Callers `assign` a `serde_json::Value` to a pool and await the settled
//! result. The pool owns everything in between: FIFO queueing with an
//! optional backlog cap, elastic worker creation up to a concurrency
//! limit, per-request timeouts, crash recovery with replacement workers,
//! and an error-density limiter that declares the pool unhealthy instead
//! of letting it crash-loop.
//!
//! ## Architecture
//!
//! One actor task per pool owns all bookkeeping, so no collection is ever
//! locked. Worker mechanics live behind a driver seam: the same engine
//! runs thread workers (handlers on per-thread runtimes, panics contained
//! at the thread boundary) and process workers (children speaking
//! newline-framed JSON, exits observed by a reaper). The cluster composes
//! the two into process × thread fan-out through a bridge handler, and
//! applies the process-wide fatal policy when a pool gives up.
//!
//! ## Module Organization
//!
//! - [`pool`] - The dispatch engine, thread pools, and process pools
//! - [`cluster`] - Process × thread composition and the fatal policy
//! - [`adapter`] - Handler traits and the module-path registry
//! - [`worker`] - Child-process entry point and builtin handlers
//! - [`wire`] - The stdio frame protocol and buffer reconstruction
//! - [`resilience`] - The sliding-window error-density limiter
//! - [`config`] - Pool options, limiter options, file and env loading
//! - [`error`] - Structured error handling
//! - [`logging`] - Tracing initialization
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use serde_json::{json, Value};
//! use offload_core::adapter::{
//!     AdapterConfig, Handler, HandlerFactory, HandlerRegistry, HandlerResult,
//! };
//! use offload_core::config::PoolOptions;
//! use offload_core::pool::ThreadPool;
//!
//! struct Reverse;
//!
//! #[async_trait]
//! impl Handler for Reverse {
//!     async fn handle(&self, payload: Value) -> HandlerResult {
//!         let text = payload.as_str().unwrap_or_default();
//!         Ok(json!(text.chars().rev().collect::<String>()))
//!     }
//! }
//!
//! struct ReverseFactory;
//!
//! #[async_trait]
//! impl HandlerFactory for ReverseFactory {
//!     async fn load(&self, _options: &Value) -> offload_core::Result<Arc<dyn Handler>> {
//!         Ok(Arc::new(Reverse))
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! HandlerRegistry::global().register("text.reverse", Arc::new(ReverseFactory));
//!
//! let pool = ThreadPool::start(
//!     AdapterConfig::new("text.reverse", json!({})),
//!     PoolOptions::default(),
//! )?;
//! let answer = pool.assign(json!("stressed")).await?;
//! assert_eq!(answer, json!("desserts"));
//! pool.destroy().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Process Workers
//!
//! Process pools re-execute the current binary by default. Embedders call
//! [`worker::run_if_spawned`] at the top of `main` (after registering
//! their handlers) so re-executed children enter the worker protocol
//! instead of the normal program.

pub mod adapter;
pub mod cluster;
pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod pool;
pub mod resilience;
pub mod wire;
pub mod worker;

pub use adapter::{AdapterConfig, Handler, HandlerError, HandlerFactory, HandlerRegistry};
pub use cluster::{Cluster, ClusterOptions, FatalPolicy};
pub use config::{LimiterOptions, OffloadConfig, PoolOptions};
pub use error::{AssignError, OffloadError, Result};
pub use pool::{PoolEvent, PoolEventKind, PoolHandle, PoolStatus, ProcessPool, ThreadPool};
pub use resilience::{ErrorDensityLimiter, FeedOutcome};
