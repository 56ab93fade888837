//! # Cluster Composition
//!
//! Scales one adapter across processes and threads. With a process
//! concurrency of one the cluster is just a [`ThreadPool`]; above that it
//! becomes a [`ProcessPool`] whose children each run an inner thread pool,
//! connected by a pre-registered bridge handler. Callers get an ordinary
//! [`PoolHandle`] either way.
//!
//! The cluster also owns the process-wide fatal policy: when its pool
//! emits `fatal` (error density tripped, or a child escalated with the
//! reserved exit code), the default policy exits the host process with
//! that same code so a supervisor can distinguish "too many errors" from
//! an ordinary crash. Embedders that manage their own lifecycle choose
//! [`FatalPolicy::DestroyOnly`] instead.
//!
//! ## Usage
//!
//! ```ignore
//! let cluster = Cluster::start(
//!     AdapterConfig::new("my.handler", json!({})),
//!     ClusterOptions::default(),
//! )?;
//! let result = cluster.assign(json!({"work": true})).await?;
//! ```

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use crate::adapter::{
    AdapterConfig, Handler, HandlerError, HandlerFactory, HandlerRegistry, HandlerResult,
};
use crate::config::PoolOptions;
use crate::constants::{default_concurrency, BRIDGE_MODULE_PATH, FATAL_EXIT_CODE};
use crate::error::{AssignError, OffloadError, Result};
use crate::pool::{PoolEventKind, PoolHandle, ProcessPool, ThreadPool};

/// What to do when the cluster's pool raises `fatal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FatalPolicy {
    /// Exit the host process with the reserved fatal code.
    #[default]
    ExitProcess,
    /// Leave the process up; the pool has already destroyed itself.
    DestroyOnly,
}

/// Cluster shape: outer process fan-out and inner per-child threading.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterOptions {
    /// Options for the outer pool; `concurrency_limit` is the process
    /// count (workers when it collapses to a thread pool).
    pub pool: PoolOptions,
    /// Thread workers inside each child; defaults to the machine's
    /// default concurrency.
    pub threads_per_process: Option<usize>,
    pub fatal_policy: FatalPolicy,
}

impl ClusterOptions {
    fn thread_limit(&self) -> usize {
        self.threads_per_process
            .unwrap_or_else(default_concurrency)
            .max(1)
    }

    /// Options for the thread pool each child runs. Process-level knobs
    /// do not apply inside a child.
    fn inner_pool(&self) -> PoolOptions {
        PoolOptions {
            concurrency_limit: Some(self.thread_limit()),
            worker_program: None,
            single_worker: false,
            ..self.pool.clone()
        }
    }
}

/// Process × thread composition over one adapter.
pub struct Cluster;

impl Cluster {
    /// Start the composition and return its pool handle.
    ///
    /// One process means no process layer at all: the adapter runs on an
    /// in-process thread pool sized by `threads_per_process`.
    pub fn start(adapter: AdapterConfig, options: ClusterOptions) -> Result<PoolHandle> {
        let processes = options.pool.process_concurrency();
        let handle = if processes == 1 {
            info!(threads = options.thread_limit(), "CLUSTER: single process, thread pool only");
            let mut pool_options = options.pool.clone();
            pool_options.concurrency_limit = Some(options.thread_limit());
            ThreadPool::start(adapter, pool_options)?
        } else {
            info!(
                processes,
                threads_per_process = options.thread_limit(),
                "CLUSTER: starting process fan-out"
            );
            let bridge = AdapterConfig::new(
                BRIDGE_MODULE_PATH,
                json!({
                    "adapter": adapter,
                    "pool": options.inner_pool(),
                }),
            );
            ProcessPool::start(bridge, options.pool.clone())?
        };

        spawn_fatal_watcher(handle.clone(), options.fatal_policy);
        Ok(handle)
    }
}

/// Applies the fatal policy when the pool gives up.
fn spawn_fatal_watcher(handle: PoolHandle, policy: FatalPolicy) {
    let mut events = handle.events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let PoolEventKind::Fatal { reason } = event.kind {
                        match policy {
                            FatalPolicy::ExitProcess => {
                                error!(reason = %reason, code = FATAL_EXIT_CODE, "CLUSTER: fatal, exiting");
                                std::process::exit(FATAL_EXIT_CODE);
                            }
                            FatalPolicy::DestroyOnly => {
                                warn!(reason = %reason, "CLUSTER: fatal, pool destroyed");
                                return;
                            }
                        }
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return,
            }
        }
    });
}

/// Adapter configuration carried by the bridge frame into each child.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeOptions {
    pub adapter: AdapterConfig,
    pub pool: PoolOptions,
}

/// Factory behind the reserved bridge path. Loaded inside cluster
/// children: builds the inner thread pool, waits for it to come online,
/// and escalates its fatals by exiting the child with the reserved code.
pub struct ClusterBridgeFactory;

#[async_trait::async_trait]
impl HandlerFactory for ClusterBridgeFactory {
    async fn load(&self, options: &serde_json::Value) -> Result<Arc<dyn Handler>> {
        let bridge: BridgeOptions = serde_json::from_value(options.clone())?;
        info!(
            adapter = %bridge.adapter.module_path,
            threads = ?bridge.pool.concurrency_limit,
            "CLUSTER: bridging to inner thread pool"
        );
        let inner = ThreadPool::start(bridge.adapter, bridge.pool)?;
        inner
            .wait_online()
            .await
            .map_err(|err| OffloadError::spawn(format!("inner pool failed to come online: {err}")))?;

        let mut events = inner.events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let PoolEventKind::Fatal { reason } = event.kind {
                            error!(reason = %reason, "CLUSTER: inner pool fatal, exiting child");
                            std::process::exit(FATAL_EXIT_CODE);
                        }
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return,
                }
            }
        });

        Ok(Arc::new(ClusterBridgeHandler { inner }))
    }
}

/// Forwards each unit of work to the child's inner thread pool.
struct ClusterBridgeHandler {
    inner: PoolHandle,
}

#[async_trait::async_trait]
impl Handler for ClusterBridgeHandler {
    async fn handle(&self, payload: serde_json::Value) -> HandlerResult {
        self.inner.assign(payload).await.map_err(bridge_failure)
    }
}

/// Inner-pool failures cross the wire as handler errors; real handler
/// failures keep their message and detail.
fn bridge_failure(err: AssignError) -> HandlerError {
    match err {
        AssignError::Handler { message, detail } => HandlerError { message, detail },
        other => HandlerError::new(other.to_string()),
    }
}

/// Register the bridge factory under its reserved path.
pub fn register_bridge(registry: &HandlerRegistry) {
    registry.register(BRIDGE_MODULE_PATH, Arc::new(ClusterBridgeFactory));
}
