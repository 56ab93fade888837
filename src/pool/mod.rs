//! # Worker Pools
//!
//! Request-dispatch pools that push work to a fixed-capacity set of
//! workers. Two implementations share one engine:
//!
//! - [`ThreadPool`]: workers are OS threads inside this process, each
//!   running handlers on its own single-threaded runtime.
//! - [`ProcessPool`]: workers are child processes speaking newline-framed
//!   JSON over stdio, for isolation and multi-core spread.
//!
//! Callers interact through a [`PoolHandle`]: `assign` a JSON payload and
//! await the settled result, `destroy` to drain, `events` to observe the
//! pool lifecycle.
//!
//! ## Usage
//!
//! ```ignore
//! let pool = ThreadPool::start(AdapterConfig::new("my.handler", json!({})), options)?;
//! let answer = pool.assign(json!({"work": 1})).await?;
//! pool.destroy().await;
//! ```

pub mod engine;
pub mod events;
pub mod process;
pub mod thread;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::AssignError;
use engine::PoolCommand;

pub use engine::{PoolStatus, WorkEnvelope, WorkerDriver, WorkerEvent};
pub use events::{EventHub, PoolEvent, PoolEventKind};
pub use process::ProcessPool;
pub use thread::ThreadPool;

/// Identifies one worker slot for the lifetime of a pool.
///
/// Ids are never reused; a replacement worker gets a fresh id so late
/// events from its predecessor cannot be misattributed.
pub type WorkerId = u64;

/// Cloneable front door to a pool engine.
///
/// Dropping every clone destroys the pool.
#[derive(Clone)]
pub struct PoolHandle {
    commands: mpsc::UnboundedSender<PoolCommand>,
    events: EventHub,
}

impl PoolHandle {
    pub(crate) fn new(commands: mpsc::UnboundedSender<PoolCommand>, events: EventHub) -> Self {
        Self { commands, events }
    }

    /// Weak command sender for the signal guard; does not keep the engine
    /// alive.
    pub(crate) fn downgrade_commands(&self) -> mpsc::WeakUnboundedSender<PoolCommand> {
        self.commands.downgrade()
    }

    /// Queue one request and await its settlement.
    ///
    /// Resolves with the handler's JSON result, or an [`AssignError`]
    /// describing the admission, timeout, or worker failure.
    pub async fn assign(&self, payload: Value) -> Result<Value, AssignError> {
        let (settle, settled) = oneshot::channel();
        if self
            .commands
            .send(PoolCommand::Assign { payload, settle })
            .is_err()
        {
            return Err(AssignError::PoolClosed);
        }
        settled.await.unwrap_or(Err(AssignError::PoolClosed))
    }

    /// Destroy the pool: reject the backlog, settle in-flight requests as
    /// closed, and tear every worker down. Idempotent.
    pub async fn destroy(&self) {
        let (done, finished) = oneshot::channel();
        if self.commands.send(PoolCommand::Destroy { done }).is_ok() {
            let _ = finished.await;
        }
    }

    /// Snapshot of the pool's queue and worker counts.
    pub async fn status(&self) -> Result<PoolStatus, AssignError> {
        let (reply, replied) = oneshot::channel();
        self.commands
            .send(PoolCommand::Status { reply })
            .map_err(|_| AssignError::PoolClosed)?;
        replied.await.map_err(|_| AssignError::PoolClosed)
    }

    /// Resolve once the first worker has come online.
    ///
    /// Errors if the pool is destroyed before that happens.
    pub async fn wait_online(&self) -> Result<(), AssignError> {
        let (reply, replied) = oneshot::channel();
        self.commands
            .send(PoolCommand::WaitOnline { reply })
            .map_err(|_| AssignError::PoolClosed)?;
        replied.await.map_err(|_| AssignError::PoolClosed)
    }

    /// Subscribe to lifecycle events (`online`, `error`, `fatal`, worker
    /// output). Events published before subscribing are not replayed.
    pub fn events(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }
}
