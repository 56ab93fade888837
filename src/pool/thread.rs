//! # Thread-Backed Pool
//!
//! Workers are named OS threads inside the current process. Each thread
//! builds a single-threaded tokio runtime, loads its handler from the
//! registry, and then blocks on a crossbeam channel for work envelopes.
//!
//! A handler panic is contained by `catch_unwind`: the thread reports the
//! panic and exits, and the engine replaces it the same way a process pool
//! replaces a dead child. Threads cannot be force-killed, so a timed-out
//! worker is simply abandoned; whatever it eventually produces is dropped
//! as a spurious event.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread;

use crossbeam::channel as work_channel;
use tokio::sync::mpsc;
use tracing::debug;

use crate::adapter::{AdapterConfig, HandlerRegistry};
use crate::config::PoolOptions;
use crate::error::{OffloadError, Result};
use crate::pool::engine::{start_pool, WorkEnvelope, WorkerDriver, WorkerEvent};
use crate::pool::{PoolHandle, WorkerId};

/// Pool of in-process thread workers.
pub struct ThreadPool;

impl ThreadPool {
    /// Start a thread pool resolving handlers from the global registry.
    pub fn start(adapter: AdapterConfig, options: PoolOptions) -> Result<PoolHandle> {
        Self::start_with_registry(adapter, options, HandlerRegistry::global())
    }

    /// Start a thread pool with an explicit registry (used by tests and
    /// embedded setups).
    pub fn start_with_registry(
        adapter: AdapterConfig,
        options: PoolOptions,
        registry: Arc<HandlerRegistry>,
    ) -> Result<PoolHandle> {
        options.validate()?;
        let limit = options.thread_concurrency();
        Ok(start_pool::<ThreadDriver, _>(options, limit, move |events| {
            ThreadDriver {
                adapter,
                registry,
                events,
            }
        }))
    }
}

/// Engine-side handle to one worker thread. Dropping it disconnects the
/// work channel, which ends the thread's receive loop.
pub(crate) struct ThreadWorker {
    work_tx: work_channel::Sender<WorkEnvelope>,
}

struct ThreadDriver {
    adapter: AdapterConfig,
    registry: Arc<HandlerRegistry>,
    events: mpsc::UnboundedSender<WorkerEvent<ThreadWorker>>,
}

impl WorkerDriver for ThreadDriver {
    type Worker = ThreadWorker;

    fn kind(&self) -> &'static str {
        "thread"
    }

    fn spawn_worker(&mut self, id: WorkerId) {
        let adapter = self.adapter.clone();
        let registry = Arc::clone(&self.registry);
        let events = self.events.clone();
        let spawned = thread::Builder::new()
            .name(format!("offload-worker-{id}"))
            .spawn(move || worker_loop(id, adapter, registry, events));
        if let Err(err) = spawned {
            let _ = self.events.send(WorkerEvent::SpawnFailed {
                id,
                error: OffloadError::spawn(format!("worker thread failed to start: {err}")),
            });
        }
    }

    fn deliver(
        &mut self,
        id: WorkerId,
        worker: &mut ThreadWorker,
        envelope: WorkEnvelope,
    ) -> Result<()> {
        worker
            .work_tx
            .send(envelope)
            .map_err(|_| OffloadError::wire(format!("worker thread {id} is gone")))
    }

    fn destroy_worker(&mut self, id: WorkerId, worker: ThreadWorker) {
        debug!(worker_id = id, "THREAD: releasing worker channel");
        drop(worker);
    }
}

/// Body of one worker thread: build a runtime, load the handler, then
/// serve envelopes until the engine drops the channel.
fn worker_loop(
    id: WorkerId,
    adapter: AdapterConfig,
    registry: Arc<HandlerRegistry>,
    events: mpsc::UnboundedSender<WorkerEvent<ThreadWorker>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            let _ = events.send(WorkerEvent::SpawnFailed {
                id,
                error: OffloadError::spawn(format!("worker runtime failed to start: {err}")),
            });
            return;
        }
    };

    let handler = match runtime.block_on(registry.load(&adapter)) {
        Ok(handler) => handler,
        Err(err) => {
            let _ = events.send(WorkerEvent::SpawnFailed { id, error: err });
            return;
        }
    };

    let (work_tx, work_rx) = work_channel::unbounded();
    if events
        .send(WorkerEvent::Ready {
            id,
            worker: ThreadWorker { work_tx },
        })
        .is_err()
    {
        return;
    }

    while let Ok(envelope) = work_rx.recv() {
        let WorkEnvelope { seq, payload, .. } = envelope;
        let outcome =
            std::panic::catch_unwind(AssertUnwindSafe(|| runtime.block_on(handler.handle(payload))));
        let event = match outcome {
            Ok(Ok(value)) => WorkerEvent::Completed {
                id,
                seq,
                payload: value,
            },
            Ok(Err(failure)) => WorkerEvent::HandlerFailed {
                id,
                seq,
                message: failure.message,
                detail: failure.detail,
            },
            Err(panic) => {
                // The thread is finished after a panic; the engine spawns a
                // replacement.
                let _ = events.send(WorkerEvent::Crashed {
                    id,
                    message: panic_message(panic),
                });
                return;
            }
        };
        if events.send(event).is_err() {
            return;
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
