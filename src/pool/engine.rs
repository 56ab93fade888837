//! # Worker Pool Engine
//!
//! The abstract dispatch engine shared by thread and process pools. One
//! actor task per pool owns every piece of bookkeeping: the FIFO pending
//! queue, the idle queue, the active map, and the per-request deadlines.
//! All mutations happen inside the actor, so none of the collections need
//! a lock; concurrency exists only in the workers themselves.
//!
//! ## Architecture
//!
//! - **Commands** (`assign`, `destroy`, `status`) arrive on an mpsc channel
//!   from [`PoolHandle`](crate::pool::PoolHandle) clones.
//! - **Worker events** (ready, completed, failed, exited, output) arrive on
//!   a second channel fed by the driver's spawned tasks and threads.
//! - **Deadlines** are tracked as instants on the active records; the loop
//!   sleeps until the earliest one, so no per-request timer tasks exist.
//!
//! The engine delegates worker mechanics to a [`WorkerDriver`]: spawning,
//! delivering one unit of work, and tearing a worker down. Everything else
//! (admission, matching, timeout, crash recovery, settlement) is engine
//! policy and identical for every driver.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::PoolOptions;
use crate::constants::FATAL_EXIT_CODE;
use crate::error::{AssignError, OffloadError};
use crate::pool::events::{EventHub, PoolEventKind};
use crate::pool::{PoolHandle, WorkerId};
use crate::resilience::{ErrorDensityLimiter, FeedOutcome};
use crate::wire::rebuffer_value;

/// Idle poll horizon when no deadline is armed.
const FAR_FUTURE: Duration = Duration::from_secs(86_400);

/// One unit of work on its way to a worker.
#[derive(Debug, Clone)]
pub struct WorkEnvelope {
    pub seq: u64,
    pub correlation_id: Uuid,
    pub payload: Value,
}

/// Events a driver reports back to the engine.
#[derive(Debug)]
pub enum WorkerEvent<W> {
    /// The worker finished loading its handler and accepts work.
    Ready { id: WorkerId, worker: W },
    /// Worker creation failed outright.
    SpawnFailed { id: WorkerId, error: OffloadError },
    /// The worker produced a result for `seq`.
    Completed { id: WorkerId, seq: u64, payload: Value },
    /// The handler reported a failure for `seq`; the worker survived.
    HandlerFailed {
        id: WorkerId,
        seq: u64,
        message: String,
        detail: Option<Value>,
    },
    /// The worker died with diagnostics (thread panic).
    Crashed { id: WorkerId, message: String },
    /// The worker process exited; `code` is `None` for signal deaths.
    Exited { id: WorkerId, code: Option<i32> },
    /// Raw output line from a process worker.
    Stdout { id: WorkerId, line: String },
    /// Raw stderr line from a process worker.
    Stderr { id: WorkerId, line: String },
}

/// Worker mechanics supplied by each pool kind.
///
/// Methods must not block: heavy work (process spawn, handler load) runs in
/// tasks or threads that report back on the engine's event channel.
pub trait WorkerDriver: Send + 'static {
    type Worker: Send + 'static;

    /// Pool kind for logs ("thread" / "process").
    fn kind(&self) -> &'static str;

    /// Begin creating worker `id`. Outcome arrives later as `Ready` or
    /// `SpawnFailed`.
    fn spawn_worker(&mut self, id: WorkerId);

    /// Hand one unit of work to an idle worker.
    fn deliver(
        &mut self,
        id: WorkerId,
        worker: &mut Self::Worker,
        envelope: WorkEnvelope,
    ) -> crate::error::Result<()>;

    /// Tear a worker down. Any later events for `id` are ignored by the
    /// engine.
    fn destroy_worker(&mut self, id: WorkerId, worker: Self::Worker);

    /// Drop driver-side tracking for a worker that exited on its own or
    /// never finished spawning. Default: nothing.
    fn forget_worker(&mut self, _id: WorkerId) {}
}

/// Commands accepted by the engine actor.
pub(crate) enum PoolCommand {
    Assign {
        payload: Value,
        settle: Settlement,
    },
    Destroy {
        done: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<PoolStatus>,
    },
    WaitOnline {
        reply: oneshot::Sender<()>,
    },
}

pub(crate) type Settlement = oneshot::Sender<std::result::Result<Value, AssignError>>;

/// Counts snapshot used by tests and observability.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PoolStatus {
    pub limit: usize,
    pub alive: usize,
    pub idle: usize,
    pub active: usize,
    pub pending: usize,
    pub destroyed: bool,
    pub tripped: bool,
}

struct PendingAssignment {
    payload: Value,
    correlation_id: Uuid,
    settle: Settlement,
}

struct ActiveRecord {
    seq: u64,
    correlation_id: Uuid,
    deadline: Instant,
    settle: Settlement,
}

enum WorkerSlot<W> {
    Spawning,
    Idle(W),
    Active(W, ActiveRecord),
}

/// Start an engine actor and return its caller-facing handle.
pub(crate) fn start_pool<D, F>(options: PoolOptions, limit: usize, make_driver: F) -> PoolHandle
where
    D: WorkerDriver,
    F: FnOnce(mpsc::UnboundedSender<WorkerEvent<D::Worker>>) -> D,
{
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (worker_events_tx, worker_events_rx) = mpsc::unbounded_channel();
    let driver = make_driver(worker_events_tx);
    let events = EventHub::new();
    let limiter = Arc::new(ErrorDensityLimiter::new(options.limiter.clone()));

    let core = PoolCore {
        options,
        limit,
        driver,
        limiter,
        events: events.clone(),
        commands_rx,
        worker_events_rx,
        pending: VecDeque::new(),
        idle: VecDeque::new(),
        workers: HashMap::new(),
        online_waiters: Vec::new(),
        next_worker_id: 1,
        next_seq: 1,
        online_emitted: false,
        destroyed: false,
    };
    tokio::spawn(core.run());

    PoolHandle::new(commands_tx, events)
}

struct PoolCore<D: WorkerDriver> {
    options: PoolOptions,
    limit: usize,
    driver: D,
    limiter: Arc<ErrorDensityLimiter>,
    events: EventHub,
    commands_rx: mpsc::UnboundedReceiver<PoolCommand>,
    worker_events_rx: mpsc::UnboundedReceiver<WorkerEvent<D::Worker>>,
    pending: VecDeque<PendingAssignment>,
    idle: VecDeque<WorkerId>,
    workers: HashMap<WorkerId, WorkerSlot<D::Worker>>,
    online_waiters: Vec<oneshot::Sender<()>>,
    next_worker_id: WorkerId,
    next_seq: u64,
    online_emitted: bool,
    destroyed: bool,
}

impl<D: WorkerDriver> PoolCore<D> {
    async fn run(mut self) {
        info!(
            kind = self.driver.kind(),
            limit = self.limit,
            timeout_ms = self.options.request_timeout_ms,
            max_pending = ?self.options.max_pending,
            "🏊 POOL: started"
        );
        self.spawn_one();

        loop {
            let next_deadline = self.earliest_deadline();
            tokio::select! {
                command = self.commands_rx.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        // Every handle dropped: tear down and stop.
                        self.teardown(None);
                        break;
                    }
                },
                Some(event) = self.worker_events_rx.recv() => self.on_worker_event(event),
                _ = tokio::time::sleep_until(
                    next_deadline.unwrap_or_else(|| Instant::now() + FAR_FUTURE)
                ), if next_deadline.is_some() => self.on_deadline(),
            }
        }
    }

    fn on_command(&mut self, command: PoolCommand) {
        match command {
            PoolCommand::Assign { payload, settle } => self.on_assign(payload, settle),
            PoolCommand::Destroy { done } => self.teardown(Some(done)),
            PoolCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            PoolCommand::WaitOnline { reply } => {
                if self.online_emitted {
                    let _ = reply.send(());
                } else if self.destroyed {
                    drop(reply);
                } else {
                    self.online_waiters.push(reply);
                }
            }
        }
    }

    fn on_assign(&mut self, payload: Value, settle: Settlement) {
        if self.destroyed {
            let _ = settle.send(Err(AssignError::PoolClosed));
            return;
        }

        // The backlog cap counts only assignments nothing can absorb:
        // every non-busy slot (idle, still spawning, or not yet spawned)
        // will take one pending assignment.
        if let Some(max_pending) = self.options.max_pending {
            let busy = self
                .workers
                .values()
                .filter(|slot| matches!(slot, WorkerSlot::Active(..)))
                .count();
            let capacity = self.limit.saturating_sub(busy);
            if self.pending.len() >= max_pending.saturating_add(capacity) {
                trace!(pending = self.pending.len(), "POOL: backlog full, rejecting");
                let _ = settle.send(Err(AssignError::MaxPending));
                return;
            }
        }

        self.pending.push_back(PendingAssignment {
            payload,
            correlation_id: Uuid::new_v4(),
            settle,
        });
        self.activate();
    }

    /// Drain the pending queue into idle workers; spawn elastically while
    /// below the concurrency limit.
    fn activate(&mut self) {
        while !self.pending.is_empty() && !self.destroyed {
            let Some(worker_id) = self.idle.pop_front() else {
                if self.workers.len() < self.limit {
                    self.spawn_one();
                }
                return;
            };
            let Some(assignment) = self.pending.pop_front() else {
                self.idle.push_front(worker_id);
                return;
            };
            self.dispatch(worker_id, assignment);
        }
    }

    fn dispatch(&mut self, worker_id: WorkerId, assignment: PendingAssignment) {
        let Some(slot) = self.workers.remove(&worker_id) else {
            error!(worker_id, "POOL: idle queue referenced unknown worker");
            self.pending.push_front(assignment);
            return;
        };
        let WorkerSlot::Idle(mut worker) = slot else {
            error!(worker_id, "POOL: idle queue referenced non-idle worker");
            self.pending.push_front(assignment);
            return;
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        let envelope = WorkEnvelope {
            seq,
            correlation_id: assignment.correlation_id,
            payload: assignment.payload,
        };

        match self.driver.deliver(worker_id, &mut worker, envelope) {
            Ok(()) => {
                trace!(worker_id, seq, correlation_id = %assignment.correlation_id, "POOL: dispatched");
                let record = ActiveRecord {
                    seq,
                    correlation_id: assignment.correlation_id,
                    deadline: Instant::now() + self.options.request_timeout(),
                    settle: assignment.settle,
                };
                self.workers
                    .insert(worker_id, WorkerSlot::Active(worker, record));
            }
            Err(err) => {
                // The worker died under us before the unit started.
                warn!(worker_id, error = %err, "POOL: delivery failed, replacing worker");
                let _ = assignment.settle.send(Err(AssignError::WorkerExit));
                self.driver.destroy_worker(worker_id, worker);
                if self.workers.len() < self.limit {
                    self.spawn_one();
                }
            }
        }
    }

    fn spawn_one(&mut self) {
        if self.destroyed {
            return;
        }
        let id = self.next_worker_id;
        self.next_worker_id += 1;
        self.workers.insert(id, WorkerSlot::Spawning);
        debug!(worker_id = id, kind = self.driver.kind(), "POOL: spawning worker");
        self.driver.spawn_worker(id);
    }

    fn on_worker_event(&mut self, event: WorkerEvent<D::Worker>) {
        match event {
            WorkerEvent::Ready { id, worker } => self.on_ready(id, worker),
            WorkerEvent::SpawnFailed { id, error } => self.on_spawn_failed(id, error),
            WorkerEvent::Completed { id, seq, payload } => {
                self.on_response(id, seq, Ok(rebuffer_value(payload)))
            }
            WorkerEvent::HandlerFailed {
                id,
                seq,
                message,
                detail,
            } => self.on_response(id, seq, Err(AssignError::Handler { message, detail })),
            WorkerEvent::Crashed { id, message } => self.on_crashed(id, message),
            WorkerEvent::Exited { id, code } => self.on_exited(id, code),
            WorkerEvent::Stdout { id, line } => {
                self.events.publish(PoolEventKind::Stdout {
                    worker_id: id,
                    line,
                });
            }
            WorkerEvent::Stderr { id, line } => {
                self.events.publish(PoolEventKind::Stderr {
                    worker_id: id,
                    line,
                });
            }
        }
    }

    fn on_ready(&mut self, id: WorkerId, worker: D::Worker) {
        if !matches!(self.workers.get(&id), Some(WorkerSlot::Spawning)) {
            // Arrived after a destroy or for a slot we no longer track.
            debug!(worker_id = id, "POOL: discarding late worker");
            self.driver.destroy_worker(id, worker);
            return;
        }

        self.workers.insert(id, WorkerSlot::Idle(worker));
        self.idle.push_back(id);
        debug!(worker_id = id, "✅ POOL: worker ready");

        if !self.online_emitted {
            self.online_emitted = true;
            info!(kind = self.driver.kind(), "✅ POOL: online");
            self.events.publish(PoolEventKind::Online);
            for waiter in self.online_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
        self.activate();
    }

    fn on_spawn_failed(&mut self, id: WorkerId, error: OffloadError) {
        if self.workers.remove(&id).is_none() {
            return;
        }
        self.driver.forget_worker(id);
        warn!(worker_id = id, error = %error, "POOL: worker spawn failed");
        self.register_failure(format!("worker {id} spawn failed: {error}"));
        // The next activate retries while headroom and demand remain.
        self.activate();
    }

    /// Success and handler-failure responses share the idle-return path.
    fn on_response(
        &mut self,
        id: WorkerId,
        seq: u64,
        outcome: std::result::Result<Value, AssignError>,
    ) {
        let Some(slot) = self.workers.remove(&id) else {
            trace!(worker_id = id, seq, "POOL: response from unknown worker ignored");
            return;
        };
        match slot {
            WorkerSlot::Active(worker, record) if record.seq == seq => {
                trace!(worker_id = id, seq, correlation_id = %record.correlation_id, "POOL: settled");
                let _ = record.settle.send(outcome);
                self.workers.insert(id, WorkerSlot::Idle(worker));
                self.idle.push_back(id);
                self.activate();
            }
            other => {
                // Stale or duplicate response; the record (if any) belongs
                // to a different assignment.
                trace!(worker_id = id, seq, "POOL: spurious response ignored");
                self.workers.insert(id, other);
            }
        }
    }

    fn on_crashed(&mut self, id: WorkerId, message: String) {
        let Some(slot) = self.workers.remove(&id) else {
            trace!(worker_id = id, "POOL: crash report from unknown worker ignored");
            return;
        };
        self.idle.retain(|&idle_id| idle_id != id);
        warn!(worker_id = id, message = %message, "💥 POOL: worker crashed");

        if let WorkerSlot::Active(_worker, record) = slot {
            let _ = record.settle.send(Err(AssignError::handler(message.clone())));
        }

        self.register_failure(format!("worker {id} crashed: {message}"));
        if !self.destroyed && self.workers.len() < self.limit {
            self.spawn_one();
        }
        self.activate();
    }

    fn on_exited(&mut self, id: WorkerId, code: Option<i32>) {
        let Some(slot) = self.workers.remove(&id) else {
            trace!(worker_id = id, ?code, "POOL: exit of untracked worker ignored");
            return;
        };
        self.driver.forget_worker(id);
        self.idle.retain(|&idle_id| idle_id != id);
        let record = match slot {
            WorkerSlot::Active(_worker, record) => Some(record),
            _ => None,
        };

        match code {
            Some(FATAL_EXIT_CODE) => {
                if let Some(record) = record {
                    let _ = record.settle.send(Err(AssignError::WorkerExit));
                }
                warn!(worker_id = id, code = FATAL_EXIT_CODE, "POOL: worker reported fatal density");
                self.go_fatal(format!("worker {id} exited with the reserved fatal code"));
            }
            Some(0) => {
                // Deliberate exit: no limiter feed, no eager replacement;
                // elastic spawn refills on demand.
                debug!(worker_id = id, "POOL: worker exited cleanly");
                if let Some(record) = record {
                    let _ = record.settle.send(Err(AssignError::WorkerExit));
                }
                self.activate();
            }
            _ => {
                warn!(worker_id = id, ?code, "💥 POOL: worker exited unexpectedly");
                if let Some(record) = record {
                    let _ = record.settle.send(Err(AssignError::WorkerExit));
                }
                self.register_failure(format!("worker {id} exited with {code:?}"));
                if !self.destroyed && self.workers.len() < self.limit {
                    self.spawn_one();
                }
                self.activate();
            }
        }
    }

    fn on_deadline(&mut self) {
        let now = Instant::now();
        let expired: Vec<WorkerId> = self
            .workers
            .iter()
            .filter_map(|(id, slot)| match slot {
                WorkerSlot::Active(_, record) if record.deadline <= now => Some(*id),
                _ => None,
            })
            .collect();

        for id in expired {
            let Some(WorkerSlot::Active(worker, record)) = self.workers.remove(&id) else {
                continue;
            };
            warn!(
                worker_id = id,
                seq = record.seq,
                correlation_id = %record.correlation_id,
                timeout_ms = self.options.request_timeout_ms,
                "⏱️ POOL: request timed out, replacing worker"
            );
            let _ = record.settle.send(Err(AssignError::Timeout {
                timeout_ms: self.options.request_timeout_ms,
            }));
            // A timed-out worker is never reused: it may still be chewing
            // the stale request.
            self.driver.destroy_worker(id, worker);
            if !self.destroyed && self.workers.len() < self.limit {
                self.spawn_one();
            }
        }
        self.activate();
    }

    /// Emit an `error` event and feed the limiter; a trip escalates to
    /// fatal teardown.
    fn register_failure(&mut self, message: String) {
        self.events.publish(PoolEventKind::Error {
            message: message.clone(),
        });
        if matches!(self.limiter.feed(), FeedOutcome::Tripped) {
            self.go_fatal(format!("error density exceeded after: {message}"));
        }
    }

    fn go_fatal(&mut self, reason: String) {
        if self.destroyed {
            return;
        }
        error!(kind = self.driver.kind(), reason = %reason, "🔴 POOL: fatal, shutting down");
        self.events.publish(PoolEventKind::Fatal {
            reason: reason.clone(),
        });
        self.destroyed = true;
        self.destroy_all();
    }

    fn teardown(&mut self, done: Option<oneshot::Sender<()>>) {
        if !self.destroyed {
            self.destroyed = true;
            self.destroy_all();
            info!(kind = self.driver.kind(), "🏊 POOL: destroyed");
        }
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    fn destroy_all(&mut self) {
        let workers = std::mem::take(&mut self.workers);
        for (id, slot) in workers {
            match slot {
                // A spawning worker has no handle yet; the driver aborts
                // it, and a late Ready finds no slot and is destroyed.
                WorkerSlot::Spawning => self.driver.forget_worker(id),
                WorkerSlot::Idle(worker) => self.driver.destroy_worker(id, worker),
                WorkerSlot::Active(worker, record) => {
                    let _ = record.settle.send(Err(AssignError::PoolClosed));
                    self.driver.destroy_worker(id, worker);
                }
            }
        }
        self.idle.clear();
        for assignment in self.pending.drain(..) {
            let _ = assignment.settle.send(Err(AssignError::PoolClosed));
        }
        self.online_waiters.clear();
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        self.workers
            .values()
            .filter_map(|slot| match slot {
                WorkerSlot::Active(_, record) => Some(record.deadline),
                _ => None,
            })
            .min()
    }

    fn status(&self) -> PoolStatus {
        let active = self
            .workers
            .values()
            .filter(|slot| matches!(slot, WorkerSlot::Active(..)))
            .count();
        PoolStatus {
            limit: self.limit,
            alive: self.workers.len(),
            idle: self.idle.len(),
            active,
            pending: self.pending.len(),
            destroyed: self.destroyed,
            tripped: self.limiter.is_tripped(),
        }
    }
}
