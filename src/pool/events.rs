//! # Pool Lifecycle Events
//!
//! Broadcast channel carrying observable pool events: `online` when the
//! first worker becomes ready, `error` for every limiter feed, `fatal` when
//! the error density trips (or a child escalates), and raw `stdout`/
//! `stderr` passthrough from process workers. Publishing never fails; a
//! pool with no subscribers simply drops events.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::pool::WorkerId;

/// Kinds of observable pool events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEventKind {
    /// The first worker reported ready. Emitted once per pool.
    Online,
    /// An error was fed to the density limiter.
    Error { message: String },
    /// The pool gave up: error density tripped or a child reported fatal.
    Fatal { reason: String },
    /// A non-protocol stdout line from a process worker.
    Stdout { worker_id: WorkerId, line: String },
    /// A stderr line from a process worker.
    Stderr { worker_id: WorkerId, line: String },
}

impl PoolEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            PoolEventKind::Online => "online",
            PoolEventKind::Error { .. } => "error",
            PoolEventKind::Fatal { .. } => "fatal",
            PoolEventKind::Stdout { .. } => "stdout",
            PoolEventKind::Stderr { .. } => "stderr",
        }
    }
}

/// A published event with its emission timestamp.
#[derive(Debug, Clone)]
pub struct PoolEvent {
    pub kind: PoolEventKind,
    pub published_at: DateTime<Utc>,
}

/// Broadcast hub owned by a pool's engine task.
#[derive(Debug, Clone)]
pub struct EventHub {
    sender: broadcast::Sender<PoolEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, kind: PoolEventKind) {
        let event = PoolEvent {
            kind,
            published_at: Utc::now(),
        };
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
