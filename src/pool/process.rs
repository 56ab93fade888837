//! # Process-Backed Pool
//!
//! Workers are child processes speaking the newline-framed JSON protocol
//! from [`crate::wire`] over stdio. By default the pool re-executes the
//! current binary, which recognizes the worker marker variable and enters
//! [`crate::worker::run_if_spawned`] instead of its normal main path; a
//! different program can be substituted through
//! [`PoolOptions::worker_program`](crate::config::PoolOptions).
//!
//! Each child gets four tasks on the parent side: a stdin writer, a stdout
//! frame reader, a stderr line reader, and a reaper that owns the `Child`
//! and reports its exit. Teardown sends a shutdown frame, waits a short
//! grace period, then kills. The first process pool also installs a signal
//! guard so SIGINT/SIGTERM destroy every registered pool (no orphaned
//! children) before the process exits.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::OnceLock;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::adapter::AdapterConfig;
use crate::config::PoolOptions;
use crate::constants::{self, SHUTDOWN_GRACE};
use crate::error::{OffloadError, Result};
use crate::pool::engine::{start_pool, PoolCommand, WorkEnvelope, WorkerDriver, WorkerEvent};
use crate::pool::{PoolHandle, WorkerId};
use crate::wire::{self, ParentFrame, WorkerFrame};

/// Pool of child-process workers.
pub struct ProcessPool;

impl ProcessPool {
    /// Start a process pool. Workers run `options.worker_program`, or the
    /// current executable when unset.
    pub fn start(adapter: AdapterConfig, options: PoolOptions) -> Result<PoolHandle> {
        options.validate()?;
        let program = match &options.worker_program {
            Some(program) => program.clone(),
            None => std::env::current_exe().map_err(|err| {
                OffloadError::spawn(format!("cannot resolve current executable: {err}"))
            })?,
        };
        let limit = options.process_concurrency();
        let worker_env = options.worker_env.clone();
        let handle = start_pool::<ProcessDriver, _>(options, limit, move |events| ProcessDriver {
            adapter,
            program,
            worker_env,
            events,
            reapers: HashMap::new(),
        });
        register_with_signal_guard(&handle);
        Ok(handle)
    }
}

/// Engine-side handle to one worker process. The kill path goes through
/// the driver's reaper table, not the handle.
pub(crate) struct ProcessWorker {
    writer_tx: mpsc::UnboundedSender<ParentFrame>,
}

struct ProcessDriver {
    adapter: AdapterConfig,
    program: PathBuf,
    worker_env: HashMap<String, String>,
    events: mpsc::UnboundedSender<WorkerEvent<ProcessWorker>>,
    /// Kill switches for every live child, indexed by worker id.
    reapers: HashMap<WorkerId, oneshot::Sender<()>>,
}

impl WorkerDriver for ProcessDriver {
    type Worker = ProcessWorker;

    fn kind(&self) -> &'static str {
        "process"
    }

    fn spawn_worker(&mut self, id: WorkerId) {
        let (kill_tx, kill_rx) = oneshot::channel();
        self.reapers.insert(id, kill_tx);

        let events = self.events.clone();
        let adapter = self.adapter.clone();
        let program = self.program.clone();
        let worker_env = self.worker_env.clone();
        tokio::spawn(async move {
            let launched = launch_worker(id, program, adapter, worker_env, kill_rx, events.clone());
            if let Err(error) = launched.await {
                let _ = events.send(WorkerEvent::SpawnFailed { id, error });
            }
        });
    }

    fn deliver(
        &mut self,
        id: WorkerId,
        worker: &mut ProcessWorker,
        envelope: WorkEnvelope,
    ) -> Result<()> {
        worker
            .writer_tx
            .send(ParentFrame::Work {
                seq: envelope.seq,
                correlation_id: envelope.correlation_id,
                payload: envelope.payload,
            })
            .map_err(|_| OffloadError::wire(format!("worker process {id} is gone")))
    }

    fn destroy_worker(&mut self, id: WorkerId, worker: ProcessWorker) {
        debug!(worker_id = id, "PROCESS: shutting worker down");
        let _ = worker.writer_tx.send(ParentFrame::Shutdown);
        if let Some(kill) = self.reapers.remove(&id) {
            let _ = kill.send(());
        }
    }

    fn forget_worker(&mut self, id: WorkerId) {
        if let Some(kill) = self.reapers.remove(&id) {
            let _ = kill.send(());
        }
    }
}

/// Spawn the child and wire up its writer, readers, and reaper. The
/// engine's `Ready` event fires once the child announces itself.
async fn launch_worker(
    id: WorkerId,
    program: PathBuf,
    adapter: AdapterConfig,
    worker_env: HashMap<String, String>,
    kill_rx: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<WorkerEvent<ProcessWorker>>,
) -> Result<()> {
    let mut child = Command::new(&program)
        .envs(&worker_env)
        .env(constants::env::WORKER_SLOT, id.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| {
            OffloadError::spawn(format!("failed to spawn {}: {err}", program.display()))
        })?;

    debug!(worker_id = id, pid = ?child.id(), program = %program.display(), "PROCESS: spawned");

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| OffloadError::spawn("worker stdin was not piped"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| OffloadError::spawn("worker stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| OffloadError::spawn("worker stderr was not piped"))?;

    let (writer_tx, writer_rx) = mpsc::unbounded_channel();
    tokio::spawn(write_frames(stdin, writer_rx));

    // The adapter ships before anything else; the child answers Ready once
    // its handler is loaded.
    writer_tx
        .send(ParentFrame::Spawn { adapter })
        .map_err(|_| OffloadError::wire("worker stdin writer ended early"))?;

    tokio::spawn(read_stdout(id, stdout, writer_tx, events.clone()));
    tokio::spawn(read_stderr(id, stderr, events.clone()));
    tokio::spawn(reap(id, child, kill_rx, events));
    Ok(())
}

async fn write_frames(
    stdin: tokio::process::ChildStdin,
    mut writer_rx: mpsc::UnboundedReceiver<ParentFrame>,
) {
    let mut stdin = stdin;
    while let Some(frame) = writer_rx.recv().await {
        let line = match wire::to_line(&frame) {
            Ok(line) => line,
            Err(err) => {
                error!(error = %err, "PROCESS: unencodable frame dropped");
                continue;
            }
        };
        if stdin.write_all(line.as_bytes()).await.is_err()
            || stdin.write_all(b"\n").await.is_err()
            || stdin.flush().await.is_err()
        {
            // Child is gone; the reaper reports the exit.
            break;
        }
    }
}

async fn read_stdout(
    id: WorkerId,
    stdout: ChildStdout,
    writer_tx: mpsc::UnboundedSender<ParentFrame>,
    events: mpsc::UnboundedSender<WorkerEvent<ProcessWorker>>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut announced = false;
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let event = match wire::from_line::<WorkerFrame>(&line) {
            Ok(WorkerFrame::Ready) => {
                if announced {
                    warn!(worker_id = id, "PROCESS: duplicate ready frame ignored");
                    continue;
                }
                announced = true;
                WorkerEvent::Ready {
                    id,
                    worker: ProcessWorker {
                        writer_tx: writer_tx.clone(),
                    },
                }
            }
            Ok(WorkerFrame::Result { seq, payload }) => WorkerEvent::Completed { id, seq, payload },
            Ok(WorkerFrame::Error {
                seq,
                message,
                detail,
            }) => WorkerEvent::HandlerFailed {
                id,
                seq,
                message,
                detail,
            },
            // Anything else on stdout is handler output; pass it through.
            Err(_) => WorkerEvent::Stdout { id, line },
        };
        if events.send(event).is_err() {
            return;
        }
    }
}

async fn read_stderr(
    id: WorkerId,
    stderr: ChildStderr,
    events: mpsc::UnboundedSender<WorkerEvent<ProcessWorker>>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if events.send(WorkerEvent::Stderr { id, line }).is_err() {
            return;
        }
    }
}

/// Owns the `Child`. Reports the exit status, and on a kill signal grants
/// the shutdown grace period before killing outright.
async fn reap(
    id: WorkerId,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<WorkerEvent<ProcessWorker>>,
) {
    let code = tokio::select! {
        status = child.wait() => status.ok().and_then(|status| status.code()),
        killed = kill_rx => {
            if killed.is_ok() {
                match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                    Ok(status) => status.ok().and_then(|status| status.code()),
                    Err(_) => {
                        warn!(worker_id = id, "PROCESS: grace period expired, killing");
                        let _ = child.start_kill();
                        child.wait().await.ok().and_then(|status| status.code())
                    }
                }
            } else {
                // Kill switch dropped unsent; wait for a natural exit.
                child.wait().await.ok().and_then(|status| status.code())
            }
        }
    };
    debug!(worker_id = id, ?code, "PROCESS: worker exited");
    let _ = events.send(WorkerEvent::Exited { id, code });
}

/// Pools registered for signal-driven teardown. Weak senders: the guard
/// never keeps an engine alive.
static SIGNAL_GUARD: OnceLock<Mutex<Vec<mpsc::WeakUnboundedSender<PoolCommand>>>> = OnceLock::new();

fn register_with_signal_guard(handle: &PoolHandle) {
    let pools = SIGNAL_GUARD.get_or_init(|| {
        tokio::spawn(signal_listener());
        Mutex::new(Vec::new())
    });
    let mut pools = pools.lock();
    pools.retain(|weak| weak.upgrade().is_some());
    pools.push(handle.downgrade_commands());
}

/// Destroy every registered pool on SIGINT/SIGTERM, then exit with the
/// conventional 128+signum code.
async fn signal_listener() {
    let signum = wait_for_termination().await;
    info!(signum, "PROCESS: termination signal, destroying pools");

    let pools: Vec<_> = match SIGNAL_GUARD.get() {
        Some(pools) => pools.lock().drain(..).filter_map(|weak| weak.upgrade()).collect(),
        None => Vec::new(),
    };
    let teardowns: Vec<_> = pools
        .into_iter()
        .filter_map(|commands| {
            let (done, finished) = oneshot::channel();
            commands.send(PoolCommand::Destroy { done }).ok()?;
            Some(tokio::time::timeout(SHUTDOWN_GRACE * 4, finished))
        })
        .collect();
    futures::future::join_all(teardowns).await;
    std::process::exit(128 + signum);
}

#[cfg(unix)]
async fn wait_for_termination() -> i32 {
    use tokio::signal::unix::{signal, SignalKind};
    let interrupt = signal(SignalKind::interrupt());
    let terminate = signal(SignalKind::terminate());
    match (interrupt, terminate) {
        (Ok(mut interrupt), Ok(mut terminate)) => {
            tokio::select! {
                _ = interrupt.recv() => 2,
                _ = terminate.recv() => 15,
            }
        }
        _ => {
            error!("PROCESS: signal handlers unavailable");
            std::future::pending().await
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() -> i32 {
    if tokio::signal::ctrl_c().await.is_err() {
        error!("PROCESS: signal handlers unavailable");
        std::future::pending::<()>().await;
    }
    2
}
