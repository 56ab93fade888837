//! # Worker Entry Point
//!
//! The child side of a process pool. A binary that embeds this crate calls
//! [`run_if_spawned`] early in `main`: when the process was launched by a
//! pool (recognized by the worker marker variable), it installs the
//! default handlers, speaks the stdio protocol until shutdown, and the
//! caller returns without running its normal path.
//!
//! Register application handlers on the global registry **before** calling
//! [`run_if_spawned`], so re-executed children can resolve the same
//! adapter paths as the parent.
//!
//! A handler panic is not caught here: the process dies with the panic
//! exit code and the parent pool counts it as a crash and respawns. Exit
//! isolation is the containment.
//!
//! ## Usage
//!
//! ```ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     offload_core::logging::init_logging();
//!     my_handlers::register_all();
//!     if offload_core::worker::run_if_spawned().await? {
//!         return Ok(());
//!     }
//!     // normal program...
//!     Ok(())
//! }
//! ```

pub mod builtins;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use crate::adapter::HandlerRegistry;
use crate::cluster;
use crate::constants;
use crate::error::{OffloadError, Result};
use crate::wire::{self, ParentFrame, WorkerFrame};

/// Whether this process was launched as a pool worker.
pub fn is_worker_process() -> bool {
    std::env::var_os(constants::env::WORKER_SLOT).is_some()
}

/// Install the builtin handlers and the cluster bridge.
pub fn install_default_handlers(registry: &HandlerRegistry) {
    builtins::install(registry);
    cluster::register_bridge(registry);
}

/// Serve the worker protocol if this process was spawned by a pool.
///
/// Returns `Ok(true)` after a clean worker run (the caller should exit),
/// `Ok(false)` when this is not a worker process. A protocol or handler
/// load error bubbles up so the process exits nonzero and the parent
/// counts the death.
pub async fn run_if_spawned() -> Result<bool> {
    let Some(slot) = std::env::var_os(constants::env::WORKER_SLOT) else {
        return Ok(false);
    };
    let slot = slot.to_string_lossy().into_owned();
    install_default_handlers(&HandlerRegistry::global());
    info!(slot, "WORKER: serving");
    serve(
        &HandlerRegistry::global(),
        tokio::io::stdin(),
        tokio::io::stdout(),
    )
    .await?;
    info!(slot, "WORKER: finished");
    Ok(true)
}

/// The worker protocol loop over arbitrary streams (stdio in production,
/// in-memory pipes in tests).
///
/// The first frame must be `spawn`; the handler is loaded exactly once,
/// readiness is announced, and every `work` frame is answered with exactly
/// one `result` or `error` frame. A line that is not a valid parent frame
/// is a hard error: the pool side never sends garbage, so the stream is
/// corrupt and dying loudly beats guessing.
async fn serve<R, W>(registry: &HandlerRegistry, reader: R, mut writer: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    let first = lines
        .next_line()
        .await?
        .ok_or_else(|| OffloadError::wire("stream closed before the spawn frame"))?;
    let ParentFrame::Spawn { adapter } = wire::from_line(&first)? else {
        return Err(OffloadError::wire("expected the spawn frame first"));
    };

    debug!(adapter = %adapter.module_path, "WORKER: loading handler");
    let handler = registry.load(&adapter).await?;
    write_frame(&mut writer, &WorkerFrame::Ready).await?;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match wire::from_line::<ParentFrame>(&line)? {
            ParentFrame::Spawn { .. } => {
                return Err(OffloadError::wire("duplicate spawn frame"));
            }
            ParentFrame::Shutdown => {
                debug!("WORKER: shutdown frame received");
                break;
            }
            ParentFrame::Work { seq, payload, .. } => {
                let frame = match handler.handle(payload).await {
                    Ok(value) => WorkerFrame::Result { seq, payload: value },
                    Err(failure) => WorkerFrame::Error {
                        seq,
                        message: failure.message,
                        detail: failure.detail,
                    },
                };
                write_frame(&mut writer, &frame).await?;
            }
        }
    }
    Ok(())
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &WorkerFrame) -> Result<()> {
    let line = wire::to_line(frame)?;
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterConfig;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::io::duplex;
    use uuid::Uuid;

    fn registry() -> Arc<HandlerRegistry> {
        let registry = Arc::new(HandlerRegistry::new());
        builtins::install(&registry);
        registry
    }

    async fn send(writer: &mut (impl AsyncWrite + Unpin), frame: &ParentFrame) {
        let line = wire::to_line(frame).unwrap();
        writer.write_all(line.as_bytes()).await.unwrap();
        writer.write_all(b"\n").await.unwrap();
        writer.flush().await.unwrap();
    }

    async fn recv(lines: &mut tokio::io::Lines<BufReader<impl AsyncRead + Unpin>>) -> WorkerFrame {
        let line = lines.next_line().await.unwrap().expect("stream ended");
        wire::from_line(&line).unwrap()
    }

    fn work(seq: u64, payload: serde_json::Value) -> ParentFrame {
        ParentFrame::Work {
            seq,
            correlation_id: Uuid::new_v4(),
            payload,
        }
    }

    #[tokio::test]
    async fn serves_spawn_work_shutdown() {
        let (mut near, far) = duplex(64 * 1024);
        let (far_read, far_write) = tokio::io::split(far);
        let registry = registry();
        let server =
            tokio::spawn(async move { serve(&registry, far_read, far_write).await });

        send(
            &mut near,
            &ParentFrame::Spawn {
                adapter: AdapterConfig::new("builtin.echo", json!({})),
            },
        )
        .await;

        let (near_read, mut near_write) = tokio::io::split(near);
        let mut replies = BufReader::new(near_read).lines();
        assert!(matches!(recv(&mut replies).await, WorkerFrame::Ready));

        send(&mut near_write, &work(1, json!({"n": 7}))).await;
        match recv(&mut replies).await {
            WorkerFrame::Result { seq, payload } => {
                assert_eq!(seq, 1);
                assert_eq!(payload, json!({"n": 7}));
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        send(&mut near_write, &ParentFrame::Shutdown).await;
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn handler_failures_become_error_frames() {
        let (mut near, far) = duplex(64 * 1024);
        let (far_read, far_write) = tokio::io::split(far);
        let registry = registry();
        let server =
            tokio::spawn(async move { serve(&registry, far_read, far_write).await });

        send(
            &mut near,
            &ParentFrame::Spawn {
                adapter: AdapterConfig::new("builtin.fail", json!({})),
            },
        )
        .await;
        let (near_read, mut near_write) = tokio::io::split(near);
        let mut replies = BufReader::new(near_read).lines();
        assert!(matches!(recv(&mut replies).await, WorkerFrame::Ready));

        send(&mut near_write, &work(9, json!({"message": "nope"}))).await;
        match recv(&mut replies).await {
            WorkerFrame::Error { seq, message, .. } => {
                assert_eq!(seq, 9);
                assert_eq!(message, "nope");
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        near_write.shutdown().await.unwrap();
        // EOF without a shutdown frame is a clean end too.
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unknown_adapter_fails_the_serve_loop() {
        let (mut near, far) = duplex(64 * 1024);
        let (far_read, far_write) = tokio::io::split(far);
        let registry = registry();
        let server =
            tokio::spawn(async move { serve(&registry, far_read, far_write).await });

        send(
            &mut near,
            &ParentFrame::Spawn {
                adapter: AdapterConfig::new("no.such.handler", json!({})),
            },
        )
        .await;
        assert!(server.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn garbage_input_is_a_hard_error() {
        let (mut near, far) = duplex(64 * 1024);
        let (far_read, far_write) = tokio::io::split(far);
        let registry = registry();
        let server =
            tokio::spawn(async move { serve(&registry, far_read, far_write).await });

        send(
            &mut near,
            &ParentFrame::Spawn {
                adapter: AdapterConfig::new("builtin.echo", json!({})),
            },
        )
        .await;
        let (near_read, mut near_write) = tokio::io::split(near);
        let mut replies = BufReader::new(near_read).lines();
        assert!(matches!(recv(&mut replies).await, WorkerFrame::Ready));

        near_write.write_all(b"not json at all\n").await.unwrap();
        near_write.flush().await.unwrap();
        assert!(server.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn work_before_spawn_is_rejected() {
        let (mut near, far) = duplex(64 * 1024);
        let (far_read, far_write) = tokio::io::split(far);
        let registry = registry();
        let server =
            tokio::spawn(async move { serve(&registry, far_read, far_write).await });

        send(&mut near, &work(1, json!(null))).await;
        assert!(server.await.unwrap().is_err());
    }

    #[test]
    fn default_handlers_include_builtins_and_bridge() {
        let registry = HandlerRegistry::new();
        install_default_handlers(&registry);
        assert!(registry.contains("builtin.echo"));
        assert!(registry.contains(crate::constants::BRIDGE_MODULE_PATH));
    }
}
