//! Stock worker executable.
//!
//! Spawned by process pools when no custom `worker_program` is configured
//! (pools re-execute the current binary by default; this one exists for
//! setups that want a dedicated worker image carrying only the builtin
//! handlers and the cluster bridge).
//!
//! Run directly, it performs a small self-check: loads the configuration,
//! starts a cluster over `builtin.echo`, round-trips one payload, and
//! exits. The same binary then serves as its own worker program.

use anyhow::Result;
use serde_json::json;
use tracing::info;

use offload_core::adapter::{AdapterConfig, HandlerRegistry};
use offload_core::cluster::{Cluster, ClusterOptions};
use offload_core::config::ConfigLoader;
use offload_core::logging::init_logging;
use offload_core::worker;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    if worker::run_if_spawned().await? {
        return Ok(());
    }

    worker::install_default_handlers(&HandlerRegistry::global());
    let config = ConfigLoader::load()?;
    info!(?config.pool, "starting echo self-check");

    let cluster = Cluster::start(
        AdapterConfig::new("builtin.echo", json!({})),
        ClusterOptions {
            pool: config.pool,
            ..ClusterOptions::default()
        },
    )?;
    cluster.wait_online().await?;

    let sent = json!({"ping": chrono::Utc::now().to_rfc3339()});
    let received = cluster.assign(sent.clone()).await?;
    anyhow::ensure!(received == sent, "echo mismatch: {received} != {sent}");
    info!(%received, "echo verified");

    cluster.destroy().await;
    Ok(())
}
