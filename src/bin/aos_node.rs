//! aos-node: run one kernel node until interrupted
//!
//! Usage: `aos-node [config.toml]`. `AOS_*` variables override the file.

use std::path::PathBuf;

use anyhow::Context;
use aos_kernel::{NodeConfig, NodeRuntime};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = NodeConfig::load(config_path.as_deref()).context("loading configuration")?;

    let runtime = NodeRuntime::open(config).context("opening node")?;
    let addr = runtime.boot().await.context("booting node")?;
    println!("Node {} listening on {}", runtime.node_id(), addr);
    println!("Public key: {}", runtime.identity().public_key_hex());

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    log::info!("Shutdown requested");
    runtime.shutdown().await;
    Ok(())
}
