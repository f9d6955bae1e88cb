//! `serve` — the monitoring API on its own, pointed at an existing
//! database (e.g. next to a bot running in another process).

use anyhow::{Context, Result};
use std::net::SocketAddr;

use breakout_bot::config::BotConfig;
use breakout_bot::server::{self, ApiState};
use breakout_bot::store::Store;

pub fn run(config_path: String, addr: String) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(async {
        let config = BotConfig::from_file(&config_path)
            .with_context(|| format!("Failed to load config from {config_path}"))?;
        let store = Store::open(&config.persistence.db_url)?;
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid listen address: {addr}"))?;
        server::serve(ApiState::new(store), addr).await
    })
}
