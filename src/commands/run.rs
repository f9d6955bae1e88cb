//! `run` — the trading bot itself, with the monitoring API alongside.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use tracing::{error, info};

use breakout_bot::config::BotConfig;
use breakout_bot::server::{self, ApiState};
use breakout_bot::TradingBot;

pub fn run(config_path: String, api_addr: Option<String>) -> Result<()> {
    // Broker credentials may live in a .env next to the config
    dotenv::dotenv().ok();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run_async(config_path, api_addr))
}

async fn run_async(config_path: String, api_addr: Option<String>) -> Result<()> {
    let config = BotConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {config_path}"))?;

    info!(
        mode = ?config.mode,
        broker = ?config.broker,
        watchlist = ?config.watchlist,
        crypto_watchlist = ?config.crypto_watchlist,
        "configuration_loaded"
    );

    let mut bot = TradingBot::new(config)?;

    // The monitoring surface is an independent read-only task over the
    // same store; it lives and dies with the bot process.
    if let Some(addr) = api_addr {
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid API listen address: {addr}"))?;
        let state = ApiState::new(bot.store());
        tokio::spawn(async move {
            if let Err(err) = server::serve(state, addr).await {
                error!(error = %err, "monitoring_api_failed");
            }
        });
    }

    bot.run().await
}
