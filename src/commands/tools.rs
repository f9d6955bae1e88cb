//! Operator tooling: status dump, performance report, CSV export, and
//! the paper-account reset.

use anyhow::{bail, Context, Result};
use chrono::Utc;

use breakout_bot::broker::{self, Broker};
use breakout_bot::config::BotConfig;
use breakout_bot::performance::PerformanceTracker;
use breakout_bot::store::Store;

fn open_store(config_path: &str) -> Result<(BotConfig, Store)> {
    let config = BotConfig::from_file(config_path)
        .with_context(|| format!("Failed to load config from {config_path}"))?;
    let store = Store::open(&config.persistence.db_url)?;
    Ok((config, store))
}

/// Print symbol states, active orders, recent events, and the latest
/// snapshot.
pub fn status(config_path: String) -> Result<()> {
    let (_, store) = open_store(&config_path)?;
    let now = Utc::now();

    println!("{}", "=".repeat(70));
    println!("BOT STATUS  ({})", now.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("{}", "=".repeat(70));

    let states = store.get_symbol_states()?;
    if states.is_empty() {
        println!("\nNo symbol state recorded yet.");
    } else {
        println!("\nSYMBOL STATES");
        println!("{}", "-".repeat(70));
        for state in states {
            let cooldown = match state.cooldown_until {
                Some(until) if until > now => format!("cooldown until {}", until.format("%H:%M:%S")),
                _ => "ready".to_string(),
            };
            println!(
                "{:<10} {:<28} parent={} trail={}",
                state.symbol,
                cooldown,
                state.last_parent_id.as_deref().unwrap_or("-"),
                state.last_trail_id.as_deref().unwrap_or("-"),
            );
        }
    }

    let active = store.get_active_orders(None)?;
    println!("\nACTIVE ORDERS ({})", active.len());
    println!("{}", "-".repeat(70));
    for order in active {
        println!(
            "{:<10} {:<4} {:<14} qty={:<8} status={} id={}",
            order.symbol, order.side, order.order_type, order.qty, order.status, order.order_id
        );
    }

    println!("\nRECENT EVENTS");
    println!("{}", "-".repeat(70));
    for event in store.get_events(10)? {
        println!(
            "{}  {:<28} {}",
            event.ts.format("%m-%d %H:%M:%S"),
            event.event_type,
            event.symbol.as_deref().unwrap_or("")
        );
    }

    if let Some(snapshot) = store.get_latest_snapshot()? {
        println!("\nLATEST SNAPSHOT ({})", snapshot.date.format("%Y-%m-%d"));
        println!("{}", "-".repeat(70));
        println!(
            "account={:.2} cash={:.2} positions={} trades={}",
            snapshot.account_value.unwrap_or(0.0),
            snapshot.cash_value.unwrap_or(0.0),
            snapshot.num_positions.unwrap_or(0),
            snapshot.num_trades.unwrap_or(0),
        );
    }

    Ok(())
}

/// Print the full performance report.
pub fn performance(config_path: String) -> Result<()> {
    let (_, store) = open_store(&config_path)?;
    let tracker = PerformanceTracker::new(store);
    println!("{}", tracker.report(None)?);
    Ok(())
}

/// Export closed trades to CSV.
pub fn export(config_path: String, output: String) -> Result<()> {
    let (_, store) = open_store(&config_path)?;
    let tracker = PerformanceTracker::new(store);
    let count = tracker.export_csv(&output)?;
    println!("Exported {count} closed trades to {output}");
    Ok(())
}

/// Close all positions and cancel all orders. Refuses outside paper mode.
pub fn reset(config_path: String) -> Result<()> {
    dotenv::dotenv().ok();
    let config = BotConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {config_path}"))?;

    if !config.is_paper() {
        bail!("reset is only available in paper mode");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(async {
        let mut broker = broker::build(&config)?;
        broker.connect().await.context("Broker connection failed")?;

        broker
            .close_all_positions()
            .await
            .context("Failed to close positions")?;
        broker
            .cancel_all_orders()
            .await
            .context("Failed to cancel orders")?;
        broker.disconnect().await;

        println!("Paper account reset: all positions closed, all orders cancelled.");
        Ok(())
    })
}
