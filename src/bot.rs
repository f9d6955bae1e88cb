//! Bot orchestrator
//!
//! Owns one controller per watched symbol and drives them from a single
//! cooperative loop: RTH gating, per-symbol processing, the EOD cancel
//! window, the daily snapshot, reconciliation polling, and the session
//! keepalive. Per-symbol failures are contained; only startup failures
//! (config, store, broker connection) are fatal.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerEvent, BrokerOrder, FillEvent};
use crate::calendar::MarketCalendar;
use crate::config::BotConfig;
use crate::controller::{SymbolController, TickContext};
use crate::performance::PerformanceTracker;
use crate::sizing::PositionSizer;
use crate::store::{FillRecord, PerformanceSnapshot, Store};
use crate::types::{is_terminal_status, Side, Symbol};

/// EOD cancel window: sweep unfilled entries when this close.
const EOD_CANCEL_WINDOW_SECS: i64 = 900;

pub struct TradingBot {
    config: Arc<BotConfig>,
    store: Store,
    broker: Box<dyn Broker>,
    calendar: MarketCalendar,
    sizer: PositionSizer,
    controllers: Vec<SymbolController>,
    last_eod_cancel: Option<NaiveDate>,
    last_snapshot_date: Option<NaiveDate>,
    last_event_check: Option<Instant>,
    last_keepalive: Option<Instant>,
}

impl TradingBot {
    /// Build the bot with its default store and broker. Fatal on config,
    /// store, or calendar problems.
    pub fn new(config: BotConfig) -> Result<Self> {
        let store = Store::open(&config.persistence.db_url)
            .context("Failed to open the persistence database")?;
        let broker = crate::broker::build(&config)?;
        Self::with_parts(config, store, broker)
    }

    /// Assemble from pre-built parts (shared store for the monitoring
    /// API, injected broker in tests).
    pub fn with_parts(config: BotConfig, store: Store, broker: Box<dyn Broker>) -> Result<Self> {
        let calendar = MarketCalendar::new(
            &config.hours.calendar,
            config.hours.allow_pre_market,
            config.hours.allow_after_hours,
        )?;
        let config = Arc::new(config);
        let sizer = PositionSizer::from_config(&config);

        let controllers: Vec<SymbolController> = config
            .all_symbols()
            .into_iter()
            .map(|symbol| {
                SymbolController::new(symbol, config.clone(), store.clone(), sizer.clone())
            })
            .collect();

        // Survives restarts: don't double-write today's snapshot
        let last_snapshot_date = store
            .get_latest_snapshot()?
            .map(|s| s.date.date_naive());

        info!(
            mode = ?config.mode,
            watchlist = ?config.watchlist,
            crypto_watchlist = ?config.crypto_watchlist,
            num_symbols = controllers.len(),
            "trading_bot_initialized"
        );

        Ok(TradingBot {
            config,
            store,
            broker,
            calendar,
            sizer,
            controllers,
            last_eod_cancel: None,
            last_snapshot_date,
            last_event_check: None,
            last_keepalive: None,
        })
    }

    pub fn store(&self) -> Store {
        self.store.clone()
    }

    pub fn performance(&self) -> PerformanceTracker {
        PerformanceTracker::new(self.store.clone())
    }

    /// Connect, then loop until SIGINT/SIGTERM. The current iteration
    /// always completes before shutdown.
    pub async fn run(&mut self) -> Result<()> {
        self.broker
            .connect()
            .await
            .context("Broker connection failed")?;

        self.store.add_event(
            "bot_started",
            None,
            Some(json!({
                "mode": format!("{:?}", self.config.mode).to_lowercase(),
                "watchlist": self.config.watchlist,
                "crypto_watchlist": self.config.crypto_watchlist,
            })),
        )?;
        info!("entering_main_loop");

        let shutdown = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                wait_for_shutdown_signal().await;
                info!("shutdown_signal_received");
                shutdown.store(true, Ordering::SeqCst);
                let _ = shutdown_tx.send(()).await;
            });
        }

        loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }

            let delay = match self.tick().await {
                Ok(delay) => delay,
                Err(err) => {
                    error!(error = %err, "loop_iteration_error");
                    Duration::from_secs(10)
                }
            };

            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown_rx.recv() => break,
            }
        }

        self.stop().await
    }

    /// One pass of the main loop. Returns how long to sleep before the
    /// next pass.
    pub async fn tick(&mut self) -> Result<Duration> {
        let now = Utc::now();
        let in_rth = self.calendar.is_regular_hours(now);
        let crypto_empty = self.config.crypto_watchlist.is_empty();

        if !in_rth && crypto_empty {
            debug!("outside_trading_hours");
            self.keepalive_if_due().await;
            return Ok(Duration::from_secs(60));
        }

        // Broker truth, read once and shared by every controller this tick
        let positions = match self.broker.positions().await {
            Ok(positions) => positions,
            Err(err) => {
                warn!(error = %err, "positions_fetch_failed");
                return Ok(Duration::from_secs(self.config.polling.orders_seconds));
            }
        };
        let open_orders = match self.broker.open_orders().await {
            Ok(orders) => orders,
            Err(err) => {
                warn!(error = %err, "open_orders_fetch_failed");
                return Ok(Duration::from_secs(self.config.polling.orders_seconds));
            }
        };
        let account_value = match self.broker.account_value().await {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "account_value_fetch_failed");
                None
            }
        };

        let position_values: HashMap<String, f64> = positions
            .iter()
            .map(|(symbol, p)| (symbol.clone(), p.market_value))
            .collect();
        self.sizer.exposure_metrics(&position_values);

        let ctx = TickContext {
            positions: &positions,
            open_orders: &open_orders,
            position_values: &position_values,
            account_value,
        };

        for controller in &self.controllers {
            if !controller.symbol().is_crypto() && !in_rth {
                continue;
            }
            if let Err(err) = controller.process(self.broker.as_ref(), &ctx).await {
                error!(symbol = %controller.symbol(), error = %err, "symbol_processing_error");
            }
        }

        self.handle_eod_cancellations(now).await?;
        self.take_daily_snapshot(now).await;
        self.check_events_if_due().await;
        self.keepalive_if_due().await;

        Ok(Duration::from_secs(self.config.polling.orders_seconds))
    }

    async fn stop(&mut self) -> Result<()> {
        info!("stopping_trading_bot");
        self.broker.disconnect().await;
        self.store.add_event("bot_stopped", None, None)?;
        info!("trading_bot_stopped");
        Ok(())
    }

    /// Within the last 15 minutes of the session, cancel unfilled equity
    /// entries — once per day.
    async fn handle_eod_cancellations(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.config.entries.cancel_at_close || self.config.watchlist.is_empty() {
            return Ok(());
        }
        let Some(seconds_to_close) = self.calendar.seconds_until_close(now) else {
            return Ok(());
        };
        if seconds_to_close <= 0 || seconds_to_close > EOD_CANCEL_WINDOW_SECS {
            return Ok(());
        }

        let today = now.date_naive();
        if self.last_eod_cancel == Some(today) {
            return Ok(());
        }

        info!(seconds_to_close, "cancelling_unfilled_entries_eod");
        for controller in &self.controllers {
            if controller.symbol().is_crypto() {
                continue;
            }
            if let Err(err) = controller.cancel_unfilled_entries(self.broker.as_ref()).await {
                error!(symbol = %controller.symbol(), error = %err, "eod_cancel_error");
            }
        }

        self.last_eod_cancel = Some(today);
        self.store
            .add_event("eod_cancellations_completed", None, None)?;
        Ok(())
    }

    /// One account snapshot per UTC day. Failures are logged; the next
    /// tick retries.
    async fn take_daily_snapshot(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if self.last_snapshot_date == Some(today) {
            return;
        }

        let summary = match self.broker.account_summary().await {
            Ok(summary) if !summary.is_empty() => summary,
            Ok(_) => return,
            Err(err) => {
                warn!(error = %err, "account_summary_fetch_failed");
                return;
            }
        };
        let num_positions = match self.broker.positions().await {
            Ok(positions) => positions.len() as i64,
            Err(_) => 0,
        };

        let day_start = Utc.from_utc_datetime(&today.and_time(NaiveTime::MIN));
        let num_trades = self.store.count_fills_since(day_start).unwrap_or(0);

        let snapshot = PerformanceSnapshot {
            date: now,
            account_value: summary.get("NetLiquidation").copied(),
            cash_value: summary.get("TotalCashValue").copied(),
            position_value: summary.get("GrossPositionValue").copied(),
            unrealized_pnl: summary.get("UnrealizedPnL").copied(),
            realized_pnl: summary.get("RealizedPnL").copied(),
            daily_pnl: None,
            num_positions: Some(num_positions),
            num_trades: Some(num_trades),
        };

        match self.store.add_performance_snapshot(&snapshot) {
            Ok(()) => {
                self.last_snapshot_date = Some(today);
                info!(date = %today, "daily_snapshot_saved");
            }
            Err(err) => error!(error = %err, "failed_to_save_snapshot"),
        }
    }

    async fn check_events_if_due(&mut self) {
        let due = self
            .last_event_check
            .map(|at| at.elapsed().as_secs() >= self.config.polling.event_check_seconds)
            .unwrap_or(true);
        if !due {
            return;
        }
        self.poll_events_once().await;
        self.last_event_check = Some(Instant::now());
    }

    /// One reconciliation pass: poll the broker, dispatch the resulting
    /// fill and status events.
    pub async fn poll_events_once(&self) {
        let events = match self.broker.poll_events().await {
            Ok(events) => events,
            Err(err) => {
                warn!(error = %err, "event_check_failed");
                return;
            }
        };

        for event in events {
            match event {
                BrokerEvent::Fill { order, fill } => {
                    if let Err(err) = self.handle_fill(&order, &fill).await {
                        error!(symbol = %fill.symbol, error = %err, "fill_handling_failed");
                    }
                }
                BrokerEvent::OrderStatus(order) => {
                    if let Err(err) = self.handle_order_status(&order) {
                        error!(order_id = %order.id, error = %err, "status_handling_failed");
                    }
                }
            }
        }
    }

    /// Record the fill (idempotent on exec id) and fan out: a BUY fill
    /// gets its protective stop, a protective SELL fill starts the
    /// cooldown. Replayed exec ids trigger neither.
    pub async fn handle_fill(&self, order: &BrokerOrder, fill: &FillEvent) -> Result<()> {
        info!(
            symbol = %fill.symbol,
            side = %fill.side,
            qty = fill.qty,
            price = fill.price,
            order_id = %fill.order_id,
            exec_id = %fill.exec_id,
            "fill_received"
        );

        let record = FillRecord {
            exec_id: fill.exec_id.clone(),
            order_id: fill.order_id.clone(),
            symbol: fill.symbol.clone(),
            side: fill.side.as_str().to_string(),
            qty: fill.qty,
            price: fill.price,
            ts: Utc::now(),
        };
        if !self.store.add_fill(&record)? {
            debug!(exec_id = %fill.exec_id, "duplicate_fill_ignored");
            return Ok(());
        }

        self.store.add_event(
            "fill",
            Some(&fill.symbol),
            Some(json!({
                "exec_id": fill.exec_id,
                "side": fill.side.as_str(),
                "qty": fill.qty,
                "price": fill.price,
                "order_id": fill.order_id,
            })),
        )?;

        let controller = self
            .controllers
            .iter()
            .find(|c| c.symbol().as_str() == fill.symbol);

        match fill.side {
            Side::Sell if order.is_protective_stop() => {
                info!(symbol = %fill.symbol, "stopout_detected");
                if let Some(controller) = controller {
                    controller.on_stop_out()?;
                }
            }
            Side::Buy => {
                if let Some(controller) = controller {
                    controller
                        .place_stop_after_entry(self.broker.as_ref(), fill.qty, fill.price)
                        .await?;
                }
            }
            _ => {}
        }

        Ok(())
    }

    fn handle_order_status(&self, order: &BrokerOrder) -> Result<()> {
        debug!(
            symbol = %order.symbol,
            order_id = %order.id,
            status = %order.status,
            "order_status_update"
        );

        self.store.update_order_status(&order.id, &order.status)?;

        if is_terminal_status(&order.status) {
            self.store.add_event(
                &format!("order_{}", order.status.to_lowercase()),
                Some(&order.symbol),
                Some(json!({ "order_id": order.id, "status": order.status })),
            )?;
        }
        Ok(())
    }

    async fn keepalive_if_due(&mut self) {
        let due = self
            .last_keepalive
            .map(|at| at.elapsed().as_secs() >= self.config.polling.keepalive_seconds)
            .unwrap_or(true);
        if !due {
            return;
        }
        self.broker.keep_alive().await;
        self.last_keepalive = Some(Instant::now());
    }

    /// Controllers by symbol, for operator tooling.
    pub fn controller(&self, symbol: &Symbol) -> Option<&SymbolController> {
        self.controllers
            .iter()
            .find(|c| c.symbol() == symbol)
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(error = %err, "sigterm_handler_unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
