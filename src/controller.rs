//! Per-symbol trading controller
//!
//! Status is *derived*, never stored: every tick recomputes it from the
//! store's cooldown timestamp plus the broker's positions and open
//! orders. A restart therefore resumes exactly where broker truth says
//! we are, and every action is safe to repeat.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerOrder, BrokerPosition};
use crate::config::BotConfig;
use crate::sizing::PositionSizer;
use crate::store::{NewOrder, StatePatch, Store};
use crate::types::{is_open_status, Side, Symbol};

/// Quantities come back from brokers as floats; this is close enough for
/// "same number of shares/units".
const QTY_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolStatus {
    NoPosition,
    EntryPending,
    PositionOpen,
    Cooldown,
    Halt,
}

impl SymbolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SymbolStatus::NoPosition => "no_position",
            SymbolStatus::EntryPending => "entry_pending",
            SymbolStatus::PositionOpen => "position_open",
            SymbolStatus::Cooldown => "cooldown",
            SymbolStatus::Halt => "halt",
        }
    }
}

/// Broker truth captured once at the top of a tick and shared by every
/// controller in that tick.
pub struct TickContext<'a> {
    pub positions: &'a HashMap<String, BrokerPosition>,
    pub open_orders: &'a [BrokerOrder],
    /// symbol -> market value, for exposure checks
    pub position_values: &'a HashMap<String, f64>,
    pub account_value: Option<f64>,
}

pub struct SymbolController {
    symbol: Symbol,
    config: Arc<BotConfig>,
    store: Store,
    sizer: PositionSizer,
    halted: bool,
}

impl SymbolController {
    pub fn new(symbol: Symbol, config: Arc<BotConfig>, store: Store, sizer: PositionSizer) -> Self {
        debug!(symbol = %symbol, "controller_initialized");
        SymbolController {
            symbol,
            config,
            store,
            sizer,
            halted: false,
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    /// Operator switch: a halted controller classifies as HALT and emits
    /// no intents until resumed.
    pub fn halt(&mut self) {
        self.halted = true;
    }

    pub fn resume(&mut self) {
        self.halted = false;
    }

    /// Derive the current status. First match wins: cooldown beats an
    /// open position beats a pending entry.
    pub fn status(
        &self,
        now: DateTime<Utc>,
        positions: &HashMap<String, BrokerPosition>,
        open_orders: &[BrokerOrder],
    ) -> Result<SymbolStatus> {
        if self.halted {
            return Ok(SymbolStatus::Halt);
        }

        if let Some(state) = self.store.get_symbol_state(self.symbol.as_str())? {
            if let Some(until) = state.cooldown_until {
                if now < until {
                    return Ok(SymbolStatus::Cooldown);
                }
            }
        }

        if positions
            .get(self.symbol.as_str())
            .map(|p| p.qty > 0.0)
            .unwrap_or(false)
        {
            return Ok(SymbolStatus::PositionOpen);
        }

        let entry_pending = open_orders.iter().any(|o| {
            o.symbol == self.symbol.as_str() && o.side == Side::Buy && is_open_status(&o.status)
        });
        if entry_pending {
            return Ok(SymbolStatus::EntryPending);
        }

        Ok(SymbolStatus::NoPosition)
    }

    /// One tick of the state machine. Broker hiccups are logged and
    /// retried next tick; store failures propagate to the orchestrator.
    pub async fn process(&self, broker: &dyn Broker, ctx: &TickContext<'_>) -> Result<()> {
        let status = self.status(Utc::now(), ctx.positions, ctx.open_orders)?;
        debug!(symbol = %self.symbol, status = status.as_str(), "processing_symbol");

        match status {
            SymbolStatus::NoPosition => self.handle_no_position(broker, ctx).await,
            SymbolStatus::EntryPending => {
                // Nothing to do; reconciliation or the EOD sweep moves us on
                debug!(symbol = %self.symbol, "entry_pending");
                Ok(())
            }
            SymbolStatus::PositionOpen => self.handle_position_open(broker, ctx).await,
            SymbolStatus::Cooldown => {
                if let Some(state) = self.store.get_symbol_state(self.symbol.as_str())? {
                    if let Some(until) = state.cooldown_until {
                        let remaining = (until - Utc::now()).num_seconds();
                        debug!(symbol = %self.symbol, remaining_seconds = remaining, "in_cooldown");
                    }
                }
                Ok(())
            }
            SymbolStatus::Halt => {
                debug!(symbol = %self.symbol, "halted_no_action");
                Ok(())
            }
        }
    }

    async fn handle_no_position(&self, broker: &dyn Broker, ctx: &TickContext<'_>) -> Result<()> {
        let last_price = match broker.last_price(&self.symbol).await {
            Ok(Some(price)) => price,
            Ok(None) => {
                warn!(symbol = %self.symbol, "cannot_fetch_price");
                return Ok(());
            }
            Err(err) => {
                warn!(symbol = %self.symbol, error = %err, "price_fetch_failed");
                return Ok(());
            }
        };

        let qty = self.sizer.calculate_quantity(
            self.symbol.as_str(),
            last_price,
            ctx.position_values,
            ctx.account_value,
        );
        if qty <= 0.0 {
            info!(symbol = %self.symbol, "skipping_entry_zero_qty");
            return Ok(());
        }

        match broker.place_entry(&self.symbol, qty, last_price).await {
            Ok(Some(order)) => {
                // A fresh entry supersedes whatever stop the last round
                // trip left behind
                self.store.upsert_symbol_state(
                    self.symbol.as_str(),
                    StatePatch {
                        last_parent_id: Some(order.id.clone()),
                        clear_trail_id: true,
                        ..Default::default()
                    },
                )?;
                self.store.add_order(NewOrder {
                    order_id: order.id.clone(),
                    symbol: self.symbol.as_str().to_string(),
                    side: Side::Buy.as_str().to_string(),
                    order_type: order.order_type.clone(),
                    status: order.status.clone(),
                    qty,
                    stop_price: order.stop_price,
                    limit_price: order.limit_price,
                    trailing_pct: None,
                    parent_id: None,
                })?;
                self.store.add_event(
                    "entry_order_placed",
                    Some(self.symbol.as_str()),
                    Some(json!({
                        "order_id": order.id,
                        "qty": qty,
                        "last_price": last_price,
                    })),
                )?;
            }
            Ok(None) => {
                // Permanent rejection; leave state untouched so the next
                // tick re-evaluates cleanly
                self.store.add_event(
                    "order_rejected",
                    Some(self.symbol.as_str()),
                    Some(json!({ "side": "BUY", "qty": qty })),
                )?;
            }
            Err(err) => {
                warn!(symbol = %self.symbol, error = %err, "entry_submission_failed");
            }
        }
        Ok(())
    }

    /// Keep the protective stop healthy: exactly one, sized to the
    /// position, regardless of how we got out of sync (partial fills,
    /// manual orders, crashes mid-placement).
    async fn handle_position_open(&self, broker: &dyn Broker, ctx: &TickContext<'_>) -> Result<()> {
        let Some(position) = ctx.positions.get(self.symbol.as_str()) else {
            warn!(symbol = %self.symbol, "position_disappeared");
            return Ok(());
        };
        let position_qty = position.qty;

        let stops: Vec<&BrokerOrder> = ctx
            .open_orders
            .iter()
            .filter(|o| {
                o.symbol == self.symbol.as_str()
                    && o.is_protective_stop()
                    && is_open_status(&o.status)
            })
            .collect();

        if stops.is_empty() {
            warn!(symbol = %self.symbol, "missing_trailing_stop");
            let Some(last_price) = self.fetch_price(broker).await else {
                return Ok(());
            };
            if let Some(order) = self
                .submit_stop(broker, position_qty, last_price)
                .await
            {
                self.record_stop(
                    &order,
                    position_qty,
                    "trailing_stop_recreated",
                    json!({ "order_id": order.id, "qty": position_qty }),
                )?;
            }
        } else if stops.len() > 1 {
            warn!(
                symbol = %self.symbol,
                count = stops.len(),
                "duplicate_trailing_stops"
            );
            for duplicate in &stops[1..] {
                match broker.cancel_order(&duplicate.id).await {
                    Ok(()) => {
                        self.store.add_event(
                            "duplicate_stop_cancelled",
                            Some(self.symbol.as_str()),
                            Some(json!({ "order_id": duplicate.id })),
                        )?;
                    }
                    Err(err) => {
                        warn!(symbol = %self.symbol, order_id = %duplicate.id, error = %err, "duplicate_cancel_failed");
                    }
                }
            }
        } else {
            let stop = stops[0];
            if (stop.qty - position_qty).abs() > QTY_EPSILON {
                warn!(
                    symbol = %self.symbol,
                    position_qty,
                    stop_qty = stop.qty,
                    "stop_qty_mismatch"
                );
                if let Err(err) = broker.cancel_order(&stop.id).await {
                    warn!(symbol = %self.symbol, error = %err, "stop_cancel_failed");
                    return Ok(());
                }
                let Some(last_price) = self.fetch_price(broker).await else {
                    return Ok(());
                };
                if let Some(order) = self
                    .submit_stop(broker, position_qty, last_price)
                    .await
                {
                    self.record_stop(
                        &order,
                        position_qty,
                        "trailing_stop_adjusted",
                        json!({
                            "old_qty": stop.qty,
                            "new_qty": position_qty,
                            "order_id": order.id,
                        }),
                    )?;
                }
            }
        }

        Ok(())
    }

    /// BUY fill callback: attach the protective stop for the filled
    /// quantity at the fill price.
    pub async fn place_stop_after_entry(
        &self,
        broker: &dyn Broker,
        qty: f64,
        entry_price: f64,
    ) -> Result<()> {
        info!(symbol = %self.symbol, qty, entry_price, "placing_trailing_stop_after_entry");

        if let Some(order) = self.submit_stop(broker, qty, entry_price).await {
            self.record_stop(
                &order,
                qty,
                "trailing_stop_placed_after_entry",
                json!({ "order_id": order.id, "qty": qty }),
            )?;
        }
        Ok(())
    }

    /// SELL trailing-stop fill callback: suppress re-entry for the
    /// configured cooldown.
    pub fn on_stop_out(&self) -> Result<()> {
        let minutes = self.config.cooldowns.after_stopout_minutes;
        let until = Utc::now() + Duration::minutes(minutes);

        self.store.upsert_symbol_state(
            self.symbol.as_str(),
            StatePatch {
                cooldown_until: Some(until),
                ..Default::default()
            },
        )?;
        self.store.add_event(
            "stopout_cooldown_started",
            Some(self.symbol.as_str()),
            Some(json!({
                "cooldown_minutes": minutes,
                "cooldown_until": until.to_rfc3339(),
            })),
        )?;

        info!(symbol = %self.symbol, cooldown_minutes = minutes, "stopout_cooldown_started");
        Ok(())
    }

    /// End-of-session sweep: cancel entries that never triggered.
    /// Partially filled entries are left alone; the position side is
    /// reconciled by the stop-quantity check.
    pub async fn cancel_unfilled_entries(&self, broker: &dyn Broker) -> Result<()> {
        let open_orders = match broker.open_orders().await {
            Ok(orders) => orders,
            Err(err) => {
                warn!(symbol = %self.symbol, error = %err, "open_orders_fetch_failed");
                return Ok(());
            }
        };

        for order in open_orders.iter().filter(|o| {
            o.symbol == self.symbol.as_str()
                && o.side == Side::Buy
                && is_open_status(&o.status)
                && o.status != "partially_filled"
        }) {
            match broker.cancel_order(&order.id).await {
                Ok(()) => {
                    self.store.add_event(
                        "entry_cancelled_eod",
                        Some(self.symbol.as_str()),
                        Some(json!({ "order_id": order.id })),
                    )?;
                    info!(symbol = %self.symbol, order_id = %order.id, "entry_cancelled_eod");
                }
                Err(err) => {
                    warn!(symbol = %self.symbol, order_id = %order.id, error = %err, "eod_cancel_failed");
                }
            }
        }
        Ok(())
    }

    async fn fetch_price(&self, broker: &dyn Broker) -> Option<f64> {
        match broker.last_price(&self.symbol).await {
            Ok(Some(price)) => Some(price),
            Ok(None) => {
                warn!(symbol = %self.symbol, "cannot_fetch_price");
                None
            }
            Err(err) => {
                warn!(symbol = %self.symbol, error = %err, "price_fetch_failed");
                None
            }
        }
    }

    async fn submit_stop(
        &self,
        broker: &dyn Broker,
        qty: f64,
        ref_price: f64,
    ) -> Option<BrokerOrder> {
        match broker.place_trailing_stop(&self.symbol, qty, ref_price).await {
            Ok(Some(order)) => Some(order),
            Ok(None) => None,
            Err(err) => {
                warn!(symbol = %self.symbol, error = %err, "stop_submission_failed");
                None
            }
        }
    }

    fn record_stop(
        &self,
        order: &BrokerOrder,
        qty: f64,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        let state = self.store.get_symbol_state(self.symbol.as_str())?;
        self.store.upsert_symbol_state(
            self.symbol.as_str(),
            StatePatch {
                last_trail_id: Some(order.id.clone()),
                ..Default::default()
            },
        )?;
        self.store.add_order(NewOrder {
            order_id: order.id.clone(),
            symbol: self.symbol.as_str().to_string(),
            side: Side::Sell.as_str().to_string(),
            order_type: order.order_type.clone(),
            status: order.status.clone(),
            qty,
            stop_price: order.stop_price,
            limit_price: order.limit_price,
            trailing_pct: order
                .trail_percent
                .or(Some(self.config.stops.trailing_stop_pct)),
            parent_id: state.and_then(|s| s.last_parent_id),
        })?;
        self.store
            .add_event(event_type, Some(self.symbol.as_str()), Some(payload))?;
        Ok(())
    }
}
