//! Broker adapters
//!
//! The trading core depends only on the [`Broker`] trait; two adapters
//! implement it (Alpaca REST, IBKR Client Portal gateway). Order and
//! parent ids are opaque strings throughout — Alpaca hands out UUIDs,
//! IBKR hands out integers, and nothing downstream may care.

pub mod alpaca;
pub mod ibkr;

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

use crate::config::{BotConfig, BrokerKind};
use crate::types::{round_to_tick, Side, Symbol};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("broker api error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("not connected to broker")]
    NotConnected,
    #[error("{0}")]
    Other(String),
}

impl BrokerError {
    /// Transient failures are skipped for the current tick and retried
    /// naturally on the next one. Anything else is a hard reject.
    pub fn is_transient(&self) -> bool {
        match self {
            BrokerError::Transport(_) | BrokerError::NotConnected => true,
            BrokerError::Api { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            BrokerError::Rejected(_) | BrokerError::Other(_) => false,
        }
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// A broker's view of one order.
#[derive(Debug, Clone)]
pub struct BrokerOrder {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    /// Broker order-type tag, lower-cased: stop, stop_limit,
    /// trailing_stop, limit, ...
    pub order_type: String,
    /// Broker lifecycle status, lower-cased.
    pub status: String,
    pub qty: f64,
    pub filled_qty: f64,
    pub filled_avg_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub limit_price: Option<f64>,
    pub trail_percent: Option<f64>,
}

impl BrokerOrder {
    /// Is this order the protective exit for a long position? Equities
    /// use native trailing stops; crypto venues get a plain limit sell
    /// standing in for one.
    pub fn is_protective_stop(&self) -> bool {
        self.side == Side::Sell
            && (self.order_type.contains("trail")
                || (self.symbol.contains('/') && self.order_type == "limit"))
    }
}

/// A broker's view of one position.
#[derive(Debug, Clone)]
pub struct BrokerPosition {
    pub qty: f64,
    pub avg_cost: f64,
    pub market_value: f64,
}

/// One execution, as reconstructed by the reconciliation loop.
#[derive(Debug, Clone)]
pub struct FillEvent {
    pub exec_id: String,
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub price: f64,
}

impl FillEvent {
    /// Build a fill descriptor from an order's filled quantity and
    /// average price. The order id doubles as the exec id, which makes
    /// re-deliveries of the same poll result idempotent downstream.
    pub fn from_order(order: &BrokerOrder) -> Self {
        FillEvent {
            exec_id: order.id.clone(),
            order_id: order.id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            qty: order.filled_qty,
            price: order.filled_avg_price.unwrap_or(0.0),
        }
    }
}

/// Output of one reconciliation poll.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    Fill { order: BrokerOrder, fill: FillEvent },
    OrderStatus(BrokerOrder),
}

/// The capability set the trading core is allowed to use.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&mut self) -> BrokerResult<()>;
    async fn disconnect(&mut self);
    fn is_connected(&self) -> bool;

    /// Last traded price (or quote midpoint), `None` when the feed has
    /// nothing usable.
    async fn last_price(&self, symbol: &Symbol) -> BrokerResult<Option<f64>>;

    /// Submit a breakout entry above `last_price`. `Ok(None)` means the
    /// broker rejected the order (permanent, logged); transport failures
    /// surface as `Err`.
    async fn place_entry(
        &self,
        symbol: &Symbol,
        qty: f64,
        last_price: f64,
    ) -> BrokerResult<Option<BrokerOrder>>;

    /// Submit the protective exit for a long position of `qty` around
    /// `ref_price`.
    async fn place_trailing_stop(
        &self,
        symbol: &Symbol,
        qty: f64,
        ref_price: f64,
    ) -> BrokerResult<Option<BrokerOrder>>;

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()>;

    async fn positions(&self) -> BrokerResult<HashMap<String, BrokerPosition>>;
    async fn open_orders(&self) -> BrokerResult<Vec<BrokerOrder>>;
    async fn account_value(&self) -> BrokerResult<Option<f64>>;
    /// Account metrics keyed by tag (NetLiquidation, TotalCashValue,
    /// GrossPositionValue, UnrealizedPnL, RealizedPnL, ...).
    async fn account_summary(&self) -> BrokerResult<HashMap<String, f64>>;

    /// One reconciliation pass: list recent orders, diff against the
    /// tracked map, return the resulting fill/status events.
    async fn poll_events(&self) -> BrokerResult<Vec<BrokerEvent>>;

    /// Session keepalive; failures are logged, never propagated.
    async fn keep_alive(&self);

    // Operator tooling
    async fn close_all_positions(&self) -> BrokerResult<()>;
    async fn cancel_all_orders(&self) -> BrokerResult<()>;
}

/// Instantiate the configured adapter (not yet connected).
pub fn build(config: &BotConfig) -> anyhow::Result<Box<dyn Broker>> {
    Ok(match config.broker {
        BrokerKind::Alpaca => Box::new(alpaca::AlpacaBroker::new(config)?),
        BrokerKind::Ibkr => Box::new(ibkr::IbkrBroker::new(config)?),
    })
}

// =============================================================================
// Shared pricing policy
// =============================================================================

/// Breakout trigger: `last * (1 + pct/100)`, rounded down to the grid.
pub fn breakout_stop_price(last_price: f64, pct_above: f64) -> f64 {
    round_to_tick(last_price * (1.0 + pct_above / 100.0))
}

/// Stop-limit cap: `stop * (1 + slip_pct/100)`, rounded down to the grid.
pub fn slip_limit_price(stop_price: f64, slip_pct: f64) -> f64 {
    round_to_tick(stop_price * (1.0 + slip_pct / 100.0))
}

/// Fixed exit for venues without trailing stops:
/// `ref * (1 - trail_pct/100)`, rounded down to the grid. This is an
/// approximation of a trailing stop anchored at placement time; it is
/// never resubmitted as price moves.
pub fn fixed_exit_price(ref_price: f64, trail_pct: f64) -> f64 {
    round_to_tick(ref_price * (1.0 - trail_pct / 100.0))
}
