//! IBKR Client Portal gateway adapter
//!
//! Talks to a locally running Client Portal gateway over REST. The
//! gateway terminates TLS with a self-signed certificate and expects a
//! periodic `/tickle` to keep the brokerage session alive. Order ids
//! here are integers; they travel through the system as opaque strings
//! like everything else.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    breakout_stop_price, fixed_exit_price, slip_limit_price, Broker, BrokerError, BrokerEvent,
    BrokerOrder, BrokerPosition, BrokerResult,
};
use crate::config::{BotConfig, EntriesConfig, EntryType, StopsConfig};
use crate::reconcile::OrderTracker;
use crate::types::{is_open_status, round_to_tick, Side, Symbol};

pub struct IbkrBroker {
    client: reqwest::Client,
    base: String,
    configured_account: Option<String>,
    account: Option<String>,
    entries: EntriesConfig,
    stops: StopsConfig,
    connected: bool,
    conids: Mutex<HashMap<String, i64>>,
    tracker: Mutex<OrderTracker>,
}

impl IbkrBroker {
    pub fn new(config: &BotConfig) -> anyhow::Result<Self> {
        // The gateway listens on localhost with a self-signed cert
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(IbkrBroker {
            client,
            base: config.ibkr.gateway_url.trim_end_matches('/').to_string(),
            configured_account: config.ibkr.account.clone(),
            account: None,
            entries: config.entries.clone(),
            stops: config.stops.clone(),
            connected: false,
            conids: Mutex::new(HashMap::new()),
            tracker: Mutex::new(OrderTracker::new()),
        })
    }

    fn account_id(&self) -> BrokerResult<&str> {
        self.account.as_deref().ok_or(BrokerError::NotConnected)
    }

    fn lock_tracker(&self) -> std::sync::MutexGuard<'_, OrderTracker> {
        self.tracker.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Resolve and cache the contract id for a symbol.
    async fn conid(&self, symbol: &Symbol) -> BrokerResult<i64> {
        {
            let conids = self.conids.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(conid) = conids.get(symbol.as_str()) {
                return Ok(*conid);
            }
        }

        // Crypto pairs are looked up by base asset
        let query = symbol
            .as_str()
            .split('/')
            .next()
            .unwrap_or(symbol.as_str());
        let url = format!("{}/iserver/secdef/search", self.base);
        let resp = self
            .client
            .get(&url)
            .query(&[("symbol", query)])
            .send()
            .await?;
        let results: Vec<RawSecdef> = check(resp).await?;

        let conid = results
            .first()
            .and_then(|r| value_to_i64(&r.conid))
            .ok_or_else(|| BrokerError::Other(format!("no contract found for {symbol}")))?;

        self.conids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(symbol.as_str().to_string(), conid);
        debug!(symbol = %symbol, conid, "contract_resolved");
        Ok(conid)
    }

    /// Submit one order, answering the gateway's confirmation prompts.
    async fn submit(&self, order: Value, meta: OrderMeta<'_>) -> BrokerResult<BrokerOrder> {
        let account = self.account_id()?;
        let url = format!("{}/iserver/account/{}/orders", self.base, account);
        let resp = self
            .client
            .post(&url)
            .json(&json!({ "orders": [order] }))
            .send()
            .await?;
        let mut reply: Value = check(resp).await?;

        // The gateway may interpose up to a couple of "are you sure"
        // messages that must be confirmed before the order is accepted.
        for _ in 0..2 {
            let first = reply.get(0).cloned().unwrap_or(Value::Null);
            if let Some(order_id) = first.get("order_id").and_then(value_to_string) {
                let status = first
                    .get("order_status")
                    .and_then(|v| v.as_str())
                    .map(normalize_status)
                    .unwrap_or_else(|| "submitted".to_string());
                let order = BrokerOrder {
                    id: order_id,
                    symbol: meta.symbol.to_string(),
                    side: meta.side,
                    order_type: meta.order_type.to_string(),
                    status,
                    qty: meta.qty,
                    filled_qty: 0.0,
                    filled_avg_price: None,
                    stop_price: meta.stop_price,
                    limit_price: meta.limit_price,
                    trail_percent: meta.trail_percent,
                };
                self.lock_tracker().track(&order);
                return Ok(order);
            }
            if let Some(reply_id) = first.get("id").and_then(|v| v.as_str()) {
                let url = format!("{}/iserver/reply/{}", self.base, reply_id);
                let resp = self
                    .client
                    .post(&url)
                    .json(&json!({ "confirmed": true }))
                    .send()
                    .await?;
                reply = check(resp).await?;
                continue;
            }
            break;
        }

        Err(BrokerError::Rejected(reply.to_string()))
    }
}

struct OrderMeta<'a> {
    symbol: &'a Symbol,
    side: Side,
    order_type: &'a str,
    qty: f64,
    stop_price: Option<f64>,
    limit_price: Option<f64>,
    trail_percent: Option<f64>,
}

async fn check<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> BrokerResult<T> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json::<T>().await?);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(BrokerError::Api {
        status: status.as_u16(),
        message,
    })
}

fn absorb_rejection(err: BrokerError, what: &str) -> BrokerResult<Option<BrokerOrder>> {
    if err.is_transient() {
        Err(err)
    } else {
        warn!(error = %err, "{}_rejected", what);
        Ok(None)
    }
}

/// Map gateway status strings onto the shared lifecycle vocabulary.
fn normalize_status(status: &str) -> String {
    match status {
        "Submitted" => "submitted".to_string(),
        "PreSubmitted" => "pre-submitted".to_string(),
        "PendingSubmit" | "PendingNew" => "pending_new".to_string(),
        "Filled" => "filled".to_string(),
        "Cancelled" | "Canceled" => "canceled".to_string(),
        "Inactive" => "rejected".to_string(),
        other => other.to_lowercase(),
    }
}

#[async_trait]
impl Broker for IbkrBroker {
    async fn connect(&mut self) -> BrokerResult<()> {
        let url = format!("{}/iserver/accounts", self.base);
        let resp = self.client.get(&url).send().await?;
        let accounts: RawAccounts = check(resp).await?;

        let account = match &self.configured_account {
            Some(wanted) => accounts
                .accounts
                .iter()
                .find(|a| *a == wanted)
                .cloned()
                .ok_or_else(|| BrokerError::Other(format!("account {wanted} not in gateway")))?,
            None => accounts
                .accounts
                .first()
                .cloned()
                .ok_or_else(|| BrokerError::Other("gateway reports no accounts".to_string()))?,
        };

        self.account = Some(account.clone());
        self.connected = true;
        info!(account, base = %self.base, "ibkr_connected");
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
        self.account = None;
        info!("ibkr_disconnected");
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn last_price(&self, symbol: &Symbol) -> BrokerResult<Option<f64>> {
        let conid = self.conid(symbol).await?;
        let url = format!("{}/iserver/marketdata/snapshot", self.base);
        // Field 31 is the last price; the gateway prefixes it with C/H
        // when reporting close/halted values
        let resp = self
            .client
            .get(&url)
            .query(&[("conids", conid.to_string()), ("fields", "31".to_string())])
            .send()
            .await?;
        let rows: Vec<HashMap<String, Value>> = check(resp).await?;

        let price = rows
            .first()
            .and_then(|row| row.get("31"))
            .and_then(|v| match v {
                Value::String(s) => s.trim_start_matches(['C', 'H']).parse::<f64>().ok(),
                Value::Number(n) => n.as_f64(),
                _ => None,
            })
            .filter(|p| *p > 0.0);

        debug!(symbol = %symbol, ?price, "price_fetched");
        Ok(price)
    }

    async fn place_entry(
        &self,
        symbol: &Symbol,
        qty: f64,
        last_price: f64,
    ) -> BrokerResult<Option<BrokerOrder>> {
        let conid = self.conid(symbol).await?;
        let stop_price = breakout_stop_price(last_price, self.entries.buy_stop_pct_above_last);

        let (body, meta) = if symbol.is_crypto() {
            // No stop orders on the crypto venue; limit at the breakout
            (
                json!({
                    "conid": conid,
                    "orderType": "LMT",
                    "side": "BUY",
                    "quantity": qty,
                    "price": stop_price,
                    "tif": "GTC",
                }),
                OrderMeta {
                    symbol,
                    side: Side::Buy,
                    order_type: "limit",
                    qty,
                    stop_price: None,
                    limit_price: Some(stop_price),
                    trail_percent: None,
                },
            )
        } else {
            match self.entries.r#type {
                EntryType::BuyStop => (
                    json!({
                        "conid": conid,
                        "orderType": "STP",
                        "side": "BUY",
                        "quantity": qty,
                        "price": stop_price,
                        "tif": self.entries.tif.to_uppercase(),
                        "outsideRTH": false,
                    }),
                    OrderMeta {
                        symbol,
                        side: Side::Buy,
                        order_type: "stop",
                        qty,
                        stop_price: Some(stop_price),
                        limit_price: None,
                        trail_percent: None,
                    },
                ),
                EntryType::BuyStopLimit => {
                    let limit =
                        slip_limit_price(stop_price, self.entries.stop_limit_max_slip_pct);
                    (
                        json!({
                            "conid": conid,
                            "orderType": "STOP_LIMIT",
                            "side": "BUY",
                            "quantity": qty,
                            "price": limit,
                            "auxPrice": stop_price,
                            "tif": self.entries.tif.to_uppercase(),
                            "outsideRTH": false,
                        }),
                        OrderMeta {
                            symbol,
                            side: Side::Buy,
                            order_type: "stop_limit",
                            qty,
                            stop_price: Some(stop_price),
                            limit_price: Some(limit),
                            trail_percent: None,
                        },
                    )
                }
            }
        };

        match self.submit(body, meta).await {
            Ok(order) => {
                info!(symbol = %symbol, order_id = %order.id, qty, stop_price, "entry_order_submitted");
                Ok(Some(order))
            }
            Err(err) => absorb_rejection(err, "entry_order"),
        }
    }

    async fn place_trailing_stop(
        &self,
        symbol: &Symbol,
        qty: f64,
        ref_price: f64,
    ) -> BrokerResult<Option<BrokerOrder>> {
        let conid = self.conid(symbol).await?;
        let trail_pct = self.stops.trailing_stop_pct;

        let (body, meta) = if symbol.is_crypto() {
            let exit = fixed_exit_price(ref_price, trail_pct);
            (
                json!({
                    "conid": conid,
                    "orderType": "LMT",
                    "side": "SELL",
                    "quantity": qty,
                    "price": exit,
                    "tif": "GTC",
                }),
                OrderMeta {
                    symbol,
                    side: Side::Sell,
                    order_type: "limit",
                    qty,
                    stop_price: None,
                    limit_price: Some(exit),
                    trail_percent: None,
                },
            )
        } else if self.stops.use_trailing_limit {
            // Trailing stop-limit: the limit trails the trigger by a
            // fixed offset expressed as a percentage of the reference
            let offset = round_to_tick(ref_price * self.stops.trail_limit_offset_pct / 100.0);
            (
                json!({
                    "conid": conid,
                    "orderType": "TRAILLMT",
                    "side": "SELL",
                    "quantity": qty,
                    "price": offset,
                    "trailingAmt": trail_pct,
                    "trailingType": "%",
                    "tif": self.stops.tif.to_uppercase(),
                }),
                OrderMeta {
                    symbol,
                    side: Side::Sell,
                    order_type: "trailing_stop_limit",
                    qty,
                    stop_price: None,
                    limit_price: None,
                    trail_percent: Some(trail_pct),
                },
            )
        } else {
            (
                json!({
                    "conid": conid,
                    "orderType": "TRAIL",
                    "side": "SELL",
                    "quantity": qty,
                    "trailingAmt": trail_pct,
                    "trailingType": "%",
                    "tif": self.stops.tif.to_uppercase(),
                }),
                OrderMeta {
                    symbol,
                    side: Side::Sell,
                    order_type: "trailing_stop",
                    qty,
                    stop_price: None,
                    limit_price: None,
                    trail_percent: Some(trail_pct),
                },
            )
        };

        match self.submit(body, meta).await {
            Ok(order) => {
                info!(symbol = %symbol, order_id = %order.id, qty, trail_pct, "trailing_stop_submitted");
                Ok(Some(order))
            }
            Err(err) => absorb_rejection(err, "trailing_stop"),
        }
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()> {
        let account = self.account_id()?;
        let url = format!("{}/iserver/account/{}/order/{}", self.base, account, order_id);
        let resp = self.client.delete(&url).send().await?;
        if !resp.status().is_success() && resp.status().as_u16() != 404 {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(BrokerError::Api { status, message });
        }
        self.lock_tracker().untrack(order_id);
        info!(order_id, "order_cancelled");
        Ok(())
    }

    async fn positions(&self) -> BrokerResult<HashMap<String, BrokerPosition>> {
        let account = self.account_id()?;
        let url = format!("{}/portfolio/{}/positions/0", self.base, account);
        let resp = self.client.get(&url).send().await?;
        let raw: Vec<RawPosition> = check(resp).await?;

        Ok(raw
            .into_iter()
            .filter(|p| p.position > 0.0)
            .filter_map(|p| {
                let symbol = p.ticker.or(p.contract_desc)?;
                Some((
                    symbol.to_uppercase(),
                    BrokerPosition {
                        qty: p.position,
                        avg_cost: p.avg_cost.unwrap_or(0.0),
                        market_value: p.mkt_value.unwrap_or(0.0),
                    },
                ))
            })
            .collect())
    }

    async fn open_orders(&self) -> BrokerResult<Vec<BrokerOrder>> {
        let orders = self.list_orders().await?;
        let open: Vec<BrokerOrder> = orders
            .into_iter()
            .filter(|o| is_open_status(&o.status))
            .collect();
        let mut tracker = self.lock_tracker();
        for order in &open {
            tracker.track(order);
        }
        Ok(open)
    }

    async fn account_value(&self) -> BrokerResult<Option<f64>> {
        Ok(self.account_summary().await?.get("NetLiquidation").copied())
    }

    async fn account_summary(&self) -> BrokerResult<HashMap<String, f64>> {
        let account = self.account_id()?;
        let url = format!("{}/portfolio/{}/summary", self.base, account);
        let resp = self.client.get(&url).send().await?;
        let raw: HashMap<String, Value> = check(resp).await?;

        let tags = [
            ("netliquidation", "NetLiquidation"),
            ("totalcashvalue", "TotalCashValue"),
            ("grosspositionvalue", "GrossPositionValue"),
            ("unrealizedpnl", "UnrealizedPnL"),
            ("realizedpnl", "RealizedPnL"),
            ("availablefunds", "AvailableFunds"),
            ("buyingpower", "BuyingPower"),
        ];

        let mut summary = HashMap::new();
        for (key, tag) in tags {
            if let Some(amount) = raw
                .get(key)
                .and_then(|v| v.get("amount"))
                .and_then(Value::as_f64)
            {
                summary.insert(tag.to_string(), amount);
            }
        }
        Ok(summary)
    }

    async fn poll_events(&self) -> BrokerResult<Vec<BrokerEvent>> {
        let orders = self.list_orders().await?;
        Ok(self.lock_tracker().observe(&orders))
    }

    async fn keep_alive(&self) {
        let url = format!("{}/tickle", self.base);
        match self.client.post(&url).send().await {
            Ok(resp) if resp.status().is_success() => debug!("keepalive_tickle"),
            Ok(resp) => warn!(status = resp.status().as_u16(), "keepalive_unexpected_status"),
            Err(err) => warn!(error = %err, "keepalive_failed"),
        }
    }

    async fn close_all_positions(&self) -> BrokerResult<()> {
        // The gateway has no close-all endpoint; flatten with market sells
        let positions = self.positions().await?;
        for (symbol, position) in positions {
            let symbol = Symbol::new(&symbol);
            let conid = self.conid(&symbol).await?;
            let body = json!({
                "conid": conid,
                "orderType": "MKT",
                "side": "SELL",
                "quantity": position.qty,
                "tif": "DAY",
            });
            let meta = OrderMeta {
                symbol: &symbol,
                side: Side::Sell,
                order_type: "market",
                qty: position.qty,
                stop_price: None,
                limit_price: None,
                trail_percent: None,
            };
            if let Err(err) = self.submit(body, meta).await {
                warn!(symbol = %symbol, error = %err, "close_position_failed");
            }
        }
        info!("closed_all_positions");
        Ok(())
    }

    async fn cancel_all_orders(&self) -> BrokerResult<()> {
        let orders = self.open_orders().await?;
        for order in orders {
            if let Err(err) = self.cancel_order(&order.id).await {
                warn!(order_id = %order.id, error = %err, "cancel_failed");
            }
        }
        info!("cancelled_all_orders");
        Ok(())
    }
}

impl IbkrBroker {
    /// Today's orders as the gateway reports them, statuses normalized.
    async fn list_orders(&self) -> BrokerResult<Vec<BrokerOrder>> {
        self.account_id()?;
        let url = format!("{}/iserver/account/orders", self.base);
        let resp = self.client.get(&url).send().await?;
        let raw: RawLiveOrders = check(resp).await?;

        Ok(raw
            .orders
            .into_iter()
            .filter_map(|o| {
                let id = value_to_string(&o.order_id)?;
                let symbol = o.ticker.or(o.contract_desc)?;
                let side = match o.side.as_deref() {
                    Some(s) if s.starts_with('S') || s.starts_with('s') => Side::Sell,
                    _ => Side::Buy,
                };
                Some(BrokerOrder {
                    id,
                    symbol: symbol.to_uppercase(),
                    side,
                    order_type: o
                        .order_type
                        .as_deref()
                        .map(|t| t.to_lowercase().replace(' ', "_"))
                        .unwrap_or_default(),
                    status: o
                        .status
                        .as_deref()
                        .map(normalize_status)
                        .unwrap_or_else(|| "submitted".to_string()),
                    qty: o.total_size.as_ref().and_then(value_to_f64).unwrap_or(0.0),
                    filled_qty: o
                        .filled_quantity
                        .as_ref()
                        .and_then(value_to_f64)
                        .unwrap_or(0.0),
                    filled_avg_price: o.avg_price.as_ref().and_then(value_to_f64),
                    stop_price: o.aux_price.as_ref().and_then(value_to_f64),
                    limit_price: o.price.as_ref().and_then(value_to_f64),
                    trail_percent: None,
                })
            })
            .collect())
    }
}

// =============================================================================
// Wire types — the gateway is loose with number/string typing, so most
// numerics come through as serde_json::Value
// =============================================================================

#[derive(Debug, Deserialize)]
struct RawAccounts {
    accounts: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawSecdef {
    conid: Value,
}

#[derive(Debug, Deserialize)]
struct RawPosition {
    #[serde(default)]
    ticker: Option<String>,
    #[serde(default, rename = "contractDesc")]
    contract_desc: Option<String>,
    #[serde(default)]
    position: f64,
    #[serde(default, rename = "avgCost")]
    avg_cost: Option<f64>,
    #[serde(default, rename = "mktValue")]
    mkt_value: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawLiveOrders {
    #[serde(default)]
    orders: Vec<RawLiveOrder>,
}

#[derive(Debug, Deserialize)]
struct RawLiveOrder {
    #[serde(default, rename = "orderId")]
    order_id: Value,
    #[serde(default)]
    ticker: Option<String>,
    #[serde(default, rename = "contractDesc")]
    contract_desc: Option<String>,
    #[serde(default)]
    side: Option<String>,
    #[serde(default, rename = "orderType")]
    order_type: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, rename = "totalSize")]
    total_size: Option<Value>,
    #[serde(default, rename = "filledQuantity")]
    filled_quantity: Option<Value>,
    #[serde(default, rename = "avgPrice")]
    avg_price: Option<Value>,
    #[serde(default)]
    price: Option<Value>,
    #[serde(default, rename = "auxPrice")]
    aux_price: Option<Value>,
}

fn value_to_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn value_to_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn value_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
