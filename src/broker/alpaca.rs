//! Alpaca REST adapter
//!
//! Trading API plus the market-data API for latest quotes. Paper and
//! live modes differ only in the trading base URL. Alpaca has no event
//! stream we rely on; fills are reconstructed by polling recent orders
//! through the shared [`OrderTracker`].

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    breakout_stop_price, fixed_exit_price, slip_limit_price, Broker, BrokerError, BrokerEvent,
    BrokerOrder, BrokerPosition, BrokerResult,
};
use crate::config::{BotConfig, EntriesConfig, EntryType, StopsConfig, TradingMode};
use crate::reconcile::OrderTracker;
use crate::types::{Side, Symbol};

const PAPER_BASE_URL: &str = "https://paper-api.alpaca.markets";
const LIVE_BASE_URL: &str = "https://api.alpaca.markets";
const DATA_BASE_URL: &str = "https://data.alpaca.markets";

pub struct AlpacaBroker {
    client: reqwest::Client,
    trading_base: String,
    data_base: String,
    api_key: String,
    api_secret: String,
    entries: EntriesConfig,
    stops: StopsConfig,
    connected: bool,
    tracker: Mutex<OrderTracker>,
}

impl AlpacaBroker {
    pub fn new(config: &BotConfig) -> anyhow::Result<Self> {
        let api_key = config
            .alpaca
            .api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("missing Alpaca API key (APCA_API_KEY_ID)"))?;
        let api_secret = config
            .alpaca
            .api_secret
            .clone()
            .ok_or_else(|| anyhow::anyhow!("missing Alpaca API secret (APCA_API_SECRET_KEY)"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(AlpacaBroker {
            client,
            trading_base: match config.mode {
                TradingMode::Paper => PAPER_BASE_URL.to_string(),
                TradingMode::Live => LIVE_BASE_URL.to_string(),
            },
            data_base: DATA_BASE_URL.to_string(),
            api_key,
            api_secret,
            entries: config.entries.clone(),
            stops: config.stops.clone(),
            connected: false,
            tracker: Mutex::new(OrderTracker::new()),
        })
    }

    fn ensure_connected(&self) -> BrokerResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("APCA-API-KEY-ID", &self.api_key)
            .header("APCA-API-SECRET-KEY", &self.api_secret)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> BrokerResult<T> {
        let resp = self.authed(self.client.get(url)).send().await?;
        decode(resp).await
    }

    async fn submit_order(&self, body: &OrderBody) -> BrokerResult<BrokerOrder> {
        let url = format!("{}/v2/orders", self.trading_base);
        let resp = self.authed(self.client.post(&url)).json(body).send().await?;
        let raw: RawOrder = decode(resp).await?;
        let order = raw.into_order();
        self.lock_tracker().track(&order);
        Ok(order)
    }

    fn lock_tracker(&self) -> std::sync::MutexGuard<'_, OrderTracker> {
        self.tracker.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Entry policy: equities break out through a stop (or stop-limit)
    /// order for the session; crypto venues don't take stops, so the
    /// entry is a limit at the breakout price, GTC.
    fn entry_body(&self, symbol: &Symbol, qty: f64, last_price: f64) -> OrderBody {
        let stop_price = breakout_stop_price(last_price, self.entries.buy_stop_pct_above_last);

        if symbol.is_crypto() {
            return OrderBody {
                symbol: symbol.as_str().to_string(),
                qty: qty.to_string(),
                side: "buy".to_string(),
                order_type: "limit".to_string(),
                time_in_force: "gtc".to_string(),
                stop_price: None,
                limit_price: Some(stop_price.to_string()),
                trail_percent: None,
                extended_hours: None,
            };
        }

        let (order_type, limit_price) = match self.entries.r#type {
            EntryType::BuyStop => ("stop".to_string(), None),
            EntryType::BuyStopLimit => (
                "stop_limit".to_string(),
                Some(
                    slip_limit_price(stop_price, self.entries.stop_limit_max_slip_pct).to_string(),
                ),
            ),
        };

        OrderBody {
            symbol: symbol.as_str().to_string(),
            qty: qty.to_string(),
            side: "buy".to_string(),
            order_type,
            time_in_force: self.entries.tif.to_lowercase(),
            stop_price: Some(stop_price.to_string()),
            limit_price,
            trail_percent: None,
            extended_hours: Some(false),
        }
    }

    /// Exit policy: equities get a native trailing stop, GTC. Crypto
    /// gets a fixed limit sell at the would-be stop level.
    fn stop_body(&self, symbol: &Symbol, qty: f64, ref_price: f64) -> OrderBody {
        if symbol.is_crypto() {
            let exit = fixed_exit_price(ref_price, self.stops.trailing_stop_pct);
            return OrderBody {
                symbol: symbol.as_str().to_string(),
                qty: qty.to_string(),
                side: "sell".to_string(),
                order_type: "limit".to_string(),
                time_in_force: "gtc".to_string(),
                stop_price: None,
                limit_price: Some(exit.to_string()),
                trail_percent: None,
                extended_hours: None,
            };
        }

        // Alpaca has no trailing stop-limit; use_trailing_limit only
        // changes behavior on brokers that support it.
        OrderBody {
            symbol: symbol.as_str().to_string(),
            qty: qty.to_string(),
            side: "sell".to_string(),
            order_type: "trailing_stop".to_string(),
            time_in_force: self.stops.tif.to_lowercase(),
            stop_price: None,
            limit_price: None,
            trail_percent: Some(self.stops.trailing_stop_pct.to_string()),
            extended_hours: None,
        }
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> BrokerResult<T> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json::<T>().await?);
    }
    let message = resp.text().await.unwrap_or_default();
    if status.as_u16() == 422 || status.as_u16() == 403 {
        Err(BrokerError::Rejected(message))
    } else {
        Err(BrokerError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

/// Submission failures that are not transient become `Ok(None)`: the
/// caller logs, records a rejected event, and the next tick re-evaluates
/// from a clean slate.
fn absorb_rejection(err: BrokerError, what: &str) -> BrokerResult<Option<BrokerOrder>> {
    if err.is_transient() {
        Err(err)
    } else {
        warn!(error = %err, "{}_rejected", what);
        Ok(None)
    }
}

#[async_trait]
impl Broker for AlpacaBroker {
    async fn connect(&mut self) -> BrokerResult<()> {
        let url = format!("{}/v2/account", self.trading_base);
        let resp = self.authed(self.client.get(&url)).send().await?;
        let account: RawAccount = decode(resp).await?;
        self.connected = true;
        info!(
            account_number = account.account_number.as_deref().unwrap_or("?"),
            status = account.status.as_deref().unwrap_or("?"),
            paper = self.trading_base == PAPER_BASE_URL,
            "alpaca_connected"
        );
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
        info!("alpaca_disconnected");
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn last_price(&self, symbol: &Symbol) -> BrokerResult<Option<f64>> {
        self.ensure_connected()?;
        let (bid, ask) = if symbol.is_crypto() {
            let url = format!("{}/v1beta3/crypto/us/latest/quotes", self.data_base);
            let resp = self
                .authed(self.client.get(&url))
                .query(&[("symbols", symbol.as_str())])
                .send()
                .await?;
            let quotes: RawCryptoQuotes = decode(resp).await?;
            match quotes.quotes.get(symbol.as_str()) {
                Some(q) => (q.bp, q.ap),
                None => return Ok(None),
            }
        } else {
            let url = format!(
                "{}/v2/stocks/{}/quotes/latest",
                self.data_base,
                symbol.as_str()
            );
            let quote: RawStockQuote = self.get_json(&url).await?;
            (quote.quote.bp, quote.quote.ap)
        };

        // Quote midpoint beats a stale last-trade print
        let price = match (bid > 0.0, ask > 0.0) {
            (true, true) => Some((bid + ask) / 2.0),
            (false, true) => Some(ask),
            (true, false) => Some(bid),
            (false, false) => None,
        };
        debug!(symbol = %symbol, ?price, "price_fetched");
        Ok(price)
    }

    async fn place_entry(
        &self,
        symbol: &Symbol,
        qty: f64,
        last_price: f64,
    ) -> BrokerResult<Option<BrokerOrder>> {
        self.ensure_connected()?;
        let body = self.entry_body(symbol, qty, last_price);
        match self.submit_order(&body).await {
            Ok(order) => {
                info!(
                    symbol = %symbol,
                    order_id = %order.id,
                    qty,
                    stop_price = ?order.stop_price,
                    order_type = %order.order_type,
                    "entry_order_submitted"
                );
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
        self.ensure_connected()?;
        let body = self.stop_body(symbol, qty, ref_price);
        match self.submit_order(&body).await {
            Ok(order) => {
                info!(
                    symbol = %symbol,
                    order_id = %order.id,
                    qty,
                    trail_percent = ?order.trail_percent,
                    limit_price = ?order.limit_price,
                    "trailing_stop_submitted"
                );
                Ok(Some(order))
            }
            Err(err) => absorb_rejection(err, "trailing_stop"),
        }
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()> {
        self.ensure_connected()?;
        let url = format!("{}/v2/orders/{}", self.trading_base, order_id);
        let resp = self.authed(self.client.delete(&url)).send().await?;
        // 404 means the order is already gone, which is what we wanted
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
        self.ensure_connected()?;
        let url = format!("{}/v2/positions", self.trading_base);
        let raw: Vec<RawPosition> = self.get_json(&url).await?;
        Ok(raw
            .into_iter()
            .map(|p| {
                (
                    p.symbol.clone(),
                    BrokerPosition {
                        qty: parse_num(&p.qty),
                        avg_cost: parse_num(&p.avg_entry_price),
                        market_value: parse_num(&p.market_value),
                    },
                )
            })
            .collect())
    }

    async fn open_orders(&self) -> BrokerResult<Vec<BrokerOrder>> {
        self.ensure_connected()?;
        let url = format!("{}/v2/orders?status=open&limit=200", self.trading_base);
        let raw: Vec<RawOrder> = self.get_json(&url).await?;
        let orders: Vec<BrokerOrder> = raw.into_iter().map(RawOrder::into_order).collect();
        let mut tracker = self.lock_tracker();
        for order in &orders {
            tracker.track(order);
        }
        Ok(orders)
    }

    async fn account_value(&self) -> BrokerResult<Option<f64>> {
        self.ensure_connected()?;
        let url = format!("{}/v2/account", self.trading_base);
        let account: RawAccount = self.get_json(&url).await?;
        Ok(account.equity.as_deref().map(parse_num))
    }

    async fn account_summary(&self) -> BrokerResult<HashMap<String, f64>> {
        self.ensure_connected()?;
        let url = format!("{}/v2/account", self.trading_base);
        let account: RawAccount = self.get_json(&url).await?;

        let mut summary = HashMap::new();
        let equity = account.equity.as_deref().map(parse_num);
        if let Some(equity) = equity {
            summary.insert("NetLiquidation".to_string(), equity);
        }
        if let Some(cash) = account.cash.as_deref().map(parse_num) {
            summary.insert("TotalCashValue".to_string(), cash);
            summary.insert("AvailableFunds".to_string(), cash);
        }
        if let Some(v) = account.long_market_value.as_deref().map(parse_num) {
            summary.insert("GrossPositionValue".to_string(), v);
        }
        if let Some(v) = account.unrealized_pl.as_deref().map(parse_num) {
            summary.insert("UnrealizedPnL".to_string(), v);
        }
        if let (Some(equity), Some(last)) = (equity, account.last_equity.as_deref().map(parse_num))
        {
            summary.insert("RealizedPnL".to_string(), equity - last);
        }
        if let Some(v) = account.buying_power.as_deref().map(parse_num) {
            summary.insert("BuyingPower".to_string(), v);
        }
        Ok(summary)
    }

    async fn poll_events(&self) -> BrokerResult<Vec<BrokerEvent>> {
        self.ensure_connected()?;
        let closed_url = format!("{}/v2/orders?status=closed&limit=50", self.trading_base);
        let open_url = format!("{}/v2/orders?status=open&limit=200", self.trading_base);

        let mut listed: Vec<BrokerOrder> = self
            .get_json::<Vec<RawOrder>>(&closed_url)
            .await?
            .into_iter()
            .map(RawOrder::into_order)
            .collect();
        listed.extend(
            self.get_json::<Vec<RawOrder>>(&open_url)
                .await?
                .into_iter()
                .map(RawOrder::into_order),
        );

        Ok(self.lock_tracker().observe(&listed))
    }

    async fn keep_alive(&self) {
        let url = format!("{}/v2/account", self.trading_base);
        match self.get_json::<RawAccount>(&url).await {
            Ok(account) => {
                debug!(status = account.status.as_deref().unwrap_or("?"), "keepalive_ping")
            }
            Err(err) => warn!(error = %err, "keepalive_failed"),
        }
    }

    async fn close_all_positions(&self) -> BrokerResult<()> {
        self.ensure_connected()?;
        let url = format!(
            "{}/v2/positions?cancel_orders=true",
            self.trading_base
        );
        let resp = self.authed(self.client.delete(&url)).send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(BrokerError::Api { status, message });
        }
        info!("closed_all_positions");
        Ok(())
    }

    async fn cancel_all_orders(&self) -> BrokerResult<()> {
        self.ensure_connected()?;
        let url = format!("{}/v2/orders", self.trading_base);
        let resp = self.authed(self.client.delete(&url)).send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(BrokerError::Api { status, message });
        }
        info!("cancelled_all_orders");
        Ok(())
    }
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Serialize)]
struct OrderBody {
    symbol: String,
    qty: String,
    side: String,
    #[serde(rename = "type")]
    order_type: String,
    time_in_force: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    trail_percent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    extended_hours: Option<bool>,
}

/// Alpaca serializes numbers as strings on most order/account fields.
#[derive(Debug, Deserialize)]
struct RawOrder {
    id: String,
    symbol: String,
    side: String,
    #[serde(rename = "type")]
    order_type: String,
    status: String,
    qty: Option<String>,
    filled_qty: Option<String>,
    filled_avg_price: Option<String>,
    stop_price: Option<String>,
    limit_price: Option<String>,
    trail_percent: Option<String>,
}

impl RawOrder {
    fn into_order(self) -> BrokerOrder {
        BrokerOrder {
            side: self.side.parse().unwrap_or(Side::Buy),
            id: self.id,
            symbol: self.symbol,
            order_type: self.order_type.to_lowercase(),
            status: self.status.to_lowercase(),
            qty: self.qty.as_deref().map(parse_num).unwrap_or(0.0),
            filled_qty: self.filled_qty.as_deref().map(parse_num).unwrap_or(0.0),
            filled_avg_price: self.filled_avg_price.as_deref().map(parse_num),
            stop_price: self.stop_price.as_deref().map(parse_num),
            limit_price: self.limit_price.as_deref().map(parse_num),
            trail_percent: self.trail_percent.as_deref().map(parse_num),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawPosition {
    symbol: String,
    qty: String,
    avg_entry_price: String,
    market_value: String,
}

#[derive(Debug, Deserialize)]
struct RawAccount {
    account_number: Option<String>,
    status: Option<String>,
    equity: Option<String>,
    last_equity: Option<String>,
    cash: Option<String>,
    long_market_value: Option<String>,
    unrealized_pl: Option<String>,
    buying_power: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStockQuote {
    quote: RawQuote,
}

#[derive(Debug, Deserialize)]
struct RawCryptoQuotes {
    quotes: HashMap<String, RawQuote>,
}

#[derive(Debug, Default, Deserialize)]
struct RawQuote {
    #[serde(default)]
    ap: f64,
    #[serde(default)]
    bp: f64,
}

fn parse_num(s: impl AsRef<str>) -> f64 {
    s.as_ref().parse().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker() -> AlpacaBroker {
        let mut config: BotConfig = serde_yaml::from_str(
            r#"
mode: paper
watchlist: [TSLA]
crypto_watchlist: [btc]
alpaca:
  api_key: key
  api_secret: secret
"#,
        )
        .unwrap();
        config.normalize().unwrap();
        AlpacaBroker::new(&config).unwrap()
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let mut config: BotConfig =
            serde_yaml::from_str("mode: paper\nwatchlist: [TSLA]\n").unwrap();
        config.normalize().unwrap();
        // Only fails when the env vars are absent too, which is the case
        // in the test environment
        if std::env::var("APCA_API_KEY_ID").is_err() {
            assert!(AlpacaBroker::new(&config).is_err());
        }
    }

    #[test]
    fn test_equity_entry_body() {
        let b = broker();
        let body = b.entry_body(&Symbol::equity("TSLA"), 10.0, 100.0);
        assert_eq!(body.order_type, "stop");
        assert_eq!(body.side, "buy");
        assert_eq!(body.time_in_force, "day");
        assert_eq!(body.stop_price.as_deref(), Some("105"));
        assert!(body.limit_price.is_none());
        assert_eq!(body.extended_hours, Some(false));
    }

    #[test]
    fn test_equity_stop_limit_entry_body() {
        let mut b = broker();
        b.entries.r#type = EntryType::BuyStopLimit;
        let body = b.entry_body(&Symbol::equity("TSLA"), 10.0, 100.0);
        assert_eq!(body.order_type, "stop_limit");
        assert_eq!(body.stop_price.as_deref(), Some("105"));
        // 105 * 1.01 = 106.05
        assert_eq!(body.limit_price.as_deref(), Some("106.05"));
    }

    #[test]
    fn test_crypto_entry_is_limit_gtc() {
        let b = broker();
        let body = b.entry_body(&Symbol::crypto("btc"), 0.025, 40_000.0);
        assert_eq!(body.order_type, "limit");
        assert_eq!(body.time_in_force, "gtc");
        assert_eq!(body.limit_price.as_deref(), Some("42000"));
        assert!(body.stop_price.is_none());
        assert!(body.extended_hours.is_none());
    }

    #[test]
    fn test_equity_trailing_stop_body() {
        let b = broker();
        let body = b.stop_body(&Symbol::equity("TSLA"), 10.0, 250.0);
        assert_eq!(body.order_type, "trailing_stop");
        assert_eq!(body.side, "sell");
        assert_eq!(body.time_in_force, "gtc");
        assert_eq!(body.trail_percent.as_deref(), Some("10"));
    }

    #[test]
    fn test_crypto_exit_is_fixed_limit() {
        let b = broker();
        let body = b.stop_body(&Symbol::crypto("btc"), 0.025, 40_000.0);
        assert_eq!(body.order_type, "limit");
        assert_eq!(body.side, "sell");
        assert_eq!(body.limit_price.as_deref(), Some("36000"));
        assert!(body.trail_percent.is_none());
    }

    #[test]
    fn test_raw_order_parsing() {
        let raw: RawOrder = serde_json::from_str(
            r#"{
                "id": "61e69015-8549-4bfd-b9c3-01e75843f47d",
                "symbol": "TSLA",
                "side": "buy",
                "type": "stop",
                "status": "New",
                "qty": "10",
                "filled_qty": "0",
                "filled_avg_price": null,
                "stop_price": "105.00",
                "limit_price": null,
                "trail_percent": null
            }"#,
        )
        .unwrap();
        let order = raw.into_order();
        assert_eq!(order.side, Side::Buy);
        assert_eq!(order.status, "new");
        assert_eq!(order.qty, 10.0);
        assert_eq!(order.stop_price, Some(105.0));
        assert_eq!(order.filled_avg_price, None);
    }
}
