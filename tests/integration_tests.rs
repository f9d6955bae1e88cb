//! End-to-end scenarios for the symbol state machine against a mock
//! broker: breakout entries, stop-out cooldowns, duplicate-stop cleanup,
//! exposure gating, and fill idempotency.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use breakout_bot::broker::{
    breakout_stop_price, fixed_exit_price, Broker, BrokerEvent, BrokerOrder, BrokerPosition,
    BrokerResult, FillEvent,
};
use breakout_bot::config::BotConfig;
use breakout_bot::controller::{SymbolController, SymbolStatus, TickContext};
use breakout_bot::sizing::PositionSizer;
use breakout_bot::store::{StatePatch, Store};
use breakout_bot::types::{Side, Symbol};
use breakout_bot::TradingBot;

// =============================================================================
// Mock broker
// =============================================================================

#[derive(Default)]
struct MockState {
    prices: HashMap<String, f64>,
    positions: HashMap<String, BrokerPosition>,
    open_orders: Vec<BrokerOrder>,
    submitted: Vec<BrokerOrder>,
    cancelled: Vec<String>,
    next_id: u64,
    reject_orders: bool,
}

/// Clones share state, so a test can keep a handle while the bot owns
/// the boxed copy.
#[derive(Clone)]
struct MockBroker {
    state: Arc<Mutex<MockState>>,
    entry_pct: f64,
    trail_pct: f64,
}

impl MockBroker {
    fn new() -> Self {
        MockBroker {
            state: Arc::new(Mutex::new(MockState::default())),
            entry_pct: 5.0,
            trail_pct: 10.0,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    fn set_price(&self, symbol: &str, price: f64) {
        self.lock().prices.insert(symbol.to_string(), price);
    }

    fn set_position(&self, symbol: &str, qty: f64, price: f64) {
        self.lock().positions.insert(
            symbol.to_string(),
            BrokerPosition {
                qty,
                avg_cost: price,
                market_value: qty * price,
            },
        );
    }

    fn add_open_order(&self, order: BrokerOrder) {
        self.lock().open_orders.push(order);
    }

    fn submitted(&self) -> Vec<BrokerOrder> {
        self.lock().submitted.clone()
    }

    fn cancelled(&self) -> Vec<String> {
        self.lock().cancelled.clone()
    }

    fn make_order(
        state: &mut MockState,
        symbol: &Symbol,
        side: Side,
        order_type: &str,
        qty: f64,
        stop_price: Option<f64>,
        limit_price: Option<f64>,
        trail_percent: Option<f64>,
    ) -> BrokerOrder {
        state.next_id += 1;
        BrokerOrder {
            id: format!("mock-{}", state.next_id),
            symbol: symbol.as_str().to_string(),
            side,
            order_type: order_type.to_string(),
            status: "new".to_string(),
            qty,
            filled_qty: 0.0,
            filled_avg_price: None,
            stop_price,
            limit_price,
            trail_percent,
        }
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn connect(&mut self) -> BrokerResult<()> {
        Ok(())
    }

    async fn disconnect(&mut self) {}

    fn is_connected(&self) -> bool {
        true
    }

    async fn last_price(&self, symbol: &Symbol) -> BrokerResult<Option<f64>> {
        Ok(self.lock().prices.get(symbol.as_str()).copied())
    }

    async fn place_entry(
        &self,
        symbol: &Symbol,
        qty: f64,
        last_price: f64,
    ) -> BrokerResult<Option<BrokerOrder>> {
        let mut state = self.lock();
        if state.reject_orders {
            return Ok(None);
        }
        let stop = breakout_stop_price(last_price, self.entry_pct);
        let order = if symbol.is_crypto() {
            MockBroker::make_order(
                &mut state,
                symbol,
                Side::Buy,
                "limit",
                qty,
                None,
                Some(stop),
                None,
            )
        } else {
            MockBroker::make_order(
                &mut state,
                symbol,
                Side::Buy,
                "stop",
                qty,
                Some(stop),
                None,
                None,
            )
        };
        state.submitted.push(order.clone());
        state.open_orders.push(order.clone());
        Ok(Some(order))
    }

    async fn place_trailing_stop(
        &self,
        symbol: &Symbol,
        qty: f64,
        ref_price: f64,
    ) -> BrokerResult<Option<BrokerOrder>> {
        let mut state = self.lock();
        if state.reject_orders {
            return Ok(None);
        }
        let order = if symbol.is_crypto() {
            let exit = fixed_exit_price(ref_price, self.trail_pct);
            MockBroker::make_order(
                &mut state,
                symbol,
                Side::Sell,
                "limit",
                qty,
                None,
                Some(exit),
                None,
            )
        } else {
            MockBroker::make_order(
                &mut state,
                symbol,
                Side::Sell,
                "trailing_stop",
                qty,
                None,
                None,
                Some(self.trail_pct),
            )
        };
        state.submitted.push(order.clone());
        state.open_orders.push(order.clone());
        Ok(Some(order))
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()> {
        let mut state = self.lock();
        state.cancelled.push(order_id.to_string());
        state.open_orders.retain(|o| o.id != order_id);
        Ok(())
    }

    async fn positions(&self) -> BrokerResult<HashMap<String, BrokerPosition>> {
        Ok(self.lock().positions.clone())
    }

    async fn open_orders(&self) -> BrokerResult<Vec<BrokerOrder>> {
        Ok(self.lock().open_orders.clone())
    }

    async fn account_value(&self) -> BrokerResult<Option<f64>> {
        Ok(Some(100_000.0))
    }

    async fn account_summary(&self) -> BrokerResult<HashMap<String, f64>> {
        Ok(HashMap::from([
            ("NetLiquidation".to_string(), 100_000.0),
            ("TotalCashValue".to_string(), 80_000.0),
        ]))
    }

    async fn poll_events(&self) -> BrokerResult<Vec<BrokerEvent>> {
        Ok(Vec::new())
    }

    async fn keep_alive(&self) {}

    async fn close_all_positions(&self) -> BrokerResult<()> {
        Ok(())
    }

    async fn cancel_all_orders(&self) -> BrokerResult<()> {
        Ok(())
    }
}

// =============================================================================
// Fixtures
// =============================================================================

const CONFIG_YAML: &str = r#"
mode: paper
watchlist: [TSLA]
allocation:
  total_usd_cap: 20000
  per_symbol_usd: 1000
  min_cash_reserve_percent: 0
  allow_fractional: false
entries:
  type: buy_stop
  buy_stop_pct_above_last: 5.0
  stop_limit_max_slip_pct: 1.0
  tif: day
  cancel_at_close: true
  rearm_next_session: true
stops:
  trailing_stop_pct: 10.0
  use_trailing_limit: false
  trail_limit_offset_pct: 0.2
  tif: gtc
risk:
  max_total_exposure_usd: 20000
  max_symbol_exposure_usd: 2000
persistence:
  db_url: "sqlite::memory:"
"#;

fn config() -> BotConfig {
    let mut config: BotConfig = serde_yaml::from_str(CONFIG_YAML).unwrap();
    config.normalize().unwrap();
    config
}

struct Harness {
    controller: SymbolController,
    store: Store,
    broker: MockBroker,
}

fn harness() -> Harness {
    let config = Arc::new(config());
    let store = Store::open("sqlite::memory:").unwrap();
    let sizer = PositionSizer::from_config(&config);
    let controller = SymbolController::new(
        Symbol::equity("TSLA"),
        config.clone(),
        store.clone(),
        sizer,
    );
    Harness {
        controller,
        store,
        broker: MockBroker::new(),
    }
}

fn trailing_stop(id: &str, symbol: &str, qty: f64) -> BrokerOrder {
    BrokerOrder {
        id: id.to_string(),
        symbol: symbol.to_string(),
        side: Side::Sell,
        order_type: "trailing_stop".to_string(),
        status: "new".to_string(),
        qty,
        filled_qty: 0.0,
        filled_avg_price: None,
        stop_price: None,
        limit_price: None,
        trail_percent: Some(10.0),
    }
}

async fn run_tick(h: &Harness, positions: &HashMap<String, BrokerPosition>) {
    let open_orders = h.broker.open_orders().await.unwrap();
    let position_values: HashMap<String, f64> = positions
        .iter()
        .map(|(s, p)| (s.clone(), p.market_value))
        .collect();
    let ctx = TickContext {
        positions,
        open_orders: &open_orders,
        position_values: &position_values,
        account_value: Some(100_000.0),
    };
    h.controller.process(&h.broker, &ctx).await.unwrap();
}

// =============================================================================
// Scenarios
// =============================================================================

/// Gap-up entry: one tick in NO_POSITION submits exactly one BUY stop at
/// last * 1.05 for floor(allocation / last) shares, and persists the
/// order, state, and event.
#[tokio::test]
async fn gap_up_entry_submits_one_stop_order() {
    let h = harness();
    h.broker.set_price("TSLA", 100.0);

    run_tick(&h, &HashMap::new()).await;

    let submitted = h.broker.submitted();
    assert_eq!(submitted.len(), 1);
    let order = &submitted[0];
    assert_eq!(order.side, Side::Buy);
    assert_eq!(order.order_type, "stop");
    assert_eq!(order.qty, 10.0);
    assert_eq!(order.stop_price, Some(105.0));

    // Store: one order row, state points at the entry, event logged
    let orders = h.store.get_orders(None, 10).unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].order_id, order.id);
    assert_eq!(orders[0].side, "BUY");

    let state = h.store.get_symbol_state("TSLA").unwrap().unwrap();
    assert_eq!(state.last_parent_id.as_deref(), Some(order.id.as_str()));
    assert!(state.last_trail_id.is_none());

    let event = h.store.last_event().unwrap().unwrap();
    assert_eq!(event.event_type, "entry_order_placed");
    assert_eq!(event.payload.unwrap()["qty"], 10.0);
}

/// Once the entry is working, repeated ticks classify as ENTRY_PENDING
/// and never submit a second buy (at most one active entry per symbol).
#[tokio::test]
async fn pending_entry_blocks_duplicate_submission() {
    let h = harness();
    h.broker.set_price("TSLA", 100.0);

    run_tick(&h, &HashMap::new()).await;
    run_tick(&h, &HashMap::new()).await;
    run_tick(&h, &HashMap::new()).await;

    assert_eq!(h.broker.submitted().len(), 1);

    let open_orders = h.broker.open_orders().await.unwrap();
    let status = h
        .controller
        .status(Utc::now(), &HashMap::new(), &open_orders)
        .unwrap();
    assert_eq!(status, SymbolStatus::EntryPending);
}

/// A trailing-stop SELL fill starts the cooldown; the next tick
/// classifies as COOLDOWN and takes no action.
#[tokio::test]
async fn stop_out_enters_cooldown() {
    let h = harness();
    h.broker.set_price("TSLA", 225.0);

    h.controller.on_stop_out().unwrap();

    let state = h.store.get_symbol_state("TSLA").unwrap().unwrap();
    let until = state.cooldown_until.unwrap();
    let expected = Utc::now() + Duration::minutes(20);
    assert!((until - expected).num_seconds().abs() <= 2);

    let event = h.store.last_event().unwrap().unwrap();
    assert_eq!(event.event_type, "stopout_cooldown_started");

    run_tick(&h, &HashMap::new()).await;
    assert!(h.broker.submitted().is_empty());
    assert_eq!(
        h.controller
            .status(Utc::now(), &HashMap::new(), &[])
            .unwrap(),
        SymbolStatus::Cooldown
    );
}

/// An expired cooldown re-arms: the next tick classifies NO_POSITION and
/// submits a fresh entry.
#[tokio::test]
async fn cooldown_expiry_rearms() {
    let h = harness();
    h.broker.set_price("TSLA", 100.0);

    h.store
        .upsert_symbol_state(
            "TSLA",
            StatePatch {
                cooldown_until: Some(Utc::now() - Duration::minutes(1)),
                ..Default::default()
            },
        )
        .unwrap();

    assert_eq!(
        h.controller
            .status(Utc::now(), &HashMap::new(), &[])
            .unwrap(),
        SymbolStatus::NoPosition
    );

    run_tick(&h, &HashMap::new()).await;
    assert_eq!(h.broker.submitted().len(), 1);
}

/// Three duplicate trailing stops: keep the first, cancel the rest.
#[tokio::test]
async fn duplicate_stops_cleaned_up() {
    let h = harness();
    h.broker.set_position("TSLA", 10.0, 250.0);
    h.broker.add_open_order(trailing_stop("stop-1", "TSLA", 10.0));
    h.broker.add_open_order(trailing_stop("stop-2", "TSLA", 10.0));
    h.broker.add_open_order(trailing_stop("stop-3", "TSLA", 10.0));

    let positions = h.broker.positions().await.unwrap();
    run_tick(&h, &positions).await;

    let cancelled = h.broker.cancelled();
    assert_eq!(cancelled, vec!["stop-2".to_string(), "stop-3".to_string()]);
    assert!(h.broker.submitted().is_empty());

    let events = h.store.get_events(10).unwrap();
    let dup_events = events
        .iter()
        .filter(|e| e.event_type == "duplicate_stop_cancelled")
        .count();
    assert_eq!(dup_events, 2);
}

/// Stop sized for 5 against a position of 10: cancel and reissue at the
/// position quantity.
#[tokio::test]
async fn stop_quantity_mismatch_reissues() {
    let h = harness();
    h.broker.set_price("TSLA", 250.0);
    h.broker.set_position("TSLA", 10.0, 250.0);
    h.broker.add_open_order(trailing_stop("stop-1", "TSLA", 5.0));

    let positions = h.broker.positions().await.unwrap();
    run_tick(&h, &positions).await;

    assert_eq!(h.broker.cancelled(), vec!["stop-1".to_string()]);
    let submitted = h.broker.submitted();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].qty, 10.0);
    assert_eq!(submitted[0].order_type, "trailing_stop");

    let event = h.store.last_event().unwrap().unwrap();
    assert_eq!(event.event_type, "trailing_stop_adjusted");
    let payload = event.payload.unwrap();
    assert_eq!(payload["old_qty"], 5.0);
    assert_eq!(payload["new_qty"], 10.0);

    let state = h.store.get_symbol_state("TSLA").unwrap().unwrap();
    assert_eq!(state.last_trail_id.as_deref(), Some(submitted[0].id.as_str()));
}

/// Position with no protective stop at all: recreate it for the full
/// quantity.
#[tokio::test]
async fn missing_stop_recreated() {
    let h = harness();
    h.broker.set_price("TSLA", 250.0);
    h.broker.set_position("TSLA", 10.0, 250.0);

    let positions = h.broker.positions().await.unwrap();
    run_tick(&h, &positions).await;

    let submitted = h.broker.submitted();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].side, Side::Sell);
    assert_eq!(submitted[0].qty, 10.0);

    let event = h.store.last_event().unwrap().unwrap();
    assert_eq!(event.event_type, "trailing_stop_recreated");
}

/// A healthy single stop with matching quantity is left alone.
#[tokio::test]
async fn healthy_stop_untouched() {
    let h = harness();
    h.broker.set_position("TSLA", 10.0, 250.0);
    h.broker.add_open_order(trailing_stop("stop-1", "TSLA", 10.0));

    let positions = h.broker.positions().await.unwrap();
    run_tick(&h, &positions).await;

    assert!(h.broker.cancelled().is_empty());
    assert!(h.broker.submitted().is_empty());
}

/// Global exposure cap blocks the entry: sizer returns 0, nothing is
/// submitted.
#[tokio::test]
async fn exposure_cap_blocks_entry() {
    let h = harness();
    h.broker.set_price("TSLA", 100.0);
    h.broker.set_position("AAPL", 50.0, 200.0); // $10,000
    h.broker.set_position("MSFT", 25.0, 380.0); // $9,500

    let positions = h.broker.positions().await.unwrap();
    run_tick(&h, &positions).await;

    assert!(h.broker.submitted().is_empty());
    assert!(h.store.get_orders(None, 10).unwrap().is_empty());
}

/// Missing price feed: tick is a no-op, retried next time.
#[tokio::test]
async fn missing_price_skips_tick() {
    let h = harness();
    run_tick(&h, &HashMap::new()).await;
    assert!(h.broker.submitted().is_empty());
}

/// Broker rejection leaves symbol state untouched and records an event.
#[tokio::test]
async fn rejected_entry_leaves_state_clean() {
    let h = harness();
    h.broker.set_price("TSLA", 100.0);
    h.broker.lock().reject_orders = true;

    run_tick(&h, &HashMap::new()).await;

    assert!(h.store.get_symbol_state("TSLA").unwrap().is_none());
    let event = h.store.last_event().unwrap().unwrap();
    assert_eq!(event.event_type, "order_rejected");
}

/// EOD sweep cancels working entries but leaves partially filled ones.
#[tokio::test]
async fn eod_cancel_spares_partial_fills() {
    let h = harness();
    let mut working = trailing_stop("buy-1", "TSLA", 10.0);
    working.side = Side::Buy;
    working.order_type = "stop".to_string();
    h.broker.add_open_order(working);

    let mut partial = trailing_stop("buy-2", "TSLA", 10.0);
    partial.side = Side::Buy;
    partial.order_type = "stop".to_string();
    partial.status = "partially_filled".to_string();
    partial.filled_qty = 4.0;
    h.broker.add_open_order(partial);

    h.controller.cancel_unfilled_entries(&h.broker).await.unwrap();

    assert_eq!(h.broker.cancelled(), vec!["buy-1".to_string()]);
    let event = h.store.last_event().unwrap().unwrap();
    assert_eq!(event.event_type, "entry_cancelled_eod");
}

// =============================================================================
// Fill dispatch through the orchestrator
// =============================================================================

fn bot_with_mock() -> (TradingBot, MockBroker, Store) {
    let store = Store::open("sqlite::memory:").unwrap();
    let broker = MockBroker::new();
    let bot = TradingBot::with_parts(config(), store.clone(), Box::new(broker.clone())).unwrap();
    (bot, broker, store)
}

fn filled_order(id: &str, symbol: &str, side: Side, order_type: &str, qty: f64, price: f64) -> (BrokerOrder, FillEvent) {
    let order = BrokerOrder {
        id: id.to_string(),
        symbol: symbol.to_string(),
        side,
        order_type: order_type.to_string(),
        status: "filled".to_string(),
        qty,
        filled_qty: qty,
        filled_avg_price: Some(price),
        stop_price: None,
        limit_price: None,
        trail_percent: None,
    };
    let fill = FillEvent::from_order(&order);
    (order, fill)
}

/// A BUY fill gets its trailing stop attached for the filled quantity.
#[tokio::test]
async fn buy_fill_attaches_trailing_stop() {
    let (bot, broker, store) = bot_with_mock();
    let (order, fill) = filled_order("buy-1", "TSLA", Side::Buy, "stop", 10.0, 105.0);

    bot.handle_fill(&order, &fill).await.unwrap();

    let submitted = broker.submitted();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].side, Side::Sell);
    assert_eq!(submitted[0].order_type, "trailing_stop");
    assert_eq!(submitted[0].qty, 10.0);
    assert_eq!(submitted[0].trail_percent, Some(10.0));

    // Fill and stop order both landed in the store
    assert_eq!(store.count_fills().unwrap(), 1);
    let state = store.get_symbol_state("TSLA").unwrap().unwrap();
    assert_eq!(state.last_trail_id.as_deref(), Some(submitted[0].id.as_str()));

    let orders = store.get_orders(None, 10).unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].trailing_pct, Some(10.0));
}

/// A protective SELL fill starts the cooldown.
#[tokio::test]
async fn protective_sell_fill_starts_cooldown() {
    let (bot, _broker, store) = bot_with_mock();
    let (order, fill) =
        filled_order("stop-1", "TSLA", Side::Sell, "trailing_stop", 10.0, 225.0);

    bot.handle_fill(&order, &fill).await.unwrap();

    let state = store.get_symbol_state("TSLA").unwrap().unwrap();
    assert!(state.cooldown_until.unwrap() > Utc::now());

    let events = store.get_events(10).unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type == "stopout_cooldown_started"));
}

/// Replaying a fill with a seen exec id writes nothing and triggers no
/// callbacks.
#[tokio::test]
async fn replayed_fill_is_inert() {
    let (bot, broker, store) = bot_with_mock();
    let (order, fill) = filled_order("buy-1", "TSLA", Side::Buy, "stop", 10.0, 105.0);

    bot.handle_fill(&order, &fill).await.unwrap();
    bot.handle_fill(&order, &fill).await.unwrap();
    bot.handle_fill(&order, &fill).await.unwrap();

    assert_eq!(store.count_fills().unwrap(), 1);
    // Only the first delivery placed a stop
    assert_eq!(broker.submitted().len(), 1);
}

/// A plain SELL fill (not a protective stop) does not start a cooldown.
#[tokio::test]
async fn manual_sell_fill_no_cooldown() {
    let (bot, _broker, store) = bot_with_mock();
    let (order, fill) = filled_order("sell-1", "TSLA", Side::Sell, "limit", 10.0, 300.0);

    bot.handle_fill(&order, &fill).await.unwrap();

    assert!(store.get_symbol_state("TSLA").unwrap().is_none());
    assert_eq!(store.count_fills().unwrap(), 1);
}
