//! Read-only monitoring API
//!
//! Serves bot status, orders, fills, events, and performance straight
//! from the store. Runs as its own task next to the trading loop and
//! never touches the broker: the POST endpoints that sound mutating
//! (`/reset`, `/admin/close_all`) return instructions for the CLI
//! instead of acting.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use tracing::{error, info};

use crate::performance::PerformanceTracker;
use crate::store::Store;

const MAX_LIMIT: usize = 200;
const MAX_DAYS: usize = 90;

#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub tracker: PerformanceTracker,
    pub started_at: DateTime<Utc>,
}

impl ApiState {
    pub fn new(store: Store) -> Self {
        let tracker = PerformanceTracker::new(store.clone());
        ApiState {
            store,
            tracker,
            started_at: Utc::now(),
        }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/orders", get(orders))
        .route("/fills", get(fills))
        .route("/events", get(events))
        .route("/performance", get(performance))
        .route("/daily", get(daily))
        .route("/v1/api/tickle", post(tickle))
        .route("/reset", post(reset))
        .route("/admin/close_all", post(close_all))
        .with_state(state)
}

pub async fn serve(state: ApiState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "monitoring_api_listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn internal_error(err: anyhow::Error) -> (StatusCode, Json<Value>) {
    error!(error = %err, "api_request_failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct OrdersQuery {
    status: Option<String>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct DaysQuery {
    days: Option<usize>,
}

async fn index() -> Json<Value> {
    Json(json!({
        "name": "breakout-bot monitoring API",
        "description": "Read-only monitoring API for the trading bot",
        "endpoints": {
            "/health": "Health check",
            "/v1/api/tickle": "Keep-alive endpoint (POST)",
            "/status": "Bot status and symbol states",
            "/performance": "Performance metrics and P&L",
            "/fills?limit=N": "Recent fills (default 20, max 200)",
            "/orders?status=active|all|<status>&limit=N": "Orders (default: active)",
            "/events?limit=N": "Recent events (default 20, max 200)",
            "/daily?days=N": "Daily P&L (default 10 days, max 90)",
            "/reset": "Instructions to reset the paper account (POST)",
            "/admin/close_all": "Instructions to close all positions (POST)",
        }
    }))
}

async fn health(State(state): State<ApiState>) -> ApiResult {
    match state.store.health_check() {
        Ok(()) => Ok(Json(json!({
            "status": "healthy",
            "timestamp": Utc::now().to_rfc3339(),
            "database": "connected",
        }))),
        Err(err) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "status": "unhealthy",
                "timestamp": Utc::now().to_rfc3339(),
                "error": err.to_string(),
            })),
        )),
    }
}

async fn tickle() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn status(State(state): State<ApiState>) -> ApiResult {
    let now = Utc::now();
    let states = state.store.get_symbol_states().map_err(internal_error)?;

    let mut stock_symbols = Vec::new();
    let mut crypto_symbols = Vec::new();
    for s in states {
        let entry = json!({
            "symbol": s.symbol,
            "in_cooldown": s.cooldown_until.map(|u| u > now).unwrap_or(false),
            "cooldown_until": s.cooldown_until.map(|u| u.to_rfc3339()),
            "last_parent_id": s.last_parent_id,
            "last_trail_id": s.last_trail_id,
        });
        if s.symbol.contains('/') {
            crypto_symbols.push(entry);
        } else {
            stock_symbols.push(entry);
        }
    }

    let active_orders = state
        .store
        .get_active_orders(None)
        .map_err(internal_error)?
        .len();
    let total_fills = state.store.count_fills().map_err(internal_error)?;
    let last_event = state.store.last_event().map_err(internal_error)?;
    let bot_started = state
        .store
        .last_event_of_type("bot_started")
        .map_err(internal_error)?;

    let mut symbols = stock_symbols.clone();
    symbols.extend(crypto_symbols.iter().cloned());

    Ok(Json(json!({
        "timestamp": now.to_rfc3339(),
        "symbols": symbols,
        "stock_symbols": stock_symbols,
        "crypto_symbols": crypto_symbols,
        "active_orders": active_orders,
        "total_fills": total_fills,
        "last_event": {
            "type": last_event.as_ref().map(|e| e.event_type.clone()),
            "symbol": last_event.as_ref().and_then(|e| e.symbol.clone()),
            "timestamp": last_event.as_ref().map(|e| e.ts.to_rfc3339()),
        },
        "bot_started": bot_started.map(|e| e.ts.to_rfc3339()),
        "api_started": state.started_at.to_rfc3339(),
    })))
}

async fn orders(State(state): State<ApiState>, Query(query): Query<OrdersQuery>) -> ApiResult {
    let status_filter = query.status.unwrap_or_else(|| "active".to_string());
    let limit = query.limit.unwrap_or(MAX_LIMIT).min(MAX_LIMIT);

    let records = match status_filter.as_str() {
        "active" => state.store.get_active_orders(None),
        "all" => state.store.get_orders(None, limit),
        status => state.store.get_orders(Some(status), limit),
    }
    .map_err(internal_error)?;

    let orders: Vec<Value> = records
        .iter()
        .map(|o| {
            json!({
                "order_id": o.order_id,
                "symbol": o.symbol,
                "side": o.side,
                "order_type": o.order_type,
                "quantity": o.qty,
                "status": o.status,
                "stop_price": o.stop_price,
                "limit_price": o.limit_price,
                "trailing_pct": o.trailing_pct,
                "parent_id": o.parent_id,
                "created_at": o.created_at.to_rfc3339(),
            })
        })
        .collect();

    Ok(Json(json!({
        "timestamp": Utc::now().to_rfc3339(),
        "count": orders.len(),
        "status_filter": status_filter,
        "orders": orders,
    })))
}

async fn fills(State(state): State<ApiState>, Query(query): Query<LimitQuery>) -> ApiResult {
    let limit = query.limit.unwrap_or(20).min(MAX_LIMIT);
    let records = state.store.get_fills(limit).map_err(internal_error)?;

    let fills: Vec<Value> = records
        .iter()
        .map(|f| {
            json!({
                "timestamp": f.ts.to_rfc3339(),
                "symbol": f.symbol,
                "side": f.side,
                "quantity": f.qty,
                "price": f.price,
                "order_id": f.order_id,
                "exec_id": f.exec_id,
            })
        })
        .collect();

    Ok(Json(json!({
        "timestamp": Utc::now().to_rfc3339(),
        "count": fills.len(),
        "fills": fills,
    })))
}

async fn events(State(state): State<ApiState>, Query(query): Query<LimitQuery>) -> ApiResult {
    let limit = query.limit.unwrap_or(20).min(MAX_LIMIT);
    let records = state.store.get_events(limit).map_err(internal_error)?;

    let events: Vec<Value> = records
        .iter()
        .map(|e| {
            json!({
                "timestamp": e.ts.to_rfc3339(),
                "event_type": e.event_type,
                "symbol": e.symbol,
                "payload": e.payload,
            })
        })
        .collect();

    Ok(Json(json!({
        "timestamp": Utc::now().to_rfc3339(),
        "count": events.len(),
        "events": events,
    })))
}

async fn performance(State(state): State<ApiState>) -> ApiResult {
    let stats = state.tracker.trade_statistics().map_err(internal_error)?;

    if stats.total_trades == 0 {
        return Ok(Json(json!({
            "timestamp": Utc::now().to_rfc3339(),
            "message": "No closed trades yet",
            "total_trades": 0,
        })));
    }

    let by_symbol = state.tracker.by_symbol().map_err(internal_error)?;

    Ok(Json(json!({
        "timestamp": Utc::now().to_rfc3339(),
        "overall": stats,
        "by_symbol": by_symbol,
    })))
}

async fn daily(State(state): State<ApiState>, Query(query): Query<DaysQuery>) -> ApiResult {
    let days = query.days.unwrap_or(10).min(MAX_DAYS);
    let daily_pnl = state.tracker.daily_pnl(days).map_err(internal_error)?;

    Ok(Json(json!({
        "timestamp": Utc::now().to_rfc3339(),
        "days": days,
        "count": daily_pnl.len(),
        "daily_pnl": daily_pnl,
    })))
}

async fn reset() -> Json<Value> {
    Json(json!({
        "message": "This is a read-only monitoring API",
        "instructions": {
            "command": "breakout-bot reset --config config.yaml",
            "note": "Only available in paper mode",
        },
        "warning": "Resetting closes ALL positions and cancels ALL orders",
    }))
}

async fn close_all() -> Json<Value> {
    Json(json!({
        "message": "This is a read-only monitoring API",
        "instructions": {
            "command": "breakout-bot reset --config config.yaml",
            "manual": "Use the broker dashboard to close positions",
        },
        "warning": "This would close ALL open positions at market price",
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FillRecord, NewOrder, StatePatch};
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Duration;
    use tower::ServiceExt;

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn state_with_data() -> ApiState {
        let store = Store::open("sqlite::memory:").unwrap();
        store.add_event("bot_started", None, Some(json!({"mode": "paper"}))).unwrap();
        store
            .upsert_symbol_state(
                "TSLA",
                StatePatch {
                    cooldown_until: Some(Utc::now() + Duration::minutes(10)),
                    last_parent_id: Some("p-1".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .upsert_symbol_state("BTC/USD", StatePatch::default())
            .unwrap();
        store
            .add_order(NewOrder {
                order_id: "o-1".to_string(),
                symbol: "TSLA".to_string(),
                side: "BUY".to_string(),
                order_type: "stop".to_string(),
                status: "new".to_string(),
                qty: 10.0,
                stop_price: Some(105.0),
                limit_price: None,
                trailing_pct: None,
                parent_id: None,
            })
            .unwrap();
        store
            .add_fill(&FillRecord {
                exec_id: "e-1".to_string(),
                order_id: "o-1".to_string(),
                symbol: "TSLA".to_string(),
                side: "BUY".to_string(),
                qty: 10.0,
                price: 105.0,
                ts: Utc::now(),
            })
            .unwrap();
        ApiState::new(store)
    }

    async fn get_json(path: &str) -> Value {
        let app = router(state_with_data());
        let response = app
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "GET {path}");
        body_json(response).await
    }

    #[tokio::test]
    async fn test_health() {
        let body = get_json("/health").await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["database"], "connected");
    }

    #[tokio::test]
    async fn test_status_splits_equity_and_crypto() {
        let body = get_json("/status").await;
        assert_eq!(body["stock_symbols"].as_array().unwrap().len(), 1);
        assert_eq!(body["crypto_symbols"].as_array().unwrap().len(), 1);
        assert_eq!(body["symbols"].as_array().unwrap().len(), 2);
        assert_eq!(body["stock_symbols"][0]["in_cooldown"], true);
        assert_eq!(body["active_orders"], 1);
        assert_eq!(body["total_fills"], 1);
        assert!(body["bot_started"].is_string());
    }

    #[tokio::test]
    async fn test_orders_default_active() {
        let body = get_json("/orders").await;
        assert_eq!(body["status_filter"], "active");
        assert_eq!(body["count"], 1);
        let order = &body["orders"][0];
        assert_eq!(order["order_id"], "o-1");
        assert_eq!(order["quantity"], 10.0);
        assert_eq!(order["stop_price"], 105.0);
    }

    #[tokio::test]
    async fn test_orders_status_filter() {
        let body = get_json("/orders?status=filled").await;
        assert_eq!(body["count"], 0);
        let body = get_json("/orders?status=new&limit=5").await;
        assert_eq!(body["count"], 1);
    }

    #[tokio::test]
    async fn test_fills_and_events_limits_capped() {
        let body = get_json("/fills?limit=10000").await;
        assert_eq!(body["count"], 1);
        let body = get_json("/events?limit=10000").await;
        assert!(body["count"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn test_performance_empty_message() {
        let store = Store::open("sqlite::memory:").unwrap();
        let app = router(ApiState::new(store));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/performance")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["total_trades"], 0);
    }

    #[tokio::test]
    async fn test_daily_days_capped() {
        let body = get_json("/daily?days=500").await;
        assert_eq!(body["days"], 90);
    }

    #[tokio::test]
    async fn test_post_endpoints_do_not_mutate() {
        let state = state_with_data();
        let before = state.store.get_active_orders(None).unwrap().len();

        for path in ["/v1/api/tickle", "/reset", "/admin/close_all"] {
            let app = router(state.clone());
            let response = app
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri(path)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "POST {path}");
        }

        assert_eq!(state.store.get_active_orders(None).unwrap().len(), before);
    }
}
