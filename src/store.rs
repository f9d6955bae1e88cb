//! Durable order/event log backed by SQLite
//!
//! Tables: `state`, `orders`, `fills`, `events`, `performance_snapshots`.
//! One logical writer (the trading loop) plus concurrent readers (the
//! monitoring API); WAL mode keeps the readers off the writer's back.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::types::{is_terminal_status, status_rank, OPEN_ORDER_STATUSES};

// =============================================================================
// Records
// =============================================================================

/// Per-symbol durable state. One row per watched symbol, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolState {
    pub symbol: String,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_parent_id: Option<String>,
    pub last_trail_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update for a symbol's state row. Unset fields keep their
/// current value; `clear_trail_id` explicitly nulls the trail pointer
/// (used when a fresh entry supersedes the previous stop).
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_parent_id: Option<String>,
    pub last_trail_id: Option<String>,
    pub clear_trail_id: bool,
}

/// Append-once row for every order the bot submits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub status: String,
    pub qty: f64,
    pub stop_price: Option<f64>,
    pub limit_price: Option<f64>,
    pub trailing_pct: Option<f64>,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for a new order row.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub status: String,
    pub qty: f64,
    pub stop_price: Option<f64>,
    pub limit_price: Option<f64>,
    pub trailing_pct: Option<f64>,
    pub parent_id: Option<String>,
}

/// Append-once execution row, keyed by the broker's exec id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillRecord {
    pub exec_id: String,
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    pub qty: f64,
    pub price: f64,
    pub ts: DateTime<Utc>,
}

/// Audit-trail event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub symbol: Option<String>,
    pub event_type: String,
    pub payload: Option<serde_json::Value>,
    pub ts: DateTime<Utc>,
}

/// Daily account snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub date: DateTime<Utc>,
    pub account_value: Option<f64>,
    pub cash_value: Option<f64>,
    pub position_value: Option<f64>,
    pub unrealized_pnl: Option<f64>,
    pub realized_pnl: Option<f64>,
    pub daily_pnl: Option<f64>,
    pub num_positions: Option<i64>,
    pub num_trades: Option<i64>,
}

// =============================================================================
// Store
// =============================================================================

/// Handle to the SQLite log. Clones share the same connection, so the
/// monitoring API can read while the trading loop writes.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

fn now_str() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_str(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| DateTime::<Utc>::MIN_UTC)
}

fn parse_opt_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|v| parse_ts(&v))
}

/// Resolve a DSN to a SQLite location. Accepts `sqlite:///path`,
/// `sqlite://path`, `sqlite::memory:`, or a bare filesystem path; any
/// other scheme is a configuration error.
fn resolve_dsn(db_url: &str) -> Result<Option<String>> {
    if db_url == "sqlite::memory:" || db_url == ":memory:" {
        return Ok(None);
    }
    if let Some(rest) = db_url.strip_prefix("sqlite:///") {
        return Ok(Some(rest.to_string()));
    }
    if let Some(rest) = db_url.strip_prefix("sqlite://") {
        return Ok(Some(rest.to_string()));
    }
    if db_url.contains("://") {
        bail!("unsupported db_url scheme: {db_url} (only sqlite is supported)");
    }
    Ok(Some(db_url.to_string()))
}

impl Store {
    /// Open (creating if needed) the database behind a DSN and ensure the
    /// schema exists.
    pub fn open(db_url: &str) -> Result<Self> {
        let conn = match resolve_dsn(db_url)? {
            None => Connection::open_in_memory().context("Failed to open in-memory database")?,
            Some(path) => {
                if let Some(parent) = Path::new(&path).parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                let conn = Connection::open(&path)
                    .with_context(|| format!("Failed to open database: {path}"))?;
                // WAL lets the monitoring API read while we write
                conn.pragma_update(None, "journal_mode", "WAL")?;
                conn
            }
        };
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let store = Store {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.create_tables()?;
        info!(db_url, "store_initialized");
        Ok(store)
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS state (
                symbol TEXT PRIMARY KEY,
                cooldown_until TEXT,
                last_parent_id TEXT,
                last_trail_id TEXT,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id TEXT NOT NULL UNIQUE,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                status TEXT NOT NULL,
                qty REAL NOT NULL,
                stop_price REAL,
                limit_price REAL,
                trailing_pct REAL,
                parent_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS fills (
                exec_id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                qty REAL NOT NULL,
                price REAL NOT NULL,
                ts TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT,
                event_type TEXT NOT NULL,
                payload TEXT,
                ts TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS performance_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                date TEXT NOT NULL,
                account_value REAL,
                cash_value REAL,
                position_value REAL,
                unrealized_pnl REAL,
                realized_pnl REAL,
                daily_pnl REAL,
                num_positions INTEGER,
                num_trades INTEGER,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_orders_symbol ON orders(symbol)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status)",
            [],
        )?;
        conn.execute("CREATE INDEX IF NOT EXISTS idx_fills_ts ON fills(ts)", [])?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_fills_symbol ON fills(symbol)",
            [],
        )?;
        conn.execute("CREATE INDEX IF NOT EXISTS idx_events_ts ON events(ts)", [])?;

        debug!("database schema created/verified");
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means a panic mid-write; nothing sane to
        // recover, so inherit the panic.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cheap connectivity probe for the /health endpoint.
    pub fn health_check(&self) -> Result<()> {
        let conn = self.lock();
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    // =========================================================================
    // Symbol state
    // =========================================================================

    pub fn get_symbol_state(&self, symbol: &str) -> Result<Option<SymbolState>> {
        let conn = self.lock();
        let state = conn
            .query_row(
                "SELECT symbol, cooldown_until, last_parent_id, last_trail_id, updated_at
                 FROM state WHERE symbol = ?1",
                params![symbol.to_uppercase()],
                row_to_state,
            )
            .optional()?;
        Ok(state)
    }

    pub fn get_symbol_states(&self) -> Result<Vec<SymbolState>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT symbol, cooldown_until, last_parent_id, last_trail_id, updated_at
             FROM state ORDER BY symbol",
        )?;
        let states = stmt
            .query_map([], row_to_state)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(states)
    }

    /// Insert or update a symbol's state row, touching only the patched
    /// fields.
    pub fn upsert_symbol_state(&self, symbol: &str, patch: StatePatch) -> Result<()> {
        let symbol = symbol.to_uppercase();
        let current = self.get_symbol_state(&symbol)?;

        let mut state = current.unwrap_or(SymbolState {
            symbol: symbol.clone(),
            cooldown_until: None,
            last_parent_id: None,
            last_trail_id: None,
            updated_at: Utc::now(),
        });

        if let Some(until) = patch.cooldown_until {
            state.cooldown_until = Some(until);
        }
        if let Some(parent) = patch.last_parent_id {
            state.last_parent_id = Some(parent);
        }
        if patch.clear_trail_id {
            state.last_trail_id = None;
        }
        if let Some(trail) = patch.last_trail_id {
            state.last_trail_id = Some(trail);
        }

        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO state
             (symbol, cooldown_until, last_parent_id, last_trail_id, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                state.symbol,
                state.cooldown_until.map(ts_str),
                state.last_parent_id,
                state.last_trail_id,
                now_str(),
            ],
        )?;
        Ok(())
    }

    // =========================================================================
    // Orders
    // =========================================================================

    pub fn add_order(&self, order: NewOrder) -> Result<OrderRecord> {
        let now = Utc::now();
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO orders
             (order_id, symbol, side, order_type, status, qty, stop_price,
              limit_price, trailing_pct, parent_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                order.order_id,
                order.symbol.to_uppercase(),
                order.side,
                order.order_type,
                order.status,
                order.qty,
                order.stop_price,
                order.limit_price,
                order.trailing_pct,
                order.parent_id,
                ts_str(now),
                ts_str(now),
            ],
        )?;

        Ok(OrderRecord {
            order_id: order.order_id,
            symbol: order.symbol.to_uppercase(),
            side: order.side,
            order_type: order.order_type,
            status: order.status,
            qty: order.qty,
            stop_price: order.stop_price,
            limit_price: order.limit_price,
            trailing_pct: order.trailing_pct,
            parent_id: order.parent_id,
            created_at: now,
            updated_at: now,
        })
    }

    /// Apply a broker status update. Unknown order ids are a no-op, and
    /// transitions that would move backwards through the lifecycle (a
    /// stale `new` after `filled`) are dropped.
    pub fn update_order_status(&self, order_id: &str, status: &str) -> Result<()> {
        let conn = self.lock();
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM orders WHERE order_id = ?1",
                params![order_id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(current) = current else {
            debug!(order_id, status, "status_update_for_unknown_order");
            return Ok(());
        };

        if is_terminal_status(&current) && current.to_lowercase() != status.to_lowercase() {
            debug!(order_id, %current, status, "ignoring_transition_from_terminal_status");
            return Ok(());
        }
        if status_rank(status) < status_rank(&current) {
            debug!(order_id, %current, status, "ignoring_backwards_status_transition");
            return Ok(());
        }

        conn.execute(
            "UPDATE orders SET status = ?2, updated_at = ?3 WHERE order_id = ?1",
            params![order_id, status, now_str()],
        )?;
        Ok(())
    }

    /// Orders whose broker status is in the open set, optionally scoped
    /// to one symbol.
    pub fn get_active_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderRecord>> {
        let placeholders = OPEN_ORDER_STATUSES
            .iter()
            .map(|s| format!("'{s}'"))
            .collect::<Vec<_>>()
            .join(", ");
        let conn = self.lock();
        let orders = match symbol {
            Some(sym) => {
                let sql = format!(
                    "SELECT order_id, symbol, side, order_type, status, qty, stop_price,
                            limit_price, trailing_pct, parent_id, created_at, updated_at
                     FROM orders WHERE LOWER(status) IN ({placeholders}) AND symbol = ?1
                     ORDER BY created_at DESC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![sym.to_uppercase()], row_to_order)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let sql = format!(
                    "SELECT order_id, symbol, side, order_type, status, qty, stop_price,
                            limit_price, trailing_pct, parent_id, created_at, updated_at
                     FROM orders WHERE LOWER(status) IN ({placeholders})
                     ORDER BY created_at DESC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([], row_to_order)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(orders)
    }

    /// Most recent orders, optionally filtered by exact broker status.
    pub fn get_orders(&self, status: Option<&str>, limit: usize) -> Result<Vec<OrderRecord>> {
        let conn = self.lock();
        let orders = match status {
            Some(status) => {
                let mut stmt = conn.prepare(
                    "SELECT order_id, symbol, side, order_type, status, qty, stop_price,
                            limit_price, trailing_pct, parent_id, created_at, updated_at
                     FROM orders WHERE LOWER(status) = LOWER(?1)
                     ORDER BY created_at DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![status, limit as i64], row_to_order)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT order_id, symbol, side, order_type, status, qty, stop_price,
                            limit_price, trailing_pct, parent_id, created_at, updated_at
                     FROM orders ORDER BY created_at DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit as i64], row_to_order)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(orders)
    }

    // =========================================================================
    // Fills
    // =========================================================================

    /// Record an execution. Returns `false` (and writes nothing) when the
    /// exec id has been seen before — replayed fills are a no-op.
    pub fn add_fill(&self, fill: &FillRecord) -> Result<bool> {
        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO fills (exec_id, order_id, symbol, side, qty, price, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                fill.exec_id,
                fill.order_id,
                fill.symbol.to_uppercase(),
                fill.side,
                fill.qty,
                fill.price,
                ts_str(fill.ts),
            ],
        )?;
        Ok(inserted == 1)
    }

    pub fn get_fills(&self, limit: usize) -> Result<Vec<FillRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT exec_id, order_id, symbol, side, qty, price, ts
             FROM fills ORDER BY ts DESC LIMIT ?1",
        )?;
        let fills = stmt
            .query_map(params![limit as i64], row_to_fill)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(fills)
    }

    /// All fills in execution order; input to the performance analyzer.
    pub fn get_all_fills(&self) -> Result<Vec<FillRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT exec_id, order_id, symbol, side, qty, price, ts
             FROM fills ORDER BY ts ASC",
        )?;
        let fills = stmt
            .query_map([], row_to_fill)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(fills)
    }

    pub fn count_fills(&self) -> Result<i64> {
        let conn = self.lock();
        let count = conn.query_row("SELECT COUNT(*) FROM fills", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn count_fills_since(&self, ts: DateTime<Utc>) -> Result<i64> {
        let conn = self.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM fills WHERE ts >= ?1",
            params![ts_str(ts)],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // =========================================================================
    // Events
    // =========================================================================

    pub fn add_event(
        &self,
        event_type: &str,
        symbol: Option<&str>,
        payload: Option<serde_json::Value>,
    ) -> Result<()> {
        let payload_json = payload.map(|p| p.to_string());
        let conn = self.lock();
        conn.execute(
            "INSERT INTO events (symbol, event_type, payload, ts) VALUES (?1, ?2, ?3, ?4)",
            params![
                symbol.map(|s| s.to_uppercase()),
                event_type,
                payload_json,
                now_str(),
            ],
        )?;
        Ok(())
    }

    pub fn get_events(&self, limit: usize) -> Result<Vec<EventRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, symbol, event_type, payload, ts
             FROM events ORDER BY id DESC LIMIT ?1",
        )?;
        let events = stmt
            .query_map(params![limit as i64], row_to_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    pub fn last_event(&self) -> Result<Option<EventRecord>> {
        Ok(self.get_events(1)?.into_iter().next())
    }

    pub fn last_event_of_type(&self, event_type: &str) -> Result<Option<EventRecord>> {
        let conn = self.lock();
        let event = conn
            .query_row(
                "SELECT id, symbol, event_type, payload, ts
                 FROM events WHERE event_type = ?1 ORDER BY id DESC LIMIT 1",
                params![event_type],
                row_to_event,
            )
            .optional()?;
        Ok(event)
    }

    // =========================================================================
    // Performance snapshots
    // =========================================================================

    pub fn add_performance_snapshot(&self, snapshot: &PerformanceSnapshot) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO performance_snapshots
             (date, account_value, cash_value, position_value, unrealized_pnl,
              realized_pnl, daily_pnl, num_positions, num_trades, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                ts_str(snapshot.date),
                snapshot.account_value,
                snapshot.cash_value,
                snapshot.position_value,
                snapshot.unrealized_pnl,
                snapshot.realized_pnl,
                snapshot.daily_pnl,
                snapshot.num_positions,
                snapshot.num_trades,
                now_str(),
            ],
        )?;
        Ok(())
    }

    pub fn get_latest_snapshot(&self) -> Result<Option<PerformanceSnapshot>> {
        let conn = self.lock();
        let snapshot = conn
            .query_row(
                "SELECT date, account_value, cash_value, position_value, unrealized_pnl,
                        realized_pnl, daily_pnl, num_positions, num_trades
                 FROM performance_snapshots ORDER BY id DESC LIMIT 1",
                [],
                row_to_snapshot,
            )
            .optional()?;
        Ok(snapshot)
    }
}

// =============================================================================
// Row mappers
// =============================================================================

fn row_to_state(row: &Row<'_>) -> rusqlite::Result<SymbolState> {
    Ok(SymbolState {
        symbol: row.get(0)?,
        cooldown_until: parse_opt_ts(row.get(1)?),
        last_parent_id: row.get(2)?,
        last_trail_id: row.get(3)?,
        updated_at: parse_ts(&row.get::<_, String>(4)?),
    })
}

fn row_to_order(row: &Row<'_>) -> rusqlite::Result<OrderRecord> {
    Ok(OrderRecord {
        order_id: row.get(0)?,
        symbol: row.get(1)?,
        side: row.get(2)?,
        order_type: row.get(3)?,
        status: row.get(4)?,
        qty: row.get(5)?,
        stop_price: row.get(6)?,
        limit_price: row.get(7)?,
        trailing_pct: row.get(8)?,
        parent_id: row.get(9)?,
        created_at: parse_ts(&row.get::<_, String>(10)?),
        updated_at: parse_ts(&row.get::<_, String>(11)?),
    })
}

fn row_to_fill(row: &Row<'_>) -> rusqlite::Result<FillRecord> {
    Ok(FillRecord {
        exec_id: row.get(0)?,
        order_id: row.get(1)?,
        symbol: row.get(2)?,
        side: row.get(3)?,
        qty: row.get(4)?,
        price: row.get(5)?,
        ts: parse_ts(&row.get::<_, String>(6)?),
    })
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<EventRecord> {
    let payload: Option<String> = row.get(3)?;
    Ok(EventRecord {
        id: row.get(0)?,
        symbol: row.get(1)?,
        event_type: row.get(2)?,
        payload: payload.and_then(|p| serde_json::from_str(&p).ok()),
        ts: parse_ts(&row.get::<_, String>(4)?),
    })
}

fn row_to_snapshot(row: &Row<'_>) -> rusqlite::Result<PerformanceSnapshot> {
    Ok(PerformanceSnapshot {
        date: parse_ts(&row.get::<_, String>(0)?),
        account_value: row.get(1)?,
        cash_value: row.get(2)?,
        position_value: row.get(3)?,
        unrealized_pnl: row.get(4)?,
        realized_pnl: row.get(5)?,
        daily_pnl: row.get(6)?,
        num_positions: row.get(7)?,
        num_trades: row.get(8)?,
    })
}
