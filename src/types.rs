//! Core data types used across the trading system

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Instrument symbol using Arc<str> for cheap cloning.
///
/// Symbols are cloned on every tick when passed between the orchestrator,
/// controllers, and broker adapters. Arc<str> keeps that O(1).
///
/// Equities are plain upper-case tickers ("TSLA"); crypto pairs carry a
/// slash ("BTC/USD"), which is also how the monitoring API tells the two
/// apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(#[serde(with = "arc_str_serde")] std::sync::Arc<str>);

mod arc_str_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Arc::from(s.as_str()))
    }
}

impl Symbol {
    /// Normalized equity symbol: upper-cased ticker.
    pub fn equity(s: impl AsRef<str>) -> Self {
        Symbol(std::sync::Arc::from(
            s.as_ref().trim().to_uppercase().as_str(),
        ))
    }

    /// Normalized crypto symbol: upper-cased, `BASE/USD` if no quote given.
    pub fn crypto(s: impl AsRef<str>) -> Self {
        let upper = s.as_ref().trim().to_uppercase();
        if upper.contains('/') {
            Symbol(std::sync::Arc::from(upper.as_str()))
        } else {
            Symbol(std::sync::Arc::from(format!("{}/USD", upper).as_str()))
        }
    }

    /// Wrap an already-normalized symbol (e.g. read back from the store).
    pub fn new(s: impl AsRef<str>) -> Self {
        Symbol(std::sync::Arc::from(s.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Crypto pairs carry a slash; equities never do.
    pub fn is_crypto(&self) -> bool {
        self.0.contains('/')
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            other => Err(format!("unknown order side: {other}")),
        }
    }
}

// =============================================================================
// Broker order lifecycle vocabulary
// =============================================================================

/// Statuses that count as "still working" at the broker. Orders in one of
/// these states block a new entry for the same symbol.
pub const OPEN_ORDER_STATUSES: &[&str] = &[
    "accepted",
    "new",
    "pending_new",
    "partially_filled",
    "submitted",
    "pre-submitted",
];

/// Statuses from which an order can never move again.
pub const TERMINAL_ORDER_STATUSES: &[&str] =
    &["filled", "canceled", "cancelled", "expired", "rejected"];

pub fn is_open_status(status: &str) -> bool {
    let s = status.to_lowercase();
    OPEN_ORDER_STATUSES.contains(&s.as_str())
}

pub fn is_terminal_status(status: &str) -> bool {
    let s = status.to_lowercase();
    TERMINAL_ORDER_STATUSES.contains(&s.as_str())
}

/// Coarse ordering of the lifecycle so the store can refuse backwards
/// transitions (e.g. a stale `new` arriving after `filled`). Unknown
/// broker strings rank alongside the open set and are always accepted.
pub fn status_rank(status: &str) -> u8 {
    let s = status.to_lowercase();
    match s.as_str() {
        "pending_new" | "pre-submitted" => 0,
        "accepted" | "new" | "submitted" => 1,
        "partially_filled" => 2,
        _ if is_terminal_status(&s) => 3,
        _ => 1,
    }
}

// =============================================================================
// Price grid
// =============================================================================

/// Tick size for a price, derived from its magnitude. Sub-penny
/// instruments get progressively finer grids.
pub fn tick_size(price: f64) -> Decimal {
    if price < 0.01 {
        dec!(0.0000001)
    } else if price < 1.0 {
        dec!(0.0001)
    } else {
        dec!(0.01)
    }
}

/// Round a price *down* to its tick grid.
///
/// Decimal arithmetic throughout: repeated f64 division drifts, and
/// brokers reject off-grid prices. Idempotent: rounding an already
/// rounded price is a no-op.
pub fn round_to_tick(price: f64) -> f64 {
    if !price.is_finite() || price <= 0.0 {
        return 0.0;
    }
    let tick = tick_size(price);
    let d = match Decimal::from_f64(price) {
        Some(d) => d,
        None => return 0.0,
    };
    ((d / tick).floor() * tick).to_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_symbol_normalization() {
        assert_eq!(Symbol::equity(" tsla ").as_str(), "TSLA");
        assert_eq!(Symbol::crypto("btc").as_str(), "BTC/USD");
        assert_eq!(Symbol::crypto("eth/usd").as_str(), "ETH/USD");
        assert!(Symbol::crypto("btc").is_crypto());
        assert!(!Symbol::equity("NVDA").is_crypto());
    }

    #[test]
    fn test_side_round_trip() {
        assert_eq!("buy".parse::<Side>().unwrap(), Side::Buy);
        assert_eq!("SELL".parse::<Side>().unwrap(), Side::Sell);
        assert!("hold".parse::<Side>().is_err());
        assert_eq!(Side::Buy.to_string(), "BUY");
    }

    #[test]
    fn test_status_sets() {
        assert!(is_open_status("ACCEPTED"));
        assert!(is_open_status("partially_filled"));
        assert!(!is_open_status("filled"));
        assert!(is_terminal_status("Filled"));
        assert!(is_terminal_status("cancelled"));
        assert!(!is_terminal_status("new"));
    }

    #[test]
    fn test_status_rank_monotone() {
        assert!(status_rank("pending_new") < status_rank("new"));
        assert!(status_rank("new") < status_rank("partially_filled"));
        assert!(status_rank("partially_filled") < status_rank("filled"));
        // Unknown broker strings sit with the open set
        assert_eq!(status_rank("calculating"), 1);
    }

    #[test]
    fn test_round_to_tick_magnitudes() {
        assert_relative_eq!(round_to_tick(105.123), 105.12);
        assert_relative_eq!(round_to_tick(0.56789), 0.5678);
        assert_relative_eq!(round_to_tick(0.00123456789), 0.0012345);
        assert_relative_eq!(round_to_tick(105.0), 105.0);
    }

    #[test]
    fn test_round_to_tick_rounds_down_not_nearest() {
        assert_relative_eq!(round_to_tick(99.999), 99.99);
        assert_relative_eq!(round_to_tick(0.99999), 0.9999);
    }

    #[test]
    fn test_round_to_tick_idempotent() {
        for p in [
            0.0000001234,
            0.0099999,
            0.01,
            0.4242,
            0.999949,
            1.0,
            3.14159,
            105.0,
            249.999,
            98765.4321,
        ] {
            let once = round_to_tick(p);
            let twice = round_to_tick(once);
            assert_eq!(once, twice, "not idempotent for {p}");
        }
    }

    #[test]
    fn test_round_to_tick_degenerate_inputs() {
        assert_eq!(round_to_tick(0.0), 0.0);
        assert_eq!(round_to_tick(-1.5), 0.0);
        assert_eq!(round_to_tick(f64::NAN), 0.0);
        assert_eq!(round_to_tick(f64::INFINITY), 0.0);
    }
}
