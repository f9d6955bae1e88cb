//! Position sizing
//!
//! Turns a dollar allocation into an order quantity, gated by the
//! per-symbol cap, the global exposure cap, and the cash reserve. Any
//! violated constraint sizes the order to zero; only the per-symbol cap
//! scales down instead of refusing.

use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::config::BotConfig;

/// Point-in-time exposure summary, used for the debug log and the
/// status tooling.
#[derive(Debug, Clone, Serialize)]
pub struct ExposureMetrics {
    pub total_exposure_usd: f64,
    pub remaining_capacity_usd: f64,
    pub utilization_pct: f64,
    pub num_positions: usize,
}

/// Dollar-allocation position sizer. Pure: every decision is a function
/// of the arguments and the captured config.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    per_symbol_usd: f64,
    per_symbol_override: HashMap<String, f64>,
    allow_fractional: bool,
    min_cash_reserve_percent: f64,
    max_symbol_exposure_usd: f64,
    max_total_exposure_usd: f64,
}

impl PositionSizer {
    pub fn from_config(config: &BotConfig) -> Self {
        PositionSizer {
            per_symbol_usd: config.allocation.per_symbol_usd,
            per_symbol_override: config
                .allocation
                .per_symbol_override
                .iter()
                .map(|(k, v)| (k.to_uppercase(), *v))
                .collect(),
            allow_fractional: config.allocation.allow_fractional,
            min_cash_reserve_percent: config.allocation.min_cash_reserve_percent,
            max_symbol_exposure_usd: config.risk.max_symbol_exposure_usd,
            max_total_exposure_usd: config.risk.max_total_exposure_usd,
        }
    }

    fn allocation_for(&self, symbol: &str) -> f64 {
        self.per_symbol_override
            .get(&symbol.to_uppercase())
            .copied()
            .unwrap_or(self.per_symbol_usd)
    }

    /// Quantity to buy for `symbol` at `last_price`, or 0.0 when any
    /// constraint blocks the entry. `current_positions` maps symbol to
    /// current market value in dollars.
    pub fn calculate_quantity(
        &self,
        symbol: &str,
        last_price: f64,
        current_positions: &HashMap<String, f64>,
        account_value: Option<f64>,
    ) -> f64 {
        if last_price <= 0.0 || !last_price.is_finite() {
            warn!(symbol, price = last_price, "invalid_price");
            return 0.0;
        }

        let allocation = self.allocation_for(symbol);

        let mut qty = if self.allow_fractional {
            allocation / last_price
        } else {
            (allocation / last_price).floor()
        };

        if qty <= 0.0 {
            warn!(symbol, allocation, price = last_price, "quantity_too_small");
            return 0.0;
        }

        // Per-symbol cap scales down rather than refusing
        let mut position_value = qty * last_price;
        if position_value > self.max_symbol_exposure_usd {
            qty = if self.allow_fractional {
                self.max_symbol_exposure_usd / last_price
            } else {
                (self.max_symbol_exposure_usd / last_price).floor()
            };
            position_value = qty * last_price;
            info!(
                symbol,
                qty,
                value = position_value,
                "position_scaled_down_symbol_limit"
            );
            if qty <= 0.0 {
                return 0.0;
            }
        }

        // Global cap refuses outright; a partial entry would leave the
        // trailing stop undersized relative to intent
        let current_total: f64 = current_positions.values().sum();
        if current_total + position_value > self.max_total_exposure_usd {
            warn!(
                symbol,
                total_exposure = current_total + position_value,
                limit = self.max_total_exposure_usd,
                "total_exposure_limit_reached"
            );
            return 0.0;
        }

        if let Some(account_value) = account_value {
            let min_reserve = account_value * self.min_cash_reserve_percent / 100.0;
            let current_cash = account_value - current_total;
            if current_cash - position_value < min_reserve {
                warn!(
                    symbol,
                    cash = current_cash,
                    required_reserve = min_reserve,
                    "insufficient_cash_reserve"
                );
                return 0.0;
            }
        }

        info!(
            symbol,
            qty,
            price = last_price,
            value = position_value,
            "position_sized"
        );
        qty
    }

    /// Would a position of `notional` dollars stay inside both caps?
    pub fn check_exposure(
        &self,
        symbol: &str,
        notional: f64,
        current_positions: &HashMap<String, f64>,
    ) -> bool {
        if notional > self.max_symbol_exposure_usd {
            warn!(
                symbol,
                value = notional,
                limit = self.max_symbol_exposure_usd,
                "symbol_exposure_limit_exceeded"
            );
            return false;
        }
        let total: f64 = current_positions.values().sum::<f64>() + notional;
        if total > self.max_total_exposure_usd {
            warn!(
                total_exposure = total,
                limit = self.max_total_exposure_usd,
                "total_exposure_limit_exceeded"
            );
            return false;
        }
        true
    }

    pub fn exposure_metrics(&self, positions: &HashMap<String, f64>) -> ExposureMetrics {
        let total: f64 = positions.values().sum();
        let metrics = ExposureMetrics {
            total_exposure_usd: total,
            remaining_capacity_usd: self.max_total_exposure_usd - total,
            utilization_pct: if self.max_total_exposure_usd > 0.0 {
                total / self.max_total_exposure_usd * 100.0
            } else {
                0.0
            },
            num_positions: positions.len(),
        };
        debug!(?metrics, "exposure_metrics");
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BotConfig;

    fn sizer() -> PositionSizer {
        let mut config: BotConfig = serde_yaml::from_str(
            r#"
watchlist: [TSLA, NVDA]
allocation:
  total_usd_cap: 20000
  per_symbol_usd: 1000
  per_symbol_override:
    TSLA: 1500
  min_cash_reserve_percent: 10
  allow_fractional: false
risk:
  max_total_exposure_usd: 20000
  max_symbol_exposure_usd: 2000
"#,
        )
        .unwrap();
        config.normalize().unwrap();
        PositionSizer::from_config(&config)
    }

    fn fractional_sizer() -> PositionSizer {
        let mut config: BotConfig = serde_yaml::from_str(
            r#"
crypto_watchlist: [btc]
allocation:
  total_usd_cap: 20000
  per_symbol_usd: 1000
  min_cash_reserve_percent: 10
  allow_fractional: true
risk:
  max_total_exposure_usd: 20000
  max_symbol_exposure_usd: 2000
"#,
        )
        .unwrap();
        config.normalize().unwrap();
        PositionSizer::from_config(&config)
    }

    #[test]
    fn test_basic_quantity() {
        // $1000 at $500/share -> 2 shares
        let qty = sizer().calculate_quantity("NVDA", 500.0, &HashMap::new(), Some(50_000.0));
        assert_eq!(qty, 2.0);
    }

    #[test]
    fn test_override_allocation() {
        // TSLA override $1500 at $250 -> 6 shares
        let qty = sizer().calculate_quantity("TSLA", 250.0, &HashMap::new(), Some(50_000.0));
        assert_eq!(qty, 6.0);
    }

    #[test]
    fn test_invalid_price() {
        let s = sizer();
        assert_eq!(s.calculate_quantity("NVDA", 0.0, &HashMap::new(), None), 0.0);
        assert_eq!(s.calculate_quantity("NVDA", -5.0, &HashMap::new(), None), 0.0);
        assert_eq!(
            s.calculate_quantity("NVDA", f64::NAN, &HashMap::new(), None),
            0.0
        );
    }

    #[test]
    fn test_allocation_smaller_than_price() {
        // $1000 at $2000/share floors to zero
        let qty = sizer().calculate_quantity("NVDA", 2000.0, &HashMap::new(), Some(50_000.0));
        assert_eq!(qty, 0.0);
    }

    #[test]
    fn test_fractional_quantity() {
        let qty = fractional_sizer().calculate_quantity(
            "BTC/USD",
            40_000.0,
            &HashMap::new(),
            Some(50_000.0),
        );
        assert!((qty - 0.025).abs() < 1e-12);
    }

    #[test]
    fn test_symbol_cap_scales_down() {
        let mut sizer = sizer();
        sizer.per_symbol_override.insert("NVDA".into(), 3000.0);
        // $3000 allocation at $100 would be 30 shares = $3000, above the
        // $2000 symbol cap -> scaled to 20 shares
        let qty = sizer.calculate_quantity("NVDA", 100.0, &HashMap::new(), Some(50_000.0));
        assert_eq!(qty, 20.0);
    }

    #[test]
    fn test_total_exposure_cap_blocks() {
        // $19,500 deployed against a $20,000 cap; a new $1000 entry must refuse
        let positions = HashMap::from([("AAPL".to_string(), 10_000.0), ("MSFT".to_string(), 9_500.0)]);
        let qty = sizer().calculate_quantity("NVDA", 100.0, &positions, None);
        assert_eq!(qty, 0.0);
    }

    #[test]
    fn test_cash_reserve_blocks() {
        // Account 10k, reserve 10% = 1k. Positions worth 8.5k leave 1.5k
        // cash; a $1000 entry would drop cash to $500 < reserve.
        let positions = HashMap::from([("AAPL".to_string(), 8_500.0)]);
        let qty = sizer().calculate_quantity("NVDA", 100.0, &positions, Some(10_000.0));
        assert_eq!(qty, 0.0);

        // Without the account value the reserve check is skipped
        let qty = sizer().calculate_quantity("NVDA", 100.0, &positions, None);
        assert_eq!(qty, 10.0);
    }

    #[test]
    fn test_monotone_in_allocation() {
        let mut small = sizer();
        let mut large = sizer();
        small.per_symbol_override.insert("NVDA".into(), 500.0);
        large.per_symbol_override.insert("NVDA".into(), 1500.0);

        let q_small = small.calculate_quantity("NVDA", 100.0, &HashMap::new(), None);
        let q_large = large.calculate_quantity("NVDA", 100.0, &HashMap::new(), None);
        assert!(q_large >= q_small);
    }

    #[test]
    fn test_monotone_in_current_exposure() {
        let s = sizer();
        let mut last = f64::MAX;
        for deployed in [0.0, 10_000.0, 19_500.0, 25_000.0] {
            let positions = HashMap::from([("AAPL".to_string(), deployed)]);
            let qty = s.calculate_quantity("NVDA", 100.0, &positions, None);
            assert!(qty <= last, "size increased as exposure grew");
            last = qty;
        }
    }

    #[test]
    fn test_check_exposure() {
        let s = sizer();
        let positions = HashMap::from([("AAPL".to_string(), 19_000.0)]);
        assert!(s.check_exposure("NVDA", 1_000.0, &positions));
        assert!(!s.check_exposure("NVDA", 1_500.0, &positions));
        assert!(!s.check_exposure("NVDA", 2_500.0, &HashMap::new()));
    }

    #[test]
    fn test_exposure_metrics() {
        let s = sizer();
        let positions = HashMap::from([
            ("AAPL".to_string(), 5_000.0),
            ("MSFT".to_string(), 5_000.0),
        ]);
        let m = s.exposure_metrics(&positions);
        assert_eq!(m.total_exposure_usd, 10_000.0);
        assert_eq!(m.remaining_capacity_usd, 10_000.0);
        assert_eq!(m.utilization_pct, 50.0);
        assert_eq!(m.num_positions, 2);
    }
}
