//! Trade pairing and performance analytics
//!
//! Pairs BUY and SELL fills per symbol with FIFO inventory: a sell
//! consumes the oldest open lots first and emits one closed-trade record
//! per consumed lot segment, so total P&L over a symbol's closed trades
//! equals sell proceeds minus the matched buy cost exactly.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use itertools::Itertools;
use serde::Serialize;
use statrs::statistics::Statistics;
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use tracing::info;

use crate::store::{FillRecord, Store};

const QTY_EPSILON: f64 = 1e-9;

/// One closed round trip (or lot segment of one).
#[derive(Debug, Clone, Serialize)]
pub struct ClosedTrade {
    pub symbol: String,
    pub entry_ts: DateTime<Utc>,
    pub exit_ts: DateTime<Utc>,
    pub duration_hours: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub qty: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub trade_type: &'static str,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TradeStats {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub avg_pnl_per_trade: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub profit_factor: f64,
    pub expectancy: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
    pub avg_trade_duration_hours: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SymbolPerformance {
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub avg_pnl: f64,
    pub best_trade: f64,
    pub worst_trade: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyPnl {
    pub date: NaiveDate,
    pub pnl: f64,
    pub trades: usize,
}

/// Read-only analytics over the fill log.
#[derive(Clone)]
pub struct PerformanceTracker {
    store: Store,
}

impl PerformanceTracker {
    pub fn new(store: Store) -> Self {
        PerformanceTracker { store }
    }

    pub fn closed_trades(&self) -> Result<Vec<ClosedTrade>> {
        let fills = self.store.get_all_fills()?;
        Ok(pair_closed_trades(&fills))
    }

    pub fn trade_statistics(&self) -> Result<TradeStats> {
        Ok(compute_statistics(&self.closed_trades()?))
    }

    pub fn by_symbol(&self) -> Result<BTreeMap<String, SymbolPerformance>> {
        Ok(performance_by_symbol(&self.closed_trades()?))
    }

    pub fn daily_pnl(&self, days: usize) -> Result<Vec<DailyPnl>> {
        Ok(daily_buckets(&self.closed_trades()?, days))
    }

    /// One CSV row per closed trade. Returns the number of rows written.
    pub fn export_csv(&self, path: impl AsRef<Path>) -> Result<usize> {
        let trades = self.closed_trades()?;
        let mut writer = csv::Writer::from_path(path.as_ref())
            .with_context(|| format!("Failed to open {}", path.as_ref().display()))?;
        for trade in &trades {
            writer.serialize(trade)?;
        }
        writer.flush()?;
        info!(
            path = %path.as_ref().display(),
            count = trades.len(),
            "trades_exported_to_csv"
        );
        Ok(trades.len())
    }

    /// Human-readable report for the operator tooling.
    pub fn report(&self, account: Option<&std::collections::HashMap<String, f64>>) -> Result<String> {
        let stats = self.trade_statistics()?;
        let by_symbol = self.by_symbol()?;

        let mut lines = Vec::new();
        lines.push("=".repeat(70));
        lines.push("PERFORMANCE REPORT".to_string());
        lines.push("=".repeat(70));
        lines.push(String::new());

        if let Some(account) = account {
            let get = |tag: &str| account.get(tag).copied().unwrap_or(0.0);
            lines.push("ACCOUNT SUMMARY".to_string());
            lines.push("-".repeat(70));
            lines.push(format!("Net Liquidation: ${:.2}", get("NetLiquidation")));
            lines.push(format!("Cash: ${:.2}", get("TotalCashValue")));
            lines.push(format!("Position Value: ${:.2}", get("GrossPositionValue")));
            lines.push(format!("Unrealized P&L: ${:.2}", get("UnrealizedPnL")));
            lines.push(format!("Realized P&L: ${:.2}", get("RealizedPnL")));
            lines.push(String::new());
        }

        if stats.total_trades > 0 {
            lines.push("OVERALL STATISTICS".to_string());
            lines.push("-".repeat(70));
            lines.push(format!("Total Trades: {}", stats.total_trades));
            lines.push(format!(
                "Win Rate: {:.2}% ({}W / {}L)",
                stats.win_rate, stats.winning_trades, stats.losing_trades
            ));
            lines.push(format!("Total P&L: ${:.2}", stats.total_pnl));
            lines.push(format!("Average P&L per Trade: ${:.2}", stats.avg_pnl_per_trade));
            lines.push(format!("Average Win: ${:.2}", stats.avg_win));
            lines.push(format!("Average Loss: ${:.2}", stats.avg_loss));
            lines.push(format!("Largest Win: ${:.2}", stats.largest_win));
            lines.push(format!("Largest Loss: ${:.2}", stats.largest_loss));
            lines.push(format!("Profit Factor: {:.2}", stats.profit_factor));
            lines.push(format!("Expectancy: ${:.2}", stats.expectancy));
            lines.push(format!("Sharpe Ratio: {:.2}", stats.sharpe_ratio));
            lines.push(format!("Max Drawdown: ${:.2}", stats.max_drawdown));
            lines.push(format!(
                "Avg Trade Duration: {:.2} hours",
                stats.avg_trade_duration_hours
            ));
            lines.push(String::new());
        } else {
            lines.push("No closed trades yet".to_string());
            lines.push(String::new());
        }

        if !by_symbol.is_empty() {
            lines.push("PERFORMANCE BY SYMBOL".to_string());
            lines.push("-".repeat(70));
            for (symbol, perf) in &by_symbol {
                lines.push(format!("{symbol}:"));
                lines.push(format!(
                    "  Trades: {} | Win Rate: {:.2}%",
                    perf.trades, perf.win_rate
                ));
                lines.push(format!(
                    "  Total P&L: ${:.2} | Avg: ${:.2}",
                    perf.total_pnl, perf.avg_pnl
                ));
                lines.push(format!(
                    "  Best: ${:.2} | Worst: ${:.2}",
                    perf.best_trade, perf.worst_trade
                ));
                lines.push(String::new());
            }
        }

        lines.push("=".repeat(70));
        Ok(lines.join("\n"))
    }
}

// =============================================================================
// Pairing
// =============================================================================

#[derive(Debug)]
struct Lot {
    qty: f64,
    price: f64,
    ts: DateTime<Utc>,
}

/// FIFO-pair fills into closed trades. Buys open or extend the long
/// inventory; sells consume it oldest-first. Sells with no matching
/// inventory are dropped (short selling is out of scope).
pub fn pair_closed_trades(fills: &[FillRecord]) -> Vec<ClosedTrade> {
    let by_symbol = fills
        .iter()
        .map(|f| (f.symbol.clone(), f))
        .into_group_map();

    let mut trades = Vec::new();
    for (symbol, symbol_fills) in by_symbol.into_iter().sorted_by(|a, b| a.0.cmp(&b.0)) {
        let mut lots: VecDeque<Lot> = VecDeque::new();

        for fill in symbol_fills {
            match fill.side.to_uppercase().as_str() {
                "BUY" => lots.push_back(Lot {
                    qty: fill.qty,
                    price: fill.price,
                    ts: fill.ts,
                }),
                "SELL" => {
                    let mut remaining = fill.qty;
                    while remaining > QTY_EPSILON {
                        let Some(lot) = lots.front_mut() else {
                            break;
                        };
                        let take = lot.qty.min(remaining);
                        let pnl = (fill.price - lot.price) * take;
                        let pnl_pct = if lot.price > 0.0 {
                            (fill.price - lot.price) / lot.price * 100.0
                        } else {
                            0.0
                        };
                        trades.push(ClosedTrade {
                            symbol: symbol.clone(),
                            entry_ts: lot.ts,
                            exit_ts: fill.ts,
                            duration_hours: (fill.ts - lot.ts).num_seconds() as f64 / 3600.0,
                            entry_price: lot.price,
                            exit_price: fill.price,
                            qty: take,
                            pnl,
                            pnl_pct,
                            trade_type: "long",
                        });

                        lot.qty -= take;
                        remaining -= take;
                        if lot.qty <= QTY_EPSILON {
                            lots.pop_front();
                        }
                    }
                }
                _ => {}
            }
        }
    }

    trades.sort_by_key(|t| t.exit_ts);
    trades
}

// =============================================================================
// Aggregations
// =============================================================================

pub fn compute_statistics(trades: &[ClosedTrade]) -> TradeStats {
    if trades.is_empty() {
        return TradeStats::default();
    }

    let total = trades.len();
    let wins: Vec<&ClosedTrade> = trades.iter().filter(|t| t.pnl > 0.0).collect();
    let losses: Vec<&ClosedTrade> = trades.iter().filter(|t| t.pnl < 0.0).collect();

    let win_rate = wins.len() as f64 / total as f64 * 100.0;
    let total_pnl: f64 = trades.iter().map(|t| t.pnl).sum();
    let gross_profit: f64 = wins.iter().map(|t| t.pnl).sum();
    let gross_loss: f64 = losses.iter().map(|t| t.pnl).sum::<f64>().abs();

    let avg_win = if wins.is_empty() {
        0.0
    } else {
        gross_profit / wins.len() as f64
    };
    let avg_loss = if losses.is_empty() {
        0.0
    } else {
        -gross_loss / losses.len() as f64
    };

    let profit_factor = if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else {
        f64::INFINITY
    };

    let expectancy =
        win_rate / 100.0 * avg_win - (100.0 - win_rate) / 100.0 * avg_loss.abs();

    // Simplified Sharpe over per-trade percent returns
    let returns: Vec<f64> = trades.iter().map(|t| t.pnl_pct).collect();
    let mean_return = returns.iter().mean();
    let std_return = returns.iter().population_std_dev();
    let sharpe = if std_return > 0.0 {
        mean_return / std_return
    } else {
        0.0
    };

    // Max drawdown over the cumulative P&L series
    let mut peak = f64::MIN;
    let mut max_drawdown: f64 = 0.0;
    let mut running = 0.0;
    for trade in trades {
        running += trade.pnl;
        if running > peak {
            peak = running;
        }
        max_drawdown = max_drawdown.max(peak - running);
    }

    TradeStats {
        total_trades: total,
        winning_trades: wins.len(),
        losing_trades: losses.len(),
        win_rate,
        total_pnl,
        avg_pnl_per_trade: total_pnl / total as f64,
        avg_win,
        avg_loss,
        largest_win: wins.iter().map(|t| t.pnl).fold(0.0, f64::max),
        largest_loss: losses.iter().map(|t| t.pnl).fold(0.0, f64::min),
        gross_profit,
        gross_loss,
        profit_factor,
        expectancy,
        sharpe_ratio: sharpe,
        max_drawdown,
        avg_trade_duration_hours: trades.iter().map(|t| t.duration_hours).sum::<f64>()
            / total as f64,
    }
}

pub fn performance_by_symbol(trades: &[ClosedTrade]) -> BTreeMap<String, SymbolPerformance> {
    let mut by_symbol: BTreeMap<String, Vec<&ClosedTrade>> = BTreeMap::new();
    for trade in trades {
        by_symbol.entry(trade.symbol.clone()).or_default().push(trade);
    }

    by_symbol
        .into_iter()
        .map(|(symbol, trades)| {
            let total = trades.len();
            let wins = trades.iter().filter(|t| t.pnl > 0.0).count();
            let total_pnl: f64 = trades.iter().map(|t| t.pnl).sum();
            (
                symbol,
                SymbolPerformance {
                    trades: total,
                    wins,
                    losses: total - wins,
                    win_rate: wins as f64 / total as f64 * 100.0,
                    total_pnl,
                    avg_pnl: total_pnl / total as f64,
                    best_trade: trades.iter().map(|t| t.pnl).fold(f64::MIN, f64::max),
                    worst_trade: trades.iter().map(|t| t.pnl).fold(f64::MAX, f64::min),
                },
            )
        })
        .collect()
}

/// P&L bucketed by exit date (UTC), most recent `days` buckets.
pub fn daily_buckets(trades: &[ClosedTrade], days: usize) -> Vec<DailyPnl> {
    let mut by_date: BTreeMap<NaiveDate, (f64, usize)> = BTreeMap::new();
    for trade in trades {
        let entry = by_date.entry(trade.exit_ts.date_naive()).or_default();
        entry.0 += trade.pnl;
        entry.1 += 1;
    }

    let buckets: Vec<DailyPnl> = by_date
        .into_iter()
        .map(|(date, (pnl, trades))| DailyPnl { date, pnl, trades })
        .collect();

    let skip = buckets.len().saturating_sub(days);
    buckets.into_iter().skip(skip).collect()
}
