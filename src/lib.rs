//! Breakout-entry / trailing-stop trading bot
//!
//! An always-on trading agent that, for each symbol on a watchlist,
//! arms a buy order above the market, attaches a trailing stop once it
//! fills, and re-arms after a stop-out cooldown. State is derived from
//! broker truth every tick and every execution lands in a durable
//! SQLite log, so crashes and restarts self-heal.

pub mod bot;
pub mod broker;
pub mod calendar;
pub mod config;
pub mod controller;
pub mod performance;
pub mod reconcile;
pub mod server;
pub mod sizing;
pub mod store;
pub mod types;

pub use bot::TradingBot;
pub use config::BotConfig;
pub use types::{round_to_tick, Side, Symbol};
