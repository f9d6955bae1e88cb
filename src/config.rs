//! Configuration management
//!
//! Handles loading and parsing of the YAML configuration file with
//! environment variable support for broker API credentials.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::types::Symbol;

/// Main bot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// `paper` routes orders to the broker's paper endpoint; `live` is real money.
    #[serde(default = "default_mode")]
    pub mode: TradingMode,
    /// Which broker adapter to drive.
    #[serde(default)]
    pub broker: BrokerKind,
    /// Equity tickers to trade.
    #[serde(default)]
    pub watchlist: Vec<String>,
    /// Crypto pairs to trade; entries without a quote are normalized to `BASE/USD`.
    #[serde(default)]
    pub crypto_watchlist: Vec<String>,
    #[serde(default)]
    pub alpaca: AlpacaConfig,
    #[serde(default)]
    pub ibkr: IbkrConfig,
    #[serde(default)]
    pub allocation: AllocationConfig,
    #[serde(default)]
    pub entries: EntriesConfig,
    #[serde(default)]
    pub stops: StopsConfig,
    #[serde(default)]
    pub hours: HoursConfig,
    #[serde(default)]
    pub cooldowns: CooldownsConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
}

fn default_mode() -> TradingMode {
    TradingMode::Paper
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Paper,
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    #[default]
    Alpaca,
    Ibkr,
}

/// Alpaca REST credentials. Loaded from config or the
/// `APCA_API_KEY_ID` / `APCA_API_SECRET_KEY` environment variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlpacaConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
}

/// IBKR Client Portal gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IbkrConfig {
    pub gateway_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
}

impl Default for IbkrConfig {
    fn default() -> Self {
        IbkrConfig {
            gateway_url: "https://127.0.0.1:5000/v1/api".to_string(),
            account: None,
        }
    }
}

/// Position sizing and allocation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationConfig {
    pub total_usd_cap: f64,
    pub per_symbol_usd: f64,
    #[serde(default)]
    pub per_symbol_override: HashMap<String, f64>,
    pub min_cash_reserve_percent: f64,
    pub allow_fractional: bool,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        AllocationConfig {
            total_usd_cap: 20_000.0,
            per_symbol_usd: 1_000.0,
            per_symbol_override: HashMap::new(),
            min_cash_reserve_percent: 10.0,
            allow_fractional: false,
        }
    }
}

/// Entry order configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntriesConfig {
    /// `buy_stop` or `buy_stop_limit`
    pub r#type: EntryType,
    pub buy_stop_pct_above_last: f64,
    pub stop_limit_max_slip_pct: f64,
    pub tif: String,
    pub cancel_at_close: bool,
    pub rearm_next_session: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    BuyStop,
    BuyStopLimit,
}

impl Default for EntriesConfig {
    fn default() -> Self {
        EntriesConfig {
            r#type: EntryType::BuyStop,
            buy_stop_pct_above_last: 5.0,
            stop_limit_max_slip_pct: 1.0,
            tif: "day".to_string(),
            cancel_at_close: true,
            rearm_next_session: true,
        }
    }
}

/// Trailing stop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopsConfig {
    pub trailing_stop_pct: f64,
    pub use_trailing_limit: bool,
    pub trail_limit_offset_pct: f64,
    pub tif: String,
}

impl Default for StopsConfig {
    fn default() -> Self {
        StopsConfig {
            trailing_stop_pct: 10.0,
            use_trailing_limit: false,
            trail_limit_offset_pct: 0.2,
            tif: "gtc".to_string(),
        }
    }
}

/// Market hours configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoursConfig {
    pub calendar: String,
    pub allow_pre_market: bool,
    pub allow_after_hours: bool,
}

impl Default for HoursConfig {
    fn default() -> Self {
        HoursConfig {
            calendar: "XNYS".to_string(),
            allow_pre_market: false,
            allow_after_hours: false,
        }
    }
}

/// Cooldown periods
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownsConfig {
    pub after_stopout_minutes: i64,
}

impl Default for CooldownsConfig {
    fn default() -> Self {
        CooldownsConfig {
            after_stopout_minutes: 20,
        }
    }
}

/// Polling cadences in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    pub price_seconds: u64,
    pub orders_seconds: u64,
    pub keepalive_seconds: u64,
    pub event_check_seconds: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        PollingConfig {
            price_seconds: 10,
            orders_seconds: 15,
            keepalive_seconds: 60,
            event_check_seconds: 30,
        }
    }
}

/// Exposure caps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    pub max_total_exposure_usd: f64,
    pub max_symbol_exposure_usd: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        RiskConfig {
            max_total_exposure_usd: 20_000.0,
            max_symbol_exposure_usd: 2_000.0,
        }
    }
}

/// Database persistence settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub db_url: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        PersistenceConfig {
            db_url: "sqlite:///bot.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook: Option<String>,
}

impl BotConfig {
    /// Load configuration from a YAML file, then overlay broker credentials
    /// from the environment and validate.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: BotConfig =
            serde_yaml::from_str(&contents).context("Failed to parse config YAML")?;

        if let Ok(api_key) = std::env::var("APCA_API_KEY_ID") {
            config.alpaca.api_key = Some(api_key);
        }
        if let Ok(api_secret) = std::env::var("APCA_API_SECRET_KEY") {
            config.alpaca.api_secret = Some(api_secret);
        }

        config.normalize()?;
        Ok(config)
    }

    /// Upper-case the watchlists, normalize crypto pairs to `BASE/USD`,
    /// and reject configs that watch nothing at all. An empty equity list
    /// is fine as long as crypto is present (and vice versa).
    pub fn normalize(&mut self) -> Result<()> {
        self.watchlist = self
            .watchlist
            .iter()
            .map(|s| Symbol::equity(s).as_str().to_string())
            .collect();
        self.crypto_watchlist = self
            .crypto_watchlist
            .iter()
            .map(|s| Symbol::crypto(s).as_str().to_string())
            .collect();

        if self.watchlist.is_empty() && self.crypto_watchlist.is_empty() {
            bail!("watchlist and crypto_watchlist are both empty; nothing to trade");
        }
        Ok(())
    }

    /// Dollar allocation for a symbol: per-symbol override wins, else the
    /// global default.
    pub fn symbol_allocation(&self, symbol: &str) -> f64 {
        let upper = symbol.to_uppercase();
        self.allocation
            .per_symbol_override
            .get(&upper)
            .copied()
            .unwrap_or(self.allocation.per_symbol_usd)
    }

    /// All watched symbols, equities first.
    pub fn all_symbols(&self) -> Vec<Symbol> {
        self.watchlist
            .iter()
            .map(Symbol::new)
            .chain(self.crypto_watchlist.iter().map(Symbol::new))
            .collect()
    }

    pub fn is_paper(&self) -> bool {
        self.mode == TradingMode::Paper
    }
}
