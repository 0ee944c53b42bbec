//! Runtime configuration from environment variables and a key=value file.
//!
//! Every setting has a default, may be set in the config file, and may be
//! overridden by an environment variable named `GAPBOT_<KEY>`. Environment
//! wins over file, file wins over default. An unknown run mode is fatal at
//! startup rather than a surprise at trade time.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use tracing::warn;

pub const ENV_PREFIX: &str = "GAPBOT_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Live,
    Backtest,
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "live" => Ok(Mode::Live),
            "backtest" => Ok(Mode::Backtest),
            other => bail!("unknown mode {other:?}, expected \"live\" or \"backtest\""),
        }
    }
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Live => "live",
            Mode::Backtest => "backtest",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mode: Mode,
    pub symbol: String,
    pub interval: String,
    pub ws_url: String,
    pub rest_url: String,
    /// Candles fetched to seed the detector before going live
    pub history_limit: usize,
    pub starting_balance: f64,
    /// Percent of balance committed per trade
    pub risk_percent: f64,
    pub slippage_pct: f64,
    pub taker_fee_pct: f64,
    /// Minimum gap size in percent
    pub filter_percent: f64,
    /// Where the position snapshot and trade CSVs live
    pub data_dir: String,
    pub dashboard_addr: String,
    pub telegram_token: String,
    pub telegram_chat_id: String,
    pub database_url: String,
    /// CSV of candles replayed in backtest mode
    pub backtest_file: String,
}

impl AppConfig {
    /// Load configuration, optionally layering a key=value file under the
    /// environment
    pub fn load(config_file: Option<&Path>) -> Result<AppConfig> {
        let file_values = match config_file {
            Some(path) if path.exists() => parse_config_file(path)?,
            Some(path) => {
                warn!(path = %path.display(), "config file not found, using env and defaults");
                HashMap::new()
            }
            None => HashMap::new(),
        };

        let get = |key: &str, default: &str| -> String {
            std::env::var(format!("{ENV_PREFIX}{key}"))
                .ok()
                .or_else(|| file_values.get(key).cloned())
                .unwrap_or_else(|| default.to_string())
        };
        let get_f64 = |key: &str, default: &str| -> Result<f64> {
            let raw = get(key, default);
            raw.parse::<f64>()
                .with_context(|| format!("{key} must be a number, got {raw:?}"))
        };

        let mode = get("MODE", "live").parse::<Mode>()?;

        Ok(AppConfig {
            mode,
            symbol: get("SYMBOL", "BTCUSDT").to_uppercase(),
            interval: get("INTERVAL", "1m"),
            ws_url: get("WS_URL", "wss://stream.binance.com:9443"),
            rest_url: get("REST_URL", "https://api.binance.com"),
            history_limit: get_f64("HISTORY_LIMIT", "500")? as usize,
            starting_balance: get_f64("STARTING_BALANCE", "10000")?,
            risk_percent: get_f64("RISK_PERCENT", "2.0")?,
            slippage_pct: get_f64("SLIPPAGE_PCT", "0.1")?,
            taker_fee_pct: get_f64("TAKER_FEE_PCT", "0.04")?,
            filter_percent: get_f64("FILTER_PERCENT", "0.5")?,
            data_dir: get("DATA_DIR", "data"),
            dashboard_addr: get("DASHBOARD_ADDR", "127.0.0.1:8080"),
            telegram_token: get("TELEGRAM_TOKEN", ""),
            telegram_chat_id: get("TELEGRAM_CHAT_ID", ""),
            database_url: get("DATABASE_URL", ""),
            backtest_file: get("BACKTEST_FILE", ""),
        })
    }
}

/// Parse a `KEY=value` file: one pair per line, `#` starts a comment, blank
/// lines ignored
fn parse_config_file(path: &Path) -> Result<HashMap<String, String>> {
    let raw =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;

    let mut values = HashMap::new();
    for (lineno, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            warn!(path = %path.display(), line = lineno + 1, "skipping malformed config line");
            continue;
        };
        values.insert(key.trim().to_uppercase(), value.trim().to_string());
    }
    Ok(values)
}
