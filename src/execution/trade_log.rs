//! Append-only CSV audit log of completed trades.
//!
//! Every close writes one row to the primary `trades.csv` and to a per-day
//! file under `logs/`. Logging must never take the engine down, so IO errors
//! are reported and swallowed.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::models::{ExitReason, Position};

const HEADER: &str = "timestamp,symbol,side,quantity,entry_time,entry_price_raw,entry_price_exec,exit_time,exit_price_raw,exit_price_exec,stop_loss,take_profit,pnl,balance,reason";

/// One completed trade, flattened for the CSV
#[derive(Debug, Clone)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub side: String,
    pub quantity: f64,
    pub entry_time: DateTime<Utc>,
    pub entry_price_raw: f64,
    pub entry_price_exec: f64,
    pub exit_time: DateTime<Utc>,
    pub exit_price_raw: f64,
    pub exit_price_exec: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub pnl: f64,
    pub balance: f64,
    pub reason: String,
}

impl TradeRecord {
    /// Flatten a closed position into a record
    pub fn from_position(position: &Position, reason: ExitReason, balance: f64) -> Self {
        let exit_time = position.closed_at.unwrap_or_else(Utc::now);
        Self {
            timestamp: Utc::now(),
            symbol: position.symbol.clone(),
            side: position.side.as_str().to_string(),
            quantity: position.quantity,
            entry_time: position.opened_at,
            entry_price_raw: position.entry_raw,
            entry_price_exec: position.entry_price,
            exit_time,
            exit_price_raw: position.close_raw.unwrap_or(0.0),
            exit_price_exec: position.close_exec.unwrap_or(0.0),
            stop_loss: position.stop_loss,
            take_profit: position.take_profit,
            pnl: position.pnl,
            balance,
            reason: reason.as_str().to_string(),
        }
    }

    fn to_csv_row(&self) -> String {
        format!(
            "{},{},{},{:.8},{},{:.8},{:.8},{},{:.8},{:.8},{:.8},{:.8},{:.8},{:.2},{}",
            self.timestamp.to_rfc3339(),
            self.symbol,
            self.side,
            self.quantity,
            self.entry_time.to_rfc3339(),
            self.entry_price_raw,
            self.entry_price_exec,
            self.exit_time.to_rfc3339(),
            self.exit_price_raw,
            self.exit_price_exec,
            self.stop_loss,
            self.take_profit,
            self.pnl,
            self.balance,
            self.reason,
        )
    }
}

pub struct TradeLog {
    primary: PathBuf,
    daily_dir: PathBuf,
}

impl TradeLog {
    /// Audit log rooted at `base_dir` (`trades.csv` plus `logs/` per-day files)
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        let base = base_dir.as_ref();
        Self {
            primary: base.join("trades.csv"),
            daily_dir: base.join("logs"),
        }
    }

    /// Sum of the pnl column across the primary log
    ///
    /// Lets a flat restart resume the account where the last session left
    /// it. A missing or unreadable log contributes nothing.
    pub fn realized_pnl(&self) -> f64 {
        let Ok(raw) = fs::read_to_string(&self.primary) else {
            return 0.0;
        };
        raw.lines()
            .skip(1)
            .filter_map(|line| line.split(',').nth(12))
            .filter_map(|pnl| pnl.parse::<f64>().ok())
            .sum()
    }

    /// Append one trade; failures are logged, never raised
    pub fn record(&self, record: &TradeRecord) {
        let row = record.to_csv_row();

        if let Err(err) = append_row(&self.primary, &row) {
            warn!(path = %self.primary.display(), error = %err, "trade log write failed");
        }

        let daily = self
            .daily_dir
            .join(format!("trades_{}.csv", record.timestamp.format("%Y-%m-%d")));
        if let Err(err) = fs::create_dir_all(&self.daily_dir)
            .and_then(|_| append_row(&daily, &row))
        {
            warn!(path = %daily.display(), error = %err, "daily trade log write failed");
        }
    }
}

fn append_row(path: &Path, row: &str) -> std::io::Result<()> {
    let needs_header = !path.exists();
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if needs_header {
        writeln!(file, "{HEADER}")?;
    }
    writeln!(file, "{row}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;
    use uuid::Uuid;

    fn sample_position() -> Position {
        Position {
            id: Uuid::new_v4(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            quantity: 0.25,
            entry_price: 100.1,
            stop_loss: 95.0,
            take_profit: 115.0,
            opened_at: Utc::now(),
            closed_at: Some(Utc::now()),
            pnl: 12.5,
            is_open: false,
            entry_raw: 100.0,
            close_raw: Some(150.0),
            close_exec: Some(149.8),
        }
    }

    #[test]
    fn test_record_has_fifteen_columns() {
        assert_eq!(HEADER.split(',').count(), 15);

        let record = TradeRecord::from_position(&sample_position(), ExitReason::TakeProfit, 1012.5);
        assert_eq!(record.to_csv_row().split(',').count(), 15);
    }

    #[test]
    fn test_record_appends_to_primary_and_daily() {
        let dir = tempfile::tempdir().unwrap();
        let log = TradeLog::new(dir.path());

        let record = TradeRecord::from_position(&sample_position(), ExitReason::StopLoss, 987.5);
        log.record(&record);
        log.record(&record);

        let primary = fs::read_to_string(dir.path().join("trades.csv")).unwrap();
        let lines: Vec<&str> = primary.lines().collect();
        // one header plus two rows
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], HEADER);
        assert!(lines[1].contains("Stop Loss"));

        let daily = dir
            .path()
            .join("logs")
            .join(format!("trades_{}.csv", record.timestamp.format("%Y-%m-%d")));
        assert!(daily.exists());
    }

    #[test]
    fn test_realized_pnl_sums_logged_trades() {
        let dir = tempfile::tempdir().unwrap();
        let log = TradeLog::new(dir.path());
        assert_eq!(log.realized_pnl(), 0.0);

        let mut position = sample_position();
        position.pnl = 100.0;
        log.record(&TradeRecord::from_position(&position, ExitReason::TakeProfit, 1_100.0));
        position.pnl = -40.0;
        log.record(&TradeRecord::from_position(&position, ExitReason::StopLoss, 1_060.0));

        assert!((log.realized_pnl() - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_unwritable_path_does_not_panic() {
        let log = TradeLog::new("/definitely/not/a/real/path");
        let record = TradeRecord::from_position(&sample_position(), ExitReason::Manual, 0.0);
        log.record(&record);
    }
}
