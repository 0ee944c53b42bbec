//! Single-position trade executor with crash-safe state.
//!
//! Holds at most one open position for the configured symbol. Every open
//! writes a durable JSON snapshot next to the audit log; a clean close
//! removes it, so a snapshot on disk after a restart means the process died
//! mid-trade and the position must be restored and reconciled.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{Candle, ExitReason, PersistedPosition, Position, Side};

use super::price_model::ExecutionPriceModel;
use super::risk::RiskManager;
use super::trade_log::{TradeLog, TradeRecord};

pub struct TradeExecutor {
    symbol: String,
    price_model: ExecutionPriceModel,
    risk: RiskManager,
    log: TradeLog,
    state_path: PathBuf,
    position: Option<Position>,
}

fn bid_of(candle: &Candle) -> f64 {
    candle.bid.unwrap_or(candle.close)
}

fn ask_of(candle: &Candle) -> f64 {
    candle.ask.unwrap_or(candle.close)
}

impl TradeExecutor {
    pub fn new(
        symbol: impl Into<String>,
        price_model: ExecutionPriceModel,
        risk: RiskManager,
        log: TradeLog,
        state_path: PathBuf,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            price_model,
            risk,
            log,
            state_path,
            position: None,
        }
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn balance(&self) -> f64 {
        self.risk.balance()
    }

    /// Open a position at the signal price
    ///
    /// `raw_price` is the price the strategy asked for; the fill crosses the
    /// spread from the candle's quotes (falling back to the close when no
    /// quote is attached). Opening while a position exists is a no-op.
    pub fn open_position(
        &mut self,
        side: Side,
        raw_price: f64,
        stop_loss: f64,
        take_profit: f64,
        candle: &Candle,
    ) -> Result<Option<&Position>> {
        if self.position.is_some() {
            warn!(symbol = %self.symbol, "open requested while a position is already open, ignoring");
            return Ok(None);
        }

        let entry_exec = match side {
            Side::Long => self.price_model.fill_buy(ask_of(candle)),
            Side::Short => self.price_model.fill_sell(bid_of(candle)),
        };
        let quantity = self.risk.position_size(entry_exec);
        if quantity <= 0.0 {
            warn!(symbol = %self.symbol, price = entry_exec, "position size is zero, not opening");
            return Ok(None);
        }

        let position = Position {
            id: Uuid::new_v4(),
            symbol: self.symbol.clone(),
            side,
            quantity,
            entry_price: entry_exec,
            stop_loss,
            take_profit,
            opened_at: Utc::now(),
            closed_at: None,
            pnl: 0.0,
            is_open: true,
            entry_raw: raw_price,
            close_raw: None,
            close_exec: None,
        };

        self.persist(&position)?;
        info!(
            symbol = %self.symbol,
            side = position.side.as_str(),
            qty = %format!("{quantity:.6}"),
            entry = %format!("{entry_exec:.4}"),
            sl = %format!("{stop_loss:.4}"),
            tp = %format!("{take_profit:.4}"),
            "📈 position opened"
        );
        self.position = Some(position);
        Ok(self.position.as_ref())
    }

    /// Close the open position against the candle's quotes
    pub fn close_position(
        &mut self,
        candle: &Candle,
        reason: ExitReason,
    ) -> Result<Option<Position>> {
        self.close_at(candle.close, bid_of(candle), ask_of(candle), reason)
    }

    /// Check the candle's range against the stop and take levels
    ///
    /// The stop is evaluated first: a candle that sweeps both levels closes
    /// at the stop. Fills happen at the level itself, with slippage and fees
    /// applied on top.
    pub fn check_stop_take(&mut self, candle: &Candle) -> Result<Option<(Position, ExitReason)>> {
        let Some(position) = &self.position else {
            return Ok(None);
        };
        let (sl, tp) = (position.stop_loss, position.take_profit);

        let crossed = match position.side {
            Side::Long if candle.low <= sl => Some((sl, ExitReason::StopLoss)),
            Side::Long if candle.high >= tp => Some((tp, ExitReason::TakeProfit)),
            Side::Short if candle.high >= sl => Some((sl, ExitReason::StopLoss)),
            Side::Short if candle.low <= tp => Some((tp, ExitReason::TakeProfit)),
            _ => None,
        };

        match crossed {
            Some((level, reason)) => {
                let closed = self.close_at(level, level, level, reason)?;
                Ok(closed.map(|p| (p, reason)))
            }
            None => Ok(None),
        }
    }

    /// Unrealized PnL of the open position marked at `price`, 0 when flat
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        match &self.position {
            Some(position) => match position.side {
                Side::Long => (price - position.entry_price) * position.quantity,
                Side::Short => (position.entry_price - price) * position.quantity,
            },
            None => 0.0,
        }
    }

    /// Log the unrealized PnL of the open position, if any
    pub fn update_position(&self, candle: &Candle) {
        if let Some(position) = &self.position {
            let mark = candle.close;
            let unrealized = self.unrealized_pnl(mark);
            info!(
                symbol = %self.symbol,
                side = position.side.as_str(),
                entry = %format!("{:.4}", position.entry_price),
                mark = %format!("{mark:.4}"),
                unrealized = %format!("{unrealized:+.2}"),
                "position update"
            );
        }
    }

    /// Restore persisted state after a restart
    ///
    /// With no position snapshot on disk, the realized PnL recorded in the
    /// audit log is folded into the balance so a flat restart resumes the
    /// account instead of resetting it. With a snapshot, the position and
    /// the balance it was opened with come back; if a current candle is
    /// supplied and the stop or take level was crossed while the process was
    /// down, the position is closed immediately with a recovery exit.
    pub fn restore_from_disk(&mut self, current: Option<&Candle>) -> Result<Option<Position>> {
        if !self.state_path.exists() {
            let realized = self.log.realized_pnl();
            if realized != 0.0 {
                self.risk.apply_pnl(realized);
                info!(
                    realized = %format!("{realized:+.2}"),
                    balance = %format!("{:.2}", self.risk.balance()),
                    "resumed balance from trade log"
                );
            }
            return Ok(None);
        }

        let raw = fs::read_to_string(&self.state_path)
            .with_context(|| format!("reading {}", self.state_path.display()))?;
        let saved: PersistedPosition =
            serde_json::from_str(&raw).context("parsing persisted position")?;

        self.risk.set_balance(saved.balance_at_open);
        let position = Position {
            id: Uuid::new_v4(),
            symbol: saved.symbol,
            side: saved.side,
            quantity: saved.quantity,
            entry_price: saved.entry_price,
            stop_loss: saved.stop_loss,
            take_profit: saved.take_profit,
            opened_at: saved.opened_at,
            closed_at: None,
            pnl: 0.0,
            is_open: true,
            entry_raw: saved.entry_price,
            close_raw: None,
            close_exec: None,
        };
        info!(
            symbol = %position.symbol,
            side = position.side.as_str(),
            entry = %format!("{:.4}", position.entry_price),
            "restored open position from disk"
        );
        self.position = Some(position);

        // the market kept moving while we were down
        if let Some(candle) = current {
            let Some(position) = &self.position else {
                return Ok(None);
            };
            let (sl, tp) = (position.stop_loss, position.take_profit);
            let crossed = match position.side {
                Side::Long if candle.low <= sl => Some(sl),
                Side::Long if candle.high >= tp => Some(tp),
                Side::Short if candle.high >= sl => Some(sl),
                Side::Short if candle.low <= tp => Some(tp),
                _ => None,
            };
            if let Some(level) = crossed {
                warn!(level = %format!("{level:.4}"), "stop/take crossed while offline, closing recovered position");
                return self.close_at(level, level, level, ExitReason::Recovered);
            }
        }

        Ok(None)
    }

    fn close_at(
        &mut self,
        raw_price: f64,
        bid: f64,
        ask: f64,
        reason: ExitReason,
    ) -> Result<Option<Position>> {
        let Some(mut position) = self.position.take() else {
            warn!(symbol = %self.symbol, "close requested with no open position, ignoring");
            return Ok(None);
        };

        let exit_exec = match position.side {
            Side::Long => self.price_model.fill_sell(bid),
            Side::Short => self.price_model.fill_buy(ask),
        };
        let pnl = match position.side {
            Side::Long => (exit_exec - position.entry_price) * position.quantity,
            Side::Short => (position.entry_price - exit_exec) * position.quantity,
        };

        position.closed_at = Some(Utc::now());
        position.pnl = pnl;
        position.is_open = false;
        position.close_raw = Some(raw_price);
        position.close_exec = Some(exit_exec);

        self.risk.apply_pnl(pnl);
        self.clear_state()?;
        self.log
            .record(&TradeRecord::from_position(&position, reason, self.risk.balance()));

        info!(
            symbol = %self.symbol,
            side = position.side.as_str(),
            exit = %format!("{exit_exec:.4}"),
            pnl = %format!("{pnl:+.2}"),
            reason = reason.as_str(),
            "🛑 position closed"
        );
        Ok(Some(position))
    }

    /// Write the snapshot to a temp file, then rename over the real path
    fn persist(&self, position: &Position) -> Result<()> {
        let saved = PersistedPosition {
            symbol: position.symbol.clone(),
            side: position.side,
            quantity: position.quantity,
            entry_price: position.entry_price,
            stop_loss: position.stop_loss,
            take_profit: position.take_profit,
            opened_at: position.opened_at,
            balance_at_open: self.risk.balance(),
        };

        let json = serde_json::to_string_pretty(&saved)?;
        let tmp = self.state_path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.state_path)
            .with_context(|| format!("renaming into {}", self.state_path.display()))?;
        Ok(())
    }

    fn clear_state(&self) -> Result<()> {
        match fs::remove_file(&self.state_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("removing {}", self.state_path.display()))
            }
        }
    }
}
