use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// OHLCV candlestick for one symbol and timeframe
///
/// A candle with `is_closed=false` is the bar currently forming and may be
/// overwritten in place by later updates carrying the same `open_time`.
/// Ticks reuse this shape with `is_tick=true`: they are the last known open
/// candle merged with a fresh traded price, never independently authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_closed: bool,
    #[serde(default)]
    pub is_tick: bool,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
}

/// Fair value gap direction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum GapKind {
    Bullish,
    Bearish,
}

/// A fair value gap produced by the three-candle imbalance scan
///
/// `index` is the confirmation candle (C2). `end_index` is display metadata:
/// the retest candle if the gap was retested within its validity window,
/// otherwise the window end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FairValueGap {
    pub index: usize,
    pub kind: GapKind,
    pub top: f64,
    pub bottom: f64,
    pub mid: f64,
    pub gap_pct: f64,
    pub end_index: usize,
}

/// Trade direction of a signal
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Direction {
    Buy,
    Sell,
}

/// Entry signal emitted by the pattern detector
///
/// At most one signal exists per candle index within a detection pass; the
/// first gap whose retest lands on an index wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub index: usize,
    pub time: DateTime<Utc>,
    pub direction: Direction,
    pub entry_price: f64,
    pub stop_price: f64,
    pub take_price: f64,
    pub risk: f64,
}

/// Position side
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Reversal,
    Recovered,
    Manual,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "Stop Loss",
            ExitReason::TakeProfit => "Take Profit",
            ExitReason::Reversal => "Signal Reversal",
            ExitReason::Recovered => "Recovered SL/TP",
            ExitReason::Manual => "Manual",
        }
    }
}

/// The single open (or just-closed) position
///
/// `entry_price` is the executed fill; `entry_raw`/`close_raw` keep the mid
/// price used to request the fill so the audit log can report both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub pnl: f64,
    pub is_open: bool,
    pub entry_raw: f64,
    pub close_raw: Option<f64>,
    pub close_exec: Option<f64>,
}

/// Durable snapshot of an open position, written on open and removed on close
///
/// `balance_at_open` lets recovery restore the risk manager alongside the
/// position.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedPosition {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub opened_at: DateTime<Utc>,
    pub balance_at_open: f64,
}

/// Health snapshot of the market data connection
///
/// Mutated only by the ingestion subsystem; read by the orchestration loop
/// and health checks.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub last_candle_time: Option<DateTime<Utc>>,
    pub candles_received: u64,
    pub book_ticker_updates: u64,
    pub connection_attempts: u64,
    pub last_error: Option<String>,
    pub seconds_since_last_candle: Option<f64>,
}

/// Top-N levels of the order book, (price, quantity) pairs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
}
