//! Shared state behind the dashboard API.
//!
//! The engine pushes candles, gaps, trades and equity points in here; the
//! HTTP layer only ever reads. Candles are archived by open time with
//! last-write-wins semantics so a re-delivered candle (after a reconnect)
//! updates its row instead of duplicating it.

pub mod server;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::models::{Candle, ConnectionStatus, FairValueGap, OrderBookSnapshot, Position};

const MAX_ARCHIVED_CANDLES: usize = 1_000;
const MAX_EQUITY_POINTS: usize = 5_000;

#[derive(Debug, Clone, Serialize)]
pub struct EquityPoint {
    pub time: DateTime<Utc>,
    /// Realized balance
    pub balance: f64,
    /// Balance plus open position PnL
    pub equity: f64,
    pub open_pnl: f64,
}

#[derive(Default)]
struct Inner {
    /// Closed candles keyed by open time
    archive: BTreeMap<DateTime<Utc>, Candle>,
    /// The candle currently forming, if any
    live_candle: Option<Candle>,
    gaps: Vec<FairValueGap>,
    /// Trades keyed by open time; an update to a known trade replaces it
    trades: BTreeMap<DateTime<Utc>, Position>,
    orderbook: OrderBookSnapshot,
    equity: Vec<EquityPoint>,
    status: ConnectionStatus,
}

#[derive(Default)]
pub struct DashboardState {
    inner: RwLock<Inner>,
}

impl DashboardState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a candle: closed candles land in the archive, open candles
    /// replace the single live slot
    pub async fn push_candle(&self, candle: &Candle) {
        let mut inner = self.inner.write().await;
        if candle.is_closed {
            inner.archive.insert(candle.open_time, candle.clone());
            // the forming candle just closed
            if inner
                .live_candle
                .as_ref()
                .is_some_and(|c| c.open_time == candle.open_time)
            {
                inner.live_candle = None;
            }
            while inner.archive.len() > MAX_ARCHIVED_CANDLES {
                inner.archive.pop_first();
            }
        } else {
            inner.live_candle = Some(candle.clone());
        }
    }

    pub async fn set_gaps(&self, gaps: Vec<FairValueGap>) {
        self.inner.write().await.gaps = gaps;
    }

    /// Insert or update a trade, keyed by its open time
    pub async fn upsert_trade(&self, position: &Position) {
        self.inner
            .write()
            .await
            .trades
            .insert(position.opened_at, position.clone());
    }

    pub async fn set_orderbook(&self, book: OrderBookSnapshot) {
        self.inner.write().await.orderbook = book;
    }

    pub async fn push_equity(&self, time: DateTime<Utc>, balance: f64, open_pnl: f64) {
        let mut inner = self.inner.write().await;
        inner.equity.push(EquityPoint {
            time,
            balance,
            equity: balance + open_pnl,
            open_pnl,
        });
        if inner.equity.len() > MAX_EQUITY_POINTS {
            let excess = inner.equity.len() - MAX_EQUITY_POINTS;
            inner.equity.drain(..excess);
        }
    }

    pub async fn set_status(&self, status: ConnectionStatus) {
        self.inner.write().await.status = status;
    }

    /// Archived candles in time order, with the live candle appended
    pub async fn candles(&self) -> Vec<Candle> {
        let inner = self.inner.read().await;
        let mut out: Vec<Candle> = inner.archive.values().cloned().collect();
        if let Some(live) = &inner.live_candle {
            out.push(live.clone());
        }
        out
    }

    pub async fn trades(&self) -> Vec<Position> {
        self.inner.read().await.trades.values().cloned().collect()
    }

    pub async fn gaps(&self) -> Vec<FairValueGap> {
        self.inner.read().await.gaps.clone()
    }

    pub async fn orderbook(&self) -> OrderBookSnapshot {
        self.inner.read().await.orderbook.clone()
    }

    pub async fn equity(&self) -> Vec<EquityPoint> {
        self.inner.read().await.equity.clone()
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.inner.read().await.status.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn candle(minute: i64, close: f64, is_closed: bool) -> Candle {
        Candle {
            open_time: Utc.timestamp_opt(1_700_000_000 + minute * 60, 0).unwrap(),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1.0,
            is_closed,
            is_tick: false,
            bid: None,
            ask: None,
        }
    }

    fn position(minute: i64, pnl: f64) -> Position {
        Position {
            id: Uuid::new_v4(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            quantity: 1.0,
            entry_price: 100.0,
            stop_loss: 95.0,
            take_profit: 115.0,
            opened_at: Utc.timestamp_opt(1_700_000_000 + minute * 60, 0).unwrap(),
            closed_at: None,
            pnl,
            is_open: true,
            entry_raw: 100.0,
            close_raw: None,
            close_exec: None,
        }
    }

    #[tokio::test]
    async fn test_redelivered_candle_updates_in_place() {
        let state = DashboardState::new();
        state.push_candle(&candle(0, 100.0, true)).await;
        state.push_candle(&candle(1, 101.0, true)).await;
        // same open time arrives again with a corrected close
        state.push_candle(&candle(0, 99.5, true)).await;

        let candles = state.candles().await;
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].close, 99.5);
    }

    #[tokio::test]
    async fn test_live_candle_single_slot() {
        let state = DashboardState::new();
        state.push_candle(&candle(0, 100.0, true)).await;
        state.push_candle(&candle(1, 101.0, false)).await;
        state.push_candle(&candle(1, 101.5, false)).await;

        let candles = state.candles().await;
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[1].close, 101.5);
        assert!(!candles[1].is_closed);

        // the forming candle closes and moves into the archive
        state.push_candle(&candle(1, 102.0, true)).await;
        let candles = state.candles().await;
        assert_eq!(candles.len(), 2);
        assert!(candles[1].is_closed);
    }

    #[tokio::test]
    async fn test_archive_is_bounded() {
        let state = DashboardState::new();
        for i in 0..(MAX_ARCHIVED_CANDLES as i64 + 50) {
            state.push_candle(&candle(i, 100.0, true)).await;
        }

        let candles = state.candles().await;
        assert_eq!(candles.len(), MAX_ARCHIVED_CANDLES);
        // oldest rows were evicted
        assert_eq!(
            candles[0].open_time,
            Utc.timestamp_opt(1_700_000_000 + 50 * 60, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_trade_update_replaces_by_open_time() {
        let state = DashboardState::new();
        state.upsert_trade(&position(0, 0.0)).await;

        // same trade, now closed with pnl
        let mut updated = position(0, 42.0);
        updated.is_open = false;
        state.upsert_trade(&updated).await;

        state.upsert_trade(&position(5, 0.0)).await;

        let trades = state.trades().await;
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].pnl, 42.0);
        assert!(!trades[0].is_open);
    }

    #[tokio::test]
    async fn test_equity_is_bounded() {
        let state = DashboardState::new();
        for i in 0..(MAX_EQUITY_POINTS + 10) {
            state.push_equity(Utc::now(), i as f64, 0.0).await;
        }

        let equity = state.equity().await;
        assert_eq!(equity.len(), MAX_EQUITY_POINTS);
        assert_eq!(equity[0].balance, 10.0);
    }

    #[tokio::test]
    async fn test_equity_includes_open_pnl() {
        let state = DashboardState::new();
        state.push_equity(Utc::now(), 1_000.0, 25.0).await;

        let point = &state.equity().await[0];
        assert_eq!(point.balance, 1_000.0);
        assert_eq!(point.equity, 1_025.0);
        assert_eq!(point.open_pnl, 25.0);
    }
}
