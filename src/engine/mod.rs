//! Orchestration: wires ingestion, detection and execution together.
//!
//! The live loop is the only writer of trading state. It pulls candles off
//! the stream, settles stops and takes before it looks at new signals, and
//! treats every collaborator except the executor as best-effort.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::dashboard::{server, DashboardState};
use crate::db::PostgresLedger;
use crate::execution::{ExecutionPriceModel, RiskManager, TradeExecutor, TradeLog};
use crate::ingestion::{fetch_history, MarketStream, OrderBookFeed, StreamConfig};
use crate::models::{Candle, ConnectionStatus, Direction, ExitReason, Position, Side, Signal};
use crate::notifications::TelegramNotifier;
use crate::strategy::{DetectorConfig, PatternDetector};

/// How long the loop waits for a candle before counting a timeout
const CANDLE_TIMEOUT: Duration = Duration::from_secs(30);
/// Consecutive timeouts before the feed health is questioned
const MAX_TIMEOUTS: u32 = 3;
/// A feed with no candle for this long is considered stale
const STALE_AFTER_SECS: f64 = 120.0;
/// Periodic status line cadence
const STATUS_INTERVAL: Duration = Duration::from_secs(300);
/// Order book snapshots are pushed to the dashboard at most this often
const BOOK_PUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Outcome of a backtest run
#[derive(Debug, Clone)]
pub struct BacktestReport {
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub starting_balance: f64,
    pub final_balance: f64,
}

impl BacktestReport {
    pub fn win_rate(&self) -> f64 {
        if self.trades == 0 {
            return 0.0;
        }
        self.wins as f64 / self.trades as f64
    }
}

pub struct Engine {
    detector: PatternDetector,
    executor: TradeExecutor,
    notifier: TelegramNotifier,
    dashboard: Arc<DashboardState>,
    ledger: Option<PostgresLedger>,
    wins: usize,
    losses: usize,
}

impl Engine {
    pub fn new(
        detector: PatternDetector,
        executor: TradeExecutor,
        notifier: TelegramNotifier,
        dashboard: Arc<DashboardState>,
        ledger: Option<PostgresLedger>,
    ) -> Self {
        Self {
            detector,
            executor,
            notifier,
            dashboard,
            ledger,
            wins: 0,
            losses: 0,
        }
    }

    pub fn balance(&self) -> f64 {
        self.executor.balance()
    }

    pub fn closed_trades(&self) -> usize {
        self.wins + self.losses
    }

    /// Process one candle or tick end to end
    ///
    /// Order matters: the open position settles against this candle's range
    /// before any new signal is acted on, so a stop hit and a fresh entry on
    /// the same candle never race.
    pub async fn handle_candle(&mut self, candle: &Candle) -> Result<()> {
        if !candle.is_tick {
            info!(
                time = %candle.open_time,
                close = candle.close,
                is_closed = candle.is_closed,
                "candle"
            );
        }

        self.dashboard.push_candle(candle).await;

        if let Some((closed, reason)) = self.executor.check_stop_take(candle)? {
            self.after_close(&closed, reason).await;
        }

        let update = self.detector.process_live_candle(candle);
        if update.gaps_updated {
            self.dashboard
                .set_gaps(self.detector.last_gaps().to_vec())
                .await;
        }
        if let Some(signal) = update.signal {
            self.handle_signal(&signal, candle).await?;
        }

        if candle.is_closed {
            self.executor.update_position(candle);
        }

        let open_pnl = self.executor.unrealized_pnl(candle.close);
        self.dashboard
            .push_equity(candle.open_time, self.executor.balance(), open_pnl)
            .await;
        Ok(())
    }

    async fn handle_signal(&mut self, signal: &Signal, candle: &Candle) -> Result<()> {
        let desired = match signal.direction {
            Direction::Buy => Side::Long,
            Direction::Sell => Side::Short,
        };

        if let Some(position) = self.executor.position() {
            if position.side == desired {
                debug!(side = desired.as_str(), "signal matches open position, ignoring");
                return Ok(());
            }
            // opposite signal flips the book: close first, then enter
            if let Some(closed) = self.executor.close_position(candle, ExitReason::Reversal)? {
                self.after_close(&closed, ExitReason::Reversal).await;
            }
        }

        let opened = self
            .executor
            .open_position(
                desired,
                signal.entry_price,
                signal.stop_price,
                signal.take_price,
                candle,
            )?
            .cloned();
        if let Some(position) = opened {
            self.notifier.position_opened(&position).await;
            self.dashboard.upsert_trade(&position).await;
            if let Some(ledger) = &self.ledger {
                if let Err(err) = ledger.record_open(&position).await {
                    warn!(error = %err, "ledger open insert failed");
                }
            }
        }
        Ok(())
    }

    async fn after_close(&mut self, position: &Position, reason: ExitReason) {
        if position.pnl >= 0.0 {
            self.wins += 1;
        } else {
            self.losses += 1;
        }

        let balance = self.executor.balance();
        self.notifier
            .position_closed(position, reason.as_str(), balance)
            .await;
        self.dashboard.upsert_trade(position).await;
        let closed_at = position.closed_at.unwrap_or_else(Utc::now);

        if let Some(ledger) = &self.ledger {
            if let Err(err) = ledger.record_close(position, reason, balance).await {
                warn!(error = %err, "ledger close insert failed");
            }
            if let Err(err) = ledger.insert_equity(closed_at, balance).await {
                warn!(error = %err, "ledger equity insert failed");
            }
        }
    }

    /// Restore persisted state, reconciling against the last known candle
    pub async fn recover(&mut self, last_candle: Option<&Candle>) -> Result<()> {
        if let Some(closed) = self.executor.restore_from_disk(last_candle)? {
            self.after_close(&closed, ExitReason::Recovered).await;
        }
        Ok(())
    }

    fn seed(&mut self, history: &[Candle]) {
        self.detector.seed(history);
    }
}

/// Alert text for an unhealthy feed, `None` while the feed looks fine
fn feed_issue(status: &ConnectionStatus) -> Option<String> {
    if !status.connected {
        return Some("market data disconnected, stream is reconnecting".to_string());
    }
    match status.seconds_since_last_candle {
        Some(secs) if secs > STALE_AFTER_SECS => Some(format!(
            "market data stale: connected but no closed candle for {secs:.0}s"
        )),
        _ => None,
    }
}

fn detector_config(cfg: &AppConfig) -> DetectorConfig {
    DetectorConfig {
        filter_percent: cfg.filter_percent,
        ..DetectorConfig::default()
    }
}

fn build_executor(cfg: &AppConfig) -> TradeExecutor {
    let data_dir = Path::new(&cfg.data_dir);
    TradeExecutor::new(
        cfg.symbol.clone(),
        ExecutionPriceModel::new(cfg.slippage_pct, cfg.taker_fee_pct),
        RiskManager::new(cfg.starting_balance, cfg.risk_percent),
        TradeLog::new(data_dir),
        data_dir.join("open_position.json"),
    )
}

/// Run the live trading loop until the process is stopped
pub async fn run_live(cfg: AppConfig) -> Result<()> {
    std::fs::create_dir_all(&cfg.data_dir)
        .with_context(|| format!("creating data dir {}", cfg.data_dir))?;

    let dashboard = Arc::new(DashboardState::new());
    let notifier = TelegramNotifier::new(&cfg.telegram_token, &cfg.telegram_chat_id);
    let ledger = PostgresLedger::connect(&cfg.database_url).await;

    let server_state = Arc::clone(&dashboard);
    let dashboard_addr = cfg.dashboard_addr.clone();
    tokio::spawn(async move {
        if let Err(err) = server::serve(&dashboard_addr, server_state).await {
            error!(error = %err, "dashboard server exited");
        }
    });

    let mut book = OrderBookFeed::start(&cfg.ws_url, &cfg.symbol, Duration::from_secs(2));

    let history = fetch_history(&cfg.rest_url, &cfg.symbol, &cfg.interval, cfg.history_limit)
        .await
        .context("history bootstrap")?;
    for candle in &history {
        dashboard.push_candle(candle).await;
    }

    let mut engine = Engine::new(
        PatternDetector::new(detector_config(&cfg)),
        build_executor(&cfg),
        notifier,
        Arc::clone(&dashboard),
        ledger,
    );
    engine.seed(&history);
    if !history.is_empty() {
        // populate the gap overlay before the first live candle lands
        let detection = engine.detector.detect(&history);
        dashboard.set_gaps(detection.gaps).await;
    }
    engine.recover(history.last()).await?;

    engine
        .notifier
        .send(&format!(
            "🚀 gapbot live: {} {} | balance {:.2}",
            cfg.symbol,
            cfg.interval,
            engine.balance()
        ))
        .await;

    let mut stream = MarketStream::new(StreamConfig {
        ws_url: cfg.ws_url.clone(),
        symbol: cfg.symbol.clone(),
        interval: cfg.interval.clone(),
        ..StreamConfig::default()
    });
    stream.start();
    info!(symbol = %cfg.symbol, interval = %cfg.interval, "live engine started");

    let mut consecutive_timeouts = 0u32;
    let mut last_book_push = Instant::now() - BOOK_PUSH_INTERVAL;
    let mut last_status_log = Instant::now();

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            event = stream.next_event(CANDLE_TIMEOUT) => event,
        };

        match event {
            Some(candle) => {
                consecutive_timeouts = 0;

                // one bad candle must not end the session
                if let Err(err) = engine.handle_candle(&candle).await {
                    error!(error = %err, "candle handling failed");
                }

                if last_book_push.elapsed() >= BOOK_PUSH_INTERVAL {
                    dashboard.set_orderbook(book.snapshot().await).await;
                    last_book_push = Instant::now();
                }
            }
            None => {
                consecutive_timeouts += 1;
                warn!(count = consecutive_timeouts, "no candle within timeout");

                if consecutive_timeouts >= MAX_TIMEOUTS {
                    consecutive_timeouts = 0;
                    if let Some(issue) = feed_issue(&stream.status().await) {
                        engine.notifier.alert(&issue).await;
                    }
                }
            }
        }

        let status = stream.status().await;
        dashboard.set_status(status.clone()).await;
        if last_status_log.elapsed() >= STATUS_INTERVAL {
            info!(
                connected = status.connected,
                candles = status.candles_received,
                attempts = status.connection_attempts,
                balance = %format!("{:.2}", engine.balance()),
                trades = engine.closed_trades(),
                "engine status"
            );
            if let Some(issue) = feed_issue(&status) {
                engine.notifier.alert(&issue).await;
            }
            last_status_log = Instant::now();
        }
    }

    stream.stop();
    book.stop();
    engine
        .notifier
        .send(&format!("👋 gapbot stopped, balance {:.2}", engine.balance()))
        .await;
    Ok(())
}

/// Replay a candle CSV through the full signal and execution path
pub async fn run_backtest(cfg: AppConfig) -> Result<BacktestReport> {
    std::fs::create_dir_all(&cfg.data_dir)
        .with_context(|| format!("creating data dir {}", cfg.data_dir))?;

    let contents = std::fs::read_to_string(&cfg.backtest_file)
        .with_context(|| format!("reading backtest file {}", cfg.backtest_file))?;
    let candles = parse_backtest_csv(&contents)?;
    info!(count = candles.len(), file = %cfg.backtest_file, "backtest loaded");

    let mut engine = Engine::new(
        PatternDetector::new(detector_config(&cfg)),
        build_executor(&cfg),
        TelegramNotifier::new(&cfg.telegram_token, &cfg.telegram_chat_id),
        Arc::new(DashboardState::new()),
        None,
    );

    for candle in &candles {
        engine.handle_candle(candle).await?;
    }

    let report = BacktestReport {
        trades: engine.closed_trades(),
        wins: engine.wins,
        losses: engine.losses,
        starting_balance: cfg.starting_balance,
        final_balance: engine.balance(),
    };
    info!(
        trades = report.trades,
        win_rate = %format!("{:.1}%", report.win_rate() * 100.0),
        pnl = %format!("{:+.2}", report.final_balance - report.starting_balance),
        "backtest finished"
    );
    engine
        .notifier
        .send(&format!(
            "📊 backtest {}: {} trades, {:.1}% win rate, balance {:.2} -> {:.2}",
            cfg.symbol,
            report.trades,
            report.win_rate() * 100.0,
            report.starting_balance,
            report.final_balance,
        ))
        .await;
    Ok(report)
}

/// Parse `time,open,high,low,close,volume` rows; time is epoch seconds,
/// epoch milliseconds or RFC 3339
pub fn parse_backtest_csv(contents: &str) -> Result<Vec<Candle>> {
    let mut candles = Vec::new();

    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || (lineno == 0 && line.to_lowercase().contains("open")) {
            continue;
        }

        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() < 6 {
            anyhow::bail!("line {}: expected 6 fields, got {}", lineno + 1, fields.len());
        }

        let open_time = parse_time(fields[0])
            .with_context(|| format!("line {}: bad time {:?}", lineno + 1, fields[0]))?;
        let num = |i: usize| -> Result<f64> {
            fields[i]
                .trim()
                .parse::<f64>()
                .with_context(|| format!("line {}: bad number {:?}", lineno + 1, fields[i]))
        };

        candles.push(Candle {
            open_time,
            open: num(1)?,
            high: num(2)?,
            low: num(3)?,
            close: num(4)?,
            volume: num(5)?,
            is_closed: true,
            is_tick: false,
            bid: None,
            ask: None,
        });
    }

    Ok(candles)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(n) = raw.parse::<i64>() {
        // heuristic: anything past the year 33658 in seconds is milliseconds
        let ts = if n > 1_000_000_000_000 {
            Utc.timestamp_millis_opt(n)
        } else {
            Utc.timestamp_opt(n, 0)
        };
        return ts.single().context("timestamp out of range");
    }
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration as StdDuration;
    use tempfile::TempDir;

    fn candle(i: usize, open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time: Utc.timestamp_opt(1_700_000_000 + i as i64 * 60, 0).unwrap(),
            open,
            high,
            low,
            close,
            volume: 100.0,
            is_closed: true,
            is_tick: false,
            bid: None,
            ask: None,
        }
    }

    fn test_engine(dir: &TempDir) -> Engine {
        let detector = PatternDetector::new(DetectorConfig {
            ema_span: 3,
            filter_percent: 0.5,
            risk_multiple: 3.0,
            max_age: 100,
            min_atr_factor: 0.0,
            atr_period: 14,
            buffer_len: 50,
            min_candles: 5,
            refresh_interval: StdDuration::from_secs(5),
        });
        let executor = TradeExecutor::new(
            "BTCUSDT",
            ExecutionPriceModel::new(0.0, 0.0),
            RiskManager::new(10_000.0, 10.0),
            TradeLog::new(dir.path()),
            dir.path().join("open_position.json"),
        );
        Engine::new(
            detector,
            executor,
            TelegramNotifier::new("", ""),
            Arc::new(DashboardState::new()),
            None,
        )
    }

    /// Gap at index 5 (mid 10.65), retested at index 7
    fn retest_series() -> Vec<Candle> {
        vec![
            candle(0, 10.0, 10.2, 9.8, 10.0),
            candle(1, 10.0, 10.2, 9.8, 10.0),
            candle(2, 10.0, 10.2, 9.8, 10.1),
            candle(3, 10.1, 10.3, 9.9, 10.2),
            candle(4, 10.2, 10.8, 10.2, 10.7),
            candle(5, 10.7, 11.5, 11.0, 11.4),
            candle(6, 11.4, 11.6, 11.1, 11.5),
            candle(7, 11.5, 11.6, 10.6, 11.3),
        ]
    }

    #[tokio::test]
    async fn test_signal_opens_position() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = test_engine(&dir);

        for c in retest_series() {
            engine.handle_candle(&c).await.unwrap();
        }

        let position = engine.executor.position().expect("position opened on retest");
        assert_eq!(position.side, Side::Long);
        assert!((position.entry_raw - 10.65).abs() < 1e-9);
        assert_eq!(position.stop_loss, 9.9);

        // dashboard saw the open
        assert_eq!(engine.dashboard.trades().await.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_hit_closes_and_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = test_engine(&dir);

        for c in retest_series() {
            engine.handle_candle(&c).await.unwrap();
        }
        assert!(engine.executor.position().is_some());

        // crash through the stop at 9.9
        engine
            .handle_candle(&candle(8, 11.3, 11.3, 9.5, 9.6))
            .await
            .unwrap();

        assert!(engine.executor.position().is_none());
        assert_eq!(engine.closed_trades(), 1);
        assert_eq!(engine.losses, 1);
        assert!(engine.balance() < 10_000.0);

        // one equity point per candle; the last one is flat at the new balance
        let equity = engine.dashboard.equity().await;
        assert_eq!(equity.len(), 9);
        let last = equity.last().unwrap();
        assert_eq!(last.open_pnl, 0.0);
        assert!(last.balance < 10_000.0);
        assert_eq!(last.equity, last.balance);
    }

    #[tokio::test]
    async fn test_duplicate_signal_direction_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = test_engine(&dir);

        for c in retest_series() {
            engine.handle_candle(&c).await.unwrap();
        }
        let first_id = engine.executor.position().unwrap().id;

        let signal = Signal {
            index: 8,
            time: Utc::now(),
            direction: Direction::Buy,
            entry_price: 10.7,
            stop_price: 10.0,
            take_price: 12.8,
            risk: 0.7,
        };
        engine
            .handle_signal(&signal, &candle(8, 11.3, 11.4, 11.2, 11.3))
            .await
            .unwrap();

        // still the same position, no churn
        assert_eq!(engine.executor.position().unwrap().id, first_id);
        assert_eq!(engine.closed_trades(), 0);
    }

    #[tokio::test]
    async fn test_reversal_closes_then_opens() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = test_engine(&dir);

        for c in retest_series() {
            engine.handle_candle(&c).await.unwrap();
        }
        assert_eq!(engine.executor.position().unwrap().side, Side::Long);

        let signal = Signal {
            index: 8,
            time: Utc::now(),
            direction: Direction::Sell,
            entry_price: 11.0,
            stop_price: 11.8,
            take_price: 8.6,
            risk: 0.8,
        };
        engine
            .handle_signal(&signal, &candle(8, 11.0, 11.1, 10.9, 11.0))
            .await
            .unwrap();

        let position = engine.executor.position().expect("flipped into a short");
        assert_eq!(position.side, Side::Short);
        // the long was settled on the way out
        assert_eq!(engine.closed_trades(), 1);
    }

    #[test]
    fn test_feed_issue_detection() {
        let disconnected = ConnectionStatus::default();
        assert!(feed_issue(&disconnected)
            .is_some_and(|msg| msg.contains("disconnected")));

        let healthy = ConnectionStatus {
            connected: true,
            seconds_since_last_candle: Some(10.0),
            ..Default::default()
        };
        assert!(feed_issue(&healthy).is_none());

        let stale = ConnectionStatus {
            connected: true,
            seconds_since_last_candle: Some(300.0),
            ..Default::default()
        };
        assert!(feed_issue(&stale).is_some_and(|msg| msg.contains("stale")));
    }

    #[test]
    fn test_parse_backtest_csv_with_header() {
        let csv = "time,open,high,low,close,volume\n\
                   1700000000,10.0,10.5,9.5,10.2,100\n\
                   1700000060000,10.2,10.6,9.8,10.3,120\n\
                   2023-11-14T22:16:00Z,10.3,10.7,9.9,10.4,80\n";
        let candles = parse_backtest_csv(csv).unwrap();

        assert_eq!(candles.len(), 3);
        assert_eq!(candles[0].open_time.timestamp(), 1_700_000_000);
        assert_eq!(candles[1].open_time.timestamp(), 1_700_000_060);
        assert!(candles.iter().all(|c| c.is_closed));
    }

    #[test]
    fn test_parse_backtest_csv_rejects_short_rows() {
        assert!(parse_backtest_csv("1700000000,10.0,10.5\n").is_err());
    }

    #[test]
    fn test_backtest_report_win_rate() {
        let report = BacktestReport {
            trades: 4,
            wins: 3,
            losses: 1,
            starting_balance: 1_000.0,
            final_balance: 1_100.0,
        };
        assert!((report.win_rate() - 0.75).abs() < 1e-12);

        let empty = BacktestReport {
            trades: 0,
            wins: 0,
            losses: 0,
            starting_balance: 1_000.0,
            final_balance: 1_000.0,
        };
        assert_eq!(empty.win_rate(), 0.0);
    }
}
