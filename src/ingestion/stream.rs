//! Multiplexed market data stream over a single websocket connection.
//!
//! Subscribes to kline, bookTicker and aggTrade streams for one symbol and
//! turns them into a single ordered sequence of [`Candle`] events. Trades are
//! synthesized into tick candles (throttled) so the consumer sees intrabar
//! price movement without waiting for the next kline push.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};

use crate::models::{Candle, ConnectionStatus};

use super::IngestError;

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Websocket base, e.g. `wss://stream.binance.com:9443`
    pub ws_url: String,
    pub symbol: String,
    /// Kline interval, e.g. `1m`
    pub interval: String,
    /// Capacity of the candle queue handed to the consumer
    pub queue_len: usize,
    /// No message for this long forces a reconnect
    pub idle_timeout: Duration,
    /// Pause between reconnect attempts
    pub reconnect_delay: Duration,
    /// Minimum spacing between synthesized tick candles
    pub tick_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://stream.binance.com:9443".to_string(),
            symbol: "BTCUSDT".to_string(),
            interval: "1m".to_string(),
            queue_len: 512,
            idle_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(2),
            tick_interval: Duration::from_millis(200),
        }
    }
}

/// One decoded message from the combined stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Kline(Candle),
    BookTicker { bid: f64, ask: f64 },
    Trade { price: f64, time: DateTime<Utc> },
}

// ---- wire format ----

#[derive(Deserialize)]
struct CombinedFrame {
    stream: String,
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct KlineEvent {
    k: KlinePayload,
}

#[derive(Deserialize)]
struct KlinePayload {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "x")]
    is_closed: bool,
}

#[derive(Deserialize)]
struct BookTickerEvent {
    #[serde(rename = "b")]
    bid: String,
    #[serde(rename = "a")]
    ask: String,
}

#[derive(Deserialize)]
struct AggTradeEvent {
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "T")]
    trade_time: i64,
}

fn parse_price(s: &str) -> Result<f64, IngestError> {
    s.parse::<f64>()
        .map_err(|_| IngestError::Protocol(format!("bad decimal field: {s:?}")))
}

fn millis_to_utc(ms: i64) -> Result<DateTime<Utc>, IngestError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| IngestError::Protocol(format!("bad timestamp: {ms}")))
}

/// Decode one text frame from the combined stream
///
/// Frames for streams we did not subscribe to (or ping payloads) decode to
/// `Ok(None)` rather than an error.
pub fn parse_stream_message(text: &str) -> Result<Option<StreamEvent>, IngestError> {
    let frame: CombinedFrame = serde_json::from_str(text)?;

    let event = if frame.stream.contains("@kline") {
        let kline: KlineEvent = serde_json::from_value(frame.data)?;
        let k = kline.k;
        Some(StreamEvent::Kline(Candle {
            open_time: millis_to_utc(k.open_time)?,
            open: parse_price(&k.open)?,
            high: parse_price(&k.high)?,
            low: parse_price(&k.low)?,
            close: parse_price(&k.close)?,
            volume: parse_price(&k.volume)?,
            is_closed: k.is_closed,
            is_tick: false,
            bid: None,
            ask: None,
        }))
    } else if frame.stream.ends_with("@bookTicker") {
        let bt: BookTickerEvent = serde_json::from_value(frame.data)?;
        Some(StreamEvent::BookTicker {
            bid: parse_price(&bt.bid)?,
            ask: parse_price(&bt.ask)?,
        })
    } else if frame.stream.ends_with("@aggTrade") {
        let trade: AggTradeEvent = serde_json::from_value(frame.data)?;
        Some(StreamEvent::Trade {
            price: parse_price(&trade.price)?,
            time: millis_to_utc(trade.trade_time)?,
        })
    } else {
        None
    };

    Ok(event)
}

/// Mutable tick synthesis state carried across stream events
///
/// Trades are merged into a copy of the candle currently forming and emitted
/// as tick candles, throttled by `tick_interval`. A closed candle is never
/// modified by a later trade.
struct TickState {
    forming: Option<Candle>,
    bid: Option<f64>,
    ask: Option<f64>,
    last_tick_at: Option<Instant>,
}

impl TickState {
    fn new() -> Self {
        Self {
            forming: None,
            bid: None,
            ask: None,
            last_tick_at: None,
        }
    }

    /// Apply one stream event, returning the candle to surface (if any)
    fn apply(&mut self, event: StreamEvent, tick_interval: Duration) -> Option<Candle> {
        match event {
            StreamEvent::Kline(mut candle) => {
                candle.bid = self.bid;
                candle.ask = self.ask;
                if candle.is_closed {
                    self.forming = None;
                } else {
                    self.forming = Some(candle.clone());
                }
                Some(candle)
            }
            StreamEvent::BookTicker { bid, ask } => {
                self.bid = Some(bid);
                self.ask = Some(ask);
                None
            }
            StreamEvent::Trade { price, .. } => {
                let forming = self.forming.as_mut()?;
                forming.close = price;
                forming.high = forming.high.max(price);
                forming.low = forming.low.min(price);

                let now = Instant::now();
                let throttled = self
                    .last_tick_at
                    .map(|t| now.duration_since(t) < tick_interval)
                    .unwrap_or(false);
                if throttled {
                    return None;
                }
                self.last_tick_at = Some(now);

                let mut tick = forming.clone();
                tick.is_tick = true;
                tick.bid = self.bid;
                tick.ask = self.ask;
                Some(tick)
            }
        }
    }
}

/// Live market data feed for one symbol
///
/// `start` spawns the connection task; the consumer pulls candles with
/// [`MarketStream::next_event`] and inspects health via
/// [`MarketStream::status`].
pub struct MarketStream {
    cfg: StreamConfig,
    status: Arc<Mutex<ConnectionStatus>>,
    rx: Option<mpsc::Receiver<Candle>>,
    stop: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl MarketStream {
    pub fn new(cfg: StreamConfig) -> Self {
        Self {
            cfg,
            status: Arc::new(Mutex::new(ConnectionStatus::default())),
            rx: None,
            stop: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }

    /// Start (or restart) the websocket task
    ///
    /// Idempotent: an already-running task is stopped first and the candle
    /// queue replaced, so stale events from the old connection are dropped.
    pub fn start(&mut self) {
        self.stop();

        let (tx, rx) = mpsc::channel(self.cfg.queue_len);
        self.rx = Some(rx);
        self.stop = Arc::new(AtomicBool::new(false));

        let cfg = self.cfg.clone();
        let status = Arc::clone(&self.status);
        let stop = Arc::clone(&self.stop);
        self.task = Some(tokio::spawn(async move {
            run_loop(cfg, tx, status, stop).await;
        }));
    }

    /// Signal the connection task to wind down
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.rx = None;
    }

    /// Wait up to `timeout` for the next candle; `None` on timeout or if the
    /// stream is not running
    pub async fn next_event(&mut self, timeout: Duration) -> Option<Candle> {
        let rx = self.rx.as_mut()?;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    /// Snapshot of connection health
    pub async fn status(&self) -> ConnectionStatus {
        let mut status = self.status.lock().await.clone();
        status.seconds_since_last_candle = status
            .last_candle_time
            .map(|t| (Utc::now() - t).num_milliseconds() as f64 / 1000.0);
        status
    }
}

impl Drop for MarketStream {
    fn drop(&mut self) {
        self.stop();
    }
}

fn combined_stream_url(cfg: &StreamConfig) -> String {
    let symbol = cfg.symbol.to_lowercase();
    format!(
        "{}/stream?streams={symbol}@kline_{}/{symbol}@bookTicker/{symbol}@aggTrade",
        cfg.ws_url, cfg.interval
    )
}

async fn run_loop(
    cfg: StreamConfig,
    tx: mpsc::Sender<Candle>,
    status: Arc<Mutex<ConnectionStatus>>,
    stop: Arc<AtomicBool>,
) {
    let url = combined_stream_url(&cfg);

    while !stop.load(Ordering::Relaxed) {
        {
            let mut s = status.lock().await;
            s.connection_attempts += 1;
        }

        match connect_async(&url).await {
            Ok((ws, _)) => {
                info!(url = %url, "market stream connected");
                {
                    let mut s = status.lock().await;
                    s.connected = true;
                    s.last_error = None;
                }

                let (_, mut read) = ws.split();
                let mut ticks = TickState::new();

                loop {
                    if stop.load(Ordering::Relaxed) {
                        return;
                    }

                    // silence on the socket for too long means the feed is
                    // dead even if TCP still looks alive
                    let frame =
                        match tokio::time::timeout(cfg.idle_timeout, read.next()).await {
                            Ok(Some(frame)) => frame,
                            Ok(None) => {
                                warn!("market stream closed by peer");
                                break;
                            }
                            Err(_) => {
                                warn!(
                                    idle_secs = cfg.idle_timeout.as_secs(),
                                    "market stream idle, forcing reconnect"
                                );
                                break;
                            }
                        };

                    match frame {
                        Ok(Message::Text(text)) => {
                            match parse_stream_message(&text) {
                                Ok(Some(event)) => {
                                    handle_event(event, &mut ticks, &cfg, &tx, &status).await;
                                }
                                Ok(None) => {}
                                Err(err) => {
                                    debug!(error = %err, "skipping unparseable frame");
                                }
                            }
                        }
                        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                        Ok(Message::Close(_)) => {
                            warn!("market stream received close frame");
                            break;
                        }
                        Ok(_) => {}
                        Err(err) => {
                            error!(error = %err, "market stream read error");
                            let mut s = status.lock().await;
                            s.last_error = Some(err.to_string());
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                error!(error = %err, "market stream connect failed");
                let mut s = status.lock().await;
                s.last_error = Some(err.to_string());
            }
        }

        {
            let mut s = status.lock().await;
            s.connected = false;
        }

        if stop.load(Ordering::Relaxed) {
            return;
        }
        tokio::time::sleep(cfg.reconnect_delay).await;
        info!("reconnecting market stream");
    }
}

async fn handle_event(
    event: StreamEvent,
    ticks: &mut TickState,
    cfg: &StreamConfig,
    tx: &mpsc::Sender<Candle>,
    status: &Arc<Mutex<ConnectionStatus>>,
) {
    match &event {
        StreamEvent::Kline(candle) if candle.is_closed => {
            let mut s = status.lock().await;
            s.candles_received += 1;
            s.last_candle_time = Some(candle.open_time);
        }
        StreamEvent::BookTicker { .. } => {
            let mut s = status.lock().await;
            s.book_ticker_updates += 1;
        }
        _ => {}
    }

    if let Some(candle) = ticks.apply(event, cfg.tick_interval) {
        // ticks are disposable; a closed candle getting dropped is worth a log
        if let Err(err) = tx.try_send(candle.clone()) {
            if candle.is_closed {
                warn!(error = %err, "candle queue full, dropped closed candle");
            } else {
                trace!("candle queue full, dropped tick");
            }
        }
    }
}
