//! Order book depth feed, independent of the main market stream.
//!
//! Runs its own websocket connection so a stalled depth stream never blocks
//! candle delivery. The latest snapshot sits behind an `RwLock` for cheap
//! reads from the dashboard and orchestration loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::models::OrderBookSnapshot;

use super::IngestError;

#[derive(Deserialize)]
struct DepthPayload {
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

fn parse_level(level: &[String; 2]) -> Result<(f64, f64), IngestError> {
    let price = level[0]
        .parse::<f64>()
        .map_err(|_| IngestError::Protocol(format!("bad depth price: {:?}", level[0])))?;
    let qty = level[1]
        .parse::<f64>()
        .map_err(|_| IngestError::Protocol(format!("bad depth quantity: {:?}", level[1])))?;
    Ok((price, qty))
}

/// Decode one partial depth frame into a snapshot
pub fn parse_depth_message(text: &str) -> Result<OrderBookSnapshot, IngestError> {
    let payload: DepthPayload = serde_json::from_str(text)?;

    let bids = payload
        .bids
        .iter()
        .map(parse_level)
        .collect::<Result<Vec<_>, _>>()?;
    let asks = payload
        .asks
        .iter()
        .map(parse_level)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(OrderBookSnapshot { bids, asks })
}

/// Live top-of-book depth for one symbol
pub struct OrderBookFeed {
    snapshot: Arc<RwLock<OrderBookSnapshot>>,
    stop: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl OrderBookFeed {
    /// Spawn the depth connection for `symbol` against `ws_url`
    pub fn start(ws_url: &str, symbol: &str, reconnect_delay: Duration) -> Self {
        let snapshot = Arc::new(RwLock::new(OrderBookSnapshot::default()));
        let stop = Arc::new(AtomicBool::new(false));

        let url = format!("{}/ws/{}@depth20@100ms", ws_url, symbol.to_lowercase());
        let task_snapshot = Arc::clone(&snapshot);
        let task_stop = Arc::clone(&stop);
        let task = tokio::spawn(async move {
            run_loop(url, task_snapshot, task_stop, reconnect_delay).await;
        });

        Self {
            snapshot,
            stop,
            task: Some(task),
        }
    }

    /// Latest snapshot (empty until the first frame arrives)
    pub async fn snapshot(&self) -> OrderBookSnapshot {
        self.snapshot.read().await.clone()
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for OrderBookFeed {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_loop(
    url: String,
    snapshot: Arc<RwLock<OrderBookSnapshot>>,
    stop: Arc<AtomicBool>,
    reconnect_delay: Duration,
) {
    while !stop.load(Ordering::Relaxed) {
        match connect_async(&url).await {
            Ok((ws, _)) => {
                info!(url = %url, "depth stream connected");
                let (_, mut read) = ws.split();

                while let Some(frame) = read.next().await {
                    if stop.load(Ordering::Relaxed) {
                        return;
                    }
                    match frame {
                        Ok(Message::Text(text)) => match parse_depth_message(&text) {
                            Ok(book) => *snapshot.write().await = book,
                            Err(err) => debug!(error = %err, "skipping bad depth frame"),
                        },
                        Ok(Message::Close(_)) => {
                            warn!("depth stream closed by peer");
                            break;
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!(error = %err, "depth stream read error");
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "depth stream connect failed");
            }
        }

        if stop.load(Ordering::Relaxed) {
            return;
        }
        tokio::time::sleep(reconnect_delay).await;
    }
}
