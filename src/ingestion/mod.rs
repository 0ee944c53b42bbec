//! Market data ingestion: websocket streams, order book depth and
//! historical bootstrap.

pub mod history;
pub mod orderbook;
pub mod stream;

use thiserror::Error;

pub use history::fetch_history;
pub use orderbook::OrderBookFeed;
pub use stream::{MarketStream, StreamConfig, StreamEvent};

// Transport failures never surface here: the connection loops log and
// reconnect internally, reporting through ConnectionStatus.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("malformed stream message: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("history request failed: {0}")]
    History(#[from] reqwest::Error),

    #[error("unexpected payload: {0}")]
    Protocol(String),
}
