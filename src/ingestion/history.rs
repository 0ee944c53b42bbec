//! Historical kline bootstrap over REST.

use chrono::{TimeZone, Utc};
use serde_json::Value;
use tracing::info;

use crate::models::Candle;

use super::IngestError;

/// Parse the kline REST payload (array of arrays) into candles
///
/// The exchange appends the still-forming candle as the last row; any row
/// whose close time is in the future is dropped so callers only ever see
/// closed history.
pub fn parse_klines(body: &str, now_ms: i64) -> Result<Vec<Candle>, IngestError> {
    let rows: Vec<Vec<Value>> = serde_json::from_str(body)?;

    let mut candles = Vec::with_capacity(rows.len());
    for row in rows {
        if row.len() < 7 {
            return Err(IngestError::Protocol(format!(
                "kline row has {} fields, expected at least 7",
                row.len()
            )));
        }

        let open_time_ms = row[0]
            .as_i64()
            .ok_or_else(|| IngestError::Protocol("kline open time not an integer".into()))?;
        let close_time_ms = row[6]
            .as_i64()
            .ok_or_else(|| IngestError::Protocol("kline close time not an integer".into()))?;
        if close_time_ms > now_ms {
            continue; // still forming
        }

        let field = |i: usize| -> Result<f64, IngestError> {
            row[i]
                .as_str()
                .and_then(|s| s.parse::<f64>().ok())
                .ok_or_else(|| IngestError::Protocol(format!("bad kline field at {i}")))
        };

        candles.push(Candle {
            open_time: Utc
                .timestamp_millis_opt(open_time_ms)
                .single()
                .ok_or_else(|| IngestError::Protocol(format!("bad timestamp: {open_time_ms}")))?,
            open: field(1)?,
            high: field(2)?,
            low: field(3)?,
            close: field(4)?,
            volume: field(5)?,
            is_closed: true,
            is_tick: false,
            bid: None,
            ask: None,
        });
    }

    Ok(candles)
}

/// Fetch up to `limit` closed candles to seed the detector buffer
pub async fn fetch_history(
    rest_url: &str,
    symbol: &str,
    interval: &str,
    limit: usize,
) -> Result<Vec<Candle>, IngestError> {
    let url = format!(
        "{rest_url}/api/v3/klines?symbol={}&interval={interval}&limit={limit}",
        symbol.to_uppercase()
    );

    let body = reqwest::get(&url).await?.error_for_status()?.text().await?;
    let candles = parse_klines(&body, Utc::now().timestamp_millis())?;
    info!(count = candles.len(), symbol, interval, "loaded candle history");
    Ok(candles)
}
