//! Indicator math used by the pattern detector.

use crate::models::Candle;

/// Exponential moving average of a price series
///
/// Recursive form seeded with the first value (pandas `ewm(span, adjust=False)`
/// semantics): `ema[0] = prices[0]`, `ema[i] = alpha*prices[i] + (1-alpha)*ema[i-1]`
/// with `alpha = 2 / (span + 1)`. Defined from index 0, so the output is the
/// same length as the input.
pub fn ema_series(prices: &[f64], span: usize) -> Vec<f64> {
    if prices.is_empty() || span == 0 {
        return Vec::new();
    }

    let alpha = 2.0 / (span as f64 + 1.0);
    let mut out = Vec::with_capacity(prices.len());
    let mut ema = prices[0];
    out.push(ema);

    for &price in &prices[1..] {
        ema = alpha * price + (1.0 - alpha) * ema;
        out.push(ema);
    }

    out
}

/// Average True Range as a rolling simple mean of the true range
///
/// True range at i is the greatest of high-low, |high - prev_close| and
/// |low - prev_close|. Output is aligned with the input candles; entries are
/// `None` until a full window of true ranges is available (the first true
/// range exists at index 1, so the first value lands at index `period`).
pub fn atr_series(candles: &[Candle], period: usize) -> Vec<Option<f64>> {
    let n = candles.len();
    let mut out = vec![None; n];
    if n < 2 || period == 0 {
        return out;
    }

    let mut true_ranges = Vec::with_capacity(n - 1);
    for i in 1..n {
        let high = candles[i].high;
        let low = candles[i].low;
        let prev_close = candles[i - 1].close;

        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());
        true_ranges.push(tr);
    }

    for i in period..n {
        // window of the last `period` true ranges ending at candle i
        let window = &true_ranges[i - period..i];
        let avg = window.iter().sum::<f64>() / period as f64;
        out[i] = Some(avg);
    }

    out
}
