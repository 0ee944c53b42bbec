//! Gap retest strategy: trend-filtered fair value gaps with 50% retest entries.

use std::time::{Duration, Instant};

use crate::indicators::{atr_series, ema_series};
use crate::models::{Candle, Direction, FairValueGap, GapKind, Signal};
use crate::strategy::fvg::detect_fvg;

/// Tunables for the pattern detector
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// EMA span for the trend filter
    pub ema_span: usize,
    /// Minimum gap size in percent of the far side
    pub filter_percent: f64,
    /// Reward:risk ratio for the take profit
    pub risk_multiple: f64,
    /// Gap expires if not retested within this many candles
    pub max_age: usize,
    /// Reject signals whose risk is below this fraction of ATR (0 disables)
    pub min_atr_factor: f64,
    pub atr_period: usize,
    /// Rolling buffer capacity in live mode
    pub buffer_len: usize,
    /// Minimum candles buffered before live detection runs
    pub min_candles: usize,
    /// Intrabar re-detection throttle
    pub refresh_interval: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            ema_span: 50,
            filter_percent: 0.5,
            risk_multiple: 3.0,
            max_age: 100,
            min_atr_factor: 0.25,
            atr_period: 14,
            buffer_len: 1000,
            min_candles: 100,
            refresh_interval: Duration::from_secs(5),
        }
    }
}

/// Result of a full detection pass
#[derive(Debug, Clone, Default)]
pub struct Detection {
    pub gaps: Vec<FairValueGap>,
    pub signals: Vec<Signal>,
}

/// Result of feeding one live candle to the detector
#[derive(Debug, Clone, Default)]
pub struct LiveUpdate {
    /// Signal at the just-closed candle, if any
    pub signal: Option<Signal>,
    /// Whether the gap list was recomputed on this update
    pub gaps_updated: bool,
}

/// Fair value gap retest detector
///
/// `detect` is a pure pass over a candle series; live mode keeps a rolling
/// buffer and re-runs the full pass on every closed candle (and at most every
/// `refresh_interval` while a candle is still forming).
pub struct PatternDetector {
    cfg: DetectorConfig,
    buffer: Vec<Candle>,
    last_gaps: Vec<FairValueGap>,
    last_run: Option<Instant>,
}

impl PatternDetector {
    pub fn new(cfg: DetectorConfig) -> Self {
        Self {
            cfg,
            buffer: Vec::new(),
            last_gaps: Vec::new(),
            last_run: None,
        }
    }

    /// Gaps from the most recent detection pass (for visualization)
    pub fn last_gaps(&self) -> &[FairValueGap] {
        &self.last_gaps
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Seed the live buffer with historical candles (keeps the newest
    /// `buffer_len` rows)
    pub fn seed(&mut self, candles: &[Candle]) {
        self.buffer = candles.to_vec();
        let cap = self.cfg.buffer_len;
        if self.buffer.len() > cap {
            self.buffer.drain(..self.buffer.len() - cap);
        }
    }

    /// Run a full detection pass over `candles`
    ///
    /// Deterministic and side-effect-free for identical input. Returns the
    /// gap list (with retest/expiry metadata) and at most one signal per
    /// candle index, first retest wins.
    pub fn detect(&self, candles: &[Candle]) -> Detection {
        let n = candles.len();
        if n < 3 {
            return Detection::default();
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let highs: Vec<f64> = candles.iter().map(|c| c.high).collect();
        let lows: Vec<f64> = candles.iter().map(|c| c.low).collect();
        let ema = ema_series(&closes, self.cfg.ema_span);
        let atr = atr_series(candles, self.cfg.atr_period);

        let mut gaps = detect_fvg(candles, self.cfg.filter_percent);
        let mut signals: Vec<Signal> = Vec::new();

        for gap in &gaps {
            let base = gap.index;
            // needs candles behind for the stop block and ahead for the retest
            if base >= n - 1 || base < 3 {
                continue;
            }

            if !trend_ok(gap.kind, closes[base], ema[base]) {
                continue;
            }

            let Some(entry_bar) = retest_index(&highs, &lows, gap.mid, base, self.cfg.max_age, n)
            else {
                continue; // never retested within the window
            };

            if !trend_ok(gap.kind, closes[entry_bar], ema[entry_bar]) {
                continue;
            }

            // stop behind the extreme of the formation block plus the candle
            // after confirmation
            let block = (base - 2)..=(base + 1).min(n - 1);
            let entry = gap.mid;
            let (stop, risk, take, direction) = match gap.kind {
                GapKind::Bullish => {
                    let sl = lows[block].iter().cloned().fold(f64::INFINITY, f64::min);
                    let risk = entry - sl;
                    (sl, risk, entry + self.cfg.risk_multiple * risk, Direction::Buy)
                }
                GapKind::Bearish => {
                    let sl = highs[block].iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                    let risk = sl - entry;
                    (sl, risk, entry - self.cfg.risk_multiple * risk, Direction::Sell)
                }
            };

            if risk <= 0.0 || !risk.is_finite() {
                continue;
            }

            if self.cfg.min_atr_factor > 0.0 {
                if let Some(atr_base) = atr[base] {
                    if risk < atr_base * self.cfg.min_atr_factor {
                        continue;
                    }
                }
            }

            // first gap retesting a given candle wins
            if signals.iter().any(|s| s.index == entry_bar) {
                continue;
            }

            signals.push(Signal {
                index: entry_bar,
                time: candles[entry_bar].open_time,
                direction,
                entry_price: entry,
                stop_price: stop,
                take_price: take,
                risk,
            });
        }

        // retest/expiry end index for every gap, signal or not (display only)
        for gap in &mut gaps {
            let window_end = (gap.index + self.cfg.max_age).min(n - 1);
            gap.end_index = retest_index(&highs, &lows, gap.mid, gap.index, self.cfg.max_age, n)
                .unwrap_or(window_end);
        }

        Detection { gaps, signals }
    }

    /// Feed one live candle (or tick) into the rolling buffer
    ///
    /// A candle with a known `open_time` replaces its row in place; a new
    /// `open_time` appends and trims the buffer. Detection re-runs on every
    /// closed candle, and at most every `refresh_interval` while the candle
    /// is still open. A signal is only surfaced on a closed candle whose
    /// index carries one.
    pub fn process_live_candle(&mut self, candle: &Candle) -> LiveUpdate {
        match self.buffer.iter_mut().rfind(|c| c.open_time == candle.open_time) {
            Some(row) => *row = candle.clone(),
            None => {
                self.buffer.push(candle.clone());
                if self.buffer.len() > self.cfg.buffer_len {
                    let excess = self.buffer.len() - self.cfg.buffer_len;
                    self.buffer.drain(..excess);
                }
            }
        }

        let mut update = LiveUpdate::default();

        let now = Instant::now();
        let throttle_ok = self
            .last_run
            .map(|t| now.duration_since(t) >= self.cfg.refresh_interval)
            .unwrap_or(true);
        let should_refresh =
            self.buffer.len() >= self.cfg.min_candles && (candle.is_closed || throttle_ok);

        if !should_refresh {
            return update;
        }

        let detection = self.detect(&self.buffer);
        self.last_gaps = detection.gaps;
        self.last_run = Some(now);
        update.gaps_updated = true;

        if candle.is_closed {
            let last_index = self.buffer.len() - 1;
            update.signal = detection
                .signals
                .into_iter()
                .find(|s| s.index == last_index);
        }

        update
    }
}

fn trend_ok(kind: GapKind, close: f64, ema: f64) -> bool {
    if !ema.is_finite() || !close.is_finite() {
        return false;
    }
    match kind {
        GapKind::Bullish => close > ema,
        GapKind::Bearish => close < ema,
    }
}

/// First candle after `base` whose [low, high] range touches `mid`, within a
/// small relative tolerance, looking at most `max_age` candles ahead
fn retest_index(highs: &[f64], lows: &[f64], mid: f64, base: usize, max_age: usize, n: usize) -> Option<usize> {
    let tol = mid * 1e-6;
    let end = (base + max_age).min(n - 1);
    (base + 1..=end).find(|&j| lows[j] - tol <= mid && mid <= highs[j] + tol)
}
