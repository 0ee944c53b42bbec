//! Fair value gap detection (three-candle imbalance model).

use crate::models::{Candle, FairValueGap, GapKind};

/// Scan a candle series for fair value gaps
///
/// For each index i >= 2 the three candles C0 = i-2, C1 = i-1, C2 = i are
/// examined:
///
/// - Bullish gap: `high(C0) < low(C2)`, `high(C0) < high(C1)`,
///   `low(C0) < low(C2)` and the gap size `((low(C2) - high(C0)) / low(C2)) * 100`
///   exceeds `filter_percent`. Zone top = low(C2), bottom = high(C0).
/// - Bearish gap mirrors on the other side: `low(C0) > high(C2)`,
///   `low(C0) > low(C1)`, `high(C0) > high(C2)`, sized against low(C0).
///   Zone top = low(C0), bottom = high(C2).
///
/// `end_index` is initialized to the formation index; the detector fills in
/// the retest/expiry index afterwards. Pure function, no side effects.
pub fn detect_fvg(candles: &[Candle], filter_percent: f64) -> Vec<FairValueGap> {
    let n = candles.len();
    if n < 3 {
        return Vec::new();
    }

    let mut gaps = Vec::new();

    for i in 2..n {
        let h0 = candles[i - 2].high;
        let h1 = candles[i - 1].high;
        let h2 = candles[i].high;
        let l0 = candles[i - 2].low;
        let l1 = candles[i - 1].low;
        let l2 = candles[i].low;

        let filt_up = if l2 != 0.0 { (l2 - h0) / l2 * 100.0 } else { 0.0 };
        if h0 < l2 && h0 < h1 && l0 < l2 && filt_up > filter_percent {
            let top = l2;
            let bottom = h0;
            gaps.push(FairValueGap {
                index: i,
                kind: GapKind::Bullish,
                top,
                bottom,
                mid: (top + bottom) / 2.0,
                gap_pct: filt_up,
                end_index: i,
            });
        }

        let filt_dn = if l0 != 0.0 { (l0 - h2) / l0 * 100.0 } else { 0.0 };
        if l0 > h2 && l0 > l1 && h0 > h2 && filt_dn > filter_percent {
            let top = l0;
            let bottom = h2;
            gaps.push(FairValueGap {
                index: i,
                kind: GapKind::Bearish,
                top,
                bottom,
                mid: (top + bottom) / 2.0,
                gap_pct: filt_dn,
                end_index: i,
            });
        }
    }

    gaps
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn candle(i: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time: Utc.timestamp_opt(1_700_000_000 + i * 60, 0).unwrap(),
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

    #[test]
    fn test_bullish_gap_detected() {
        // C0 high 10 < C2 low 11.2, C1 high above C0, strong displacement
        let candles = vec![
            candle(0, 9.5, 10.0, 9.0, 9.8),
            candle(1, 9.8, 10.5, 9.8, 10.4),
            candle(2, 10.4, 12.0, 11.2, 11.8),
        ];

        let gaps = detect_fvg(&candles, 0.5);
        assert_eq!(gaps.len(), 1);

        let gap = &gaps[0];
        assert_eq!(gap.kind, GapKind::Bullish);
        assert_eq!(gap.index, 2);
        assert_eq!(gap.top, 11.2);
        assert_eq!(gap.bottom, 10.0);
        assert_eq!(gap.mid, (11.2 + 10.0) / 2.0);
        assert!(gap.top > gap.bottom);
    }

    #[test]
    fn test_bearish_gap_detected() {
        let candles = vec![
            candle(0, 11.8, 12.0, 11.2, 11.4),
            candle(1, 11.1, 11.1, 10.4, 10.6),
            candle(2, 10.6, 10.0, 9.0, 9.2),
        ];

        let gaps = detect_fvg(&candles, 0.5);
        assert_eq!(gaps.len(), 1);

        let gap = &gaps[0];
        assert_eq!(gap.kind, GapKind::Bearish);
        assert_eq!(gap.top, 11.2);
        assert_eq!(gap.bottom, 10.0);
        assert_eq!(gap.mid, (11.2 + 10.0) / 2.0);
        assert!(gap.top > gap.bottom);
    }

    #[test]
    fn test_filter_percent_rejects_small_gap() {
        // gap of ~0.2% between C0 high and C2 low
        let candles = vec![
            candle(0, 99.9, 100.0, 99.5, 99.9),
            candle(1, 99.9, 100.4, 99.9, 100.2),
            candle(2, 100.2, 100.6, 100.2, 100.5),
        ];

        assert!(detect_fvg(&candles, 0.5).is_empty());
        // same geometry passes with a zero filter
        assert_eq!(detect_fvg(&candles, 0.0).len(), 1);
    }

    #[test]
    fn test_no_gap_without_displacement() {
        // overlapping candles: no imbalance
        let candles = vec![
            candle(0, 10.0, 10.5, 9.5, 10.2),
            candle(1, 10.2, 10.6, 9.8, 10.3),
            candle(2, 10.3, 10.7, 10.0, 10.5),
        ];

        assert!(detect_fvg(&candles, 0.0).is_empty());
    }

    #[test]
    fn test_too_few_candles() {
        let candles = vec![
            candle(0, 10.0, 10.5, 9.5, 10.2),
            candle(1, 10.2, 12.6, 11.8, 12.3),
        ];
        assert!(detect_fvg(&candles, 0.5).is_empty());
    }

    #[test]
    fn test_mid_is_exact_average() {
        let candles = vec![
            candle(0, 9.5, 10.0, 9.0, 9.8),
            candle(1, 9.8, 10.5, 9.8, 10.4),
            candle(2, 10.4, 12.0, 11.2, 11.8),
        ];

        for gap in detect_fvg(&candles, 0.0) {
            assert_eq!(gap.mid, (gap.top + gap.bottom) / 2.0);
        }
    }
}
