// =============================================================================
// Average True Range (ATR) — Wilder's smoothing
// =============================================================================
//
//   TR    = max(H - L, |H - prevClose|, |L - prevClose|)
//   ATR_0 = mean of the first `period` TR values
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
//
// Every TR needs the previous candle, so `period + 1` candles are required.
// =============================================================================

use crate::market_data::Candle;

/// Most recent ATR over `candles` (oldest first).
pub fn atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let mut true_ranges = candles.windows(2).map(|pair| {
        let (prev, cur) = (&pair[0], &pair[1]);
        (cur.high - cur.low)
            .max((cur.high - prev.close).abs())
            .max((cur.low - prev.close).abs())
    });

    let period_f = period as f64;
    let seed: f64 = true_ranges.by_ref().take(period).sum::<f64>() / period_f;
    let value = true_ranges.fold(seed, |acc, tr| (acc * (period_f - 1.0) + tr) / period_f);

    value.is_finite().then_some(value)
}
