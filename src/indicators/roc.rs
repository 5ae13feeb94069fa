// =============================================================================
// Momentum — Rate of Change (ROC) and On-Balance Volume (OBV)
// =============================================================================
//
// ROC = (close - close_n) / close_n * 100
// OBV accumulates volume with the sign of each close-to-close move.

use crate::market_data::Candle;

/// Percentage change over `period` closes. `None` during warm-up or when the
/// reference close is zero.
pub fn roc(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() <= period {
        return None;
    }
    let last = closes[closes.len() - 1];
    let reference = closes[closes.len() - 1 - period];
    if reference == 0.0 {
        return None;
    }
    Some((last - reference) / reference * 100.0)
}

/// On-balance volume over the whole history. Needs two candles.
pub fn obv(candles: &[Candle]) -> Option<f64> {
    if candles.len() < 2 {
        return None;
    }
    let total = candles.windows(2).fold(0.0, |acc, pair| {
        let (prev, cur) = (&pair[0], &pair[1]);
        if cur.close > prev.close {
            acc + cur.volume
        } else if cur.close < prev.close {
            acc - cur.volume
        } else {
            acc
        }
    });
    Some(total)
}
