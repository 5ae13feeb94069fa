// =============================================================================
// Relative Strength Index (RSI) — Wilder's smoothing
// =============================================================================
//
//   avg_gain_0 = mean of the first `period` gains
//   avg_gain_t = (avg_gain_{t-1} * (period - 1) + gain_t) / period
//   (same for losses)
//   RSI = 100 - 100 / (1 + avg_gain / avg_loss)
//
// Needs `period + 1` closes (one delta per consecutive pair).
// =============================================================================

/// Most recent RSI value in `[0, 100]`.
///
/// # Edge cases
/// - `period == 0` or fewer than `period + 1` closes => `None`
/// - no movement at all => 50
/// - only gains => 100
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let mut deltas = closes.windows(2).map(|w| w[1] - w[0]);
    let period_f = period as f64;

    let (mut avg_gain, mut avg_loss) = (0.0_f64, 0.0_f64);
    for d in deltas.by_ref().take(period) {
        if d > 0.0 {
            avg_gain += d;
        } else {
            avg_loss -= d;
        }
    }
    avg_gain /= period_f;
    avg_loss /= period_f;

    for d in deltas {
        avg_gain = (avg_gain * (period_f - 1.0) + d.max(0.0)) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + (-d).max(0.0)) / period_f;
    }

    let value = if avg_gain == 0.0 && avg_loss == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    };

    value.is_finite().then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsi_insufficient_data() {
        let closes: Vec<f64> = (1..=14).map(|x| x as f64).collect();
        assert!(rsi(&closes, 14).is_none());
        assert!(rsi(&closes, 0).is_none());
    }

    #[test]
    fn rsi_all_gains() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        assert_eq!(rsi(&closes, 14), Some(100.0));
    }

    #[test]
    fn rsi_all_losses() {
        let closes: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect();
        assert!(rsi(&closes, 14).unwrap().abs() < 1e-10);
    }

    #[test]
    fn rsi_flat_market() {
        assert_eq!(rsi(&[100.0; 30], 14), Some(50.0));
    }

    #[test]
    fn rsi_range_check() {
        let closes = vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            44.18, 44.22, 44.57, 43.42, 42.66, 43.13,
        ];
        let v = rsi(&closes, 14).unwrap();
        assert!((0.0..=100.0).contains(&v));
    }
}
