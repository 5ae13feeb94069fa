// =============================================================================
// Moving Averages — SMA, EMA and MACD
// =============================================================================
//
// SMA_n   = mean of the last n closes
// EMA     : k = 2 / (n + 1),  EMA_t = close_t * k + EMA_{t-1} * (1 - k)
//           seeded with the SMA of the first n closes
// MACD    = EMA_fast - EMA_slow
// Signal  = EMA_signal(MACD)
// Hist    = MACD - Signal
// =============================================================================

/// Simple moving average of the last `period` values.
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let window = &values[values.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// Full EMA series; element `i` corresponds to input index `period - 1 + i`.
///
/// Empty when `period` is zero or the input is shorter than `period`.
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }

    let k = 2.0 / (period as f64 + 1.0);
    let seed = values[..period].iter().sum::<f64>() / period as f64;

    let mut out = Vec::with_capacity(values.len() - period + 1);
    out.push(seed);
    let mut prev = seed;
    for &v in &values[period..] {
        prev = v * k + prev * (1.0 - k);
        out.push(prev);
    }
    out
}

/// Most recent EMA value.
pub fn ema(values: &[f64], period: usize) -> Option<f64> {
    ema_series(values, period).last().copied()
}

/// MACD line, signal line and histogram at the newest close.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Macd {
    pub macd: f64,
    /// `None` until there are `signal` MACD values to smooth.
    pub signal: Option<f64>,
    pub histogram: Option<f64>,
}

/// MACD with the given fast / slow / signal periods.
///
/// The MACD line needs `slow` closes; the signal line needs
/// `slow + signal - 1`.
pub fn macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Option<Macd> {
    if fast == 0 || fast >= slow {
        return None;
    }
    let fast_series = ema_series(closes, fast);
    let slow_series = ema_series(closes, slow);
    if slow_series.is_empty() {
        return None;
    }

    // Align the fast series on the slow one (both end at the newest close).
    let offset = slow - fast;
    let line: Vec<f64> = slow_series
        .iter()
        .enumerate()
        .map(|(i, s)| fast_series[i + offset] - s)
        .collect();

    let macd = *line.last()?;
    let signal = ema(&line, signal);
    Some(Macd {
        macd,
        signal,
        histogram: signal.map(|s| macd - s),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ascending(n: usize) -> Vec<f64> {
        (1..=n).map(|i| i as f64).collect()
    }

    #[test]
    fn sma_uses_trailing_window() {
        assert_eq!(sma(&[1.0, 2.0, 3.0, 4.0], 2), Some(3.5));
        assert_eq!(sma(&[1.0], 2), None);
        assert_eq!(sma(&[1.0], 0), None);
    }

    #[test]
    fn ema_seeded_with_sma() {
        let series = ema_series(&[2.0, 4.0, 6.0], 3);
        assert_eq!(series, vec![4.0]);
    }

    #[test]
    fn ema_known_values() {
        let closes = ascending(10);
        let series = ema_series(&closes, 5);
        assert_eq!(series.len(), 6);

        let k = 2.0 / 6.0;
        let mut expected = 3.0;
        for (i, &c) in closes[5..].iter().enumerate() {
            expected = c * k + expected * (1.0 - k);
            assert!((series[i + 1] - expected).abs() < 1e-10);
        }
    }

    #[test]
    fn macd_warm_up() {
        assert!(macd(&ascending(25), 12, 26, 9).is_none());

        let partial = macd(&ascending(26), 12, 26, 9).unwrap();
        assert!(partial.signal.is_none());
        assert!(partial.histogram.is_none());

        let full = macd(&ascending(34), 12, 26, 9).unwrap();
        assert!(full.signal.is_some());
    }

    #[test]
    fn macd_positive_in_uptrend() {
        let m = macd(&ascending(60), 12, 26, 9).unwrap();
        assert!(m.macd > 0.0);
    }

    #[test]
    fn macd_flat_is_zero() {
        let m = macd(&[50.0; 40], 12, 26, 9).unwrap();
        assert!(m.macd.abs() < 1e-10);
        assert!(m.histogram.unwrap().abs() < 1e-10);
    }
}
