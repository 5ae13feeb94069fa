// =============================================================================
// Bollinger Bands
// =============================================================================
//
// middle = SMA_n(close)
// upper  = middle + k * σ
// lower  = middle - k * σ
// σ is the population standard deviation over the same n closes.

/// Upper, middle and lower band at the newest close.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// `None` when `period` is zero or fewer than `period` closes are available.
pub fn bollinger(closes: &[f64], period: usize, num_std: f64) -> Option<Bands> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let middle = window.iter().sum::<f64>() / period as f64;
    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;
    let spread = num_std * variance.sqrt();

    Some(Bands {
        upper: middle + spread,
        middle,
        lower: middle - spread,
    })
}
