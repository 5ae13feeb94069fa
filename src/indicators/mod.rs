// =============================================================================
// Indicator Engine
// =============================================================================
//
// An indicator engine is a pure function of a candle history snapshot
// (oldest -> newest). No hidden state and no I/O, so any result can be
// reproduced from the snapshot alone. Every indicator the engine knows about
// appears in the output; one that lacks history is reported as `None`
// (unavailable) instead of failing or being omitted.
// =============================================================================

pub mod atr;
pub mod bollinger;
pub mod moving_average;
pub mod roc;
pub mod rsi;

use std::collections::BTreeMap;

use crate::error::IndicatorError;
use crate::market_data::Candle;
use crate::types::{CandleMessage, IndicatorMessage};

/// Indicator name -> value, `None` while the indicator is warming up.
pub type IndicatorValues = BTreeMap<String, Option<f64>>;

/// Capability interface for the indicator stage. Implementations are chosen
/// at startup and shared read-only between partitions.
pub trait IndicatorEngine: Send + Sync {
    /// Every name `compute` reports, used to build an all-unavailable block
    /// when a computation fails.
    fn names(&self) -> Vec<String>;

    fn compute(&self, history: &[Candle]) -> Result<IndicatorValues, IndicatorError>;

    /// Same keys as `compute`, every value unavailable.
    fn unavailable(&self) -> IndicatorValues {
        self.names().into_iter().map(|n| (n, None)).collect()
    }
}

/// Snapshot produced after each history upsert. Derived, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorRecord {
    pub symbol: String,
    pub window_end_ms: i64,
    pub candle: Candle,
    pub indicators: IndicatorValues,
}

impl IndicatorRecord {
    pub fn new(candle: Candle, indicators: IndicatorValues) -> Self {
        Self {
            symbol: candle.symbol.clone(),
            window_end_ms: candle.window_end_ms,
            candle,
            indicators,
        }
    }

    pub fn to_message(&self, candle_seconds: u32) -> IndicatorMessage {
        IndicatorMessage {
            candle: CandleMessage::from_candle(&self.candle, candle_seconds),
            indicators: self.indicators.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Default engine
// ---------------------------------------------------------------------------

/// Look-back periods for the default indicator set.
#[derive(Debug, Clone)]
pub struct DefaultIndicatorEngine {
    pub sma_periods: Vec<usize>,
    pub ema_periods: Vec<usize>,
    pub rsi_periods: Vec<usize>,
    pub macd: (usize, usize, usize),
    pub bollinger_period: usize,
    pub bollinger_std: f64,
    pub atr_period: usize,
    pub roc_period: usize,
}

impl Default for DefaultIndicatorEngine {
    fn default() -> Self {
        Self {
            sma_periods: vec![7, 14],
            ema_periods: vec![7, 14],
            rsi_periods: vec![9, 14],
            macd: (12, 26, 9),
            bollinger_period: 20,
            bollinger_std: 2.0,
            atr_period: 14,
            roc_period: 10,
        }
    }
}

impl DefaultIndicatorEngine {
    fn check_history(history: &[Candle]) -> Result<(), IndicatorError> {
        for c in history {
            let finite = [c.open, c.high, c.low, c.close, c.volume]
                .iter()
                .all(|v| v.is_finite());
            if !finite {
                return Err(IndicatorError::MalformedHistory {
                    reason: format!("non-finite field in window {}", c.window_start_ms),
                });
            }
        }
        if let Some(pair) = history
            .windows(2)
            .find(|w| w[1].window_start_ms <= w[0].window_start_ms)
        {
            return Err(IndicatorError::MalformedHistory {
                reason: format!(
                    "window {} follows window {}",
                    pair[1].window_start_ms, pair[0].window_start_ms
                ),
            });
        }
        Ok(())
    }
}

impl IndicatorEngine for DefaultIndicatorEngine {
    fn names(&self) -> Vec<String> {
        let mut names = Vec::new();
        names.extend(self.sma_periods.iter().map(|p| format!("sma_{p}")));
        names.extend(self.ema_periods.iter().map(|p| format!("ema_{p}")));
        names.extend(self.rsi_periods.iter().map(|p| format!("rsi_{p}")));
        names.extend(["macd", "macd_signal", "macd_hist"].map(String::from));
        names.extend(["bb_upper", "bb_middle", "bb_lower"].map(String::from));
        names.push(format!("atr_{}", self.atr_period));
        names.push(format!("roc_{}", self.roc_period));
        names.push("obv".to_string());
        names
    }

    fn compute(&self, history: &[Candle]) -> Result<IndicatorValues, IndicatorError> {
        Self::check_history(history)?;

        let closes: Vec<f64> = history.iter().map(|c| c.close).collect();
        let mut out = IndicatorValues::new();

        for &p in &self.sma_periods {
            out.insert(format!("sma_{p}"), moving_average::sma(&closes, p));
        }
        for &p in &self.ema_periods {
            out.insert(format!("ema_{p}"), moving_average::ema(&closes, p));
        }
        for &p in &self.rsi_periods {
            out.insert(format!("rsi_{p}"), rsi::rsi(&closes, p));
        }

        let (fast, slow, signal) = self.macd;
        let macd = moving_average::macd(&closes, fast, slow, signal);
        out.insert("macd".into(), macd.map(|m| m.macd));
        out.insert("macd_signal".into(), macd.and_then(|m| m.signal));
        out.insert("macd_hist".into(), macd.and_then(|m| m.histogram));

        let bands = bollinger::bollinger(&closes, self.bollinger_period, self.bollinger_std);
        out.insert("bb_upper".into(), bands.map(|b| b.upper));
        out.insert("bb_middle".into(), bands.map(|b| b.middle));
        out.insert("bb_lower".into(), bands.map(|b| b.lower));

        out.insert(format!("atr_{}", self.atr_period), atr::atr(history, self.atr_period));
        out.insert(format!("roc_{}", self.roc_period), roc::roc(&closes, self.roc_period));
        out.insert("obv".into(), roc::obv(history));

        if let Some((name, _)) = out
            .iter()
            .find(|(_, v)| v.is_some_and(|x| !x.is_finite()))
        {
            return Err(IndicatorError::NonFinite { name: name.clone() });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(n: usize) -> Vec<Candle> {
        (0..n as i64)
            .map(|i| {
                let close = 100.0 + i as f64;
                Candle {
                    symbol: "BTC-USD".into(),
                    open: close - 0.5,
                    high: close + 1.0,
                    low: close - 1.0,
                    close,
                    volume: 2.0,
                    window_start_ms: i * 60_000,
                    window_end_ms: (i + 1) * 60_000,
                    last_trade_timestamp_ms: i * 60_000 + 30_000,
                }
            })
            .collect()
    }

    #[test]
    fn every_name_is_reported() {
        let engine = DefaultIndicatorEngine::default();
        let values = engine.compute(&history(3)).unwrap();
        let mut names = engine.names();
        names.sort();
        assert_eq!(values.keys().cloned().collect::<Vec<_>>(), names);
    }

    #[test]
    fn warm_up_reports_unavailable() {
        let engine = DefaultIndicatorEngine::default();
        let values = engine.compute(&history(10)).unwrap();
        assert!(values["sma_7"].is_some());
        assert!(values["sma_14"].is_none());
        assert!(values["rsi_9"].is_some());
        assert!(values["rsi_14"].is_none());
        assert!(values["macd"].is_none());
        assert!(values["atr_14"].is_none());
        assert!(values["roc_10"].is_none());
    }

    #[test]
    fn full_history_fills_every_value() {
        let engine = DefaultIndicatorEngine::default();
        let values = engine.compute(&history(60)).unwrap();
        assert!(values.values().all(Option::is_some));
    }

    #[test]
    fn empty_history_is_all_unavailable() {
        let engine = DefaultIndicatorEngine::default();
        let values = engine.compute(&[]).unwrap();
        assert_eq!(values, engine.unavailable());
    }

    #[test]
    fn out_of_order_history_is_an_error() {
        let engine = DefaultIndicatorEngine::default();
        let mut h = history(3);
        h.swap(1, 2);
        assert!(matches!(
            engine.compute(&h),
            Err(IndicatorError::MalformedHistory { .. })
        ));
    }

    #[test]
    fn overflow_is_reported_as_non_finite() {
        let engine = DefaultIndicatorEngine::default();
        let mut h = history(10);
        for c in &mut h {
            c.close = f64::MAX;
        }
        assert!(matches!(engine.compute(&h), Err(IndicatorError::NonFinite { .. })));
    }

    #[test]
    fn compute_is_reproducible() {
        let engine = DefaultIndicatorEngine::default();
        let h = history(40);
        assert_eq!(engine.compute(&h).unwrap(), engine.compute(&h).unwrap());
    }

    #[test]
    fn record_to_message_carries_indicators() {
        let engine = DefaultIndicatorEngine::default();
        let h = history(2);
        let record = IndicatorRecord::new(h[1].clone(), engine.compute(&h).unwrap());
        let msg = record.to_message(60);
        assert_eq!(msg.candle.window_end_ms, 120_000);
        assert_eq!(msg.candle.candle_seconds, 60);
        assert_eq!(msg.indicators["obv"], Some(2.0));
    }
}
