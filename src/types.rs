// =============================================================================
// Shared types used across the candle pipeline
// =============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::TradeRejection;
use crate::market_data::Candle;

/// Latest accepted trade time, 9999-12-31T23:59:59.999Z. Far enough below
/// `i64::MAX` that adding any window length cannot overflow.
pub const MAX_TIMESTAMP_MS: i64 = 253_402_300_799_999;

/// A single executed trade as delivered by a trade source.
///
/// Immutable once produced; the pipeline consumes it and never stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    #[serde(alias = "pair")]
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub timestamp_ms: i64,
}

impl Trade {
    pub fn new(symbol: impl Into<String>, price: f64, volume: f64, timestamp_ms: i64) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            volume,
            timestamp_ms,
        }
    }

    /// Reject trades that would corrupt an aggregate.
    pub fn validate(&self) -> Result<(), TradeRejection> {
        if self.symbol.trim().is_empty() {
            return Err(TradeRejection::malformed("empty symbol"));
        }
        if !self.price.is_finite() || self.price < 0.0 {
            return Err(TradeRejection::malformed(format!(
                "invalid price {} for {}",
                self.price, self.symbol
            )));
        }
        if !self.volume.is_finite() || self.volume < 0.0 {
            return Err(TradeRejection::malformed(format!(
                "invalid volume {} for {}",
                self.volume, self.symbol
            )));
        }
        if self.timestamp_ms < 0 {
            return Err(TradeRejection::malformed(format!(
                "negative timestamp {} for {}",
                self.timestamp_ms, self.symbol
            )));
        }
        if self.timestamp_ms > MAX_TIMESTAMP_MS {
            return Err(TradeRejection::malformed(format!(
                "timestamp {} for {} is beyond year 9999",
                self.timestamp_ms, self.symbol
            )));
        }
        Ok(())
    }
}

/// Exchange pairs are keyed with a dash so they are safe as store keys and
/// file names (`BTC/USD` -> `BTC-USD`).
pub fn normalize_symbol(pair: &str) -> String {
    pair.trim().replace('/', "-").to_uppercase()
}

/// A trade together with its position in the source stream.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcedTrade {
    pub offset: u64,
    pub trade: Trade,
}

// ---------------------------------------------------------------------------
// Output channel messages
// ---------------------------------------------------------------------------

/// Wire shape of the candle output channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleMessage {
    pub symbol: String,
    /// Timestamp of the last trade folded into the candle.
    pub timestamp_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub window_start_ms: i64,
    pub window_end_ms: i64,
    pub candle_seconds: u32,
}

impl CandleMessage {
    pub fn from_candle(candle: &Candle, candle_seconds: u32) -> Self {
        Self {
            symbol: candle.symbol.clone(),
            timestamp_ms: candle.last_trade_timestamp_ms,
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
            window_start_ms: candle.window_start_ms,
            window_end_ms: candle.window_end_ms,
            candle_seconds,
        }
    }

    pub fn to_candle(&self) -> Candle {
        Candle {
            symbol: self.symbol.clone(),
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            window_start_ms: self.window_start_ms,
            window_end_ms: self.window_end_ms,
            last_trade_timestamp_ms: self.timestamp_ms,
        }
    }
}

/// Wire shape of the indicator output channel: the candle fields merged with
/// an `indicators` object whose unavailable entries serialise as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorMessage {
    #[serde(flatten)]
    pub candle: CandleMessage,
    pub indicators: BTreeMap<String, Option<f64>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_zero_volume() {
        assert!(Trade::new("BTC-USD", 100.0, 0.0, 0).validate().is_ok());
    }

    #[test]
    fn validate_rejects_negative_volume() {
        let err = Trade::new("BTC-USD", 100.0, -1.0, 0).validate().unwrap_err();
        assert!(matches!(err, TradeRejection::Malformed { .. }));
    }

    #[test]
    fn validate_rejects_nan_price() {
        assert!(Trade::new("BTC-USD", f64::NAN, 1.0, 0).validate().is_err());
    }

    #[test]
    fn validate_rejects_blank_symbol() {
        assert!(Trade::new("  ", 1.0, 1.0, 0).validate().is_err());
    }

    #[test]
    fn validate_rejects_far_future_timestamp() {
        assert!(Trade::new("BTC-USD", 1.0, 1.0, MAX_TIMESTAMP_MS).validate().is_ok());
        let err = Trade::new("BTC-USD", 1.0, 1.0, i64::MAX).validate().unwrap_err();
        assert!(matches!(err, TradeRejection::Malformed { .. }));
    }

    #[test]
    fn trade_deserialises_pair_alias() {
        let json = r#"{"pair":"BTC/USD","price":1.5,"volume":2.0,"timestamp_ms":10}"#;
        let trade: Trade = serde_json::from_str(json).unwrap();
        assert_eq!(trade.symbol, "BTC/USD");
        assert_eq!(trade.timestamp_ms, 10);
    }

    #[test]
    fn normalize_symbol_replaces_slash() {
        assert_eq!(normalize_symbol("btc/usd"), "BTC-USD");
    }

    #[test]
    fn indicator_message_flattens_candle_fields() {
        let mut indicators = BTreeMap::new();
        indicators.insert("rsi_14".to_string(), None);
        let msg = IndicatorMessage {
            candle: CandleMessage {
                symbol: "BTC-USD".into(),
                timestamp_ms: 9,
                open: 1.0,
                high: 2.0,
                low: 0.5,
                close: 1.5,
                volume: 3.0,
                window_start_ms: 0,
                window_end_ms: 10_000,
                candle_seconds: 10,
            },
            indicators,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["symbol"], "BTC-USD");
        assert_eq!(value["candle_seconds"], 10);
        assert!(value["indicators"]["rsi_14"].is_null());
    }
}
