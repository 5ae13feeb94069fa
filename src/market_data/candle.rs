// =============================================================================
// Candle Reducer — incremental OHLCV aggregation per (symbol, window)
// =============================================================================
//
// Lifecycle of a candle:
//   NEW    — no trade seen for the window yet (no value exists).
//   OPEN   — at least one trade folded in; mutable.
//   CLOSED — a trade for a later window arrived (or the caller flushed);
//            the value is final and handed to the emission policy once.
//
// Closure is detected, never scheduled: there is no timer. Each symbol has at
// most one OPEN window. Trades for a window earlier than the one already
// accepted are refused without touching state.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::TradeRejection;
use crate::types::Trade;

use super::window::{window_for, Window};

/// OHLCV aggregate of every trade for one symbol inside one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Cumulative traded volume.
    pub volume: f64,
    pub window_start_ms: i64,
    pub window_end_ms: i64,
    pub last_trade_timestamp_ms: i64,
}

impl Candle {
    /// NEW -> OPEN: seed every price field from the first trade.
    pub fn init(trade: &Trade, window: Window) -> Self {
        Self {
            symbol: trade.symbol.clone(),
            open: trade.price,
            high: trade.price,
            low: trade.price,
            close: trade.price,
            volume: trade.volume,
            window_start_ms: window.start_ms,
            window_end_ms: window.end_ms,
            last_trade_timestamp_ms: trade.timestamp_ms,
        }
    }

    /// Fold one more trade of the same window into the aggregate.
    pub fn update(&mut self, trade: &Trade) {
        self.high = self.high.max(trade.price);
        self.low = self.low.min(trade.price);
        self.close = trade.price;
        self.volume += trade.volume;
        self.last_trade_timestamp_ms = trade.timestamp_ms;
    }

    pub fn window(&self) -> Window {
        Window {
            start_ms: self.window_start_ms,
            end_ms: self.window_end_ms,
        }
    }

    /// Two candles describe the same window when both bounds match.
    pub fn same_window(&self, other: &Candle) -> bool {
        self.window_start_ms == other.window_start_ms && self.window_end_ms == other.window_end_ms
    }
}

// ---------------------------------------------------------------------------
// Per-symbol reducer state
// ---------------------------------------------------------------------------

/// What the reducer remembers about one symbol between trades. Persisted
/// with the rest of the symbol's state so a restart resumes mid-window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReducerState {
    /// The OPEN candle, if any.
    #[serde(default)]
    pub open: Option<Candle>,
    /// End of the most recently CLOSED window.
    #[serde(default)]
    pub last_closed_end_ms: Option<i64>,
}

/// State transition caused by one accepted trade.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// NEW -> OPEN with no predecessor to close.
    Opened,
    /// OPEN -> OPEN within the same window.
    Updated,
    /// The previous window went OPEN -> CLOSED and a new one opened.
    Rolled { closed: Candle },
}

/// Result of folding one trade.
#[derive(Debug, Clone, PartialEq)]
pub struct ReduceOutcome {
    pub transition: Transition,
    /// Value of the OPEN candle after the trade was applied.
    pub current: Candle,
}

impl ReduceOutcome {
    pub fn closed(&self) -> Option<&Candle> {
        match &self.transition {
            Transition::Rolled { closed } => Some(closed),
            _ => None,
        }
    }
}

/// Stateless driver of the NEW -> OPEN -> CLOSED machine; the state lives in
/// the caller's [`ReducerState`].
#[derive(Debug, Clone, Copy)]
pub struct CandleReducer {
    candle_seconds: u32,
}

impl CandleReducer {
    pub fn new(candle_seconds: u32) -> Self {
        Self { candle_seconds }
    }

    pub fn candle_seconds(&self) -> u32 {
        self.candle_seconds
    }

    /// Fold `trade` into `state`.
    ///
    /// Returns [`TradeRejection::LateTrade`] (and leaves `state` untouched)
    /// when the trade's window starts before the currently accepted window.
    pub fn apply(
        &self,
        state: &mut ReducerState,
        trade: &Trade,
    ) -> Result<ReduceOutcome, TradeRejection> {
        let window = window_for(trade.timestamp_ms, self.candle_seconds);

        let (transition, current) = match state.open.as_mut() {
            Some(open) if open.window() == window => {
                open.update(trade);
                (Transition::Updated, open.clone())
            }
            Some(open) if window.start_ms >= open.window_end_ms => {
                let closed = std::mem::replace(open, Candle::init(trade, window));
                state.last_closed_end_ms = Some(closed.window_end_ms);
                (Transition::Rolled { closed }, open.clone())
            }
            Some(open) => {
                return Err(TradeRejection::LateTrade {
                    symbol: trade.symbol.clone(),
                    window_start_ms: window.start_ms,
                    accepted_start_ms: open.window_start_ms,
                });
            }
            None => {
                if let Some(end) = state.last_closed_end_ms {
                    if window.start_ms < end {
                        return Err(TradeRejection::LateTrade {
                            symbol: trade.symbol.clone(),
                            window_start_ms: window.start_ms,
                            accepted_start_ms: end,
                        });
                    }
                }
                let candle = Candle::init(trade, window);
                state.open = Some(candle.clone());
                (Transition::Opened, candle)
            }
        };

        Ok(ReduceOutcome {
            transition,
            current,
        })
    }

    /// Force OPEN -> CLOSED (shutdown flush). Returns the final candle.
    pub fn close(&self, state: &mut ReducerState) -> Option<Candle> {
        let closed = state.open.take()?;
        state.last_closed_end_ms = Some(closed.window_end_ms);
        Some(closed)
    }
}
