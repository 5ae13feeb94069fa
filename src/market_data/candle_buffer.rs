// =============================================================================
// Candle History — bounded per-symbol ring of recent candles
// =============================================================================
//
// Upsert keyed by window: a candle for the newest window replaces it in place,
// any other candle is appended and the oldest entry is evicted once the ring
// holds more than `capacity`. Persisted with the rest of the symbol state.
// =============================================================================

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::candle::Candle;

/// What an upsert did to the ring.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    /// A new window was pushed to the back.
    Appended { evicted: Option<Candle> },
    /// The last entry described the same window and was replaced.
    Replaced,
}

/// Ring buffer of at most `capacity` candles for a single symbol, oldest
/// first. Candles for the window at the back are replaced in-place, so the
/// repeated emissions of an in-progress window collapse into one slot until
/// the window advances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleHistory {
    capacity: usize,
    candles: VecDeque<Candle>,
}

impl CandleHistory {
    /// Create an empty history holding at most `capacity` candles
    /// (a zero capacity is bumped to one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            candles: VecDeque::with_capacity(capacity + 1),
        }
    }

    /// Insert `candle`, or replace the newest entry when it belongs to the
    /// same window, then trim the oldest entry if the ring overflows.
    ///
    /// Applying an identical candle twice leaves the ring unchanged.
    pub fn upsert(&mut self, candle: Candle) -> UpsertOutcome {
        if let Some(last) = self.candles.back_mut() {
            if last.same_window(&candle) {
                *last = candle;
                return UpsertOutcome::Replaced;
            }
            if candle.window_start_ms < last.window_start_ms {
                warn!(
                    symbol = %candle.symbol,
                    window_start_ms = candle.window_start_ms,
                    last_window_start_ms = last.window_start_ms,
                    "appending out-of-order candle to history"
                );
            }
        }

        self.candles.push_back(candle);
        let evicted = if self.candles.len() > self.capacity {
            self.candles.pop_front()
        } else {
            None
        };

        if let Some(old) = &evicted {
            debug!(
                symbol = %old.symbol,
                window_start_ms = old.window_start_ms,
                "evicted oldest candle from history"
            );
        }
        UpsertOutcome::Appended { evicted }
    }

    /// Change the capacity, dropping the oldest entries if needed. Used when
    /// state persisted under a different `max_candles_in_state` is reloaded.
    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.candles.len() > self.capacity {
            self.candles.pop_front();
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candle> {
        self.candles.iter()
    }

    /// Contiguous oldest-to-newest view, as the indicator engine expects.
    pub fn as_slice(&mut self) -> &[Candle] {
        self.candles.make_contiguous()
    }

    /// Owned oldest-to-newest copy.
    pub fn snapshot(&self) -> Vec<Candle> {
        self.candles.iter().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
