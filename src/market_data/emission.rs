// =============================================================================
// Emission Policy — which candle values leave the reducer
// =============================================================================
//
// Incomplete: every accepted trade surfaces the current (possibly still OPEN)
//             candle. Consumers treat the stream as latest-value-wins per
//             window.
// Final:      exactly one emission per window, at the OPEN -> CLOSED
//             transition, carrying the final aggregate.
// =============================================================================

use serde::{Deserialize, Serialize};

use super::candle::{Candle, ReduceOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmissionPolicy {
    Incomplete,
    Final,
}

impl EmissionPolicy {
    pub fn from_flag(emit_incomplete: bool) -> Self {
        if emit_incomplete {
            Self::Incomplete
        } else {
            Self::Final
        }
    }

    /// Candles to surface after the reducer accepted a trade.
    pub fn on_trade(&self, outcome: &ReduceOutcome) -> Vec<Candle> {
        match self {
            Self::Incomplete => vec![outcome.current.clone()],
            Self::Final => outcome.closed().cloned().into_iter().collect(),
        }
    }

    /// Candles to surface when an OPEN candle is closed by an explicit flush.
    ///
    /// In incomplete mode the final value already went out with the last
    /// trade, so nothing new is emitted.
    pub fn on_flush(&self, closed: Candle) -> Option<Candle> {
        match self {
            Self::Incomplete => None,
            Self::Final => Some(closed),
        }
    }
}

impl std::fmt::Display for EmissionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Incomplete => write!(f, "incomplete"),
            Self::Final => write!(f, "final"),
        }
    }
}
