// =============================================================================
// Typed errors for the candle pipeline
// =============================================================================
//
// Plumbing code returns `anyhow::Result`. The variants below are the failures
// the pipeline branches on: a rejected trade is skipped, a failed indicator
// computation is isolated, a failed store flush halts the partition.
// =============================================================================

use thiserror::Error;

/// Why a trade never reached the reducer (or was refused by it).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TradeRejection {
    #[error("malformed trade: {reason}")]
    Malformed { reason: String },

    #[error(
        "late trade for {symbol}: window starting {window_start_ms} precedes accepted window starting {accepted_start_ms}"
    )]
    LateTrade {
        symbol: String,
        window_start_ms: i64,
        accepted_start_ms: i64,
    },
}

impl TradeRejection {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

/// Failure while deriving indicators from a history snapshot.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IndicatorError {
    #[error("malformed history: {reason}")]
    MalformedHistory { reason: String },

    #[error("indicator {name} produced a non-finite value")]
    NonFinite { name: String },
}

/// Failure of the durable keyed state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store I/O failed at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("state store serialisation failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("state store unavailable: {reason}")]
    Unavailable { reason: String },
}
