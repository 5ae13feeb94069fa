pub mod candle;
pub mod candle_buffer;
pub mod emission;
pub mod trade_stream;
pub mod window;

// Re-export the pipeline building blocks (e.g. `use crate::market_data::Candle`).
pub use candle::{Candle, CandleReducer, ReduceOutcome, ReducerState, Transition};
pub use candle_buffer::{CandleHistory, UpsertOutcome};
pub use emission::EmissionPolicy;
pub use trade_stream::{KrakenTradeSource, ReplayTradeSource, TradeSource, VecTradeSource};
pub use window::{window_for, Window};
