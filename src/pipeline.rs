// =============================================================================
// Candle Pipeline — one partition's processing loop
// =============================================================================
//
// Trade -> Window Assigner -> Candle Reducer -> Emission Policy
//       -> candle sink -> history upsert -> Indicator Engine -> indicator sink
//       -> state store set + offset + flush
//
// A pipeline owns the state of every symbol routed to its partition, so all
// operations on a symbol run one at a time in arrival order. State is flushed
// after every trade: a crash before the flush replays the trade, a crash after
// it skips the trade on restart because its offset is already committed.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::error::{IndicatorError, TradeRejection};
use crate::indicators::{IndicatorEngine, IndicatorRecord};
use crate::market_data::{Candle, CandleHistory, CandleReducer, EmissionPolicy};
use crate::runtime_config::PipelineConfig;
use crate::sink::Sink;
use crate::state_store::{StateStore, SymbolState};
use crate::types::{CandleMessage, IndicatorMessage, SourcedTrade};

// ---------------------------------------------------------------------------
// Indicator stage
// ---------------------------------------------------------------------------

/// History upsert + indicator computation for one candle event.
#[derive(Clone)]
pub struct IndicatorStage {
    candle_seconds: u32,
    engine: Arc<dyn IndicatorEngine>,
}

impl IndicatorStage {
    pub fn new(candle_seconds: u32, engine: Arc<dyn IndicatorEngine>) -> Self {
        Self {
            candle_seconds,
            engine,
        }
    }

    /// Candles built with a different window length belong to another
    /// pipeline and are ignored.
    pub fn accepts(&self, message: &CandleMessage) -> bool {
        message.candle_seconds == self.candle_seconds
    }

    /// Upsert `candle` into `history` and compute indicators over the updated
    /// history. An engine failure is logged, reported as all-unavailable and
    /// returned alongside the record.
    pub fn apply(
        &self,
        history: &mut CandleHistory,
        candle: Candle,
    ) -> (IndicatorRecord, Option<IndicatorError>) {
        history.upsert(candle.clone());
        debug!(symbol = %candle.symbol, len = history.len(), "candles in history");

        match self.engine.compute(history.as_slice()) {
            Ok(values) => (IndicatorRecord::new(candle, values), None),
            Err(e) => {
                warn!(symbol = %candle.symbol, error = %e, "indicator computation failed");
                (IndicatorRecord::new(candle, self.engine.unavailable()), Some(e))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// What happened to one sourced trade.
#[derive(Debug, Clone, PartialEq)]
pub enum TradeOutcome {
    /// Folded into a candle; carries the number of candles emitted.
    Applied { emitted: usize },
    Rejected(TradeRejection),
    /// Offset already committed by a previous run.
    AlreadyCommitted,
}

/// Running counters, reported on shutdown.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineStats {
    pub applied: u64,
    pub rejected: u64,
    pub replay_skipped: u64,
    pub candles_emitted: u64,
    pub indicator_failures: u64,
}

pub struct CandlePipeline<S: StateStore> {
    partition: usize,
    reducer: CandleReducer,
    policy: EmissionPolicy,
    max_candles: usize,
    indicators: IndicatorStage,
    store: S,
    committed_offset: Option<u64>,
    symbols: HashMap<String, SymbolState>,
    candle_sink: Box<dyn Sink<CandleMessage>>,
    indicator_sink: Box<dyn Sink<IndicatorMessage>>,
    stats: PipelineStats,
}

impl<S: StateStore> CandlePipeline<S> {
    pub fn new(
        partition: usize,
        config: &PipelineConfig,
        engine: Arc<dyn IndicatorEngine>,
        store: S,
        candle_sink: Box<dyn Sink<CandleMessage>>,
        indicator_sink: Box<dyn Sink<IndicatorMessage>>,
    ) -> Self {
        let committed_offset = store.committed_offset();
        info!(
            partition,
            candle_seconds = config.candle_seconds,
            emission = %EmissionPolicy::from_flag(config.emit_incomplete_candles),
            max_candles = config.max_candles_in_state,
            committed_offset = ?committed_offset,
            "pipeline ready"
        );
        Self {
            partition,
            reducer: CandleReducer::new(config.candle_seconds),
            policy: EmissionPolicy::from_flag(config.emit_incomplete_candles),
            max_candles: config.max_candles_in_state,
            indicators: IndicatorStage::new(config.candle_seconds, engine),
            store,
            committed_offset,
            symbols: HashMap::new(),
            candle_sink,
            indicator_sink,
            stats: PipelineStats::default(),
        }
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn committed_offset(&self) -> Option<u64> {
        self.committed_offset
    }

    /// Current history of `symbol`, oldest first.
    pub fn history(&self, symbol: &str) -> Vec<Candle> {
        self.symbols
            .get(symbol)
            .map(|s| s.history.snapshot())
            .or_else(|| self.store.get(symbol).map(|s| s.history.snapshot()))
            .unwrap_or_default()
    }

    /// The OPEN candle of `symbol`, if any.
    pub fn open_candle(&self, symbol: &str) -> Option<Candle> {
        self.symbols
            .get(symbol)
            .and_then(|s| s.reducer.open.clone())
            .or_else(|| self.store.get(symbol).and_then(|s| s.reducer.open))
    }

    /// Process one trade end to end. An `Err` means state could not be made
    /// durable (or a sink failed) and the partition must stop.
    pub fn process(&mut self, sourced: SourcedTrade) -> Result<TradeOutcome> {
        let SourcedTrade { offset, trade } = sourced;

        if self.committed_offset.is_some_and(|c| offset <= c) {
            self.stats.replay_skipped += 1;
            debug!(partition = self.partition, offset, "offset already committed; skipping");
            return Ok(TradeOutcome::AlreadyCommitted);
        }

        if let Err(rejection) = trade.validate() {
            return self.reject(offset, rejection);
        }

        let mut state = self.load(&trade.symbol);
        let outcome = match self.reducer.apply(&mut state.reducer, &trade) {
            Ok(outcome) => outcome,
            Err(rejection) => {
                self.symbols.insert(trade.symbol.clone(), state);
                return self.reject(offset, rejection);
            }
        };

        let candles = self.policy.on_trade(&outcome);
        let emitted = candles.len();
        for candle in candles {
            self.emit(&mut state, candle)?;
        }

        self.stats.applied += 1;
        self.commit(offset, &trade.symbol, state)?;
        Ok(TradeOutcome::Applied { emitted })
    }

    /// Feed a candle produced elsewhere straight into the indicator stage.
    ///
    /// For embedding the indicator stage behind an external candle stream;
    /// the binary drives the pipeline from trades only and never calls this.
    pub fn process_candle_message(
        &mut self,
        offset: u64,
        message: &CandleMessage,
    ) -> Result<Option<IndicatorRecord>> {
        if self.committed_offset.is_some_and(|c| offset <= c) {
            self.stats.replay_skipped += 1;
            return Ok(None);
        }
        if !self.indicators.accepts(message) {
            debug!(
                symbol = %message.symbol,
                candle_seconds = message.candle_seconds,
                "skipping candle with a different window length"
            );
            self.store.set_offset(offset);
            self.flush(offset)?;
            return Ok(None);
        }

        let mut state = self.load(&message.symbol);
        let record = self.index(&mut state, message.to_candle());
        self.send_indicators(&record)?;
        self.commit(offset, &message.symbol, state)?;
        Ok(Some(record))
    }

    /// Persist state and offset without closing anything, so a restart picks
    /// the OPEN windows up where they stand.
    pub fn checkpoint(&mut self) -> Result<()> {
        self.store
            .flush()
            .with_context(|| format!("partition {} failed to checkpoint state", self.partition))?;
        info!(partition = self.partition, committed_offset = ?self.committed_offset, stats = ?self.stats, "state checkpointed");
        Ok(())
    }

    /// Close every OPEN candle (end of stream). In final mode the closed
    /// candles are emitted; state is flushed once at the end with the offset
    /// unchanged. Trades for a closed window are late from then on.
    pub fn flush_open(&mut self) -> Result<usize> {
        let mut symbols: Vec<String> = self.store.symbols();
        for symbol in self.symbols.keys() {
            if !symbols.contains(symbol) {
                symbols.push(symbol.clone());
            }
        }

        let mut closed_count = 0;
        for symbol in symbols {
            let mut state = self.load(&symbol);
            let Some(closed) = self.reducer.close(&mut state.reducer) else {
                continue;
            };
            closed_count += 1;
            if let Some(candle) = self.policy.on_flush(closed) {
                self.emit(&mut state, candle)?;
            }
            self.store.set(&symbol, state.clone());
            self.symbols.insert(symbol, state);
        }

        self.store
            .flush()
            .with_context(|| format!("partition {} failed to flush state on shutdown", self.partition))?;
        info!(partition = self.partition, closed = closed_count, stats = ?self.stats, "open candles flushed");
        Ok(closed_count)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Take the symbol's state out of the cache (or the store); `commit`
    /// puts it back.
    fn load(&mut self, symbol: &str) -> SymbolState {
        let mut state = self
            .symbols
            .remove(symbol)
            .or_else(|| self.store.get(symbol))
            .unwrap_or_else(|| SymbolState::new(self.max_candles));
        if state.history.capacity() != self.max_candles {
            state.history.resize(self.max_candles);
        }
        state
    }

    fn emit(&mut self, state: &mut SymbolState, candle: Candle) -> Result<()> {
        let message = CandleMessage::from_candle(&candle, self.reducer.candle_seconds());
        debug!(
            symbol = %message.symbol,
            window_start_ms = message.window_start_ms,
            close = message.close,
            volume = message.volume,
            "candle"
        );
        self.candle_sink.send(&message)?;
        self.stats.candles_emitted += 1;

        let record = self.index(state, candle);
        self.send_indicators(&record)
    }

    fn index(&mut self, state: &mut SymbolState, candle: Candle) -> IndicatorRecord {
        let (record, failure) = self.indicators.apply(&mut state.history, candle);
        if failure.is_some() {
            self.stats.indicator_failures += 1;
        }
        record
    }

    fn send_indicators(&mut self, record: &IndicatorRecord) -> Result<()> {
        self.indicator_sink
            .send(&record.to_message(self.reducer.candle_seconds()))
    }

    fn reject(&mut self, offset: u64, rejection: TradeRejection) -> Result<TradeOutcome> {
        warn!(partition = self.partition, offset, reason = %rejection, "trade rejected");
        self.stats.rejected += 1;
        self.store.set_offset(offset);
        self.flush(offset)?;
        Ok(TradeOutcome::Rejected(rejection))
    }

    fn commit(&mut self, offset: u64, symbol: &str, state: SymbolState) -> Result<()> {
        self.store.set(symbol, state.clone());
        self.symbols.insert(symbol.to_string(), state);
        self.store.set_offset(offset);
        self.flush(offset)
    }

    fn flush(&mut self, offset: u64) -> Result<()> {
        self.store.flush().with_context(|| {
            format!(
                "partition {} could not durably record offset {offset}",
                self.partition
            )
        })?;
        self.committed_offset = Some(offset);
        Ok(())
    }
}
