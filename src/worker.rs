// =============================================================================
// Worker Pool — symbol-hash partitions fed from one trade source
// =============================================================================
//
// Each partition owns one CandlePipeline and runs it on a blocking thread
// (state flushes hit the disk). The router reads the source and hands every
// trade to the partition its symbol hashes to, so all trades of a symbol are
// processed by one worker in arrival order while distinct partitions run in
// parallel.
//
// Shutdown: the router stops reading, drops the channels, and every worker
// drains its queue before exiting. On a shutdown signal the worker only
// checkpoints, leaving OPEN candles open so a restart continues them; once the
// source is exhausted it closes them. A worker that fails to persist stops
// immediately; its error is what `run` returns.
// =============================================================================

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::market_data::TradeSource;
use crate::pipeline::{CandlePipeline, PipelineStats};
use crate::state_store::StateStore;
use crate::types::SourcedTrade;

/// Queue depth between the router and each partition.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Stable partition of `symbol` (64-bit FNV-1a), identical across restarts
/// so a symbol always lands on the store that holds its state.
pub fn partition_for(symbol: &str, partitions: usize) -> usize {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let hash = symbol.bytes().fold(OFFSET_BASIS, |h, b| {
        (h ^ u64::from(b)).wrapping_mul(PRIME)
    });
    (hash % partitions.max(1) as u64) as usize
}

// ---------------------------------------------------------------------------
// Resume point
// ---------------------------------------------------------------------------

/// Where the source should restart, derived from every partition's
/// committed offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumePoint {
    /// Lowest committed offset; `None` if any partition has committed nothing.
    pub min_committed: Option<u64>,
    /// Highest committed offset across partitions.
    pub max_committed: Option<u64>,
}

impl ResumePoint {
    pub fn from_offsets(offsets: impl IntoIterator<Item = Option<u64>>) -> Self {
        let offsets: Vec<Option<u64>> = offsets.into_iter().collect();
        let min_committed = if offsets.iter().any(Option::is_none) {
            None
        } else {
            offsets.iter().flatten().copied().min()
        };
        let max_committed = offsets.iter().flatten().copied().max();
        Self {
            min_committed,
            max_committed,
        }
    }

    /// Replay lines every partition has already committed can be skipped at
    /// the source; the rest are filtered per partition.
    pub fn replay_skip_through(&self) -> Option<u64> {
        self.min_committed
    }

    /// Live offsets continue after the highest one ever committed.
    pub fn live_first_offset(&self) -> u64 {
        self.max_committed.map_or(0, |o| o + 1)
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Final numbers of one partition.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionReport {
    pub partition: usize,
    pub closed_on_shutdown: usize,
    pub committed_offset: Option<u64>,
    pub stats: PipelineStats,
}

/// What workers do with their OPEN candles once the queues close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Persist state as is; OPEN candles resume after a restart.
    Checkpoint,
    /// End of stream: close and emit every OPEN candle.
    CloseOpen,
}

pub struct WorkerPool {
    senders: Vec<mpsc::Sender<SourcedTrade>>,
    handles: Vec<JoinHandle<Result<PartitionReport>>>,
    close_open: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Start one worker per pipeline; pipeline `i` serves partition `i`.
    pub fn spawn<S>(pipelines: Vec<CandlePipeline<S>>, channel_capacity: usize) -> Self
    where
        S: StateStore + 'static,
    {
        let mut senders = Vec::with_capacity(pipelines.len());
        let mut handles = Vec::with_capacity(pipelines.len());
        let close_open = Arc::new(AtomicBool::new(false));

        for (partition, mut pipeline) in pipelines.into_iter().enumerate() {
            let (tx, mut rx) = mpsc::channel::<SourcedTrade>(channel_capacity.max(1));
            senders.push(tx);
            let close_open = Arc::clone(&close_open);
            handles.push(tokio::task::spawn_blocking(move || {
                while let Some(trade) = rx.blocking_recv() {
                    if let Err(e) = pipeline.process(trade) {
                        error!(partition, error = %format!("{e:#}"), "partition halted");
                        return Err(e);
                    }
                }
                // Set before the senders are dropped, so visible here.
                let closed_on_shutdown = if close_open.load(Ordering::SeqCst) {
                    pipeline.flush_open()?
                } else {
                    pipeline.checkpoint()?;
                    0
                };
                Ok(PartitionReport {
                    partition,
                    closed_on_shutdown,
                    committed_offset: pipeline.committed_offset(),
                    stats: pipeline.stats().clone(),
                })
            }));
        }

        info!(partitions = senders.len(), "worker pool started");
        Self {
            senders,
            handles,
            close_open,
        }
    }

    pub fn partitions(&self) -> usize {
        self.senders.len()
    }

    /// Route `trade` to its partition. Fails once that worker has stopped.
    pub async fn dispatch(&self, trade: SourcedTrade) -> Result<()> {
        let partition = partition_for(&trade.trade.symbol, self.senders.len());
        self.senders[partition]
            .send(trade)
            .await
            .map_err(|_| anyhow!("partition {partition} worker has stopped"))
    }

    /// Close the queues and wait for every worker to drain and stop per
    /// `mode`. Returns the first worker error, if any.
    pub async fn shutdown(self, mode: StopMode) -> Result<Vec<PartitionReport>> {
        self.close_open
            .store(mode == StopMode::CloseOpen, Ordering::SeqCst);
        info!(?mode, "stopping worker pool");
        drop(self.senders);

        let mut reports = Vec::with_capacity(self.handles.len());
        let mut first_error = None;
        for handle in self.handles {
            match handle.await.context("partition worker panicked") {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(e)) | Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(reports),
        }
    }
}

/// Pump `source` into `pool` until the source is exhausted or `shutdown`
/// resolves, then shut the pool down. Only exhaustion closes OPEN candles.
pub async fn run<T, F>(source: &mut T, pool: WorkerPool, shutdown: F) -> Result<Vec<PartitionReport>>
where
    T: TradeSource + ?Sized,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    let mut routed: u64 = 0;
    let outcome: Result<StopMode> = loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!(routed, "shutdown requested");
                break Ok(StopMode::Checkpoint);
            }
            next = source.next_trade() => match next {
                Ok(Some(trade)) => {
                    if let Err(e) = pool.dispatch(trade).await {
                        break Err(e);
                    }
                    routed += 1;
                }
                Ok(None) => {
                    info!(routed, "trade source exhausted");
                    break Ok(StopMode::CloseOpen);
                }
                Err(e) => break Err(e.context("trade source failed")),
            }
        }
    };

    // A worker error explains a failed dispatch better than the send error.
    let mode = outcome.as_ref().map_or(StopMode::Checkpoint, |m| *m);
    let reports = pool.shutdown(mode).await?;
    outcome?;
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::oneshot;

    use super::*;
    use crate::indicators::DefaultIndicatorEngine;
    use crate::market_data::VecTradeSource;
    use crate::runtime_config::PipelineConfig;
    use crate::sink::MemorySink;
    use crate::state_store::{InMemoryStateStore, MemoryBackend};
    use crate::types::{CandleMessage, IndicatorMessage, Trade};

    /// Hands out its trades, signals `drained`, then waits like a live feed.
    struct StallingSource {
        inner: VecTradeSource,
        drained: Option<oneshot::Sender<()>>,
    }

    #[async_trait]
    impl TradeSource for StallingSource {
        async fn next_trade(&mut self) -> Result<Option<SourcedTrade>> {
            if let Some(trade) = self.inner.next_trade().await? {
                return Ok(Some(trade));
            }
            if let Some(tx) = self.drained.take() {
                let _ = tx.send(());
            }
            std::future::pending().await
        }
    }

    fn pool(
        backends: &[MemoryBackend],
        candles: &MemorySink<CandleMessage>,
    ) -> WorkerPool {
        let config = PipelineConfig {
            candle_seconds: 10,
            ..PipelineConfig::default()
        };
        let pipelines: Vec<CandlePipeline<InMemoryStateStore>> = backends
            .iter()
            .enumerate()
            .map(|(i, b)| {
                CandlePipeline::new(
                    i,
                    &config,
                    Arc::new(DefaultIndicatorEngine::default()),
                    b.open(),
                    Box::new(candles.clone()),
                    Box::new(MemorySink::<IndicatorMessage>::new()),
                )
            })
            .collect();
        WorkerPool::spawn(pipelines, 8)
    }

    fn trades() -> Vec<Trade> {
        let mut out = Vec::new();
        for (i, symbol) in ["BTC-USD", "ETH-USD", "SOL-USD"].iter().enumerate() {
            out.push(Trade::new(*symbol, 100.0 + i as f64, 1.0, 0));
            out.push(Trade::new(*symbol, 101.0 + i as f64, 2.0, 5_000));
            out.push(Trade::new(*symbol, 102.0 + i as f64, 1.0, 12_000));
        }
        out
    }

    #[test]
    fn partition_is_stable_and_in_range() {
        for n in 1..8 {
            let p = partition_for("BTC-USD", n);
            assert!(p < n);
            assert_eq!(p, partition_for("BTC-USD", n));
        }
        assert_eq!(partition_for("anything", 1), 0);
        assert_eq!(partition_for("anything", 0), 0);
    }

    #[test]
    fn resume_point_from_partition_offsets() {
        let all = ResumePoint::from_offsets([Some(4), Some(9)]);
        assert_eq!(all.replay_skip_through(), Some(4));
        assert_eq!(all.live_first_offset(), 10);

        let partial = ResumePoint::from_offsets([Some(4), None]);
        assert_eq!(partial.replay_skip_through(), None);
        assert_eq!(partial.live_first_offset(), 5);

        let fresh = ResumePoint::from_offsets([None]);
        assert_eq!(fresh, ResumePoint::default());
        assert_eq!(fresh.live_first_offset(), 0);
    }

    #[tokio::test]
    async fn exhausted_source_flushes_every_partition() {
        let backends = vec![MemoryBackend::new(), MemoryBackend::new()];
        let candles = MemorySink::new();
        let pool = pool(&backends, &candles);
        assert_eq!(pool.partitions(), 2);

        let mut source = VecTradeSource::new(trades());
        let reports = run(&mut source, pool, std::future::pending()).await.unwrap();

        // one closed by the t=12s trade and one by the shutdown flush, per symbol
        assert_eq!(candles.len(), 6);
        assert_eq!(reports.iter().map(|r| r.closed_on_shutdown).sum::<usize>(), 3);
        assert_eq!(reports.iter().map(|r| r.stats.applied).sum::<u64>(), 9);

        for symbol in ["BTC-USD", "ETH-USD", "SOL-USD"] {
            let snapshot = backends[partition_for(symbol, 2)].snapshot();
            let state = &snapshot.symbols[symbol];
            assert!(state.reducer.open.is_none());
            assert_eq!(state.history.len(), 2);
        }
    }

    #[tokio::test]
    async fn shutdown_signal_stops_reading() {
        let backends = vec![MemoryBackend::new()];
        let candles = MemorySink::new();
        let pool = pool(&backends, &candles);

        let mut source = VecTradeSource::new(trades());
        let reports = run(&mut source, pool, std::future::ready(())).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].stats.applied, 0);
        assert!(candles.messages().is_empty());
    }

    #[tokio::test]
    async fn interrupted_run_resumes_open_window_after_restart() {
        let backends = vec![MemoryBackend::new()];
        let scenario = vec![
            Trade::new("BTC-USD", 100.0, 1.0, 0),
            Trade::new("BTC-USD", 105.0, 2.0, 5_000),
            Trade::new("BTC-USD", 95.0, 1.0, 9_000),
        ];

        let candles = MemorySink::new();
        let (tx, rx) = oneshot::channel();
        let mut source = StallingSource {
            inner: VecTradeSource::new(scenario[..2].to_vec()),
            drained: Some(tx),
        };
        let reports = run(&mut source, pool(&backends, &candles), async {
            let _ = rx.await;
        })
        .await
        .unwrap();
        assert_eq!(reports[0].closed_on_shutdown, 0);
        assert_eq!(reports[0].committed_offset, Some(1));
        assert!(candles.messages().is_empty());
        assert!(backends[0].snapshot().symbols["BTC-USD"].reducer.open.is_some());

        // restart: offsets 0 and 1 are skipped, offset 2 joins the open window
        let candles = MemorySink::new();
        let mut source = VecTradeSource::new(scenario);
        let reports = run(&mut source, pool(&backends, &candles), std::future::pending())
            .await
            .unwrap();
        assert_eq!(reports[0].stats.replay_skipped, 2);
        assert_eq!(reports[0].stats.rejected, 0);

        let emitted = candles.messages();
        assert_eq!(emitted.len(), 1);
        assert_eq!((emitted[0].open, emitted[0].high, emitted[0].low), (100.0, 105.0, 95.0));
        assert_eq!(emitted[0].close, 95.0);
        assert_eq!(emitted[0].volume, 4.0);
        assert_eq!((emitted[0].window_start_ms, emitted[0].window_end_ms), (0, 10_000));
    }

    #[tokio::test]
    async fn store_outage_halts_the_run() {
        let backends = vec![MemoryBackend::new()];
        backends[0].set_unavailable(true);
        let candles = MemorySink::new();
        let pool = pool(&backends, &candles);

        let mut source = VecTradeSource::new(trades());
        let err = run(&mut source, pool, std::future::pending()).await.unwrap_err();
        assert!(format!("{err:#}").contains("could not durably record"));
        assert!(backends[0].snapshot().symbols.is_empty());
    }
}
