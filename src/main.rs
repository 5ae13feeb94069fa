// =============================================================================
// Candle Forge — Main Entry Point
// =============================================================================
//
// Reads trades from the configured source, aggregates them into OHLCV candles
// per symbol, keeps a bounded candle history and publishes indicator
// snapshots. State is persisted per partition after every trade; on restart
// processing resumes after the last committed offset.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod error;
mod indicators;
mod market_data;
mod pipeline;
mod runtime_config;
mod sink;
mod state_store;
mod types;
mod worker;

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::indicators::{DefaultIndicatorEngine, IndicatorEngine};
use crate::market_data::{KrakenTradeSource, ReplayTradeSource, TradeSource};
use crate::pipeline::CandlePipeline;
use crate::runtime_config::{PipelineConfig, SourceKind};
use crate::sink::JsonLinesSink;
use crate::state_store::{FileStateStore, StateStore};
use crate::worker::{ResumePoint, WorkerPool, CHANNEL_CAPACITY};

const CONFIG_PATH: &str = "pipeline_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    // Logs go to stderr; stdout may carry the JSON-lines output.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Candle Forge — Starting Up                        ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = PipelineConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        PipelineConfig::default()
    });
    config.apply_env_overrides()?;
    config.validate()?;

    info!(
        candle_seconds = config.candle_seconds,
        emit_incomplete_candles = config.emit_incomplete_candles,
        max_candles_in_state = config.max_candles_in_state,
        partitions = config.partitions,
        source = %config.source,
        "Pipeline configured"
    );

    // ── 2. State stores (one per partition) ──────────────────────────────
    let mut stores = Vec::with_capacity(config.partitions);
    for partition in 0..config.partitions {
        let path = config.state_dir.join(format!("partition-{partition}.json"));
        let store = FileStateStore::open(&path)
            .with_context(|| format!("failed to open state store {}", path.display()))?;
        stores.push(store);
    }
    let resume = ResumePoint::from_offsets(stores.iter().map(|s| s.committed_offset()));
    info!(resume = ?resume, "Resume point");

    // ── 3. Sinks & indicator engine ──────────────────────────────────────
    let candle_sink = JsonLinesSink::from_target("candles", &config.candles_output)?;
    let indicator_sink = JsonLinesSink::from_target("indicators", &config.indicators_output)?;
    let engine: Arc<dyn IndicatorEngine> = Arc::new(DefaultIndicatorEngine::default());
    info!(indicators = ?engine.names(), "Indicator engine ready");

    // ── 4. Worker pool ───────────────────────────────────────────────────
    let pipelines = stores
        .into_iter()
        .enumerate()
        .map(|(partition, store)| {
            CandlePipeline::new(
                partition,
                &config,
                Arc::clone(&engine),
                store,
                Box::new(candle_sink.clone()),
                Box::new(indicator_sink.clone()),
            )
        })
        .collect();
    let pool = WorkerPool::spawn(pipelines, CHANNEL_CAPACITY);

    // ── 5. Trade source ──────────────────────────────────────────────────
    let mut source: Box<dyn TradeSource> = match config.source {
        SourceKind::Replay => Box::new(
            ReplayTradeSource::open(&config.replay_path, resume.replay_skip_through()).await?,
        ),
        SourceKind::Live => Box::new(KrakenTradeSource::new(
            config.symbols.clone(),
            resume.live_first_offset(),
        )),
    };

    // ── 6. Run until exhausted or Ctrl-C ─────────────────────────────────
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    match worker::run(source.as_mut(), pool, shutdown).await {
        Ok(reports) => {
            for report in &reports {
                info!(
                    partition = report.partition,
                    committed_offset = ?report.committed_offset,
                    closed_on_shutdown = report.closed_on_shutdown,
                    stats = ?report.stats,
                    "Partition finished"
                );
            }
            info!("Candle Forge shut down cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "Pipeline halted");
            Err(e)
        }
    }
}
