// =============================================================================
// Trade Sources — replay file, live Kraken feed, in-memory
// =============================================================================
//
// Every source hands out trades tagged with a monotonically increasing offset.
// Offsets are what the state store commits, so they must be stable for a
// replayed file (line number) and must keep increasing across restarts for a
// live feed (numbering resumes after the highest committed offset).
// =============================================================================

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::types::{normalize_symbol, SourcedTrade, Trade};

/// Capability interface for the external trade feed.
#[async_trait]
pub trait TradeSource: Send {
    /// Next trade, or `None` once the source is exhausted. Live sources never
    /// return `None`; the caller cancels them.
    async fn next_trade(&mut self) -> Result<Option<SourcedTrade>>;
}

// ---------------------------------------------------------------------------
// Replay (JSON lines)
// ---------------------------------------------------------------------------

/// Replays a JSON-lines trade file. The offset of a trade is its zero-based
/// line number, so a restarted replay lines up with committed offsets.
pub struct ReplayTradeSource {
    path: PathBuf,
    lines: Lines<BufReader<tokio::fs::File>>,
    next_offset: u64,
    skip_through: Option<u64>,
}

impl ReplayTradeSource {
    /// Open `path`; lines with offset `<= skip_through` are read but not
    /// returned.
    pub async fn open(path: impl AsRef<Path>, skip_through: Option<u64>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("failed to open trade replay file {}", path.display()))?;
        info!(path = %path.display(), skip_through = ?skip_through, "replaying trades");
        Ok(Self {
            path,
            lines: BufReader::new(file).lines(),
            next_offset: 0,
            skip_through,
        })
    }
}

#[async_trait]
impl TradeSource for ReplayTradeSource {
    async fn next_trade(&mut self) -> Result<Option<SourcedTrade>> {
        loop {
            let Some(line) = self
                .lines
                .next_line()
                .await
                .with_context(|| format!("failed to read {}", self.path.display()))?
            else {
                info!(path = %self.path.display(), lines = self.next_offset, "replay finished");
                return Ok(None);
            };

            let offset = self.next_offset;
            self.next_offset += 1;

            if self.skip_through.is_some_and(|s| offset <= s) || line.trim().is_empty() {
                continue;
            }

            match parse_trade_line(&line) {
                Ok(trade) => return Ok(Some(SourcedTrade { offset, trade })),
                Err(e) => warn!(offset, error = %e, "skipping malformed trade line"),
            }
        }
    }
}

/// Parse one replay line; the symbol is normalised (`BTC/USD` -> `BTC-USD`).
pub fn parse_trade_line(line: &str) -> Result<Trade> {
    let mut trade: Trade = serde_json::from_str(line).context("invalid trade JSON")?;
    trade.symbol = normalize_symbol(&trade.symbol);
    Ok(trade)
}

// ---------------------------------------------------------------------------
// Live Kraken v2 websocket
// ---------------------------------------------------------------------------

const KRAKEN_WS_URL: &str = "wss://ws.kraken.com/v2";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Subscribes to the Kraken `trade` channel for the configured pairs and
/// reconnects on disconnect.
pub struct KrakenTradeSource {
    pairs: Vec<String>,
    next_offset: u64,
    stream: Option<WsStream>,
    pending: VecDeque<Trade>,
}

impl KrakenTradeSource {
    /// `first_offset` continues the numbering of a previous run.
    pub fn new(pairs: Vec<String>, first_offset: u64) -> Self {
        Self {
            pairs,
            next_offset: first_offset,
            stream: None,
            pending: VecDeque::new(),
        }
    }

    async fn connect(&self) -> Result<WsStream> {
        info!(url = KRAKEN_WS_URL, pairs = ?self.pairs, "connecting to Kraken trade WebSocket");
        let (mut ws, _response) = connect_async(KRAKEN_WS_URL)
            .await
            .context("failed to connect to Kraken WebSocket")?;

        let subscribe = serde_json::json!({
            "method": "subscribe",
            "params": {
                "channel": "trade",
                "symbol": self.pairs,
                "snapshot": false,
            }
        });
        ws.send(Message::Text(subscribe.to_string()))
            .await
            .context("failed to send Kraken subscribe message")?;
        info!(pairs = ?self.pairs, "Kraken trade subscription sent");
        Ok(ws)
    }
}

#[async_trait]
impl TradeSource for KrakenTradeSource {
    async fn next_trade(&mut self) -> Result<Option<SourcedTrade>> {
        loop {
            if let Some(trade) = self.pending.pop_front() {
                let offset = self.next_offset;
                self.next_offset += 1;
                return Ok(Some(SourcedTrade { offset, trade }));
            }

            if self.stream.is_none() {
                match self.connect().await {
                    Ok(ws) => self.stream = Some(ws),
                    Err(e) => {
                        error!(error = %e, "Kraken connect failed — retrying in 5s");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                }
            }
            let Some(stream) = self.stream.as_mut() else {
                continue;
            };

            let frame = stream.next().await;
            match frame {
                Some(Ok(Message::Text(text))) => match parse_kraken_message(&text) {
                    Ok(trades) => self.pending.extend(trades),
                    Err(e) => warn!(error = %e, "failed to parse Kraken message"),
                },
                // Ping / Pong / Binary frames carry no trades.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(error = %e, "Kraken WebSocket read error — reconnecting in 5s");
                    self.stream = None;
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
                None => {
                    warn!("Kraken WebSocket stream ended — reconnecting in 5s");
                    self.stream = None;
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }
}

/// Extract trades from one Kraken v2 message.
///
/// Expected trade shape:
/// ```json
/// { "channel": "trade", "type": "update",
///   "data": [ { "symbol": "BTC/USD", "price": 4.1, "qty": 0.5,
///               "timestamp": "2023-09-25T07:49:37.708706Z" } ] }
/// ```
/// Heartbeats, status messages and subscription acks yield no trades. A
/// malformed entry is logged and skipped; the rest of the frame is kept.
pub fn parse_kraken_message(text: &str) -> Result<Vec<Trade>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse Kraken JSON")?;

    if root["channel"].as_str() != Some("trade") {
        debug!(channel = ?root["channel"].as_str(), method = ?root["method"].as_str(), "ignoring non-trade message");
        return Ok(Vec::new());
    }

    let data = root["data"].as_array().context("trade message without data array")?;
    let mut trades = Vec::with_capacity(data.len());
    for entry in data {
        match parse_kraken_trade(entry) {
            Ok(trade) => trades.push(trade),
            Err(e) => warn!(error = %e, entry = %entry, "skipping malformed Kraken trade"),
        }
    }
    Ok(trades)
}

fn parse_kraken_trade(entry: &serde_json::Value) -> Result<Trade> {
    let symbol = entry["symbol"].as_str().context("missing field symbol")?;
    let price = entry["price"].as_f64().context("missing field price")?;
    let volume = entry["qty"].as_f64().context("missing field qty")?;
    let timestamp = entry["timestamp"].as_str().context("missing field timestamp")?;
    let timestamp_ms = chrono::DateTime::parse_from_rfc3339(timestamp)
        .with_context(|| format!("invalid timestamp {timestamp}"))?
        .timestamp_millis();
    Ok(Trade::new(normalize_symbol(symbol), price, volume, timestamp_ms))
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Hands out a fixed list of trades with offsets `0..n`.
pub struct VecTradeSource {
    trades: VecDeque<SourcedTrade>,
}

impl VecTradeSource {
    pub fn new(trades: Vec<Trade>) -> Self {
        Self {
            trades: trades
                .into_iter()
                .enumerate()
                .map(|(i, trade)| SourcedTrade {
                    offset: i as u64,
                    trade,
                })
                .collect(),
        }
    }
}

#[async_trait]
impl TradeSource for VecTradeSource {
    async fn next_trade(&mut self) -> Result<Option<SourcedTrade>> {
        Ok(self.trades.pop_front())
    }
}
