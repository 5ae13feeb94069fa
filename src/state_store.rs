// =============================================================================
// State Store — durable keyed persistence of per-symbol pipeline state
// =============================================================================
//
// The pipeline stages every mutation with `set`, records the source offset it
// has fully processed with `set_offset`, and then calls `flush`, which must be
// durable before it returns. State and offset are committed together, so a
// restart resumes exactly after the last flushed trade.
//
// Two implementations:
//   - InMemoryStateStore: the durable part lives behind a shared handle, so a
//     dropped store (a "crash") loses only what was never flushed.
//   - FileStateStore: one JSON document per partition, written with the
//     tmp + fsync + rename pattern.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::market_data::{CandleHistory, ReducerState};

/// Everything the pipeline remembers about one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolState {
    #[serde(default)]
    pub reducer: ReducerState,
    pub history: CandleHistory,
}

impl SymbolState {
    pub fn new(max_candles: usize) -> Self {
        Self {
            reducer: ReducerState::default(),
            history: CandleHistory::new(max_candles),
        }
    }
}

/// Keyed state store capability handed to the pipeline at construction.
pub trait StateStore: Send {
    fn get(&self, symbol: &str) -> Option<SymbolState>;

    /// Every symbol with state, staged or durable.
    fn symbols(&self) -> Vec<String>;

    /// Stage `state` for `symbol`; not durable until [`StateStore::flush`].
    fn set(&mut self, symbol: &str, state: SymbolState);

    /// Highest source offset whose effects are durable.
    fn committed_offset(&self) -> Option<u64>;

    /// Stage the processed offset; committed with the next flush.
    fn set_offset(&mut self, offset: u64);

    /// Make every staged change durable. Returns only once it is.
    fn flush(&mut self) -> Result<(), StoreError>;
}

/// On-disk / shared layout of a store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default)]
    pub committed_offset: Option<u64>,
    #[serde(default)]
    pub symbols: BTreeMap<String, SymbolState>,
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Durable half of an [`InMemoryStateStore`]. Clone it to reopen the same
/// data after dropping a store.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    document: RwLock<StoreDocument>,
    unavailable: AtomicBool,
    flushes: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store over this backend, seeing only flushed data.
    pub fn open(&self) -> InMemoryStateStore {
        InMemoryStateStore {
            backend: self.clone(),
            staged: BTreeMap::new(),
            staged_offset: None,
        }
    }

    /// Make every later flush fail (outage simulation).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> StoreDocument {
        self.inner.document.read().clone()
    }

    pub fn flush_count(&self) -> u64 {
        self.inner.flushes.load(Ordering::SeqCst)
    }
}

pub struct InMemoryStateStore {
    backend: MemoryBackend,
    staged: BTreeMap<String, SymbolState>,
    staged_offset: Option<u64>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        MemoryBackend::new().open()
    }

    pub fn backend(&self) -> &MemoryBackend {
        &self.backend
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for InMemoryStateStore {
    fn get(&self, symbol: &str) -> Option<SymbolState> {
        if let Some(state) = self.staged.get(symbol) {
            return Some(state.clone());
        }
        self.backend.inner.document.read().symbols.get(symbol).cloned()
    }

    fn symbols(&self) -> Vec<String> {
        let doc = self.backend.inner.document.read();
        let all: BTreeSet<&String> = doc.symbols.keys().chain(self.staged.keys()).collect();
        all.into_iter().cloned().collect()
    }

    fn set(&mut self, symbol: &str, state: SymbolState) {
        self.staged.insert(symbol.to_string(), state);
    }

    fn committed_offset(&self) -> Option<u64> {
        self.backend.inner.document.read().committed_offset
    }

    fn set_offset(&mut self, offset: u64) {
        self.staged_offset = Some(offset);
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        if self.backend.inner.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                reason: "in-memory backend marked unavailable".into(),
            });
        }
        let mut doc = self.backend.inner.document.write();
        doc.symbols.append(&mut self.staged);
        if let Some(offset) = self.staged_offset.take() {
            doc.committed_offset = Some(offset);
        }
        self.backend.inner.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File-backed store
// ---------------------------------------------------------------------------

/// JSON document store for a single partition. Every flush rewrites the
/// whole document, so its cost grows with symbols x history capacity.
pub struct FileStateStore {
    path: PathBuf,
    document: StoreDocument,
    staged_offset: Option<u64>,
    dirty: bool,
}

/// Borrowed view of a [`StoreDocument`] with the staged offset applied;
/// serialises to the same layout without cloning the symbol map.
#[derive(Serialize)]
struct DocumentView<'a> {
    committed_offset: Option<u64>,
    symbols: &'a BTreeMap<String, SymbolState>,
}

impl FileStateStore {
    /// Open (or create) the store at `path`. A missing file is an empty store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let document = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreDocument::default(),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };

        info!(
            path = %path.display(),
            symbols = document.symbols.len(),
            committed_offset = ?document.committed_offset,
            "state store opened"
        );

        Ok(Self {
            path,
            document,
            staged_offset: None,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

impl StateStore for FileStateStore {
    fn get(&self, symbol: &str) -> Option<SymbolState> {
        self.document.symbols.get(symbol).cloned()
    }

    fn symbols(&self) -> Vec<String> {
        self.document.symbols.keys().cloned().collect()
    }

    fn set(&mut self, symbol: &str, state: SymbolState) {
        self.dirty = true;
        self.document.symbols.insert(symbol.to_string(), state);
    }

    fn committed_offset(&self) -> Option<u64> {
        self.document.committed_offset
    }

    fn set_offset(&mut self, offset: u64) {
        self.staged_offset = Some(offset);
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        if !self.dirty && self.staged_offset.is_none() {
            return Ok(());
        }

        let committed_offset = self.staged_offset.or(self.document.committed_offset);
        let content = serde_json::to_vec(&DocumentView {
            committed_offset,
            symbols: &self.document.symbols,
        })?;

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;

        let tmp_path = self.path.with_extension("json.tmp");
        let mut file = File::create(&tmp_path).map_err(|e| io_error(&tmp_path, e))?;
        file.write_all(&content)
            .and_then(|_| file.sync_all())
            .map_err(|e| io_error(&tmp_path, e))?;
        fs::rename(&tmp_path, &self.path).map_err(|e| io_error(&self.path, e))?;
        sync_dir(parent)?;

        self.document.committed_offset = committed_offset;
        self.staged_offset = None;
        self.dirty = false;
        debug!(
            path = %self.path.display(),
            bytes = content.len(),
            committed_offset = ?committed_offset,
            "state flushed"
        );
        Ok(())
    }
}

/// Persist the rename itself: fsync the directory entry.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), StoreError> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| io_error(dir, e))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::Candle;

    fn state_with(close: f64) -> SymbolState {
        let mut state = SymbolState::new(5);
        state.history.upsert(Candle {
            symbol: "BTC-USD".into(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            window_start_ms: 0,
            window_end_ms: 10_000,
            last_trade_timestamp_ms: 1,
        });
        state
    }

    #[test]
    fn memory_store_loses_unflushed_state_on_drop() {
        let backend = MemoryBackend::new();
        {
            let mut store = backend.open();
            store.set("BTC-USD", state_with(1.0));
            store.set_offset(0);
            store.flush().unwrap();

            store.set("BTC-USD", state_with(2.0));
            store.set_offset(1);
            assert_eq!(store.get("BTC-USD").unwrap().history.last().unwrap().close, 2.0);
        }

        let reopened = backend.open();
        assert_eq!(reopened.symbols(), vec!["BTC-USD".to_string()]);
        assert_eq!(reopened.committed_offset(), Some(0));
        assert_eq!(reopened.get("BTC-USD").unwrap().history.last().unwrap().close, 1.0);
    }

    #[test]
    fn memory_store_flush_fails_when_unavailable() {
        let backend = MemoryBackend::new();
        let mut store = backend.open();
        backend.set_unavailable(true);
        store.set("BTC-USD", state_with(1.0));
        assert!(matches!(store.flush(), Err(StoreError::Unavailable { .. })));
        assert_eq!(backend.flush_count(), 0);
        assert!(backend.snapshot().symbols.is_empty());
    }

    #[test]
    fn file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partition-0.json");

        let mut store = FileStateStore::open(&path).unwrap();
        assert!(store.get("BTC-USD").is_none());
        assert_eq!(store.committed_offset(), None);

        store.set("BTC-USD", state_with(3.0));
        store.set_offset(7);
        store.flush().unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let reopened = FileStateStore::open(&path).unwrap();
        assert_eq!(reopened.committed_offset(), Some(7));
        assert_eq!(reopened.get("BTC-USD"), Some(state_with(3.0)));
    }

    #[test]
    fn file_store_offset_only_flush_keeps_symbols() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partition-0.json");

        let mut store = FileStateStore::open(&path).unwrap();
        store.flush().unwrap();
        assert!(!path.exists());

        store.set("BTC-USD", state_with(3.0));
        store.set_offset(1);
        store.flush().unwrap();
        store.set_offset(2);
        store.flush().unwrap();

        let reopened = FileStateStore::open(&path).unwrap();
        assert_eq!(reopened.committed_offset(), Some(2));
        assert_eq!(reopened.get("BTC-USD"), Some(state_with(3.0)));
        assert_eq!(reopened.symbols(), vec!["BTC-USD".to_string()]);
    }

    #[test]
    fn file_store_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let mut store = FileStateStore::open(&path).unwrap();
        store.set_offset(1);
        store.flush().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn file_store_rejects_corrupt_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(FileStateStore::open(&path), Err(StoreError::Serialize(_))));
    }
}
