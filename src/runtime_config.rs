// =============================================================================
// Runtime Configuration — pipeline settings with atomic save
// =============================================================================
//
// Every tunable of the candle pipeline lives here. The file is optional: a
// missing or unreadable config falls back to defaults, and a handful of
// environment variables override whatever was loaded.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// =============================================================================

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_candle_seconds() -> u32 {
    60
}

fn default_max_candles_in_state() -> usize {
    60
}

fn default_symbols() -> Vec<String> {
    vec!["BTC/USD".to_string(), "ETH/USD".to_string()]
}

fn default_replay_path() -> PathBuf {
    PathBuf::from("trades.jsonl")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

fn default_output() -> String {
    "-".to_string()
}

fn default_partitions() -> usize {
    1
}

// =============================================================================
// SourceKind
// =============================================================================

/// Where trades come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// JSON-lines trade file.
    #[default]
    Replay,
    /// Kraken public trade feed.
    Live,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replay => write!(f, "replay"),
            Self::Live => write!(f, "live"),
        }
    }
}

impl FromStr for SourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "replay" => Ok(Self::Replay),
            "live" => Ok(Self::Live),
            other => bail!("unknown trade source '{other}' (expected replay or live)"),
        }
    }
}

// =============================================================================
// PipelineConfig
// =============================================================================

/// Top-level configuration of the candle pipeline.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    // --- Aggregation ---------------------------------------------------------

    /// Window length in seconds.
    #[serde(default = "default_candle_seconds")]
    pub candle_seconds: u32,

    /// Emit the current candle after every trade instead of only on close.
    #[serde(default)]
    pub emit_incomplete_candles: bool,

    /// History capacity per symbol.
    #[serde(default = "default_max_candles_in_state")]
    pub max_candles_in_state: usize,

    // --- Input ---------------------------------------------------------------

    /// Exchange pairs subscribed by the live source.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    #[serde(default)]
    pub source: SourceKind,

    #[serde(default = "default_replay_path")]
    pub replay_path: PathBuf,

    // --- State & output ------------------------------------------------------

    /// One store file per partition is kept here.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// JSON-lines target for candles; `-` is stdout.
    #[serde(default = "default_output")]
    pub candles_output: String,

    /// JSON-lines target for indicator snapshots; `-` is stdout.
    #[serde(default = "default_output")]
    pub indicators_output: String,

    /// Number of symbol-hash partitions processed in parallel.
    #[serde(default = "default_partitions")]
    pub partitions: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            candle_seconds: default_candle_seconds(),
            emit_incomplete_candles: false,
            max_candles_in_state: default_max_candles_in_state(),
            symbols: default_symbols(),
            source: SourceKind::default(),
            replay_path: default_replay_path(),
            state_dir: default_state_dir(),
            candles_output: default_output(),
            indicators_output: default_output(),
            partitions: default_partitions(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read pipeline config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse pipeline config from {}", path.display()))?;

        info!(
            path = %path.display(),
            candle_seconds = config.candle_seconds,
            source = %config.source,
            "pipeline config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise pipeline config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "pipeline config saved (atomic)");
        Ok(())
    }

    /// Apply `CANDLE_*` style environment overrides from the process
    /// environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::apply_env_overrides`] with an explicit lookup, so the
    /// parsing can be exercised without touching the process environment.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("CANDLE_SECONDS") {
            self.candle_seconds = parse_var("CANDLE_SECONDS", &v)?;
        }
        if let Some(v) = lookup("EMIT_INCOMPLETE_CANDLES") {
            self.emit_incomplete_candles = parse_bool("EMIT_INCOMPLETE_CANDLES", &v)?;
        }
        if let Some(v) = lookup("MAX_CANDLES_IN_STATE") {
            self.max_candles_in_state = parse_var("MAX_CANDLES_IN_STATE", &v)?;
        }
        if let Some(v) = lookup("CANDLE_SYMBOLS") {
            let symbols: Vec<String> = v
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if symbols.is_empty() {
                warn!("CANDLE_SYMBOLS is empty, keeping configured symbols");
            } else {
                self.symbols = symbols;
            }
        }
        if let Some(v) = lookup("CANDLE_SOURCE") {
            self.source = v.parse()?;
        }
        if let Some(v) = lookup("CANDLE_PARTITIONS") {
            self.partitions = parse_var("CANDLE_PARTITIONS", &v)?;
        }
        Ok(())
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.candle_seconds == 0 {
            bail!("candle_seconds must be a positive number of seconds");
        }
        if self.max_candles_in_state == 0 {
            bail!("max_candles_in_state must be at least 1");
        }
        if self.partitions == 0 {
            bail!("partitions must be at least 1");
        }
        if self.source == SourceKind::Live && self.symbols.is_empty() {
            bail!("the live source needs at least one symbol");
        }
        Ok(())
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("invalid value '{value}' for {key}"))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("invalid value '{value}' for {key} (expected true or false)"),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn default_config_has_expected_values() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.candle_seconds, 60);
        assert!(!cfg.emit_incomplete_candles);
        assert_eq!(cfg.max_candles_in_state, 60);
        assert_eq!(cfg.symbols, vec!["BTC/USD", "ETH/USD"]);
        assert_eq!(cfg.source, SourceKind::Replay);
        assert_eq!(cfg.candles_output, "-");
        assert_eq!(cfg.partitions, 1);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: PipelineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, PipelineConfig::default());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "candle_seconds": 10, "source": "live", "symbols": ["BTC/USD"] }"#;
        let cfg: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.candle_seconds, 10);
        assert_eq!(cfg.source, SourceKind::Live);
        assert_eq!(cfg.symbols, vec!["BTC/USD"]);
        assert_eq!(cfg.max_candles_in_state, 60);
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline_config.json");
        let cfg = PipelineConfig {
            candle_seconds: 5,
            emit_incomplete_candles: true,
            ..PipelineConfig::default()
        };
        cfg.save(&path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(PipelineConfig::load(&path).unwrap(), cfg);
    }

    #[test]
    fn load_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PipelineConfig::load(dir.path().join("absent.json")).is_err());
    }

    #[test]
    fn env_overrides_replace_loaded_values() {
        let mut cfg = PipelineConfig::default();
        cfg.apply_overrides(env(&[
            ("CANDLE_SECONDS", "10"),
            ("EMIT_INCOMPLETE_CANDLES", "true"),
            ("MAX_CANDLES_IN_STATE", "3"),
            ("CANDLE_SYMBOLS", "btc/usd, sol/usd,"),
            ("CANDLE_SOURCE", "LIVE"),
            ("CANDLE_PARTITIONS", "4"),
        ]))
        .unwrap();
        assert_eq!(cfg.candle_seconds, 10);
        assert!(cfg.emit_incomplete_candles);
        assert_eq!(cfg.max_candles_in_state, 3);
        assert_eq!(cfg.symbols, vec!["BTC/USD", "SOL/USD"]);
        assert_eq!(cfg.source, SourceKind::Live);
        assert_eq!(cfg.partitions, 4);
    }

    #[test]
    fn malformed_override_is_an_error() {
        let mut cfg = PipelineConfig::default();
        assert!(cfg.apply_overrides(env(&[("CANDLE_SECONDS", "ten")])).is_err());
        assert!(cfg
            .apply_overrides(env(&[("EMIT_INCOMPLETE_CANDLES", "maybe")]))
            .is_err());
        assert!(cfg.apply_overrides(env(&[("CANDLE_SOURCE", "kafka")])).is_err());
    }

    #[test]
    fn validate_rejects_zero_values() {
        for cfg in [
            PipelineConfig { candle_seconds: 0, ..PipelineConfig::default() },
            PipelineConfig { max_candles_in_state: 0, ..PipelineConfig::default() },
            PipelineConfig { partitions: 0, ..PipelineConfig::default() },
        ] {
            assert!(cfg.validate().is_err());
        }
    }
}
