// =============================================================================
// Output sinks — candle and indicator channels
// =============================================================================
//
// A sink receives every message the pipeline emits, in emission order per
// symbol. Delivery is at-least-once: a trade re-processed after a crash may
// repeat its emissions, and consumers keep the latest value per
// (symbol, window).
// =============================================================================

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;

/// Capability interface for an output channel.
pub trait Sink<T>: Send {
    fn send(&mut self, message: &T) -> Result<()>;
}

// ---------------------------------------------------------------------------
// JSON lines
// ---------------------------------------------------------------------------

/// Writes one JSON object per line. Clones share the underlying writer, so
/// several partitions can feed the same file without interleaving lines.
#[derive(Clone)]
pub struct JsonLinesSink {
    name: String,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl JsonLinesSink {
    pub fn stdout(name: impl Into<String>) -> Self {
        Self::from_writer(name, Box::new(std::io::stdout()))
    }

    /// Append to the file at `path`, creating it if needed.
    pub fn append_to(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open sink file {}", path.display()))?;
        Ok(Self::from_writer(name, Box::new(BufWriter::new(file))))
    }

    /// `-` means stdout, anything else is a file path.
    pub fn from_target(name: impl Into<String>, target: &str) -> Result<Self> {
        if target == "-" {
            Ok(Self::stdout(name))
        } else {
            Self::append_to(name, target)
        }
    }

    pub fn from_writer(name: impl Into<String>, writer: Box<dyn Write + Send>) -> Self {
        Self {
            name: name.into(),
            writer: Arc::new(Mutex::new(writer)),
        }
    }
}

impl<T: Serialize> Sink<T> for JsonLinesSink {
    fn send(&mut self, message: &T) -> Result<()> {
        let mut line = serde_json::to_vec(message)
            .with_context(|| format!("failed to serialise message for sink {}", self.name))?;
        line.push(b'\n');

        let mut writer = self.writer.lock();
        writer
            .write_all(&line)
            .and_then(|_| writer.flush())
            .with_context(|| format!("failed to write to sink {}", self.name))
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Collects messages in memory; clones share the same buffer.
#[derive(Debug)]
pub struct MemorySink<T> {
    messages: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for MemorySink<T> {
    fn clone(&self) -> Self {
        Self {
            messages: Arc::clone(&self.messages),
        }
    }
}

impl<T> Default for MemorySink<T> {
    fn default() -> Self {
        Self {
            messages: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone> MemorySink<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<T> {
        self.messages.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }
}

impl<T: Clone + Send> Sink<T> for MemorySink<T> {
    fn send(&mut self, message: &T) -> Result<()> {
        self.messages.lock().push(message.clone());
        Ok(())
    }
}
