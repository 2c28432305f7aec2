//! hoplink Logging
//!
//! Unified logging setup for the daemon and the CLI, plus the in-memory
//! [`LogBuffer`] the daemon serves over IPC.
//!
//! ## Usage
//!
//! ```no_run
//! use hoplink_logging::{try_init_with_buffer, LogBuffer, LogLevel};
//!
//! let buffer = LogBuffer::new(1024 * 1024);
//! try_init_with_buffer(LogLevel::from_verbose(false), buffer.clone()).unwrap();
//!
//! tracing::info!("hello");
//! assert!(buffer.contents().contains("hello"));
//! ```

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Default capacity of the daemon's log buffer
pub const DEFAULT_BUFFER_BYTES: usize = 1024 * 1024;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    /// Error messages only
    Error,
    /// Warnings and errors
    Warn,
    /// Info, warnings, and errors (default)
    #[default]
    Info,
    /// Debug messages and above
    Debug,
    /// All messages including trace
    Trace,
}

impl LogLevel {
    /// Create a log level from a verbose flag
    ///
    /// - `false` → `Info`
    /// - `true` → `Debug`
    pub fn from_verbose(verbose: bool) -> Self {
        if verbose {
            Self::Debug
        } else {
            Self::Info
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.as_str()))
    }
}

/// Bounded in-memory copy of the formatted log output
///
/// When an append pushes the contents past capacity, whole lines are evicted from
/// the front until it fits again.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    inner: Arc<Mutex<BufferInner>>,
}

#[derive(Debug)]
struct BufferInner {
    data: Vec<u8>,
    capacity: usize,
}

impl BufferInner {
    fn evict(&mut self) {
        if self.data.len() <= self.capacity {
            return;
        }
        let excess = self.data.len() - self.capacity;
        let cut = match self.data[excess..].iter().position(|b| *b == b'\n') {
            Some(pos) => excess + pos + 1,
            None => self.data.len(),
        };
        self.data.drain(..cut);
    }
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BufferInner {
                data: Vec::new(),
                capacity,
            })),
        }
    }

    pub fn append(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock();
        inner.data.extend_from_slice(bytes);
        inner.evict();
    }

    /// Everything currently buffered, oldest first
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.inner.lock().data).into_owned()
    }

    pub fn clear(&self) {
        self.inner.lock().data.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_BYTES)
    }
}

/// Writer handed to the fmt layer for each event
pub struct LogBufferWriter {
    buffer: LogBuffer,
}

impl io::Write for LogBufferWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBufferWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogBufferWriter {
            buffer: self.clone(),
        }
    }
}

/// Initialize logging with the specified level
///
/// Call this once at the start of your application. A second call logs the
/// failure to stderr and leaves the existing subscriber in place.
pub fn init(level: LogLevel) {
    if let Err(e) = try_init(level) {
        eprintln!("Failed to initialize logging: {}", e);
    }
}

/// Try to initialize logging, returning an error if already initialized
pub fn try_init(level: LogLevel) -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(level.filter())
        .with_target(false)
        .try_init()
        .map_err(|e| e.to_string())
}

/// Initialize logging to stderr and, in parallel, into `buffer`
pub fn try_init_with_buffer(level: LogLevel, buffer: LogBuffer) -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(level.filter())
        .with_target(false)
        .with_ansi(false)
        .with_writer(io::stderr.and(buffer))
        .try_init()
        .map_err(|e| e.to_string())
}

/// Initialize logging for tests (captures output for test framework)
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_log_level_from_verbose() {
        assert_eq!(LogLevel::from_verbose(false), LogLevel::Info);
        assert_eq!(LogLevel::from_verbose(true), LogLevel::Debug);
    }

    #[test]
    fn test_log_level_as_str() {
        assert_eq!(LogLevel::Error.as_str(), "error");
        assert_eq!(LogLevel::Warn.as_str(), "warn");
        assert_eq!(LogLevel::Info.as_str(), "info");
        assert_eq!(LogLevel::Debug.as_str(), "debug");
        assert_eq!(LogLevel::Trace.as_str(), "trace");
    }

    #[test]
    fn test_log_level_default() {
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }

    #[test]
    fn test_buffer_keeps_lines_in_order() {
        let buffer = LogBuffer::new(64);
        buffer.append(b"one\n");
        buffer.append(b"two\n");
        assert_eq!(buffer.contents(), "one\ntwo\n");
        assert_eq!(buffer.len(), 8);
    }

    #[test]
    fn test_buffer_evicts_whole_lines() {
        let buffer = LogBuffer::new(10);
        buffer.append(b"aaaa\n");
        buffer.append(b"bbbb\n");
        buffer.append(b"cc\n");
        assert_eq!(buffer.contents(), "bbbb\ncc\n");
        assert!(buffer.len() <= 10);
    }

    #[test]
    fn test_buffer_drops_oversized_line() {
        let buffer = LogBuffer::new(4);
        buffer.append(b"far too long\n");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_buffer_clear() {
        let buffer = LogBuffer::default();
        buffer.append(b"line\n");
        buffer.clear();
        assert_eq!(buffer.contents(), "");
    }

    #[test]
    fn test_writer_shares_buffer() {
        let buffer = LogBuffer::new(128);
        let mut writer = buffer.make_writer();
        writer.write_all(b"from writer\n").unwrap();
        writer.flush().unwrap();
        assert_eq!(buffer.contents(), "from writer\n");
    }
}
