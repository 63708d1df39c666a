use crate::runtime::clock::WallClock;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Severity levels for pipeline lifecycle logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced while encoding log records.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to serialize log record: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
struct LogRecord<'a> {
    ts: u64,
    level: &'a str,
    component: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<&'a str>,
    message: &'a str,
}

/// Bounded JSON-line log buffer with level filtering.
///
/// Keeps the newest `capacity` encoded lines, counting what rotation
/// discarded. The level can be overridden at runtime.
#[derive(Debug)]
pub struct JsonLogBuffer {
    capacity: usize,
    min_level: LogLevel,
    lines: VecDeque<String>,
    discarded: u64,
}

impl JsonLogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            min_level: LogLevel::Info,
            lines: VecDeque::new(),
            discarded: 0,
        }
    }

    pub fn level(&self) -> LogLevel {
        self.min_level
    }

    /// Applies a dynamic log-level override.
    pub fn set_level(&mut self, level: LogLevel) {
        self.min_level = level;
    }

    /// Encodes and retains one record; records below the current level are
    /// dropped without being counted as discarded.
    pub fn emit(
        &mut self,
        ts_ms: u64,
        level: LogLevel,
        component: &str,
        stream: Option<&str>,
        message: &str,
    ) -> Result<(), LoggingError> {
        if level < self.min_level {
            return Ok(());
        }
        let record = LogRecord {
            ts: ts_ms,
            level: level.as_str(),
            component,
            stream,
            message,
        };
        let line = serde_json::to_string(&record)?;
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
            self.discarded += 1;
        }
        self.lines.push_back(line);
        Ok(())
    }

    /// Retained lines, oldest first.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    /// Lines rotated out of the buffer since construction.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}

/// Shared, timestamping front-end over a [`JsonLogBuffer`].
#[derive(Clone)]
pub struct StreamLog {
    buffer: Arc<Mutex<JsonLogBuffer>>,
    clock: Arc<dyn WallClock>,
}

impl StreamLog {
    pub fn new(capacity: usize, clock: Arc<dyn WallClock>) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(JsonLogBuffer::new(capacity))),
            clock,
        }
    }

    pub fn set_level(&self, level: LogLevel) {
        self.buffer.lock().unwrap().set_level(level);
    }

    pub fn emit(&self, level: LogLevel, component: &str, stream: Option<&str>, message: &str) {
        let ts = self.clock.now_ms();
        // A string-only record cannot fail to serialize; if it ever does the
        // line is dropped instead of poisoning the pipeline.
        let _ = self
            .buffer
            .lock()
            .unwrap()
            .emit(ts, level, component, stream, message);
    }

    pub fn info(&self, component: &str, stream: Option<&str>, message: &str) {
        self.emit(LogLevel::Info, component, stream, message);
    }

    pub fn warn(&self, component: &str, stream: Option<&str>, message: &str) {
        self.emit(LogLevel::Warn, component, stream, message);
    }

    pub fn error(&self, component: &str, stream: Option<&str>, message: &str) {
        self.emit(LogLevel::Error, component, stream, message);
    }

    /// Snapshot of the retained lines, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.buffer
            .lock()
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }
}
