//! Structured log events emitted by the supervisor.
//!
//! The controller and launcher never wait on persistence: every sink accepts
//! an event and returns immediately. Where an event ends up (tracing output,
//! a daily log file, an in-memory tail) is the sink's business.

use crate::config::LogConfig;
use crate::error::{Result, WardenError};
use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Severity of a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single log event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEvent {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }

    /// Render as `<timestamp> [LEVEL]: message`.
    pub fn to_line(&self) -> String {
        format!(
            "{} [{}]: {}",
            self.timestamp.to_rfc3339(),
            self.level.as_str().to_uppercase(),
            self.message
        )
    }
}

/// Receiver of supervisor log events.
///
/// Implementations must not block the caller.
pub trait LogSink: Send + Sync {
    fn emit(&self, event: LogEvent);
}

/// Shared handle to a log sink.
pub type SharedSink = Arc<dyn LogSink>;

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, event: LogEvent) {
        match event.level {
            LogLevel::Info => info!(target: "botwarden::events", "{}", event.message),
            LogLevel::Warn => warn!(target: "botwarden::events", "{}", event.message),
            LogLevel::Error => error!(target: "botwarden::events", "{}", event.message),
        }
    }
}

/// Keeps the most recent events in memory.
#[derive(Debug)]
pub struct MemorySink {
    capacity: usize,
    events: Mutex<VecDeque<LogEvent>>,
}

impl MemorySink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    /// Return up to `lines` of the newest events, oldest first.
    pub fn recent(&self, lines: usize) -> Vec<LogEvent> {
        let events = match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let skip = events.len().saturating_sub(lines);
        events.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check whether any stored message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.recent(self.capacity)
            .iter()
            .any(|e| e.message.contains(needle))
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new(LogConfig::MEMORY_CAPACITY)
    }
}

impl LogSink for MemorySink {
    fn emit(&self, event: LogEvent) {
        let mut events = match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }
}

/// Appends events to `log_YYYY-MM-DD.txt` in a directory.
///
/// Writes happen on a background task fed by an unbounded channel, so
/// `emit` returns as soon as the event is queued. Must be created inside a
/// Tokio runtime.
#[derive(Debug, Clone)]
pub struct DailyFileSink {
    dir: PathBuf,
    tx: mpsc::UnboundedSender<LogEvent>,
}

impl DailyFileSink {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref().to_path_buf();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::writer_loop(dir.clone(), rx));
        Self { dir, tx }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn writer_loop(dir: PathBuf, mut rx: mpsc::UnboundedReceiver<LogEvent>) {
        while let Some(event) = rx.recv().await {
            let date = event.timestamp.with_timezone(&Local).date_naive();
            let path = dir.join(log_file_name(date));
            if let Err(e) = append_line(&path, &event.to_line()).await {
                // Persistence failures stay local to the sink.
                warn!("Failed to write log event to {}: {}", path.display(), e);
            }
        }
    }
}

impl LogSink for DailyFileSink {
    fn emit(&self, event: LogEvent) {
        let _ = self.tx.send(event);
    }
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    Ok(())
}

/// Duplicates every event to several sinks.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<SharedSink>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: SharedSink) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl LogSink for FanoutSink {
    fn emit(&self, event: LogEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}

/// Name of the log file for a given day.
pub fn log_file_name(date: NaiveDate) -> String {
    format!("{}{}.txt", LogConfig::FILE_PREFIX, date.format("%Y-%m-%d"))
}

/// Path of today's log file inside `dir`, by local date.
pub fn today_log_path(dir: &Path) -> PathBuf {
    dir.join(log_file_name(Local::now().date_naive()))
}

/// Name of the host server's log file for a given day.
pub fn general_log_file_name(date: NaiveDate) -> String {
    format!(
        "{}{}{}",
        LogConfig::GENERAL_FILE_PREFIX,
        date.format("%Y-%m-%d"),
        LogConfig::GENERAL_FILE_EXTENSION
    )
}

/// Path of today's host server log inside `dir`, by UTC date.
pub fn general_log_path(dir: &Path) -> PathBuf {
    dir.join(general_log_file_name(Utc::now().date_naive()))
}

/// Read today's log file from `dir`.
pub async fn read_today_log(dir: &Path) -> Result<String> {
    read_log_file(today_log_path(dir)).await
}

/// Read today's host server log from `dir`.
pub async fn read_general_log(dir: &Path) -> Result<String> {
    read_log_file(general_log_path(dir)).await
}

async fn read_log_file(path: PathBuf) -> Result<String> {
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => Ok(contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(WardenError::FileNotFound(path)),
        Err(e) => Err(WardenError::io_with_path(e, path)),
    }
}
