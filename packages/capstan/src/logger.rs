//! Buffered structured log sink.
//!
//! The [`LogHandler`] accumulates [`LogRecord`]s in memory and ships
//! them to the durable [`LogStore`](crate::store::LogStore) in batches:
//! best-effort from the monitoring loop, synchronously from the
//! shutdown finalizer.
//!
//! Unless the worker is configured `quiet`, every record is also
//! mirrored to `tracing` so the console sees it immediately.

use std::sync::Arc;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::store::{Durability, LogStore};

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// The serialized label for this level.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

/// One structured log record, shipped in batches to the log store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// The worker that produced the record.
    pub worker_id: Uuid,

    /// The job the record belongs to, when produced inside a slot.
    pub job_id: Option<Uuid>,

    /// When the record was produced.
    pub timestamp: DateTime<Utc>,

    /// Severity.
    pub level: LogLevel,

    /// Message text.
    pub message: String,

    /// Structured payload attached to the record, if any.
    pub extra: Option<serde_json::Value>,
}

/// Buffered, asynchronously-flushed log sink.
///
/// Shared by the worker loop, the executor, and the background loops.
/// The buffer is mutated under a mutex; flushing swaps it out so the
/// store call happens without holding the lock.
pub struct LogHandler {
    worker_id: Uuid,
    quiet: bool,
    store: Arc<dyn LogStore>,
    buffer: Mutex<Vec<LogRecord>>,
}

impl LogHandler {
    /// Create a handler for one worker.
    pub fn new(worker_id: Uuid, store: Arc<dyn LogStore>, quiet: bool) -> Self {
        Self {
            worker_id,
            quiet,
            store,
            buffer: Mutex::new(Vec::new()),
        }
    }

    /// Buffer a record, mirroring it to the console unless quiet.
    pub fn record(&self, level: LogLevel, job_id: Option<Uuid>, message: impl Into<String>) {
        self.record_with(level, job_id, message, None);
    }

    /// Buffer a record carrying a structured payload.
    pub fn record_with(
        &self,
        level: LogLevel,
        job_id: Option<Uuid>,
        message: impl Into<String>,
        extra: Option<serde_json::Value>,
    ) {
        let message = message.into();

        if !self.quiet {
            match level {
                LogLevel::Debug => debug!(job_id = ?job_id, "{message}"),
                LogLevel::Info => info!(job_id = ?job_id, "{message}"),
                LogLevel::Warning => warn!(job_id = ?job_id, "{message}"),
                LogLevel::Error => error!(job_id = ?job_id, "{message}"),
            }
        }

        let record = LogRecord {
            worker_id: self.worker_id,
            job_id,
            timestamp: Utc::now(),
            level,
            message,
            extra,
        };

        self.buffer.lock().expect("log buffer poisoned").push(record);
    }

    /// Buffer an info record.
    pub fn info(&self, job_id: Option<Uuid>, message: impl Into<String>) {
        self.record(LogLevel::Info, job_id, message);
    }

    /// Buffer a warning record.
    pub fn warning(&self, job_id: Option<Uuid>, message: impl Into<String>) {
        self.record(LogLevel::Warning, job_id, message);
    }

    /// Buffer an error record.
    pub fn error(&self, job_id: Option<Uuid>, message: impl Into<String>) {
        self.record(LogLevel::Error, job_id, message);
    }

    /// Number of records waiting to be shipped.
    pub fn buffered(&self) -> usize {
        self.buffer.lock().expect("log buffer poisoned").len()
    }

    /// Ship the buffered records to the log store.
    ///
    /// Returns the number of records shipped. On store failure the
    /// batch is put back at the front of the buffer so the next flush
    /// retries it.
    pub async fn flush(&self, durability: Durability) -> anyhow::Result<usize> {
        let batch = {
            let mut buffer = self.buffer.lock().expect("log buffer poisoned");
            if buffer.is_empty() {
                return Ok(0);
            }
            std::mem::take(&mut *buffer)
        };

        let count = batch.len();
        match self.store.append(batch.clone(), durability).await {
            Ok(()) => Ok(count),
            Err(e) => {
                let mut buffer = self.buffer.lock().expect("log buffer poisoned");
                let drained = std::mem::take(&mut *buffer);
                *buffer = batch;
                buffer.extend(drained);
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for LogHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogHandler")
            .field("worker_id", &self.worker_id)
            .field("quiet", &self.quiet)
            .field("buffered", &self.buffered())
            .finish()
    }
}
