//! State and log backend contracts, plus the shared connection set.
//!
//! The state backend persists three collections: job documents (one per
//! job, keyed by id), worker heartbeat records (one per worker, upsert
//! by id), and scheduled-job definitions. The log backend takes batched
//! appends of structured records. Both are expressed as traits; the
//! worker core owns no storage technology.
//!
//! # Write Discipline
//!
//! - Job documents are written by the executor and the enqueue path,
//!   never by the monitor.
//! - The heartbeat record is written only by the monitoring loop and by
//!   the shutdown finalizer.
//! - Scheduled-job definitions are read-mostly; the scheduler advances
//!   `last_enqueued` after each enqueue.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::job::{JobDocument, JobStatus};
use crate::logger::{LogHandler, LogRecord};
use crate::monitor::WorkerReport;
use crate::queue::QueueAdapter;
use crate::scheduler::ScheduledJob;

/// How hard a write should try before returning.
///
/// Best-effort writes may be acknowledged before they are durable;
/// durable writes block until the backend confirms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Fire-and-forget quality: used by the periodic monitoring loop.
    BestEffort,

    /// Confirmed durable: used by the shutdown finalizer.
    Durable,
}

/// The job/state backend.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Verify the backend is reachable. Called once at worker startup;
    /// a failure there is fatal.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// Insert a new job document. The producer path.
    async fn insert_job(&self, doc: &JobDocument) -> Result<()>;

    /// Load a job document.
    async fn job(&self, id: Uuid) -> Result<Option<JobDocument>>;

    /// Atomically claim a job: load its document and transition
    /// `queued → started`, stamping `started_at` and the owning worker.
    ///
    /// Also accepts a document still in `retry` (a delayed re-enqueue
    /// lands on the queue without flipping the document first).
    ///
    /// Returns `None` when no document exists for the id (stale queue
    /// entry).
    async fn mark_started(
        &self,
        id: Uuid,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<JobDocument>>;

    /// Persist a terminal status, stamping `ended_at`.
    async fn save_status(
        &self,
        id: Uuid,
        status: JobStatus,
        result: Option<serde_json::Value>,
        traceback: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Persist status `retry`, increment the retry counter, stamp
    /// `ended_at`. Returns the new counter value.
    async fn save_retry(&self, id: Uuid, traceback: String, now: DateTime<Utc>) -> Result<u32>;

    /// Flip a document back to `queued` on the given queue ahead of an
    /// immediate re-enqueue.
    async fn requeue(&self, id: Uuid, queue: &str, now: DateTime<Utc>) -> Result<()>;

    /// Upsert the worker heartbeat record.
    async fn upsert_worker(&self, report: &WorkerReport, durability: Durability) -> Result<()>;

    /// Load all scheduled-job definitions.
    async fn scheduled_jobs(&self) -> Result<Vec<ScheduledJob>>;

    /// Advance a definition's `last_enqueued` timestamp.
    async fn record_enqueued(&self, definition: Uuid, when: DateTime<Utc>) -> Result<()>;
}

/// The log-shipping backend.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Append a batch of records to durable storage.
    async fn append(&self, records: Vec<LogRecord>, durability: Durability) -> Result<()>;
}

/// The shared connection set.
///
/// One instance per worker process, cloned into every loop and slot.
/// Cloning is cheap: every member is behind an `Arc`.
#[derive(Clone)]
pub struct Backends {
    /// The queue backend.
    pub queue: Arc<dyn QueueAdapter>,

    /// The state backend.
    pub state: Arc<dyn StateStore>,

    /// The buffered log sink (which owns the log backend handle).
    pub logs: Arc<LogHandler>,
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}
