//! Testing utilities: in-memory backends and the built-in task set.
//!
//! Everything here implements the real backend contracts, so a worker
//! wired with these runs the full dispatch/execute/persist path with no
//! external services.
//!
//! # Feature Flag
//!
//! This module is compiled for this crate's own tests and for
//! downstream crates that enable the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! capstan = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use capstan::testing::{test_registry, test_worker};
//! use capstan::{Job, WorkerConfig};
//!
//! let (worker, state, broker) = test_worker(
//!     WorkerConfig { max_jobs: 1, ..Default::default() },
//!     test_registry(),
//! );
//!
//! let id = Job::enqueue(&worker.backends(), "Add", json!({"a": 2, "b": 3}), "default")
//!     .await?;
//! worker.run().await?;
//!
//! assert_eq!(state.job(id).unwrap().result, Some(json!(5)));
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::TaskError;
use crate::job::{JobDocument, JobStatus};
use crate::logger::{LogHandler, LogRecord};
use crate::monitor::WorkerReport;
use crate::queue::QueueAdapter;
use crate::registry::{Task, TaskRegistry, TaskSpec};
use crate::scheduler::ScheduledJob;
use crate::store::{Backends, Durability, LogStore, StateStore};
use crate::worker::Worker;

// =============================================================================
// In-Memory Queue Backend
// =============================================================================

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<Uuid>>,
}

/// In-memory [`QueueAdapter`] with real blocking-pop semantics.
///
/// `blocking_pop` parks on a [`Notify`] until a push lands, scanning
/// queue names left to right on each wakeup. Delayed pushes sleep on
/// the tokio clock, so `start_paused` tests can fast-forward them.
#[derive(Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl InMemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ids currently on a queue.
    pub fn len(&self, queue: &str) -> usize {
        self.state
            .lock()
            .expect("broker poisoned")
            .queues
            .get(queue)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Whether a queue is empty.
    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    /// Remove and return everything on a queue.
    pub fn drain(&self, queue: &str) -> Vec<Uuid> {
        self.state
            .lock()
            .expect("broker poisoned")
            .queues
            .get_mut(queue)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl QueueAdapter for InMemoryBroker {
    async fn blocking_pop(&self, queues: &[String]) -> Result<(String, Uuid)> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register for wakeups before checking, so a push landing
            // between the check and the await is never missed.
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().expect("broker poisoned");
                for queue in queues {
                    if let Some(ids) = state.queues.get_mut(queue) {
                        if let Some(id) = ids.pop_front() {
                            return Ok((queue.clone(), id));
                        }
                    }
                }
            }
            notified.await;
        }
    }

    async fn batch_pop(&self, queue: &str, n: usize) -> Result<Vec<Uuid>> {
        let mut state = self.state.lock().expect("broker poisoned");
        let ids = match state.queues.get_mut(queue) {
            Some(ids) => ids,
            None => return Ok(Vec::new()),
        };

        let mut popped = Vec::new();
        for _ in 0..n {
            match ids.pop_front() {
                Some(id) => popped.push(id),
                None => break,
            }
        }
        Ok(popped)
    }

    async fn push(&self, queue: &str, id: Uuid) -> Result<()> {
        self.state
            .lock()
            .expect("broker poisoned")
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(id);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn push_delayed(&self, queue: &str, id: Uuid, delay: Duration) -> Result<()> {
        let state = self.state.clone();
        let notify = self.notify.clone();
        let queue = queue.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            state
                .lock()
                .expect("broker poisoned")
                .queues
                .entry(queue)
                .or_default()
                .push_back(id);
            notify.notify_waiters();
        });
        Ok(())
    }
}

// =============================================================================
// In-Memory State Backend
// =============================================================================

#[derive(Default)]
struct StateInner {
    jobs: HashMap<Uuid, JobDocument>,
    workers: HashMap<Uuid, WorkerReport>,
    scheduled: Vec<ScheduledJob>,
}

/// In-memory [`StateStore`] with inspection helpers for assertions.
#[derive(Default)]
pub struct InMemoryState {
    inner: Mutex<StateInner>,
}

impl InMemoryState {
    /// Create an empty state store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a job document.
    pub fn job(&self, id: Uuid) -> Option<JobDocument> {
        self.inner.lock().expect("state poisoned").jobs.get(&id).cloned()
    }

    /// All job documents currently in the given status.
    pub fn jobs_with_status(&self, status: JobStatus) -> Vec<JobDocument> {
        self.inner
            .lock()
            .expect("state poisoned")
            .jobs
            .values()
            .filter(|doc| doc.status == status)
            .cloned()
            .collect()
    }

    /// The last heartbeat upserted for a worker.
    pub fn worker_report(&self, id: Uuid) -> Option<WorkerReport> {
        self.inner
            .lock()
            .expect("state poisoned")
            .workers
            .get(&id)
            .cloned()
    }

    /// Seed a scheduled-job definition.
    pub fn insert_scheduled(&self, definition: ScheduledJob) {
        self.inner
            .lock()
            .expect("state poisoned")
            .scheduled
            .push(definition);
    }

    /// Look up a scheduled-job definition.
    pub fn scheduled(&self, id: Uuid) -> Option<ScheduledJob> {
        self.inner
            .lock()
            .expect("state poisoned")
            .scheduled
            .iter()
            .find(|d| d.id == id)
            .cloned()
    }
}

#[async_trait]
impl StateStore for InMemoryState {
    async fn insert_job(&self, doc: &JobDocument) -> Result<()> {
        self.inner
            .lock()
            .expect("state poisoned")
            .jobs
            .insert(doc.id, doc.clone());
        Ok(())
    }

    async fn job(&self, id: Uuid) -> Result<Option<JobDocument>> {
        Ok(self.inner.lock().expect("state poisoned").jobs.get(&id).cloned())
    }

    async fn mark_started(
        &self,
        id: Uuid,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<JobDocument>> {
        let mut inner = self.inner.lock().expect("state poisoned");
        let doc = match inner.jobs.get_mut(&id) {
            Some(doc) => doc,
            None => return Ok(None),
        };

        // Only a queued (or delayed-retry) document is claimable.
        if !matches!(doc.status, JobStatus::Queued | JobStatus::Retry) {
            return Ok(None);
        }

        doc.status = JobStatus::Started;
        doc.started_at = Some(now);
        doc.worker_id = Some(worker_id);
        Ok(Some(doc.clone()))
    }

    async fn save_status(
        &self,
        id: Uuid,
        status: JobStatus,
        result: Option<Value>,
        traceback: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().expect("state poisoned");
        let doc = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("job {} not found", id))?;
        doc.status = status;
        doc.result = result;
        doc.traceback = traceback;
        doc.ended_at = Some(now);
        Ok(())
    }

    async fn save_retry(&self, id: Uuid, traceback: String, now: DateTime<Utc>) -> Result<u32> {
        let mut inner = self.inner.lock().expect("state poisoned");
        let doc = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("job {} not found", id))?;
        doc.status = JobStatus::Retry;
        doc.retry_count += 1;
        doc.traceback = Some(traceback);
        doc.ended_at = Some(now);
        Ok(doc.retry_count)
    }

    async fn requeue(&self, id: Uuid, queue: &str, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().expect("state poisoned");
        let doc = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("job {} not found", id))?;
        doc.status = JobStatus::Queued;
        doc.queue = queue.to_string();
        doc.queued_at = now;
        Ok(())
    }

    async fn upsert_worker(&self, report: &WorkerReport, _durability: Durability) -> Result<()> {
        self.inner
            .lock()
            .expect("state poisoned")
            .workers
            .insert(report.id, report.clone());
        Ok(())
    }

    async fn scheduled_jobs(&self) -> Result<Vec<ScheduledJob>> {
        Ok(self.inner.lock().expect("state poisoned").scheduled.clone())
    }

    async fn record_enqueued(&self, definition: Uuid, when: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().expect("state poisoned");
        if let Some(def) = inner.scheduled.iter_mut().find(|d| d.id == definition) {
            def.last_enqueued = Some(when);
        }
        Ok(())
    }
}

// =============================================================================
// In-Memory Log Backend
// =============================================================================

/// In-memory [`LogStore`] with one-shot failure injection.
#[derive(Default)]
pub struct InMemoryLogStore {
    records: Mutex<Vec<LogRecord>>,
    fail_next: AtomicBool,
}

impl InMemoryLogStore {
    /// Create an empty log store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything appended so far.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().expect("log store poisoned").clone()
    }

    /// Make the next append fail.
    pub fn fail_next_append(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl LogStore for InMemoryLogStore {
    async fn append(&self, records: Vec<LogRecord>, _durability: Durability) -> Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            bail!("log store unavailable");
        }
        self.records
            .lock()
            .expect("log store poisoned")
            .extend(records);
        Ok(())
    }
}

// =============================================================================
// Built-In Tasks
// =============================================================================

async fn sleep_if_asked(params: &Value) {
    let secs = params.get("sleep").and_then(|v| v.as_f64()).unwrap_or(0.0);
    if secs > 0.0 {
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
    }
}

/// Adds `a + b`, sleeping first when `sleep` is set.
pub struct Add;

#[async_trait]
impl Task for Add {
    async fn run(&self, params: Value) -> Result<Value, TaskError> {
        sleep_if_asked(&params).await;
        let a = params.get("a").and_then(|v| v.as_i64()).unwrap_or(0);
        let b = params.get("b").and_then(|v| v.as_i64()).unwrap_or(0);
        Ok(json!(a + b))
    }
}

/// Echoes its params back, sleeping first when `sleep` is set.
pub struct ReturnParams;

#[async_trait]
impl Task for ReturnParams {
    async fn run(&self, params: Value) -> Result<Value, TaskError> {
        sleep_if_asked(&params).await;
        Ok(params)
    }
}

/// Requests an explicit retry of the current job (honoring `queue` and
/// `countdown` params), then fails.
pub struct Retry;

#[async_trait]
impl Task for Retry {
    async fn run(&self, params: Value) -> Result<Value, TaskError> {
        let queue = params
            .get("queue")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let countdown = params
            .get("countdown")
            .and_then(|v| v.as_f64())
            .map(Duration::from_secs_f64);

        Err(TaskError::unhandled("explicit retry requested").with_retry(queue, countdown))
    }
}

/// Fails with the given `message`, optionally tagged via `tag` and
/// sleeping first when `sleep` is set.
pub struct RaiseException;

#[async_trait]
impl Task for RaiseException {
    async fn run(&self, params: Value) -> Result<Value, TaskError> {
        sleep_if_asked(&params).await;

        let message = params
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let error = match params.get("tag").and_then(|v| v.as_str()) {
            Some(tag) => TaskError::tagged(crate::error::ErrorTag::new(tag), message),
            None => TaskError::unhandled(message),
        };
        Err(error)
    }
}

// =============================================================================
// Wiring Helpers
// =============================================================================

/// A registry with the built-in task set under their plain names.
pub fn test_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register("Add", TaskSpec::new(Arc::new(Add)));
    registry.register("ReturnParams", TaskSpec::new(Arc::new(ReturnParams)));
    registry.register("Retry", TaskSpec::new(Arc::new(Retry)));
    registry.register("RaiseException", TaskSpec::new(Arc::new(RaiseException)));
    registry
}

/// Fresh in-memory backends plus handles for assertions.
pub fn test_backends() -> (Backends, Arc<InMemoryState>, Arc<InMemoryBroker>) {
    let state = Arc::new(InMemoryState::new());
    let broker = Arc::new(InMemoryBroker::new());
    let logs = Arc::new(LogHandler::new(
        Uuid::new_v4(),
        Arc::new(InMemoryLogStore::new()),
        true,
    ));

    let backends = Backends {
        queue: broker.clone(),
        state: state.clone(),
        logs,
    };
    (backends, state, broker)
}

/// A worker wired to fresh in-memory backends.
pub fn test_worker(
    config: WorkerConfig,
    registry: TaskRegistry,
) -> (Worker, Arc<InMemoryState>, Arc<InMemoryBroker>) {
    let state = Arc::new(InMemoryState::new());
    let broker = Arc::new(InMemoryBroker::new());
    let logs = Arc::new(InMemoryLogStore::new());

    let worker = Worker::new(config, broker.clone(), state.clone(), logs, registry);
    (worker, state, broker)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broker_fifo_within_queue() {
        let broker = InMemoryBroker::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        broker.push("q", first).await.unwrap();
        broker.push("q", second).await.unwrap();

        let queues = vec!["q".to_string()];
        let (_, a) = broker.blocking_pop(&queues).await.unwrap();
        let (_, b) = broker.blocking_pop(&queues).await.unwrap();
        assert_eq!((a, b), (first, second));
    }

    #[tokio::test]
    async fn test_broker_priority_left_to_right() {
        let broker = InMemoryBroker::new();
        let low = Uuid::new_v4();
        let high = Uuid::new_v4();
        broker.push("low", low).await.unwrap();
        broker.push("high", high).await.unwrap();

        let queues = vec!["high".to_string(), "low".to_string()];
        let (queue, id) = broker.blocking_pop(&queues).await.unwrap();
        assert_eq!(queue, "high");
        assert_eq!(id, high);
    }

    #[tokio::test]
    async fn test_blocking_pop_wakes_on_push() {
        let broker = Arc::new(InMemoryBroker::new());
        let id = Uuid::new_v4();

        let popper = broker.clone();
        let handle = tokio::spawn(async move {
            popper.blocking_pop(&["q".to_string()]).await.unwrap()
        });

        tokio::task::yield_now().await;
        broker.push("q", id).await.unwrap();

        let (queue, popped) = handle.await.unwrap();
        assert_eq!(queue, "q");
        assert_eq!(popped, id);
    }

    #[tokio::test]
    async fn test_batch_pop_stops_at_empty() {
        let broker = InMemoryBroker::new();
        for _ in 0..2 {
            broker.push("q", Uuid::new_v4()).await.unwrap();
        }

        let popped = broker.batch_pop("q", 5).await.unwrap();
        assert_eq!(popped.len(), 2);
        assert!(broker.batch_pop("q", 5).await.unwrap().is_empty());
        assert!(broker.batch_pop("missing", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_started_rejects_non_queued() {
        let state = InMemoryState::new();
        let mut doc = JobDocument::new("Add", json!({}), "default");
        doc.status = JobStatus::Success;
        state.insert_job(&doc).await.unwrap();

        let claimed = state
            .mark_started(doc.id, Uuid::new_v4(), Utc::now())
            .await
            .unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn test_add_task() {
        let out = Add.run(json!({"a": 2, "b": 3})).await.unwrap();
        assert_eq!(out, json!(5));
    }

    #[tokio::test]
    async fn test_return_params_round_trip() {
        let params = json!({"nested": {"k": [1, 2, 3]}});
        let out = ReturnParams.run(params.clone()).await.unwrap();
        assert_eq!(out, params);
    }

    #[tokio::test]
    async fn test_retry_task_requests_retry() {
        let err = Retry
            .run(json!({"queue": "other", "countdown": 10}))
            .await
            .unwrap_err();
        let retry = err.retry.expect("retry request");
        assert_eq!(retry.queue.as_deref(), Some("other"));
        assert_eq!(retry.countdown, Some(Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_raise_exception_carries_message_and_tag() {
        let err = RaiseException
            .run(json!({"message": "boom", "tag": "transient"}))
            .await
            .unwrap_err();
        assert_eq!(err.message, "boom");
        assert_eq!(err.tag, crate::error::ErrorTag::TRANSIENT);
    }

    #[test]
    fn test_registry_has_builtin_tasks() {
        let registry = test_registry();
        for path in ["Add", "ReturnParams", "Retry", "RaiseException"] {
            assert!(registry.has(path), "missing {path}");
        }
    }
}
