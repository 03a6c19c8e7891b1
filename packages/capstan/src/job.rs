//! Job records and their lifecycle transitions.
//!
//! A job's persisted life is a small DAG:
//!
//! ```text
//! queued ──► started ──► success
//!    ▲                ├► failed
//!    │                ├► timeout
//!    │                ├► interrupt
//!    └──── requeue ◄──┴► retry
//! ```
//!
//! Once in a terminal non-retry state the document is never mutated by
//! the core again. `started_at` is set iff the job has ever been
//! `started`. Jobs are created by producers (or the scheduler), mutated
//! by the executing worker, and never deleted.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorTag, RetryRequest, WorkerError};
use crate::store::Backends;

/// Persisted status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Started,
    Success,
    Failed,
    Timeout,
    Interrupt,
    Retry,
}

impl JobStatus {
    /// The serialized label for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Started => "started",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Timeout => "timeout",
            JobStatus::Interrupt => "interrupt",
            JobStatus::Retry => "retry",
        }
    }

    /// Whether this status ends the job's life (retry does not: the
    /// job returns to `queued` when re-enqueued).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Timeout | JobStatus::Interrupt
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persisted job document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDocument {
    /// Opaque identifier; this is what travels through the queues.
    pub id: Uuid,

    /// Task path resolved through the registry.
    pub path: String,

    /// Task parameters, an arbitrary JSON map.
    pub params: serde_json::Value,

    /// Queue the job was (last) enqueued on.
    pub queue: String,

    /// Current lifecycle status.
    pub status: JobStatus,

    /// When the job was (last) enqueued.
    pub queued_at: DateTime<Utc>,

    /// When execution (last) began. Set iff status has ever been
    /// `started`.
    pub started_at: Option<DateTime<Utc>>,

    /// When the (last) execution attempt finished.
    pub ended_at: Option<DateTime<Utc>>,

    /// Worker currently or last responsible for the job.
    pub worker_id: Option<Uuid>,

    /// Number of retries recorded so far.
    pub retry_count: u32,

    /// Return value of a successful run.
    pub result: Option<serde_json::Value>,

    /// Rendered trace of the last failure, if any.
    pub traceback: Option<String>,
}

impl JobDocument {
    /// A fresh `queued` document for the producer path.
    pub fn new(path: impl Into<String>, params: serde_json::Value, queue: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            path: path.into(),
            params,
            queue: queue.into(),
            status: JobStatus::Queued,
            queued_at: Utc::now(),
            started_at: None,
            ended_at: None,
            worker_id: None,
            retry_count: 0,
            result: None,
            traceback: None,
        }
    }
}

/// A job claimed by this worker, in flight inside a slot.
///
/// Holds the loaded document plus the queue it was popped from. All
/// persistence goes through the shared [`Backends`].
#[derive(Debug)]
pub struct Job {
    /// The job id.
    pub id: Uuid,

    /// Queue the id was popped from.
    pub queue: String,

    /// The loaded document, kept in sync with what was persisted.
    pub doc: JobDocument,
}

impl Job {
    /// Producer path: persist a fresh `queued` document and push its id.
    ///
    /// Used by external producers in tests, by the scheduler, and by
    /// the retry path.
    pub async fn enqueue(
        backends: &Backends,
        path: impl Into<String>,
        params: serde_json::Value,
        queue: &str,
    ) -> Result<Uuid, WorkerError> {
        let doc = JobDocument::new(path, params, queue);
        let id = doc.id;
        backends.state.insert_job(&doc).await?;
        backends.queue.push(queue, id).await?;
        Ok(id)
    }

    /// Claim a popped id: atomically load the document and transition
    /// it `queued → started`, stamping `started_at` and the owner.
    ///
    /// Fails with [`WorkerError::NotFound`] when the id has no stored
    /// payload — a stale queue entry the caller skips.
    pub async fn fetch_and_start(
        backends: &Backends,
        id: Uuid,
        worker_id: Uuid,
        queue: &str,
    ) -> Result<Job, WorkerError> {
        let doc = backends
            .state
            .mark_started(id, worker_id, Utc::now())
            .await?
            .ok_or(WorkerError::NotFound(id))?;

        Ok(Job {
            id,
            queue: queue.to_string(),
            doc,
        })
    }

    /// Persist a terminal status for this job.
    pub async fn save_status(
        &mut self,
        backends: &Backends,
        status: JobStatus,
        result: Option<serde_json::Value>,
        traceback: Option<String>,
    ) -> Result<(), WorkerError> {
        let now = Utc::now();
        backends
            .state
            .save_status(self.id, status, result.clone(), traceback.clone(), now)
            .await?;

        self.doc.status = status;
        self.doc.ended_at = Some(now);
        self.doc.result = result;
        self.doc.traceback = traceback;
        Ok(())
    }

    /// Persist status `retry`, bump the retry counter, and re-enqueue.
    ///
    /// Without a countdown the document flips straight back to `queued`
    /// and the id is pushed. With a countdown the document stays in
    /// `retry` and the push lands after the delay; the next claim
    /// accepts it from there.
    ///
    /// Returns the new retry count.
    pub async fn save_retry(
        &mut self,
        backends: &Backends,
        traceback: String,
        request: Option<&RetryRequest>,
    ) -> Result<u32, WorkerError> {
        let now = Utc::now();
        let count = backends.state.save_retry(self.id, traceback, now).await?;

        let queue = request
            .and_then(|r| r.queue.as_deref())
            .unwrap_or(&self.queue)
            .to_string();
        let countdown = request.and_then(|r| r.countdown);

        match countdown {
            Some(delay) => {
                backends.queue.push_delayed(&queue, self.id, delay).await?;
            }
            None => {
                backends.state.requeue(self.id, &queue, now).await?;
                backends.queue.push(&queue, self.id).await?;
            }
        }

        self.doc.status = JobStatus::Retry;
        self.doc.retry_count = count;
        self.doc.queue = queue;
        Ok(count)
    }
}

/// Retry eligibility check used by the executor.
///
/// A failure retries when the task explicitly asked, or when its tag is
/// in the task's declared retry set.
pub fn should_retry(
    tag: &ErrorTag,
    explicit: Option<&RetryRequest>,
    retry_tags: &HashSet<ErrorTag>,
) -> bool {
    explicit.is_some() || retry_tags.contains(tag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_backends;
    use serde_json::json;

    #[test]
    fn test_status_labels() {
        assert_eq!(JobStatus::Queued.as_str(), "queued");
        assert_eq!(JobStatus::Interrupt.as_str(), "interrupt");
        assert_eq!(
            serde_json::to_value(JobStatus::Timeout).unwrap(),
            json!("timeout")
        );
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Interrupt.is_terminal());
        assert!(!JobStatus::Retry.is_terminal());
        assert!(!JobStatus::Started.is_terminal());
    }

    #[test]
    fn test_should_retry() {
        let mut tags = HashSet::new();
        tags.insert(ErrorTag::TRANSIENT);

        let explicit = RetryRequest {
            queue: None,
            countdown: None,
        };

        assert!(should_retry(&ErrorTag::TRANSIENT, None, &tags));
        assert!(should_retry(&ErrorTag::INVALID, Some(&explicit), &tags));
        assert!(!should_retry(&ErrorTag::INVALID, None, &tags));
    }

    #[tokio::test]
    async fn test_enqueue_then_fetch_and_start() {
        let (backends, state, broker) = test_backends();

        let id = Job::enqueue(&backends, "Add", json!({"a": 1}), "default")
            .await
            .unwrap();
        assert_eq!(broker.len("default"), 1);

        let worker_id = Uuid::new_v4();
        let job = Job::fetch_and_start(&backends, id, worker_id, "default")
            .await
            .unwrap();
        assert_eq!(job.doc.status, JobStatus::Started);
        assert_eq!(job.doc.worker_id, Some(worker_id));
        assert!(job.doc.started_at.is_some());

        let stored = state.job(id).unwrap();
        assert_eq!(stored.status, JobStatus::Started);
    }

    #[tokio::test]
    async fn test_fetch_and_start_stale_id() {
        let (backends, _state, _broker) = test_backends();

        let err = Job::fetch_and_start(&backends, Uuid::new_v4(), Uuid::new_v4(), "default")
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_save_status_stamps_ended_at() {
        let (backends, state, _broker) = test_backends();

        let id = Job::enqueue(&backends, "Add", json!({}), "default")
            .await
            .unwrap();
        let mut job = Job::fetch_and_start(&backends, id, Uuid::new_v4(), "default")
            .await
            .unwrap();

        job.save_status(&backends, JobStatus::Success, Some(json!(5)), None)
            .await
            .unwrap();

        let stored = state.job(id).unwrap();
        assert_eq!(stored.status, JobStatus::Success);
        assert_eq!(stored.result, Some(json!(5)));
        assert!(stored.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_save_retry_immediate_requeues_as_queued() {
        let (backends, state, broker) = test_backends();

        let id = Job::enqueue(&backends, "Add", json!({}), "default")
            .await
            .unwrap();
        broker.drain("default");
        let mut job = Job::fetch_and_start(&backends, id, Uuid::new_v4(), "default")
            .await
            .unwrap();

        let count = job
            .save_retry(&backends, "TaskError[transient]: blip".to_string(), None)
            .await
            .unwrap();
        assert_eq!(count, 1);

        // Immediate requeue flips the document back to queued.
        let stored = state.job(id).unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(broker.len("default"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_retry_countdown_stays_retry_until_due() {
        let (backends, state, broker) = test_backends();

        let id = Job::enqueue(&backends, "Retry", json!({}), "default")
            .await
            .unwrap();
        broker.drain("default");
        let mut job = Job::fetch_and_start(&backends, id, Uuid::new_v4(), "default")
            .await
            .unwrap();

        let request = RetryRequest {
            queue: Some("other".to_string()),
            countdown: Some(std::time::Duration::from_secs(10)),
        };
        job.save_retry(&backends, "TaskError[unhandled]: asked".to_string(), Some(&request))
            .await
            .unwrap();

        assert_eq!(state.job(id).unwrap().status, JobStatus::Retry);
        assert_eq!(broker.len("other"), 0);

        tokio::time::sleep(std::time::Duration::from_secs(11)).await;
        assert_eq!(broker.len("other"), 1);

        // A delayed re-enqueue is claimable straight from `retry`.
        let claimed = Job::fetch_and_start(&backends, id, Uuid::new_v4(), "other")
            .await
            .unwrap();
        assert_eq!(claimed.doc.status, JobStatus::Started);
    }
}
