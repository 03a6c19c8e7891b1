//! Error types for the worker runtime.
//!
//! Two layers:
//! - [`WorkerError`] — pattern-matchable runtime failures (stale queue
//!   entries, pool exhaustion, unknown task paths, backend errors).
//! - [`TaskError`] — what a task body returns on failure. It carries an
//!   [`ErrorTag`] classifier that retry policies match against, plus an
//!   optional explicit [`RetryRequest`].
//!
//! `anyhow::Error` is internal transport for backend plumbing; it never
//! reaches a persisted job document. What lands in a document is the
//! rendered trace string of a classified failure.

use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Runtime errors surfaced by the worker core.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// A popped queue id has no payload in the state store.
    ///
    /// Stale entries are expected after producer crashes; the loop
    /// counts and skips them.
    #[error("job {0} has no stored payload")]
    NotFound(Uuid),

    /// `spawn` was called with no free slot.
    ///
    /// The dispatch loop never does this; seeing it means slot
    /// accounting is broken.
    #[error("no free slot in the pool")]
    PoolFull,

    /// No task is registered for the job's path.
    #[error("no task registered for path {path:?}")]
    UnknownTask {
        /// The unresolvable task path.
        path: String,
    },

    /// A backend call failed (queue, state store, or log store).
    #[error("backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Classifier tag identifying a failure category.
///
/// Tags are opaque labels, not an exception hierarchy: a task spec
/// declares the set of tags it retries on, and a failing task labels
/// its error with one. Matching is exact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorTag(Cow<'static, str>);

impl ErrorTag {
    /// A transient failure (network blip, upstream hiccup).
    pub const TRANSIENT: ErrorTag = ErrorTag(Cow::Borrowed("transient"));

    /// A permanent failure caused by the job's own input.
    pub const INVALID: ErrorTag = ErrorTag(Cow::Borrowed("invalid"));

    /// The catch-all tag for unclassified failures.
    pub const UNHANDLED: ErrorTag = ErrorTag(Cow::Borrowed("unhandled"));

    /// Create a tag from a static label.
    pub const fn from_static(label: &'static str) -> Self {
        ErrorTag(Cow::Borrowed(label))
    }

    /// Create a tag from an owned label.
    pub fn new(label: impl Into<String>) -> Self {
        ErrorTag(Cow::Owned(label.into()))
    }

    /// The tag label.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ErrorTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An explicit retry requested by a task body.
///
/// Honored even when the error's tag is not in the task's retry set:
/// the task asked, so the executor re-enqueues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryRequest {
    /// Re-enqueue on this queue instead of the original one.
    pub queue: Option<String>,

    /// Delay the re-enqueue by this long.
    pub countdown: Option<Duration>,
}

/// Failure returned by a task body.
#[derive(Debug, Error)]
#[error("[{tag}] {message}")]
pub struct TaskError {
    /// Classifier tag for retry matching.
    pub tag: ErrorTag,

    /// Human-readable failure description. Persisted as the job's
    /// traceback.
    pub message: String,

    /// Explicit retry request, if the task asked for one.
    pub retry: Option<RetryRequest>,
}

impl TaskError {
    /// A failure with an explicit classifier tag.
    pub fn tagged(tag: ErrorTag, message: impl Into<String>) -> Self {
        Self {
            tag,
            message: message.into(),
            retry: None,
        }
    }

    /// An unclassified failure.
    pub fn unhandled(message: impl Into<String>) -> Self {
        Self::tagged(ErrorTag::UNHANDLED, message)
    }

    /// Request a retry of the current job, optionally on another queue
    /// and/or after a countdown.
    ///
    /// The failure still propagates out of the task body; the executor
    /// observes the request and persists `retry` instead of `failed`.
    pub fn with_retry(mut self, queue: Option<String>, countdown: Option<Duration>) -> Self {
        self.retry = Some(RetryRequest { queue, countdown });
        self
    }

    /// Render the trace string persisted on the job document.
    pub fn traceback(&self) -> String {
        format!("TaskError[{}]: {}", self.tag, self.message)
    }
}
