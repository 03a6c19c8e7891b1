//! Scheduler: materializes time-based job definitions into the queue.
//!
//! The scheduler owns a local snapshot of the scheduled-job
//! definitions, loaded once at startup by [`Scheduler::sync_tasks`].
//! Each scan enqueues at most one job per due definition and advances
//! its `last_enqueued` stamp to the scan time, so missed intervals
//! never accumulate into a burst.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::job::Job;
use crate::store::Backends;

/// A scheduled-job definition from the state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    /// Definition id (the `last_enqueued` update key).
    pub id: Uuid,

    /// Task path to enqueue.
    pub path: String,

    /// Params for each materialized job.
    pub params: serde_json::Value,

    /// Queue to enqueue on.
    pub queue: String,

    /// Interval between enqueues.
    pub interval: Duration,

    /// When a job was last materialized from this definition.
    pub last_enqueued: Option<DateTime<Utc>>,
}

impl ScheduledJob {
    /// Whether this definition is due at `now`.
    ///
    /// A definition that has never enqueued is immediately due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_enqueued {
            None => true,
            Some(last) => now
                .signed_duration_since(last)
                .to_std()
                .map(|elapsed| elapsed >= self.interval)
                .unwrap_or(false),
        }
    }
}

/// Periodic scheduler over a local definition snapshot.
pub struct Scheduler {
    backends: Backends,
    definitions: Vec<ScheduledJob>,
}

impl Scheduler {
    /// Create a scheduler with an empty snapshot.
    pub fn new(backends: Backends) -> Self {
        Self {
            backends,
            definitions: Vec::new(),
        }
    }

    /// Number of definitions in the local snapshot.
    pub fn task_count(&self) -> usize {
        self.definitions.len()
    }

    /// Refresh the local snapshot from the state store.
    ///
    /// Returns the number of definitions loaded.
    pub async fn sync_tasks(&mut self) -> Result<usize> {
        self.definitions = self.backends.state.scheduled_jobs().await?;
        debug!(count = self.definitions.len(), "scheduler synced definitions");
        Ok(self.definitions.len())
    }

    /// Scan the snapshot and enqueue every due definition once.
    ///
    /// Returns the number of jobs enqueued.
    pub async fn check(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let mut enqueued = 0;
        for definition in &mut self.definitions {
            if !definition.is_due(now) {
                continue;
            }

            let job_id = Job::enqueue(
                &self.backends,
                definition.path.clone(),
                definition.params.clone(),
                &definition.queue,
            )
            .await?;
            self.backends.state.record_enqueued(definition.id, now).await?;
            definition.last_enqueued = Some(now);
            enqueued += 1;

            debug!(
                definition = %definition.id,
                job_id = %job_id,
                path = %definition.path,
                queue = %definition.queue,
                "scheduled job enqueued"
            );
        }
        Ok(enqueued)
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("definitions", &self.definitions.len())
            .finish()
    }
}
