//! Queue backend contract.
//!
//! The worker core never talks to a concrete queue technology. It talks
//! to [`QueueAdapter`], which any durable list store with a blocking
//! multi-key pop can implement.
//!
//! # Delivery Contract
//!
//! - Pops are destructive: an id returned by a pop is no longer visible
//!   to any other worker. There is no acknowledgement protocol.
//! - Between a pop and the job's first state write the id exists only in
//!   worker memory. A crash in that window loses the job (at-most-once
//!   in that window; the system as a whole is at-least-once only for
//!   jobs that reached `started`).
//! - Within a single queue, FIFO order is preserved.
//! - Across queues, [`QueueAdapter::blocking_pop`] scans left to right,
//!   so earlier queue names have priority.
//!
//! # Implementer Notes
//!
//! - Transient backend errors should be retried with backoff inside the
//!   adapter and surfaced only after repeated failure. The dispatch loop
//!   treats a surfaced error as transient anyway: it logs, sleeps, and
//!   retries.
//! - `push_delayed` backs the retry countdown path. A sorted-set with a
//!   due timestamp is the usual shape.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Access to the durable job-id queues.
#[async_trait]
pub trait QueueAdapter: Send + Sync {
    /// Verify the backend is reachable. Called once at worker startup;
    /// a failure there is fatal.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// Pop one id from the first non-empty queue, waiting indefinitely.
    ///
    /// Returns the queue the id came from. Queue names are scanned left
    /// to right on each wakeup.
    async fn blocking_pop(&self, queues: &[String]) -> Result<(String, Uuid)>;

    /// Pop up to `n` ids from one queue without blocking.
    ///
    /// Returns fewer than `n` ids when the queue drains; never waits.
    async fn batch_pop(&self, queue: &str, n: usize) -> Result<Vec<Uuid>>;

    /// Append an id to the tail of a queue.
    async fn push(&self, queue: &str, id: Uuid) -> Result<()>;

    /// Append an id to the tail of a queue after `delay` has elapsed.
    ///
    /// Used by the retry countdown path. The id must not be poppable
    /// before the delay expires.
    async fn push_delayed(&self, queue: &str, id: Uuid, delay: Duration) -> Result<()>;
}
