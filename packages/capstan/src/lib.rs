//! # Capstan
//!
//! A queue-driven job worker runtime: pull task descriptors from
//! durable shared queues, execute them inside a bounded pool with
//! per-job timeouts, persist every lifecycle transition, heartbeat
//! liveness, materialize scheduled jobs, and shut down in two stages
//! on operator signals.
//!
//! ## Architecture
//!
//! ```text
//! Producer ──► queue backend (named FIFO queues of job ids)
//!                  │
//!                  ▼ blocking_pop / batch_pop
//!            Worker dispatch loop
//!                  │ fetch_and_start (queued → started)
//!                  ▼
//!             SlotPool (bounded)
//!                  │ perform_job: timeout + interrupt + classify
//!                  ▼
//!            state backend (job documents, heartbeats, schedules)
//!
//!  monitoring loop ──► heartbeat upsert + log flush   (periodic)
//!  scheduler loop ───► enqueue due definitions        (periodic)
//!  shutdown ─────────► SIGINT graceful → forced, SIGTERM forced
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Status settles** — every dispatched job ends in exactly one of
//!    `success`, `failed`, `timeout`, `interrupt`, `retry`; never left
//!    `started` after its slot exits.
//! 2. **Started before run** — a job's `started` transition is durably
//!    persisted before its task body executes.
//! 3. **One job per slot** — at most one job is bound to a slot at any
//!    instant; the binding is the monitor's reverse lookup.
//! 4. **Spawn only when free** — the dispatch loop never spawns into a
//!    full pool.
//! 5. **Whitelist projection** — the heartbeat's config snapshot is
//!    built by enumerating allowed keys, never by excluding bad ones.
//! 6. **Persistence survives interrupts** — status writes happen
//!    outside the cancellable region; a shutdown interrupt cannot lose
//!    a retry or failure write already in flight.
//!
//! ## Delivery Model
//!
//! Pops are destructive and unacknowledged. A crash between a pop and
//! the `started` write loses that job; anything past `started` is
//! recoverable from the state store. This is the at-least-once model of
//! the backends this runtime is built for, not a bug to fix here.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use capstan::{Job, TaskRegistry, TaskSpec, Worker, WorkerConfig};
//!
//! let mut registry = TaskRegistry::new();
//! registry.register("reports.Nightly", TaskSpec::new(Arc::new(NightlyReport)));
//!
//! let worker = Worker::new(config, queue, state, logs, registry);
//! worker.run().await?;
//! ```

// Core modules
mod config;
mod error;
mod job;
mod logger;
mod monitor;
mod pool;
mod queue;
mod registry;
mod scheduler;
mod shutdown;
mod store;
mod worker;

// Testing utilities (feature-gated, also used by this crate's tests)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// End-to-end scenarios (test-only)
#[cfg(test)]
mod scenario_tests;

// Re-export configuration
pub use crate::config::WorkerConfig;

// Re-export error types
pub use crate::error::{ErrorTag, RetryRequest, TaskError, WorkerError};

// Re-export job types
pub use crate::job::{Job, JobDocument, JobStatus};

// Re-export logging types
pub use crate::logger::{LogHandler, LogLevel, LogRecord};

// Re-export monitoring types
pub use crate::monitor::{ProcessMonitor, ProcessStats, WorkerReport, WorkerStatus};

// Re-export pool types
pub use crate::pool::{SlotContext, SlotId, SlotPool, SlotSnapshot};

// Re-export backend contracts
pub use crate::queue::QueueAdapter;
pub use crate::store::{Backends, Durability, LogStore, StateStore};

// Re-export registry types
pub use crate::registry::{Task, TaskRegistry, TaskSpec};

// Re-export scheduler types
pub use crate::scheduler::{ScheduledJob, Scheduler};

// Re-export shutdown types
pub use crate::shutdown::ShutdownController;

// Re-export the worker itself
pub use crate::worker::Worker;

// Re-export commonly used external types
pub use async_trait::async_trait;
