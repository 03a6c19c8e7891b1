//! Bounded slot pool.
//!
//! A [`SlotPool`] multiplexes at most `size` concurrently-running jobs
//! over tokio tasks. Each slot carries a [`CancellationToken`] — the
//! interrupt carrier for forced shutdown — and a job binding the
//! executor maintains so the monitoring loop can answer "what is this
//! slot doing right now".
//!
//! # Accounting Invariants
//!
//! - `spawn` refuses when no slot is free; the dispatch loop checks
//!   `free_count()` first, so [`WorkerError::PoolFull`] indicates a
//!   broken caller.
//! - The slot table is mutated in exactly two places: `spawn` (insert,
//!   dispatch loop only) and slot exit (remove, by the slot itself).
//! - At most one job is bound to a slot at any instant.
//!
//! Cancellation is cooperative: `kill` cancels every live slot's token,
//! and the executor observes it at its next suspension point. A slot
//! persisting a final status completes that write before exiting.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::WorkerError;

/// Identifier of a pool slot, unique within the worker process.
pub type SlotId = u64;

/// Point-in-time view of one live slot, as reported in heartbeats.
#[derive(Debug, Clone, Serialize)]
pub struct SlotSnapshot {
    /// The slot.
    pub slot: SlotId,

    /// When the slot was claimed.
    pub spawned_at: DateTime<Utc>,

    /// Short stage label maintained at executor checkpoints — the
    /// introspection a call stack would give on a runtime that had one.
    pub stage: String,

    /// Bound job id, if a job is currently executing here.
    pub job_id: Option<Uuid>,

    /// Bound job's task path.
    pub job_path: Option<String>,

    /// When the bound job started in this slot.
    pub job_started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Binding {
    stage: String,
    job_id: Option<Uuid>,
    job_path: Option<String>,
    job_started_at: Option<DateTime<Utc>>,
}

struct Slot {
    cancel: CancellationToken,
    spawned_at: DateTime<Utc>,
    binding: Mutex<Binding>,
}

/// Handle the executor uses to maintain its slot's state.
#[derive(Clone)]
pub struct SlotContext {
    id: SlotId,
    slot: Arc<Slot>,
}

impl SlotContext {
    /// This slot's id.
    pub fn id(&self) -> SlotId {
        self.id
    }

    /// Bind a job to the slot (executor prologue).
    pub fn bind_job(&self, job_id: Uuid, path: &str) {
        let mut binding = self.slot.binding.lock().expect("slot binding poisoned");
        binding.job_id = Some(job_id);
        binding.job_path = Some(path.to_string());
        binding.job_started_at = Some(Utc::now());
        binding.stage = "running".to_string();
    }

    /// Update the stage label.
    pub fn set_stage(&self, stage: &str) {
        let mut binding = self.slot.binding.lock().expect("slot binding poisoned");
        binding.stage = stage.to_string();
    }

    /// Clear the job binding (executor epilogue, runs on every exit
    /// path).
    pub fn clear_job(&self) {
        let mut binding = self.slot.binding.lock().expect("slot binding poisoned");
        binding.job_id = None;
        binding.job_path = None;
        binding.job_started_at = None;
        binding.stage = "idle".to_string();
    }

    /// The slot's cancellation token. Cancelled by `kill`.
    pub fn cancellation(&self) -> CancellationToken {
        self.slot.cancel.clone()
    }
}

/// Bounded pool of execution slots over tokio tasks.
pub struct SlotPool {
    size: usize,
    next_id: AtomicU64,
    slots: Arc<DashMap<SlotId, Arc<Slot>>>,
    drained: Arc<Notify>,
}

impl SlotPool {
    /// Create a pool with `size` slots.
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            next_id: AtomicU64::new(0),
            slots: Arc::new(DashMap::new()),
            drained: Arc::new(Notify::new()),
        }
    }

    /// Configured slot count.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of free slots right now.
    pub fn free_count(&self) -> usize {
        self.size.saturating_sub(self.slots.len())
    }

    /// Number of live slots right now.
    pub fn live_count(&self) -> usize {
        self.slots.len()
    }

    /// Claim a slot and schedule the job future on it.
    ///
    /// The closure receives the slot's [`SlotContext`] and returns the
    /// future to run. Returns immediately; the slot frees itself when
    /// the future completes.
    pub fn spawn<F, Fut>(&self, f: F) -> Result<SlotId, WorkerError>
    where
        F: FnOnce(SlotContext) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.slots.len() >= self.size {
            return Err(WorkerError::PoolFull);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Slot {
            cancel: CancellationToken::new(),
            spawned_at: Utc::now(),
            binding: Mutex::new(Binding {
                stage: "spawned".to_string(),
                ..Default::default()
            }),
        });
        self.slots.insert(id, slot.clone());

        let fut = f(SlotContext { id, slot });
        let slots = self.slots.clone();
        let drained = self.drained.clone();
        tokio::spawn(async move {
            fut.await;
            slots.remove(&id);
            drained.notify_waiters();
        });

        Ok(id)
    }

    /// Block until every slot has drained, or the timeout elapses.
    ///
    /// Returns `true` when the pool is empty on return.
    pub async fn join(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // Register before checking so a slot exiting in between is
            // never missed.
            notified.as_mut().enable();

            if self.slots.is_empty() {
                return true;
            }
            match deadline {
                Some(at) => {
                    if tokio::time::timeout_at(at, notified).await.is_err() {
                        return self.slots.is_empty();
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Cancel every live slot's token. With `block`, wait for all
    /// slots to observe the cancellation and exit.
    ///
    /// A no-op when the pool is already clean.
    pub async fn kill(&self, block: bool) {
        for entry in self.slots.iter() {
            entry.value().cancel.cancel();
        }
        if block {
            self.join(None).await;
        }
    }

    /// Snapshot every live slot for introspection.
    pub fn iter(&self) -> Vec<SlotSnapshot> {
        let mut snapshots: Vec<SlotSnapshot> = self
            .slots
            .iter()
            .map(|entry| {
                let slot = entry.value();
                let binding = slot.binding.lock().expect("slot binding poisoned");
                SlotSnapshot {
                    slot: *entry.key(),
                    spawned_at: slot.spawned_at,
                    stage: binding.stage.clone(),
                    job_id: binding.job_id,
                    job_path: binding.job_path.clone(),
                    job_started_at: binding.job_started_at,
                }
            })
            .collect();
        snapshots.sort_by_key(|s| s.slot);
        snapshots
    }

    /// Reverse lookup: the job currently bound to a slot.
    pub fn current_job(&self, slot: SlotId) -> Option<Uuid> {
        self.slots
            .get(&slot)
            .and_then(|s| s.binding.lock().expect("slot binding poisoned").job_id)
    }
}

impl std::fmt::Debug for SlotPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPool")
            .field("size", &self.size)
            .field("live", &self.slots.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_spawn_fills_slots_and_refuses_when_full() {
        let pool = SlotPool::new(2);
        assert_eq!(pool.free_count(), 2);

        let gate = Arc::new(Notify::new());
        for _ in 0..2 {
            let gate = gate.clone();
            pool.spawn(move |_ctx| async move {
                gate.notified().await;
            })
            .unwrap();
        }
        assert_eq!(pool.free_count(), 0);

        let err = pool.spawn(|_ctx| async {}).unwrap_err();
        assert!(matches!(err, WorkerError::PoolFull));

        // Let both slot futures register on the gate before waking them.
        tokio::task::yield_now().await;
        gate.notify_waiters();
        assert!(pool.join(Some(Duration::from_secs(1))).await);
        assert_eq!(pool.free_count(), 2);
    }

    #[tokio::test]
    async fn test_join_waits_for_completion() {
        let pool = SlotPool::new(1);
        let done = Arc::new(AtomicUsize::new(0));

        let counter = done.clone();
        pool.spawn(move |_ctx| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        assert!(pool.join(None).await);
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_kill_cancels_live_slots() {
        let pool = SlotPool::new(2);
        let interrupted = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let interrupted = interrupted.clone();
            pool.spawn(move |ctx| async move {
                let cancel = ctx.cancellation();
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(60)) => {}
                    _ = cancel.cancelled() => {
                        interrupted.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
            .unwrap();
        }

        pool.kill(true).await;
        assert_eq!(interrupted.load(Ordering::SeqCst), 2);
        assert_eq!(pool.free_count(), 2);
    }

    #[tokio::test]
    async fn test_kill_on_empty_pool_is_noop() {
        let pool = SlotPool::new(1);
        pool.kill(true).await;
        assert_eq!(pool.free_count(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_reflects_binding() {
        let pool = SlotPool::new(1);
        let job_id = Uuid::new_v4();
        let gate = Arc::new(Notify::new());

        let slot_gate = gate.clone();
        pool.spawn(move |ctx| async move {
            ctx.bind_job(job_id, "Add");
            slot_gate.notified().await;
            ctx.clear_job();
        })
        .unwrap();
        tokio::task::yield_now().await;

        let snapshots = pool.iter();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].job_id, Some(job_id));
        assert_eq!(snapshots[0].job_path.as_deref(), Some("Add"));
        assert_eq!(snapshots[0].stage, "running");
        assert_eq!(pool.current_job(snapshots[0].slot), Some(job_id));

        gate.notify_waiters();
        pool.join(None).await;
        assert!(pool.iter().is_empty());
    }

    #[tokio::test]
    async fn test_zero_size_pool_clamps_to_one() {
        let pool = SlotPool::new(0);
        assert_eq!(pool.size(), 1);
    }
}
