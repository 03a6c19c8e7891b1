//! The worker runtime: dispatch loop, job executor, background loops,
//! and the shutdown finalizer.
//!
//! # Architecture
//!
//! ```text
//! Worker::run()
//!     │
//!     ├─► monitoring loop ──► heartbeat upsert + log flush (periodic)
//!     ├─► scheduler loop ───► enqueue due definitions (periodic)
//!     │
//!     └─► dispatch loop
//!             ├─► wait for a free slot (10 ms tick)
//!             ├─► blocking_pop(queues)          first job
//!             ├─► batch_pop(queue, free − 1)    fill the pool
//!             ├─► fetch_and_start each id       stale ids skipped
//!             └─► pool.spawn(perform_job)       done_jobs += 1
//! ```
//!
//! `perform_job` is the first thing that runs inside a slot: it binds
//! the job to the slot, arms the timeout, runs the task body, and
//! classifies the outcome into exactly one persisted status. Job-scoped
//! failures never escape the slot.
//!
//! Shutdown: the stop token breaks the dispatch loop; the finalizer
//! always runs — drain (or reap) the pool, stop the background loops,
//! write one durable heartbeat and one durable log flush.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::{TaskError, WorkerError};
use crate::job::{should_retry, Job, JobStatus};
use crate::logger::LogHandler;
use crate::monitor::{ProcessMonitor, TaskTimings, WorkerReport, WorkerStatus};
use crate::pool::{SlotContext, SlotPool};
use crate::queue::QueueAdapter;
use crate::registry::TaskRegistry;
use crate::scheduler::Scheduler;
use crate::shutdown::ShutdownController;
use crate::store::{Backends, Durability, LogStore, StateStore};

struct WorkerInner {
    id: Uuid,
    name: String,
    config: WorkerConfig,
    queues: Vec<String>,
    backends: Backends,
    registry: Arc<TaskRegistry>,
    pool: SlotPool,
    status: Mutex<WorkerStatus>,
    done_jobs: AtomicU64,
    stale_jobs: AtomicU64,
    started_at: DateTime<Utc>,
    process: Mutex<ProcessMonitor>,
    timings: Option<TaskTimings>,
    shutdown: ShutdownController,
    connected: AtomicBool,
}

/// A worker instance. Cheap to clone; every clone shares the same
/// state, pool, and backends.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    /// Create a worker over the given backends and task registry.
    pub fn new(
        config: WorkerConfig,
        queue: Arc<dyn QueueAdapter>,
        state: Arc<dyn StateStore>,
        log_store: Arc<dyn LogStore>,
        registry: TaskRegistry,
    ) -> Self {
        let id = Uuid::new_v4();
        let process = ProcessMonitor::new();
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| format!("{}.{}", ProcessMonitor::short_hostname(), process.pid()));

        let queues: Vec<String> = config
            .queues
            .iter()
            .filter(|q| !q.is_empty())
            .cloned()
            .collect();

        let logs = Arc::new(LogHandler::new(id, log_store, config.quiet));
        let backends = Backends {
            queue,
            state,
            logs,
        };

        let pool = SlotPool::new(config.pool_size);
        let timings = config.profile.then(TaskTimings::new);

        Self {
            inner: Arc::new(WorkerInner {
                id,
                name,
                config,
                queues,
                backends,
                registry: Arc::new(registry),
                pool,
                status: Mutex::new(WorkerStatus::Init),
                done_jobs: AtomicU64::new(0),
                stale_jobs: AtomicU64::new(0),
                started_at: Utc::now(),
                process: Mutex::new(process),
                timings,
                shutdown: ShutdownController::new(),
                connected: AtomicBool::new(false),
            }),
        }
    }

    /// Worker id (the heartbeat upsert key).
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Worker name (`host.pid` unless overridden).
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current worker status.
    pub fn status(&self) -> WorkerStatus {
        *self.inner.status.lock().expect("status poisoned")
    }

    /// Jobs dispatched so far.
    pub fn done_jobs(&self) -> u64 {
        self.inner.done_jobs.load(Ordering::SeqCst)
    }

    /// Stale queue ids skipped so far.
    pub fn stale_jobs(&self) -> u64 {
        self.inner.stale_jobs.load(Ordering::SeqCst)
    }

    /// The shutdown controller, for wiring signals or driving shutdown
    /// programmatically.
    pub fn shutdown(&self) -> ShutdownController {
        self.inner.shutdown.clone()
    }

    /// The shared connection set, for producing jobs in tests or
    /// embedding scenarios.
    pub fn backends(&self) -> Backends {
        self.inner.backends.clone()
    }

    /// Snapshot the live slots without sampling process metrics.
    pub fn slots(&self) -> Vec<crate::pool::SlotSnapshot> {
        self.inner.pool.iter()
    }

    fn set_status(&self, status: WorkerStatus) {
        *self.inner.status.lock().expect("status poisoned") = status;
    }

    /// Verify backend reachability. Idempotent; `force` re-verifies.
    pub async fn connect(&self, force: bool) -> Result<(), WorkerError> {
        if self.inner.connected.load(Ordering::SeqCst) && !force {
            return Ok(());
        }
        self.inner.backends.state.ping().await?;
        self.inner.backends.queue.ping().await?;
        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Run the worker until `max_jobs` is reached or shutdown is
    /// requested.
    ///
    /// Returns `Ok(())` on a clean exit (the caller maps it to exit
    /// code 0) and an error when the backends are unreachable at
    /// startup. The finalizer runs on every exit path.
    pub async fn run(&self) -> Result<(), WorkerError> {
        self.connect(false).await?;

        #[cfg(unix)]
        self.inner
            .shutdown
            .install_signal_handlers()
            .map_err(|e| WorkerError::Backend(anyhow::Error::new(e)))?;

        self.set_status(WorkerStatus::Started);
        info!(
            worker = %self.inner.name,
            queues = ?self.inner.queues,
            pool_size = self.inner.pool.size(),
            "worker starting"
        );

        let background = CancellationToken::new();
        let mut loops: Vec<JoinHandle<()>> = Vec::new();

        let monitor = self.clone();
        let monitor_token = background.child_token();
        loops.push(tokio::spawn(async move {
            monitor.monitoring_loop(monitor_token).await;
        }));

        if self.inner.config.scheduler {
            let scheduler = self.clone();
            let scheduler_token = background.child_token();
            loops.push(tokio::spawn(async move {
                scheduler.scheduler_loop(scheduler_token).await;
            }));
        }

        // Forced shutdown delivers the interrupt to every live slot as
        // soon as it is requested, even while the dispatch loop is
        // blocked on a pop.
        let killer = self.clone();
        let kill_watch = tokio::spawn(async move {
            let kill = killer.inner.shutdown.kill_token();
            kill.cancelled().await;
            killer.set_status(WorkerStatus::Killing);
            killer.inner.pool.kill(false).await;
        });

        let outcome = self.dispatch_loop().await;

        if self.inner.shutdown.is_forced() {
            let _ = kill_watch.await;
        } else {
            kill_watch.abort();
        }

        self.finalize(background, loops).await;

        info!(worker = %self.inner.name, done_jobs = self.done_jobs(), "worker stopped");
        outcome
    }

    async fn dispatch_loop(&self) -> Result<(), WorkerError> {
        let stop = self.inner.shutdown.stop_token();

        loop {
            // Backpressure: wait for a free slot with a 10 ms tick.
            loop {
                if stop.is_cancelled() {
                    return Ok(());
                }
                if self.inner.pool.free_count() > 0 {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                    _ = stop.cancelled() => return Ok(()),
                }
            }

            let free = self.inner.pool.free_count();
            debug!(free, queues = ?self.inner.queues, "listening");

            let popped = tokio::select! {
                result = self.inner.backends.queue.blocking_pop(&self.inner.queues) => result,
                _ = stop.cancelled() => return Ok(()),
            };

            let (queue, first) = match popped {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "queue pop failed");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        _ = stop.cancelled() => return Ok(()),
                    }
                    continue;
                }
            };

            // One queue yielded a job, so it likely has more: fill the
            // remaining slots from it in one batched round-trip.
            let mut ids = vec![first];
            if free > 1 {
                match self.inner.backends.queue.batch_pop(&queue, free - 1).await {
                    Ok(more) => ids.extend(more),
                    Err(e) => warn!(error = %e, queue = %queue, "batch pop failed"),
                }
            }

            for id in ids {
                let job =
                    match Job::fetch_and_start(&self.inner.backends, id, self.inner.id, &queue)
                        .await
                    {
                        Ok(job) => job,
                        Err(WorkerError::NotFound(stale)) => {
                            self.inner.stale_jobs.fetch_add(1, Ordering::SeqCst);
                            self.inner
                                .backends
                                .logs
                                .warning(Some(stale), "skipping stale queue entry");
                            continue;
                        }
                        Err(e) => {
                            error!(job_id = %id, error = %e, "failed to claim job");
                            continue;
                        }
                    };

                let worker = self.clone();
                self.inner
                    .pool
                    .spawn(move |ctx| async move { worker.perform_job(ctx, job).await })?;
                self.inner.done_jobs.fetch_add(1, Ordering::SeqCst);
            }

            let done = self.done_jobs();
            if self.inner.config.max_jobs > 0 && done >= self.inner.config.max_jobs {
                info!(done_jobs = done, "max jobs reached");
                return Ok(());
            }
        }
    }

    /// Execute one job inside a slot.
    ///
    /// The caller has already transitioned the job to `started`. Every
    /// exit path persists exactly one status and clears the slot
    /// binding; the status write happens outside the cancellable
    /// region, so an interrupt arriving during persistence cannot lose
    /// the write.
    async fn perform_job(&self, ctx: SlotContext, mut job: Job) {
        enum Outcome {
            Finished(Result<serde_json::Value, TaskError>),
            TimedOut,
            Interrupted,
        }

        let backends = &self.inner.backends;
        ctx.bind_job(job.id, &job.doc.path);
        backends
            .logs
            .info(Some(job.id), format!("job started: {}", job.doc.path));

        let spec = match self.inner.registry.resolve(&job.doc.path) {
            Some(spec) => spec.clone(),
            None => {
                let err = WorkerError::UnknownTask {
                    path: job.doc.path.clone(),
                };
                backends.logs.error(Some(job.id), err.to_string());
                if let Err(e) = job
                    .save_status(backends, JobStatus::Failed, None, Some(err.to_string()))
                    .await
                {
                    error!(job_id = %job.id, error = %e, "failed to persist job status");
                }
                ctx.clear_job();
                return;
            }
        };

        let timeout = spec.timeout.unwrap_or(self.inner.config.default_job_timeout);
        let cancel = ctx.cancellation();
        let started = tokio::time::Instant::now();

        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, spec.task.run(job.doc.params.clone())) => {
                match result {
                    Ok(finished) => Outcome::Finished(finished),
                    Err(_) => Outcome::TimedOut,
                }
            }
            _ = cancel.cancelled() => Outcome::Interrupted,
        };

        if let Some(timings) = &self.inner.timings {
            timings.record(&job.doc.path, started.elapsed());
        }

        ctx.set_stage("persisting");

        let persisted = match outcome {
            Outcome::Finished(Ok(result)) => {
                backends.logs.record_with(
                    crate::logger::LogLevel::Info,
                    Some(job.id),
                    "job succeeded",
                    Some(result.clone()),
                );
                job.save_status(backends, JobStatus::Success, Some(result), None)
                    .await
            }
            Outcome::Finished(Err(failure)) => {
                let traceback = failure.traceback();
                if should_retry(&failure.tag, failure.retry.as_ref(), &spec.retry_tags) {
                    backends
                        .logs
                        .warning(Some(job.id), format!("job retrying: {traceback}"));
                    job.save_retry(backends, traceback, failure.retry.as_ref())
                        .await
                        .map(|_| ())
                } else {
                    backends
                        .logs
                        .error(Some(job.id), format!("job failed: {traceback}"));
                    job.save_status(backends, JobStatus::Failed, None, Some(traceback))
                        .await
                }
            }
            Outcome::TimedOut => {
                let traceback =
                    format!("job exceeded its timeout of {} seconds", timeout.as_secs());
                backends.logs.error(Some(job.id), traceback.clone());
                job.save_status(backends, JobStatus::Timeout, None, Some(traceback))
                    .await
            }
            Outcome::Interrupted => {
                let traceback = "job interrupted by worker shutdown".to_string();
                backends.logs.warning(Some(job.id), traceback.clone());
                job.save_status(backends, JobStatus::Interrupt, None, Some(traceback))
                    .await
            }
        };

        if let Err(e) = persisted {
            error!(job_id = %job.id, error = %e, "failed to persist job status");
        }

        ctx.clear_job();
    }

    /// Compose the current heartbeat document.
    pub fn snapshot(&self) -> WorkerReport {
        let process = self
            .inner
            .process
            .lock()
            .expect("process monitor poisoned")
            .stats();

        WorkerReport {
            id: self.inner.id,
            name: self.inner.name.clone(),
            status: self.status(),
            config: self.inner.config.whitelisted(),
            done_jobs: self.done_jobs(),
            stale_jobs: self.stale_jobs(),
            started_at: self.inner.started_at,
            reported_at: Utc::now(),
            process,
            slots: self.inner.pool.iter(),
        }
    }

    async fn report(&self, durability: Durability) -> Result<(), WorkerError> {
        let report = self.snapshot();
        self.inner
            .backends
            .state
            .upsert_worker(&report, durability)
            .await?;
        Ok(())
    }

    /// Heartbeat loop. An error on one tick is logged; the loop keeps
    /// going.
    async fn monitoring_loop(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.inner.config.report_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.report(Durability::BestEffort).await {
                        warn!(error = %e, "heartbeat report failed");
                    }
                    if let Err(e) = self.inner.backends.logs.flush(Durability::BestEffort).await {
                        warn!(error = %e, "log flush failed");
                    }
                }
            }
        }
    }

    /// Scheduler loop. Definitions are synced once at startup; a
    /// failed sync retries on the next tick before scanning.
    async fn scheduler_loop(&self, token: CancellationToken) {
        let mut scheduler = Scheduler::new(self.inner.backends.clone());
        let mut synced = match scheduler.sync_tasks().await {
            Ok(count) => {
                info!(definitions = count, "scheduler started");
                true
            }
            Err(e) => {
                error!(error = %e, "scheduler sync failed");
                false
            }
        };

        let mut interval = tokio::time::interval(self.inner.config.scheduler_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    if !synced {
                        synced = scheduler.sync_tasks().await.is_ok();
                        if !synced {
                            continue;
                        }
                    }
                    if let Err(e) = scheduler.check(Utc::now()).await {
                        error!(error = %e, "scheduler scan failed");
                    }
                }
            }
        }
    }

    /// Shutdown finalizer; runs on every exit path.
    async fn finalize(&self, background: CancellationToken, loops: Vec<JoinHandle<()>>) {
        self.set_status(WorkerStatus::Stopping);
        debug!("draining the pool");

        let kill = self.inner.shutdown.kill_token();
        tokio::select! {
            _ = self.inner.pool.join(None) => {}
            _ = kill.cancelled() => {}
        }

        // Reap stragglers; a no-op when the drain was clean.
        self.inner.pool.kill(true).await;

        background.cancel();
        futures::future::join_all(loops).await;

        if let Err(e) = self.report(Durability::Durable).await {
            error!(error = %e, "final heartbeat failed");
        }
        if let Err(e) = self.inner.backends.logs.flush(Durability::Durable).await {
            error!(error = %e, "final log flush failed");
        }

        if let Some(timings) = &self.inner.timings {
            for (path, calls, total) in timings.dump() {
                info!(
                    path = %path,
                    calls,
                    cumulative_ms = total.as_millis() as u64,
                    "task timing"
                );
            }
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .field("done_jobs", &self.done_jobs())
            .finish()
    }
}
