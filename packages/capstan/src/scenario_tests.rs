//! End-to-end scenarios driving the full worker over in-memory
//! backends: dispatch, execution, timeouts, retries, shutdown.

#[cfg(test)]
mod scenario_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use uuid::Uuid;

    use crate::error::ErrorTag;
    use crate::job::{Job, JobStatus};
    use crate::monitor::WorkerStatus;
    use crate::queue::QueueAdapter;
    use crate::registry::{TaskRegistry, TaskSpec};
    use crate::testing::{test_registry, test_worker, Add, RaiseException};
    use crate::scheduler::ScheduledJob;
    use crate::config::WorkerConfig;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("capstan=debug")
            .with_test_writer()
            .try_init();
    }

    async fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
        for _ in 0..2000 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    fn one_shot_config() -> WorkerConfig {
        WorkerConfig {
            pool_size: 1,
            max_jobs: 1,
            quiet: true,
            ..Default::default()
        }
    }

    // ==========================================================================
    // Success / Failure / Timeout / Retry
    // ==========================================================================

    #[tokio::test]
    async fn test_addition_end_to_end() {
        init_tracing();
        let (worker, state, _broker) = test_worker(one_shot_config(), test_registry());

        let id = Job::enqueue(
            &worker.backends(),
            "Add",
            json!({"a": 2, "b": 3}),
            "default",
        )
        .await
        .unwrap();

        worker.run().await.unwrap();

        let doc = state.job(id).unwrap();
        assert_eq!(doc.status, JobStatus::Success);
        assert_eq!(doc.result, Some(json!(5)));
        assert!(doc.started_at.is_some());
        assert!(doc.ended_at.is_some());

        assert_eq!(worker.done_jobs(), 1);
        let report = state.worker_report(worker.id()).unwrap();
        assert_eq!(report.done_jobs, 1);
        assert_eq!(report.status, WorkerStatus::Stopping);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_marks_job_and_worker_continues() {
        let mut registry = TaskRegistry::new();
        registry.register(
            "Add",
            TaskSpec::new(Arc::new(Add)).with_timeout(Duration::from_secs(1)),
        );
        let (worker, state, _broker) = test_worker(one_shot_config(), registry);

        let id = Job::enqueue(
            &worker.backends(),
            "Add",
            json!({"a": 0, "b": 0, "sleep": 5}),
            "default",
        )
        .await
        .unwrap();

        worker.run().await.unwrap();

        let doc = state.job(id).unwrap();
        assert_eq!(doc.status, JobStatus::Timeout);
        assert!(doc.traceback.unwrap().contains("timeout of 1 seconds"));
        assert_eq!(worker.done_jobs(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_retry_honors_queue_and_countdown() {
        let (worker, state, broker) = test_worker(one_shot_config(), test_registry());

        let id = Job::enqueue(
            &worker.backends(),
            "Retry",
            json!({"queue": "other", "countdown": 10}),
            "default",
        )
        .await
        .unwrap();

        worker.run().await.unwrap();

        let doc = state.job(id).unwrap();
        assert_eq!(doc.status, JobStatus::Retry);
        assert_eq!(doc.retry_count, 1);

        // The re-enqueue is delayed: nothing lands before the countdown.
        assert_eq!(broker.len("other"), 0);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(broker.len("other"), 1);
    }

    #[tokio::test]
    async fn test_failure_records_traceback() {
        let (worker, state, _broker) = test_worker(one_shot_config(), test_registry());

        let id = Job::enqueue(
            &worker.backends(),
            "RaiseException",
            json!({"message": "boom"}),
            "default",
        )
        .await
        .unwrap();

        worker.run().await.unwrap();

        let doc = state.job(id).unwrap();
        assert_eq!(doc.status, JobStatus::Failed);
        assert!(doc.traceback.unwrap().contains("boom"));
        assert_eq!(worker.done_jobs(), 1);
    }

    #[tokio::test]
    async fn test_tagged_failure_retries_and_requeues() {
        let mut registry = TaskRegistry::new();
        registry.register(
            "RaiseException",
            TaskSpec::new(Arc::new(RaiseException)).retry_on([ErrorTag::TRANSIENT]),
        );
        let (worker, state, broker) = test_worker(one_shot_config(), registry);

        let id = Job::enqueue(
            &worker.backends(),
            "RaiseException",
            json!({"message": "flaky upstream", "tag": "transient"}),
            "default",
        )
        .await
        .unwrap();

        worker.run().await.unwrap();

        // Immediate requeue: the document is back to queued and the id
        // is on the queue again.
        let doc = state.job(id).unwrap();
        assert_eq!(doc.status, JobStatus::Queued);
        assert_eq!(doc.retry_count, 1);
        assert_eq!(broker.len("default"), 1);
    }

    #[tokio::test]
    async fn test_round_trip_params() {
        let (worker, state, _broker) = test_worker(one_shot_config(), test_registry());

        let params = json!({"nested": {"values": [1, 2, 3]}, "flag": true});
        let id = Job::enqueue(&worker.backends(), "ReturnParams", params.clone(), "default")
            .await
            .unwrap();

        worker.run().await.unwrap();

        assert_eq!(state.job(id).unwrap().result, Some(params));
    }

    // ==========================================================================
    // Dispatch Behavior
    // ==========================================================================

    #[tokio::test]
    async fn test_batch_dispatch_fills_free_slots() {
        let config = WorkerConfig {
            pool_size: 4,
            max_jobs: 3,
            quiet: true,
            ..Default::default()
        };
        let (worker, state, _broker) = test_worker(config, test_registry());

        for i in 0..3 {
            Job::enqueue(
                &worker.backends(),
                "Add",
                json!({"a": i, "b": 1}),
                "default",
            )
            .await
            .unwrap();
        }

        worker.run().await.unwrap();

        assert_eq!(worker.done_jobs(), 3);
        assert_eq!(state.jobs_with_status(JobStatus::Success).len(), 3);
    }

    #[tokio::test]
    async fn test_many_jobs_across_queues_all_settle() {
        let config = WorkerConfig {
            queues: vec!["high".to_string(), "low".to_string()],
            pool_size: 4,
            max_jobs: 20,
            quiet: true,
            ..Default::default()
        };
        let (worker, state, _broker) = test_worker(config, test_registry());

        let mut expected = Vec::new();
        for i in 0..20 {
            let a = fastrand::i64(0..1000);
            let b = fastrand::i64(0..1000);
            let queue = if i % 2 == 0 { "high" } else { "low" };
            let id = Job::enqueue(
                &worker.backends(),
                "Add",
                json!({"a": a, "b": b}),
                queue,
            )
            .await
            .unwrap();
            expected.push((id, a + b));
        }

        worker.run().await.unwrap();

        assert_eq!(worker.done_jobs(), 20);
        for (id, sum) in expected {
            let doc = state.job(id).unwrap();
            assert_eq!(doc.status, JobStatus::Success);
            assert_eq!(doc.result, Some(json!(sum)));
        }
    }

    #[tokio::test]
    async fn test_stale_queue_entry_is_counted_and_skipped() {
        let (worker, state, broker) = test_worker(one_shot_config(), test_registry());

        // An id with no document behind it, ahead of a real job.
        broker.push("default", Uuid::new_v4()).await.unwrap();
        let id = Job::enqueue(
            &worker.backends(),
            "Add",
            json!({"a": 1, "b": 1}),
            "default",
        )
        .await
        .unwrap();

        worker.run().await.unwrap();

        assert_eq!(worker.stale_jobs(), 1);
        assert_eq!(state.job(id).unwrap().status, JobStatus::Success);

        let report = state.worker_report(worker.id()).unwrap();
        assert_eq!(report.stale_jobs, 1);
        assert_eq!(report.done_jobs, 1);
    }

    // ==========================================================================
    // Shutdown
    // ==========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_graceful_shutdown_lets_inflight_job_finish() {
        let config = WorkerConfig {
            pool_size: 1,
            quiet: true,
            ..Default::default()
        };
        let (worker, state, _broker) = test_worker(config, test_registry());

        let id = Job::enqueue(
            &worker.backends(),
            "Add",
            json!({"a": 4, "b": 4, "sleep": 2}),
            "default",
        )
        .await
        .unwrap();

        let runner = worker.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        let probe = worker.clone();
        wait_until(
            move || {
                probe.slots().iter().any(|slot| slot.job_id == Some(id))
            },
            "job bound to a slot",
        )
        .await;

        worker.shutdown().request_graceful();
        handle.await.unwrap().unwrap();

        let doc = state.job(id).unwrap();
        assert_eq!(doc.status, JobStatus::Success);
        assert_eq!(doc.result, Some(json!(8)));

        let report = state.worker_report(worker.id()).unwrap();
        assert_eq!(report.status, WorkerStatus::Stopping);
        assert!(report.slots.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_shutdown_interrupts_inflight_job() {
        let config = WorkerConfig {
            pool_size: 1,
            quiet: true,
            ..Default::default()
        };
        let (worker, state, _broker) = test_worker(config, test_registry());

        let id = Job::enqueue(
            &worker.backends(),
            "Add",
            json!({"sleep": 60}),
            "default",
        )
        .await
        .unwrap();

        let runner = worker.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        let probe = worker.clone();
        wait_until(
            move || {
                probe.slots().iter().any(|slot| slot.job_id == Some(id))
            },
            "job bound to a slot",
        )
        .await;

        worker.shutdown().request_forced();
        handle.await.unwrap().unwrap();

        let doc = state.job(id).unwrap();
        assert_eq!(doc.status, JobStatus::Interrupt);
        assert!(doc.traceback.unwrap().contains("interrupted"));
        assert_eq!(worker.done_jobs(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_interrupt_press_upgrades_graceful_to_forced() {
        let config = WorkerConfig {
            pool_size: 1,
            quiet: true,
            ..Default::default()
        };
        let (worker, state, _broker) = test_worker(config, test_registry());

        let id = Job::enqueue(
            &worker.backends(),
            "Add",
            json!({"sleep": 60}),
            "default",
        )
        .await
        .unwrap();

        let runner = worker.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        let probe = worker.clone();
        wait_until(
            move || {
                probe.slots().iter().any(|slot| slot.job_id == Some(id))
            },
            "job bound to a slot",
        )
        .await;

        // First press: graceful, the sleeping job keeps running.
        worker.shutdown().press_interrupt();
        // Second press: forced. A third press changes nothing.
        worker.shutdown().press_interrupt();
        worker.shutdown().press_interrupt();

        handle.await.unwrap().unwrap();
        assert_eq!(state.job(id).unwrap().status, JobStatus::Interrupt);
    }

    // ==========================================================================
    // Background Loops
    // ==========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_reports_periodically_and_on_shutdown() {
        let config = WorkerConfig {
            quiet: true,
            report_interval: Duration::from_secs(10),
            ..Default::default()
        };
        let (worker, state, _broker) = test_worker(config, test_registry());

        let runner = worker.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        let probe_state = state.clone();
        let worker_id = worker.id();
        wait_until(
            move || probe_state.worker_report(worker_id).is_some(),
            "first heartbeat",
        )
        .await;

        let first = state.worker_report(worker_id).unwrap();
        assert_eq!(first.status, WorkerStatus::Started);

        let mut keys: Vec<String> = first
            .config
            .as_object()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["max_jobs", "name", "pool_size", "queues"]);

        tokio::time::sleep(Duration::from_secs(25)).await;
        let later = state.worker_report(worker_id).unwrap();
        assert!(later.reported_at >= first.reported_at);

        worker.shutdown().request_graceful();
        handle.await.unwrap().unwrap();

        let last = state.worker_report(worker_id).unwrap();
        assert_eq!(last.status, WorkerStatus::Stopping);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_materializes_due_definition() {
        let config = WorkerConfig {
            pool_size: 1,
            max_jobs: 1,
            quiet: true,
            scheduler: true,
            scheduler_interval: Duration::from_secs(30),
            ..Default::default()
        };
        let (worker, state, _broker) = test_worker(config, test_registry());

        let definition = ScheduledJob {
            id: Uuid::new_v4(),
            path: "Add".to_string(),
            params: json!({"a": 1, "b": 2}),
            queue: "default".to_string(),
            interval: Duration::from_secs(300),
            last_enqueued: None,
        };
        let definition_id = definition.id;
        state.insert_scheduled(definition);

        // The scheduler's first scan enqueues the definition; the
        // dispatch loop runs it and max_jobs=1 exits the worker.
        worker.run().await.unwrap();

        let done = state.jobs_with_status(JobStatus::Success);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].result, Some(json!(3)));
        assert!(state.scheduled(definition_id).unwrap().last_enqueued.is_some());
    }
}
