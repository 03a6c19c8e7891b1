//! Heartbeat reporting types and process metrics.
//!
//! The monitoring loop periodically upserts a [`WorkerReport`] into the
//! state store's workers collection: worker status, the whitelisted
//! config snapshot, dispatch counters, process metrics, and a snapshot
//! of every live slot. The shutdown finalizer writes one last report
//! synchronously.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::System;
use uuid::Uuid;

use crate::pool::SlotSnapshot;

/// Lifecycle status of the worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Init,
    Started,
    Stopping,
    Killing,
}

impl WorkerStatus {
    /// The serialized label for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Init => "init",
            WorkerStatus::Started => "started",
            WorkerStatus::Stopping => "stopping",
            WorkerStatus::Killing => "killing",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process resource metrics included in each heartbeat.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ProcessStats {
    /// OS process id.
    pub pid: u32,

    /// CPU usage percent since the previous refresh.
    pub cpu_percent: f32,

    /// Resident set size in bytes.
    pub rss_bytes: u64,

    /// Virtual memory size in bytes.
    pub virtual_bytes: u64,
}

/// The heartbeat document upserted into the workers collection.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    /// Worker id (the upsert key).
    pub id: Uuid,

    /// Human-readable worker name (`host.pid` unless overridden).
    pub name: String,

    /// Current worker status.
    pub status: WorkerStatus,

    /// Whitelisted config projection. Only enumerated keys appear.
    pub config: serde_json::Value,

    /// Jobs dispatched so far.
    pub done_jobs: u64,

    /// Stale queue ids skipped so far.
    pub stale_jobs: u64,

    /// When the worker process started.
    pub started_at: DateTime<Utc>,

    /// When this report was composed.
    pub reported_at: DateTime<Utc>,

    /// Process resource metrics.
    pub process: ProcessStats,

    /// One snapshot per live slot.
    pub slots: Vec<SlotSnapshot>,
}

/// Reads this process's resource usage via sysinfo.
pub struct ProcessMonitor {
    system: System,
    pid: sysinfo::Pid,
}

impl ProcessMonitor {
    /// Create a monitor bound to the current process.
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid().unwrap_or_else(|_| sysinfo::Pid::from_u32(0));
        let mut system = System::new_all();
        system.refresh_all();
        Self { system, pid }
    }

    /// The current process id.
    pub fn pid(&self) -> u32 {
        self.pid.as_u32()
    }

    /// Sample current process metrics.
    pub fn stats(&mut self) -> ProcessStats {
        self.system.refresh_all();
        match self.system.process(self.pid) {
            Some(process) => ProcessStats {
                pid: self.pid.as_u32(),
                cpu_percent: process.cpu_usage(),
                rss_bytes: process.memory(),
                virtual_bytes: process.virtual_memory(),
            },
            None => ProcessStats {
                pid: self.pid.as_u32(),
                ..Default::default()
            },
        }
    }

    /// Short hostname of this machine, used for the default worker
    /// name.
    pub fn short_hostname() -> String {
        System::host_name()
            .map(|h| h.split('.').next().unwrap_or(&h).to_string())
            .unwrap_or_else(|| "localhost".to_string())
    }
}

impl Default for ProcessMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProcessMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessMonitor").field("pid", &self.pid).finish()
    }
}

/// Cumulative per-task timing table, collected when profiling is
/// enabled and dumped sorted by total time at shutdown.
#[derive(Debug, Default)]
pub struct TaskTimings {
    entries: Mutex<HashMap<String, (u64, Duration)>>,
}

impl TaskTimings {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one task execution.
    pub fn record(&self, path: &str, elapsed: Duration) {
        let mut entries = self.entries.lock().expect("timing table poisoned");
        let entry = entries.entry(path.to_string()).or_insert((0, Duration::ZERO));
        entry.0 += 1;
        entry.1 += elapsed;
    }

    /// Drain the table as `(path, calls, cumulative)` rows, largest
    /// cumulative time first.
    pub fn dump(&self) -> Vec<(String, u64, Duration)> {
        let entries = self.entries.lock().expect("timing table poisoned");
        let mut rows: Vec<(String, u64, Duration)> = entries
            .iter()
            .map(|(path, (calls, total))| (path.clone(), *calls, *total))
            .collect();
        rows.sort_by(|a, b| b.2.cmp(&a.2));
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_labels() {
        assert_eq!(WorkerStatus::Init.as_str(), "init");
        assert_eq!(WorkerStatus::Killing.as_str(), "killing");
        assert_eq!(
            serde_json::to_value(WorkerStatus::Stopping).unwrap(),
            serde_json::json!("stopping")
        );
    }

    #[test]
    fn test_process_monitor_reads_own_process() {
        let mut monitor = ProcessMonitor::new();
        let stats = monitor.stats();
        assert_eq!(stats.pid, monitor.pid());
        assert!(stats.rss_bytes > 0);
    }

    #[test]
    fn test_short_hostname_has_no_dots() {
        assert!(!ProcessMonitor::short_hostname().contains('.'));
    }

    #[test]
    fn test_task_timings_sorted_by_cumulative() {
        let timings = TaskTimings::new();
        timings.record("Fast", Duration::from_millis(5));
        timings.record("Slow", Duration::from_millis(100));
        timings.record("Fast", Duration::from_millis(5));

        let rows = timings.dump();
        assert_eq!(rows[0].0, "Slow");
        assert_eq!(rows[1], ("Fast".to_string(), 2, Duration::from_millis(10)));
    }
}
