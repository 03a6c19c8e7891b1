//! Worker configuration.
//!
//! `WorkerConfig` carries every knob the worker core recognizes. It is
//! plain data: parsing command lines or config files into it belongs to
//! the process bootstrap, not here.

use std::time::Duration;

/// Configuration for a worker instance.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Ordered list of queue names to listen on. Empty names are
    /// filtered out at worker construction. Order is priority: the
    /// blocking pop scans left to right.
    pub queues: Vec<String>,

    /// Number of slots in the concurrency pool.
    pub pool_size: usize,

    /// Dispatch cap before graceful exit. 0 disables the cap.
    ///
    /// The counter is incremented at dispatch, not completion, so this
    /// caps dispatches.
    pub max_jobs: u64,

    /// Explicit worker name. Defaults to `host.pid` when unset.
    pub name: Option<String>,

    /// Suppress the console log sink. Records are still buffered for
    /// the durable log store.
    pub quiet: bool,

    /// Seconds between heartbeat reports.
    pub report_interval: Duration,

    /// Seconds between scheduler scans.
    pub scheduler_interval: Duration,

    /// Enable the scheduler loop.
    pub scheduler: bool,

    /// Collect per-task cumulative timings and dump them on exit.
    pub profile: bool,

    /// Fallback per-job timeout when the task spec does not declare one.
    pub default_job_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: vec!["default".to_string()],
            pool_size: 1,
            max_jobs: 0,
            name: None,
            quiet: false,
            report_interval: Duration::from_secs(10),
            scheduler_interval: Duration::from_secs(60),
            scheduler: false,
            profile: false,
            default_job_timeout: Duration::from_secs(3600),
        }
    }
}

impl WorkerConfig {
    /// Project the whitelisted subset of the config for the heartbeat.
    ///
    /// Built by enumerating the whitelist, never by excluding known-bad
    /// keys: a key added to the config later can never leak into the
    /// heartbeat by omission.
    pub fn whitelisted(&self) -> serde_json::Value {
        serde_json::json!({
            "max_jobs": self.max_jobs,
            "pool_size": self.pool_size,
            "queues": self.queues,
            "name": self.name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.queues, vec!["default"]);
        assert_eq!(config.pool_size, 1);
        assert_eq!(config.max_jobs, 0);
        assert!(!config.scheduler);
        assert_eq!(config.report_interval, Duration::from_secs(10));
        assert_eq!(config.default_job_timeout, Duration::from_secs(3600));
    }

    #[test]
    fn test_whitelisted_contains_only_whitelisted_keys() {
        let config = WorkerConfig {
            name: Some("w1".to_string()),
            ..Default::default()
        };

        let projected = config.whitelisted();
        let obj = projected.as_object().unwrap();

        let mut keys: Vec<&str> = obj.keys().map(|k| k.as_str()).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["max_jobs", "name", "pool_size", "queues"]);
        assert_eq!(projected["name"], "w1");
        assert_eq!(projected["pool_size"], 1);
    }

    #[test]
    fn test_whitelisted_name_is_raw_config_value_not_effective_name() {
        // The projection echoes the raw config: with no explicit name
        // it stays null. The worker's effective `host.pid` name lives
        // on the report's top-level `name` field, never here.
        let projected = WorkerConfig::default().whitelisted();
        assert_eq!(projected["name"], serde_json::Value::Null);
    }
}
