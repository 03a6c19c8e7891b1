//! Task registry: maps opaque path strings to executable task specs.
//!
//! A task path is an identifier, not a language symbol. Registration is
//! a compile-time table built at worker construction; there is no
//! dynamic loading.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{ErrorTag, TaskError};

/// An executable unit of work.
///
/// Task bodies should yield at I/O boundaries: the per-job timeout and
/// shutdown interrupts are delivered at suspension points, so a purely
/// CPU-bound body can overrun its deadline.
#[async_trait]
pub trait Task: Send + Sync {
    /// Run the task with the job's params, returning a JSON result.
    async fn run(&self, params: Value) -> Result<Value, TaskError>;
}

/// A registered task with its declared execution policy.
#[derive(Clone)]
pub struct TaskSpec {
    /// The executable.
    pub task: Arc<dyn Task>,

    /// Declared per-job timeout. Falls back to the worker's
    /// `default_job_timeout` when unset.
    pub timeout: Option<Duration>,

    /// Failure tags that trigger a retry instead of `failed`.
    pub retry_tags: HashSet<ErrorTag>,
}

impl TaskSpec {
    /// A spec with no declared timeout and no retryable tags.
    pub fn new(task: Arc<dyn Task>) -> Self {
        Self {
            task,
            timeout: None,
            retry_tags: HashSet::new(),
        }
    }

    /// Declare a per-job timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Declare the failure tags that trigger a retry.
    pub fn retry_on(mut self, tags: impl IntoIterator<Item = ErrorTag>) -> Self {
        self.retry_tags.extend(tags);
        self
    }
}

impl std::fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSpec")
            .field("timeout", &self.timeout)
            .field("retry_tags", &self.retry_tags)
            .finish_non_exhaustive()
    }
}

/// Registry mapping task paths to specs.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, TaskSpec>,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a spec under a path.
    ///
    /// # Panics
    ///
    /// Panics if the path is already registered: two tasks answering
    /// one path is a wiring bug, caught at startup.
    pub fn register(&mut self, path: impl Into<String>, spec: TaskSpec) {
        let path = path.into();
        if self.tasks.contains_key(&path) {
            panic!("task already registered for path: {}", path);
        }
        self.tasks.insert(path, spec);
    }

    /// Resolve a path to its spec.
    pub fn resolve(&self, path: &str) -> Option<&TaskSpec> {
        self.tasks.get(path)
    }

    /// Check if a path is registered.
    pub fn has(&self, path: &str) -> bool {
        self.tasks.contains_key(path)
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("paths", &self.tasks.keys().collect::<Vec<_>>())
            .finish()
    }
}
