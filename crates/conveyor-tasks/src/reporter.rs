//! Run progress reporting

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use crate::scheduler::SkipReason;
use crate::task::{NodeKind, TaskId};

/// Cache operation named in a [`TaskEvent::CacheWarning`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheOp {
    Hash,
    Fetch,
    Put,
}

impl fmt::Display for CacheOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hash => write!(f, "hash"),
            Self::Fetch => write!(f, "fetch"),
            Self::Put => write!(f, "put"),
        }
    }
}

/// Events emitted during a run
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// A node was dispatched
    NodeStarted { id: TaskId, kind: NodeKind },
    /// A task produced output
    Output {
        id: TaskId,
        line: String,
        is_stderr: bool,
    },
    /// A node completed successfully
    NodeSucceeded { id: TaskId, duration: Duration },
    /// A node failed
    NodeFailed {
        id: TaskId,
        duration: Duration,
        error: String,
    },
    /// A node will not run
    NodeSkipped { id: TaskId, reason: SkipReason },
    /// Outputs for a package were restored from the cache
    CacheHit { package: String },
    /// No usable cache entry for a package
    CacheMiss { package: String },
    /// A cache operation failed; the run carries on without it
    CacheWarning {
        package: String,
        op: CacheOp,
        error: String,
    },
    /// Every selected node reached a terminal status
    RunCompleted {
        total: usize,
        succeeded: usize,
        failed: usize,
        skipped: usize,
        cached: usize,
        aborted: bool,
        duration: Duration,
    },
}

/// Observer for run progress. Must not block.
pub trait TaskReporter: Send + Sync {
    /// Handle a task event
    fn report(&self, event: &TaskEvent);
}

/// Simple reporter that logs to tracing
#[derive(Debug, Default)]
pub struct TracingReporter;

impl TaskReporter for TracingReporter {
    fn report(&self, event: &TaskEvent) {
        match event {
            TaskEvent::NodeStarted { id, kind } => {
                tracing::debug!(node = %id, ?kind, "node started");
            }
            TaskEvent::Output { id, line, is_stderr } => {
                if *is_stderr {
                    tracing::warn!("[{}] {}", id, line);
                } else {
                    tracing::debug!("[{}] {}", id, line);
                }
            }
            TaskEvent::NodeSucceeded { id, duration } => {
                tracing::info!("{} completed in {:.1}s", id, duration.as_secs_f64());
            }
            TaskEvent::NodeFailed {
                id,
                duration,
                error,
            } => {
                tracing::error!(
                    "{} failed after {:.1}s: {}",
                    id,
                    duration.as_secs_f64(),
                    error
                );
            }
            TaskEvent::NodeSkipped { id, reason } => {
                tracing::info!("{} skipped: {}", id, reason);
            }
            TaskEvent::CacheHit { package } => {
                tracing::info!(package = %package, "cache hit");
            }
            TaskEvent::CacheMiss { package } => {
                tracing::debug!(package = %package, "cache miss");
            }
            TaskEvent::CacheWarning { package, op, error } => {
                tracing::warn!(package = %package, op = %op, error = %error, "cache operation failed");
            }
            TaskEvent::RunCompleted {
                total,
                succeeded,
                failed,
                skipped,
                cached,
                aborted,
                duration,
            } => {
                tracing::info!(
                    aborted,
                    "Run complete: {}/{} succeeded, {} failed, {} skipped, {} cached ({:.1}s)",
                    succeeded,
                    total,
                    failed,
                    skipped,
                    cached,
                    duration.as_secs_f64()
                );
            }
        }
    }
}

/// Reporter that collects events for later inspection
#[derive(Debug, Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<TaskEvent>>,
}

impl CollectingReporter {
    /// Get all collected events
    pub fn events(&self) -> Vec<TaskEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl TaskReporter for CollectingReporter {
    fn report(&self, event: &TaskEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
    }
}

/// Fans events out to several reporters
pub struct TaskReporterRegistry {
    reporters: Vec<Arc<dyn TaskReporter>>,
}

impl TaskReporterRegistry {
    pub fn new() -> Self {
        Self {
            reporters: vec![Arc::new(TracingReporter)],
        }
    }

    pub fn empty() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    pub fn register<R: TaskReporter + 'static>(&mut self, reporter: R) {
        self.reporters.push(Arc::new(reporter));
    }

    pub fn register_shared(&mut self, reporter: Arc<dyn TaskReporter>) {
        self.reporters.push(reporter);
    }

    pub fn all(&self) -> &[Arc<dyn TaskReporter>] {
        &self.reporters
    }
}

impl TaskReporter for TaskReporterRegistry {
    fn report(&self, event: &TaskEvent) {
        for reporter in &self.reporters {
            reporter.report(event);
        }
    }
}

impl Default for TaskReporterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collecting_reporter() {
        let reporter = CollectingReporter::default();
        let id = TaskId::new("core", "build");

        reporter.report(&TaskEvent::NodeStarted {
            id: id.clone(),
            kind: NodeKind::Task,
        });
        reporter.report(&TaskEvent::NodeSucceeded {
            id,
            duration: Duration::from_secs(5),
        });

        let events = reporter.events();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_tracing_reporter() {
        let reporter = TracingReporter;
        let id = TaskId::new("core", "build");

        // Just verify it doesn't panic
        reporter.report(&TaskEvent::NodeSkipped {
            id,
            reason: SkipReason::CacheHit,
        });
        reporter.report(&TaskEvent::CacheWarning {
            package: "core".to_string(),
            op: CacheOp::Put,
            error: "disk full".to_string(),
        });
    }

    #[test]
    fn test_empty_registry() {
        let registry = TaskReporterRegistry::empty();
        assert!(registry.all().is_empty());
    }

    #[test]
    fn test_registry_fans_out() {
        let collecting = Arc::new(CollectingReporter::default());
        let mut registry = TaskReporterRegistry::new();
        registry.register_shared(collecting.clone());

        registry.report(&TaskEvent::CacheMiss {
            package: "core".to_string(),
        });

        assert_eq!(registry.all().len(), 2);
        assert_eq!(collecting.events().len(), 1);
    }

    #[test]
    fn test_register() {
        let mut registry = TaskReporterRegistry::empty();
        registry.register(TracingReporter);
        registry.register(CollectingReporter::default());
        assert_eq!(registry.all().len(), 2);
    }

    #[test]
    fn test_cache_op_display() {
        assert_eq!(CacheOp::Fetch.to_string(), "fetch");
    }
}
