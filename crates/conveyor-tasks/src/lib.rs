//! Conveyor Tasks - task graph and scheduling engine
//!
//! Builds an execution graph over (package, task) pairs from a pipeline
//! definition and the workspace dependency graph, then runs it with bounded
//! concurrency, failure propagation and cache short-circuiting.

pub mod cache;
pub mod executor;
pub mod graph;
pub mod pipeline;
pub mod reporter;
pub mod scheduler;
pub mod task;

pub use cache::{CacheBackend, CacheEntry, CacheError, CacheKey, CacheStats, LocalCache, TaskCache};
pub use executor::{ExitInfo, ShellExecutor, TaskContext, TaskExecutor};
pub use graph::{GraphError, NodeIndex, TaskGraph, TaskNode};
pub use pipeline::{DependencySpec, PipelineSpec};
pub use reporter::{CacheOp, TaskEvent, TaskReporter, TaskReporterRegistry};
pub use scheduler::{
    AbortController, AbortSignal, NodeResult, NodeStatus, RunResult, Scheduler, SchedulerOptions,
    SkipReason,
};
pub use task::{NodeKind, TaskId};
