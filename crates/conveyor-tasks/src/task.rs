//! Task identity and node kinds

use std::fmt;

use serde::{Deserialize, Serialize};

/// Task name of the node that computes a package's cache key
pub const CACHE_HASH: &str = "cacheHash";
/// Task name of the node that tries to restore a package's outputs
pub const CACHE_FETCH: &str = "cacheFetch";
/// Task name of the node that stores a package's outputs
pub const CACHE_PUT: &str = "cachePut";

/// Task names the graph reserves for its cache nodes
pub const RESERVED_TASK_NAMES: [&str; 3] = [CACHE_HASH, CACHE_FETCH, CACHE_PUT];

/// Unique identifier for a node: a (package, task) pair
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    /// Package name
    pub package: String,
    /// Task name (e.g., "build", "test", "cacheFetch")
    pub task_name: String,
}

impl TaskId {
    /// Create a new task ID
    pub fn new(package: impl Into<String>, task_name: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            task_name: task_name.into(),
        }
    }

    /// Parse a task ID from "package#task" format.
    ///
    /// Splits on the last `#` so scoped names like `@acme/core#build` work.
    pub fn parse(s: &str) -> Option<Self> {
        let (package, task) = s.rsplit_once('#')?;
        if package.is_empty() || task.is_empty() {
            return None;
        }
        Some(Self::new(package, task))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.package, self.task_name)
    }
}

/// What a node does when the scheduler dispatches it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Compute the package cache key
    CacheHash,
    /// Try to restore outputs for the key
    CacheFetch,
    /// A pipeline task handed to the executor
    Task,
    /// Store outputs under the key
    CachePut,
}

impl NodeKind {
    /// Whether this is one of the synthetic cache nodes
    pub fn is_cache(&self) -> bool {
        !matches!(self, Self::Task)
    }

    /// Kind of node for a task name
    pub fn for_task(task_name: &str) -> Self {
        match task_name {
            CACHE_HASH => Self::CacheHash,
            CACHE_FETCH => Self::CacheFetch,
            CACHE_PUT => Self::CachePut,
            _ => Self::Task,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_display() {
        let id = TaskId::new("core", "build");
        assert_eq!(id.to_string(), "core#build");
    }

    #[test]
    fn test_task_id_parse() {
        let id = TaskId::parse("core#build").unwrap();
        assert_eq!(id.package, "core");
        assert_eq!(id.task_name, "build");
    }

    #[test]
    fn test_task_id_parse_scoped() {
        let id = TaskId::parse("@acme/core#test").unwrap();
        assert_eq!(id.package, "@acme/core");
        assert_eq!(id.task_name, "test");
    }

    #[test]
    fn test_task_id_parse_invalid() {
        assert!(TaskId::parse("nobuild").is_none());
        assert!(TaskId::parse("core#").is_none());
    }

    #[test]
    fn test_node_kind_for_task() {
        assert_eq!(NodeKind::for_task("cacheHash"), NodeKind::CacheHash);
        assert_eq!(NodeKind::for_task("cachePut"), NodeKind::CachePut);
        assert_eq!(NodeKind::for_task("build"), NodeKind::Task);
        assert!(NodeKind::CacheFetch.is_cache());
        assert!(!NodeKind::Task.is_cache());
    }
}
