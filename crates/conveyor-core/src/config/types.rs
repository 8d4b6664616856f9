//! Configuration types

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Main configuration for Conveyor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Version of the config schema
    #[serde(rename = "$schema", skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Task pipeline: task name to its dependency specs.
    ///
    /// A bare name (`"build"`) is a dependency on that task in the same
    /// package. A caret-prefixed name (`"^build"`) is a dependency on that
    /// task in every package the current package directly depends on.
    pub pipeline: BTreeMap<String, Vec<String>>,

    /// Maximum concurrent nodes (defaults to available parallelism)
    pub concurrency: Option<usize>,

    /// Package manager used to run scripts (npm, yarn, pnpm)
    pub npm_client: String,

    /// Cache configuration
    pub cache: CacheConfig,

    /// What happens to unrelated packages when a task fails
    pub failure_policy: FailurePolicy,

    /// What happens to in-flight tasks when the run is aborted
    pub cancel_policy: CancelPolicy,
}

impl Default for Config {
    fn default() -> Self {
        let mut pipeline = BTreeMap::new();
        pipeline.insert("build".to_string(), vec!["^build".to_string()]);
        pipeline.insert("test".to_string(), vec!["build".to_string()]);
        pipeline.insert("lint".to_string(), Vec::new());

        Self {
            schema: None,
            pipeline,
            concurrency: None,
            npm_client: "npm".to_string(),
            cache: CacheConfig::default(),
            failure_policy: FailurePolicy::default(),
            cancel_policy: CancelPolicy::default(),
        }
    }
}

impl Config {
    /// Concurrency to use when neither the CLI nor the config sets one
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        })
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether caching is enabled
    pub enabled: bool,

    /// Cache directory, relative to the workspace root
    pub dir: PathBuf,

    /// Output globs (relative to each package root) stored on put and
    /// restored on a hit
    pub outputs: Vec<String>,

    /// Extra globs excluded from the package content hash
    pub exclude: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from(".conveyor/cache"),
            outputs: vec!["lib/**".to_string(), "dist/**".to_string()],
            exclude: Vec::new(),
        }
    }
}

/// Failure propagation scope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Skip only the dependents of a failed node; independent branches finish
    #[default]
    ContinueIndependent,
    /// Stop dispatching anything new after the first failure
    BailOut,
}

/// Treatment of in-flight work on abort
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CancelPolicy {
    /// Let running nodes finish
    #[default]
    Wait,
    /// Kill running nodes
    Terminate,
}
