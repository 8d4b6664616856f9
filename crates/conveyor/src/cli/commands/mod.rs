//! CLI commands

mod cache;
mod completions;
mod graph;
mod init;
mod run;

pub use cache::CacheCommand;
pub use completions::CompletionsCommand;
pub use graph::GraphCommand;
pub use init::InitCommand;
pub use run::RunCommand;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use tracing::{debug, info};

use conveyor_core::config::{load_config_or_default, Config};
use conveyor_core::error::ConfigError;
use conveyor_core::{filter_packages, ChangeDetector, FilterOptions, Workspace};
use conveyor_tasks::{PipelineSpec, TaskGraph};

/// Package selection flags shared by `run` and `graph`
#[derive(Debug, Clone, Default, Args)]
pub struct FilterArgs {
    /// Only packages whose name matches this glob (repeatable)
    #[arg(long)]
    pub scope: Vec<String>,

    /// Only packages changed since this git revision
    #[arg(long)]
    pub since: Option<String>,

    /// Drop packages whose name matches this glob (repeatable)
    #[arg(long)]
    pub ignore: Vec<String>,

    /// Include the dependencies of scoped packages
    #[arg(long)]
    pub deps: bool,
}

impl From<&FilterArgs> for FilterOptions {
    fn from(args: &FilterArgs) -> Self {
        FilterOptions {
            scope: args.scope.clone(),
            deps: args.deps,
            since: args.since.clone(),
            ignore: args.ignore.clone(),
        }
    }
}

/// A loaded workspace together with its configuration
pub struct Project {
    /// Workspace root
    pub root: PathBuf,
    /// Effective configuration
    pub config: Config,
    /// Config file, if one was found
    pub config_path: Option<PathBuf>,
}

impl Project {
    /// Load configuration for the current directory.
    ///
    /// The directory holding the config file is the workspace root; without
    /// one, the current directory is.
    pub fn load() -> anyhow::Result<Self> {
        let cwd = std::env::current_dir()?;
        let (config, config_path) = load_config_or_default(&cwd)?;
        let root = config_path
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or(cwd);
        debug!(root = %root.display(), "project root resolved");

        Ok(Self {
            root,
            config,
            config_path,
        })
    }

    /// Discover the workspace packages
    pub fn workspace(&self) -> anyhow::Result<Workspace> {
        let workspace = Workspace::load(&self.root)?;
        info!(packages = workspace.len(), "workspace loaded");
        Ok(workspace)
    }

    /// Cache directory from configuration, relative to the root
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(&self.config.cache.dir)
    }
}

/// Apply the filter flags, consulting git only when `--since` is set
pub fn select_packages(
    root: &Path,
    workspace: &Workspace,
    filter: &FilterArgs,
) -> anyhow::Result<BTreeSet<String>> {
    let options = FilterOptions::from(filter);
    let changed = match &options.since {
        Some(since) => ChangeDetector::new(root.to_path_buf()).changed_packages(workspace, since)?,
        None => BTreeSet::new(),
    };

    let selected = filter_packages(workspace, &options, |pkg| changed.contains(&pkg.name))?;
    Ok(selected)
}

/// Parse the pipeline and check the requested tasks against it
pub fn load_pipeline(config: &Config, tasks: &[String]) -> Result<PipelineSpec, ConfigError> {
    let pipeline = PipelineSpec::parse(&config.pipeline)?;
    for task in tasks {
        if !pipeline.contains(task) {
            return Err(ConfigError::InvalidValue {
                field: "tasks".to_string(),
                message: format!("task '{}' is not defined in the pipeline", task),
            });
        }
    }
    Ok(pipeline)
}

/// Everything needed before scheduling: packages, pipeline and graph
pub struct Plan {
    pub workspace: Arc<Workspace>,
    pub packages: BTreeSet<String>,
    pub graph: TaskGraph,
}

impl Plan {
    pub fn build(project: &Project, filter: &FilterArgs, tasks: &[String]) -> anyhow::Result<Self> {
        let pipeline = load_pipeline(&project.config, tasks)?;
        let workspace = project.workspace()?;
        let packages = select_packages(&project.root, &workspace, filter)?;
        let graph = TaskGraph::build(&packages, &pipeline, &workspace)?;

        Ok(Self {
            workspace: Arc::new(workspace),
            packages,
            graph,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tasks(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_load_pipeline_default_config() {
        let pipeline = load_pipeline(&Config::default(), &tasks(&["build", "test"])).unwrap();
        assert!(pipeline.contains("lint"));
    }

    #[test]
    fn test_unknown_task_rejected() {
        let err = load_pipeline(&Config::default(), &tasks(&["deploy"])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_filter_args_conversion() {
        let args = FilterArgs {
            scope: vec!["app-*".to_string()],
            deps: true,
            ..Default::default()
        };
        let options = FilterOptions::from(&args);
        assert_eq!(options.scope, vec!["app-*"]);
        assert!(options.deps);
        assert!(options.since.is_none());
    }
}
