//! Run command: execute tasks across the workspace

use std::sync::Arc;

use clap::Args;
use console::style;
use tracing::{debug, info, warn};

use conveyor_core::config::FailurePolicy;
use conveyor_tasks::{
    AbortController, CacheBackend, LocalCache, NodeKind, NodeStatus, RunResult, Scheduler,
    SchedulerOptions, ShellExecutor, TaskCache, TaskEvent, TaskGraph, TaskId, TaskReporter,
    TaskReporterRegistry,
};

use super::graph::{plan_entries, print_plan};
use super::{FilterArgs, Plan, Project};
use crate::cli::output;
use crate::cli::{Cli, OutputFormat};
use crate::exit_codes::RunFailure;

/// Run tasks across the workspace
#[derive(Debug, Args)]
pub struct RunCommand {
    /// Tasks to run (e.g., build test lint)
    #[arg(required = true)]
    pub tasks: Vec<String>,

    #[command(flatten)]
    pub filter: FilterArgs,

    /// Maximum concurrent tasks
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Stop starting new tasks after the first failure
    #[arg(long)]
    pub bail: bool,

    /// Disable the task cache
    #[arg(long)]
    pub no_cache: bool,

    /// Show execution plan without running
    #[arg(long)]
    pub dry_run: bool,

    /// Arguments passed through to every task
    #[arg(last = true)]
    pub args: Vec<String>,
}

impl RunCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(self.execute_async(cli))
    }

    async fn execute_async(&self, cli: &Cli) -> anyhow::Result<()> {
        let project = Project::load()?;
        let config = &project.config;
        let plan = Plan::build(&project, &self.filter, &self.tasks)?;

        if plan.packages.is_empty() {
            if cli.show_progress() {
                output::success("No packages matched, nothing to run.");
            }
            return Ok(());
        }

        let entries = plan_entries(&plan.graph, &self.tasks);
        let task_count = entries.iter().filter(|e| e.kind == NodeKind::Task).count();
        info!(
            tasks = task_count,
            packages = plan.packages.len(),
            dry_run = self.dry_run,
            "executing run command"
        );

        if self.dry_run {
            debug!("execution plan:\n{}", plan.graph.execution_plan());
            if cli.format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if !cli.quiet {
                output::info(&format!(
                    "{} across {}",
                    output::plural(task_count, "task"),
                    output::plural(plan.packages.len(), "package")
                ));
                println!();
                print_plan(&entries, cli.verbose);
                println!();
                println!(
                    "{}",
                    style("[DRY RUN - no tasks will be executed]").yellow().bold()
                );
            }
            return Ok(());
        }

        if cli.show_progress() {
            println!();
            output::info(&format!(
                "Running {} across {}",
                output::plural(task_count, "task"),
                output::plural(plan.packages.len(), "package")
            ));
            println!();
        }

        let cache: Option<Arc<dyn CacheBackend>> = if !self.no_cache && config.cache.enabled {
            let backend = LocalCache::new(
                TaskCache::new(project.cache_dir()),
                plan.workspace.clone(),
                self.tasks.iter().cloned(),
            )
            .with_outputs(&config.cache.outputs)?
            .with_exclude(&config.cache.exclude)?;
            let backend: Arc<dyn CacheBackend> = Arc::new(backend);
            Some(backend)
        } else {
            None
        };

        let mut reporters = TaskReporterRegistry::new();
        if cli.show_progress() {
            reporters.register(ConsoleReporter::for_graph(&plan.graph, cli.verbose));
        }

        let options = SchedulerOptions {
            concurrency: self
                .concurrency
                .unwrap_or_else(|| config.effective_concurrency()),
            failure_policy: if self.bail {
                FailurePolicy::BailOut
            } else {
                config.failure_policy
            },
            cancel_policy: config.cancel_policy,
            args: self.args.clone(),
        };

        let scheduler = Scheduler::new(
            options,
            plan.workspace.clone(),
            Arc::new(ShellExecutor::new(&config.npm_client)),
            cache,
            Arc::new(reporters),
        );

        let controller = AbortController::new();
        let signal = controller.signal();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping");
                controller.abort();
            }
        });

        let result = scheduler.run(&plan.graph, &self.tasks, signal).await;

        if cli.format == OutputFormat::Json {
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else if !cli.quiet {
            print_summary(&result);
        }

        if result.aborted {
            return Err(RunFailure::Cancelled.into());
        }
        let failed = result.failed().len();
        if failed > 0 {
            return Err(RunFailure::TasksFailed { failed }.into());
        }

        Ok(())
    }
}

/// List failed and skipped pipeline tasks
fn print_summary(result: &RunResult) {
    let failed = result.failed();
    let skipped: Vec<_> = result
        .skipped()
        .into_iter()
        .filter(|n| n.kind == NodeKind::Task)
        .collect();

    if !failed.is_empty() {
        println!();
        println!(
            "  {} {} failed:",
            style("✗").red().bold(),
            output::plural(failed.len(), "task")
        );
        for node in &failed {
            if let NodeStatus::Failed(ref err) = node.status {
                println!("    {} {}: {}", style("✗").red(), node.id, err);
            }
        }
    }

    if !skipped.is_empty() {
        println!();
        println!(
            "  {} {} skipped:",
            style("○").yellow(),
            output::plural(skipped.len(), "task")
        );
        for node in &skipped {
            if let NodeStatus::Skipped(reason) = node.status {
                println!("    {} {} {}", style("○").yellow(), node.id, style(format!("({})", reason)).dim());
            }
        }
    }
}

/// Console reporter with live output
struct ConsoleReporter {
    verbose: bool,
    package_width: usize,
    task_width: usize,
}

impl ConsoleReporter {
    /// Pad labels to the longest package and task name in the graph
    fn for_graph(graph: &TaskGraph, verbose: bool) -> Self {
        let tasks = graph.nodes().iter().filter(|n| n.kind == NodeKind::Task);
        let (package_width, task_width) = tasks.fold((0, 0), |(p, t), node| {
            (p.max(node.id.package.len()), t.max(node.id.task_name.len()))
        });
        Self {
            verbose,
            package_width,
            task_width,
        }
    }

    fn label(&self, id: &TaskId) -> String {
        format!(
            "{:<pw$} {:<tw$}",
            id.package,
            id.task_name,
            pw = self.package_width,
            tw = self.task_width
        )
    }
}

impl TaskReporter for ConsoleReporter {
    fn report(&self, event: &TaskEvent) {
        match event {
            TaskEvent::NodeStarted { id, kind } => {
                if *kind == NodeKind::Task || self.verbose {
                    println!("  {} {}", style("▸").dim(), style(self.label(id)).bold());
                }
            }
            TaskEvent::Output {
                id,
                line,
                is_stderr,
            } => {
                if self.verbose {
                    let prefix = format!("[{}]", self.label(id));
                    if *is_stderr {
                        println!("    {} {}", style(prefix).red().dim(), line);
                    } else {
                        println!("    {} {}", style(prefix).dim(), line);
                    }
                }
            }
            TaskEvent::NodeSucceeded { id, duration } => {
                if NodeKind::for_task(&id.task_name).is_cache() && !self.verbose {
                    return;
                }
                println!(
                    "  {} {} {}",
                    style("✓").green(),
                    style(self.label(id)).green(),
                    style(format!("{:.1}s", duration.as_secs_f64())).dim()
                );
            }
            TaskEvent::NodeFailed {
                id,
                duration,
                error,
            } => {
                println!(
                    "  {} {} {} {}",
                    style("✗").red(),
                    style(self.label(id)).red(),
                    style(format!("{:.1}s", duration.as_secs_f64())).dim(),
                    style(error).red().dim()
                );
            }
            TaskEvent::NodeSkipped { id, reason } => {
                if NodeKind::for_task(&id.task_name).is_cache() && !self.verbose {
                    return;
                }
                println!(
                    "  {} {} {}",
                    style("○").yellow(),
                    style(self.label(id)).yellow(),
                    style(format!("({})", reason)).dim()
                );
            }
            TaskEvent::CacheHit { package } => {
                println!(
                    "  {} {} {}",
                    style("✓").green(),
                    style(package).green(),
                    style("(cached)").cyan()
                );
            }
            TaskEvent::CacheMiss { package } => {
                if self.verbose {
                    println!("  {} {} cache miss", style("─").dim(), package);
                }
            }
            TaskEvent::CacheWarning { package, op, error } => {
                output::warning(&format!("cache {} failed for {}: {}", op, package, error));
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
                println!();
                println!(
                    "  {} {}/{} succeeded, {} failed, {} skipped, {} cached ({:.1}s){}",
                    if *failed == 0 && !*aborted {
                        style("✓").green().bold()
                    } else {
                        style("✗").red().bold()
                    },
                    succeeded,
                    total,
                    failed,
                    skipped,
                    cached,
                    duration.as_secs_f64(),
                    if *aborted { " - aborted" } else { "" }
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    use conveyor_core::{Package, Workspace};
    use conveyor_tasks::PipelineSpec;

    #[test]
    fn test_labels_padded_to_longest_names() {
        let workspace = Workspace::from_packages(
            "/repo",
            vec![
                Package::new("ui", "/repo/ui").with_dependency("core"),
                Package::new("core", "/repo/core"),
            ],
        )
        .unwrap();
        let mut raw = BTreeMap::new();
        raw.insert("build".to_string(), vec!["^build".to_string()]);
        raw.insert("test".to_string(), vec!["build".to_string()]);
        let pipeline = PipelineSpec::parse(&raw).unwrap();
        let packages: BTreeSet<String> = workspace.names().map(str::to_string).collect();
        let graph = TaskGraph::build(&packages, &pipeline, &workspace).unwrap();

        let reporter = ConsoleReporter::for_graph(&graph, false);
        assert_eq!(reporter.label(&TaskId::new("ui", "test")), "ui   test ");
        assert_eq!(reporter.label(&TaskId::new("core", "build")), "core build");
    }
}
