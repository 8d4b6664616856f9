//! Graph command: show the task graph without running it

use clap::Args;
use console::style;
use serde::Serialize;
use tracing::info;

use conveyor_tasks::scheduler::select_nodes;
use conveyor_tasks::{NodeKind, TaskGraph};

use super::{FilterArgs, Plan, Project};
use crate::cli::output;
use crate::cli::{Cli, OutputFormat};

/// Show the execution graph for a set of tasks
#[derive(Debug, Args)]
pub struct GraphCommand {
    /// Tasks to plan (default: every pipeline task)
    pub tasks: Vec<String>,

    #[command(flatten)]
    pub filter: FilterArgs,

    /// Include cache nodes in text output
    #[arg(long)]
    pub cache_nodes: bool,
}

/// One node of a printed plan
#[derive(Debug, Serialize)]
pub struct PlanEntry {
    pub id: String,
    pub kind: NodeKind,
    pub wave: usize,
    pub after: Vec<String>,
}

/// Selected nodes in topological order, with their selected predecessors
pub fn plan_entries(graph: &TaskGraph, tasks: &[String]) -> Vec<PlanEntry> {
    let selected = select_nodes(graph, tasks);
    graph
        .sorted()
        .iter()
        .filter(|&&idx| selected[idx])
        .map(|&idx| {
            let node = graph.node(idx);
            PlanEntry {
                id: node.id.to_string(),
                kind: node.kind,
                wave: node.wave,
                after: node
                    .dependencies
                    .iter()
                    .filter(|&&d| selected[d])
                    .map(|&d| graph.node(d).id.to_string())
                    .collect(),
            }
        })
        .collect()
}

/// Print a plan as text; cache nodes only when asked for
pub fn print_plan(entries: &[PlanEntry], cache_nodes: bool) {
    let mut wave = None;
    for entry in entries
        .iter()
        .filter(|e| cache_nodes || e.kind == NodeKind::Task)
    {
        if wave != Some(entry.wave) {
            println!("{}", style(format!("Wave {}", entry.wave)).dim());
            wave = Some(entry.wave);
        }
        if entry.after.is_empty() {
            println!("  {}", style(&entry.id).bold());
        } else {
            println!(
                "  {} {}",
                style(&entry.id).bold(),
                style(format!("(after: {})", entry.after.join(", "))).dim()
            );
        }
    }
}

impl GraphCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let project = Project::load()?;
        let tasks: Vec<String> = if self.tasks.is_empty() {
            project.config.pipeline.keys().cloned().collect()
        } else {
            self.tasks.clone()
        };
        info!(tasks = ?tasks, "executing graph command");

        let plan = Plan::build(&project, &self.filter, &tasks)?;
        let entries = plan_entries(&plan.graph, &tasks);

        if cli.format == OutputFormat::Json {
            println!("{}", serde_json::to_string_pretty(&entries)?);
            return Ok(());
        }

        if !cli.quiet {
            output::info(&format!(
                "{} across {}",
                output::plural(
                    entries.iter().filter(|e| e.kind == NodeKind::Task).count(),
                    "task"
                ),
                output::plural(plan.packages.len(), "package")
            ));
            if cli.verbose {
                if let Some(path) = &project.config_path {
                    println!(
                        "{}",
                        output::key_value("config", &output::path_style().apply_to(path.display()).to_string())
                    );
                }
            }
            println!();
            print_plan(&entries, self.cache_nodes || cli.verbose);
        }

        Ok(())
    }
}
