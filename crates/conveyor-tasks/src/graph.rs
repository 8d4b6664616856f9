//! Task graph construction

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use tracing::{info, instrument};

use conveyor_core::monorepo::Workspace;

use crate::pipeline::{DependencySpec, PipelineSpec};
use crate::task::{NodeKind, TaskId, CACHE_FETCH, CACHE_HASH, CACHE_PUT};

/// Position of a node in the DAG's node table
pub type NodeIndex = usize;

/// A node in the task execution DAG
#[derive(Debug, Clone)]
pub struct TaskNode {
    /// Task identifier
    pub id: TaskId,
    /// What the node does when dispatched
    pub kind: NodeKind,
    /// Nodes that must finish before this one
    pub dependencies: Vec<NodeIndex>,
    /// Nodes waiting on this one
    pub dependents: Vec<NodeIndex>,
    /// Execution wave (nodes in the same wave have no path between them)
    pub wave: usize,
}

/// The nodes belonging to one package
#[derive(Debug, Clone)]
pub struct PackageNodes {
    pub cache_hash: NodeIndex,
    pub cache_fetch: NodeIndex,
    pub cache_put: NodeIndex,
    /// Pipeline task nodes, in pipeline order
    pub tasks: Vec<NodeIndex>,
}

/// Directed acyclic graph over (package, task) pairs.
///
/// Built in one step by [`TaskGraph::build`] and immutable afterwards; run
/// state lives in the scheduler.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    nodes: Vec<TaskNode>,
    index: HashMap<TaskId, NodeIndex>,
    packages: BTreeMap<String, PackageNodes>,
    sorted_order: Vec<NodeIndex>,
    waves: Vec<Vec<NodeIndex>>,
}

impl TaskGraph {
    /// Build the DAG for the selected packages.
    ///
    /// Every package gets `cacheHash -> cacheFetch -> <pipeline tasks> -> cachePut`.
    /// A bare dependency `d` of task `T` wires `P#d -> P#T`; a caret dependency
    /// `^d` wires `Q#d -> P#T` for each selected package `Q` that `P` directly
    /// depends on. Transitive ordering falls out of `Q`'s own caret edges.
    #[instrument(skip_all, fields(packages = packages.len(), tasks = pipeline.len()))]
    pub fn build(
        packages: &BTreeSet<String>,
        pipeline: &PipelineSpec,
        workspace: &Workspace,
    ) -> Result<Self, GraphError> {
        let mut builder = Builder::default();

        for pkg in packages {
            if workspace.get(pkg).is_none() {
                return Err(GraphError::PackageNotFound(pkg.clone()));
            }
            let cache_hash = builder.add(TaskId::new(pkg, CACHE_HASH), NodeKind::CacheHash);
            let cache_fetch = builder.add(TaskId::new(pkg, CACHE_FETCH), NodeKind::CacheFetch);
            let cache_put = builder.add(TaskId::new(pkg, CACHE_PUT), NodeKind::CachePut);
            builder.edge(cache_hash, cache_fetch);

            builder.packages.insert(
                pkg.clone(),
                PackageNodes {
                    cache_hash,
                    cache_fetch,
                    cache_put,
                    tasks: Vec::new(),
                },
            );
        }

        for task in pipeline.task_names() {
            for pkg in packages {
                let idx = builder.add(TaskId::new(pkg, task), NodeKind::Task);
                if let Some(nodes) = builder.packages.get_mut(pkg) {
                    nodes.tasks.push(idx);
                }
            }
        }

        for task in pipeline.task_names() {
            let specs = pipeline.dependencies(task).unwrap_or_default();
            for pkg in packages {
                let this = builder.index[&TaskId::new(pkg, task)];
                let fetch = builder.packages[pkg].cache_fetch;
                builder.edge(fetch, this);

                for spec in specs {
                    match spec {
                        DependencySpec::SamePackage(dep) => {
                            let dep_idx = builder.index[&TaskId::new(pkg, dep)];
                            builder.edge(dep_idx, this);
                        }
                        DependencySpec::Topological(dep) => {
                            for upstream in workspace.dependencies(pkg) {
                                // Unselected upstream packages have no nodes to wait on
                                if let Some(&dep_idx) =
                                    builder.index.get(&TaskId::new(upstream, dep))
                                {
                                    builder.edge(dep_idx, this);
                                }
                            }
                        }
                    }
                }
            }
        }

        for nodes in builder.packages.values() {
            for &task in &nodes.tasks {
                builder.nodes[task].dependents.push(nodes.cache_put);
                builder.nodes[nodes.cache_put].dependencies.push(task);
            }
        }

        let Builder {
            mut nodes,
            index,
            packages,
        } = builder;

        let sorted_order = topological_sort(&nodes)?;
        let waves = compute_waves(&mut nodes, &sorted_order);

        info!(
            node_count = nodes.len(),
            wave_count = waves.len(),
            "task graph built"
        );

        Ok(Self {
            nodes,
            index,
            packages,
            sorted_order,
            waves,
        })
    }

    /// All nodes, addressable by [`NodeIndex`]
    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    /// Node at an index
    pub fn node(&self, idx: NodeIndex) -> &TaskNode {
        &self.nodes[idx]
    }

    /// Get a specific task node
    pub fn get(&self, id: &TaskId) -> Option<&TaskNode> {
        self.index.get(id).map(|&idx| &self.nodes[idx])
    }

    /// Nodes of one package
    pub fn package_nodes(&self, package: &str) -> Option<&PackageNodes> {
        self.packages.get(package)
    }

    /// Names of the packages in the graph
    pub fn packages(&self) -> impl Iterator<Item = &str> {
        self.packages.keys().map(String::as_str)
    }

    /// Predecessor ids of a node
    pub fn dependencies_of(&self, id: &TaskId) -> Vec<&TaskId> {
        self.get(id)
            .map(|node| node.dependencies.iter().map(|&d| &self.nodes[d].id).collect())
            .unwrap_or_default()
    }

    /// Get execution waves
    pub fn waves(&self) -> &[Vec<NodeIndex>] {
        &self.waves
    }

    /// Get the total number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the DAG is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node indices in topological order
    pub fn sorted(&self) -> &[NodeIndex] {
        &self.sorted_order
    }

    /// Get a human-readable summary of the execution plan
    pub fn execution_plan(&self) -> String {
        let mut plan = String::new();
        for (i, wave) in self.waves.iter().enumerate() {
            plan.push_str(&format!("Wave {} ({} nodes):\n", i, wave.len()));
            for &idx in wave {
                let node = &self.nodes[idx];
                if node.dependencies.is_empty() {
                    plan.push_str(&format!("  {}\n", node.id));
                } else {
                    let deps: Vec<String> = node
                        .dependencies
                        .iter()
                        .map(|&d| self.nodes[d].id.to_string())
                        .collect();
                    plan.push_str(&format!("  {} (after: {})\n", node.id, deps.join(", ")));
                }
            }
        }
        plan
    }
}

#[derive(Default)]
struct Builder {
    nodes: Vec<TaskNode>,
    index: HashMap<TaskId, NodeIndex>,
    packages: BTreeMap<String, PackageNodes>,
}

impl Builder {
    fn add(&mut self, id: TaskId, kind: NodeKind) -> NodeIndex {
        let idx = self.nodes.len();
        self.index.insert(id.clone(), idx);
        self.nodes.push(TaskNode {
            id,
            kind,
            dependencies: Vec::new(),
            dependents: Vec::new(),
            wave: 0,
        });
        idx
    }

    fn edge(&mut self, from: NodeIndex, to: NodeIndex) {
        if !self.nodes[to].dependencies.contains(&from) {
            self.nodes[to].dependencies.push(from);
            self.nodes[from].dependents.push(to);
        }
    }
}

/// Topological sort using Kahn's algorithm
fn topological_sort(nodes: &[TaskNode]) -> Result<Vec<NodeIndex>, GraphError> {
    let mut in_degree: Vec<usize> = nodes.iter().map(|n| n.dependencies.len()).collect();
    let mut queue: VecDeque<NodeIndex> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut sorted = Vec::with_capacity(nodes.len());

    while let Some(idx) = queue.pop_front() {
        sorted.push(idx);
        for &dependent in &nodes[idx].dependents {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                queue.push_back(dependent);
            }
        }
    }

    if sorted.len() != nodes.len() {
        let cycle = find_cycle(nodes, &in_degree)
            .into_iter()
            .map(|idx| nodes[idx].id.clone())
            .collect();
        return Err(GraphError::CyclicDependency { cycle });
    }

    Ok(sorted)
}

/// Extract one concrete cycle from the nodes Kahn's algorithm left behind.
///
/// Every leftover node has a leftover predecessor, so walking predecessors
/// must revisit a node. The result is in execution order: each node waits
/// on the one before it, and the first waits on the last.
fn find_cycle(nodes: &[TaskNode], in_degree: &[usize]) -> Vec<NodeIndex> {
    let Some(start) = (0..nodes.len()).find(|&i| in_degree[i] > 0) else {
        return Vec::new();
    };

    let mut path: Vec<NodeIndex> = Vec::new();
    let mut position: HashMap<NodeIndex, usize> = HashMap::new();
    let mut current = start;

    loop {
        if let Some(&pos) = position.get(&current) {
            let mut cycle = path[pos..].to_vec();
            cycle.reverse();
            return cycle;
        }
        position.insert(current, path.len());
        path.push(current);

        match nodes[current]
            .dependencies
            .iter()
            .find(|&&d| in_degree[d] > 0)
        {
            Some(&next) => current = next,
            None => return path,
        }
    }
}

/// Compute execution waves (groups of nodes that can run in parallel)
fn compute_waves(nodes: &mut [TaskNode], sorted: &[NodeIndex]) -> Vec<Vec<NodeIndex>> {
    let mut waves: Vec<Vec<NodeIndex>> = Vec::new();

    for &idx in sorted {
        let wave = nodes[idx]
            .dependencies
            .iter()
            .map(|&d| nodes[d].wave + 1)
            .max()
            .unwrap_or(0);
        nodes[idx].wave = wave;
        if waves.len() <= wave {
            waves.resize_with(wave + 1, Vec::new);
        }
        waves[wave].push(idx);
    }

    waves
}

/// Errors during DAG construction
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// Cyclic dependency detected
    #[error("Cyclic dependency detected: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<TaskId> },

    /// Selected package missing from the workspace
    #[error("Package '{0}' not found in workspace")]
    PackageNotFound(String),
}

fn format_cycle(cycle: &[TaskId]) -> String {
    let mut parts: Vec<String> = cycle.iter().map(ToString::to_string).collect();
    if let Some(first) = parts.first().cloned() {
        parts.push(first);
    }
    parts.join(" -> ")
}
