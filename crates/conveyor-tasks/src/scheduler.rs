//! Task scheduler: runs a task graph on tokio with bounded concurrency

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, instrument, warn};

use conveyor_core::config::{CancelPolicy, FailurePolicy};
use conveyor_core::monorepo::{Package, Workspace};

use crate::cache::{CacheBackend, CacheError, CacheKey};
use crate::executor::{ExitInfo, TaskContext, TaskExecutor};
use crate::graph::{NodeIndex, TaskGraph};
use crate::reporter::{CacheOp, TaskEvent, TaskReporter};
use crate::task::{NodeKind, TaskId};

/// Why a node did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Outputs were restored from the cache
    CacheHit,
    /// A predecessor failed
    UpstreamFailed,
    /// The run was cancelled or bailed out first
    Aborted,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CacheHit => write!(f, "cache hit"),
            Self::UpstreamFailed => write!(f, "upstream failed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Node execution status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed(String),
    Skipped(SkipReason),
}

impl NodeStatus {
    /// Whether the status can no longer change
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_) | Self::Skipped(_))
    }

    /// Whether dependents may proceed
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped(SkipReason::CacheHit))
    }
}

/// Options for the task scheduler
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Maximum nodes in flight
    pub concurrency: usize,
    /// What a failure does to the rest of the run
    pub failure_policy: FailurePolicy,
    /// What cancellation does to in-flight nodes
    pub cancel_policy: CancelPolicy,
    /// Extra arguments passed to every task
    pub args: Vec<String>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            failure_policy: FailurePolicy::default(),
            cancel_policy: CancelPolicy::default(),
            args: Vec::new(),
        }
    }
}

/// Triggers cancellation of a run
#[derive(Debug)]
pub struct AbortController {
    tx: watch::Sender<bool>,
}

impl AbortController {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// A signal observing this controller
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Request cancellation. Idempotent.
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of an [`AbortController`]
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Pends forever if the
    /// controller is dropped without aborting.
    pub async fn aborted(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Terminal result of one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    pub id: TaskId,
    pub kind: NodeKind,
    pub status: NodeStatus,
    /// Time spent running; zero for nodes that never ran
    pub duration: Duration,
}

/// Outcome of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// Selected nodes in topological order
    pub nodes: Vec<NodeResult>,
    /// Whether cancellation was requested
    pub aborted: bool,
    /// Wall time of the run
    pub duration: Duration,
}

impl RunResult {
    /// True iff no node failed and the run was not aborted
    pub fn success(&self) -> bool {
        !self.aborted
            && self
                .nodes
                .iter()
                .all(|n| !matches!(n.status, NodeStatus::Failed(_)))
    }

    /// Nodes that failed
    pub fn failed(&self) -> Vec<&NodeResult> {
        self.nodes
            .iter()
            .filter(|n| matches!(n.status, NodeStatus::Failed(_)))
            .collect()
    }

    /// Nodes that did not run for any reason other than a cache hit
    pub fn skipped(&self) -> Vec<&NodeResult> {
        self.nodes
            .iter()
            .filter(|n| {
                matches!(n.status, NodeStatus::Skipped(reason) if reason != SkipReason::CacheHit)
            })
            .collect()
    }

    /// Result for one node
    pub fn get(&self, id: &TaskId) -> Option<&NodeResult> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    fn count(&self, pred: impl Fn(&NodeStatus) -> bool) -> usize {
        self.nodes.iter().filter(|n| pred(&n.status)).count()
    }
}

/// What a worker hands back to the coordinator
enum Outcome {
    Hashed(Result<CacheKey, CacheError>),
    Fetched(Result<bool, CacheError>),
    Executed(Result<(), ExitInfo>),
    Stored(Result<(), CacheError>),
    Noop,
}

type Completion = (NodeIndex, Result<Outcome, String>);

/// Runs a [`TaskGraph`].
///
/// A single coordinator loop owns the status table. Workers are spawned
/// tokio tasks that send their outcome back over a channel; they never
/// touch node state.
pub struct Scheduler {
    options: SchedulerOptions,
    workspace: Arc<Workspace>,
    executor: Arc<dyn TaskExecutor>,
    cache: Option<Arc<dyn CacheBackend>>,
    reporter: Arc<dyn TaskReporter>,
}

impl Scheduler {
    /// Create a new scheduler. Without a cache backend the cache nodes
    /// succeed without doing anything.
    pub fn new(
        options: SchedulerOptions,
        workspace: Arc<Workspace>,
        executor: Arc<dyn TaskExecutor>,
        cache: Option<Arc<dyn CacheBackend>>,
        reporter: Arc<dyn TaskReporter>,
    ) -> Self {
        Self {
            options,
            workspace,
            executor,
            cache,
            reporter,
        }
    }

    /// Run the requested tasks and everything they need
    #[instrument(skip_all, fields(nodes = graph.len(), tasks = ?requested))]
    pub async fn run(&self, graph: &TaskGraph, requested: &[String], abort: AbortSignal) -> RunResult {
        let selected = select_nodes(graph, requested);
        Run::new(self, graph, selected, abort).execute().await
    }
}

/// Nodes taking part in a run: requested pipeline nodes, their transitive
/// predecessors, and the cache nodes of every package involved.
pub fn select_nodes(graph: &TaskGraph, requested: &[String]) -> Vec<bool> {
    let mut selected = vec![false; graph.len()];
    let mut stack: Vec<NodeIndex> = graph
        .nodes()
        .iter()
        .enumerate()
        .filter(|(_, node)| node.kind == NodeKind::Task && requested.contains(&node.id.task_name))
        .map(|(idx, _)| idx)
        .collect();

    while let Some(idx) = stack.pop() {
        if selected[idx] {
            continue;
        }
        selected[idx] = true;
        stack.extend(graph.node(idx).dependencies.iter().copied());
    }

    let packages: BTreeSet<&str> = graph
        .nodes()
        .iter()
        .enumerate()
        .filter(|(idx, node)| selected[*idx] && node.kind == NodeKind::Task)
        .map(|(_, node)| node.id.package.as_str())
        .collect();
    for package in packages {
        if let Some(nodes) = graph.package_nodes(package) {
            for idx in [nodes.cache_hash, nodes.cache_fetch, nodes.cache_put] {
                selected[idx] = true;
            }
        }
    }

    selected
}

/// State of one run. Only the coordinator touches it.
struct Run<'a> {
    scheduler: &'a Scheduler,
    graph: &'a TaskGraph,
    selected: Vec<bool>,
    status: Vec<NodeStatus>,
    remaining: Vec<usize>,
    started: Vec<Option<Instant>>,
    durations: Vec<Duration>,
    ready: VecDeque<NodeIndex>,
    in_flight: HashMap<NodeIndex, AbortHandle>,
    keys: HashMap<String, CacheKey>,
    hits: HashSet<String>,
    abort: AbortSignal,
    aborted: bool,
    bailed: bool,
}

impl<'a> Run<'a> {
    fn new(
        scheduler: &'a Scheduler,
        graph: &'a TaskGraph,
        selected: Vec<bool>,
        abort: AbortSignal,
    ) -> Self {
        let len = graph.len();
        let remaining = (0..len)
            .map(|idx| {
                graph
                    .node(idx)
                    .dependencies
                    .iter()
                    .filter(|&&d| selected[d])
                    .count()
            })
            .collect();

        Self {
            scheduler,
            graph,
            selected,
            status: vec![NodeStatus::Pending; len],
            remaining,
            started: vec![None; len],
            durations: vec![Duration::ZERO; len],
            ready: VecDeque::new(),
            in_flight: HashMap::new(),
            keys: HashMap::new(),
            hits: HashSet::new(),
            abort,
            aborted: false,
            bailed: false,
        }
    }

    async fn execute(mut self) -> RunResult {
        let start = Instant::now();
        let concurrency = self.scheduler.options.concurrency.max(1);
        let (tx, mut rx) = mpsc::channel::<Completion>(concurrency);

        let graph = self.graph;
        for &idx in graph.sorted() {
            if self.selected[idx] && self.remaining[idx] == 0 {
                self.status[idx] = NodeStatus::Ready;
                self.ready.push_back(idx);
            }
        }

        loop {
            if !self.aborted && self.abort.is_aborted() {
                self.on_abort();
            }

            while !self.aborted && !self.bailed && self.in_flight.len() < concurrency {
                let Some(idx) = self.ready.pop_front() else {
                    break;
                };
                if self.status[idx] != NodeStatus::Ready {
                    continue;
                }
                if self.restored_from_cache(idx) {
                    self.skip(idx, SkipReason::CacheHit);
                    self.release(idx);
                } else {
                    self.dispatch(idx, &tx);
                }
            }

            if self.in_flight.is_empty() {
                break;
            }

            let aborted = self.aborted;
            tokio::select! {
                completion = rx.recv() => {
                    // The coordinator holds a sender, so the channel stays open
                    if let Some((idx, outcome)) = completion {
                        self.in_flight.remove(&idx);
                        self.complete(idx, outcome);
                    }
                }
                _ = self.abort.aborted(), if !aborted => self.on_abort(),
            }
        }

        for idx in 0..self.graph.len() {
            if self.selected[idx] && !self.status[idx].is_terminal() {
                self.skip(idx, SkipReason::Aborted);
            }
        }

        self.finish(start.elapsed())
    }

    fn on_abort(&mut self) {
        self.aborted = true;
        warn!(in_flight = self.in_flight.len(), "run aborted, no new tasks will start");
        if self.scheduler.options.cancel_policy == CancelPolicy::Terminate {
            for handle in self.in_flight.values() {
                handle.abort();
            }
        }
    }

    fn package(&self, idx: NodeIndex) -> Option<Package> {
        self.scheduler
            .workspace
            .get(&self.graph.node(idx).id.package)
            .cloned()
    }

    fn dispatch(&mut self, idx: NodeIndex, tx: &mpsc::Sender<Completion>) {
        let graph = self.graph;
        let node = graph.node(idx);
        self.status[idx] = NodeStatus::Running;
        self.started[idx] = Some(Instant::now());
        self.scheduler.reporter.report(&TaskEvent::NodeStarted {
            id: node.id.clone(),
            kind: node.kind,
        });
        debug!(node = %node.id, "dispatching");

        let Some(package) = self.package(idx) else {
            let error = format!("package '{}' is not in the workspace", node.id.package);
            self.complete(idx, Err(error));
            return;
        };

        let cache = self.scheduler.cache.clone();
        let key = self.keys.get(&package.name).cloned();
        let work: std::pin::Pin<Box<dyn std::future::Future<Output = Outcome> + Send>> =
            match node.kind {
                NodeKind::CacheHash => Box::pin(async move {
                    match cache {
                        Some(cache) => Outcome::Hashed(cache.hash(&package).await),
                        None => Outcome::Noop,
                    }
                }),
                NodeKind::CacheFetch => Box::pin(async move {
                    match (cache, key) {
                        (Some(cache), Some(key)) => {
                            Outcome::Fetched(cache.fetch(&package, &key).await)
                        }
                        _ => Outcome::Noop,
                    }
                }),
                NodeKind::Task => {
                    let executor = self.scheduler.executor.clone();
                    let task = node.id.task_name.clone();
                    let ctx = TaskContext {
                        args: self.scheduler.options.args.clone(),
                        reporter: self.scheduler.reporter.clone(),
                    };
                    Box::pin(async move {
                        Outcome::Executed(executor.execute(&task, &package, &ctx).await)
                    })
                }
                NodeKind::CachePut => {
                    // Restored outputs are already current
                    let hit = self.hits.contains(&package.name);
                    Box::pin(async move {
                        match (cache, key) {
                            (Some(cache), Some(key)) if !hit => {
                                Outcome::Stored(cache.put(&package, &key).await)
                            }
                            _ => Outcome::Noop,
                        }
                    })
                }
            };

        let inner = tokio::spawn(work);
        self.in_flight.insert(idx, inner.abort_handle());

        let tx = tx.clone();
        tokio::spawn(async move {
            let outcome = inner.await.map_err(|e| {
                if e.is_cancelled() {
                    "terminated".to_string()
                } else {
                    format!("task panicked: {}", e)
                }
            });
            let _ = tx.send((idx, outcome)).await;
        });
    }

    fn complete(&mut self, idx: NodeIndex, outcome: Result<Outcome, String>) {
        if let Some(started) = self.started[idx] {
            self.durations[idx] = started.elapsed();
        }
        let package = self.graph.node(idx).id.package.clone();

        match outcome {
            Err(error) => self.fail(idx, error),
            Ok(Outcome::Hashed(Ok(key))) => {
                self.keys.insert(package, key);
                self.succeed(idx);
            }
            Ok(Outcome::Hashed(Err(e))) => {
                self.cache_warning(&package, CacheOp::Hash, &e);
                self.succeed(idx);
            }
            Ok(Outcome::Fetched(Ok(true))) => {
                self.hits.insert(package.clone());
                self.succeed(idx);
                self.scheduler
                    .reporter
                    .report(&TaskEvent::CacheHit { package });
            }
            Ok(Outcome::Fetched(result)) => {
                if let Err(e) = result {
                    self.cache_warning(&package, CacheOp::Fetch, &e);
                }
                self.scheduler
                    .reporter
                    .report(&TaskEvent::CacheMiss { package });
                self.succeed(idx);
            }
            Ok(Outcome::Executed(Ok(()))) => self.succeed(idx),
            Ok(Outcome::Executed(Err(exit))) => self.fail(idx, exit.to_string()),
            Ok(Outcome::Stored(result)) => {
                if let Err(e) = result {
                    self.cache_warning(&package, CacheOp::Put, &e);
                }
                self.succeed(idx);
            }
            Ok(Outcome::Noop) => self.succeed(idx),
        }
    }

    fn cache_warning(&self, package: &str, op: CacheOp, error: &CacheError) {
        warn!(package, %op, error = %error, "cache operation failed, continuing without cache");
        self.scheduler.reporter.report(&TaskEvent::CacheWarning {
            package: package.to_string(),
            op,
            error: error.to_string(),
        });
    }

    /// A ready pipeline node whose package outputs were restored. It is
    /// settled without running once all of its predecessors are done, so
    /// upstream failures still reach it.
    fn restored_from_cache(&self, idx: NodeIndex) -> bool {
        let node = self.graph.node(idx);
        node.kind == NodeKind::Task && self.hits.contains(&node.id.package)
    }

    fn succeed(&mut self, idx: NodeIndex) {
        self.status[idx] = NodeStatus::Succeeded;
        self.scheduler.reporter.report(&TaskEvent::NodeSucceeded {
            id: self.graph.node(idx).id.clone(),
            duration: self.durations[idx],
        });
        self.release(idx);
    }

    /// Count `idx` as done for its dependents, readying those with nothing left
    fn release(&mut self, idx: NodeIndex) {
        let graph = self.graph;
        for &dependent in &graph.node(idx).dependents {
            if !self.selected[dependent] {
                continue;
            }
            self.remaining[dependent] = self.remaining[dependent].saturating_sub(1);
            if self.remaining[dependent] == 0 && self.status[dependent] == NodeStatus::Pending {
                self.status[dependent] = NodeStatus::Ready;
                self.ready.push_back(dependent);
            }
        }
    }

    fn fail(&mut self, idx: NodeIndex, error: String) {
        let id = self.graph.node(idx).id.clone();
        warn!(node = %id, error = %error, "node failed");
        self.scheduler.reporter.report(&TaskEvent::NodeFailed {
            id,
            duration: self.durations[idx],
            error: error.clone(),
        });
        self.status[idx] = NodeStatus::Failed(error);

        let graph = self.graph;
        let mut queue: VecDeque<NodeIndex> = graph.node(idx).dependents.iter().copied().collect();
        while let Some(dependent) = queue.pop_front() {
            if !self.selected[dependent] || self.status[dependent].is_terminal() {
                continue;
            }
            self.skip(dependent, SkipReason::UpstreamFailed);
            queue.extend(graph.node(dependent).dependents.iter().copied());
        }

        if self.scheduler.options.failure_policy == FailurePolicy::BailOut && !self.bailed {
            info!("bailing out after first failure");
            self.bailed = true;
        }
    }

    fn skip(&mut self, idx: NodeIndex, reason: SkipReason) {
        self.status[idx] = NodeStatus::Skipped(reason);
        self.scheduler.reporter.report(&TaskEvent::NodeSkipped {
            id: self.graph.node(idx).id.clone(),
            reason,
        });
    }

    fn finish(self, duration: Duration) -> RunResult {
        let mut status = self.status;
        let nodes = self
            .graph
            .sorted()
            .iter()
            .filter(|&&idx| self.selected[idx])
            .map(|&idx| {
                let node = self.graph.node(idx);
                NodeResult {
                    id: node.id.clone(),
                    kind: node.kind,
                    status: std::mem::replace(&mut status[idx], NodeStatus::Pending),
                    duration: self.durations[idx],
                }
            })
            .collect();

        let result = RunResult {
            nodes,
            aborted: self.aborted,
            duration,
        };

        let succeeded = result.count(|s| *s == NodeStatus::Succeeded);
        let failed = result.count(|s| matches!(s, NodeStatus::Failed(_)));
        let cached = result.count(|s| *s == NodeStatus::Skipped(SkipReason::CacheHit));
        let skipped = result.count(|s| matches!(s, NodeStatus::Skipped(_))) - cached;

        info!(
            total = result.nodes.len(),
            succeeded,
            failed,
            skipped,
            cached,
            aborted = result.aborted,
            "run finished"
        );
        self.scheduler.reporter.report(&TaskEvent::RunCompleted {
            total: result.nodes.len(),
            succeeded,
            failed,
            skipped,
            cached,
            aborted: result.aborted,
            duration,
        });

        result
    }
}
