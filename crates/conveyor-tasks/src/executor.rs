//! Task execution contract and the npm-script executor

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, instrument};

use conveyor_core::monorepo::Package;

use crate::reporter::{TaskEvent, TaskReporter};
use crate::task::TaskId;

/// Number of trailing stderr lines kept in a failure message
const STDERR_TAIL: usize = 10;

/// Why a task did not succeed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ExitInfo {
    /// Process exit code, if the task got as far as exiting
    pub code: Option<i32>,
    /// Human-readable failure description
    pub message: String,
}

impl ExitInfo {
    /// Failure with an exit code
    pub fn exited(code: i32, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }

    /// Failure before or without an exit code
    pub fn other(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }
}

/// Per-run context handed to the executor
#[derive(Clone)]
pub struct TaskContext {
    /// Extra arguments passed through to every task
    pub args: Vec<String>,
    /// Sink for output lines
    pub reporter: Arc<dyn TaskReporter>,
}

/// Runs a single pipeline task for a package
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &str, package: &Package, ctx: &TaskContext)
        -> Result<(), ExitInfo>;
}

/// Runs `<client> run <task> [-- args]` in the package root.
///
/// Packages that do not declare the script succeed without spawning
/// anything. Child processes are killed if the task is dropped.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    client: String,
}

impl ShellExecutor {
    /// Create an executor for an npm-compatible client (`npm`, `yarn`, `pnpm`)
    pub fn new(client: impl Into<String>) -> Self {
        Self {
            client: client.into(),
        }
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new("npm")
    }
}

#[async_trait]
impl TaskExecutor for ShellExecutor {
    #[instrument(skip_all, fields(package = %package.name, task = %task))]
    async fn execute(
        &self,
        task: &str,
        package: &Package,
        ctx: &TaskContext,
    ) -> Result<(), ExitInfo> {
        if package.script(task).is_none() {
            debug!("no script, nothing to do");
            return Ok(());
        }

        let mut command = Command::new(&self.client);
        command.arg("run").arg(task);
        if !ctx.args.is_empty() {
            command.arg("--").args(&ctx.args);
        }

        let mut child = command
            .current_dir(&package.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExitInfo::other(format!("Failed to spawn {}: {}", self.client, e)))?;

        let id = TaskId::new(&package.name, task);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (_, stderr_tail) = tokio::join!(
            forward_lines(stdout, &id, false, ctx.reporter.as_ref()),
            forward_lines(stderr, &id, true, ctx.reporter.as_ref()),
        );

        let status = child
            .wait()
            .await
            .map_err(|e| ExitInfo::other(format!("Failed to wait: {}", e)))?;

        if status.success() {
            return Ok(());
        }

        let tail = Vec::from(stderr_tail).join("\n");
        let message = match status.code() {
            Some(code) if tail.is_empty() => format!("Command exited with code {}", code),
            Some(code) => format!("Command exited with code {}: {}", code, tail),
            None => "Command terminated by signal".to_string(),
        };

        Err(ExitInfo {
            code: status.code(),
            message,
        })
    }
}

/// Stream lines to the reporter. For stderr the last [`STDERR_TAIL`]
/// lines are returned; stdout keeps nothing.
async fn forward_lines<R>(
    pipe: Option<R>,
    id: &TaskId,
    is_stderr: bool,
    reporter: &dyn TaskReporter,
) -> VecDeque<String>
where
    R: AsyncRead + Unpin,
{
    let mut tail = VecDeque::with_capacity(if is_stderr { STDERR_TAIL } else { 0 });
    let Some(pipe) = pipe else {
        return tail;
    };

    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        reporter.report(&TaskEvent::Output {
            id: id.clone(),
            line: line.clone(),
            is_stderr,
        });
        if is_stderr {
            if tail.len() == STDERR_TAIL {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }
    tail
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::CollectingReporter;
    use tempfile::TempDir;

    fn context(reporter: Arc<CollectingReporter>, args: &[&str]) -> TaskContext {
        TaskContext {
            args: args.iter().map(|a| a.to_string()).collect(),
            reporter,
        }
    }

    #[tokio::test]
    async fn test_missing_script_is_noop() {
        let temp = TempDir::new().unwrap();
        let package = Package::new("core", temp.path());
        let reporter = Arc::new(CollectingReporter::default());

        // A client that cannot be spawned proves nothing ran
        let executor = ShellExecutor::new("/nonexistent/client");
        executor
            .execute("build", &package, &context(reporter.clone(), &[]))
            .await
            .unwrap();
        assert!(reporter.events().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let temp = TempDir::new().unwrap();
        let package = Package::new("core", temp.path()).with_script("build", "tsc");
        let reporter = Arc::new(CollectingReporter::default());

        let err = ShellExecutor::new("/nonexistent/client")
            .execute("build", &package, &context(reporter, &[]))
            .await
            .unwrap_err();
        assert_eq!(err.code, None);
        assert!(err.message.contains("Failed to spawn"));
    }

    // `sh run <task> -- args` executes a file named `run` in the package root,
    // which stands in for the package manager.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_streamed_and_args_passed() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("run"),
            "echo \"task=$1 sep=$2 arg=$3\"\necho warning >&2\n",
        )
        .unwrap();
        let package = Package::new("core", temp.path()).with_script("build", "tsc");
        let reporter = Arc::new(CollectingReporter::default());

        ShellExecutor::new("sh")
            .execute("build", &package, &context(reporter.clone(), &["--watch"]))
            .await
            .unwrap();

        let lines: Vec<(String, bool)> = reporter
            .events()
            .into_iter()
            .filter_map(|event| match event {
                TaskEvent::Output {
                    line, is_stderr, ..
                } => Some((line, is_stderr)),
                _ => None,
            })
            .collect();
        assert!(lines.contains(&("task=build sep=-- arg=--watch".to_string(), false)));
        assert!(lines.contains(&("warning".to_string(), true)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("run"), "echo broken >&2\nexit 3\n").unwrap();
        let package = Package::new("core", temp.path()).with_script("test", "jest");
        let reporter = Arc::new(CollectingReporter::default());

        let err = ShellExecutor::new("sh")
            .execute("test", &package, &context(reporter, &[]))
            .await
            .unwrap_err();
        assert_eq!(err.code, Some(3));
        assert!(err.message.contains("broken"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failure_keeps_only_stderr_tail() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("run"),
            "i=1\nwhile [ $i -le 30 ]; do echo \"out $i\"; echo \"err $i\" >&2; i=$((i+1)); done\nexit 1\n",
        )
        .unwrap();
        let package = Package::new("core", temp.path()).with_script("build", "tsc");
        let reporter = Arc::new(CollectingReporter::default());

        let err = ShellExecutor::new("sh")
            .execute("build", &package, &context(reporter.clone(), &[]))
            .await
            .unwrap_err();

        assert!(err.message.contains("err 21"));
        assert!(err.message.contains("err 30"));
        assert!(!err.message.contains("err 20"));
        assert!(!err.message.contains("out "));
        // Every line still reaches the reporter
        let streamed = reporter
            .events()
            .iter()
            .filter(|e| matches!(e, TaskEvent::Output { .. }))
            .count();
        assert_eq!(streamed, 60);
    }
}
