//! Task runners: the code that actually carries out an execution.
//!
//! The adapter only needs [`TaskRunner::run`] to resolve to the task's output
//! or an error. [`ProcessRunner`] spawns a configured command;
//! [`FnRunner`] wraps a closure for embedding and tests.

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context as _};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

use crate::config::RunnerConfig;
use crate::sanitize::tail;

/// What to run: an agent name and the task handed to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub agent: String,
    pub task: String,
}

impl JobDefinition {
    pub fn new(agent: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            task: task.into(),
        }
    }
}

/// Progress sink handed to a runner.
///
/// Values are clamped to 100 and only strictly increasing values are
/// forwarded, so listeners see a monotonic sequence.
#[derive(Clone)]
pub struct ProgressReporter {
    last: Arc<AtomicU8>,
    sink: Arc<dyn Fn(u8) + Send + Sync>,
}

impl ProgressReporter {
    pub fn new(sink: impl Fn(u8) + Send + Sync + 'static) -> Self {
        Self {
            last: Arc::new(AtomicU8::new(0)),
            sink: Arc::new(sink),
        }
    }

    /// A reporter that discards everything.
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn report(&self, percent: u8) {
        let percent = percent.min(100);
        let previous = self.last.fetch_max(percent, Ordering::SeqCst);
        if percent > previous {
            (self.sink)(percent);
        }
    }

    /// Report 100 unless it was already reported.
    pub fn finish(&self) {
        self.report(100);
    }

    pub fn last(&self) -> u8 {
        self.last.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("last", &self.last())
            .finish_non_exhaustive()
    }
}

/// Carries out one execution.
///
/// The future may be dropped before it completes when the execution is
/// cancelled; implementations should release resources on drop.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(
        &self,
        job: &JobDefinition,
        context: &Value,
        progress: ProgressReporter,
    ) -> anyhow::Result<String>;
}

/// Runner backed by an async closure.
///
/// ```
/// use agent_mcp::execution::{FnRunner, JobDefinition, ProgressReporter, TaskRunner};
/// use serde_json::Value;
///
/// # tokio_test::block_on(async {
/// let runner = FnRunner::new(|job: JobDefinition, _ctx: Value, _p: ProgressReporter| async move {
///     Ok::<_, anyhow::Error>(format!("{} done", job.agent))
/// });
/// let out = runner
///     .run(&JobDefinition::new("tester", "t"), &Value::Null, ProgressReporter::noop())
///     .await
///     .unwrap();
/// assert_eq!(out, "tester done");
/// # });
/// ```
pub struct FnRunner<F> {
    f: F,
}

impl<F> FnRunner<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> TaskRunner for FnRunner<F>
where
    F: Fn(JobDefinition, Value, ProgressReporter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
{
    async fn run(
        &self,
        job: &JobDefinition,
        context: &Value,
        progress: ProgressReporter,
    ) -> anyhow::Result<String> {
        (self.f)(job.clone(), context.clone(), progress).await
    }
}

/// Runner used when no command is configured; every execution fails.
#[derive(Debug, Default)]
pub struct UnconfiguredRunner;

#[async_trait]
impl TaskRunner for UnconfiguredRunner {
    async fn run(
        &self,
        job: &JobDefinition,
        _context: &Value,
        _progress: ProgressReporter,
    ) -> anyhow::Result<String> {
        bail!(
            "no runner command configured for agent '{}' (set execution.runner.command)",
            job.agent
        )
    }
}

/// Runs each execution as a child process.
///
/// `{agent}` and `{task}` in the argument list are substituted. The child
/// gets `{"agent", "task", "context"}` as JSON on stdin, runs in the project
/// root, and is killed if the execution is cancelled. Stdout (bounded)
/// becomes the output; a non-zero exit fails with the tail of stderr.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    command: String,
    args: Vec<String>,
    working_dir: PathBuf,
    max_output_bytes: usize,
}

impl ProcessRunner {
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        let defaults = RunnerConfig::default();
        Self {
            command: command.into(),
            args: defaults.args,
            working_dir: working_dir.into(),
            max_output_bytes: defaults.max_output_bytes,
        }
    }

    /// Build from config; `None` when no command is set.
    pub fn from_config(config: &RunnerConfig, working_dir: impl Into<PathBuf>) -> Option<Self> {
        let command = config.command.as_ref()?;
        Some(Self {
            command: command.clone(),
            args: config.args.clone(),
            working_dir: working_dir.into(),
            max_output_bytes: config.max_output_bytes,
        })
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }

    fn render_args(&self, job: &JobDefinition) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace("{agent}", &job.agent).replace("{task}", &job.task))
            .collect()
    }
}

#[async_trait]
impl TaskRunner for ProcessRunner {
    async fn run(
        &self,
        job: &JobDefinition,
        context: &Value,
        progress: ProgressReporter,
    ) -> anyhow::Result<String> {
        let mut child = Command::new(&self.command)
            .args(self.render_args(job))
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn runner for agent '{}'", job.agent))?;
        debug!(agent = %job.agent, pid = ?child.id(), "Runner process spawned");
        progress.report(5);

        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(&json!({
                "agent": job.agent,
                "task": job.task,
                "context": context,
            }))?;
            // the child may exit without reading stdin
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!("Runner stdin closed early: {}", e);
                }
            });
        }

        let stdout = child.stdout.take().context("runner stdout not captured")?;
        let stderr = child.stderr.take().context("runner stderr not captured")?;
        let limit = self.max_output_bytes;

        let (stdout, stderr, status) = tokio::join!(
            read_bounded(stdout, limit, Keep::Head),
            read_bounded(stderr, limit, Keep::Tail),
            child.wait(),
        );
        let status = status.context("failed to wait for runner")?;
        let stdout = stdout.context("failed to read runner stdout")?;
        let stderr = stderr.context("failed to read runner stderr")?;

        if !status.success() {
            let stderr = stderr.trim();
            let detail = tail(stderr, 2048);
            if detail.is_empty() {
                bail!("runner exited with {}", status);
            }
            bail!("runner exited with {}: {}", status, detail);
        }
        Ok(stdout)
    }
}

#[derive(Clone, Copy)]
enum Keep {
    Head,
    Tail,
}

/// Drain `reader` completely while keeping at most `limit` bytes.
async fn read_bounded<R>(mut reader: R, limit: usize, keep: Keep) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        match keep {
            Keep::Head => {
                let room = limit.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
            Keep::Tail => {
                kept.extend_from_slice(&chunk[..n]);
                if kept.len() > limit {
                    let excess = kept.len() - limit;
                    kept.drain(..excess);
                }
            }
        }
    }
    Ok(String::from_utf8_lossy(&kept).into_owned())
}
