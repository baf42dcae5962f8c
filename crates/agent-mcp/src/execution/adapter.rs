//! Execution adapter.
//!
//! Bridges a tool invocation to the [`ExecutionTracker`] and a [`TaskRunner`].
//! [`ExecutionAdapter::execute`] allocates a record, moves it to `Running`
//! and hands the runner to a background task; it returns as soon as the task
//! is dispatched. Every status change goes through the tracker's
//! compare-and-set, and the matching [`ExecutionEvent`] is published while
//! the record is still locked, so listeners see `started` before exactly one
//! terminal event.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ExecutionError;
use crate::sanitize::sanitize_message;
use crate::transport::ConnectionId;

use super::events::{ExecutionEvent, ExecutionEventKind};
use super::runner::{JobDefinition, ProgressReporter, TaskRunner};
use super::tracker::{ExecutionId, ExecutionRecord, ExecutionStatus, ExecutionTracker, RecordPatch};

/// Callback invoked with each new progress percentage.
pub type ProgressCallback = Arc<dyn Fn(u8) + Send + Sync>;

/// Per-call options for [`ExecutionAdapter::execute`].
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    pub on_progress: Option<ProgressCallback>,
    /// Connection the request came from; copied onto every event
    pub origin: Option<ConnectionId>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_progress(mut self, callback: impl Fn(u8) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn origin(mut self, origin: impl Into<ConnectionId>) -> Self {
        self.origin = Some(origin.into());
        self
    }
}

impl std::fmt::Debug for ExecuteOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecuteOptions")
            .field("on_progress", &self.on_progress.is_some())
            .field("origin", &self.origin)
            .finish()
    }
}

/// Final result of one execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    pub execution_id: ExecutionId,
    pub success: bool,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionOutcome {
    pub fn from_record(record: &ExecutionRecord) -> Self {
        Self {
            execution_id: record.execution_id.clone(),
            success: record.status == ExecutionStatus::Completed,
            status: record.status,
            output: record.output.clone(),
            error: record.error.clone(),
        }
    }
}

/// Returned by [`ExecutionAdapter::execute`] once the task is running.
#[derive(Debug)]
pub struct ExecutionHandle {
    execution_id: ExecutionId,
    outcome: oneshot::Receiver<ExecutionOutcome>,
    tracker: Arc<ExecutionTracker>,
}

impl ExecutionHandle {
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Wait for the execution to reach a terminal state.
    pub async fn outcome(self) -> ExecutionOutcome {
        match self.outcome.await {
            Ok(outcome) => outcome,
            // driver went away with the runtime; report what the tracker knows
            Err(_) => match self.tracker.get(&self.execution_id) {
                Some(record) => ExecutionOutcome::from_record(&record),
                None => ExecutionOutcome {
                    execution_id: self.execution_id,
                    success: false,
                    status: ExecutionStatus::Failed,
                    output: None,
                    error: Some("execution aborted".to_string()),
                },
            },
        }
    }
}

struct RunningExecution {
    token: CancellationToken,
    origin: Option<ConnectionId>,
}

struct Inner {
    tracker: Arc<ExecutionTracker>,
    runner: Arc<dyn TaskRunner>,
    events: broadcast::Sender<ExecutionEvent>,
    running: DashMap<ExecutionId, RunningExecution>,
}

impl Inner {
    fn publish(&self, kind: ExecutionEventKind, record: &ExecutionRecord, origin: &Option<ConnectionId>) {
        // no subscribers is fine
        let _ = self
            .events
            .send(ExecutionEvent::from_record(kind, record, origin.clone()));
    }

    /// Running -> `next`. Returns the committed record, or `None` when
    /// something else already finished it.
    fn finish(
        &self,
        id: &str,
        next: ExecutionStatus,
        patch: RecordPatch,
        origin: &Option<ConnectionId>,
    ) -> Option<ExecutionRecord> {
        let kind = ExecutionEventKind::for_terminal(next)?;
        self.tracker
            .compare_and_transition(id, ExecutionStatus::Running, next, patch, |record| {
                self.publish(kind, record, origin)
            })
            .ok()
    }
}

/// Runs jobs asynchronously and tracks them.
///
/// Cheap to clone; clones share the tracker, runner and event bus.
#[derive(Clone)]
pub struct ExecutionAdapter {
    inner: Arc<Inner>,
}

impl ExecutionAdapter {
    pub fn new(tracker: Arc<ExecutionTracker>, runner: Arc<dyn TaskRunner>, event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self {
            inner: Arc::new(Inner {
                tracker,
                runner,
                events,
                running: DashMap::new(),
            }),
        }
    }

    pub fn tracker(&self) -> &Arc<ExecutionTracker> {
        &self.inner.tracker
    }

    /// Subscribe to lifecycle events of every execution.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.inner.events.subscribe()
    }

    /// Number of executions still running.
    pub fn running_count(&self) -> usize {
        self.inner.running.len()
    }

    /// Start `job` and return once it is running.
    ///
    /// Must be called within a Tokio runtime. The task's result is available
    /// through [`ExecutionHandle::outcome`] and the tracker.
    pub fn execute(
        &self,
        job: JobDefinition,
        context: Value,
        options: ExecuteOptions,
    ) -> Result<ExecutionHandle, ExecutionError> {
        let inner = &self.inner;
        let id = inner
            .tracker
            .create_with_origin(&job, context.clone(), options.origin.clone());
        let token = CancellationToken::new();
        inner.running.insert(
            id.clone(),
            RunningExecution {
                token: token.clone(),
                origin: options.origin.clone(),
            },
        );

        let started = inner.tracker.compare_and_transition(
            &id,
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            RecordPatch::started_now(),
            |record| inner.publish(ExecutionEventKind::Started, record, &options.origin),
        );
        if let Err(e) = started {
            inner.running.remove(&id);
            return Err(e);
        }

        let (tx, rx) = oneshot::channel();
        tokio::spawn(drive(Arc::clone(inner), id.clone(), job, context, token, options, tx));
        info!(execution_id = %id, "Execution started");

        Ok(ExecutionHandle {
            execution_id: id,
            outcome: rx,
            tracker: Arc::clone(&inner.tracker),
        })
    }

    /// Cancel a running execution.
    ///
    /// Returns false, without side effects, when the id is unknown or the
    /// execution is not `Running`.
    pub fn cancel(&self, id: &str) -> bool {
        let inner = &self.inner;
        let origin = inner.running.get(id).and_then(|r| r.origin.clone());
        let cancelled = inner.finish(
            id,
            ExecutionStatus::Cancelled,
            RecordPatch::completed_now(),
            &origin,
        );
        if cancelled.is_none() {
            debug!(execution_id = %id, "Cancel ignored");
            return false;
        }
        if let Some((_, running)) = inner.running.remove(id) {
            running.token.cancel();
        }
        info!(execution_id = %id, "Execution cancelled");
        true
    }

    /// Cancel everything still running. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<ExecutionId> = self.inner.running.iter().map(|r| r.key().clone()).collect();
        ids.iter().filter(|id| self.cancel(id)).count()
    }
}

impl std::fmt::Debug for ExecutionAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionAdapter")
            .field("executions", &self.inner.tracker.len())
            .field("running", &self.inner.running.len())
            .finish()
    }
}

async fn drive(
    inner: Arc<Inner>,
    id: ExecutionId,
    job: JobDefinition,
    context: Value,
    token: CancellationToken,
    options: ExecuteOptions,
    tx: oneshot::Sender<ExecutionOutcome>,
) {
    let origin = options.origin.clone();
    let reporter = {
        let inner = Arc::clone(&inner);
        let id = id.clone();
        let origin = origin.clone();
        let on_progress = options.on_progress.clone();
        ProgressReporter::new(move |percent| {
            let emitted = inner.tracker.inspect_if(&id, ExecutionStatus::Running, |record| {
                let event = ExecutionEvent::from_record(ExecutionEventKind::Progress, record, origin.clone())
                    .with_progress(percent);
                let _ = inner.events.send(event);
            });
            if emitted {
                if let Some(callback) = &on_progress {
                    callback(percent);
                }
            }
        })
    };

    let result = tokio::select! {
        biased;
        _ = token.cancelled() => None,
        result = AssertUnwindSafe(inner.runner.run(&job, &context, reporter.clone())).catch_unwind() => Some(result),
    };

    let committed = match result {
        Some(Ok(Ok(output))) => {
            reporter.finish();
            let record = inner.finish(
                &id,
                ExecutionStatus::Completed,
                RecordPatch::completed_now().output(output),
                &origin,
            );
            if record.is_some() {
                info!(execution_id = %id, "Execution completed");
            }
            record
        }
        Some(Ok(Err(e))) => {
            let reason = failure_reason(&ExecutionError::Task(format!("{:#}", e)).to_string());
            fail(&inner, &id, reason, &origin)
        }
        Some(Err(panic)) => {
            let reason = failure_reason(&format!("task panicked: {}", panic_message(&*panic)));
            fail(&inner, &id, reason, &origin)
        }
        None => {
            debug!(execution_id = %id, "Runner dropped after cancellation");
            None
        }
    };

    inner.running.remove(&id);
    // a finished record may already be evicted; the committed copy is authoritative
    let outcome = match committed.or_else(|| inner.tracker.get(&id)) {
        Some(record) => ExecutionOutcome::from_record(&record),
        None => ExecutionOutcome {
            execution_id: id.clone(),
            success: false,
            status: ExecutionStatus::Failed,
            output: None,
            error: Some("execution record missing".to_string()),
        },
    };
    // the handle may have been dropped
    let _ = tx.send(outcome);
}

fn fail(
    inner: &Inner,
    id: &str,
    reason: String,
    origin: &Option<ConnectionId>,
) -> Option<ExecutionRecord> {
    let record = inner.finish(
        id,
        ExecutionStatus::Failed,
        RecordPatch::completed_now().error(reason.clone()),
        origin,
    );
    if record.is_some() {
        warn!(execution_id = %id, "Execution failed: {}", reason);
    }
    record
}

fn failure_reason(raw: &str) -> String {
    let reason = sanitize_message(raw);
    if reason.is_empty() {
        "task failed".to_string()
    } else {
        reason
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::FnRunner;
    use anyhow::anyhow;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashSet;
    use std::time::{Duration, Instant};

    fn sleeping_adapter() -> ExecutionAdapter {
        let runner = FnRunner::new(|job: JobDefinition, ctx: Value, progress: ProgressReporter| async move {
            let ms = ctx.get("sleepMs").and_then(Value::as_u64).unwrap_or(0);
            progress.report(50);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            if ctx.get("fail").and_then(Value::as_bool).unwrap_or(false) {
                return Err(anyhow!("agent {} crashed", job.agent));
            }
            Ok(format!("{} finished", job.task))
        });
        ExecutionAdapter::new(Arc::new(ExecutionTracker::new()), Arc::new(runner), 256)
    }

    fn drain(rx: &mut broadcast::Receiver<ExecutionEvent>, id: &str) -> Vec<ExecutionEventKind> {
        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if event.execution_id == id {
                kinds.push(event.kind);
            }
        }
        kinds
    }

    #[tokio::test]
    async fn test_execute_returns_before_task_completes() {
        let adapter = sleeping_adapter();
        for ms in [50u64, 500] {
            let began = Instant::now();
            let handle = adapter
                .execute(JobDefinition::new("a", "t"), json!({"sleepMs": ms}), ExecuteOptions::new())
                .unwrap();
            assert!(began.elapsed() < Duration::from_millis(40));
            let record = adapter.tracker().get(handle.execution_id()).unwrap();
            assert_eq!(record.status, ExecutionStatus::Running);
            assert!(record.started_at.is_some());
            assert!(handle.outcome().await.success);
        }
    }

    #[tokio::test]
    async fn test_success_outcome_and_record_agree() {
        let adapter = sleeping_adapter();
        let handle = adapter
            .execute(JobDefinition::new("a", "build"), Value::Null, ExecuteOptions::new())
            .unwrap();
        let id = handle.execution_id().to_string();
        let outcome = handle.outcome().await;
        assert!(outcome.success);
        assert_eq!(outcome.output.as_deref(), Some("build finished"));

        let record = adapter.tracker().get(&id).unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert!(record.completed_at.is_some());
        assert_eq!(adapter.running_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_after_delay() {
        let adapter = sleeping_adapter();
        let handle = adapter
            .execute(
                JobDefinition::new("flaky", "t"),
                json!({"sleepMs": 30, "fail": true}),
                ExecuteOptions::new(),
            )
            .unwrap();
        let id = handle.execution_id().to_string();
        let outcome = handle.outcome().await;
        assert!(!outcome.success);
        assert_eq!(outcome.status, ExecutionStatus::Failed);

        let record = adapter.tracker().get(&id).unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        let error = record.error.unwrap();
        assert!(error.starts_with("task failed: "), "got {error}");
        assert!(error.contains("flaky crashed"), "got {error}");
        assert_eq!(outcome.error.as_deref(), Some(error.as_str()));
    }

    #[tokio::test]
    async fn test_outcome_survives_eviction() {
        let runner = FnRunner::new(|job: JobDefinition, _ctx: Value, _p: ProgressReporter| async move {
            Ok::<_, anyhow::Error>(format!("{} ok", job.task))
        });
        let adapter = ExecutionAdapter::new(Arc::new(ExecutionTracker::with_retention(1)), Arc::new(runner), 16);
        let handles: Vec<_> = (0..5)
            .map(|i| {
                adapter
                    .execute(JobDefinition::new("a", format!("t{i}")), Value::Null, ExecuteOptions::new())
                    .unwrap()
            })
            .collect();
        for (i, handle) in handles.into_iter().enumerate() {
            let outcome = handle.outcome().await;
            assert!(outcome.success);
            assert_eq!(outcome.output, Some(format!("t{i} ok")));
        }
        assert_eq!(adapter.tracker().len(), 1);
    }

    #[tokio::test]
    async fn test_panicking_runner_fails_execution() {
        let runner = FnRunner::new(|_job: JobDefinition, _ctx: Value, _p: ProgressReporter| async move {
            if true {
                panic!("runner blew up");
            }
            Ok::<_, anyhow::Error>(String::new())
        });
        let adapter = ExecutionAdapter::new(Arc::new(ExecutionTracker::new()), Arc::new(runner), 16);
        let outcome = adapter
            .execute(JobDefinition::new("a", "t"), Value::Null, ExecuteOptions::new())
            .unwrap()
            .outcome()
            .await;
        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert!(outcome.error.unwrap().contains("runner blew up"));
    }

    #[tokio::test]
    async fn test_failure_reason_is_sanitized() {
        let runner = FnRunner::new(|_job: JobDefinition, _ctx: Value, _p: ProgressReporter| async move {
            Err::<String, _>(anyhow!("cannot open /home/alice/.ssh/id_rsa"))
        });
        let adapter = ExecutionAdapter::new(Arc::new(ExecutionTracker::new()), Arc::new(runner), 16);
        let outcome = adapter
            .execute(JobDefinition::new("a", "t"), Value::Null, ExecuteOptions::new())
            .unwrap()
            .outcome()
            .await;
        let error = outcome.error.unwrap();
        assert!(!error.contains("/home/alice"), "got {error}");
        assert!(error.contains("cannot open"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_executes_have_distinct_ids() {
        let adapter = sleeping_adapter();
        let handles = futures::future::join_all((0..50).map(|i| {
            let adapter = adapter.clone();
            async move {
                adapter
                    .execute(JobDefinition::new("a", format!("t{i}")), json!({"sleepMs": 10}), ExecuteOptions::new())
                    .unwrap()
            }
        }))
        .await;
        let ids: HashSet<String> = handles.iter().map(|h| h.execution_id().to_string()).collect();
        assert_eq!(ids.len(), 50);

        for handle in handles {
            let outcome = handle.outcome().await;
            assert!(outcome.success);
        }
        assert_eq!(adapter.tracker().len(), 50);
    }

    #[tokio::test]
    async fn test_lifecycle_events_in_order() {
        let adapter = sleeping_adapter();
        let mut rx = adapter.subscribe();
        let handle = adapter
            .execute(JobDefinition::new("a", "t"), Value::Null, ExecuteOptions::new().origin("conn-7"))
            .unwrap();
        let id = handle.execution_id().to_string();
        handle.outcome().await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, ExecutionEventKind::Started);
        assert_eq!(first.origin.as_deref(), Some("conn-7"));

        let mut kinds = vec![first.kind];
        kinds.extend(drain(&mut rx, &id));
        assert_eq!(
            kinds,
            vec![
                ExecutionEventKind::Started,
                ExecutionEventKind::Progress,
                ExecutionEventKind::Progress,
                ExecutionEventKind::Completed,
            ]
        );
    }

    #[tokio::test]
    async fn test_progress_terminates_at_100() {
        let adapter = sleeping_adapter();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handle = adapter
            .execute(
                JobDefinition::new("a", "t"),
                Value::Null,
                ExecuteOptions::new().on_progress(move |p| sink.lock().push(p)),
            )
            .unwrap();
        assert!(handle.outcome().await.success);
        assert_eq!(*seen.lock(), vec![50, 100]);
    }

    #[tokio::test]
    async fn test_cancel_running_execution() {
        let adapter = sleeping_adapter();
        let mut rx = adapter.subscribe();
        let handle = adapter
            .execute(JobDefinition::new("a", "t"), json!({"sleepMs": 5_000}), ExecuteOptions::new())
            .unwrap();
        let id = handle.execution_id().to_string();

        assert!(adapter.cancel(&id));
        let outcome = tokio::time::timeout(Duration::from_secs(1), handle.outcome())
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.status, ExecutionStatus::Cancelled);

        let record = adapter.tracker().get(&id).unwrap();
        assert_eq!(record.status, ExecutionStatus::Cancelled);
        assert!(record.completed_at.is_some());

        let kinds = drain(&mut rx, &id);
        let terminal: Vec<_> = kinds.iter().filter(|k| k.is_terminal()).collect();
        assert_eq!(terminal, vec![&ExecutionEventKind::Cancelled]);
        assert_eq!(kinds.first(), Some(&ExecutionEventKind::Started));
    }

    #[tokio::test]
    async fn test_cancel_unknown_or_terminal_is_noop() {
        let adapter = sleeping_adapter();
        let mut rx = adapter.subscribe();
        assert!(!adapter.cancel("exec_missing"));

        let handle = adapter
            .execute(JobDefinition::new("a", "t"), Value::Null, ExecuteOptions::new())
            .unwrap();
        let id = handle.execution_id().to_string();
        handle.outcome().await;
        let _ = drain(&mut rx, &id);

        assert!(!adapter.cancel(&id));
        assert!(!adapter.cancel(&id));
        assert!(rx.try_recv().is_err());
        assert_eq!(adapter.tracker().get(&id).unwrap().status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_context_is_passed_through_untouched() {
        let adapter = sleeping_adapter();
        let context = json!({
            "nested": {"deep": [1, [2, [3, {"x": null}]]]},
            "empty": {},
            "missing": null
        });
        let handle = adapter
            .execute(JobDefinition::new("a", "t"), context.clone(), ExecuteOptions::new())
            .unwrap();
        let id = handle.execution_id().to_string();
        assert!(handle.outcome().await.success);
        assert_eq!(adapter.tracker().get(&id).unwrap().context, context);
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let adapter = sleeping_adapter();
        let handles: Vec<_> = (0..3)
            .map(|_| {
                adapter
                    .execute(JobDefinition::new("a", "t"), json!({"sleepMs": 5_000}), ExecuteOptions::new())
                    .unwrap()
            })
            .collect();
        assert_eq!(adapter.cancel_all(), 3);
        for handle in handles {
            assert_eq!(handle.outcome().await.status, ExecutionStatus::Cancelled);
        }
        assert_eq!(adapter.running_count(), 0);
    }
}
