//! Execution tracker.
//!
//! Owns the map from execution id to [`ExecutionRecord`]. Records are created
//! in `Pending` and change only through [`ExecutionTracker::transition`] (or
//! its compare-and-set form), which holds the record's map entry locked for
//! the whole check-then-write so two racing completions cannot both win.
//!
//! Terminal records are retained up to a cap; past it the oldest finished
//! records are evicted. Pending and running records are never evicted.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ExecutionError;
use crate::transport::ConnectionId;

use super::runner::JobDefinition;

/// Opaque identifier of one execution.
pub type ExecutionId = String;

/// Terminal records kept by default.
pub const DEFAULT_MAX_RETAINED: usize = 10_000;

/// Execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// `Completed`, `Failed` and `Cancelled` are final.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Whether `self -> next` is a legal move.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running | Failed | Cancelled) | (Running, Completed | Failed | Cancelled)
        )
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            "cancelled" | "canceled" => Some(ExecutionStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Tracked state of one dispatched task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub execution_id: ExecutionId,
    pub agent: String,
    pub task: String,
    /// Caller data passed through untouched
    pub context: Value,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Connection that launched the execution
    #[serde(skip)]
    pub origin: Option<ConnectionId>,
}

/// Fields written alongside a status change.
///
/// Unset fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl RecordPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started_now() -> Self {
        Self {
            started_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn completed_now() -> Self {
        Self {
            completed_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// In-memory map of execution records.
#[derive(Debug)]
pub struct ExecutionTracker {
    records: DashMap<ExecutionId, ExecutionRecord>,
    /// Terminal ids in completion order
    finished: Mutex<VecDeque<ExecutionId>>,
    max_retained: usize,
}

impl Default for ExecutionTracker {
    fn default() -> Self {
        Self::with_retention(DEFAULT_MAX_RETAINED)
    }
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker that keeps at most `max_retained` terminal records.
    pub fn with_retention(max_retained: usize) -> Self {
        Self {
            records: DashMap::new(),
            finished: Mutex::new(VecDeque::new()),
            max_retained: max_retained.max(1),
        }
    }

    pub fn max_retained(&self) -> usize {
        self.max_retained
    }

    /// Allocate a new `Pending` record and return its id.
    pub fn create(&self, job: &JobDefinition, context: Value) -> ExecutionId {
        self.create_with_origin(job, context, None)
    }

    /// Like [`create`](Self::create), remembering the launching connection.
    pub fn create_with_origin(
        &self,
        job: &JobDefinition,
        context: Value,
        origin: Option<ConnectionId>,
    ) -> ExecutionId {
        let id = format!("exec_{}", Uuid::new_v4().simple());
        let record = ExecutionRecord {
            execution_id: id.clone(),
            agent: job.agent.clone(),
            task: job.task.clone(),
            context,
            status: ExecutionStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            output: None,
            error: None,
            origin,
        };
        self.records.insert(id.clone(), record);
        debug!(execution_id = %id, agent = %job.agent, "Execution created");
        id
    }

    /// Snapshot of one record.
    pub fn get(&self, id: &str) -> Option<ExecutionRecord> {
        self.records.get(id).map(|r| r.value().clone())
    }

    /// Snapshot of every record, newest first.
    pub fn list(&self) -> Vec<ExecutionRecord> {
        let mut records: Vec<ExecutionRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Move a record to `next`, merging `patch`.
    ///
    /// Rejected (and logged) when the record is unknown or terminal, when the
    /// move is illegal, when `Running` lacks `startedAt`, or when a terminal
    /// state lacks `completedAt`. A rejected transition changes nothing.
    pub fn transition(
        &self,
        id: &str,
        next: ExecutionStatus,
        patch: RecordPatch,
    ) -> Result<ExecutionRecord, ExecutionError> {
        let record = self
            .apply(id, None, next, patch, |_| {})
            .inspect_err(|e| warn!(execution_id = %id, "Rejected transition: {}", e))?;
        self.retire(&record);
        Ok(record)
    }

    /// Like [`transition`](Self::transition), but only from `expected`.
    ///
    /// `on_commit` runs while the record is still locked, after the write, so
    /// anything it emits is ordered with respect to every other transition of
    /// the same record. It must not call back into the tracker.
    pub fn compare_and_transition<F>(
        &self,
        id: &str,
        expected: ExecutionStatus,
        next: ExecutionStatus,
        patch: RecordPatch,
        on_commit: F,
    ) -> Result<ExecutionRecord, ExecutionError>
    where
        F: FnOnce(&ExecutionRecord),
    {
        let record = self
            .apply(id, Some(expected), next, patch, on_commit)
            .inspect_err(|e| debug!(execution_id = %id, "Transition not applied: {}", e))?;
        self.retire(&record);
        Ok(record)
    }

    /// Queue a finished record for eviction and drop the oldest past the cap.
    ///
    /// Runs after the record's entry lock is released.
    fn retire(&self, record: &ExecutionRecord) {
        if !record.status.is_terminal() {
            return;
        }
        let evicted: Vec<ExecutionId> = {
            let mut finished = self.finished.lock();
            finished.push_back(record.execution_id.clone());
            let excess = finished.len().saturating_sub(self.max_retained);
            finished.drain(..excess).collect()
        };
        for id in evicted {
            if self.records.remove_if(&id, |_, r| r.status.is_terminal()).is_some() {
                debug!(execution_id = %id, "Evicted finished execution");
            }
        }
    }

    /// Run `f` on the record only if it is currently in `status`, holding the
    /// record locked meanwhile. Returns whether `f` ran.
    pub fn inspect_if<F>(&self, id: &str, status: ExecutionStatus, f: F) -> bool
    where
        F: FnOnce(&ExecutionRecord),
    {
        match self.records.get(id) {
            Some(record) if record.status == status => {
                f(record.value());
                true
            }
            _ => false,
        }
    }

    fn apply<F>(
        &self,
        id: &str,
        expected: Option<ExecutionStatus>,
        next: ExecutionStatus,
        patch: RecordPatch,
        on_commit: F,
    ) -> Result<ExecutionRecord, ExecutionError>
    where
        F: FnOnce(&ExecutionRecord),
    {
        let mut entry = self
            .records
            .get_mut(id)
            .ok_or_else(|| ExecutionError::NotFound(id.to_string()))?;
        let record = entry.value_mut();
        let current = record.status;

        if current.is_terminal() {
            return Err(ExecutionError::Terminal {
                id: id.to_string(),
                status: current,
            });
        }
        if let Some(expected) = expected {
            if current != expected {
                return Err(ExecutionError::Conflict {
                    id: id.to_string(),
                    expected,
                    actual: current,
                });
            }
        }
        if !current.can_transition_to(next) {
            return Err(ExecutionError::IllegalTransition {
                id: id.to_string(),
                from: current,
                to: next,
            });
        }

        let started_at = patch.started_at.or(record.started_at);
        let completed_at = patch.completed_at.or(record.completed_at);
        if next == ExecutionStatus::Running && started_at.is_none() {
            return Err(ExecutionError::MissingTimestamp {
                id: id.to_string(),
                to: next,
                field: "startedAt",
            });
        }
        if next.is_terminal() && completed_at.is_none() {
            return Err(ExecutionError::MissingTimestamp {
                id: id.to_string(),
                to: next,
                field: "completedAt",
            });
        }

        record.status = next;
        record.started_at = started_at;
        record.completed_at = completed_at;
        if let Some(output) = patch.output {
            record.output = Some(output);
        }
        if let Some(error) = patch.error {
            record.error = Some(error);
        }
        debug!(execution_id = %id, from = %current, to = %next, "Execution transitioned");

        on_commit(record);
        Ok(record.clone())
    }
}
