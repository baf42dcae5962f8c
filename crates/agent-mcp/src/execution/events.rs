//! Execution lifecycle events.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::transport::ConnectionId;

use super::tracker::{ExecutionId, ExecutionRecord, ExecutionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionEventKind {
    Started,
    Progress,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionEventKind {
    /// Event name as published (`execution:started`, ...).
    pub fn name(self) -> &'static str {
        match self {
            Self::Started => "execution:started",
            Self::Progress => "execution:progress",
            Self::Completed => "execution:completed",
            Self::Failed => "execution:failed",
            Self::Cancelled => "execution:cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// The terminal event matching a terminal status.
    pub fn for_terminal(status: ExecutionStatus) -> Option<Self> {
        match status {
            ExecutionStatus::Completed => Some(Self::Completed),
            ExecutionStatus::Failed => Some(Self::Failed),
            ExecutionStatus::Cancelled => Some(Self::Cancelled),
            ExecutionStatus::Pending | ExecutionStatus::Running => None,
        }
    }
}

/// One lifecycle event of one execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    #[serde(rename = "event")]
    pub kind: ExecutionEventKind,
    pub execution_id: ExecutionId,
    pub agent: String,
    pub status: ExecutionStatus,
    pub timestamp: DateTime<Utc>,
    /// Connection that launched the execution, if any
    #[serde(skip)]
    pub origin: Option<ConnectionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionEvent {
    pub fn from_record(
        kind: ExecutionEventKind,
        record: &ExecutionRecord,
        origin: Option<ConnectionId>,
    ) -> Self {
        Self {
            kind,
            execution_id: record.execution_id.clone(),
            agent: record.agent.clone(),
            status: record.status,
            timestamp: Utc::now(),
            origin,
            progress: None,
            output: record.output.clone(),
            error: record.error.clone(),
        }
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}
