//! Fluent construction of [`McpServer`].

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::execution::{ExecutionAdapter, ExecutionTracker, ProcessRunner, TaskRunner, UnconfiguredRunner};

use super::core::{McpServer, ServerInfo};

const DEFAULT_EVENT_BUFFER: usize = 1024;

/// Builder for [`McpServer`].
///
/// Without a runner every launched execution fails with a descriptive error.
///
/// ```
/// use agent_mcp::execution::{FnRunner, JobDefinition, ProgressReporter};
/// use agent_mcp::server::McpServer;
/// use serde_json::Value;
///
/// let server = McpServer::builder()
///     .name("my-server")
///     .version("1.0.0")
///     .runner(FnRunner::new(|job: JobDefinition, _: Value, _: ProgressReporter| async move {
///         Ok::<_, anyhow::Error>(job.task)
///     }))
///     .build();
/// assert_eq!(server.info().name, "my-server");
/// ```
pub struct ServerBuilder {
    name: Option<String>,
    version: Option<String>,
    runner: Option<Arc<dyn TaskRunner>>,
    tracker: Option<Arc<ExecutionTracker>>,
    event_buffer: usize,
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("runner", &self.runner.is_some())
            .field("event_buffer", &self.event_buffer)
            .finish()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            name: None,
            version: None,
            runner: None,
            tracker: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    /// Builder pre-filled from configuration.
    ///
    /// Uses a [`ProcessRunner`] rooted at `project_root` when
    /// `execution.runner.command` is set.
    pub fn from_config(config: &ServerConfig) -> Self {
        let builder = Self::new()
            .name(config.name.clone())
            .version(config.version.clone())
            .event_buffer(config.execution.event_buffer)
            .tracker(Arc::new(ExecutionTracker::with_retention(
                config.execution.max_retained,
            )));

        match ProcessRunner::from_config(&config.execution.runner, &config.project_root) {
            Some(runner) => {
                info!(command = ?config.execution.runner.command, "Using process runner");
                builder.runner(runner)
            }
            None => {
                warn!("No runner command configured; launched executions will fail");
                builder
            }
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn runner<R: TaskRunner + 'static>(mut self, runner: R) -> Self {
        self.runner = Some(Arc::new(runner));
        self
    }

    /// Share an existing tracker instead of creating one.
    pub fn tracker(mut self, tracker: Arc<ExecutionTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    pub fn build(self) -> McpServer {
        let info = ServerInfo::new(
            self.name.unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string()),
            self.version.unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
        );
        let tracker = self.tracker.unwrap_or_default();
        let runner = self.runner.unwrap_or_else(|| Arc::new(UnconfiguredRunner));
        McpServer::new(info, ExecutionAdapter::new(tracker, runner, self.event_buffer))
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
