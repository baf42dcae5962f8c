//! Tools exposed through `tools/list` and `tools/call`.

use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{McpError, RoutingError, ValidationError};
use crate::execution::{ExecuteOptions, ExecutionAdapter, ExecutionStatus, JobDefinition};

static AGENT_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap());

/// Input of `launch_agent`
#[derive(Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LaunchAgentInput {
    /// Agent to run (letters, digits, `_` and `-`, at most 64 characters)
    pub agent: String,

    /// Task handed to the agent
    pub task: String,

    /// Arbitrary data passed through to the agent unchanged
    #[serde(default)]
    pub context: Option<Value>,
}

/// Input of `get_execution_status`
#[derive(Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionIdInput {
    /// Identifier returned by `launch_agent`
    pub execution_id: String,
}

/// Input of `list_executions`
#[derive(Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ListExecutionsInput {
    /// Only return executions in this status (pending, running, completed, failed, cancelled)
    #[serde(default)]
    pub status: Option<String>,
}

/// Params of `tools/call`
#[derive(Debug, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Option<Value>,
}

/// The fixed tool table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolName {
    LaunchAgent,
    GetExecutionStatus,
    CancelExecution,
    ListExecutions,
}

impl ToolName {
    pub const ALL: [ToolName; 4] = [
        ToolName::LaunchAgent,
        ToolName::GetExecutionStatus,
        ToolName::CancelExecution,
        ToolName::ListExecutions,
    ];

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.as_str() == name)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ToolName::LaunchAgent => "launch_agent",
            ToolName::GetExecutionStatus => "get_execution_status",
            ToolName::CancelExecution => "cancel_execution",
            ToolName::ListExecutions => "list_executions",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ToolName::LaunchAgent => {
                "Launch an agent on a task in the background. Returns an executionId for tracking."
            }
            ToolName::GetExecutionStatus => {
                "Get the status, timestamps, output and error of an execution."
            }
            ToolName::CancelExecution => {
                "Cancel a running execution. Returns whether it was cancelled."
            }
            ToolName::ListExecutions => "List executions, newest first, optionally filtered by status.",
        }
    }

    pub fn input_schema(self) -> Value {
        let schema = match self {
            ToolName::LaunchAgent => serde_json::to_value(schemars::schema_for!(LaunchAgentInput)),
            ToolName::GetExecutionStatus | ToolName::CancelExecution => {
                serde_json::to_value(schemars::schema_for!(ExecutionIdInput))
            }
            ToolName::ListExecutions => serde_json::to_value(schemars::schema_for!(ListExecutionsInput)),
        };
        schema.unwrap_or_else(|_| json!({"type": "object"}))
    }

    /// Entry for the `tools/list` result.
    pub fn definition(self) -> Value {
        json!({
            "name": self.as_str(),
            "description": self.description(),
            "inputSchema": self.input_schema(),
        })
    }
}

/// `tools/list` result.
pub fn list_tools() -> Value {
    json!({
        "tools": ToolName::ALL.into_iter().map(ToolName::definition).collect::<Vec<_>>(),
    })
}

/// Run one `tools/call` and wrap its payload as tool content.
pub fn call_tool(
    adapter: &ExecutionAdapter,
    params: Option<Value>,
    origin: Option<&str>,
) -> Result<Value, McpError> {
    let params = params.ok_or(ValidationError::MissingParams("tools/call"))?;
    let CallToolParams { name, arguments } =
        serde_json::from_value(params).map_err(|e| ValidationError::from_serde(&e))?;
    let tool = ToolName::parse(&name).ok_or(RoutingError::UnknownTool(name))?;
    debug!(tool = tool.as_str(), "Calling tool");

    let payload = match tool {
        ToolName::LaunchAgent => launch_agent(adapter, parse_args(arguments)?, origin)?,
        ToolName::GetExecutionStatus => get_execution_status(adapter, parse_args(arguments)?)?,
        ToolName::CancelExecution => cancel_execution(adapter, parse_args(arguments)?)?,
        ToolName::ListExecutions => list_executions(adapter, parse_args(arguments)?)?,
    };

    Ok(json!({
        "content": [{"type": "text", "text": payload.to_string()}],
        "structuredContent": payload,
        "isError": false,
    }))
}

fn parse_args<T: DeserializeOwned>(arguments: Option<Value>) -> Result<T, ValidationError> {
    let arguments = match arguments {
        None | Some(Value::Null) => json!({}),
        Some(value) => value,
    };
    serde_json::from_value(arguments).map_err(|e| ValidationError::from_serde(&e))
}

fn launch_agent(
    adapter: &ExecutionAdapter,
    input: LaunchAgentInput,
    origin: Option<&str>,
) -> Result<Value, McpError> {
    if !AGENT_NAME.is_match(&input.agent) {
        return Err(ValidationError::InvalidAgentName.into());
    }
    if input.task.trim().is_empty() {
        return Err(ValidationError::InvalidParams("task must not be empty".to_string()).into());
    }

    let mut options = ExecuteOptions::new();
    if let Some(origin) = origin {
        options = options.origin(origin);
    }
    let handle = adapter.execute(
        JobDefinition::new(input.agent, input.task),
        input.context.unwrap_or(Value::Null),
        options,
    )?;
    Ok(json!({
        "executionId": handle.execution_id(),
        "status": ExecutionStatus::Running,
    }))
}

fn get_execution_status(adapter: &ExecutionAdapter, input: ExecutionIdInput) -> Result<Value, McpError> {
    let record = adapter
        .tracker()
        .get(&input.execution_id)
        .ok_or(RoutingError::UnknownExecution(input.execution_id))?;
    Ok(serde_json::to_value(record).unwrap_or(Value::Null))
}

fn cancel_execution(adapter: &ExecutionAdapter, input: ExecutionIdInput) -> Result<Value, McpError> {
    if adapter.tracker().get(&input.execution_id).is_none() {
        return Err(RoutingError::UnknownExecution(input.execution_id).into());
    }
    let cancelled = adapter.cancel(&input.execution_id);
    let status = adapter
        .tracker()
        .get(&input.execution_id)
        .map(|record| record.status);
    Ok(json!({
        "executionId": input.execution_id,
        "cancelled": cancelled,
        "status": status,
    }))
}

fn list_executions(adapter: &ExecutionAdapter, input: ListExecutionsInput) -> Result<Value, McpError> {
    let filter = match input.status.as_deref() {
        None => None,
        Some(raw) => Some(ExecutionStatus::parse(raw).ok_or_else(|| {
            ValidationError::InvalidParams("unknown status filter".to_string())
        })?),
    };
    let executions: Vec<_> = adapter
        .tracker()
        .list()
        .into_iter()
        .filter(|record| filter.is_none_or(|status| record.status == status))
        .collect();
    Ok(json!({
        "count": executions.len(),
        "executions": executions,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{ExecutionTracker, FnRunner, ProgressReporter};
    use crate::protocol::{codes, JsonRpcError};
    use std::sync::Arc;
    use std::time::Duration;

    fn adapter() -> ExecutionAdapter {
        let runner = FnRunner::new(|job: JobDefinition, _ctx: Value, _p: ProgressReporter| async move {
            if job.agent == "slow" {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok::<_, anyhow::Error>(format!("{} ok", job.task))
        });
        ExecutionAdapter::new(Arc::new(ExecutionTracker::new()), Arc::new(runner), 64)
    }

    fn call(adapter: &ExecutionAdapter, name: &str, arguments: Value) -> Result<Value, JsonRpcError> {
        call_tool(adapter, Some(json!({"name": name, "arguments": arguments})), None)
            .map(|result| result["structuredContent"].clone())
            .map_err(JsonRpcError::from)
    }

    #[test]
    fn test_tool_table() {
        let listed = list_tools();
        let names: Vec<_> = listed["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["launch_agent", "get_execution_status", "cancel_execution", "list_executions"]
        );
        let schema = ToolName::LaunchAgent.input_schema();
        assert_eq!(schema["type"], "object");
        let required = schema["required"].as_array().unwrap();
        assert!(required.contains(&json!("agent")));
        assert!(required.contains(&json!("task")));
    }

    #[tokio::test]
    async fn test_launch_and_poll() {
        let adapter = adapter();
        let launched = call(&adapter, "launch_agent", json!({"agent": "tester", "task": "t"})).unwrap();
        let id = launched["executionId"].as_str().unwrap().to_string();
        assert_eq!(launched["status"], "Running");

        let status = call(&adapter, "get_execution_status", json!({"executionId": id})).unwrap();
        assert_eq!(status["executionId"], json!(id));
        assert_eq!(status["agent"], "tester");
    }

    #[tokio::test]
    async fn test_launch_rejects_bad_agent_names() {
        let adapter = adapter();
        for agent in ["", "../etc", "a b", "x".repeat(65).as_str()] {
            let err = call(&adapter, "launch_agent", json!({"agent": agent, "task": "t"})).unwrap_err();
            assert_eq!(err.code, codes::INVALID_PARAMS);
        }
        assert!(adapter.tracker().is_empty());
    }

    #[tokio::test]
    async fn test_missing_arguments_are_invalid_params() {
        let adapter = adapter();
        let err = call(&adapter, "launch_agent", json!({"agent": "a"})).unwrap_err();
        assert_eq!(err.code, codes::INVALID_PARAMS);
        assert!(err.message.contains("task"), "got {}", err.message);

        let err = call_tool(&adapter, None, None).map_err(JsonRpcError::from).unwrap_err();
        assert_eq!(err.code, codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let err = call(&adapter(), "rm_rf", json!({})).unwrap_err();
        assert_eq!(err.code, codes::INVALID_PARAMS);
        assert!(err.message.contains("rm_rf"));
    }

    #[tokio::test]
    async fn test_unknown_execution() {
        let adapter = adapter();
        let err = call(&adapter, "get_execution_status", json!({"executionId": "exec_nope"})).unwrap_err();
        assert_eq!(err.code, crate::protocol::server_codes::EXECUTION_NOT_FOUND);
        let err = call(&adapter, "cancel_execution", json!({"executionId": "exec_nope"})).unwrap_err();
        assert_eq!(err.code, crate::protocol::server_codes::EXECUTION_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancel_and_filter() {
        let adapter = adapter();
        let slow = call(&adapter, "launch_agent", json!({"agent": "slow", "task": "wait"})).unwrap();
        let slow_id = slow["executionId"].as_str().unwrap().to_string();

        let cancelled = call(&adapter, "cancel_execution", json!({"executionId": slow_id})).unwrap();
        assert_eq!(cancelled["cancelled"], true);
        assert_eq!(cancelled["status"], "Cancelled");

        let again = call(&adapter, "cancel_execution", json!({"executionId": slow_id})).unwrap();
        assert_eq!(again["cancelled"], false);

        let listed = call(&adapter, "list_executions", json!({"status": "cancelled"})).unwrap();
        assert_eq!(listed["count"], 1);
        let listed = call(&adapter, "list_executions", json!({"status": "running"})).unwrap();
        assert_eq!(listed["count"], 0);

        let err = call(&adapter, "list_executions", json!({"status": "exploded"})).unwrap_err();
        assert_eq!(err.code, codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_list_without_arguments() {
        let adapter = adapter();
        let result = call_tool(&adapter, Some(json!({"name": "list_executions"})), None).unwrap();
        assert_eq!(result["structuredContent"]["count"], 0);
        assert_eq!(result["content"][0]["type"], "text");
    }
}
