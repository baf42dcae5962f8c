//! Read-only resources exposed through `resources/list` and `resources/read`.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{McpError, RoutingError, ValidationError};
use crate::execution::ExecutionAdapter;

use super::core::ServerInfo;

pub const EXECUTIONS_URI: &str = "mcp://executions";
pub const SERVER_INFO_URI: &str = "mcp://server/info";
const EXECUTION_URI_PREFIX: &str = "mcp://executions/";

const JSON_MIME: &str = "application/json";

#[derive(Debug, Deserialize)]
pub struct ReadResourceParams {
    pub uri: String,
}

/// `resources/list` result.
pub fn list_resources() -> Value {
    json!({
        "resources": [
            {
                "uri": EXECUTIONS_URI,
                "name": "executions",
                "description": "Every tracked execution, newest first",
                "mimeType": JSON_MIME,
            },
            {
                "uri": SERVER_INFO_URI,
                "name": "server-info",
                "description": "Server name, version and execution counters",
                "mimeType": JSON_MIME,
            },
        ],
        "resourceTemplates": [
            {
                "uriTemplate": "mcp://executions/{executionId}",
                "name": "execution",
                "description": "One execution record",
                "mimeType": JSON_MIME,
            },
        ],
    })
}

/// `resources/read` result.
pub fn read_resource(
    adapter: &ExecutionAdapter,
    info: &ServerInfo,
    params: Option<Value>,
) -> Result<Value, McpError> {
    let params = params.ok_or(ValidationError::MissingParams("resources/read"))?;
    let ReadResourceParams { uri } =
        serde_json::from_value(params).map_err(|e| ValidationError::from_serde(&e))?;

    let body = if uri == EXECUTIONS_URI {
        json!({ "executions": adapter.tracker().list() })
    } else if uri == SERVER_INFO_URI {
        json!({
            "name": info.name,
            "version": info.version,
            "protocolVersion": super::core::MCP_PROTOCOL_VERSION,
            "executions": adapter.tracker().len(),
            "running": adapter.running_count(),
        })
    } else if let Some(id) = uri.strip_prefix(EXECUTION_URI_PREFIX) {
        let record = adapter
            .tracker()
            .get(id)
            .ok_or_else(|| RoutingError::UnknownResource(uri.clone()))?;
        serde_json::to_value(record).unwrap_or(Value::Null)
    } else {
        return Err(RoutingError::UnknownResource(uri).into());
    };

    Ok(json!({
        "contents": [{
            "uri": uri,
            "mimeType": JSON_MIME,
            "text": body.to_string(),
        }],
    }))
}
