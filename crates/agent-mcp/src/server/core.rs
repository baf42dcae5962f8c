//! Core MCP server: method routing and the transport receive loop.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::error::{McpError, RoutingError, TransportError};
use crate::execution::{ExecutionAdapter, ExecutionEvent, ExecutionEventKind, ExecutionId, ExecutionTracker};
use crate::protocol::{Message, Notification, Request, Response};
use crate::transport::{Transport, TransportEvent};

use super::builder::ServerBuilder;
use super::{resources, tools};

/// MCP protocol revision announced in `initialize`.
pub const MCP_PROTOCOL_VERSION: &str = "2025-03-26";

/// Terminal notifications remembered to suppress duplicates after a lag.
const RECENT_TERMINALS: usize = 1024;

/// Name and version reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

impl ServerInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// Every method the server understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Initialize,
    Ping,
    ToolsList,
    ToolsCall,
    ResourcesList,
    ResourcesRead,
    Initialized,
    Cancelled,
}

impl Method {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "initialize" => Method::Initialize,
            "ping" => Method::Ping,
            "tools/list" => Method::ToolsList,
            "tools/call" => Method::ToolsCall,
            "resources/list" => Method::ResourcesList,
            "resources/read" => Method::ResourcesRead,
            "notifications/initialized" => Method::Initialized,
            "notifications/cancelled" => Method::Cancelled,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Initialize => "initialize",
            Method::Ping => "ping",
            Method::ToolsList => "tools/list",
            Method::ToolsCall => "tools/call",
            Method::ResourcesList => "resources/list",
            Method::ResourcesRead => "resources/read",
            Method::Initialized => "notifications/initialized",
            Method::Cancelled => "notifications/cancelled",
        }
    }

    /// Methods that only arrive as notifications.
    pub fn is_notification(self) -> bool {
        matches!(self, Method::Initialized | Method::Cancelled)
    }
}

/// Main MCP server instance.
///
/// Routes requests to the tool and resource handlers and relays execution
/// events back to the peer that launched them.
///
/// ```
/// use agent_mcp::protocol::Message;
/// use agent_mcp::server::McpServer;
///
/// # tokio_test::block_on(async {
/// let server = McpServer::builder().name("demo").version("1.0.0").build();
/// let reply = server
///     .handle_message(Message::request(1, "ping", None), None)
///     .await
///     .unwrap();
/// assert!(reply.result().is_some());
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct McpServer {
    info: ServerInfo,
    adapter: ExecutionAdapter,
}

impl McpServer {
    pub fn new(info: ServerInfo, adapter: ExecutionAdapter) -> Self {
        Self { info, adapter }
    }

    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    pub fn adapter(&self) -> &ExecutionAdapter {
        &self.adapter
    }

    /// Handle one inbound message. Returns the response to send, if any.
    ///
    /// `connection` is the transport connection the message arrived on;
    /// executions launched by it report back to that connection.
    pub async fn handle_message(&self, message: Message, connection: Option<&str>) -> Option<Response> {
        match message {
            Message::Request(request) => Some(self.handle_request(request, connection).await),
            Message::Notification(notification) => {
                self.handle_notification(notification);
                None
            }
            Message::Response(response) => {
                debug!(id = ?response.id, "Ignoring response from peer");
                None
            }
        }
    }

    /// Handle a request; never fails, errors become JSON-RPC error responses.
    pub async fn handle_request(&self, request: Request, connection: Option<&str>) -> Response {
        let Request { id, method, params } = request;
        let result = match Method::parse(&method).filter(|m| !m.is_notification()) {
            Some(method) => self.dispatch(method, params, connection),
            None => Err(RoutingError::UnknownMethod(method).into()),
        };

        match result {
            Ok(value) => Response::success(id, value),
            Err(e) => {
                debug!(request_id = %id, "Request failed: {}", e);
                Response::error(Some(id), e.into())
            }
        }
    }

    fn dispatch(&self, method: Method, params: Option<Value>, connection: Option<&str>) -> Result<Value, McpError> {
        match method {
            Method::Initialize => Ok(self.initialize_result(params.as_ref())),
            Method::Ping => Ok(json!({})),
            Method::ToolsList => Ok(tools::list_tools()),
            Method::ToolsCall => tools::call_tool(&self.adapter, params, connection),
            Method::ResourcesList => Ok(resources::list_resources()),
            Method::ResourcesRead => resources::read_resource(&self.adapter, &self.info, params),
            Method::Initialized | Method::Cancelled => {
                Err(RoutingError::UnknownMethod(method.as_str().to_string()).into())
            }
        }
    }

    fn initialize_result(&self, params: Option<&Value>) -> Value {
        if let Some(client) = params.and_then(|p| p.get("clientInfo")) {
            let client = client.get("name").and_then(Value::as_str).unwrap_or("unknown");
            info!(client = %client, "Client initializing");
        }
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {
                "tools": { "listChanged": false },
                "resources": { "subscribe": false, "listChanged": false },
            },
            "serverInfo": self.info,
        })
    }

    fn handle_notification(&self, notification: Notification) {
        match Method::parse(&notification.method) {
            Some(Method::Initialized) => info!("Client initialized"),
            Some(Method::Cancelled) => {
                let execution_id = notification
                    .params
                    .as_ref()
                    .and_then(|p| p.get("executionId"))
                    .and_then(Value::as_str);
                match execution_id {
                    Some(id) => {
                        let cancelled = self.adapter.cancel(id);
                        debug!(execution_id = %id, cancelled, "Cancellation requested by peer");
                    }
                    None => debug!("Cancellation notification without executionId"),
                }
            }
            _ => debug!(method = %notification.method, "Ignoring notification"),
        }
    }

    /// Run the server on `transport` until its input ends or it is stopped.
    ///
    /// Messages are handled one at a time in arrival order. Execution events
    /// are relayed concurrently as notifications.
    pub async fn serve(&self, transport: Arc<dyn Transport>) -> Result<(), TransportError> {
        transport.start().await?;
        info!(transport = transport.kind(), "MCP server started");

        let relay = tokio::spawn(relay_events(
            self.adapter.subscribe(),
            Arc::clone(self.adapter.tracker()),
            Arc::clone(&transport),
        ));

        while let Some(event) = transport.recv().await {
            match event {
                TransportEvent::Message { message, connection_id } => {
                    let connection = connection_id.as_deref();
                    let Some(response) = self.handle_message(message, connection).await else {
                        continue;
                    };
                    if let Err(e) = transport.send(&Message::Response(response), connection).await {
                        log_send_error(&e);
                    }
                }
                TransportEvent::ConnectionOpened(id) => debug!(connection_id = %id, "Peer connected"),
                TransportEvent::ConnectionClosed(id) => debug!(connection_id = %id, "Peer disconnected"),
            }
        }

        relay.abort();
        transport.stop().await?;
        info!(transport = transport.kind(), "MCP server stopped");
        Ok(())
    }
}

/// Notification carrying one execution event.
pub fn event_notification(event: &ExecutionEvent) -> Message {
    match event.kind {
        ExecutionEventKind::Progress => Message::notification(
            "notifications/progress",
            Some(json!({
                "executionId": event.execution_id,
                "progress": event.progress.unwrap_or(0),
                "total": 100,
            })),
        ),
        _ => Message::notification(
            "notifications/execution",
            serde_json::to_value(event).ok(),
        ),
    }
}

/// What the relay has delivered, so terminal notifications dropped by a
/// lagging subscription can be rebuilt from the tracker.
#[derive(Debug)]
struct RelayState {
    in_flight: HashSet<ExecutionId>,
    delivered: VecDeque<ExecutionId>,
    last_seen: DateTime<Utc>,
}

impl RelayState {
    fn new() -> Self {
        Self {
            in_flight: HashSet::new(),
            delivered: VecDeque::new(),
            last_seen: Utc::now(),
        }
    }

    /// Record `event`; false when its execution already had a terminal
    /// notification and the event must not be sent.
    fn observe(&mut self, event: &ExecutionEvent) -> bool {
        self.last_seen = self.last_seen.max(event.timestamp);
        if self.delivered.contains(&event.execution_id) {
            return false;
        }
        if event.kind.is_terminal() {
            self.in_flight.remove(&event.execution_id);
            self.remember(event.execution_id.clone());
        } else {
            self.in_flight.insert(event.execution_id.clone());
        }
        true
    }

    fn remember(&mut self, id: ExecutionId) {
        self.delivered.push_back(id);
        if self.delivered.len() > RECENT_TERMINALS {
            self.delivered.pop_front();
        }
    }

    /// Terminal events that may have been skipped, rebuilt from the tracker.
    ///
    /// Covers executions seen running plus any that finished since the last
    /// received event.
    fn recover(&mut self, tracker: &ExecutionTracker) -> Vec<ExecutionEvent> {
        let since = self.last_seen - TimeDelta::seconds(1);
        let mut missed = Vec::new();
        for record in tracker.list() {
            let Some(kind) = ExecutionEventKind::for_terminal(record.status) else {
                continue;
            };
            if self.delivered.contains(&record.execution_id) {
                continue;
            }
            let finished_since = record.completed_at.is_some_and(|done| done >= since);
            if self.in_flight.remove(&record.execution_id) || finished_since {
                self.remember(record.execution_id.clone());
                missed.push(ExecutionEvent::from_record(kind, &record, record.origin.clone()));
            }
        }
        missed
    }
}

async fn relay_events(
    mut events: broadcast::Receiver<ExecutionEvent>,
    tracker: Arc<ExecutionTracker>,
    transport: Arc<dyn Transport>,
) {
    let mut state = RelayState::new();
    loop {
        match events.recv().await {
            Ok(event) => {
                if state.observe(&event) {
                    deliver(transport.as_ref(), &event).await;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                let missed = state.recover(&tracker);
                warn!(skipped, recovered = missed.len(), "Execution event relay lagged");
                for event in &missed {
                    deliver(transport.as_ref(), event).await;
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn deliver(transport: &dyn Transport, event: &ExecutionEvent) {
    let message = event_notification(event);
    if let Err(e) = transport.send(&message, event.origin.as_deref()).await {
        log_send_error(&e);
    }
}

fn log_send_error(err: &TransportError) {
    match err {
        TransportError::ConnectionNotFound(id) => {
            debug!(connection_id = %id, "Peer went away before delivery")
        }
        e if e.is_disconnect() => debug!("Send skipped: {}", e),
        e => warn!("Failed to send message: {}", e),
    }
}
