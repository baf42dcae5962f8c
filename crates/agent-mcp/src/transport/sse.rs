//! SSE/HTTP transport.
//!
//! Endpoints:
//!
//! - `GET /mcp/sse`: opens a Server-Sent-Events stream. The first event is
//!   `connected` with `{"connectionId": "..."}`; every later event is a
//!   `message` carrying one encoded JSON-RPC message.
//! - `POST /mcp/rpc`: one JSON-RPC message per body. The originating
//!   connection is named by the `x-connection-id` header or the
//!   `connectionId` query parameter.
//! - `GET /health`: liveness and connection count.
//!
//! Each connection gets a bounded outbound queue. A peer that stops reading
//! fills its queue and is dropped rather than growing memory without limit.
//! A background reaper closes connections whose receiver has gone away or
//! that have been idle past the configured timeout. A keep-alive comment the
//! client accepts counts as activity.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{header, HeaderMap, HeaderName, Method, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::TransportError;
use crate::protocol::{Codec, JsonRpcError, Message, Response as RpcResponse};

use super::traits::{ClosedSendPolicy, ConnectionId, Transport, TransportEvent, TransportState};

/// Header a POST uses to name its SSE connection.
pub const CONNECTION_ID_HEADER: &str = "x-connection-id";

/// What to do with a new SSE connection once `max_connections` are open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionLimitPolicy {
    /// Refuse the newcomer with 503
    #[default]
    Reject,
    /// Close the longest-lived connection to make room
    EvictOldest,
}

/// Runtime settings for [`SseTransport`].
#[derive(Debug, Clone)]
pub struct SseOptions {
    pub host: String,
    pub port: u16,
    pub sse_path: String,
    pub rpc_path: String,
    pub max_message_bytes: usize,
    pub max_connections: usize,
    pub limit_policy: ConnectionLimitPolicy,
    pub connection_buffer: usize,
    pub event_buffer: usize,
    pub keep_alive: Duration,
    /// `None` disables idle reaping
    pub idle_timeout: Option<Duration>,
    pub reap_interval: Duration,
    /// Empty or `*` allows any origin
    pub cors_origins: Vec<String>,
    pub closed_send: ClosedSendPolicy,
}

impl Default for SseOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            sse_path: "/mcp/sse".to_string(),
            rpc_path: "/mcp/rpc".to_string(),
            max_message_bytes: crate::protocol::codec::DEFAULT_MAX_MESSAGE_BYTES,
            max_connections: 256,
            limit_policy: ConnectionLimitPolicy::Reject,
            connection_buffer: 64,
            event_buffer: 1024,
            keep_alive: Duration::from_secs(15),
            idle_timeout: Some(Duration::from_secs(900)),
            reap_interval: Duration::from_secs(30),
            cors_origins: Vec::new(),
            closed_send: ClosedSendPolicy::Ignore,
        }
    }
}

impl SseOptions {
    pub fn with_address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }
}

struct ConnectionHandle {
    tx: mpsc::Sender<Arc<str>>,
    cancel: CancellationToken,
    opened_at: Instant,
    last_active: parking_lot::Mutex<Instant>,
}

impl ConnectionHandle {
    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }
}

/// State shared between the transport handle and the axum handlers.
struct Shared {
    options: SseOptions,
    codec: Codec,
    connections: DashMap<ConnectionId, ConnectionHandle>,
    admission: parking_lot::Mutex<()>,
    events_tx: mpsc::Sender<TransportEvent>,
    shutdown: CancellationToken,
}

impl Shared {
    fn notify(&self, event: TransportEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            debug!("Dropping transport event: {}", e);
        }
    }

    /// Register a new connection, applying the connection cap.
    fn admit(&self) -> Option<(ConnectionId, mpsc::Receiver<Arc<str>>, CancellationToken)> {
        if self.shutdown.is_cancelled() {
            return None;
        }

        let _admission = self.admission.lock();
        if self.connections.len() >= self.options.max_connections {
            match self.options.limit_policy {
                ConnectionLimitPolicy::Reject => {
                    warn!(
                        max = self.options.max_connections,
                        "Rejecting SSE connection: limit reached"
                    );
                    return None;
                }
                ConnectionLimitPolicy::EvictOldest => {
                    if let Some(oldest) = self.oldest_connection() {
                        info!(connection_id = %oldest, "Evicting oldest SSE connection");
                        self.drop_connection(&oldest);
                    }
                }
            }
        }

        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.options.connection_buffer);
        let cancel = self.shutdown.child_token();
        let now = Instant::now();
        self.connections.insert(
            id.clone(),
            ConnectionHandle {
                tx,
                cancel: cancel.clone(),
                opened_at: now,
                last_active: parking_lot::Mutex::new(now),
            },
        );
        debug!(connection_id = %id, "SSE connection opened");
        self.notify(TransportEvent::ConnectionOpened(id.clone()));
        Some((id, rx, cancel))
    }

    fn touch(&self, id: &str) {
        if let Some(handle) = self.connections.get(id) {
            handle.touch();
        }
    }

    fn oldest_connection(&self) -> Option<ConnectionId> {
        self.connections
            .iter()
            .min_by_key(|entry| entry.value().opened_at)
            .map(|entry| entry.key().clone())
    }

    /// Remove a connection and end its stream. Safe to call repeatedly.
    fn drop_connection(&self, id: &str) {
        if let Some((_, handle)) = self.connections.remove(id) {
            handle.cancel.cancel();
        }
    }

    fn deliver(&self, id: &str, payload: Arc<str>) -> Result<(), TransportError> {
        let sender = self.connections.get(id).map(|handle| {
            handle.touch();
            handle.tx.clone()
        });
        let Some(sender) = sender else {
            return Err(TransportError::ConnectionNotFound(id.to_string()));
        };

        match sender.try_send(payload) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(connection_id = %id, "SSE client is not keeping up, dropping connection");
                self.drop_connection(id);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.drop_connection(id);
                Err(TransportError::ConnectionNotFound(id.to_string()))
            }
        }
    }

    fn broadcast(&self, payload: Arc<str>) {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.deliver(&id, Arc::clone(&payload)) {
                debug!(connection_id = %id, "Broadcast skipped: {}", e);
            }
        }
    }

    /// Close connections whose stream is gone or that sat idle too long.
    fn reap(&self) -> usize {
        let idle_timeout = self.options.idle_timeout;
        let stale: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| {
                let handle = entry.value();
                handle.tx.is_closed()
                    || idle_timeout.is_some_and(|t| handle.last_active.lock().elapsed() > t)
            })
            .map(|entry| entry.key().clone())
            .collect();

        for id in &stale {
            debug!(connection_id = %id, "Reaping stale SSE connection");
            self.drop_connection(id);
        }
        stale.len()
    }
}

/// Removes the connection from the registry when its stream is dropped.
struct ConnectionGuard {
    shared: Arc<Shared>,
    id: ConnectionId,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.shared.connections.remove(&self.id);
        debug!(connection_id = %self.id, "SSE connection closed");
        self.shared
            .notify(TransportEvent::ConnectionClosed(self.id.clone()));
    }
}

/// JSON-RPC over HTTP POST with responses and notifications pushed via SSE.
pub struct SseTransport {
    shared: Arc<Shared>,
    events_rx: Mutex<mpsc::Receiver<TransportEvent>>,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,
    started: AtomicBool,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl SseTransport {
    pub fn new(options: SseOptions) -> Self {
        let (events_tx, events_rx) = mpsc::channel(options.event_buffer.max(1));
        let codec = Codec::new(options.max_message_bytes);
        Self {
            shared: Arc::new(Shared {
                options,
                codec,
                connections: DashMap::new(),
                admission: parking_lot::Mutex::new(()),
                events_tx,
                shutdown: CancellationToken::new(),
            }),
            events_rx: Mutex::new(events_rx),
            local_addr: parking_lot::Mutex::new(None),
            started: AtomicBool::new(false),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn options(&self) -> &SseOptions {
        &self.shared.options
    }

    /// Address actually bound by [`start`](Transport::start).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Number of open SSE connections.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// Run one reaper pass immediately. Returns how many connections closed.
    pub fn reap_now(&self) -> usize {
        self.shared.reap()
    }

    /// Build the axum router serving this transport.
    pub fn router(&self) -> Router {
        let options = &self.shared.options;

        let cors = CorsLayer::new()
            .allow_origin(allowed_origins(&options.cors_origins))
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([
                header::CONTENT_TYPE,
                header::ACCEPT,
                HeaderName::from_static(CONNECTION_ID_HEADER),
            ])
            .max_age(Duration::from_secs(3600));

        Router::new()
            .route("/health", get(handle_health))
            .route(&options.sse_path, get(handle_sse))
            .route(&options.rpc_path, post(handle_rpc))
            .layer(DefaultBodyLimit::max(options.max_message_bytes))
            .with_state(Arc::clone(&self.shared))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }
}

impl std::fmt::Debug for SseTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseTransport")
            .field("local_addr", &self.local_addr())
            .field("connections", &self.connection_count())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn allowed_origins(origins: &[String]) -> AllowOrigin {
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return AllowOrigin::any();
    }
    let parsed = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect::<Vec<_>>();
    AllowOrigin::list(parsed)
}

#[async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> &'static str {
        "sse"
    }

    async fn start(&self) -> Result<(), TransportError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyStarted);
        }

        let options = &self.shared.options;
        let addr = format!("{}:{}", options.host, options.port);
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(source) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(TransportError::Bind { addr, source });
            }
        };
        let local = listener.local_addr()?;
        *self.local_addr.lock() = Some(local);

        let app = self.router();
        let shutdown = self.shared.shutdown.clone();
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                error!("SSE listener failed: {}", e);
            }
        });

        let shared = Arc::clone(&self.shared);
        let reaper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.options.reap_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let reaped = shared.reap();
                        if reaped > 0 {
                            debug!(reaped, "Reaper closed stale SSE connections");
                        }
                    }
                }
            }
        });

        self.tasks.lock().extend([server, reaper]);
        info!(
            "SSE transport listening on http://{} (GET {}, POST {})",
            local, options.sse_path, options.rpc_path
        );
        Ok(())
    }

    async fn recv(&self) -> Option<TransportEvent> {
        let mut rx = self.events_rx.lock().await;
        tokio::select! {
            biased;
            event = rx.recv() => event,
            _ = self.shared.shutdown.cancelled() => None,
        }
    }

    async fn send(&self, message: &Message, connection: Option<&str>) -> Result<(), TransportError> {
        if self.shared.shutdown.is_cancelled() {
            return self.shared.options.closed_send.on_closed();
        }

        let payload: Arc<str> = Arc::from(message.to_value().to_string());
        match connection {
            Some(id) => self.shared.deliver(id, payload),
            None => {
                self.shared.broadcast(payload);
                Ok(())
            }
        }
    }

    async fn stop(&self) -> Result<(), TransportError> {
        if self.shared.shutdown.is_cancelled() {
            return Ok(());
        }
        self.shared.shutdown.cancel();
        self.shared.connections.clear();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("SSE background task did not stop in time");
            }
        }
        info!("SSE transport stopped");
        Ok(())
    }

    fn state(&self) -> TransportState {
        if self.started.load(Ordering::SeqCst) && !self.shared.shutdown.is_cancelled() {
            TransportState::Connected
        } else {
            TransportState::Disconnected
        }
    }
}

async fn handle_health(State(shared): State<Arc<Shared>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "transport": "sse",
        "connections": shared.connections.len(),
    }))
}

enum Outbound {
    Message(Arc<str>),
    KeepAlive,
    Closed,
}

async fn handle_sse(State(shared): State<Arc<Shared>>) -> Response {
    let Some((id, mut rx, cancel)) = shared.admit() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "connection limit reached"})),
        )
            .into_response();
    };

    let guard = ConnectionGuard {
        shared: Arc::clone(&shared),
        id: id.clone(),
    };
    let hello = json!({ "connectionId": id }).to_string();
    let period = shared.options.keep_alive.max(Duration::from_millis(1));
    let connection = id.clone();

    let stream = async_stream::stream! {
        let _guard = guard;
        yield Ok::<_, Infallible>(Event::default().event("connected").data(hello));

        let mut keep_alive = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        keep_alive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => Outbound::Closed,
                payload = rx.recv() => payload.map_or(Outbound::Closed, Outbound::Message),
                _ = keep_alive.tick() => Outbound::KeepAlive,
            };
            match next {
                Outbound::Message(payload) => yield Ok(Event::default().event("message").data(&*payload)),
                Outbound::KeepAlive => {
                    yield Ok(Event::default().comment("keep-alive"));
                    // Resumed only once the body has taken the comment.
                    shared.touch(&connection);
                }
                Outbound::Closed => break,
            }
        }
    };

    let sse = Sse::new(stream);

    (
        [
            (header::CACHE_CONTROL, "no-cache".to_string()),
            (header::CONNECTION, "keep-alive".to_string()),
            (HeaderName::from_static(CONNECTION_ID_HEADER), id),
        ],
        sse,
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct RpcQuery {
    #[serde(rename = "connectionId")]
    connection_id: Option<String>,
}

async fn handle_rpc(
    State(shared): State<Arc<Shared>>,
    Query(query): Query<RpcQuery>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    if !is_json_content_type(&headers) {
        return error_status(StatusCode::UNSUPPORTED_MEDIA_TYPE, "content type must be application/json");
    }

    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            let status = rejection.status();
            debug!(%status, "Rejected POST body");
            return error_status(status, "request body rejected");
        }
    };

    let connection_id = match resolve_connection(&shared, &headers, query.connection_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    let message = match shared.codec.decode(&body) {
        Ok(message) => message,
        Err(e) => {
            debug!("Discarding malformed POST body: {}", e.reason());
            let reply = Message::from(RpcResponse::error(None, JsonRpcError::parse_error()));
            return (StatusCode::BAD_REQUEST, Json(reply.to_value())).into_response();
        }
    };

    let event = TransportEvent::Message {
        message,
        connection_id,
    };
    match shared.events_tx.try_send(event) {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({"status": "accepted"}))).into_response(),
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("Inbound queue full, shedding POST");
            error_status(StatusCode::SERVICE_UNAVAILABLE, "server busy")
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            error_status(StatusCode::SERVICE_UNAVAILABLE, "server shutting down")
        }
    }
}

/// Pick the connection a POST belongs to.
///
/// An explicit id must name an open connection. Without one, a lone open
/// connection is implied; with several, the caller must choose.
fn resolve_connection(
    shared: &Shared,
    headers: &HeaderMap,
    from_query: Option<String>,
) -> Result<Option<ConnectionId>, Response> {
    let explicit = headers
        .get(CONNECTION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(from_query);

    match explicit {
        Some(id) => match shared.connections.get(&id) {
            Some(handle) => {
                handle.touch();
                Ok(Some(id))
            }
            None => Err(error_status(StatusCode::NOT_FOUND, "unknown connection")),
        },
        None => match shared.connections.len() {
            0 => Ok(None),
            1 => Ok(shared.connections.iter().next().map(|e| e.key().clone())),
            _ => Err(error_status(StatusCode::BAD_REQUEST, "connection id required")),
        },
    }
}

fn is_json_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
}

fn error_status(status: StatusCode, reason: &'static str) -> Response {
    (status, Json(json!({ "error": reason }))).into_response()
}
