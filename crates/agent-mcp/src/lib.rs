//! # Agent MCP
//!
//! Model Context Protocol server that launches agent tasks as tracked,
//! cancellable background executions.
//!
//! ## Architecture
//!
//! ```text
//! bytes ─► Transport (stdio | SSE) ─► Codec ─► McpServer ─► tools ─► ExecutionAdapter
//!                ▲                                                       │
//!                └──────────── notifications ◄── ExecutionEvent ◄────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON-RPC 2.0 messages, errors and the line codec
//! - [`transport`]: stdio and SSE/HTTP transports and the factory
//! - [`execution`]: execution tracker, adapter and task runners
//! - [`server`]: method routing, tools and resources
//! - [`config`]: layered configuration
//! - [`logging`]: tracing subscriber setup
//! - [`error`]: error types and their JSON-RPC mapping
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use agent_mcp::server::McpServer;
//! use agent_mcp::transport::StdioTransport;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = McpServer::builder().name("agents").version("1.0.0").build();
//!     server.serve(Arc::new(StdioTransport::new())).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod logging;
pub mod protocol;
pub mod sanitize;
pub mod server;
pub mod transport;

pub use error::{McpError, Result};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
