//! MCP server core.
//!
//! ```text
//! Transport ──► McpServer::serve ──► handle_request ──► tools / resources
//!     ▲                                                      │
//!     └──── notifications ◄── ExecutionAdapter events ◄──────┘
//! ```
//!
//! The method table is the closed [`Method`] enum; tools are the closed
//! [`ToolName`] enum. Nothing is registered at runtime.

pub mod builder;
pub mod core;
pub mod resources;
pub mod tools;

pub use builder::ServerBuilder;
pub use self::core::{event_notification, McpServer, Method, ServerInfo, MCP_PROTOCOL_VERSION};
pub use tools::ToolName;
