//! # Agent CLI SDK
//!
//! A Rust SDK that drives an external agent command-line process over a
//! bidirectional, newline-delimited JSON stream.
//!
//! Three capabilities:
//!
//! - [`query`]: send one prompt and consume a stream of messages.
//! - [`AgentClient`]: a persistent session carrying multi-turn
//!   conversations, with runtime control operations (interrupt, model
//!   and permission changes, file rewind, MCP management).
//! - Servicing of CLI-originated control requests: in-process
//!   [tool servers](mcp::ToolServer), [hooks](hooks::HookRegistry), and
//!   dynamic [permission decisions](types::CanUseTool), answered on the
//!   same channel.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use agent_cli_sdk::{query, AgentOptions};
//! use tokio_stream::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = AgentOptions::new().with_max_turns(3);
//!     let mut stream = query("What is 2 + 2?", Some(options)).await?;
//!
//!     while let Some(message) = stream.next().await {
//!         let message = message?;
//!         if message.is_assistant() {
//!             print!("{}", message.text());
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Hooks and permissions
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agent_cli_sdk::hooks::{HookEvent, HookOutput, HookRegistry};
//! use agent_cli_sdk::{AgentClientBuilder, PermissionResult};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let hooks = Arc::new(HookRegistry::new());
//! hooks.register(HookEvent::PreToolUse, Some("Bash"), |_input, _id, _ctx| async {
//!     HookOutput::deny("shell access is disabled")
//! })?;
//!
//! let client = AgentClientBuilder::new()
//!     .hooks(hooks)
//!     .can_use_tool(|_tool, _input, _ctx| async { PermissionResult::allow() })
//!     .build();
//! # Ok(())
//! # }
//! ```
//!
//! The SDK never interprets assistant content and persists nothing; the
//! Agent CLI owns the session store. No user-supplied byte ever reaches
//! a shell: the child is spawned by direct argv invocation and every
//! option value is a discrete argument.

#![warn(missing_docs)]

mod client;
mod errors;
mod query;
mod types;

pub mod hooks;
pub mod mcp;

pub mod _internal;

pub use client::{AgentClient, AgentClientBuilder, ClientStream, ResponseStream};
pub use errors::{
    HookError, ProtocolError, QueryError, Result, SdkError, SessionError, ToolError,
    TransportError,
};
pub use query::{
    query, query_all, query_result, query_stream, query_with_transport, validate_setup, CliInfo,
    QueryStream,
};
pub use types::{
    AgentOptions, CanUseTool, CanUseToolFuture, ControlOutcome, InboundControlRequest, Message,
    OutboundControlRequest, PermissionMode, PermissionResult, PermissionResultAllow,
    PermissionResultDeny, ToolPermissionContext,
};

// Transport extension point: custom transports implement [`Transport`]
// and plug in via `query_with_transport` / `connect_with_transport`.
pub use _internal::framing::{RegularKind, StdoutMessage};
pub use _internal::transport::{MessageStream, StreamItem, Transport};

/// SDK version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Minimum Agent CLI version this SDK is tested against.
pub const MIN_CLI_VERSION: &str = "1.0.0";
