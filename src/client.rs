//! Persistent, bidirectional client.
//!
//! [`AgentClient`] keeps one Agent CLI session alive across multiple
//! prompts. Responses are consumed either from the ongoing
//! [`stream`](AgentClient::stream) or per-turn via
//! [`receive_response`](AgentClient::receive_response).

use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::Stream;

use crate::errors::{Result, SessionError};
use crate::types::{
    AgentOptions, CanUseTool, Message, PermissionMode, PermissionResult, ToolPermissionContext,
};
use crate::hooks::HookRegistry;
use crate::mcp::ToolServer;
use crate::_internal::session::Session;
use crate::_internal::transport::Transport;

/// Multi-turn client over one Agent CLI session.
///
/// # Examples
///
/// ```rust,no_run
/// use agent_cli_sdk::AgentClient;
/// use tokio_stream::StreamExt;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut client = AgentClient::new(None);
///     client.connect().await?;
///
///     client.send("What is the capital of France?").await?;
///     let mut turn = client.receive_response();
///     while let Some(msg) = turn.next().await {
///         let msg = msg?;
///         if msg.is_assistant() {
///             print!("{}", msg.text());
///         }
///     }
///
///     client.close().await?;
///     Ok(())
/// }
/// ```
pub struct AgentClient {
    options: AgentOptions,
    session: Option<Arc<Session>>,
    rx: Option<mpsc::Receiver<Result<Message>>>,
}

impl AgentClient {
    /// Create a client; nothing is spawned until [`connect`](Self::connect).
    pub fn new(options: Option<AgentOptions>) -> Self {
        Self {
            options: options.unwrap_or_default(),
            session: None,
            rx: None,
        }
    }

    /// Spawn the CLI and initialize the session. A no-op when already
    /// connected.
    pub async fn connect(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let (session, rx) = Session::launch(&self.options).await?;
        self.session = Some(Arc::new(session));
        self.rx = Some(rx);
        Ok(())
    }

    /// Connect over a caller-provided transport. Intended for custom
    /// transports and tests; the transport is started here.
    pub async fn connect_with_transport(&mut self, transport: Arc<dyn Transport>) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        transport.start().await?;
        let (session, rx) = Session::from_transport(transport, &self.options, None).await?;
        self.session = Some(Arc::new(session));
        self.rx = Some(rx);
        Ok(())
    }

    fn session(&self) -> Result<&Arc<Session>> {
        self.session
            .as_ref()
            .ok_or_else(|| SessionError::NotInitialized.into())
    }

    /// Send a prompt on the session.
    pub async fn send(&self, prompt: &str) -> Result<()> {
        self.session()?.send_prompt(prompt).await
    }

    /// The ongoing message stream, across turns. Borrows the client;
    /// control operations on `&self` remain available while streaming.
    pub fn stream(&mut self) -> ClientStream<'_> {
        ClientStream { rx: self.rx.as_mut() }
    }

    /// Messages of the current turn: yields up to and including the
    /// next `result` message, then finishes. Built by filtering the
    /// ongoing stream, so alternating with [`stream`](Self::stream) is
    /// safe.
    pub fn receive_response(&mut self) -> ResponseStream<'_> {
        ResponseStream {
            rx: self.rx.as_mut(),
            done: false,
        }
    }

    /// Session id from the CLI's init message, once it has arrived.
    pub fn session_id(&self) -> Option<String> {
        self.session.as_ref().and_then(|s| s.session_id())
    }

    /// Whether the client holds a live session.
    pub fn is_connected(&self) -> bool {
        self.session.as_ref().map(|s| !s.is_closed()).unwrap_or(false)
    }

    /// Interrupt the current turn.
    pub async fn interrupt(&self) -> Result<()> {
        self.session()?.interrupt().await
    }

    /// Change (or reset) the model.
    pub async fn set_model(&self, model: Option<String>) -> Result<()> {
        self.session()?.set_model(model).await
    }

    /// Change the permission mode.
    pub async fn set_permission_mode(&self, mode: PermissionMode) -> Result<()> {
        self.session()?.set_permission_mode(mode).await
    }

    /// Change (or reset) the thinking-token budget.
    pub async fn set_max_thinking_tokens(&self, n: Option<i32>) -> Result<()> {
        self.session()?.set_max_thinking_tokens(n).await
    }

    /// Rewind checkpointed files to the state at a user message.
    pub async fn rewind_files(&self, user_message_id: &str, dry_run: bool) -> Result<Value> {
        self.session()?.rewind_files(user_message_id, dry_run).await
    }

    /// MCP server status, as reported by the CLI.
    pub async fn mcp_status(&self) -> Result<Value> {
        self.session()?.mcp_status().await
    }

    /// Reconnect one MCP server.
    pub async fn mcp_reconnect(&self, server_name: &str) -> Result<()> {
        self.session()?.mcp_reconnect(server_name).await
    }

    /// Enable or disable one MCP server.
    pub async fn mcp_toggle(&self, server_name: &str, enabled: bool) -> Result<()> {
        self.session()?.mcp_toggle(server_name, enabled).await
    }

    /// Close the session. Idempotent; pending control requests resolve
    /// with `SessionClosed`.
    pub async fn close(&mut self) -> Result<()> {
        let result = match &self.session {
            Some(session) => session.close().await,
            None => Ok(()),
        };
        self.session = None;
        self.rx = None;
        result
    }
}

/// Ongoing message stream of an [`AgentClient`].
pub struct ClientStream<'a> {
    rx: Option<&'a mut mpsc::Receiver<Result<Message>>>,
}

impl Stream for ClientStream<'_> {
    type Item = Result<Message>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match &mut self.get_mut().rx {
            Some(rx) => rx.poll_recv(cx),
            None => Poll::Ready(None),
        }
    }
}

/// Per-turn message stream of an [`AgentClient`]; finishes after the
/// next `result` message.
pub struct ResponseStream<'a> {
    rx: Option<&'a mut mpsc::Receiver<Result<Message>>>,
    done: bool,
}

impl Stream for ResponseStream<'_> {
    type Item = Result<Message>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        let Some(rx) = &mut this.rx else {
            return Poll::Ready(None);
        };

        match rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(msg))) => {
                if msg.is_result() {
                    this.done = true;
                }
                Poll::Ready(Some(Ok(msg)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.done = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Fluent configuration for an [`AgentClient`].
///
/// ```rust,no_run
/// use agent_cli_sdk::{AgentClientBuilder, PermissionMode, PermissionResult};
///
/// let client = AgentClientBuilder::new()
///     .model("sonnet")
///     .permission_mode(PermissionMode::Default)
///     .can_use_tool(|tool, _input, _ctx| async move {
///         if tool == "Bash" {
///             PermissionResult::deny_with_message("no shell access")
///         } else {
///             PermissionResult::allow()
///         }
///     })
///     .build();
/// ```
pub struct AgentClientBuilder {
    options: AgentOptions,
}

impl AgentClientBuilder {
    /// Start from default options.
    pub fn new() -> Self {
        Self {
            options: AgentOptions::new(),
        }
    }

    /// Set the model.
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.options.model = Some(model.into());
        self
    }

    /// Set the system prompt.
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.options.system_prompt = Some(prompt.into());
        self
    }

    /// Set the permission mode.
    pub fn permission_mode(mut self, mode: PermissionMode) -> Self {
        self.options.permission_mode = Some(mode);
        self
    }

    /// Set the maximum number of turns.
    pub fn max_turns(mut self, turns: u32) -> Self {
        self.options.max_turns = Some(turns);
        self
    }

    /// Set the working directory.
    pub fn cwd(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.options.cwd = Some(path.into());
        self
    }

    /// Set the allowed tool list.
    pub fn allowed_tools(mut self, tools: Vec<String>) -> Self {
        self.options.allowed_tools = tools;
        self
    }

    /// Set the disallowed tool list.
    pub fn disallowed_tools(mut self, tools: Vec<String>) -> Self {
        self.options.disallowed_tools = tools;
        self
    }

    /// Set the hook registry.
    pub fn hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.options.hooks = Some(hooks);
        self
    }

    /// Add an in-process tool server.
    pub fn tool_server(mut self, server: ToolServer) -> Self {
        self.options.tool_servers.push(server);
        self
    }

    /// Set the permission callback.
    pub fn can_use_tool<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(String, Value, ToolPermissionContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = PermissionResult> + Send + 'static,
    {
        self.options = self.options.with_can_use_tool(callback);
        self
    }

    /// Use `callback` as the CanUseTool handler directly.
    pub fn can_use_tool_arc(mut self, callback: CanUseTool) -> Self {
        self.options.can_use_tool = Some(callback);
        self
    }

    /// Build the client.
    pub fn build(self) -> AgentClient {
        AgentClient::new(Some(self.options))
    }
}

impl Default for AgentClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_options() {
        let client = AgentClientBuilder::new()
            .model("sonnet")
            .max_turns(3)
            .allowed_tools(vec!["Read".into()])
            .build();

        assert!(!client.is_connected());
        assert_eq!(client.options.model.as_deref(), Some("sonnet"));
        assert_eq!(client.options.max_turns, Some(3));
    }

    #[tokio::test]
    async fn operations_require_connection() {
        let client = AgentClient::new(None);
        assert!(client.send("hi").await.is_err());
        assert!(client.interrupt().await.is_err());
        assert!(client.session_id().is_none());
    }
}
