//! Session: composition of transport, control handler, hook registry
//! and tool router, plus the message loop that routes the CLI's stdout.

use serde_json::{json, Value};
use std::sync::{Arc, Mutex, Weak};
use tempfile::NamedTempFile;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::control::{write_json_line, ControlHandler};
use super::framing::{RegularKind, StdoutMessage};
use super::router::ToolRouter;
use super::transport::{SubprocessTransport, Transport};
use crate::errors::{HookError, ProtocolError, Result, SdkError, SessionError};
use crate::hooks::HookRegistry;
use crate::types::{
    AgentOptions, CanUseTool, InboundControlRequest, Message, OutboundControlRequest,
    PermissionMode, ToolPermissionContext,
};

#[derive(Default)]
struct SessionState {
    session_id: Option<String>,
    initialized: bool,
    closed: bool,
}

/// Shared core of a session. The message loop holds a weak reference so
/// dropping the session ends the loop instead of leaking it.
pub(crate) struct SessionCore {
    transport: Arc<dyn Transport>,
    control: ControlHandler,
    hooks: Option<Arc<HookRegistry>>,
    router: ToolRouter,
    can_use_tool: Option<CanUseTool>,
    system_prompt: Option<String>,
    append_system_prompt: Option<String>,
    state: Mutex<SessionState>,
    /// Session-owned MCP config file; deleting it is tied to this
    /// core's lifetime so the cleanup also happens on error paths.
    mcp_config: Mutex<Option<NamedTempFile>>,
}

/// One Agent CLI session.
pub(crate) struct Session {
    core: Arc<SessionCore>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Spawn the CLI and build a session around it. The message loop is
    /// started and, when the options call for it, the initialize
    /// round-trip is completed before this returns.
    pub async fn launch(
        options: &AgentOptions,
    ) -> Result<(Self, mpsc::Receiver<Result<Message>>)> {
        validate_options(options)?;
        let mcp_config = materialize_mcp_config(options)?;
        let transport = Arc::new(SubprocessTransport::new(
            options,
            mcp_config.as_ref().map(|f| f.path()),
        )?);
        transport.start().await?;
        Self::from_transport(transport, options, mcp_config).await
    }

    /// Build a session over an already-started transport. The loop is
    /// started first, then initialize runs (its response arrives over
    /// the same stream), so callers get a fully initialized session.
    pub async fn from_transport(
        transport: Arc<dyn Transport>,
        options: &AgentOptions,
        mcp_config: Option<NamedTempFile>,
    ) -> Result<(Self, mpsc::Receiver<Result<Message>>)> {
        validate_options(options)?;
        let core = Arc::new(SessionCore {
            control: ControlHandler::new(Arc::clone(&transport), options.control_timeout()),
            transport,
            hooks: options.hooks.clone(),
            router: ToolRouter::new(options.tool_servers.clone()),
            can_use_tool: options.can_use_tool.clone(),
            system_prompt: options.system_prompt.clone(),
            append_system_prompt: options.append_system_prompt.clone(),
            state: Mutex::new(SessionState::default()),
            mcp_config: Mutex::new(mcp_config),
        });

        let (loop_task, message_rx) = spawn_message_loop(&core);
        let session = Self {
            core,
            loop_task: Mutex::new(Some(loop_task)),
        };

        if options.needs_initialize() {
            if let Err(e) = session.initialize().await {
                let _ = session.close().await;
                return Err(e);
            }
        }

        Ok((session, message_rx))
    }

    /// Run the initialize round-trip: hook config, tool server
    /// descriptors and system prompt overrides are announced to the CLI.
    pub async fn initialize(&self) -> Result<Value> {
        self.ensure_open()?;
        let core = &self.core;

        let payload = OutboundControlRequest::Initialize {
            hooks_config: core.hooks.as_ref().and_then(|h| h.hook_config()),
            sdk_tool_servers: if core.router.is_empty() {
                None
            } else {
                Some(core.router.descriptors())
            },
            system_prompt: core.system_prompt.clone(),
            append_system_prompt: core.append_system_prompt.clone(),
        };

        let value = core.control.send_request(&payload).await.map_err(|e| {
            SdkError::from(SessionError::InitializationFailed {
                cause: e.to_string(),
            })
        })?;

        core.state.lock().unwrap().initialized = true;
        debug!("session initialized");
        Ok(value)
    }

    /// Write one user prompt as a JSON line.
    pub async fn send_prompt(&self, prompt: &str) -> Result<()> {
        self.ensure_open()?;
        let record = json!({
            "type": "user",
            "message": {"role": "user", "content": prompt},
            "parent_tool_use_id": Value::Null,
            "session_id": self.session_id().unwrap_or_else(|| "default".to_string()),
        });
        write_json_line(self.core.transport.as_ref(), &record).await
    }

    /// Write one caller-supplied record as a JSON line (streaming-input
    /// mode). The record structure is passed through untouched.
    pub async fn write_record(&self, record: &Value) -> Result<()> {
        self.ensure_open()?;
        write_json_line(self.core.transport.as_ref(), record).await
    }

    /// Signal end of input by closing the child's stdin.
    pub async fn end_input(&self) -> Result<()> {
        self.core.transport.end_input().await
    }

    /// Session id reported by the CLI's init message, if seen yet.
    pub fn session_id(&self) -> Option<String> {
        self.core.state.lock().unwrap().session_id.clone()
    }

    /// Whether the initialize round-trip has completed.
    pub fn is_initialized(&self) -> bool {
        self.core.state.lock().unwrap().initialized
    }

    /// Whether `close()` has run.
    pub fn is_closed(&self) -> bool {
        self.core.state.lock().unwrap().closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(SessionError::Closed.into());
        }
        Ok(())
    }

    /// Send a control request on behalf of a consumer-facing operation.
    pub async fn control_request(&self, payload: OutboundControlRequest) -> Result<Value> {
        self.ensure_open()?;
        self.core.control.send_request(&payload).await
    }

    /// Interrupt the current turn.
    pub async fn interrupt(&self) -> Result<()> {
        self.control_request(OutboundControlRequest::Interrupt)
            .await?;
        Ok(())
    }

    /// Change (or reset) the model.
    pub async fn set_model(&self, model: Option<String>) -> Result<()> {
        self.control_request(OutboundControlRequest::SetModel { model })
            .await?;
        Ok(())
    }

    /// Change the permission mode.
    pub async fn set_permission_mode(&self, mode: PermissionMode) -> Result<()> {
        self.control_request(OutboundControlRequest::SetPermissionMode {
            mode: mode.as_str().to_string(),
        })
        .await?;
        Ok(())
    }

    /// Change (or reset) the thinking-token budget.
    pub async fn set_max_thinking_tokens(&self, n: Option<i32>) -> Result<()> {
        self.control_request(OutboundControlRequest::SetMaxThinkingTokens { n })
            .await?;
        Ok(())
    }

    /// Rewind checkpointed files to the state at a user message.
    pub async fn rewind_files(
        &self,
        user_message_id: &str,
        dry_run: bool,
    ) -> Result<Value> {
        self.control_request(OutboundControlRequest::RewindFiles {
            user_message_id: user_message_id.to_string(),
            dry_run: dry_run.then_some(true),
        })
        .await
    }

    /// Connection status of the CLI's MCP servers, as the CLI reports
    /// it.
    pub async fn mcp_status(&self) -> Result<Value> {
        self.control_request(OutboundControlRequest::McpStatus).await
    }

    /// Reconnect one MCP server.
    pub async fn mcp_reconnect(&self, server_name: &str) -> Result<()> {
        self.control_request(OutboundControlRequest::McpReconnect {
            server_name: server_name.to_string(),
        })
        .await?;
        Ok(())
    }

    /// Enable or disable one MCP server.
    pub async fn mcp_toggle(&self, server_name: &str, enabled: bool) -> Result<()> {
        self.control_request(OutboundControlRequest::McpToggle {
            server_name: server_name.to_string(),
            enabled,
        })
        .await?;
        Ok(())
    }

    /// Close the session: stop the loop, tear down the transport,
    /// resolve every pending control request, delete the session's MCP
    /// config file. Idempotent.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.core.state.lock().unwrap();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
        }

        if let Some(task) = self.loop_task.lock().unwrap().take() {
            task.abort();
        }
        let close_result = self.core.transport.close().await;
        self.core.control.fail_all(&SessionError::Closed.into());
        self.core.mcp_config.lock().unwrap().take();
        debug!("session closed");
        close_result
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(task) = self.loop_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

fn validate_options(options: &AgentOptions) -> Result<()> {
    if options.fork_session && options.resume.is_none() && !options.continue_conversation {
        return Err(crate::errors::QueryError::InvalidOptions {
            detail: "fork_session requires resume or continue_conversation".to_string(),
        }
        .into());
    }
    Ok(())
}

/// Write the external MCP server map to a session-owned temp file.
fn materialize_mcp_config(options: &AgentOptions) -> Result<Option<NamedTempFile>> {
    if options.mcp_servers.is_empty() {
        return Ok(None);
    }
    let file = tempfile::Builder::new()
        .prefix("agent-sdk-mcp-")
        .suffix(".json")
        .tempfile()
        .map_err(crate::errors::TransportError::from)?;
    serde_json::to_writer(file.as_file(), &json!({"mcpServers": options.mcp_servers}))?;
    Ok(Some(file))
}

fn into_message(kind: RegularKind, mut raw: Value) -> Message {
    // The enum tag re-adds `type` on serialization.
    if let Some(obj) = raw.as_object_mut() {
        obj.remove("type");
    }
    match kind {
        RegularKind::User => Message::User { raw },
        RegularKind::Assistant => Message::Assistant { raw },
        RegularKind::System => Message::System { raw },
        RegularKind::Result => Message::Result { raw },
    }
}

/// Start the message loop. It owns the transport's single message
/// stream and holds only a weak reference to the core.
fn spawn_message_loop(
    core: &Arc<SessionCore>,
) -> (JoinHandle<()>, mpsc::Receiver<Result<Message>>) {
    let (tx, rx) = mpsc::channel(256);
    let weak: Weak<SessionCore> = Arc::downgrade(core);
    let mut stream = core.transport.read_messages();

    let task = tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            let Some(core) = weak.upgrade() else {
                let _ = tx.send(Err(SessionError::Closed.into())).await;
                return;
            };

            match item {
                Ok(StdoutMessage::Regular { kind, raw }) => {
                    if kind == RegularKind::System
                        && raw.get("subtype").and_then(Value::as_str) == Some("init")
                    {
                        if let Some(id) = raw.get("session_id").and_then(Value::as_str) {
                            core.state.lock().unwrap().session_id = Some(id.to_string());
                        }
                    }
                    if tx.send(Ok(into_message(kind, raw))).await.is_err() {
                        debug!("message consumer dropped, stopping loop");
                        break;
                    }
                }
                Ok(StdoutMessage::ControlRequest {
                    request_id,
                    request,
                }) => {
                    // Dispatch on its own task: handlers may call back
                    // into the session and must not block the loop.
                    tokio::spawn(dispatch_inbound(core, request_id, request));
                }
                Ok(StdoutMessage::ControlResponse(outcome)) => {
                    core.control.handle_outcome(outcome);
                }
                Ok(StdoutMessage::ControlCancel { request_id }) => {
                    core.control.handle_cancel(&request_id);
                }
                Ok(StdoutMessage::KeepAlive) => {}
                Err(e) => {
                    core.control.fail_all(&e);
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }

        match weak.upgrade() {
            Some(core) => core.control.fail_all(&SessionError::Closed.into()),
            // The session itself is gone; do not end the user stream
            // silently.
            None => {
                let _ = tx.send(Err(SessionError::Closed.into())).await;
            }
        }
        debug!("message loop finished");
    });

    (task, rx)
}

/// Serve one inbound control request and write the control response.
async fn dispatch_inbound(core: Arc<SessionCore>, request_id: String, request: Value) {
    let result = serve_inbound(&core, request).await;

    let record = match result {
        Ok(value) => json!({
            "type": "control_response",
            "response": {
                "subtype": "success",
                "request_id": request_id,
                "response": value,
            }
        }),
        Err(e) => json!({
            "type": "control_response",
            "response": {
                "subtype": "error",
                "request_id": request_id,
                "error": e.to_string(),
            }
        }),
    };

    if let Err(e) = write_json_line(core.transport.as_ref(), &record).await {
        error!("failed to write control response: {e}");
    }
}

async fn serve_inbound(core: &SessionCore, request: Value) -> Result<Value> {
    let request: InboundControlRequest = serde_json::from_value(request)
        .map_err(|e| ProtocolError::InvalidMessage(e.to_string()))?;

    match request {
        InboundControlRequest::CanUseTool {
            tool_name,
            input,
            tool_use_id,
            permission_suggestions,
        } => match &core.can_use_tool {
            Some(callback) => {
                let context = ToolPermissionContext {
                    tool_use_id,
                    suggestions: permission_suggestions.unwrap_or_default(),
                };
                let decision = callback(tool_name, input, context).await;
                Ok(serde_json::to_value(decision)?)
            }
            None => Err(ProtocolError::InvalidMessage(
                "no permission handler registered".to_string(),
            )
            .into()),
        },
        InboundControlRequest::HookCallback {
            callback_id,
            input,
            tool_use_id,
        } => match &core.hooks {
            Some(hooks) => Ok(hooks.dispatch(&callback_id, input, tool_use_id).await?),
            None => Err(HookError::CallbackNotFound { id: callback_id }.into()),
        },
        InboundControlRequest::McpMessage {
            server_name,
            message,
        } => Ok(core.router.route(&server_name, &message).await?),
        InboundControlRequest::Initialize { .. } => Ok(json!({"initialized": true})),
        InboundControlRequest::Unknown { raw } => {
            let subtype = raw
                .get("subtype")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            warn!("inbound control request with unknown subtype {subtype:?}");
            Err(ProtocolError::UnknownSubtype(subtype).into())
        }
    }
}
