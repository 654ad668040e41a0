//! Type definitions for the Agent CLI SDK.
//!
//! This module contains the option configuration, permission types,
//! user-visible message types, and the control-protocol wire payloads.
//! Message payloads are kept as raw JSON: the SDK is transport and
//! coordination only and never interprets assistant content.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::hooks::HookRegistry;
use crate::mcp::ToolServer;

// ============================================================================
// Permission Types
// ============================================================================

/// Permission modes controlling how the CLI handles tool permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PermissionMode {
    /// Ask for permission on sensitive operations.
    #[default]
    #[serde(rename = "default")]
    Default,
    /// Automatically accept all file edits.
    #[serde(rename = "acceptEdits")]
    AcceptEdits,
    /// Plan-only mode; nothing is executed.
    #[serde(rename = "plan")]
    Plan,
    /// Bypass all permission checks (dangerous).
    #[serde(rename = "bypassPermissions")]
    BypassPermissions,
}

impl PermissionMode {
    /// Wire name of the mode, as the CLI expects it.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::Plan => "plan",
            Self::BypassPermissions => "bypassPermissions",
        }
    }
}

/// Context handed to a permission callback along with the tool request.
#[derive(Debug, Clone, Default)]
pub struct ToolPermissionContext {
    /// Id of the tool use being authorized.
    pub tool_use_id: Option<String>,
    /// Raw permission suggestions forwarded from the CLI.
    pub suggestions: Vec<Value>,
}

/// Allow decision returned from a permission callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionResultAllow {
    /// Always `"allow"`.
    pub behavior: String,
    /// Replacement input for the tool, if the callback rewrote it.
    #[serde(rename = "updatedInput", skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<Value>,
}

/// Deny decision returned from a permission callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionResultDeny {
    /// Always `"deny"`.
    pub behavior: String,
    /// Why the tool use was denied.
    #[serde(default)]
    pub message: String,
    /// Whether the CLI should also interrupt the current turn.
    #[serde(default)]
    pub interrupt: bool,
}

/// Decision returned from a permission callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PermissionResult {
    /// Allow the tool to execute.
    Allow(PermissionResultAllow),
    /// Deny the tool execution.
    Deny(PermissionResultDeny),
}

impl PermissionResult {
    /// Allow the tool with its input unchanged.
    pub fn allow() -> Self {
        Self::Allow(PermissionResultAllow {
            behavior: "allow".to_string(),
            updated_input: None,
        })
    }

    /// Allow the tool with a rewritten input.
    pub fn allow_with_input(updated_input: Value) -> Self {
        Self::Allow(PermissionResultAllow {
            behavior: "allow".to_string(),
            updated_input: Some(updated_input),
        })
    }

    /// Deny the tool without explanation.
    pub fn deny() -> Self {
        Self::Deny(PermissionResultDeny {
            behavior: "deny".to_string(),
            message: String::new(),
            interrupt: false,
        })
    }

    /// Deny the tool with a message.
    pub fn deny_with_message(message: impl Into<String>) -> Self {
        Self::Deny(PermissionResultDeny {
            behavior: "deny".to_string(),
            message: message.into(),
            interrupt: false,
        })
    }
}

/// Future type returned by permission callbacks.
pub type CanUseToolFuture = Pin<Box<dyn Future<Output = PermissionResult> + Send>>;

/// Callback invoked when the CLI asks whether a tool may run.
///
/// Arguments: tool name, tool input, context (tool use id and CLI
/// suggestions). The returned decision is sent back on the control
/// channel.
pub type CanUseTool =
    Arc<dyn Fn(String, Value, ToolPermissionContext) -> CanUseToolFuture + Send + Sync>;

// ============================================================================
// Messages
// ============================================================================

/// A user-visible message from the CLI stream.
///
/// Payloads are preserved as raw JSON; the accessor methods pull out
/// the handful of fields the SDK itself needs (result detection,
/// session id) without committing to a full schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// A user message echoed back by the CLI.
    #[serde(rename = "user")]
    User {
        /// Full record as received.
        #[serde(flatten)]
        raw: Value,
    },
    /// An assistant message.
    #[serde(rename = "assistant")]
    Assistant {
        /// Full record as received.
        #[serde(flatten)]
        raw: Value,
    },
    /// A system message (init, status, notices).
    #[serde(rename = "system")]
    System {
        /// Full record as received.
        #[serde(flatten)]
        raw: Value,
    },
    /// The terminal result record of a turn.
    #[serde(rename = "result")]
    Result {
        /// Full record as received.
        #[serde(flatten)]
        raw: Value,
    },
}

impl Message {
    /// Raw payload of the message, whatever its variant.
    pub fn raw(&self) -> &Value {
        match self {
            Self::User { raw }
            | Self::Assistant { raw }
            | Self::System { raw }
            | Self::Result { raw } => raw,
        }
    }

    /// Whether this is the terminal `result` message of a turn.
    pub fn is_result(&self) -> bool {
        matches!(self, Self::Result { .. })
    }

    /// Whether this is an assistant message.
    pub fn is_assistant(&self) -> bool {
        matches!(self, Self::Assistant { .. })
    }

    /// The `subtype` field, if present (system and result messages).
    pub fn subtype(&self) -> Option<&str> {
        self.raw().get("subtype").and_then(Value::as_str)
    }

    /// The `session_id` field, if present.
    pub fn session_id(&self) -> Option<&str> {
        self.raw().get("session_id").and_then(Value::as_str)
    }

    /// Concatenated text of an assistant message's text blocks.
    /// Empty for other variants.
    pub fn text(&self) -> String {
        let Self::Assistant { raw } = self else {
            return String::new();
        };
        let blocks = raw
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_array);
        let Some(blocks) = blocks else {
            return String::new();
        };
        blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect()
    }

    /// For a result message: whether the CLI flagged it as an error.
    pub fn is_error_result(&self) -> bool {
        matches!(self, Self::Result { raw }
            if raw.get("is_error").and_then(Value::as_bool).unwrap_or(false))
    }
}

// ============================================================================
// Control Protocol Wire Types
// ============================================================================

/// Payload of a control request the SDK sends to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "subtype")]
pub enum OutboundControlRequest {
    /// Hand the CLI the session configuration before the first prompt.
    #[serde(rename = "initialize")]
    Initialize {
        /// Hook configuration blob from the hook registry.
        #[serde(skip_serializing_if = "Option::is_none")]
        hooks_config: Option<Value>,
        /// Descriptors of the in-process tool servers.
        #[serde(skip_serializing_if = "Option::is_none")]
        sdk_tool_servers: Option<Value>,
        /// System prompt override.
        #[serde(skip_serializing_if = "Option::is_none")]
        system_prompt: Option<String>,
        /// Text appended to the CLI's own system prompt.
        #[serde(skip_serializing_if = "Option::is_none")]
        append_system_prompt: Option<String>,
    },
    /// Stop the current turn.
    #[serde(rename = "interrupt")]
    Interrupt,
    /// Change the permission mode.
    #[serde(rename = "set_permission_mode")]
    SetPermissionMode {
        /// New mode, wire-encoded.
        mode: String,
    },
    /// Change (or clear) the model.
    #[serde(rename = "set_model")]
    SetModel {
        /// New model; `None` restores the default.
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    /// Change (or clear) the thinking-token budget.
    #[serde(rename = "set_max_thinking_tokens")]
    SetMaxThinkingTokens {
        /// New budget; `None` restores the default.
        #[serde(skip_serializing_if = "Option::is_none")]
        n: Option<i32>,
    },
    /// Restore checkpointed files to the state at a user message.
    #[serde(rename = "rewind_files")]
    RewindFiles {
        /// Target user message id.
        user_message_id: String,
        /// Report what would change without changing it.
        #[serde(skip_serializing_if = "Option::is_none")]
        dry_run: Option<bool>,
    },
    /// Ask for the connection status of configured MCP servers.
    #[serde(rename = "mcp_status")]
    McpStatus,
    /// Reconnect one MCP server.
    #[serde(rename = "mcp_reconnect")]
    McpReconnect {
        /// Server to reconnect.
        server_name: String,
    },
    /// Enable or disable one MCP server.
    #[serde(rename = "mcp_toggle")]
    McpToggle {
        /// Server to toggle.
        server_name: String,
        /// Desired state.
        enabled: bool,
    },
}

/// Payload of a control request the CLI sends to the SDK.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "subtype")]
pub enum InboundControlRequest {
    /// Permission check for a tool use.
    #[serde(rename = "can_use_tool")]
    CanUseTool {
        /// Tool being requested.
        tool_name: String,
        /// Tool input.
        input: Value,
        /// Id of the tool use.
        tool_use_id: Option<String>,
        /// CLI permission suggestions.
        #[serde(default)]
        permission_suggestions: Option<Vec<Value>>,
    },
    /// Invocation of a registered hook callback.
    #[serde(rename = "hook_callback")]
    HookCallback {
        /// Registered callback id.
        callback_id: String,
        /// Event-specific input payload.
        input: Value,
        /// Tool use id, for tool-related events.
        tool_use_id: Option<String>,
    },
    /// JSON-RPC message for an in-process tool server.
    #[serde(rename = "mcp_message")]
    McpMessage {
        /// Target server name.
        server_name: String,
        /// JSON-RPC 2.0 envelope.
        message: Value,
    },
    /// The CLI announces its own initialization.
    #[serde(rename = "initialize")]
    Initialize {
        /// CLI-side capability payload, unused by the SDK.
        #[serde(flatten)]
        rest: Value,
    },
    /// Anything this SDK version does not understand.
    #[serde(untagged)]
    Unknown {
        /// The unrecognized payload.
        #[serde(flatten)]
        raw: Value,
    },
}

impl InboundControlRequest {
    /// Wire subtype for diagnostics.
    pub fn subtype(&self) -> &str {
        match self {
            Self::CanUseTool { .. } => "can_use_tool",
            Self::HookCallback { .. } => "hook_callback",
            Self::McpMessage { .. } => "mcp_message",
            Self::Initialize { .. } => "initialize",
            Self::Unknown { raw } => raw
                .get("subtype")
                .and_then(Value::as_str)
                .unwrap_or("unknown"),
        }
    }
}

/// Outcome of a control response, correlated by request id.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlOutcome {
    /// Success; carries the CLI's response value.
    Success {
        /// Echoed request id.
        request_id: String,
        /// Response payload, `Null` when the CLI sent none.
        value: Value,
    },
    /// Error reported by the CLI.
    Error {
        /// Echoed request id.
        request_id: String,
        /// Error message.
        message: String,
    },
}

impl ControlOutcome {
    /// The request id this outcome is for.
    pub fn request_id(&self) -> &str {
        match self {
            Self::Success { request_id, .. } | Self::Error { request_id, .. } => request_id,
        }
    }
}

// ============================================================================
// Options
// ============================================================================

/// Default per-request control timeout.
pub(crate) const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration for a query or persistent session.
///
/// Constructed with [`AgentOptions::new`] and the `with_*` builder
/// methods; fields are public for direct manipulation where a builder
/// would just be noise.
#[derive(Clone, Default)]
pub struct AgentOptions {
    /// Model to use.
    pub model: Option<String>,
    /// Model to fall back to when the primary is overloaded.
    pub fallback_model: Option<String>,
    /// Replacement system prompt.
    pub system_prompt: Option<String>,
    /// Text appended to the CLI's default system prompt.
    pub append_system_prompt: Option<String>,
    /// Permission mode.
    pub permission_mode: Option<PermissionMode>,
    /// Maximum number of agent turns per prompt.
    pub max_turns: Option<u32>,
    /// Thinking-token budget.
    pub max_thinking_tokens: Option<i32>,
    /// Continue the most recent conversation.
    pub continue_conversation: bool,
    /// Resume a specific session id.
    pub resume: Option<String>,
    /// Fork the resumed session instead of appending to it.
    pub fork_session: bool,
    /// Tools the CLI may use without asking.
    pub allowed_tools: Vec<String>,
    /// Tools the CLI must never use.
    pub disallowed_tools: Vec<String>,
    /// Extra directories the CLI may access.
    pub add_dirs: Vec<PathBuf>,
    /// Working directory for the CLI process.
    pub cwd: Option<PathBuf>,
    /// Explicit path to the CLI executable; otherwise resolved on PATH.
    pub cli_path: Option<PathBuf>,
    /// Settings JSON blob passed through to the CLI.
    pub settings: Option<String>,
    /// User identifier.
    pub user: Option<String>,
    /// Additional environment variables for the child process.
    pub env: HashMap<String, String>,
    /// Escape hatch for CLI flags this SDK does not model. Keys are
    /// flag names without the leading `--`; `None` values emit a bare
    /// flag.
    pub extra_args: HashMap<String, Option<String>>,
    /// Maximum bytes buffered per stdout line.
    pub max_buffer_size: Option<usize>,
    /// Callback receiving the child's stderr, line by line.
    pub stderr: Option<Arc<dyn Fn(String) + Send + Sync>>,
    /// Permission callback for `can_use_tool` requests.
    pub can_use_tool: Option<CanUseTool>,
    /// Hook registry; registrations are announced at initialize.
    pub hooks: Option<Arc<HookRegistry>>,
    /// In-process tool servers, keyed by server name.
    pub tool_servers: Vec<ToolServer>,
    /// External MCP server configuration map, materialized to a
    /// session-owned config file.
    pub mcp_servers: HashMap<String, Value>,
    /// Per-request control timeout in seconds (default 60).
    pub control_timeout_secs: Option<u64>,
}

impl std::fmt::Debug for AgentOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentOptions")
            .field("model", &self.model)
            .field("system_prompt", &self.system_prompt)
            .field("permission_mode", &self.permission_mode)
            .field("max_turns", &self.max_turns)
            .field("resume", &self.resume)
            .field("allowed_tools", &self.allowed_tools)
            .field("disallowed_tools", &self.disallowed_tools)
            .field("cwd", &self.cwd)
            .field("cli_path", &self.cli_path)
            .field("can_use_tool", &self.can_use_tool.as_ref().map(|_| "<callback>"))
            .field("hooks", &self.hooks.as_ref().map(|h| h.len()))
            .field("tool_servers", &self.tool_servers.len())
            .field("stderr", &self.stderr.as_ref().map(|_| "<callback>"))
            .finish_non_exhaustive()
    }
}

impl AgentOptions {
    /// Create options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the system prompt.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Append to the CLI's default system prompt.
    pub fn with_append_system_prompt(mut self, text: impl Into<String>) -> Self {
        self.append_system_prompt = Some(text.into());
        self
    }

    /// Set the permission mode.
    pub fn with_permission_mode(mut self, mode: PermissionMode) -> Self {
        self.permission_mode = Some(mode);
        self
    }

    /// Set the maximum number of turns.
    pub fn with_max_turns(mut self, turns: u32) -> Self {
        self.max_turns = Some(turns);
        self
    }

    /// Set the working directory.
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Set the allowed tool list.
    pub fn with_allowed_tools(mut self, tools: Vec<String>) -> Self {
        self.allowed_tools = tools;
        self
    }

    /// Set the per-request control timeout in seconds. `0` disables it.
    pub fn with_control_timeout_secs(mut self, secs: u64) -> Self {
        self.control_timeout_secs = Some(secs);
        self
    }

    /// Set the hook registry.
    pub fn with_hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Add an in-process tool server.
    pub fn with_tool_server(mut self, server: ToolServer) -> Self {
        self.tool_servers.push(server);
        self
    }

    /// Set the permission callback.
    pub fn with_can_use_tool<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(String, Value, ToolPermissionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = PermissionResult> + Send + 'static,
    {
        self.can_use_tool = Some(Arc::new(move |name, input, ctx| {
            Box::pin(callback(name, input, ctx))
        }));
        self
    }

    /// Effective control timeout as a `Duration`; `None` means no limit.
    pub(crate) fn control_timeout(&self) -> Option<Duration> {
        match self.control_timeout_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => Some(DEFAULT_CONTROL_TIMEOUT),
        }
    }

    /// Whether the session needs an initialize round-trip before the
    /// first prompt.
    pub(crate) fn needs_initialize(&self) -> bool {
        self.hooks.as_ref().map(|h| h.len() > 0).unwrap_or(false)
            || !self.tool_servers.is_empty()
            || self.can_use_tool.is_some()
            || self.system_prompt.is_some()
            || self.append_system_prompt.is_some()
    }
}
