//! Hook registration and dispatch.
//!
//! User code registers callbacks for session lifecycle events; the
//! registry materializes the registrations into the configuration blob
//! handed to the CLI at initialize, and dispatches inbound
//! `hook_callback` control requests to the right callback by id.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::errors::HookError;

/// Counter backing callback-id generation. Ids are unique within the
/// process lifetime.
static CALLBACK_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_callback_id() -> String {
    format!("hook_{}", CALLBACK_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Default handler timeout.
const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// Events
// ============================================================================

/// Hook event kinds the CLI can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookEvent {
    /// Before a tool runs.
    PreToolUse,
    /// After a tool ran successfully.
    PostToolUse,
    /// After a tool failed.
    PostToolUseFailure,
    /// When the user submits a prompt.
    UserPromptSubmit,
    /// When the agent stops.
    Stop,
    /// When a subagent starts.
    SubagentStart,
    /// When a subagent stops.
    SubagentStop,
    /// Before context compaction.
    PreCompact,
    /// When the CLI is about to prompt the user for a permission.
    PermissionRequest,
    /// When a session starts.
    SessionStart,
    /// When a session ends.
    SessionEnd,
    /// When the CLI emits a notification.
    Notification,
}

impl HookEvent {
    /// All events, in a stable order.
    pub const ALL: [HookEvent; 12] = [
        Self::PreToolUse,
        Self::PostToolUse,
        Self::PostToolUseFailure,
        Self::UserPromptSubmit,
        Self::Stop,
        Self::SubagentStart,
        Self::SubagentStop,
        Self::PreCompact,
        Self::PermissionRequest,
        Self::SessionStart,
        Self::SessionEnd,
        Self::Notification,
    ];

    /// Parse a wire event name.
    pub fn from_name(name: &str) -> Result<Self, HookError> {
        Self::ALL
            .into_iter()
            .find(|event| event.as_str() == name)
            .ok_or(HookError::UnsupportedEvent)
    }

    /// Wire name of the event.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreToolUse => "PreToolUse",
            Self::PostToolUse => "PostToolUse",
            Self::PostToolUseFailure => "PostToolUseFailure",
            Self::UserPromptSubmit => "UserPromptSubmit",
            Self::Stop => "Stop",
            Self::SubagentStart => "SubagentStart",
            Self::SubagentStop => "SubagentStop",
            Self::PreCompact => "PreCompact",
            Self::PermissionRequest => "PermissionRequest",
            Self::SessionStart => "SessionStart",
            Self::SessionEnd => "SessionEnd",
            Self::Notification => "Notification",
        }
    }
}

// ============================================================================
// Inputs
// ============================================================================

/// Fields common to every hook input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BaseHookInput {
    /// Session id.
    #[serde(default)]
    pub session_id: String,
    /// Path to the transcript file.
    #[serde(default)]
    pub transcript_path: String,
    /// Working directory of the session.
    #[serde(default)]
    pub cwd: String,
    /// Current permission mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
}

/// Input delivered to hook callbacks, discriminated by the
/// `hook_event_name` field the CLI sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "hook_event_name")]
pub enum HookInput {
    /// A tool is about to run.
    PreToolUse {
        /// Common fields.
        #[serde(flatten)]
        base: BaseHookInput,
        /// Tool name.
        tool_name: String,
        /// Tool input.
        tool_input: Value,
    },
    /// A tool ran.
    PostToolUse {
        /// Common fields.
        #[serde(flatten)]
        base: BaseHookInput,
        /// Tool name.
        tool_name: String,
        /// Tool input.
        tool_input: Value,
        /// Tool response.
        tool_response: Value,
    },
    /// A tool failed.
    PostToolUseFailure {
        /// Common fields.
        #[serde(flatten)]
        base: BaseHookInput,
        /// Tool name.
        tool_name: String,
        /// Tool input.
        tool_input: Value,
        /// Error message.
        error: String,
    },
    /// The user submitted a prompt.
    UserPromptSubmit {
        /// Common fields.
        #[serde(flatten)]
        base: BaseHookInput,
        /// The submitted prompt.
        prompt: String,
    },
    /// The agent is stopping.
    Stop {
        /// Common fields.
        #[serde(flatten)]
        base: BaseHookInput,
        /// Whether a stop hook is already active.
        #[serde(default)]
        stop_hook_active: bool,
    },
    /// A subagent started.
    SubagentStart {
        /// Common fields.
        #[serde(flatten)]
        base: BaseHookInput,
        /// Subagent type, when reported.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_type: Option<String>,
    },
    /// A subagent stopped.
    SubagentStop {
        /// Common fields.
        #[serde(flatten)]
        base: BaseHookInput,
        /// Whether a stop hook is already active.
        #[serde(default)]
        stop_hook_active: bool,
    },
    /// Context compaction is about to run.
    PreCompact {
        /// Common fields.
        #[serde(flatten)]
        base: BaseHookInput,
        /// What triggered compaction (`manual` or `auto`).
        #[serde(default)]
        trigger: String,
        /// Custom compaction instructions.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        custom_instructions: Option<String>,
    },
    /// The CLI is about to prompt for a permission.
    PermissionRequest {
        /// Common fields.
        #[serde(flatten)]
        base: BaseHookInput,
        /// Tool name.
        tool_name: String,
        /// Tool input.
        tool_input: Value,
    },
    /// A session started.
    SessionStart {
        /// Common fields.
        #[serde(flatten)]
        base: BaseHookInput,
        /// How the session started (`startup`, `resume`, ...).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    /// A session ended.
    SessionEnd {
        /// Common fields.
        #[serde(flatten)]
        base: BaseHookInput,
        /// Why the session ended.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// The CLI emitted a notification.
    Notification {
        /// Common fields.
        #[serde(flatten)]
        base: BaseHookInput,
        /// Notification text.
        #[serde(default)]
        message: String,
    },
}

impl HookInput {
    /// The event kind this input belongs to.
    pub fn event(&self) -> HookEvent {
        match self {
            Self::PreToolUse { .. } => HookEvent::PreToolUse,
            Self::PostToolUse { .. } => HookEvent::PostToolUse,
            Self::PostToolUseFailure { .. } => HookEvent::PostToolUseFailure,
            Self::UserPromptSubmit { .. } => HookEvent::UserPromptSubmit,
            Self::Stop { .. } => HookEvent::Stop,
            Self::SubagentStart { .. } => HookEvent::SubagentStart,
            Self::SubagentStop { .. } => HookEvent::SubagentStop,
            Self::PreCompact { .. } => HookEvent::PreCompact,
            Self::PermissionRequest { .. } => HookEvent::PermissionRequest,
            Self::SessionStart { .. } => HookEvent::SessionStart,
            Self::SessionEnd { .. } => HookEvent::SessionEnd,
            Self::Notification { .. } => HookEvent::Notification,
        }
    }
}

// ============================================================================
// Outputs
// ============================================================================

/// Permission decision a PreToolUse hook can make.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookDecision {
    /// Allow the tool.
    Allow,
    /// Deny the tool.
    Deny,
    /// Fall back to asking the user.
    Ask,
}

/// Output specific to PreToolUse hooks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreToolUseOutput {
    /// Always `"PreToolUse"`.
    pub hook_event_name: String,
    /// Permission decision, if the hook made one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_decision: Option<HookDecision>,
    /// Reason for the decision.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_decision_reason: Option<String>,
    /// Replacement tool input.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<Value>,
    /// Extra context injected into the conversation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_context: Option<String>,
}

/// Output specific to PostToolUse hooks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostToolUseOutput {
    /// Always `"PostToolUse"`.
    pub hook_event_name: String,
    /// Extra context injected into the conversation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_context: Option<String>,
}

/// Event-specific portion of a hook output. Only the tool-use events
/// carry data today.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HookSpecificOutput {
    /// PreToolUse decision payload.
    PreToolUse(PreToolUseOutput),
    /// PostToolUse context payload.
    PostToolUse(PostToolUseOutput),
}

fn continue_default() -> bool {
    true
}

/// Output returned by every hook callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookOutput {
    /// Whether the CLI should continue. Defaults to true.
    #[serde(rename = "continue", default = "continue_default")]
    pub continue_: bool,
    /// Reason shown when `continue` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    /// Suppress the triggering output from the transcript.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suppress_output: Option<bool>,
    /// Message surfaced to the user as a system notice.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
    /// Free-form reason attached to the output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Event-specific payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook_specific_output: Option<HookSpecificOutput>,
}

impl Default for HookOutput {
    fn default() -> Self {
        Self {
            continue_: true,
            stop_reason: None,
            suppress_output: None,
            system_message: None,
            reason: None,
            hook_specific_output: None,
        }
    }
}

impl HookOutput {
    /// Continue without modifying anything.
    pub fn proceed() -> Self {
        Self::default()
    }

    /// Stop the session with a reason.
    pub fn stop(reason: impl Into<String>) -> Self {
        Self {
            continue_: false,
            stop_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Allow the tool, optionally rewriting its input and injecting
    /// extra context. PreToolUse only.
    pub fn allow(updated_input: Option<Value>, additional_context: Option<String>) -> Self {
        Self {
            hook_specific_output: Some(HookSpecificOutput::PreToolUse(PreToolUseOutput {
                hook_event_name: HookEvent::PreToolUse.as_str().to_string(),
                permission_decision: Some(HookDecision::Allow),
                permission_decision_reason: None,
                updated_input,
                additional_context,
            })),
            ..Self::default()
        }
    }

    /// Deny the tool with a reason. PreToolUse only.
    pub fn deny(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            reason: Some(reason.clone()),
            hook_specific_output: Some(HookSpecificOutput::PreToolUse(PreToolUseOutput {
                hook_event_name: HookEvent::PreToolUse.as_str().to_string(),
                permission_decision: Some(HookDecision::Deny),
                permission_decision_reason: Some(reason),
                updated_input: None,
                additional_context: None,
            })),
            ..Self::default()
        }
    }

    /// Defer the decision to the user with a reason. PreToolUse only.
    pub fn ask(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            hook_specific_output: Some(HookSpecificOutput::PreToolUse(PreToolUseOutput {
                hook_event_name: HookEvent::PreToolUse.as_str().to_string(),
                permission_decision: Some(HookDecision::Ask),
                permission_decision_reason: Some(reason),
                updated_input: None,
                additional_context: None,
            })),
            ..Self::default()
        }
    }

    fn pre_tool_use(&self) -> Option<&PreToolUseOutput> {
        match &self.hook_specific_output {
            Some(HookSpecificOutput::PreToolUse(out)) => Some(out),
            _ => None,
        }
    }

    /// The permission decision, for PreToolUse outputs.
    pub fn decision(&self) -> Option<HookDecision> {
        self.pre_tool_use().and_then(|o| o.permission_decision)
    }
}

/// Combine the outputs of several hooks that matched the same tool
/// event, in registration order: the first deny wins outright; absent a
/// deny, the last `updated_input` is adopted and additional contexts
/// are concatenated in order.
pub fn merge_hook_outputs(outputs: &[HookOutput]) -> HookOutput {
    if let Some(denied) = outputs
        .iter()
        .find(|o| o.decision() == Some(HookDecision::Deny))
    {
        return denied.clone();
    }

    let mut merged = HookOutput::proceed();
    let mut decision = None;
    let mut updated_input = None;
    let mut contexts: Vec<String> = Vec::new();

    for output in outputs {
        if !output.continue_ {
            merged.continue_ = false;
            merged.stop_reason = output.stop_reason.clone();
        }
        if let Some(out) = output.pre_tool_use() {
            if let Some(d) = out.permission_decision {
                // Ask outranks allow; deny was handled above.
                if decision != Some(HookDecision::Ask) {
                    decision = Some(d);
                }
            }
            if out.updated_input.is_some() {
                updated_input = out.updated_input.clone();
            }
            if let Some(ctx) = &out.additional_context {
                contexts.push(ctx.clone());
            }
        }
    }

    if decision.is_some() || updated_input.is_some() || !contexts.is_empty() {
        merged.hook_specific_output = Some(HookSpecificOutput::PreToolUse(PreToolUseOutput {
            hook_event_name: HookEvent::PreToolUse.as_str().to_string(),
            permission_decision: decision,
            permission_decision_reason: None,
            updated_input,
            additional_context: if contexts.is_empty() {
                None
            } else {
                Some(contexts.join("\n"))
            },
        }));
    }

    merged
}

// ============================================================================
// Registry
// ============================================================================

/// Context for hook callbacks. Reserved for abort-signal support.
#[derive(Debug, Clone, Default)]
pub struct HookContext {}

/// Future type returned by hook callbacks.
pub type HookCallbackFuture = Pin<Box<dyn Future<Output = HookOutput> + Send>>;

/// Callback invoked for a hook event. Receives the decoded input, the
/// tool use id for tool-related events, and the context.
pub type HookCallback =
    Arc<dyn Fn(HookInput, Option<String>, HookContext) -> HookCallbackFuture + Send + Sync>;

struct HookEntry {
    event: HookEvent,
    matcher: Option<String>,
    pattern: Option<Regex>,
    timeout: Duration,
    callback_id: String,
    callback: HookCallback,
}

/// Registry of hook callbacks for one session.
///
/// Registrations are announced to the CLI at initialize via
/// [`HookRegistry::hook_config`]; inbound `hook_callback` requests are
/// dispatched by callback id.
#[derive(Default)]
pub struct HookRegistry {
    entries: Mutex<Vec<HookEntry>>,
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("entries", &self.len())
            .finish()
    }
}

impl HookRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for an event with the default 60s timeout.
    ///
    /// `matcher` is an optional regular expression the CLI applies to
    /// the tool name for tool-related events. Returns the generated
    /// callback id.
    pub fn register<F, Fut>(
        &self,
        event: HookEvent,
        matcher: Option<&str>,
        callback: F,
    ) -> Result<String, HookError>
    where
        F: Fn(HookInput, Option<String>, HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookOutput> + Send + 'static,
    {
        self.register_with_timeout(event, matcher, DEFAULT_HOOK_TIMEOUT, callback)
    }

    /// Register a callback with an explicit handler timeout.
    pub fn register_with_timeout<F, Fut>(
        &self,
        event: HookEvent,
        matcher: Option<&str>,
        timeout: Duration,
        callback: F,
    ) -> Result<String, HookError>
    where
        F: Fn(HookInput, Option<String>, HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookOutput> + Send + 'static,
    {
        let pattern = matcher
            .map(|m| {
                Regex::new(m).map_err(|e| HookError::InvalidMatcher {
                    detail: e.to_string(),
                })
            })
            .transpose()?;

        let callback_id = next_callback_id();
        let entry = HookEntry {
            event,
            matcher: matcher.map(str::to_string),
            pattern,
            timeout,
            callback_id: callback_id.clone(),
            callback: Arc::new(move |input, tool_use_id, ctx| {
                Box::pin(callback(input, tool_use_id, ctx))
            }),
        };

        self.entries.lock().unwrap().push(entry);
        Ok(callback_id)
    }

    /// Number of registered callbacks.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether the registry has no registrations.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Callback ids registered for `event` whose matcher accepts
    /// `tool_name`, in registration order. Entries without a matcher
    /// always match.
    pub fn callbacks_for(&self, event: HookEvent, tool_name: &str) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event == event)
            .filter(|e| match &e.pattern {
                Some(p) => p.is_match(tool_name),
                None => true,
            })
            .map(|e| e.callback_id.clone())
            .collect()
    }

    /// Materialize the registrations as the configuration blob the CLI
    /// consumes at initialize: event name → list of
    /// `{matcher?, hookCallbackIds, timeout}`.
    pub fn hook_config(&self) -> Option<Value> {
        let entries = self.entries.lock().unwrap();
        if entries.is_empty() {
            return None;
        }

        let mut config = serde_json::Map::new();
        for entry in entries.iter() {
            let mut matcher_obj = serde_json::Map::new();
            if let Some(matcher) = &entry.matcher {
                matcher_obj.insert("matcher".to_string(), Value::String(matcher.clone()));
            }
            matcher_obj.insert(
                "hookCallbackIds".to_string(),
                serde_json::json!([entry.callback_id]),
            );
            matcher_obj.insert(
                "timeout".to_string(),
                serde_json::json!(entry.timeout.as_secs()),
            );

            let event_entry = config
                .entry(entry.event.as_str().to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(list) = event_entry {
                list.push(Value::Object(matcher_obj));
            }
        }

        Some(Value::Object(config))
    }

    /// Dispatch an inbound `hook_callback` request. Decodes the input,
    /// checks it against the event the id was registered for, runs the
    /// handler under its timeout, and returns the encoded output.
    pub async fn dispatch(
        &self,
        callback_id: &str,
        input: Value,
        tool_use_id: Option<String>,
    ) -> Result<Value, HookError> {
        // Snapshot under the lock; the handler runs outside it.
        let (event, timeout, callback) = {
            let entries = self.entries.lock().unwrap();
            let entry = entries
                .iter()
                .find(|e| e.callback_id == callback_id)
                .ok_or_else(|| HookError::CallbackNotFound {
                    id: callback_id.to_string(),
                })?;
            (entry.event, entry.timeout, Arc::clone(&entry.callback))
        };

        let input: HookInput =
            serde_json::from_value(input).map_err(|e| HookError::InvalidInput {
                detail: e.to_string(),
            })?;

        if input.event() != event {
            return Err(HookError::InvalidInput {
                detail: format!(
                    "callback {} is registered for {} but received {} input",
                    callback_id,
                    event.as_str(),
                    input.event().as_str()
                ),
            });
        }

        let fut = callback(input, tool_use_id, HookContext::default());
        let output = tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| HookError::Timeout {
                id: callback_id.to_string(),
            })?;

        serde_json::to_value(&output).map_err(|e| HookError::InvalidInput {
            detail: format!("failed to encode hook output: {e}"),
        })
    }
}
