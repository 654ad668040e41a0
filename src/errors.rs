//! Error types for the Agent CLI SDK.
//!
//! Each failure domain gets its own enum (transport, protocol, hooks,
//! tools, session, query); [`SdkError`] is the umbrella the public API
//! returns. Matching on a domain enum is the intended way to handle a
//! specific failure class.

use std::io;
use thiserror::Error;

/// Errors raised by the transport layer that owns the CLI subprocess.
#[derive(Error, Debug)]
pub enum TransportError {
    /// A write was attempted before `start()` or after `close()`.
    #[error("transport not connected")]
    NotConnected,

    /// `read_messages()` was called a second time; the stream is
    /// single-consumer.
    #[error("message stream already consumed")]
    AlreadyConsumed,

    /// The CLI process exited with a non-zero status.
    #[error("CLI process exited with code {code:?}")]
    ProcessExited {
        /// Exit code, if the process exited normally.
        code: Option<i32>,
    },

    /// The CLI process could not be spawned.
    #[error("failed to spawn CLI process: {message}")]
    SpawnFailed {
        /// What went wrong.
        message: String,
        /// Underlying IO error, if any.
        #[source]
        source: Option<io::Error>,
    },

    /// An IO error on one of the child's pipes.
    #[error("transport IO error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Create a spawn failure with an underlying IO error.
    pub fn spawn_failed(message: impl Into<String>, source: io::Error) -> Self {
        Self::SpawnFailed {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a spawn failure without an IO cause (e.g. locator not found).
    pub fn spawn_failed_message(message: impl Into<String>) -> Self {
        Self::SpawnFailed {
            message: message.into(),
            source: None,
        }
    }
}

/// Errors raised by the control request/response protocol.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// No response arrived for the request within its timeout.
    #[error("control request {request_id} timed out")]
    Timeout {
        /// Id of the request that timed out.
        request_id: String,
    },

    /// The pending request was cancelled (CLI cancel, caller
    /// cancellation, or session close).
    #[error("control request {request_id} cancelled")]
    Cancelled {
        /// Id of the cancelled request.
        request_id: String,
    },

    /// The CLI answered with an error subtype.
    #[error("CLI returned error for request {request_id}: {message}")]
    ResponseError {
        /// Id of the failed request.
        request_id: String,
        /// Error message reported by the CLI.
        message: String,
    },

    /// An inbound control request carried a subtype this SDK does not
    /// understand.
    #[error("unknown control request subtype: {0}")]
    UnknownSubtype(String),

    /// A control message was structurally invalid.
    #[error("invalid control message: {0}")]
    InvalidMessage(String),
}

/// Errors raised while registering or dispatching hooks.
#[derive(Error, Debug)]
pub enum HookError {
    /// The CLI referenced a callback id this session never registered.
    #[error("hook callback not found: {id}")]
    CallbackNotFound {
        /// The unknown callback id.
        id: String,
    },

    /// The event name is not one of the supported hook events.
    #[error("unsupported hook event")]
    UnsupportedEvent,

    /// The hook input payload did not decode into the shape registered
    /// for the callback's event.
    #[error("invalid hook input: {detail}")]
    InvalidInput {
        /// Decode failure detail.
        detail: String,
    },

    /// The matcher pattern supplied at registration is not a valid
    /// regular expression.
    #[error("invalid hook matcher: {detail}")]
    InvalidMatcher {
        /// Regex compile error detail.
        detail: String,
    },

    /// The handler did not finish within the registration's timeout.
    #[error("hook callback {id} timed out")]
    Timeout {
        /// Callback id of the slow handler.
        id: String,
    },
}

/// Errors raised by the in-process tool server router.
#[derive(Error, Debug)]
pub enum ToolError {
    /// No tool server registered under the requested name.
    #[error("tool server not found: {name}")]
    ServerNotFound {
        /// The unknown server name.
        name: String,
    },

    /// The server has no tool with the requested name.
    #[error("tool not found: {name}")]
    ToolNotFound {
        /// The unknown tool name.
        name: String,
    },

    /// `tools/call` arguments failed validation.
    #[error("invalid tool arguments: {detail}")]
    InvalidArguments {
        /// Validation detail.
        detail: String,
    },

    /// The JSON-RPC method is not one the router serves.
    #[error("unknown method: {method}")]
    UnknownMethod {
        /// The unsupported method name.
        method: String,
    },

    /// The tool handler itself failed.
    #[error("tool execution failed: {detail}")]
    ExecutionFailed {
        /// Handler failure detail.
        detail: String,
    },
}

/// Errors raised by session lifecycle operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session has been closed; no further operations are possible.
    #[error("session closed")]
    Closed,

    /// An operation required a completed initialize round-trip.
    #[error("session not initialized")]
    NotInitialized,

    /// The initialize control request failed.
    #[error("session initialization failed: {cause}")]
    InitializationFailed {
        /// Why initialization failed.
        cause: String,
    },
}

/// Errors raised by the query facade before a session is running.
#[derive(Error, Debug)]
pub enum QueryError {
    /// The CLI could not be located or launched.
    #[error("failed to launch CLI: {cause}")]
    LaunchFailed {
        /// Launch failure detail.
        cause: String,
    },

    /// The supplied options are inconsistent.
    #[error("invalid options: {detail}")]
    InvalidOptions {
        /// What is wrong with the options.
        detail: String,
    },
}

/// Umbrella error type returned by the public API.
#[derive(Error, Debug)]
pub enum SdkError {
    /// Transport-layer failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Control-protocol failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Hook registration or dispatch failure.
    #[error(transparent)]
    Hook(#[from] HookError),

    /// Tool server failure.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// Session lifecycle failure.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Query construction failure.
    #[error(transparent)]
    Query(#[from] QueryError),

    /// A JSON (de)serialization failure inside the SDK itself.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SdkError {
    /// Whether this error means the session/transport is gone and the
    /// operation can not be retried on the same handle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Transport(
                TransportError::ProcessExited { .. } | TransportError::NotConnected
            ) | Self::Session(SessionError::Closed)
        )
    }

    /// Whether this error is a per-request timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Protocol(ProtocolError::Timeout { .. }))
    }
}

/// Result type alias for SDK operations.
pub type Result<T> = std::result::Result<T, SdkError>;

/// Clone-ish helper: errors are not `Clone`, but the message loop needs
/// to hand the same failure to every pending waiter and then to the
/// user stream. This re-materializes an equivalent error.
pub(crate) fn replicate(err: &SdkError) -> SdkError {
    match err {
        SdkError::Transport(TransportError::NotConnected) => {
            TransportError::NotConnected.into()
        }
        SdkError::Transport(TransportError::AlreadyConsumed) => {
            TransportError::AlreadyConsumed.into()
        }
        SdkError::Transport(TransportError::ProcessExited { code }) => {
            TransportError::ProcessExited { code: *code }.into()
        }
        SdkError::Session(SessionError::Closed) => SessionError::Closed.into(),
        other => {
            ProtocolError::InvalidMessage(other.to_string()).into()
        }
    }
}
