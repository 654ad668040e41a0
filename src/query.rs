//! One-shot and streaming-input queries.
//!
//! [`query`] sends a single prompt and returns a stream that finishes
//! after the CLI's `result` message. [`query_stream`] feeds a
//! caller-supplied sequence of records instead of one prompt. For
//! multi-turn conversations use [`AgentClient`](crate::AgentClient).

use serde_json::Value;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt};
use tracing::warn;

use crate::errors::{QueryError, Result, SdkError};
use crate::types::{AgentOptions, Message, PermissionMode};
use crate::_internal::session::Session;
use crate::_internal::transport::{find_cli, Transport};

/// Stream of messages for one query.
///
/// Yields every message up to and including the `result`, then
/// finishes and closes the session. Control operations remain available
/// while the stream is live.
pub struct QueryStream {
    session: Arc<Session>,
    rx: mpsc::Receiver<Result<Message>>,
    done: bool,
}

impl QueryStream {
    fn new(session: Arc<Session>, rx: mpsc::Receiver<Result<Message>>) -> Self {
        Self {
            session,
            rx,
            done: false,
        }
    }

    /// Session id from the CLI's init message, once it has arrived.
    pub fn session_id(&self) -> Option<String> {
        self.session.session_id()
    }

    /// Interrupt the current turn.
    pub async fn interrupt(&self) -> Result<()> {
        self.session.interrupt().await
    }

    /// Change (or reset) the model.
    pub async fn set_model(&self, model: Option<String>) -> Result<()> {
        self.session.set_model(model).await
    }

    /// Change the permission mode.
    pub async fn set_permission_mode(&self, mode: PermissionMode) -> Result<()> {
        self.session.set_permission_mode(mode).await
    }

    /// Change (or reset) the thinking-token budget.
    pub async fn set_max_thinking_tokens(&self, n: Option<i32>) -> Result<()> {
        self.session.set_max_thinking_tokens(n).await
    }

    /// Rewind checkpointed files to the state at a user message.
    pub async fn rewind_files(&self, user_message_id: &str, dry_run: bool) -> Result<Value> {
        self.session.rewind_files(user_message_id, dry_run).await
    }

    /// MCP server status, as reported by the CLI.
    pub async fn mcp_status(&self) -> Result<Value> {
        self.session.mcp_status().await
    }

    /// Reconnect one MCP server.
    pub async fn mcp_reconnect(&self, server_name: &str) -> Result<()> {
        self.session.mcp_reconnect(server_name).await
    }

    /// Enable or disable one MCP server.
    pub async fn mcp_toggle(&self, server_name: &str, enabled: bool) -> Result<()> {
        self.session.mcp_toggle(server_name, enabled).await
    }

    /// Close the session early.
    pub async fn close(&self) -> Result<()> {
        self.session.close().await
    }
}

impl Stream for QueryStream {
    type Item = Result<Message>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(msg))) => {
                if msg.is_result() {
                    this.done = true;
                    let session = Arc::clone(&this.session);
                    tokio::spawn(async move {
                        let _ = session.close().await;
                    });
                }
                Poll::Ready(Some(Ok(msg)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.done = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Send one prompt and stream the response.
///
/// The session's message loop is started before initialize (the
/// response arrives on the same stream), and the prompt is written only
/// after initialize has completed.
pub async fn query(prompt: &str, options: Option<AgentOptions>) -> Result<QueryStream> {
    let options = options.unwrap_or_default();
    let (session, rx) = Session::launch(&options).await?;
    let session = Arc::new(session);
    session.send_prompt(prompt).await?;
    Ok(QueryStream::new(session, rx))
}

/// Like [`query`] but over a caller-provided transport. Intended for
/// custom transports and tests; the transport is started here.
pub async fn query_with_transport(
    prompt: &str,
    options: Option<AgentOptions>,
    transport: Arc<dyn Transport>,
) -> Result<QueryStream> {
    let options = options.unwrap_or_default();
    transport.start().await?;
    let (session, rx) = Session::from_transport(transport, &options, None).await?;
    let session = Arc::new(session);
    session.send_prompt(prompt).await?;
    Ok(QueryStream::new(session, rx))
}

/// Streaming-input query: each record from `records` is written as one
/// JSON line as it is produced; the end of the sequence closes the
/// child's stdin.
pub async fn query_stream<S>(records: S, options: Option<AgentOptions>) -> Result<QueryStream>
where
    S: Stream<Item = Value> + Send + Unpin + 'static,
{
    let options = options.unwrap_or_default();
    let (session, rx) = Session::launch(&options).await?;
    let session = Arc::new(session);

    let writer_session = Arc::clone(&session);
    tokio::spawn(async move {
        let mut records = records;
        while let Some(record) = records.next().await {
            if let Err(e) = writer_session.write_record(&record).await {
                warn!("stopping input writer: {e}");
                return;
            }
        }
        let _ = writer_session.end_input().await;
    });

    Ok(QueryStream::new(session, rx))
}

/// Run a query and collect every message.
pub async fn query_all(prompt: &str, options: Option<AgentOptions>) -> Result<Vec<Message>> {
    let mut stream = query(prompt, options).await?;
    let mut messages = Vec::new();
    while let Some(item) = stream.next().await {
        messages.push(item?);
    }
    Ok(messages)
}

/// Run a query and return the concatenated assistant text plus the
/// final result message.
pub async fn query_result(
    prompt: &str,
    options: Option<AgentOptions>,
) -> Result<(String, Message)> {
    let mut stream = query(prompt, options).await?;
    let mut text = String::new();

    while let Some(item) = stream.next().await {
        let msg = item?;
        if msg.is_assistant() {
            text.push_str(&msg.text());
        }
        if msg.is_result() {
            return Ok((text, msg));
        }
    }

    Err(QueryError::LaunchFailed {
        cause: "stream ended without a result message".to_string(),
    }
    .into())
}

/// Result of [`validate_setup`]: where the CLI was found and what it
/// reports as its version.
#[derive(Debug, Clone)]
pub struct CliInfo {
    /// Resolved executable path.
    pub path: PathBuf,
    /// Version string reported by `--version`.
    pub version: String,
}

/// Verify the Agent CLI is installed and recent enough.
///
/// The executable is resolved with a programmatic PATH search and
/// invoked directly with `--version` as a discrete argument; no shell
/// is involved. A version below [`crate::MIN_CLI_VERSION`] logs a
/// warning but does not fail, matching the CLI's own compatibility
/// promises.
pub async fn validate_setup(options: Option<&AgentOptions>) -> Result<CliInfo> {
    let path = find_cli(options.and_then(|o| o.cli_path.as_deref()))?;

    let output = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        tokio::process::Command::new(&path)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output(),
    )
    .await
    .map_err(|_| {
        SdkError::from(QueryError::LaunchFailed {
            cause: "CLI version check timed out".to_string(),
        })
    })?
    .map_err(|e| {
        SdkError::from(QueryError::LaunchFailed {
            cause: format!("failed to run version check: {e}"),
        })
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let version = stdout
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().last())
        .unwrap_or("unknown")
        .to_string();

    if let (Ok(found), Ok(required)) = (
        semver::Version::parse(&version),
        semver::Version::parse(crate::MIN_CLI_VERSION),
    ) {
        if found < required {
            warn!(
                "Agent CLI version {version} is below the supported minimum {}",
                crate::MIN_CLI_VERSION
            );
        }
    }

    Ok(CliInfo { path, version })
}
