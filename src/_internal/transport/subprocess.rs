//! Subprocess transport for the Agent CLI.
//!
//! Owns exactly one child process and its pipes. The CLI is spawned by
//! direct argv invocation after a programmatic PATH lookup; no byte of
//! any argument is ever interpreted by a shell.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, trace, warn};

use super::{MessageStream, StreamItem, Transport};
use crate::errors::{Result, TransportError};
use crate::types::AgentOptions;
use crate::_internal::framing::LineParser;

/// Default CLI command name, resolved on PATH.
pub const DEFAULT_CLI_NAME: &str = "agent";

/// Default read chunk / line buffer size (1MB).
const DEFAULT_MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// How long `close()` waits for the child after closing stdin.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// How long `close()` waits after the terminate signal before killing.
const TERM_GRACE: Duration = Duration::from_secs(1);

/// Transport lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    New,
    Running,
    Closing,
    Closed,
}

/// State behind the transport's single mutex. The lock is never held
/// across an await; async work operates on snapshots or on handles
/// taken out of this struct.
struct Shared {
    phase: Phase,
    /// Producer end of the message channel. Taken atomically by the
    /// party that finishes the stream.
    producer: Option<mpsc::Sender<StreamItem>>,
    /// Consumer end, handed out once by `read_messages`.
    consumer: Option<mpsc::Receiver<StreamItem>>,
    /// Child handle. Taken atomically by the party that reaps.
    child: Option<Child>,
    /// Child pid, for the unix terminate signal after the handle is
    /// taken.
    pid: Option<u32>,
}

/// Resolve the CLI locator to an executable path.
///
/// An explicit path is used as-is when it exists; otherwise the locator
/// (explicit or [`DEFAULT_CLI_NAME`]) is resolved with a programmatic
/// PATH search. Never a shell.
pub fn find_cli(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => {
            if path.exists() {
                return Ok(path.to_path_buf());
            }
            which::which(path).map_err(|_| {
                TransportError::spawn_failed_message(format!(
                    "Agent CLI not found at '{}'",
                    path.display()
                ))
                .into()
            })
        }
        None => which::which(DEFAULT_CLI_NAME).map_err(|_| {
            TransportError::spawn_failed_message(format!(
                "Agent CLI '{DEFAULT_CLI_NAME}' not found on PATH; install it or set cli_path"
            ))
            .into()
        }),
    }
}

/// Subprocess-backed [`Transport`].
pub struct SubprocessTransport {
    cli_path: PathBuf,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: Option<PathBuf>,
    max_buffer_size: usize,
    stderr_callback: Option<Arc<dyn Fn(String) + Send + Sync>>,
    shared: Arc<Mutex<Shared>>,
    stdin: Arc<tokio::sync::Mutex<Option<ChildStdin>>>,
    exit_tx: watch::Sender<Option<Option<i32>>>,
    exit_rx: watch::Receiver<Option<Option<i32>>>,
}

impl std::fmt::Debug for SubprocessTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubprocessTransport")
            .field("cli_path", &self.cli_path)
            .field("args", &self.args)
            .field("env", &self.env)
            .field("cwd", &self.cwd)
            .field("max_buffer_size", &self.max_buffer_size)
            .finish_non_exhaustive()
    }
}

impl SubprocessTransport {
    /// Create a transport from options. Resolves the CLI path and
    /// builds the argument vector; nothing is spawned until `start`.
    ///
    /// `mcp_config_path` points at the session-owned MCP configuration
    /// file, when one was materialized.
    pub fn new(options: &AgentOptions, mcp_config_path: Option<&Path>) -> Result<Self> {
        let cli_path = find_cli(options.cli_path.as_deref())?;
        let args = build_args(options, mcp_config_path);
        let env = build_env(options);
        let (exit_tx, exit_rx) = watch::channel(None);

        Ok(Self {
            cli_path,
            args,
            env,
            cwd: options.cwd.clone(),
            max_buffer_size: options.max_buffer_size.unwrap_or(DEFAULT_MAX_BUFFER_SIZE),
            stderr_callback: options.stderr.clone(),
            shared: Arc::new(Mutex::new(Shared {
                phase: Phase::New,
                producer: None,
                consumer: None,
                child: None,
                pid: None,
            })),
            stdin: Arc::new(tokio::sync::Mutex::new(None)),
            exit_tx,
            exit_rx,
        })
    }

    /// The argument vector that will be passed to the CLI, exposed for
    /// inspection and tests.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// The resolved executable path.
    pub fn cli_path(&self) -> &Path {
        &self.cli_path
    }

    fn spawn_stdout_reader(&self, stdout: tokio::process::ChildStdout) {
        let shared = Arc::clone(&self.shared);
        let exit_tx = self.exit_tx.clone();
        let chunk_size = self.max_buffer_size.min(64 * 1024).max(1024);

        tokio::spawn(async move {
            let mut stdout = stdout;
            let mut parser = LineParser::new();
            let mut chunk = vec![0u8; chunk_size];

            loop {
                match stdout.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        for msg in parser.push(&chunk[..n]) {
                            // Snapshot the sender under the lock; the
                            // channel send happens after release so a
                            // slow consumer cannot block other callers.
                            let sender = shared.lock().unwrap().producer.clone();
                            let Some(sender) = sender else { return };
                            if sender.send(Ok(msg)).await.is_err() {
                                debug!("stdout reader: consumer dropped");
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("stdout reader error: {e}");
                        break;
                    }
                }
            }

            if let Some(msg) = parser.finish() {
                let sender = shared.lock().unwrap().producer.clone();
                if let Some(sender) = sender {
                    let _ = sender.send(Ok(msg)).await;
                }
            }

            // Stdout is done: the child exited or close() broke the
            // pipes. Whoever takes the child out of shared state reaps
            // it and finishes the stream.
            let child = shared.lock().unwrap().child.take();
            if let Some(mut child) = child {
                let status = child.wait().await.ok();
                let code = status.and_then(|s| s.code());
                let _ = exit_tx.send(Some(code));
                finish_stream(&shared, code).await;
                let mut guard = shared.lock().unwrap();
                guard.phase = Phase::Closed;
            }
            debug!("stdout reader finished");
        });
    }

    fn spawn_stderr_reader(&self, stderr: tokio::process::ChildStderr) {
        let callback = self.stderr_callback.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                trace!("CLI stderr: {line}");
                if let Some(cb) = &callback {
                    cb(line);
                }
            }
        });
    }
}

/// Finish the message stream for the given exit code: cleanly on zero,
/// with `ProcessExited` otherwise. No-op if another party already took
/// the producer.
async fn finish_stream(shared: &Mutex<Shared>, code: Option<i32>) {
    let producer = shared.lock().unwrap().producer.take();
    let Some(producer) = producer else { return };
    if code != Some(0) {
        let _ = producer
            .send(Err(TransportError::ProcessExited { code }.into()))
            .await;
    }
    // Dropping the sender ends the stream.
}

#[cfg(unix)]
fn send_terminate(pid: u32) {
    // SIGTERM first; SIGKILL follows if the grace period expires.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32) {}

#[async_trait]
impl Transport for SubprocessTransport {
    async fn start(&self) -> Result<()> {
        // Claim the New -> Running transition before spawning so a
        // concurrent start cannot produce a second child.
        {
            let mut guard = self.shared.lock().unwrap();
            if guard.phase != Phase::New {
                return Err(TransportError::spawn_failed_message(
                    "transport already started",
                )
                .into());
            }
            guard.phase = Phase::Running;
        }

        debug!("spawning CLI: {} {:?}", self.cli_path.display(), self.args);

        let mut cmd = Command::new(&self.cli_path);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        let spawned = cmd.spawn().map_err(|e| {
            TransportError::spawn_failed(
                format!("failed to spawn '{}'", self.cli_path.display()),
                e,
            )
        });
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.shared.lock().unwrap().phase = Phase::Closed;
                return Err(e.into());
            }
        };

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            self.shared.lock().unwrap().phase = Phase::Closed;
            return Err(TransportError::spawn_failed_message("child pipes missing").into());
        };
        let stderr = child.stderr.take();

        let (producer, consumer) = mpsc::channel(256);
        {
            let mut guard = self.shared.lock().unwrap();
            guard.producer = Some(producer);
            guard.consumer = Some(consumer);
            guard.pid = child.id();
            guard.child = Some(child);
        }
        *self.stdin.lock().await = Some(stdin);

        self.spawn_stdout_reader(stdout);
        if let Some(stderr) = stderr {
            self.spawn_stderr_reader(stderr);
        }

        debug!("CLI process started");
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        {
            let guard = self.shared.lock().unwrap();
            if guard.phase != Phase::Running {
                return Err(TransportError::NotConnected.into());
            }
        }

        let mut stdin = self.stdin.lock().await;
        let stdin = stdin.as_mut().ok_or(TransportError::NotConnected)?;
        trace!(
            "writing {} bytes to CLI",
            data.len()
        );
        stdin
            .write_all(data)
            .await
            .map_err(TransportError::from)?;
        stdin.flush().await.map_err(TransportError::from)?;
        Ok(())
    }

    fn read_messages(&self) -> MessageStream {
        let mut guard = self.shared.lock().unwrap();
        if guard.phase == Phase::New {
            return MessageStream::rejected(TransportError::NotConnected);
        }
        match guard.consumer.take() {
            Some(rx) => MessageStream::live(rx),
            None => MessageStream::rejected(TransportError::AlreadyConsumed),
        }
    }

    async fn end_input(&self) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        if let Some(mut stdin) = guard.take() {
            let _ = stdin.shutdown().await;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // Only the caller that wins Running -> Closing tears down.
        {
            let mut guard = self.shared.lock().unwrap();
            match guard.phase {
                Phase::Running => guard.phase = Phase::Closing,
                Phase::New => {
                    guard.phase = Phase::Closed;
                    return Ok(());
                }
                Phase::Closing | Phase::Closed => return Ok(()),
            }
        }

        debug!("closing transport");
        self.end_input().await?;

        let (child, pid) = {
            let mut guard = self.shared.lock().unwrap();
            (guard.child.take(), guard.pid)
        };

        match child {
            Some(mut child) => {
                let status = match tokio::time::timeout(CLOSE_GRACE, child.wait()).await {
                    Ok(res) => res,
                    Err(_) => {
                        warn!("CLI did not exit within grace period, terminating");
                        if let Some(pid) = pid.or_else(|| child.id()) {
                            send_terminate(pid);
                        }
                        match tokio::time::timeout(TERM_GRACE, child.wait()).await {
                            Ok(res) => res,
                            Err(_) => {
                                warn!("CLI ignored terminate, killing");
                                let _ = child.start_kill();
                                child.wait().await
                            }
                        }
                    }
                };
                let code = match status {
                    Ok(status) => status.code(),
                    Err(e) => {
                        error!("failed to reap CLI process: {e}");
                        None
                    }
                };
                let _ = self.exit_tx.send(Some(code));
                finish_stream(&self.shared, code).await;
            }
            None => {
                // The reader task reaped the child; wait until it has
                // recorded the exit so close() returns with the child
                // gone.
                let mut rx = self.exit_rx.clone();
                let _ = tokio::time::timeout(CLOSE_GRACE, async {
                    while rx.borrow_and_update().is_none() {
                        if rx.changed().await.is_err() {
                            break;
                        }
                    }
                })
                .await;
            }
        }

        self.shared.lock().unwrap().phase = Phase::Closed;
        debug!("transport closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.lock().unwrap().phase == Phase::Running
    }
}

/// Build the CLI argument vector.
///
/// The skeleton is fixed; every option value is its own argv element
/// immediately after its flag, verbatim. Values are never joined into a
/// command string.
pub fn build_args(options: &AgentOptions, mcp_config_path: Option<&Path>) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-p".into(),
        "--output-format".into(),
        "stream-json".into(),
        "--input-format".into(),
        "stream-json".into(),
        "--verbose".into(),
    ];

    if let Some(prompt) = &options.system_prompt {
        args.push("--system-prompt".into());
        args.push(prompt.clone());
    }
    if let Some(append) = &options.append_system_prompt {
        args.push("--append-system-prompt".into());
        args.push(append.clone());
    }
    if let Some(mode) = options.permission_mode {
        args.push("--permission-mode".into());
        args.push(mode.as_str().into());
    }
    if let Some(model) = &options.model {
        args.push("--model".into());
        args.push(model.clone());
    }
    if let Some(model) = &options.fallback_model {
        args.push("--fallback-model".into());
        args.push(model.clone());
    }
    if let Some(turns) = options.max_turns {
        args.push("--max-turns".into());
        args.push(turns.to_string());
    }
    if let Some(tokens) = options.max_thinking_tokens {
        args.push("--max-thinking-tokens".into());
        args.push(tokens.to_string());
    }
    if options.continue_conversation {
        args.push("--continue".into());
    }
    if let Some(session) = &options.resume {
        args.push("--resume".into());
        args.push(session.clone());
    }
    if options.fork_session {
        args.push("--fork-session".into());
    }
    for tool in &options.allowed_tools {
        args.push("--allowed-tools".into());
        args.push(tool.clone());
    }
    for tool in &options.disallowed_tools {
        args.push("--disallowed-tools".into());
        args.push(tool.clone());
    }
    for dir in &options.add_dirs {
        args.push("--add-dir".into());
        args.push(dir.to_string_lossy().into_owned());
    }
    if let Some(path) = mcp_config_path {
        args.push("--mcp-config".into());
        args.push(path.to_string_lossy().into_owned());
    }
    if let Some(settings) = &options.settings {
        args.push("--settings".into());
        args.push(settings.clone());
    }
    if let Some(user) = &options.user {
        args.push("--user".into());
        args.push(user.clone());
    }

    let mut extra: Vec<_> = options.extra_args.iter().collect();
    extra.sort_by(|a, b| a.0.cmp(b.0));
    for (flag, value) in extra {
        args.push(format!("--{flag}"));
        if let Some(value) = value {
            args.push(value.clone());
        }
    }

    args
}

/// Build the child's environment: the parent environment, the user's
/// overrides, and the SDK marker.
pub fn build_env(options: &AgentOptions) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    for (key, value) in &options.env {
        env.insert(key.clone(), value.clone());
    }
    env.insert("AGENT_SDK".into(), "true".into());
    env
}
