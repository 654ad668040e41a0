//! Transport layer owning the Agent CLI subprocess.
//!
//! [`Transport`] abstracts the byte channel to the CLI so the control
//! handler and session can be exercised against in-memory fakes;
//! [`SubprocessTransport`] is the production implementation.

mod subprocess;

pub use subprocess::{build_args, build_env, find_cli, SubprocessTransport, DEFAULT_CLI_NAME};

use async_trait::async_trait;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::Stream;

use crate::errors::{Result, SdkError, TransportError};
use crate::_internal::framing::StdoutMessage;

/// Item yielded by the transport's message stream.
pub type StreamItem = std::result::Result<StdoutMessage, SdkError>;

/// Abstract transport to the Agent CLI.
///
/// All methods take `&self`: a transport is shared behind an `Arc` and
/// must tolerate concurrent callers, including concurrent `close`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Spawn/connect the underlying channel.
    async fn start(&self) -> Result<()>;

    /// Append bytes to the CLI's stdin. The caller terminates records
    /// with `\n`.
    async fn write(&self, data: &[u8]) -> Result<()>;

    /// The stdout message stream. Single-consumer: the second and later
    /// calls return a stream that immediately fails with
    /// `AlreadyConsumed`.
    fn read_messages(&self) -> MessageStream;

    /// Close the CLI's stdin half. Idempotent; harmless if not started.
    async fn end_input(&self) -> Result<()>;

    /// Tear down the transport. Safe under concurrent invocation; only
    /// the first caller performs the teardown.
    async fn close(&self) -> Result<()>;

    /// Whether the transport is currently running.
    fn is_connected(&self) -> bool;
}

/// Stream of classified stdout messages.
///
/// Obtained from [`Transport::read_messages`]. A rejected stream yields
/// exactly one error and then terminates.
pub struct MessageStream {
    inner: MessageStreamInner,
}

enum MessageStreamInner {
    Live(mpsc::Receiver<StreamItem>),
    Rejected(Option<TransportError>),
}

impl MessageStream {
    /// A healthy stream backed by the given receiver.
    pub fn live(rx: mpsc::Receiver<StreamItem>) -> Self {
        Self {
            inner: MessageStreamInner::Live(rx),
        }
    }

    /// A stream that fails immediately with `err` and then terminates.
    pub fn rejected(err: TransportError) -> Self {
        Self {
            inner: MessageStreamInner::Rejected(Some(err)),
        }
    }
}

impl Stream for MessageStream {
    type Item = StreamItem;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match &mut self.get_mut().inner {
            MessageStreamInner::Live(rx) => rx.poll_recv(cx),
            MessageStreamInner::Rejected(err) => {
                Poll::Ready(err.take().map(|e| Err(SdkError::from(e))))
            }
        }
    }
}
