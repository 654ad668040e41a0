//! Control request/response correlation.
//!
//! [`ControlHandler`] owns the pending-request table. Outbound requests
//! get a fresh id and a one-shot completion slot; inbound responses,
//! cancellations, timeouts, and session close all resolve slots exactly
//! once.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::transport::Transport;
use crate::errors::{replicate, ProtocolError, Result, SdkError};
use crate::types::{ControlOutcome, OutboundControlRequest};

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_request_id() -> String {
    let n = REQUEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    let uuid = Uuid::new_v4().simple().to_string();
    format!("req_{}_{}", n, &uuid[..8])
}

/// Serialize `value` and write it as one newline-terminated record.
pub(crate) async fn write_json_line(transport: &dyn Transport, value: &Value) -> Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    transport.write(&line).await
}

type Slot = oneshot::Sender<Result<Value>>;

/// Correlates outbound control requests with inbound responses.
pub struct ControlHandler {
    transport: Arc<dyn Transport>,
    pending: Mutex<HashMap<String, Slot>>,
    default_timeout: Option<Duration>,
}

/// Removes the pending slot when the waiting future is dropped before
/// resolution (caller cancellation, timeout), so no slot is ever left
/// behind.
struct SlotGuard<'a> {
    handler: &'a ControlHandler,
    request_id: String,
    armed: bool,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.handler
                .pending
                .lock()
                .unwrap()
                .remove(&self.request_id);
        }
    }
}

impl ControlHandler {
    /// Create a handler writing requests through `transport`.
    /// `default_timeout` of `None` waits indefinitely.
    pub fn new(transport: Arc<dyn Transport>, default_timeout: Option<Duration>) -> Self {
        Self {
            transport,
            pending: Mutex::new(HashMap::new()),
            default_timeout,
        }
    }

    /// Send a control request and wait for its response with the
    /// handler's default timeout.
    pub async fn send_request(&self, payload: &OutboundControlRequest) -> Result<Value> {
        self.send_request_with_timeout(payload, self.default_timeout)
            .await
    }

    /// Send a control request and wait for its response.
    ///
    /// The completion slot is registered before the request bytes reach
    /// the wire, so a response arriving in the same instant still finds
    /// it.
    pub async fn send_request_with_timeout(
        &self,
        payload: &OutboundControlRequest,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let request_id = next_request_id();
        let record = json!({
            "type": "control_request",
            "request_id": request_id.clone(),
            "request": payload,
        });

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert(request_id.clone(), tx);
        let mut guard = SlotGuard {
            handler: self,
            request_id: request_id.clone(),
            armed: true,
        };

        trace!("sending control request {request_id}");
        write_json_line(self.transport.as_ref(), &record).await?;

        let received = match timeout {
            Some(duration) => match tokio::time::timeout(duration, rx).await {
                Ok(received) => received,
                Err(_) => {
                    debug!("control request {request_id} timed out");
                    return Err(ProtocolError::Timeout { request_id }.into());
                }
            },
            None => rx.await,
        };

        // The responder removed the slot before fulfilling it.
        guard.armed = false;

        match received {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Cancelled { request_id }.into()),
        }
    }

    /// Route an inbound control response to its waiter. Responses for
    /// unknown ids (late after a timeout, or never ours) are dropped.
    pub fn handle_outcome(&self, outcome: ControlOutcome) {
        let request_id = outcome.request_id().to_string();
        let slot = self.pending.lock().unwrap().remove(&request_id);
        let Some(slot) = slot else {
            warn!("dropping response for unknown request {request_id}");
            return;
        };

        let result = match outcome {
            ControlOutcome::Success { value, .. } => Ok(value),
            ControlOutcome::Error { message, .. } => Err(ProtocolError::ResponseError {
                request_id,
                message,
            }
            .into()),
        };
        let _ = slot.send(result);
    }

    /// The CLI cancelled an outstanding request; the waiter observes
    /// `Cancelled`.
    pub fn handle_cancel(&self, request_id: &str) {
        let slot = self.pending.lock().unwrap().remove(request_id);
        if let Some(slot) = slot {
            let _ = slot.send(Err(ProtocolError::Cancelled {
                request_id: request_id.to_string(),
            }
            .into()));
        }
    }

    /// Resolve every outstanding slot with (a replica of) `err`. Used
    /// when the transport fails or the session closes.
    pub fn fail_all(&self, err: &SdkError) {
        let drained: Vec<Slot> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, slot)| slot).collect()
        };
        if !drained.is_empty() {
            debug!("failing {} pending control requests", drained.len());
        }
        for slot in drained {
            let _ = slot.send(Err(replicate(err)));
        }
    }

    /// Number of requests currently awaiting responses.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{SessionError, TransportError};
    use crate::_internal::transport::MessageStream;
    use async_trait::async_trait;

    /// Transport fake that records writes and lets tests decide when
    /// (and whether) responses arrive.
    #[derive(Default)]
    struct RecordingTransport {
        writes: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn write(&self, data: &[u8]) -> Result<()> {
            let value = serde_json::from_slice(&data[..data.len() - 1]).unwrap();
            self.writes.lock().unwrap().push(value);
            Ok(())
        }

        fn read_messages(&self) -> MessageStream {
            MessageStream::rejected(TransportError::AlreadyConsumed)
        }

        async fn end_input(&self) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    impl RecordingTransport {
        fn last_request_id(&self) -> String {
            self.writes
                .lock()
                .unwrap()
                .last()
                .and_then(|v| v.get("request_id"))
                .and_then(Value::as_str)
                .unwrap()
                .to_string()
        }
    }

    #[test]
    fn request_ids_are_unique_and_monotonic() {
        let a = next_request_id();
        let b = next_request_id();
        assert!(a.starts_with("req_"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn response_resolves_waiter_and_clears_slot() {
        let transport = Arc::new(RecordingTransport::default());
        let handler = Arc::new(ControlHandler::new(transport.clone(), None));

        let task = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                handler
                    .send_request(&OutboundControlRequest::Interrupt)
                    .await
            })
        };

        // Wait for the write, then respond.
        let request_id = loop {
            if !transport.writes.lock().unwrap().is_empty() {
                break transport.last_request_id();
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        };
        handler.handle_outcome(ControlOutcome::Success {
            request_id,
            value: json!({"ok": true}),
        });

        let value = task.await.unwrap().unwrap();
        assert_eq!(value, json!({"ok": true}));
        assert_eq!(handler.pending_count(), 0);
    }

    #[tokio::test]
    async fn timeout_removes_slot_and_late_response_is_dropped() {
        let transport = Arc::new(RecordingTransport::default());
        let handler = ControlHandler::new(transport.clone(), None);

        let err = handler
            .send_request_with_timeout(
                &OutboundControlRequest::Interrupt,
                Some(Duration::from_millis(10)),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(handler.pending_count(), 0);

        // Late response: no slot, no panic.
        handler.handle_outcome(ControlOutcome::Success {
            request_id: transport.last_request_id(),
            value: Value::Null,
        });
        assert_eq!(handler.pending_count(), 0);
    }

    #[tokio::test]
    async fn cli_cancel_resolves_waiter() {
        let transport = Arc::new(RecordingTransport::default());
        let handler = Arc::new(ControlHandler::new(transport.clone(), None));

        let task = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                handler
                    .send_request(&OutboundControlRequest::Interrupt)
                    .await
            })
        };
        loop {
            if !transport.writes.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        handler.handle_cancel(&transport.last_request_id());
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            SdkError::Protocol(ProtocolError::Cancelled { .. })
        ));
    }

    #[tokio::test]
    async fn dropped_waiter_removes_slot() {
        let transport = Arc::new(RecordingTransport::default());
        let handler = Arc::new(ControlHandler::new(transport.clone(), None));

        let task = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                handler
                    .send_request(&OutboundControlRequest::Interrupt)
                    .await
            })
        };
        loop {
            if handler.pending_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        task.abort();
        let _ = task.await;
        // Give the abort's drop a chance to run.
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(handler.pending_count(), 0);
    }

    #[tokio::test]
    async fn fail_all_resolves_every_waiter() {
        let transport = Arc::new(RecordingTransport::default());
        let handler = Arc::new(ControlHandler::new(transport.clone(), None));

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    handler
                        .send_request(&OutboundControlRequest::McpStatus)
                        .await
                })
            })
            .collect();
        loop {
            if handler.pending_count() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        handler.fail_all(&SessionError::Closed.into());
        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert!(matches!(err, SdkError::Session(SessionError::Closed)));
        }
        assert_eq!(handler.pending_count(), 0);
    }

    #[tokio::test]
    async fn error_outcome_carries_cli_message() {
        let transport = Arc::new(RecordingTransport::default());
        let handler = Arc::new(ControlHandler::new(transport.clone(), None));

        let task = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                handler
                    .send_request(&OutboundControlRequest::McpStatus)
                    .await
            })
        };
        loop {
            if !transport.writes.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        handler.handle_outcome(ControlOutcome::Error {
            request_id: transport.last_request_id(),
            message: "mcp subsystem offline".into(),
        });

        match task.await.unwrap().unwrap_err() {
            SdkError::Protocol(ProtocolError::ResponseError { message, .. }) => {
                assert_eq!(message, "mcp subsystem offline");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
