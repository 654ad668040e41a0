//! Shared test support: a scriptable in-memory transport that plays
//! the Agent CLI's half of the protocol.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use agent_cli_sdk::_internal::framing::classify_line;
use agent_cli_sdk::{MessageStream, Result, StreamItem, Transport, TransportError};

/// Produces the stdout records the fake CLI emits in reaction to one
/// record written by the SDK.
pub type Responder = Box<dyn Fn(&Value) -> Vec<Value> + Send + Sync>;

struct FakeState {
    started: bool,
    closed: bool,
    producer: Option<mpsc::Sender<StreamItem>>,
    consumer: Option<mpsc::Receiver<StreamItem>>,
}

/// In-memory [`Transport`] standing in for the Agent CLI process.
///
/// Everything the SDK writes is recorded in `writes`; an optional
/// responder injects reply records *during* the write call, before it
/// returns, which is the most adversarial timing the protocol layer
/// has to survive.
pub struct FakeCli {
    state: Mutex<FakeState>,
    pub writes: Mutex<Vec<Value>>,
    responder: Mutex<Option<Responder>>,
}

impl FakeCli {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                started: false,
                closed: false,
                producer: None,
                consumer: None,
            }),
            writes: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
        })
    }

    pub fn with_responder<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&Value) -> Vec<Value> + Send + Sync + 'static,
    {
        let fake = Self::new();
        *fake.responder.lock().unwrap() = Some(Box::new(responder));
        fake
    }

    /// Inject one stdout record, as if the CLI had printed it.
    pub async fn inject(&self, record: Value) {
        self.inject_line(&record.to_string()).await;
    }

    /// Inject one raw stdout line (may be noise the parser drops).
    pub async fn inject_line(&self, line: &str) {
        let Some(msg) = classify_line(line.as_bytes()) else {
            return;
        };
        let producer = self.state.lock().unwrap().producer.clone();
        if let Some(producer) = producer {
            let _ = producer.send(Ok(msg)).await;
        }
    }

    /// Inject a terminal transport error and end the stream.
    pub async fn fail(&self, err: TransportError) {
        let producer = self.state.lock().unwrap().producer.take();
        if let Some(producer) = producer {
            let _ = producer.send(Err(err.into())).await;
        }
    }

    /// End the stream cleanly, as on a zero exit.
    pub fn finish(&self) {
        self.state.lock().unwrap().producer.take();
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }

    /// All writes whose `type` field equals `ty`.
    pub fn writes_of_type(&self, ty: &str) -> Vec<Value> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.get("type").and_then(Value::as_str) == Some(ty))
            .cloned()
            .collect()
    }

    /// Poll until a write matching `predicate` appears, within
    /// `timeout`.
    pub async fn wait_for_write<F>(
        &self,
        timeout: std::time::Duration,
        predicate: F,
    ) -> Option<Value>
    where
        F: Fn(&Value) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(found) = self.writes.lock().unwrap().iter().find(|w| predicate(w)) {
                return Some(found.clone());
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
    }
}

#[async_trait]
impl Transport for FakeCli {
    async fn start(&self) -> Result<()> {
        let (tx, rx) = mpsc::channel(256);
        let mut state = self.state.lock().unwrap();
        state.started = true;
        state.producer = Some(tx);
        state.consumer = Some(rx);
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        {
            let state = self.state.lock().unwrap();
            if !state.started || state.closed {
                return Err(TransportError::NotConnected.into());
            }
        }

        let record: Value = serde_json::from_slice(data.strip_suffix(b"\n").unwrap_or(data))
            .expect("SDK wrote a non-JSON record");
        self.writes.lock().unwrap().push(record.clone());

        // Reply before the write returns: a real CLI can answer within
        // the same scheduling instant.
        let replies = match &*self.responder.lock().unwrap() {
            Some(responder) => responder(&record),
            None => Vec::new(),
        };
        for reply in replies {
            self.inject(reply).await;
        }
        Ok(())
    }

    fn read_messages(&self) -> MessageStream {
        let mut state = self.state.lock().unwrap();
        if !state.started {
            return MessageStream::rejected(TransportError::NotConnected);
        }
        match state.consumer.take() {
            Some(rx) => MessageStream::live(rx),
            None => MessageStream::rejected(TransportError::AlreadyConsumed),
        }
    }

    async fn end_input(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.producer.take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.started && !state.closed
    }
}

/// Responder that acknowledges every control request with an empty
/// success payload.
pub fn ack_control_requests() -> Responder {
    Box::new(|record| {
        if record.get("type").and_then(Value::as_str) != Some("control_request") {
            return Vec::new();
        }
        let request_id = record.get("request_id").and_then(Value::as_str).unwrap();
        vec![control_success(request_id, json!({}))]
    })
}

/// Build a `control_response` success record.
pub fn control_success(request_id: &str, value: Value) -> Value {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": value,
        }
    })
}

/// Build a `control_response` error record.
pub fn control_error(request_id: &str, message: &str) -> Value {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "error",
            "request_id": request_id,
            "error": message,
        }
    })
}

/// Responder scripting a one-turn conversation: acks control requests,
/// and answers the first user message with init + assistant + result.
pub fn scripted_conversation(session_id: &str, answer: &str) -> Responder {
    let session_id = session_id.to_string();
    let answer = answer.to_string();
    Box::new(move |record| {
        match record.get("type").and_then(Value::as_str) {
            Some("control_request") => {
                let request_id = record.get("request_id").and_then(Value::as_str).unwrap();
                vec![control_success(request_id, json!({}))]
            }
            Some("user") => vec![
                json!({
                    "type": "system",
                    "subtype": "init",
                    "session_id": session_id,
                    "model": "test-model",
                }),
                json!({
                    "type": "assistant",
                    "message": {"content": [{"type": "text", "text": answer}]},
                    "session_id": session_id,
                }),
                json!({
                    "type": "result",
                    "subtype": "success",
                    "is_error": false,
                    "num_turns": 1,
                    "session_id": session_id,
                }),
            ],
            _ => Vec::new(),
        }
    })
}
