//! Newline-delimited JSON framing and message classification.
//!
//! [`LineParser`] splits an incoming byte stream into lines and
//! classifies each line into one of the five stdout message variants.
//! The upstream is an out-of-process CLI that is known to emit
//! diagnostic noise, so anything that is not a complete JSON object
//! with a recognized `type` field is dropped, never errored.

use serde_json::Value;
use tracing::{trace, warn};

use crate::types::ControlOutcome;

/// Kind of a regular (user-visible) message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegularKind {
    /// `"user"`
    User,
    /// `"assistant"`
    Assistant,
    /// `"system"`
    System,
    /// `"result"`
    Result,
}

impl RegularKind {
    fn from_type(t: &str) -> Option<Self> {
        match t {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            "result" => Some(Self::Result),
            _ => None,
        }
    }
}

/// One classified message from the CLI's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum StdoutMessage {
    /// A user-visible message; payload preserved verbatim.
    Regular {
        /// Which of the four regular types.
        kind: RegularKind,
        /// The full record.
        raw: Value,
    },
    /// A control request from the CLI that the SDK must answer.
    ControlRequest {
        /// Correlation id to echo in the response.
        request_id: String,
        /// The inner request payload.
        request: Value,
    },
    /// A response to a control request the SDK sent.
    ControlResponse(ControlOutcome),
    /// The CLI cancelled one of its own outstanding requests.
    ControlCancel {
        /// Id of the cancelled request.
        request_id: String,
    },
    /// Liveness ping; carries no data the SDK uses.
    KeepAlive,
}

/// Incremental line parser.
///
/// `push` consumes a chunk, yields every message completed by it, and
/// retains the unterminated tail for the next chunk, so records may be
/// split at any byte offset.
#[derive(Debug, Default)]
pub struct LineParser {
    buf: Vec<u8>,
}

impl LineParser {
    /// Create a parser with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently buffered waiting for a line terminator.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append a chunk and return the messages completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StdoutMessage> {
        self.buf.extend_from_slice(chunk);

        let mut messages = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.buf[start..].iter().position(|&b| b == b'\n') {
            let end = start + pos;
            let line = &self.buf[start..end];
            if let Some(msg) = classify_line(line) {
                messages.push(msg);
            }
            start = end + 1;
        }
        self.buf.drain(..start);
        messages
    }

    /// Flush the buffer at end of stream. A trailing unterminated line
    /// is classified as if it had been newline-terminated.
    pub fn finish(&mut self) -> Option<StdoutMessage> {
        if self.buf.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buf);
        classify_line(&line)
    }
}

/// Classify one line. Returns `None` for anything to be dropped: empty
/// lines, invalid UTF-8, JSON parse failures, missing or unrecognized
/// `type`, and structurally broken control messages.
pub fn classify_line(line: &[u8]) -> Option<StdoutMessage> {
    // Tolerate CRLF.
    let line = match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    };
    if line.iter().all(|b| b.is_ascii_whitespace()) {
        return None;
    }

    let text = match std::str::from_utf8(line) {
        Ok(t) => t,
        Err(_) => {
            warn!("dropping non-UTF-8 line from CLI");
            return None;
        }
    };

    let raw: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            trace!("dropping non-JSON line: {}", &text[..text.len().min(120)]);
            return None;
        }
    };

    let msg_type = raw.get("type").and_then(Value::as_str)?;

    if let Some(kind) = RegularKind::from_type(msg_type) {
        return Some(StdoutMessage::Regular { kind, raw });
    }

    match msg_type {
        "control_request" => {
            let request_id = raw.get("request_id").and_then(Value::as_str)?.to_string();
            let request = raw.get("request").cloned().unwrap_or(Value::Null);
            Some(StdoutMessage::ControlRequest {
                request_id,
                request,
            })
        }
        "control_response" => classify_control_response(&raw),
        "control_cancel_request" => {
            let request_id = raw.get("request_id").and_then(Value::as_str)?.to_string();
            Some(StdoutMessage::ControlCancel { request_id })
        }
        "keep_alive" => Some(StdoutMessage::KeepAlive),
        other => {
            trace!("dropping line with unrecognized type {:?}", other);
            None
        }
    }
}

fn classify_control_response(raw: &Value) -> Option<StdoutMessage> {
    let response = raw.get("response")?;
    let request_id = response
        .get("request_id")
        .and_then(Value::as_str)?
        .to_string();

    match response.get("subtype").and_then(Value::as_str) {
        Some("success") => Some(StdoutMessage::ControlResponse(ControlOutcome::Success {
            request_id,
            value: response.get("response").cloned().unwrap_or(Value::Null),
        })),
        Some("error") => Some(StdoutMessage::ControlResponse(ControlOutcome::Error {
            request_id,
            message: response
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        })),
        other => {
            warn!("dropping control_response with subtype {:?}", other);
            None
        }
    }
}
