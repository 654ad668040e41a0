//! Control-protocol behaviour against a fake CLI that answers as fast
//! as a process possibly can.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use agent_cli_sdk::_internal::control::ControlHandler;
use agent_cli_sdk::{OutboundControlRequest, ProtocolError, SdkError, Transport};
use common::{control_success, FakeCli};

/// Responder answering every control request inside the write call.
fn instant_ack() -> Arc<FakeCli> {
    FakeCli::with_responder(|record| {
        let request_id = record.get("request_id").and_then(Value::as_str).unwrap();
        vec![control_success(request_id, json!({"echo": record["request"]}))]
    })
}

/// Route every injected control_response from the fake's stream into
/// the handler, standing in for the session's message loop.
fn spawn_router(fake: &Arc<FakeCli>, handler: &Arc<ControlHandler>) {
    use tokio_stream::StreamExt;
    let mut stream = fake.read_messages();
    let handler = Arc::clone(handler);
    tokio::spawn(async move {
        while let Some(Ok(msg)) = stream.next().await {
            if let agent_cli_sdk::StdoutMessage::ControlResponse(outcome) = msg {
                handler.handle_outcome(outcome);
            }
        }
    });
}

#[tokio::test]
async fn fifty_concurrent_requests_with_instant_responses_never_hang() {
    let fake = instant_ack();
    fake.start().await.unwrap();
    let handler = Arc::new(ControlHandler::new(
        fake.clone() as Arc<dyn Transport>,
        Some(Duration::from_secs(2)),
    ));
    spawn_router(&fake, &handler);

    let started = Instant::now();
    let tasks: Vec<_> = (0..50)
        .map(|_| {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                handler
                    .send_request(&OutboundControlRequest::McpStatus)
                    .await
            })
        })
        .collect();

    for task in tasks {
        let value = task.await.unwrap().expect("no request may time out");
        assert_eq!(value.pointer("/echo/subtype"), Some(&json!("mcp_status")));
    }

    assert!(
        started.elapsed() < Duration::from_secs(2),
        "responses were immediate; waiting anywhere near the timeout means a lost slot"
    );
    assert_eq!(handler.pending_count(), 0);
}

#[tokio::test]
async fn responses_correlate_by_id_not_arrival_order() {
    let fake = FakeCli::new();
    fake.start().await.unwrap();
    let handler = Arc::new(ControlHandler::new(
        fake.clone() as Arc<dyn Transport>,
        Some(Duration::from_secs(2)),
    ));
    spawn_router(&fake, &handler);

    let a = {
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            handler
                .send_request(&OutboundControlRequest::Interrupt)
                .await
        })
    };
    let b = {
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            handler
                .send_request(&OutboundControlRequest::McpStatus)
                .await
        })
    };

    // Wait until both requests are on the wire.
    fake.wait_for_write(Duration::from_secs(1), |w| {
        w.pointer("/request/subtype") == Some(&json!("mcp_status"))
    })
    .await
    .expect("second request written");
    let writes = fake.writes_of_type("control_request");
    assert_eq!(writes.len(), 2);

    // Answer in reverse order.
    let id_of = |subtype: &str| {
        writes
            .iter()
            .find(|w| w.pointer("/request/subtype") == Some(&json!(subtype)))
            .and_then(|w| w.get("request_id"))
            .and_then(Value::as_str)
            .unwrap()
            .to_string()
    };
    fake.inject(control_success(&id_of("mcp_status"), json!({"which": "b"})))
        .await;
    fake.inject(control_success(&id_of("interrupt"), json!({"which": "a"})))
        .await;

    assert_eq!(
        a.await.unwrap().unwrap(),
        json!({"which": "a"}),
        "interrupt waiter got the interrupt response"
    );
    assert_eq!(b.await.unwrap().unwrap(), json!({"which": "b"}));
}

#[tokio::test]
async fn unknown_request_id_is_dropped_without_crash() {
    let fake = FakeCli::new();
    fake.start().await.unwrap();
    let handler = Arc::new(ControlHandler::new(
        fake.clone() as Arc<dyn Transport>,
        None,
    ));
    spawn_router(&fake, &handler);

    fake.inject(control_success("req_never_sent", json!({})))
        .await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(handler.pending_count(), 0);
}

#[tokio::test]
async fn timeout_is_per_request_and_leaves_no_slot() {
    let fake = FakeCli::new();
    fake.start().await.unwrap();
    let handler = ControlHandler::new(fake.clone() as Arc<dyn Transport>, None);

    let err = handler
        .send_request_with_timeout(
            &OutboundControlRequest::Interrupt,
            Some(Duration::from_millis(25)),
        )
        .await
        .unwrap_err();

    match err {
        SdkError::Protocol(ProtocolError::Timeout { request_id }) => {
            assert!(request_id.starts_with("req_"));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(handler.pending_count(), 0);
}

#[tokio::test]
async fn cancel_request_from_cli_resolves_the_waiter() {
    let fake = FakeCli::new();
    fake.start().await.unwrap();
    let handler = Arc::new(ControlHandler::new(
        fake.clone() as Arc<dyn Transport>,
        Some(Duration::from_secs(5)),
    ));

    let task = {
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            handler
                .send_request(&OutboundControlRequest::Interrupt)
                .await
        })
    };

    let write = fake
        .wait_for_write(Duration::from_secs(1), |w| {
            w.get("type") == Some(&json!("control_request"))
        })
        .await
        .expect("request written");
    handler.handle_cancel(write.get("request_id").and_then(Value::as_str).unwrap());

    match task.await.unwrap().unwrap_err() {
        SdkError::Protocol(ProtocolError::Cancelled { .. }) => {}
        other => panic!("expected Cancelled, got {other:?}"),
    }
    assert_eq!(handler.pending_count(), 0);
}

#[tokio::test]
async fn every_request_is_newline_terminated_json() {
    let fake = FakeCli::new();
    fake.start().await.unwrap();
    let handler = ControlHandler::new(fake.clone() as Arc<dyn Transport>, None);

    // The fake panics on any write that is not one complete JSON record
    // terminated by a newline, so a surviving request proves framing.
    let _ = handler
        .send_request_with_timeout(
            &OutboundControlRequest::SetModel {
                model: Some("sonnet".into()),
            },
            Some(Duration::from_millis(50)),
        )
        .await;

    let writes = fake.writes_of_type("control_request");
    assert_eq!(writes.len(), 1);
    assert_eq!(
        writes[0].pointer("/request/model"),
        Some(&json!("sonnet"))
    );
}
