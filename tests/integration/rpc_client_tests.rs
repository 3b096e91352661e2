//! Integration tests for the RPC correlation engine over an in-memory pipe.
//!
//! Covers:
//! - concurrent requests resolved by id regardless of response order
//! - responses for unknown ids are ignored
//! - inbound requests answered with the handler's result and the same id
//! - notifications delivered in arrival order
//! - teardown fails every pending request
//! - closing the transport fails requests still in flight
//! - a timed-out request leaves no pending entry and its late reply is dropped
//! - sending after the receive loop exits fails with `NotConnected`

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use agent_link::rpc::client::RpcClient;
use agent_link::rpc::message::{Message, RequestId, RpcError, METHOD_NOT_FOUND};
use agent_link::transport::Transport;
use agent_link::AppError;

use super::test_helpers::transport_pair;

// ── Correlation ─────────────────────────────────────────────────────────────

/// Three requests answered in reverse order each receive their own result.
#[tokio::test]
async fn responses_are_matched_by_id_in_any_order() {
    let (transport, mut agent) = transport_pair();
    let rpc = RpcClient::new(transport);
    let _loop = rpc.start().expect("start receive loop");

    let calls: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|tag| {
            let rpc = rpc.clone();
            tokio::spawn(async move { rpc.send_request("echo", Some(json!({ "tag": tag }))).await })
        })
        .collect();

    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(agent.expect_request("echo").await);
    }

    for (id, params) in received.into_iter().rev() {
        let tag = params.expect("params")["tag"].clone();
        agent
            .send(&Message::response(id, Ok(json!({ "tag": tag }))))
            .await;
    }

    for (call, tag) in calls.into_iter().zip(["a", "b", "c"]) {
        let result = call.await.expect("join").expect("request must succeed");
        assert_eq!(result, json!({ "tag": tag }), "each caller gets its own result");
    }
    assert_eq!(rpc.pending_count(), 0, "pending table must be empty");
}

/// Request ids are distinct decimal strings starting at 1.
#[tokio::test]
async fn request_ids_are_sequential_strings() {
    let (transport, mut agent) = transport_pair();
    let rpc = RpcClient::new(transport);
    let _loop = rpc.start().expect("start receive loop");

    let first = tokio::spawn({
        let rpc = rpc.clone();
        async move { rpc.send_request("one", None).await }
    });
    let (id1, _) = agent.expect_request("one").await;

    let second = tokio::spawn({
        let rpc = rpc.clone();
        async move { rpc.send_request("two", None).await }
    });
    let (id2, _) = agent.expect_request("two").await;

    assert_eq!(id1, RequestId::String("1".into()));
    assert_eq!(id2, RequestId::String("2".into()));

    agent.send(&Message::response(id1, Ok(Value::Null))).await;
    agent.send(&Message::response(id2, Ok(Value::Null))).await;
    first.await.expect("join").expect("first");
    second.await.expect("join").expect("second");
}

/// An error response surfaces as `AppError::Rpc` carrying the peer's error.
#[tokio::test]
async fn error_response_surfaces_as_rpc_error() {
    let (transport, mut agent) = transport_pair();
    let rpc = RpcClient::new(transport);
    let _loop = rpc.start().expect("start receive loop");

    let call = tokio::spawn({
        let rpc = rpc.clone();
        async move { rpc.send_request("missing", None).await }
    });
    let (id, _) = agent.expect_request("missing").await;
    agent
        .send(&Message::response(id, Err(RpcError::method_not_found("missing"))))
        .await;

    let err = call.await.expect("join").expect_err("must fail");
    match err {
        AppError::Rpc(e) => assert_eq!(e.code, METHOD_NOT_FOUND),
        other => panic!("expected Rpc error, got {other:?}"),
    }
}

/// A response whose id matches nothing is dropped; the loop keeps running.
#[tokio::test]
async fn response_for_unknown_id_is_ignored() {
    let (transport, mut agent) = transport_pair();
    let rpc = RpcClient::new(transport);
    let _loop = rpc.start().expect("start receive loop");

    agent
        .send(&Message::response("999", Ok(json!("stray"))))
        .await;

    let call = tokio::spawn({
        let rpc = rpc.clone();
        async move { rpc.send_request("after", None).await }
    });
    let (id, _) = agent.expect_request("after").await;
    agent.send(&Message::response(id, Ok(json!(true)))).await;

    assert_eq!(call.await.expect("join").expect("request"), json!(true));
    assert!(!rpc.is_closed(), "stray response must not stop the loop");
}

// ── Inbound traffic ─────────────────────────────────────────────────────────

/// An inbound request is answered with the handler's result under the same id.
#[tokio::test]
async fn inbound_request_is_answered_with_same_id() {
    let (transport, mut agent) = transport_pair();
    let rpc = RpcClient::new(transport);
    rpc.set_request_handler(|_id, method, params| async move {
        assert_eq!(method, "tool.call");
        let x = params.and_then(|p| p["arguments"]["x"].as_i64()).unwrap_or(0);
        Ok(json!({ "textResultForLlm": x.to_string(), "resultType": "success" }))
    });
    let _loop = rpc.start().expect("start receive loop");

    agent
        .send(&Message::request(
            RequestId::Number(7),
            "tool.call",
            Some(json!({ "sessionId": "s1", "arguments": { "x": 1 } })),
        ))
        .await;

    match agent.recv().await {
        Message::Response { id, outcome } => {
            assert_eq!(id, RequestId::Number(7), "numeric id must be echoed");
            assert_eq!(
                outcome.expect("success"),
                json!({ "textResultForLlm": "1", "resultType": "success" })
            );
        }
        other => panic!("expected response, got {other:?}"),
    }
}

/// A handler error becomes an error response.
#[tokio::test]
async fn inbound_request_handler_error_is_sent_back() {
    let (transport, mut agent) = transport_pair();
    let rpc = RpcClient::new(transport);
    rpc.set_request_handler(|_id, method, _params| async move {
        Err(RpcError::method_not_found(&method))
    });
    let _loop = rpc.start().expect("start receive loop");

    agent
        .send(&Message::request("srv-1", "nope", None))
        .await;

    match agent.recv().await {
        Message::Response { id, outcome } => {
            assert_eq!(id, RequestId::from("srv-1"));
            assert_eq!(outcome.expect_err("error").code, METHOD_NOT_FOUND);
        }
        other => panic!("expected response, got {other:?}"),
    }
}

/// Notifications reach the handler in the order they were sent.
#[tokio::test]
async fn notifications_are_delivered_in_order() {
    let (transport, mut agent) = transport_pair();
    let rpc = RpcClient::new(transport);
    let (tx, mut rx) = mpsc::unbounded_channel();
    rpc.set_notification_handler(move |method, params| {
        tx.send((method, params)).expect("test receiver alive");
    });
    let _loop = rpc.start().expect("start receive loop");

    for n in 0..5 {
        agent
            .send(&Message::notification("progress", Some(json!({ "n": n }))))
            .await;
    }

    for n in 0..5 {
        let (method, params) = rx.recv().await.expect("notification");
        assert_eq!(method, "progress");
        assert_eq!(params, Some(json!({ "n": n })));
    }
}

// ── Teardown and deadlines ──────────────────────────────────────────────────

/// Stopping the engine fails every in-flight request with `ConnectionClosed`.
#[tokio::test]
async fn stop_fails_all_pending_requests() {
    let (transport, mut agent) = transport_pair();
    let rpc = RpcClient::new(transport);
    let receive_loop = rpc.start().expect("start receive loop");

    let calls: Vec<_> = ["first", "second"]
        .into_iter()
        .map(|method| {
            let rpc = rpc.clone();
            tokio::spawn(async move { rpc.send_request(method, None).await })
        })
        .collect();
    agent.recv().await;
    agent.recv().await;
    assert_eq!(rpc.pending_count(), 2);

    rpc.stop();
    receive_loop.await.expect("receive loop exits");

    for call in calls {
        let err = call.await.expect("join").expect_err("must fail");
        assert!(
            matches!(err, AppError::ConnectionClosed(_)),
            "pending request must fail with ConnectionClosed, got {err:?}"
        );
    }
    assert_eq!(rpc.pending_count(), 0);
}

/// The peer hanging up fails pending requests and later sends.
#[tokio::test]
async fn peer_hang_up_fails_pending_and_later_requests() {
    let (transport, mut agent) = transport_pair();
    let rpc = RpcClient::new(transport);
    let _loop = rpc.start().expect("start receive loop");

    let call = tokio::spawn({
        let rpc = rpc.clone();
        async move { rpc.send_request("slow", None).await }
    });
    agent.expect_request("slow").await;
    agent.hang_up().await;

    let err = call.await.expect("join").expect_err("must fail");
    assert!(matches!(err, AppError::ConnectionClosed(_)), "got {err:?}");

    rpc.closed().await;
    let err = rpc
        .send_request("late", None)
        .await
        .expect_err("must fail after loop exit");
    assert!(matches!(err, AppError::NotConnected(_)), "got {err:?}");

    let err = rpc
        .send_notification("late", None)
        .await
        .expect_err("notification must fail after loop exit");
    assert!(matches!(err, AppError::NotConnected(_)), "got {err:?}");
}

/// A timed-out request removes its entry; a late response is ignored and the
/// connection stays usable.
#[tokio::test]
async fn timeout_removes_pending_entry_and_late_response_is_dropped() {
    let (transport, mut agent) = transport_pair();
    let rpc = RpcClient::new(transport);
    let _loop = rpc.start().expect("start receive loop");

    let err = {
        let call = rpc.send_request_with_timeout("slow", None, Some(Duration::from_millis(50)));
        let (result, (late_id, _)) = tokio::join!(call, agent.expect_request("slow"));
        agent.send(&Message::response(late_id, Ok(json!("late")))).await;
        result.expect_err("must time out")
    };
    assert!(matches!(err, AppError::Timeout(_)), "got {err:?}");
    assert_eq!(rpc.pending_count(), 0, "timed-out entry must be removed");

    let call = tokio::spawn({
        let rpc = rpc.clone();
        async move { rpc.send_request("next", None).await }
    });
    let (id, _) = agent.expect_request("next").await;
    agent.send(&Message::response(id, Ok(json!("ok")))).await;
    assert_eq!(call.await.expect("join").expect("request"), json!("ok"));
}

/// The default deadline from `with_request_timeout` applies to `send_request`.
#[tokio::test]
async fn engine_default_timeout_applies() {
    let (transport, mut agent) = transport_pair();
    let rpc = RpcClient::with_request_timeout(transport, Some(Duration::from_millis(50)));
    let _loop = rpc.start().expect("start receive loop");

    let (result, _) = tokio::join!(rpc.send_request("slow", None), agent.recv());
    assert!(matches!(result, Err(AppError::Timeout(_))), "got {result:?}");
}

/// Only one receive loop may read a transport.
#[tokio::test]
async fn starting_twice_is_invalid_state() {
    let (transport, _agent) = transport_pair();
    let rpc = RpcClient::new(transport);
    let _loop = rpc.start().expect("first start");

    let err = rpc.start().expect_err("second start must fail");
    assert!(matches!(err, AppError::InvalidState(_)), "got {err:?}");
}

/// Closing the transport wakes the receive loop.
#[tokio::test]
async fn closing_transport_ends_receive_loop() {
    let (transport, _agent) = transport_pair();
    let rpc = RpcClient::new(Arc::clone(&transport) as Arc<dyn Transport>);
    let receive_loop = rpc.start().expect("start receive loop");

    transport.close().await.expect("close");
    receive_loop.await.expect("receive loop exits");

    assert!(rpc.is_closed());
    assert!(transport.is_closed());
}

/// Closing the transport with two requests in flight fails both promptly.
#[tokio::test]
async fn closing_transport_fails_every_pending_request() {
    let (transport, mut agent) = transport_pair();
    let rpc = RpcClient::new(Arc::clone(&transport) as Arc<dyn Transport>);
    let receive_loop = rpc.start().expect("start receive loop");

    let calls: Vec<_> = ["first", "second"]
        .into_iter()
        .map(|method| {
            let rpc = rpc.clone();
            tokio::spawn(async move { rpc.send_request(method, None).await })
        })
        .collect();
    agent.recv().await;
    agent.recv().await;
    assert_eq!(rpc.pending_count(), 2);

    transport.close().await.expect("close");

    for call in calls {
        let err = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .expect("pending request must fail promptly")
            .expect("join")
            .expect_err("must fail");
        assert!(matches!(err, AppError::ConnectionClosed(_)), "got {err:?}");
    }
    receive_loop.await.expect("receive loop exits");
    assert_eq!(rpc.pending_count(), 0);
}

/// A framing error is fatal to the loop.
#[tokio::test]
async fn malformed_frame_stops_the_loop() {
    let (transport, mut agent) = transport_pair();
    let rpc = RpcClient::new(transport);
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = Arc::clone(&seen);
    rpc.set_notification_handler(move |method, _| {
        sink.lock().expect("lock").push(method);
    });
    let receive_loop = rpc.start().expect("start receive loop");

    agent.send_raw(b"Content-Length: 5\r\n\r\nnope!").await;
    receive_loop.await.expect("receive loop exits");

    assert!(rpc.is_closed());
    assert!(seen.lock().expect("lock").is_empty());
}
