//! Unit tests for JSON-RPC message classification and serialisation.

use serde_json::json;

use agent_link::rpc::message::{Message, RequestId, RpcError, INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND};
use agent_link::AppError;

fn classify(value: serde_json::Value) -> agent_link::Result<Message> {
    Message::from_value(value)
}

// ── Classification ──────────────────────────────────────────────────────────

/// `method` + `id` is a request.
#[test]
fn method_and_id_is_request() {
    let msg = classify(json!({ "jsonrpc": "2.0", "id": 4, "method": "tool.call", "params": {} }))
        .expect("valid");
    assert_eq!(msg, Message::request(RequestId::Number(4), "tool.call", Some(json!({}))));
}

/// `method` without `id` is a notification.
#[test]
fn method_without_id_is_notification() {
    let msg = classify(json!({ "jsonrpc": "2.0", "method": "session.event" })).expect("valid");
    assert_eq!(msg, Message::notification("session.event", None));
}

/// `id` + `result` is a successful response; `id` + `error` a failed one.
#[test]
fn id_with_result_or_error_is_response() {
    let ok = classify(json!({ "jsonrpc": "2.0", "id": "1", "result": { "a": 1 } })).expect("valid");
    assert_eq!(ok, Message::response("1", Ok(json!({ "a": 1 }))));

    let err = classify(json!({
        "jsonrpc": "2.0",
        "id": "2",
        "error": { "code": -32601, "message": "nope" },
    }))
    .expect("valid");
    assert_eq!(err, Message::response("2", Err(RpcError::new(METHOD_NOT_FOUND, "nope"))));
}

/// A `null` result is still a successful response.
#[test]
fn null_result_is_success() {
    let msg = classify(json!({ "jsonrpc": "2.0", "id": "1", "result": null })).expect("valid");
    assert_eq!(msg, Message::response("1", Ok(serde_json::Value::Null)));
}

/// `"error": null` counts as absent, the same as `"params": null`.
#[test]
fn null_error_is_treated_as_absent() {
    let msg = classify(json!({ "jsonrpc": "2.0", "id": "1", "result": 5, "error": null }))
        .expect("valid");
    assert_eq!(msg, Message::response("1", Ok(json!(5))));

    let err = classify(json!({ "jsonrpc": "2.0", "id": "1", "error": null })).expect_err("must fail");
    assert!(matches!(err, AppError::InvalidResponse(_)), "got {err:?}");

    let note = classify(json!({ "jsonrpc": "2.0", "method": "tick", "error": null })).expect("valid");
    assert_eq!(note, Message::notification("tick", None));
}

/// Anything but `"2.0"` in `jsonrpc` is rejected.
#[test]
fn wrong_protocol_version_is_rejected() {
    let err = classify(json!({ "jsonrpc": "1.0", "method": "old" })).expect_err("must fail");
    assert!(matches!(err, AppError::InvalidResponse(_)), "got {err:?}");

    assert!(classify(json!({ "method": "old" })).is_err(), "missing jsonrpc");
}

/// Shapes matching no message kind are rejected.
#[test]
fn contradictory_shapes_are_rejected() {
    let cases = [
        json!({ "jsonrpc": "2.0", "id": 1, "method": "m", "result": 1 }),
        json!({ "jsonrpc": "2.0", "id": 1, "result": 1, "error": { "code": 1, "message": "x" } }),
        json!({ "jsonrpc": "2.0", "id": 1 }),
        json!({ "jsonrpc": "2.0" }),
        json!({ "jsonrpc": "2.0", "id": null, "result": 1 }),
        json!({ "jsonrpc": "2.0", "id": 1.5, "result": 1 }),
        json!({ "jsonrpc": "2.0", "method": 5 }),
        json!([1, 2, 3]),
    ];
    for case in cases {
        assert!(classify(case.clone()).is_err(), "must reject {case}");
    }
}

// ── Serialisation ───────────────────────────────────────────────────────────

/// Absent params are omitted rather than written as `null`.
#[test]
fn absent_params_are_omitted() {
    let value = Message::notification("ping", None).to_value();
    assert_eq!(value, json!({ "jsonrpc": "2.0", "method": "ping" }));
}

/// Error responses carry `data` only when present.
#[test]
fn error_response_serialises_data_when_present() {
    let bare = Message::response(RequestId::Number(1), Err(RpcError::internal_error("boom"))).to_value();
    assert_eq!(
        bare,
        json!({ "jsonrpc": "2.0", "id": 1, "error": { "code": INTERNAL_ERROR, "message": "boom" } })
    );

    let with_data = Message::response(
        RequestId::Number(1),
        Err(RpcError::invalid_params("bad").with_data(json!({ "field": "sessionId" }))),
    )
    .to_value();
    assert_eq!(with_data["error"]["code"], json!(INVALID_PARAMS));
    assert_eq!(with_data["error"]["data"], json!({ "field": "sessionId" }));
}

/// Ids display without quotes.
#[test]
fn request_id_display() {
    assert_eq!(RequestId::from("abc").to_string(), "abc");
    assert_eq!(RequestId::from(12_i64).to_string(), "12");
}
