//! Integration tests for the TCP and child-process transports.

use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use agent_link::rpc::codec::encode_frame;
use agent_link::rpc::message::Message;
use agent_link::transport::socket::SocketTransport;
use agent_link::transport::Transport;
use agent_link::AppError;

// ── Socket transport ────────────────────────────────────────────────────────

/// Frames written by the server are decoded; frames sent by the client arrive
/// byte-for-byte.
#[tokio::test]
async fn socket_transport_exchanges_frames() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local addr").port();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let hello = encode_frame(&Message::notification("hello", None).to_value()).expect("encode");
        stream.write_all(&hello).await.expect("write");

        let expected = encode_frame(&Message::request("1", "ping", None).to_value()).expect("encode");
        let mut got = vec![0_u8; expected.len()];
        stream.read_exact(&mut got).await.expect("read");
        assert_eq!(got, expected.to_vec());
    });

    let address = format!("127.0.0.1:{port}");
    let transport = SocketTransport::connect(&address, Some(Duration::from_secs(5)))
        .await
        .expect("connect");
    assert_eq!(transport.peer(), format!("127.0.0.1:{port}"));

    let msg = transport.receive_next().await.expect("receive");
    assert_eq!(msg, Message::notification("hello", None));

    let frame = encode_frame(&Message::request("1", "ping", None).to_value()).expect("encode");
    transport.send(frame).await.expect("send");
    server.await.expect("server task");

    transport.close().await.expect("close");
    assert!(transport.is_closed());
}

/// The server closing the socket surfaces as `ConnectionClosed`.
#[tokio::test]
async fn socket_transport_reports_peer_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local addr").port();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        drop(stream);
    });

    let transport = SocketTransport::connect(&format!("127.0.0.1:{port}"), None)
        .await
        .expect("connect");
    server.await.expect("server task");

    let err = transport.receive_next().await.expect_err("must fail");
    assert!(err.is_connection_error(), "got {err:?}");
}

/// A bracketed IPv6 address connects, and the peer keeps its brackets.
#[tokio::test]
async fn socket_transport_connects_to_ipv6_loopback() {
    let Ok(listener) = TcpListener::bind("[::1]:0").await else {
        // Host without IPv6 loopback.
        return;
    };
    let port = listener.local_addr().expect("local addr").port();
    let server = tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.expect("accept");
    });

    let transport = SocketTransport::connect_to("::1", port, Some(Duration::from_secs(5)))
        .await
        .expect("connect");
    assert_eq!(transport.peer(), format!("[::1]:{port}"));
    server.await.expect("server task");
}

/// Nothing listening is a connection failure.
#[tokio::test]
async fn socket_transport_connect_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);

    let address = format!("127.0.0.1:{port}");
    let err = SocketTransport::connect(&address, Some(Duration::from_secs(5)))
        .await
        .expect_err("must fail");
    assert!(matches!(err, AppError::ConnectionFailed(_)), "got {err:?}");
}

/// A malformed address is rejected before any connection attempt.
#[tokio::test]
async fn socket_transport_rejects_bad_address() {
    let err = SocketTransport::connect("localhost:notaport", None)
        .await
        .expect_err("must fail");
    assert!(matches!(err, AppError::Config(_)), "got {err:?}");
}

// ── Process transport ───────────────────────────────────────────────────────

#[cfg(unix)]
mod process {
    use super::*;

    use agent_link::transport::process::{ProcessTransport, SpawnConfig};
    use agent_link::ClientConfig;

    /// `sh -c cat` ignores the server-mode arguments (they become `$0..`) and
    /// echoes stdin back, which makes it a stand-in agent.
    fn echo_agent() -> SpawnConfig {
        SpawnConfig::from_config(&ClientConfig {
            cli_path: "sh".to_owned(),
            cli_args: vec!["-c".to_owned(), "cat".to_owned()],
            ..ClientConfig::default()
        })
    }

    /// A frame written to the child's stdin comes back from its stdout.
    #[tokio::test]
    async fn process_transport_round_trips_through_child() {
        let transport = ProcessTransport::spawn(&echo_agent()).expect("spawn");
        assert!(transport.pid().is_some());

        let sent = Message::request("1", "ping", Some(json!({ "message": "hi" })));
        let frame = encode_frame(&sent.to_value()).expect("encode");
        transport.send(frame).await.expect("send");

        let echoed = transport.receive_next().await.expect("receive");
        assert_eq!(echoed, sent);

        transport.close().await.expect("close");
        assert!(transport.is_closed());
        assert!(transport.exit_status().await.is_some(), "child must be reaped");
    }

    /// A missing executable is a connection failure naming the binary.
    #[tokio::test]
    async fn process_transport_missing_binary() {
        let config = SpawnConfig::from_config(&ClientConfig {
            cli_path: "/nonexistent/agent-binary".to_owned(),
            ..ClientConfig::default()
        });

        let err = ProcessTransport::spawn(&config).expect_err("must fail");
        match err {
            AppError::ConnectionFailed(msg) => assert!(msg.contains("failed to spawn agent")),
            other => panic!("expected ConnectionFailed, got {other:?}"),
        }
    }

    /// The child exiting on its own surfaces as a connection error.
    #[tokio::test]
    async fn process_transport_child_exit_closes_stream() {
        let config = SpawnConfig::from_config(&ClientConfig {
            cli_path: "sh".to_owned(),
            cli_args: vec!["-c".to_owned(), "exit 0".to_owned()],
            ..ClientConfig::default()
        });
        let transport = ProcessTransport::spawn(&config).expect("spawn");

        let err = transport.receive_next().await.expect_err("must fail");
        assert!(err.is_connection_error(), "got {err:?}");

        transport.close().await.expect("close");
    }
}
