//! TCP transport to an already-running agent server.

use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tracing::info;

use crate::rpc::message::Message;
use crate::transport::{BoxFuture, StreamTransport, Transport};
use crate::{AppError, Result};

/// Host used when the address is a bare port.
pub const DEFAULT_HOST: &str = "localhost";

/// Split an agent address into `(host, port)`.
///
/// Accepted forms:
/// - `host:port`
/// - `port` (host defaults to [`DEFAULT_HOST`])
/// - `http://host:port/…` or `https://host:port/…` (scheme and path dropped)
/// - `[::1]:port` (brackets dropped)
///
/// # Errors
///
/// Returns [`AppError::Config`] when the host is empty or the port is not an
/// integer in `1..=65535`.
pub fn parse_address(address: &str) -> Result<(String, u16)> {
    let trimmed = address.trim();
    let without_scheme = ["http://", "https://"]
        .iter()
        .find_map(|scheme| {
            trimmed
                .get(..scheme.len())
                .filter(|prefix| prefix.eq_ignore_ascii_case(scheme))
                .map(|_| &trimmed[scheme.len()..])
        })
        .unwrap_or(trimmed);
    let authority = without_scheme
        .split_once('/')
        .map_or(without_scheme, |(authority, _path)| authority);

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, _)) if host.contains(':') && !host.starts_with('[') => {
            return Err(AppError::Config(format!(
                "invalid agent address '{address}': bracket IPv6 hosts as [addr]:port"
            )));
        }
        Some((host, port)) => (host, port),
        None => (DEFAULT_HOST, authority),
    };

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(AppError::Config(format!(
            "invalid agent address '{address}': empty host"
        )));
    }

    let port = port
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| {
            AppError::Config(format!(
                "invalid agent address '{address}': port must be 1-65535"
            ))
        })?;

    Ok((host.to_owned(), port))
}

/// Render `host` and `port` so the result parses back through [`parse_address`].
fn format_peer(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Transport over a TCP connection.
#[derive(Debug)]
pub struct SocketTransport {
    stream: StreamTransport,
    peer: String,
}

impl SocketTransport {
    /// Connect to `address` (any form accepted by [`parse_address`]).
    ///
    /// # Errors
    ///
    /// - [`AppError::Config`] for an unparsable address.
    /// - [`AppError::ConnectionFailed`] when the connection is refused or
    ///   `connect_timeout` elapses.
    pub async fn connect(address: &str, connect_timeout: Option<Duration>) -> Result<Self> {
        let (host, port) = parse_address(address)?;
        Self::connect_to(&host, port, connect_timeout).await
    }

    /// Connect to an already-split `host` and `port`.
    ///
    /// `host` is unbracketed, as returned by [`parse_address`].
    ///
    /// # Errors
    ///
    /// [`AppError::ConnectionFailed`] when the connection is refused or
    /// `connect_timeout` elapses.
    pub async fn connect_to(
        host: &str,
        port: u16,
        connect_timeout: Option<Duration>,
    ) -> Result<Self> {
        let peer = format_peer(host, port);

        let connecting = TcpStream::connect((host, port));
        let tcp = match connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connecting).await.map_err(|_| {
                AppError::ConnectionFailed(format!("connect to {peer} timed out after {limit:?}"))
            })?,
            None => connecting.await,
        }
        .map_err(|e| AppError::ConnectionFailed(format!("failed to connect to {peer}: {e}")))?;

        tcp.set_nodelay(true)
            .map_err(|e| AppError::ConnectionFailed(format!("failed to configure socket: {e}")))?;

        info!(%peer, "transport: connected to agent server");
        let (read_half, write_half) = tcp.into_split();
        Ok(Self {
            stream: StreamTransport::from_io("socket", read_half, write_half),
            peer,
        })
    }

    /// `host:port` this transport is connected to; IPv6 hosts are bracketed.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl Transport for SocketTransport {
    fn send(&self, frame: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.stream.send_frame(&frame).await })
    }

    fn receive_next(&self) -> BoxFuture<'_, Result<Message>> {
        Box::pin(self.stream.next_message())
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.stream.shutdown().await;
            Ok(())
        })
    }

    fn is_closed(&self) -> bool {
        self.stream.is_shut_down()
    }
}
