//! Error types shared across the crate.

use std::fmt::{Display, Formatter};

use crate::rpc::message::RpcError;

/// Shared crate result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Error enumeration covering transport, framing, and correlation failures.
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or process I/O failure outside the wire stream.
    Io(String),
    /// The transport or connection is not open.
    NotConnected(String),
    /// Opening the transport or writing to it failed.
    ConnectionFailed(String),
    /// The peer closed the stream, or the connection was torn down locally.
    ConnectionClosed(String),
    /// A frame or message on the wire could not be decoded.
    InvalidResponse(String),
    /// The peer answered a request with a JSON-RPC error object.
    Rpc(RpcError),
    /// The peer speaks a different protocol version.
    VersionMismatch {
        /// Version compiled into this client.
        expected: u32,
        /// Version reported by the peer, if it reported one.
        actual: Option<u64>,
    },
    /// A request deadline elapsed before the response arrived.
    Timeout(String),
    /// An operation was attempted in a state that does not allow it.
    InvalidState(String),
    /// Requested entity does not exist.
    NotFound(String),
}

impl AppError {
    /// Whether this error ends the connection it occurred on.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::NotConnected(_)
                | Self::ConnectionFailed(_)
                | Self::ConnectionClosed(_)
                | Self::InvalidResponse(_)
                | Self::VersionMismatch { .. }
        )
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::NotConnected(msg) => write!(f, "not connected: {msg}"),
            Self::ConnectionFailed(msg) => write!(f, "connection failed: {msg}"),
            Self::ConnectionClosed(msg) => write!(f, "connection closed: {msg}"),
            Self::InvalidResponse(msg) => write!(f, "invalid response: {msg}"),
            Self::Rpc(err) => write!(f, "rpc: {err}"),
            Self::VersionMismatch {
                expected,
                actual: Some(actual),
            } => write!(
                f,
                "version mismatch: expected protocol version {expected}, server reported {actual}"
            ),
            Self::VersionMismatch {
                expected,
                actual: None,
            } => write!(
                f,
                "version mismatch: expected protocol version {expected}, server reported none"
            ),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidResponse(format!("malformed json: {err}"))
    }
}

impl From<RpcError> for AppError {
    fn from(err: RpcError) -> Self {
        Self::Rpc(err)
    }
}
