//! Connection state machine.

use std::fmt::{Display, Formatter};

/// Lifecycle state of an [`AgentClient`](crate::connection::AgentClient).
///
/// ```text
/// Disconnected ──connect──▶ Connecting ──handshake ok──▶ Connected
///      ▲                        │                           │
///      │                        └──────failure──▶ Error ◀───┘
///      └──────────────── stop / force_stop ─────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No transport is open.
    #[default]
    Disconnected,
    /// Transport opening or handshake in flight.
    Connecting,
    /// Handshake succeeded; requests may be sent.
    Connected,
    /// The connection failed; `connect` may be called again.
    Error,
}

impl ConnectionState {
    /// Whether `connect` may start from this state.
    #[must_use]
    pub fn can_connect(self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}
