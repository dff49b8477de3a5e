//! Client lifecycle events.

use elvin_proto::payloads::{Disconn, DisconnReason};

/// Why a router connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// [`crate::Client::disconnect`] was called.
    Requested,
    /// The router is shutting down (Disconn 1).
    Shutdown,
    /// The router sent the client elsewhere (Disconn 2).
    Redirect(String),
    /// The router saw a protocol error from this client (Disconn 4).
    ProtocolViolation,
    /// The router gave a reason code this library does not name.
    Router(i32),
    /// The transport failed, or the router stopped answering.
    ConnectionLost,
    /// The router sent something this client could not accept.
    ProtocolError,
}

impl DisconnectReason {
    /// Numeric reason code, when the protocol assigns one.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Requested => None,
            Self::Shutdown => Some(1),
            Self::Redirect(_) => Some(2),
            Self::ProtocolViolation => Some(4),
            Self::Router(code) => Some(*code),
            Self::ConnectionLost => Some(100),
            Self::ProtocolError => Some(101),
        }
    }

    /// Whether the reconnect policy applies after this reason.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Shutdown | Self::ConnectionLost)
    }
}

impl From<&Disconn> for DisconnectReason {
    fn from(disconn: &Disconn) -> Self {
        match disconn.reason {
            DisconnReason::Shutdown => Self::Shutdown,
            DisconnReason::Redirect => Self::Redirect(disconn.args.clone()),
            DisconnReason::ProtocolViolation => Self::ProtocolViolation,
            DisconnReason::Other(code) => Self::Router(code),
        }
    }
}

/// Connection-level happenings, broadcast to every [`crate::Client::events`]
/// receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The router connection ended.
    Disconnected {
        /// Why.
        reason: DisconnectReason,
    },
    /// A new connection is up and every subscription and quench was replayed.
    Reconnected,
    /// Reconnection was abandoned; the client stays disconnected.
    ReconnectFailed,
    /// The router dropped deliveries because this client fell behind.
    DropWarn,
}
