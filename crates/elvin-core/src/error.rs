//! Error types for the core state machines and framing.

use std::{io, time::Duration};

use elvin_proto::{NackCode, PacketType, ProtocolError, Value};
use thiserror::Error;

use crate::connection::ConnectionState;

/// Errors from reading or writing frames.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The underlying stream failed.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    /// The stream ended part way through a frame.
    #[error("stream ended mid-frame after {received} of {expected} bytes")]
    Truncated {
        /// Bytes the frame header promised (header included).
        expected: usize,
        /// Bytes actually received.
        received: usize,
    },

    /// A frame declared a body above the negotiated maximum.
    #[error("frame of {size} bytes exceeds maximum of {max}")]
    TooLarge {
        /// Declared body length.
        size: usize,
        /// Accepted maximum.
        max: usize,
    },

    /// The frame body was not a valid packet.
    #[error("malformed packet: {0}")]
    Decode(#[from] ProtocolError),
}

/// Protocol violations detected by the connection state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// A local operation was attempted in the wrong state.
    #[error("cannot {operation} in state {state:?}")]
    InvalidState {
        /// Current state.
        state: ConnectionState,
        /// Attempted operation.
        operation: &'static str,
    },

    /// The peer sent a packet that is not legal in the current state.
    #[error("unexpected {packet} in state {state:?}")]
    UnexpectedPacket {
        /// Current state.
        state: ConnectionState,
        /// Offending packet type.
        packet: PacketType,
    },

    /// A second ConnRqst arrived on an established connection.
    #[error("connection is already established")]
    AlreadyConnected,

    /// The handshake did not complete in time.
    #[error("handshake not completed after {0:?}")]
    HandshakeTimeout(Duration),

    /// The connection is closed.
    #[error("connection closed")]
    Closed,
}

impl ConnectionError {
    /// Nack code and arguments reported to the peer for this violation.
    pub fn to_nack(&self) -> (NackCode, Vec<Value>) {
        (NackCode::ProtocolError, vec![Value::from(self.to_string())])
    }
}

/// Failures of registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No subscription has this id on the connection.
    #[error("unknown subscription {0:#x}")]
    UnknownSubscription(u64),

    /// No quench has this id on the connection.
    #[error("unknown quench {0:#x}")]
    UnknownQuench(u64),

    /// Every 32-bit slot is in use.
    #[error("no free slots")]
    Exhausted,
}

impl RegistryError {
    /// Nack code and substitution arguments for this error.
    pub fn to_nack(&self) -> (NackCode, Vec<Value>) {
        match self {
            Self::UnknownSubscription(id) => (NackCode::NoSuchSubscription, vec![Value::Int64(*id as i64)]),
            Self::UnknownQuench(id) => (NackCode::NoSuchQuench, vec![Value::Int64(*id as i64)]),
            Self::Exhausted => (NackCode::ImplementationLimit, vec![Value::from("slots")]),
        }
    }
}
