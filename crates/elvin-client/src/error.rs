//! Client error types.

use std::{io, time::Duration};

use elvin_core::ConnectionError;
use elvin_proto::{NackCode, PacketType};
use thiserror::Error;

/// Errors returned by [`crate::Client`] operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No router connection is open.
    #[error("not connected")]
    NotConnected,

    /// The reply did not arrive in time.
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// The router rejected the request.
    #[error("router rejected request ({}): {message}", code.code())]
    Nack {
        /// Nack code.
        code: NackCode,
        /// Message with arguments substituted.
        message: String,
    },

    /// The router answered with the wrong packet type.
    #[error("unexpected reply {0:?}")]
    UnexpectedReply(PacketType),

    /// The connection closed while the request was outstanding.
    #[error("connection lost")]
    ConnectionLost,

    /// The request is illegal in the connection's current state.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The transport could not be opened.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}
