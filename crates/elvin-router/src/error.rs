//! Router errors.

use std::io;

use elvin_core::FrameError;
use thiserror::Error;

/// Errors from running the router.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Binding or accepting failed.
    #[error("listener error: {0}")]
    Io(#[from] io::Error),

    /// A connection's stream failed.
    #[error("connection error: {0}")]
    Frame(#[from] FrameError),

    /// No listen addresses were configured.
    #[error("no listen addresses configured")]
    NoListeners,
}
