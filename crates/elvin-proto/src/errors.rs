//! Decode and framing errors.

use thiserror::Error;

/// Result alias for wire operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while decoding untrusted wire data.
///
/// All of these are local: they abort decoding of the current packet and
/// are never sent to the peer verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The buffer ended before a declared field was complete.
    #[error("truncated input: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes required by the field being decoded.
        needed: usize,
        /// Bytes remaining in the input.
        available: usize,
    },

    /// A length or count field was negative.
    #[error("negative length {0}")]
    NegativeLength(i32),

    /// A typed value carried an unknown tag, or a boolean was not 0/1.
    #[error("corrupt value (tag {0})")]
    CorruptValue(i32),

    /// A string field was not valid UTF-8.
    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    /// The packet type discriminant is not part of the protocol.
    #[error("unknown packet type {0}")]
    UnknownPacket(i32),

    /// A key block referenced an unknown key scheme.
    #[error("unknown key scheme {0}")]
    UnknownKeyScheme(i32),

    /// A key scheme carried the wrong number of key sets.
    #[error("key scheme {scheme} expects {expected} key sets, got {actual}")]
    BadKeySetCount {
        /// Scheme identifier.
        scheme: i32,
        /// Number of sets the scheme requires.
        expected: usize,
        /// Number of sets present.
        actual: usize,
    },

    /// A key-set index was outside the range allowed by its scheme.
    #[error("key set index {index} out of range for scheme {scheme}")]
    BadKeySetIndex {
        /// Scheme identifier.
        scheme: i32,
        /// Offending index.
        index: usize,
    },

    /// A name appeared twice in a name/value map.
    #[error("duplicate attribute name {0:?}")]
    DuplicateName(String),

    /// Bytes were left over after the packet body.
    #[error("{0} trailing bytes after packet body")]
    TrailingBytes(usize),

    /// A frame declared a length above the negotiated maximum.
    #[error("frame of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge {
        /// Declared frame length.
        size: usize,
        /// Maximum accepted length.
        max: usize,
    },
}
