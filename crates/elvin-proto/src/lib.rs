//! Wire format for the Elvin protocol.
//!
//! Every packet travels as a frame: a 4-byte big-endian length followed by
//! the packet body. The body starts with a 4-byte packet type and continues
//! with XDR-style fields (big-endian integers, length-prefixed strings and
//! opaques padded to 4-byte boundaries).
//!
//! We keep the codec free of any async runtime so the same code decodes
//! packets in the router, the client library, the simulation harness and the
//! fuzzers.
//!
//! # Security
//!
//! Decoding treats all input as untrusted. Every read is range checked
//! against the remaining input and returns a [`ProtocolError`] instead of
//! indexing out of bounds. Declared lengths and counts are checked against
//! the remaining bytes before anything is allocated.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod errors;
pub mod frame;
pub mod keys;
pub mod nack;
pub mod notification;
pub mod packet;
pub mod payloads;
pub mod value;
pub mod xdr;
pub mod xid;

pub use errors::{ProtocolError, Result};
pub use frame::{FrameDecoder, encode_frame};
pub use keys::{Key, KeyBlock, KeyScheme, KeySet, SchemeKind};
pub use nack::NackCode;
pub use notification::{ConnectionOptions, Notification};
pub use packet::{Packet, PacketType, packet_id};
pub use value::Value;
pub use xid::{Xid, XidSource};
