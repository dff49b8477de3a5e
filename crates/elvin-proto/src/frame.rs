//! Length-prefixed framing.
//!
//! A frame is a 4-byte big-endian body length followed by the packet body.
//! The async readers in `elvin-core` use the same header layout; this module
//! holds the synchronous pieces used for encoding, tests and fuzzing.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    errors::{ProtocolError, Result},
    packet::Packet,
};

/// Size of the frame length header.
pub const HEADER_LEN: usize = 4;

/// Largest frame accepted unless a connection negotiates otherwise (2 MiB).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 2 * 1024 * 1024;

/// Encode `packet` with its length header.
pub fn encode_frame(packet: &Packet) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u32(0);
    packet.encode_into(&mut buf);
    let body_len = (buf.len() - HEADER_LEN) as u32;
    buf[..HEADER_LEN].copy_from_slice(&body_len.to_be_bytes());
    buf.freeze()
}

/// Incremental frame splitter over a growing byte buffer.
///
/// ```
/// use bytes::BytesMut;
/// use elvin_proto::{FrameDecoder, Packet, encode_frame};
///
/// let mut buf = BytesMut::from(&encode_frame(&Packet::TestConn)[..]);
/// let body = FrameDecoder::default().decode(&mut buf).unwrap().unwrap();
/// assert_eq!(Packet::decode(&body).unwrap(), Packet::TestConn);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct FrameDecoder {
    max_len: usize,
}

impl FrameDecoder {
    /// Decoder rejecting bodies longer than `max_len`.
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }

    /// Maximum accepted body length.
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Split the next complete frame body off the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. The length is checked
    /// against the maximum before any body bytes are awaited, so an
    /// oversized declaration fails immediately.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Bytes>> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&buf[..HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_len {
            return Err(ProtocolError::FrameTooLarge { size: len, max: self.max_len });
        }
        if buf.len() < HEADER_LEN + len {
            buf.reserve(HEADER_LEN + len - buf.len());
            return Ok(None);
        }
        buf.advance(HEADER_LEN);
        Ok(Some(buf.split_to(len).freeze()))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;
    use proptest::prelude::*;

    use super::*;
    use crate::{keys::KeyBlock, notification::Notification, payloads::NotifyEmit};

    #[test]
    fn frame_layout() {
        assert_eq!(&encode_frame(&Packet::ConfConn)[..], &hex!("00 00 00 04 00 00 00 40"));
    }

    #[test]
    fn partial_frames_wait_for_more() {
        let frame = encode_frame(&Packet::TestConn);
        let decoder = FrameDecoder::default();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&frame[..2]);
        assert_eq!(decoder.decode(&mut buf), Ok(None));
        buf.extend_from_slice(&frame[2..6]);
        assert_eq!(decoder.decode(&mut buf), Ok(None));
        buf.extend_from_slice(&frame[6..]);
        let body = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(Packet::decode(&body).unwrap(), Packet::TestConn);
        assert!(buf.is_empty());
    }

    #[test]
    fn back_to_back_frames_split_cleanly() {
        let decoder = FrameDecoder::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(&Packet::TestConn));
        buf.extend_from_slice(&encode_frame(&Packet::DropWarn));

        let first = decoder.decode(&mut buf).unwrap().unwrap();
        let second = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(Packet::decode(&first).unwrap(), Packet::TestConn);
        assert_eq!(Packet::decode(&second).unwrap(), Packet::DropWarn);
        assert_eq!(decoder.decode(&mut buf), Ok(None));
    }

    #[test]
    fn oversized_declaration_fails_before_body_arrives() {
        let decoder = FrameDecoder::new(16);
        let mut buf = BytesMut::from(&hex!("00 00 01 00")[..]);
        assert_eq!(decoder.decode(&mut buf), Err(ProtocolError::FrameTooLarge { size: 256, max: 16 }));
    }

    proptest! {
        #[test]
        fn any_split_point_yields_the_same_packet(split in 0usize..64, count in any::<i32>()) {
            let packet: Packet = NotifyEmit {
                attributes: Notification::new().with("count", count).with("name", "split"),
                deliver_insecure: false,
                keys: KeyBlock::new(),
            }
            .into();
            let frame = encode_frame(&packet);
            let split = split.min(frame.len());
            let decoder = FrameDecoder::default();

            let mut buf = BytesMut::from(&frame[..split]);
            let early = decoder.decode(&mut buf).unwrap();
            prop_assert!(early.is_none() || split == frame.len());
            buf.extend_from_slice(&frame[split..]);
            let body = match early {
                Some(body) => body,
                None => decoder.decode(&mut buf).unwrap().unwrap(),
            };
            prop_assert_eq!(Packet::decode(&body).unwrap(), packet);
        }
    }
}
