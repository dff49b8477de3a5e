//! Async frame reader and writer.
//!
//! Reads a 4-byte big-endian length and then exactly that many body bytes.
//! The length is checked against the connection's maximum before the body
//! buffer is allocated. The framing layer never looks inside the body;
//! [`read_packet`] and [`write_packet`] add the packet codec on top.

use bytes::{BufMut, Bytes, BytesMut};
use elvin_proto::{Packet, frame::HEADER_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FrameError;

/// Fill `buf` completely, returning how many bytes arrived before EOF.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Read one frame body.
///
/// Returns `Ok(None)` on a clean end of stream before any header byte.
///
/// # Errors
///
/// - `Truncated` if the stream ends inside a header or body
/// - `TooLarge` if the declared length exceeds `max_len`
/// - `Io` on a transport failure
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Bytes>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let got = read_full(reader, &mut header).await?;
    if got == 0 {
        return Ok(None);
    }
    if got < HEADER_LEN {
        return Err(FrameError::Truncated { expected: HEADER_LEN, received: got });
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max_len {
        return Err(FrameError::TooLarge { size: len, max: max_len });
    }

    let mut body = vec![0u8; len];
    let got = read_full(reader, &mut body).await?;
    if got < len {
        return Err(FrameError::Truncated { expected: HEADER_LEN + len, received: HEADER_LEN + got });
    }
    Ok(Some(Bytes::from(body)))
}

/// Write one frame: length header then body, then flush.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(body);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and decode one packet. `Ok(None)` on clean end of stream.
pub async fn read_packet<R>(reader: &mut R, max_len: usize) -> Result<Option<Packet>, FrameError>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader, max_len).await? {
        Some(body) => Ok(Some(Packet::decode(&body)?)),
        None => Ok(None),
    }
}

/// Encode and write one packet.
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, &packet.encode()).await
}

#[cfg(test)]
mod tests {
    use elvin_proto::{Notification, ProtocolError, encode_frame, payloads::NotifyEmit};
    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn packets_survive_a_small_pipe() {
        // An 8-byte pipe forces partial reads and writes.
        let (mut a, mut b) = duplex(8);
        let packet: Packet = NotifyEmit {
            attributes: Notification::new().with("Group", "eng").with("count", 7),
            deliver_insecure: true,
            keys: Default::default(),
        }
        .into();

        let sent = packet.clone();
        let writer = tokio::spawn(async move {
            write_packet(&mut a, &sent).await.unwrap();
            write_packet(&mut a, &Packet::TestConn).await.unwrap();
        });

        assert_eq!(read_packet(&mut b, 1024).await.unwrap(), Some(packet));
        assert_eq!(read_packet(&mut b, 1024).await.unwrap(), Some(Packet::TestConn));
        writer.await.unwrap();
        assert!(read_packet(&mut b, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_frame_is_truncated() {
        let frame = encode_frame(&Packet::TestConn);
        let mut input = &frame[..6];
        assert!(matches!(
            read_frame(&mut input, 1024).await,
            Err(FrameError::Truncated { expected: 8, received: 6 })
        ));

        let mut input = &frame[..2];
        assert!(matches!(read_frame(&mut input, 1024).await, Err(FrameError::Truncated { .. })));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_before_reading_body() {
        let input = [0x00, 0x10, 0x00, 0x00];
        let mut reader = &input[..];
        assert!(matches!(
            read_frame(&mut reader, 1024).await,
            Err(FrameError::TooLarge { size: 0x0010_0000, max: 1024 })
        ));
    }

    #[tokio::test]
    async fn garbage_body_is_a_decode_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &[0, 0, 0, 99]).await.unwrap();
        let mut reader = &buf[..];
        assert!(matches!(
            read_packet(&mut reader, 1024).await,
            Err(FrameError::Decode(ProtocolError::UnknownPacket(99)))
        ));
    }
}
