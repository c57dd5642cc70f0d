//! Wire frame codec.
//!
//! Every cluster message is one frame: `[tag: u8][length: varint][payload]`.
//! The length is LEB128-encoded (7 bits per byte, high bit = continuation).
//! Payload bytes are handler-defined; the core never inspects them.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{ClusterError, MessageTag, Result};

/// Upper bound on the encoded length field for a u64 value.
pub const MAX_VARINT_LEN: usize = 10;

/// Append a LEB128 varint to `buf`.
pub fn encode_varint(mut value: u64, buf: &mut impl BufMut) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

/// Decode a LEB128 varint from the front of `buf`. Returns the value and the
/// number of bytes consumed, or `None` if `buf` is truncated or the encoding
/// overlong.
pub fn decode_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate().take(MAX_VARINT_LEN) {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

/// Encode a complete frame: tag, varint payload length, payload.
pub fn encode_frame(tag: MessageTag, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + MAX_VARINT_LEN + payload.len());
    buf.put_u8(tag);
    encode_varint(payload.len() as u64, &mut buf);
    buf.put_slice(payload);
    buf.freeze()
}

async fn read_varint<R>(reader: &mut R) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut value: u64 = 0;
    for i in 0..MAX_VARINT_LEN {
        let byte = reader.read_u8().await.map_err(truncated)?;
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(ClusterError::Protocol(
        "frame length varint too long".to_string(),
    ))
}

fn truncated(err: std::io::Error) -> ClusterError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ClusterError::Protocol("truncated frame".to_string())
    } else {
        ClusterError::Network(err)
    }
}

/// Read one frame. Returns `None` on a clean end-of-stream (EOF before the
/// tag byte); EOF anywhere inside a frame is a protocol error.
pub async fn read_frame<R>(
    reader: &mut R,
    max_payload: usize,
) -> Result<Option<(MessageTag, Bytes)>>
where
    R: AsyncRead + Unpin,
{
    let tag = match reader.read_u8().await {
        Ok(tag) => tag,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(ClusterError::Network(err)),
    };

    let len = read_varint(reader).await? as usize;
    if len > max_payload {
        return Err(ClusterError::MessageTooLarge {
            size: len,
            max: max_payload,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(truncated)?;
    Ok(Some((tag, Bytes::from(payload))))
}

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, tag: MessageTag, payload: &[u8]) -> Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(tag, payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(frame.len())
}
