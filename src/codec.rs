//! Wire framing for one message per direction per connection.
//!
//! Frame layout:
//!
//! ```text
//! +-------+---------+----------------+-------------------+
//! | "KT"  | version | length (u32 BE)| JSON payload      |
//! +-------+---------+----------------+-------------------+
//! ```

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::envelope::Envelope;

pub const MAGIC: [u8; 2] = *b"KT";
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 7;
pub const MAX_PAYLOAD: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("bad frame magic {0:02x?}")]
    BadMagic([u8; 2]),
    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),
    #[error("frame payload of {0} bytes exceeds limit")]
    TooLarge(usize),
    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// What travels in one frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Message {
    Envelope(Envelope),
    /// Negative acknowledgement; carries the error class, never ticket data.
    Rejected { reason: String },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Envelope(_) => "envelope",
            Message::Rejected { .. } => "rejected",
        }
    }
}

pub fn encode(message: &Message) -> Result<BytesMut, CodecError> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_PAYLOAD {
        return Err(CodecError::TooLarge(payload.len()));
    }
    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    frame.put_slice(&MAGIC);
    frame.put_u8(VERSION);
    frame.put_u32(payload.len() as u32);
    frame.put_slice(&payload);
    Ok(frame)
}

/// Validate a header and return the payload length it announces.
fn parse_header(mut header: &[u8]) -> Result<usize, CodecError> {
    if header.len() < HEADER_LEN {
        return Err(CodecError::Truncated { needed: HEADER_LEN, available: header.len() });
    }
    let magic = [header.get_u8(), header.get_u8()];
    if magic != MAGIC {
        return Err(CodecError::BadMagic(magic));
    }
    let version = header.get_u8();
    if version != VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let len = header.get_u32() as usize;
    if len > MAX_PAYLOAD {
        return Err(CodecError::TooLarge(len));
    }
    Ok(len)
}

pub fn decode(frame: &[u8]) -> Result<Message, CodecError> {
    let len = parse_header(frame)?;
    let body = &frame[HEADER_LEN..];
    if body.len() < len {
        return Err(CodecError::Truncated { needed: len, available: body.len() });
    }
    Ok(serde_json::from_slice(&body[..len])?)
}

pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_message<R>(reader: &mut R) -> Result<Message, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let len = parse_header(&header)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticket::Ticket;

    fn sample() -> Message {
        Message::Envelope(Envelope::from_tickets([Ticket::next_hop_request("SvcA")]).unwrap())
    }

    #[test]
    fn header_layout() {
        let frame = encode(&sample()).unwrap();
        assert_eq!(&frame[..2], b"KT");
        assert_eq!(frame[2], VERSION);
        let len = u32::from_be_bytes([frame[3], frame[4], frame[5], frame[6]]) as usize;
        assert_eq!(len, frame.len() - HEADER_LEN);
        assert_eq!(decode(&frame).unwrap(), sample());
    }

    #[test]
    fn rejects_foreign_frames() {
        let mut frame = encode(&sample()).unwrap();
        frame[0] = b'X';
        assert!(matches!(decode(&frame), Err(CodecError::BadMagic(_))));

        let mut frame = encode(&sample()).unwrap();
        frame[2] = 9;
        assert!(matches!(decode(&frame), Err(CodecError::UnsupportedVersion(9))));
    }

    #[test]
    fn rejects_oversized_announcement() {
        let mut frame = encode(&sample()).unwrap();
        frame[3..7].copy_from_slice(&((MAX_PAYLOAD as u32) + 1).to_be_bytes());
        assert!(matches!(decode(&frame), Err(CodecError::TooLarge(_))));
    }

    #[test]
    fn truncated_body_is_reported() {
        let frame = encode(&sample()).unwrap();
        let cut = &frame[..frame.len() - 3];
        assert!(matches!(decode(cut), Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn rejection_is_tagged() {
        let json = serde_json::to_value(Message::Rejected { reason: "expired_ticket".into() }).unwrap();
        assert_eq!(json["kind"], "rejected");
        assert_eq!(json["reason"], "expired_ticket");
    }

    #[tokio::test]
    async fn async_read_write_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_message(&mut a, &sample()).await.unwrap();
        write_message(&mut a, &Message::Rejected { reason: "replay".into() }).await.unwrap();

        assert_eq!(read_message(&mut b).await.unwrap(), sample());
        assert_eq!(read_message(&mut b).await.unwrap().kind(), "rejected");
    }

    #[tokio::test]
    async fn closed_stream_is_io_error() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(matches!(read_message(&mut b).await, Err(CodecError::Io(_))));
    }
}
