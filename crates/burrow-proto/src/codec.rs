//! Codec for encoding/decoding control messages
//!
//! Format: [length: u32 big-endian][payload: bincode serialized message]

use crate::messages::ControlMessage;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Connection closed")]
    ConnectionClosed,
}

/// Control message codec
pub struct TunnelCodec;

impl TunnelCodec {
    /// Maximum message size (16MB)
    pub const MAX_MESSAGE_SIZE: usize = crate::MAX_FRAME_SIZE as usize;

    /// Encode a control message to bytes
    pub fn encode(msg: &ControlMessage) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }
}

/// Write one framed message and flush.
pub async fn write_message<W>(writer: &mut W, msg: &ControlMessage) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = TunnelCodec::encode(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one framed message.
///
/// Never reads past the end of the frame, so the stream can be handed to a
/// relay right after a handshake message. A clean EOF before the first
/// length byte yields `CodecError::ConnectionClosed`.
pub async fn read_message<R>(reader: &mut R) -> Result<ControlMessage, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut length_bytes = [0u8; 4];
    let mut filled = 0;
    while filled < length_bytes.len() {
        let n = reader.read(&mut length_bytes[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Err(CodecError::ConnectionClosed);
            }
            return Err(CodecError::IoError(std::io::ErrorKind::UnexpectedEof.into()));
        }
        filled += n;
    }

    let length = u32::from_be_bytes(length_bytes) as usize;
    if length > TunnelCodec::MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(length));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(bincode::deserialize(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_prefixes_length() {
        let msg = ControlMessage::ReqWorkConn {
            session_id: "s-1".to_string(),
        };

        let encoded = TunnelCodec::encode(&msg).unwrap();
        let length = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize;
        assert_eq!(length, encoded.len() - 4);

        let decoded: ControlMessage = bincode::deserialize(&encoded[4..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn test_read_message_rejects_oversized_length() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

        assert!(matches!(
            read_message(&mut server).await,
            Err(CodecError::MessageTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_read_message_leaves_trailing_bytes() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let msg = ControlMessage::NewWorkConn {
            run_id: "agent-1".to_string(),
            session_id: String::new(),
        };
        write_message(&mut client, &msg).await.unwrap();
        client.write_all(b"relayed payload").await.unwrap();
        drop(client);

        let received = read_message(&mut server).await.unwrap();
        assert_eq!(received, msg);

        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"relayed payload");
    }

    #[tokio::test]
    async fn test_read_message_on_closed_stream() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        assert!(matches!(
            read_message(&mut server).await,
            Err(CodecError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_read_message_truncated_header() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0, 0]).await.unwrap();
        drop(client);

        assert!(matches!(
            read_message(&mut server).await,
            Err(CodecError::IoError(_))
        ));
    }
}
