//! Length-prefixed frames
//!
//! A frame is a big-endian `u32` body length followed by the body. Assets are
//! sent as one frame, so the length limit has to be generous.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{NetworkError, ProtocolError};
use crate::protocol::MeshMessage;

/// Size of the length prefix
pub const FRAME_HEADER_LEN: usize = 4;

/// Encode a message into a complete frame
pub fn encode_frame(message: &MeshMessage) -> Result<Bytes, ProtocolError> {
    let body = message.encode()?;
    if body.len() > u32::MAX as usize {
        return Err(ProtocolError::Encode(format!(
            "{} body of {} bytes exceeds frame limit",
            message.kind(),
            body.len()
        )));
    }

    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.put_u32(body.len() as u32);
    frame.extend_from_slice(&body);
    Ok(frame.freeze())
}

/// Read one frame body.
///
/// Returns `Ok(None)` when the stream ends between frames.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Vec<u8>>, NetworkError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NetworkError::ReceiveFailed(e.to_string())),
    };

    if len > max_len {
        return Err(NetworkError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| NetworkError::ReceiveFailed(e.to_string()))?;
    Ok(Some(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_read_back_in_order() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&encode_frame(&MeshMessage::Ping { timestamp: 5.0 }).unwrap());
        wire.extend_from_slice(&encode_frame(&MeshMessage::Stop).unwrap());

        let mut reader = wire.as_slice();
        let first = read_frame(&mut reader, 1024).await.unwrap().unwrap();
        let second = read_frame(&mut reader, 1024).await.unwrap().unwrap();

        assert_eq!(
            MeshMessage::decode(&first).unwrap(),
            Some(MeshMessage::Ping { timestamp: 5.0 })
        );
        assert_eq!(MeshMessage::decode(&second).unwrap(), Some(MeshMessage::Stop));
        assert!(read_frame(&mut reader, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let frame = encode_frame(&MeshMessage::Audio {
            file_name: "big.wav".into(),
            raw_bytes: vec![0; 4096],
        })
        .unwrap();

        let mut reader = &frame[..];
        assert!(matches!(
            read_frame(&mut reader, 1024).await,
            Err(NetworkError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_body_is_an_error() {
        let frame = encode_frame(&MeshMessage::Volume { level: 0.4 }).unwrap();
        let mut reader = &frame[..frame.len() - 1];
        assert!(matches!(
            read_frame(&mut reader, 1024).await,
            Err(NetworkError::ReceiveFailed(_))
        ));
    }
}
