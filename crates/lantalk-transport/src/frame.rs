//! Wire format.
//!
//! Every frame is a 4-byte big-endian length followed by a MessagePack body.
//! Invocation arguments and results travel as opaque MessagePack payloads
//! inside the frame; [`encode`] and [`decode`] are the helpers servants and
//! callers use for them.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Identity, TransportError};

/// One unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Invoke `operation` on the servant named `identity`.
    ///
    /// `request_id == 0` marks a oneway invocation: no reply is sent.
    Request {
        request_id: u32,
        identity: Identity,
        operation: String,
        payload: Vec<u8>,
    },
    /// Outcome of a two-way request.
    Reply { request_id: u32, status: ReplyStatus },
    /// Keepalive, carries nothing.
    Heartbeat,
    /// Sender is done with the connection; nothing follows.
    Close,
}

/// Result of dispatching a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyStatus {
    Ok(Vec<u8>),
    ObjectNotExist,
    OperationNotExist(String),
    UserException(String),
    Unknown(String),
}

impl Frame {
    pub fn is_oneway_request(&self) -> bool {
        matches!(self, Frame::Request { request_id: 0, .. })
    }

    /// Requests and replies count as application traffic; heartbeats and
    /// close notifications do not.
    pub fn is_application(&self) -> bool {
        matches!(self, Frame::Request { .. } | Frame::Reply { .. })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, TransportError> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

/// Serialize an invocation payload.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
    Ok(rmp_serde::to_vec(value)?)
}

/// Deserialize an invocation payload.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, TransportError> {
    Ok(rmp_serde::from_slice(data)?)
}

/// Encode a frame body, refusing one that would exceed `max_size` on the wire.
pub(crate) fn encode_frame(frame: &Frame, max_size: usize) -> Result<Vec<u8>, TransportError> {
    let data = frame.to_bytes()?;
    if data.len() > max_size {
        return Err(TransportError::MessageTooLarge {
            size: data.len(),
            max: max_size,
        });
    }
    Ok(data)
}

/// Write an encoded frame body behind its length prefix and flush.
pub(crate) async fn write_encoded<W>(writer: &mut W, data: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let len = (data.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Write a length-prefixed frame and flush.
pub(crate) async fn write_frame<W>(
    writer: &mut W,
    frame: &Frame,
    max_size: usize,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let data = encode_frame(frame, max_size)?;
    write_encoded(writer, &data).await
}

/// Read a length-prefixed frame.
///
/// A clean end of stream before the length prefix yields `Ok(None)`.
pub(crate) async fn read_frame<R>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<Frame>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(TransportError::MessageTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Frame::from_bytes(&buf).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(payload: Vec<u8>) -> Frame {
        Frame::Request {
            request_id: 7,
            identity: Identity::new("peer").unwrap(),
            operation: "message".into(),
            payload,
        }
    }

    #[tokio::test]
    async fn framing_layout() {
        let frame = request(b"hi".to_vec());
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &frame, 1024).await.unwrap();

        let body = frame.to_bytes().unwrap();
        assert_eq!(&buffer[..4], &(body.len() as u32).to_be_bytes());
        assert_eq!(&buffer[4..], &body[..]);

        let mut cursor = &buffer[..];
        let read = read_frame(&mut cursor, 1024).await.unwrap();
        assert_eq!(read, Some(frame));
    }

    #[tokio::test]
    async fn frames_read_back_in_order() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &Frame::Heartbeat, 1024).await.unwrap();
        write_frame(
            &mut buffer,
            &Frame::Reply {
                request_id: 7,
                status: ReplyStatus::UserException("already connected".into()),
            },
            1024,
        )
        .await
        .unwrap();
        write_frame(&mut buffer, &Frame::Close, 1024).await.unwrap();

        let mut cursor = &buffer[..];
        assert_eq!(read_frame(&mut cursor, 1024).await.unwrap(), Some(Frame::Heartbeat));
        assert!(matches!(
            read_frame(&mut cursor, 1024).await.unwrap(),
            Some(Frame::Reply { request_id: 7, status: ReplyStatus::UserException(_) })
        ));
        assert_eq!(read_frame(&mut cursor, 1024).await.unwrap(), Some(Frame::Close));
        assert_eq!(read_frame(&mut cursor, 1024).await.unwrap(), None);
    }

    #[tokio::test]
    async fn write_rejects_oversized() {
        let mut buffer = Vec::new();
        let err = write_frame(&mut buffer, &request(vec![0u8; 256]), 64)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::MessageTooLarge { max: 64, .. }));
        assert!(buffer.is_empty());
    }

    #[test]
    fn size_limit_covers_the_whole_frame() {
        // The payload alone fits, the encoded request does not.
        let frame = request(vec![0u8; 64]);
        let err = encode_frame(&frame, 64).unwrap_err();
        assert!(matches!(err, TransportError::MessageTooLarge { max: 64, size } if size > 64));

        let data = encode_frame(&frame, 1024).unwrap();
        assert_eq!(Frame::from_bytes(&data).unwrap(), frame);
    }

    #[tokio::test]
    async fn read_rejects_oversized_prefix() {
        let mut buffer = 4096u32.to_be_bytes().to_vec();
        buffer.extend_from_slice(&[0u8; 16]);

        let mut cursor = &buffer[..];
        let err = read_frame(&mut cursor, 1024).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::MessageTooLarge { size: 4096, max: 1024 }
        ));
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let mut buffer = 10u32.to_be_bytes().to_vec();
        buffer.extend_from_slice(&[1, 2, 3]);

        let mut cursor = &buffer[..];
        assert!(read_frame(&mut cursor, 1024).await.is_err());
    }

    #[test]
    fn traffic_classification() {
        assert!(request(vec![]).is_application());
        assert!(!request(vec![]).is_oneway_request());
        assert!(!Frame::Heartbeat.is_application());
        assert!(!Frame::Close.is_application());

        let oneway = Frame::Request {
            request_id: 0,
            identity: Identity::new("discover").unwrap(),
            operation: "announce".into(),
            payload: vec![],
        };
        assert!(oneway.is_oneway_request());
    }
}
