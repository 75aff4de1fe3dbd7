//! Codec for encoding/decoding control messages

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
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
}

impl CodecError {
    /// True when the peer hung up before a complete frame arrived
    pub fn is_eof(&self) -> bool {
        matches!(self, CodecError::IoError(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

/// Control message codec
pub struct ControlCodec;

impl ControlCodec {
    /// Maximum message size (1MB); control messages are tiny
    pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

    /// Encode a message to bytes
    ///
    /// Format: [length: u32][payload: bincode serialized message]
    pub fn encode<T: Serialize>(msg: &T) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Read one raw frame payload from a stream
    ///
    /// Returns Ok(None) if the stream ended cleanly before any byte of the
    /// frame arrived.
    pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Bytes>, CodecError>
    where
        R: AsyncRead + Unpin,
    {
        let mut length_bytes = [0u8; 4];
        let first = reader.read(&mut length_bytes[..1]).await?;
        if first == 0 {
            return Ok(None);
        }
        reader.read_exact(&mut length_bytes[1..]).await?;

        let length = u32::from_be_bytes(length_bytes) as usize;
        if length > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        let mut payload = vec![0u8; length];
        reader.read_exact(&mut payload).await?;

        Ok(Some(Bytes::from(payload)))
    }

    /// Read and deserialize one message from a stream
    pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>, CodecError>
    where
        R: AsyncRead + Unpin,
        T: DeserializeOwned,
    {
        match Self::read_frame(reader).await? {
            Some(payload) => Ok(Some(bincode::deserialize(&payload)?)),
            None => Ok(None),
        }
    }

    /// Serialize and write one message to a stream
    pub async fn write_message<W, T>(writer: &mut W, msg: &T) -> Result<(), CodecError>
    where
        W: AsyncWrite + Unpin,
        T: Serialize,
    {
        let frame = Self::encode(msg)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ControlRequest, ControlResponse, Reply};
    use crate::HostPort;

    #[test]
    fn test_encode_prefixes_length() {
        let encoded = ControlCodec::encode(&ControlRequest::GetStatus).unwrap();
        let payload = bincode::serialize(&ControlRequest::GetStatus).unwrap();

        assert_eq!(&encoded[..4], &(payload.len() as u32).to_be_bytes());
        assert_eq!(&encoded[4..], payload.as_slice());
    }

    #[tokio::test]
    async fn test_read_oversized_length() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

        let result: Result<Option<ControlRequest>, _> =
            ControlCodec::read_message(&mut server).await;
        assert!(matches!(result, Err(CodecError::MessageTooLarge(_))));
    }

    #[tokio::test]
    async fn test_read_unknown_variant() {
        // Variant index 42 does not exist
        let payload = bincode::serialize(&42u32).unwrap();
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&(payload.len() as u32).to_be_bytes())
            .await
            .unwrap();
        client.write_all(&payload).await.unwrap();

        let result: Result<Option<ControlRequest>, _> =
            ControlCodec::read_message(&mut server).await;
        assert!(matches!(result, Err(CodecError::SerializationError(_))));
    }

    #[tokio::test]
    async fn test_reads_frames_back_to_back() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let first = ControlResponse::Processed(Reply::LocalBind(HostPort::new("127.0.0.1", 10025)));
        let second = ControlResponse::bad_request("invalid message");
        ControlCodec::write_message(&mut client, &first).await.unwrap();
        ControlCodec::write_message(&mut client, &second).await.unwrap();

        let a: Option<ControlResponse> = ControlCodec::read_message(&mut server).await.unwrap();
        let b: Option<ControlResponse> = ControlCodec::read_message(&mut server).await.unwrap();
        assert_eq!(a, Some(first));
        assert_eq!(b, Some(second));
    }

    #[tokio::test]
    async fn test_stream_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let request = ControlRequest::EnsureTunnel {
            public_address: "bastion.example.com".to_string(),
            username: "ubuntu".to_string(),
            private_key: "/keys/id_rsa".to_string(),
            remote_bind: "10.0.0.5:22".to_string(),
            local_bind: "127.0.0.1:10022".to_string(),
        };
        ControlCodec::write_message(&mut client, &request)
            .await
            .unwrap();

        let received: Option<ControlRequest> =
            ControlCodec::read_message(&mut server).await.unwrap();
        assert_eq!(received, Some(request));
    }

    #[tokio::test]
    async fn test_read_clean_eof() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let received: Option<ControlRequest> =
            ControlCodec::read_message(&mut server).await.unwrap();
        assert_eq!(received, None);
    }

    #[tokio::test]
    async fn test_read_truncated_frame() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0, 0, 0, 10, 1, 2]).await.unwrap();
        drop(client);

        let result: Result<Option<ControlRequest>, _> =
            ControlCodec::read_message(&mut server).await;
        assert!(result.unwrap_err().is_eof());
    }
}
