//! Codec for framing envelopes on byte streams
//!
//! Format: [length: u32 little-endian][payload: bincode serialized envelope]

use crate::envelope::Envelope;
use crate::{LENGTH_PREFIX_SIZE, MAX_ENVELOPE_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Envelope too large: {0} bytes")]
    TooLarge(usize),

    #[error("Truncated envelope: expected {expected} bytes, stream ended after {received}")]
    Truncated { expected: usize, received: usize },

    #[error("Unexpected envelope kind: expected '{expected}', got '{received}'")]
    UnexpectedKind { expected: String, received: String },
}

impl CodecError {
    /// Whether this error came from the underlying stream rather than the frame contents
    pub fn is_transport(&self) -> bool {
        matches!(self, CodecError::Io(_))
    }
}

/// Length-prefixed envelope codec
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeCodec {
    max_size: usize,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self {
            max_size: MAX_ENVELOPE_SIZE,
        }
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self { max_size }
    }

    /// Encode one envelope into a standalone frame
    pub fn encode_frame(envelope: &Envelope) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        Self::new().encode(envelope.clone(), &mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one envelope from the front of `buf`
    ///
    /// Returns Ok(None) if more data is needed.
    pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Envelope>, CodecError> {
        Self::new().decode(buf)
    }

    fn declared_length(src: &[u8]) -> usize {
        let mut length_bytes = [0u8; LENGTH_PREFIX_SIZE];
        length_bytes.copy_from_slice(&src[..LENGTH_PREFIX_SIZE]);
        u32::from_le_bytes(length_bytes) as usize
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, CodecError> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let length = Self::declared_length(src);
        if length > self.max_size {
            return Err(CodecError::TooLarge(length));
        }

        let frame_len = LENGTH_PREFIX_SIZE + length;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        let body = src.split_to(length);
        let envelope = bincode::deserialize(&body)?;

        Ok(Some(envelope))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, CodecError> {
        if let Some(envelope) = self.decode(src)? {
            return Ok(Some(envelope));
        }

        if src.is_empty() {
            return Ok(None);
        }

        if src.len() < LENGTH_PREFIX_SIZE {
            return Err(CodecError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended inside length prefix",
            )));
        }

        // Never parse a partial body
        Err(CodecError::Truncated {
            expected: Self::declared_length(src),
            received: src.len() - LENGTH_PREFIX_SIZE,
        })
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), CodecError> {
        let payload = bincode::serialize(&item)?;

        if payload.len() > self.max_size {
            return Err(CodecError::TooLarge(payload.len()));
        }

        dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
        dst.put_u32_le(payload.len() as u32);
        dst.extend_from_slice(&payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::{FramedRead, FramedWrite};

    fn encode(env: &Envelope) -> BytesMut {
        let mut buf = BytesMut::new();
        EnvelopeCodec::new().encode(env.clone(), &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_encode_decode() {
        let env = Envelope::new("ping", vec![1, 2, 3]).with_id("req-1");

        let mut buf = encode(&env);
        let decoded = EnvelopeCodec::new().decode(&mut buf).unwrap();

        assert_eq!(decoded, Some(env));
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_frame_helpers() {
        let env = Envelope::new("ps", vec![4, 5]).with_id("f");
        let frame = EnvelopeCodec::encode_frame(&env).unwrap();

        let mut buf = BytesMut::from(&frame[..frame.len() - 1]);
        assert_eq!(EnvelopeCodec::decode_frame(&mut buf).unwrap(), None);

        buf.extend_from_slice(&frame[frame.len() - 1..]);
        assert_eq!(EnvelopeCodec::decode_frame(&mut buf).unwrap(), Some(env));
    }

    #[test]
    fn test_length_prefix_is_little_endian() {
        let env = Envelope::new("ping", Vec::new());
        let buf = encode(&env);

        let declared = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(declared, buf.len() - LENGTH_PREFIX_SIZE);
    }

    #[test]
    fn test_empty_data_and_error_field() {
        let mut env = Envelope::new("ls", Vec::new()).with_id("x");
        env.error = Some("no such file".to_string());

        let mut buf = encode(&env);
        let decoded = EnvelopeCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_decode_incomplete() {
        let env = Envelope::new("pwd", vec![9; 32]);
        let encoded = encode(&env);
        let mut codec = EnvelopeCodec::new();

        // Only the length header
        let mut buf = BytesMut::from(&encoded[..4]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        // Rest of the message
        buf.extend_from_slice(&encoded[4..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(env));
    }

    #[test]
    fn test_decode_multiple() {
        let first = Envelope::new("ping", vec![1]).with_id("a");
        let second = Envelope::new("ping", vec![2]).with_id("b");

        let mut buf = encode(&first);
        buf.extend_from_slice(&encode(&second));

        let mut codec = EnvelopeCodec::new();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(first));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(second));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_declared_length_too_large() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(1024);
        buf.extend_from_slice(&[0u8; 16]);

        let err = EnvelopeCodec::with_max_size(512).decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::TooLarge(1024)));
        assert!(!err.is_transport());
    }

    #[test]
    fn test_decode_eof_truncated_body() {
        let env = Envelope::new("download", vec![7; 100]);
        let encoded = encode(&env);

        let mut buf = BytesMut::from(&encoded[..encoded.len() - 10]);
        let err = EnvelopeCodec::new().decode_eof(&mut buf).unwrap_err();

        match err {
            CodecError::Truncated { expected, received } => {
                assert_eq!(expected, encoded.len() - 4);
                assert_eq!(received, expected - 10);
            }
            other => panic!("Expected Truncated, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_eof_inside_prefix_is_transport_error() {
        let mut buf = BytesMut::from(&[1u8, 0][..]);
        let err = EnvelopeCodec::new().decode_eof(&mut buf).unwrap_err();
        assert!(err.is_transport());
    }

    #[test]
    fn test_decode_eof_clean_boundary() {
        let mut buf = BytesMut::new();
        assert_eq!(EnvelopeCodec::new().decode_eof(&mut buf).unwrap(), None);
    }

    #[tokio::test]
    async fn test_framed_roundtrip_over_small_chunks() {
        // An 8 byte pipe forces both sides through many partial reads and writes
        let (client, server) = tokio::io::duplex(8);
        let mut writer = FramedWrite::new(client, EnvelopeCodec::new());
        let mut reader = FramedRead::new(server, EnvelopeCodec::new());

        let big = Envelope::new("upload", (0..5000u32).map(|i| i as u8).collect()).with_id("u");
        let empty = Envelope::new("pwd", Vec::new()).with_id("p");

        let expected = vec![big.clone(), empty.clone()];
        let send = tokio::spawn(async move {
            writer.send(big).await.unwrap();
            writer.send(empty).await.unwrap();
        });

        let mut received = Vec::new();
        for _ in 0..2 {
            received.push(reader.next().await.unwrap().unwrap());
        }
        send.await.unwrap();

        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_framed_read_truncated_stream() {
        let env = Envelope::new("ls", vec![5; 64]).with_id("t");
        let encoded = encode(&env);

        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(&encoded[..encoded.len() / 2]).await.unwrap();
        drop(client);

        let mut reader = FramedRead::new(server, EnvelopeCodec::new());
        let result = reader.next().await.unwrap();
        assert!(matches!(result, Err(CodecError::Truncated { .. })));
    }
}
