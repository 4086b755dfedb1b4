//! Transport framing shared by both channels.
//!
//! Provides endpoint parsing, a length-prefixed frame codec and a
//! bounded-time TCP connect.

use std::fmt;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::error::ConnectError;

/// Default maximum frame size (16 MB).
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

/// A `tcp://<host>:<port>` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint from host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `tcp://<host>:<port>`.
    pub fn parse(endpoint: &str) -> Result<Self, ConnectError> {
        let invalid = || ConnectError::InvalidEndpoint(endpoint.to_string());

        let rest = endpoint.strip_prefix("tcp://").ok_or_else(invalid)?;
        let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "tcp://[{}]:{}", self.host, self.port)
        } else {
            write!(f, "tcp://{}:{}", self.host, self.port)
        }
    }
}

/// Framed stream carrying one message per frame.
pub type FramedStream = Framed<TcpStream, FrameCodec>;

/// Connect to an endpoint, giving up after `timeout`.
pub async fn connect_stream(endpoint: &Endpoint, timeout: Duration) -> Result<FramedStream, ConnectError> {
    let connect = TcpStream::connect((endpoint.host.as_str(), endpoint.port));
    let stream = tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| ConnectError::Timeout(endpoint.to_string()))?
        .map_err(|source| ConnectError::Io {
            endpoint: endpoint.to_string(),
            source,
        })?;
    stream.set_nodelay(true).map_err(|source| ConnectError::Io {
        endpoint: endpoint.to_string(),
        source,
    })?;

    Ok(Framed::new(stream, FrameCodec::new()))
}

/// Length-prefixed frame codec.
///
/// Frames are laid out as:
/// - 4 bytes: payload length (big-endian u32)
/// - N bytes: payload (UTF-8 JSON)
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_length: usize,
}

impl FrameCodec {
    /// Create a new codec with default max length (16 MB).
    pub fn new() -> Self {
        Self {
            max_length: DEFAULT_MAX_FRAME,
        }
    }

    /// Create a new codec with custom max length.
    pub fn with_max_length(max_length: usize) -> Self {
        Self { max_length }
    }

    /// Get the max frame length.
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    fn too_large(&self, length: usize) -> std::io::Error {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Frame too large: {} > {}", length, self.max_length),
        )
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least 4 bytes for the length prefix
        if src.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > self.max_length {
            return Err(self.too_large(length));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = item.len();
        if length > self.max_length {
            return Err(self.too_large(length));
        }

        dst.reserve(4 + length);
        dst.put_u32(length as u32);
        dst.put_slice(&item);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse() {
        let ep = Endpoint::parse("tcp://localhost:5555").unwrap();
        assert_eq!(ep.host, "localhost");
        assert_eq!(ep.port, 5555);
        assert_eq!(ep.to_string(), "tcp://localhost:5555");
    }

    #[test]
    fn test_endpoint_parse_ipv6() {
        let ep = Endpoint::parse("tcp://[::1]:5556").unwrap();
        assert_eq!(ep.host, "::1");
        assert_eq!(ep.to_string(), "tcp://[::1]:5556");
    }

    #[test]
    fn test_endpoint_parse_rejects_bad_input() {
        for bad in ["localhost:5555", "udp://host:1", "tcp://host", "tcp://:5555", "tcp://host:99999"] {
            let err = Endpoint::parse(bad).unwrap_err();
            assert!(matches!(err, ConnectError::InvalidEndpoint(ref e) if e == bad));
        }
    }

    #[test]
    fn test_codec_with_max_length() {
        let codec = FrameCodec::with_max_length(1024);
        assert_eq!(codec.max_length(), 1024);
        assert_eq!(FrameCodec::default().max_length(), DEFAULT_MAX_FRAME);
    }

    #[test]
    fn test_encode_decode() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(br#"{"status":"ok"}"#), &mut buf).unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 15]);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], br#"{"status":"ok"}"#);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_prefix() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_incomplete_body() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(100);
        buf.put_slice(&[0u8; 10]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 14);
    }

    #[test]
    fn test_frame_too_large_decode() {
        let mut codec = FrameCodec::with_max_length(10);
        let mut buf = BytesMut::new();
        buf.put_u32(100);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_frame_too_large_encode() {
        let mut codec = FrameCodec::with_max_length(10);
        let mut buf = BytesMut::new();
        let result = codec.encode(Bytes::from_static(b"this payload exceeds ten bytes"), &mut buf);
        assert!(result.is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_multiple_frames() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"first"), &mut buf).unwrap();
        codec.encode(Bytes::from_static(b"second"), &mut buf).unwrap();

        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"first");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"second");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let ep = Endpoint::new("127.0.0.1", port);
        let err = connect_stream(&ep, Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, ConnectError::Io { .. }));
    }
}
