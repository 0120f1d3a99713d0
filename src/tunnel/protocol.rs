//! Wire protocol for the encrypted tunnel.
//!
//! Two layers: an unencrypted handshake exchange (four raw 32-byte
//! WebSocket binary messages) that establishes the per-tunnel send/recv
//! keys, and an AEAD-sealed multiplexing frame that carries everything
//! after that.
//!
//! Mux frame plaintext layout:
//! ```text
//! | stream_id (4B, big-endian) | payload (NB) |
//! ```
//! The only control message is the client's `CONNECT <id> host:port` text
//! payload; the server's reply reuses the same layout with a UTF-8
//! `OK`/`ERR ...` payload. Everything else is opaque stream data. The
//! leading 4-byte stream id on a CONNECT frame matches the id repeated in
//! the text body, so a remote implementation can parse either field.

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const FRAME_HEADER_LEN: usize = 4;

/// Length of each of the four handshake tokens (`client_pub`, `server_pub`,
/// and the two HMAC tags), sent as individual binary WebSocket messages
/// before any AEAD framing exists.
pub const HANDSHAKE_TOKEN_LEN: usize = 32;

/// A single mux-layer frame: a destination stream id plus an opaque
/// payload. Carries both the `CONNECT`/`OK`/`ERR` control text and raw
/// stream data — the multiplexer decides which based on the stream's
/// pending/open state, not anything in the frame itself.
#[derive(Debug, Clone)]
pub struct MuxFrame {
    pub stream_id: u32,
    pub payload: Bytes,
}

impl MuxFrame {
    pub fn new(stream_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            stream_id,
            payload: payload.into(),
        }
    }

    /// Build the `CONNECT <id> host:port` control frame that opens a new
    /// stream. `host` is carried as plain text; the remote resolves it.
    pub fn connect(stream_id: u32, host: &str, port: u16) -> Self {
        let text = format!("CONNECT {stream_id} {host}:{port}");
        Self::new(stream_id, Bytes::from(text.into_bytes()))
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        buf.put_u32(self.stream_id);
        buf.put(self.payload.clone());
        buf.freeze()
    }

    pub fn decode(mut data: Bytes) -> Result<Self, ProtocolError> {
        if data.len() < FRAME_HEADER_LEN {
            return Err(ProtocolError::TooShort {
                expected: FRAME_HEADER_LEN,
                actual: data.len(),
            });
        }
        let stream_id = data.get_u32();
        Ok(Self {
            stream_id,
            payload: data,
        })
    }
}

/// Outcome of interpreting the first payload delivered on a pending
/// (just-opened) stream, per spec.md section 4.3's `open_stream` protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamReply {
    Ok,
    Err(String),
    Invalid,
}

/// Classify a pending stream's first inbound payload as `OK`, `ERR
/// <reason>`, or neither.
pub fn parse_stream_reply(payload: &[u8]) -> StreamReply {
    let text = String::from_utf8_lossy(payload);
    if let Some(rest) = text.strip_prefix("OK") {
        let _ = rest;
        StreamReply::Ok
    } else if let Some(reason) = text.strip_prefix("ERR") {
        StreamReply::Err(reason.trim_start().to_string())
    } else {
        StreamReply::Invalid
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mux_frame_roundtrips() {
        let frame = MuxFrame::new(7, Bytes::from_static(b"hello"));
        let encoded = frame.encode();
        let decoded = MuxFrame::decode(encoded).unwrap();
        assert_eq!(decoded.stream_id, 7);
        assert_eq!(&decoded.payload[..], b"hello");
    }

    #[test]
    fn decode_rejects_short_frame() {
        let err = MuxFrame::decode(Bytes::from_static(b"abc")).unwrap_err();
        assert!(matches!(err, ProtocolError::TooShort { .. }));
    }

    #[test]
    fn connect_frame_repeats_id_in_header_and_body() {
        let frame = MuxFrame::connect(42, "example.com", 443);
        assert_eq!(frame.stream_id, 42);
        assert_eq!(&frame.payload[..], b"CONNECT 42 example.com:443");
    }

    #[test]
    fn parse_stream_reply_recognizes_ok() {
        assert_eq!(parse_stream_reply(b"OK"), StreamReply::Ok);
    }

    #[test]
    fn parse_stream_reply_recognizes_err_with_reason() {
        assert_eq!(
            parse_stream_reply(b"ERR connection refused"),
            StreamReply::Err("connection refused".to_string())
        );
    }

    #[test]
    fn parse_stream_reply_rejects_garbage() {
        assert_eq!(parse_stream_reply(b"nonsense"), StreamReply::Invalid);
    }
}
