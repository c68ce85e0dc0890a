//! Incremental Frame Parser
//!
//! TCP delivers a byte stream, not messages. The reader task appends whatever
//! arrives to a buffer and asks the parser for complete frames.
//!
//! ## How the Parser Works
//!
//! The parser reads from a buffer and returns either:
//! - `Ok(Some((frame, consumed)))` - A complete frame, `consumed` bytes were used
//! - `Ok(None)` - Need more data, the frame is incomplete
//! - `Err(ParseError)` - The stream is corrupt
//!
//! The caller then:
//! 1. Appends incoming network data to a buffer
//! 2. Calls `parse()` until it returns `Ok(None)`
//! 3. Advances the buffer by `consumed` bytes after each frame
//! 4. Tears the connection down on error, since framing cannot resynchronize

use crate::protocol::types::{Frame, HEADER_LEN};
use bytes::{Buf, Bytes};
use thiserror::Error;

/// Errors that can occur while parsing frames and payloads.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// The announced payload exceeds the allowed size
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// The payload is not the JSON we expect
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Response type code not known to this driver
    #[error("unknown response type: {0}")]
    UnknownResponseType(i64),

    /// A required field is absent from the payload
    #[error("missing field `{0}`")]
    MissingField(&'static str),
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum payload size for a single frame (64 MB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Parser for length-prefixed frames.
///
/// # Example
///
/// ```
/// use docpool::protocol::{Frame, FrameParser};
///
/// let bytes = Frame::new(1, "[1]").serialize();
/// let (frame, consumed) = FrameParser::new().parse(&bytes).unwrap().unwrap();
/// assert_eq!(frame.token, 1);
/// assert_eq!(consumed, bytes.len());
/// ```
#[derive(Debug, Clone)]
pub struct FrameParser {
    max_frame_size: usize,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    /// Creates a parser accepting payloads up to [`MAX_FRAME_SIZE`].
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Creates a parser with a custom payload limit.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Attempts to parse one frame from the start of `buf`.
    pub fn parse(&self, buf: &[u8]) -> ParseResult<Option<(Frame, usize)>> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = &buf[..HEADER_LEN];
        let token = header.get_u64_le();
        let length = header.get_u32_le() as usize;

        if length > self.max_frame_size {
            return Err(ParseError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        let total = HEADER_LEN + length;
        if buf.len() < total {
            return Ok(None);
        }

        let payload = Bytes::copy_from_slice(&buf[HEADER_LEN..total]);
        Ok(Some((Frame { token, payload }, total)))
    }
}

/// Parses a single frame with the default limit.
pub fn parse_frame(buf: &[u8]) -> ParseResult<Option<(Frame, usize)>> {
    FrameParser::new().parse(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_parse_complete_frame() {
        let bytes = Frame::new(42, r#"{"t":1,"r":[1]}"#).serialize();
        let (frame, consumed) = parse_frame(&bytes).unwrap().unwrap();
        assert_eq!(frame.token, 42);
        assert_eq!(frame.payload, Bytes::from(r#"{"t":1,"r":[1]}"#));
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn test_parse_incomplete_header() {
        let bytes = Frame::new(1, "[1]").serialize();
        assert!(parse_frame(&bytes[..HEADER_LEN - 1]).unwrap().is_none());
    }

    #[test]
    fn test_parse_incomplete_payload() {
        let bytes = Frame::new(1, "[1,2,3]").serialize();
        assert!(parse_frame(&bytes[..bytes.len() - 1]).unwrap().is_none());
    }

    #[test]
    fn test_parse_empty_payload() {
        let bytes = Frame::new(5, Bytes::new()).serialize();
        let (frame, consumed) = parse_frame(&bytes).unwrap().unwrap();
        assert_eq!(frame.token, 5);
        assert!(frame.payload.is_empty());
        assert_eq!(consumed, HEADER_LEN);
    }

    #[test]
    fn test_parse_pipelined_frames() {
        let mut buf = BytesMut::new();
        Frame::new(1, "[1]").serialize_into(&mut buf);
        Frame::new(2, "[2]").serialize_into(&mut buf);

        let parser = FrameParser::new();
        let (first, consumed) = parser.parse(&buf).unwrap().unwrap();
        assert_eq!(first.token, 1);
        let _ = buf.split_to(consumed);

        let (second, consumed) = parser.parse(&buf).unwrap().unwrap();
        assert_eq!(second.token, 2);
        let _ = buf.split_to(consumed);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_parse_rejects_oversized_frame() {
        let parser = FrameParser::with_max_frame_size(4);
        let bytes = Frame::new(1, "12345").serialize();
        assert_eq!(
            parser.parse(&bytes),
            Err(ParseError::FrameTooLarge { size: 5, max: 4 })
        );
    }

    #[test]
    fn test_oversized_header_rejected_before_payload_arrives() {
        let parser = FrameParser::with_max_frame_size(16);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&9u64.to_le_bytes());
        buf.extend_from_slice(&1024u32.to_le_bytes());
        assert!(matches!(
            parser.parse(&buf),
            Err(ParseError::FrameTooLarge { size: 1024, .. })
        ));
    }

    #[test]
    fn test_binary_safe_payload() {
        let bytes = Frame::new(3, &b"a\x00\r\nb"[..]).serialize();
        let (frame, _) = parse_frame(&bytes).unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"a\x00\r\nb");
    }
}
