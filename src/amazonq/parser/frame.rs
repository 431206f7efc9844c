//! AWS Event Stream message frames
//!
//! ```text
//! | total len u32 | headers len u32 | prelude crc u32 | headers | payload | message crc u32 |
//! ```
//!
//! All integers big-endian. The prelude CRC covers the first 8 bytes; the
//! message CRC covers everything before itself.

use super::crc::crc32;
use super::error::{ParseError, ParseResult};
use super::header::{Headers, parse_headers};

/// Prelude fixed size (12 bytes)
pub const PRELUDE_SIZE: usize = 12;

/// Minimum message size (prelude + message CRC)
pub const MIN_MESSAGE_SIZE: u32 = 16;

/// Maximum accepted message size (16 MB)
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Parsed message frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub headers: Headers,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn message_type(&self) -> Option<&str> {
        self.headers.message_type()
    }

    pub fn event_type(&self) -> Option<&str> {
        self.headers.event_type()
    }

    /// Decode payload as JSON
    pub fn payload_as_json<T: serde::de::DeserializeOwned>(&self) -> ParseResult<T> {
        serde_json::from_slice(&self.payload).map_err(ParseError::PayloadDeserialize)
    }

    pub fn payload_as_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).to_string()
    }
}

/// Try to parse one complete frame from the buffer.
///
/// Stateless pure function; buffer management belongs to [`super::EventStreamDecoder`].
///
/// Returns `Ok(Some((frame, consumed)))` on success, `Ok(None)` when more
/// data is needed, `Err` on a malformed or corrupted frame.
pub fn parse_frame(buffer: &[u8]) -> ParseResult<Option<(Frame, usize)>> {
    if buffer.len() < PRELUDE_SIZE {
        return Ok(None);
    }

    let total_length = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
    let header_length = u32::from_be_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]);
    let prelude_crc = u32::from_be_bytes([buffer[8], buffer[9], buffer[10], buffer[11]]);

    if total_length < MIN_MESSAGE_SIZE || header_length > total_length {
        return Err(ParseError::MalformedPrelude {
            total: total_length,
            headers: header_length,
        });
    }
    if total_length > MAX_MESSAGE_SIZE {
        return Err(ParseError::MessageTooLarge {
            length: total_length,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let total_length = total_length as usize;
    let header_length = header_length as usize;

    if buffer.len() < total_length {
        return Ok(None);
    }

    let actual_prelude_crc = crc32(&buffer[..8]);
    if actual_prelude_crc != prelude_crc {
        return Err(ParseError::PreludeCrcMismatch {
            expected: prelude_crc,
            actual: actual_prelude_crc,
        });
    }

    let message_crc = u32::from_be_bytes([
        buffer[total_length - 4],
        buffer[total_length - 3],
        buffer[total_length - 2],
        buffer[total_length - 1],
    ]);
    let actual_message_crc = crc32(&buffer[..total_length - 4]);
    if actual_message_crc != message_crc {
        return Err(ParseError::MessageCrcMismatch {
            expected: message_crc,
            actual: actual_message_crc,
        });
    }

    let headers_end = PRELUDE_SIZE + header_length;
    if headers_end > total_length - 4 {
        return Err(ParseError::HeaderParseFailed(
            "header length exceeds message boundary".to_string(),
        ));
    }

    let headers = parse_headers(&buffer[PRELUDE_SIZE..headers_end])?;
    let payload = buffer[headers_end..total_length - 4].to_vec();

    Ok(Some((Frame { headers, payload }, total_length)))
}

/// Encode a frame (used by decoder tests and stream fixtures).
pub fn encode_frame(headers_raw: &[u8], payload: &[u8]) -> Vec<u8> {
    let total = (PRELUDE_SIZE + headers_raw.len() + payload.len() + 4) as u32;
    let mut out = Vec::with_capacity(total as usize);
    out.extend_from_slice(&total.to_be_bytes());
    out.extend_from_slice(&(headers_raw.len() as u32).to_be_bytes());
    let prelude_crc = crc32(&out[..8]);
    out.extend_from_slice(&prelude_crc.to_be_bytes());
    out.extend_from_slice(headers_raw);
    out.extend_from_slice(payload);
    let message_crc = crc32(&out);
    out.extend_from_slice(&message_crc.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amazonq::parser::header::encode_string_header;

    #[test]
    fn test_frame_insufficient_data() {
        let buffer = [0u8; 10];
        assert!(matches!(parse_frame(&buffer), Ok(None)));
    }

    #[test]
    fn test_frame_malformed_prelude() {
        let mut buffer = vec![0u8; 16];
        buffer[0..4].copy_from_slice(&10u32.to_be_bytes()); // total < 16
        assert!(matches!(
            parse_frame(&buffer),
            Err(ParseError::MalformedPrelude { .. })
        ));
    }

    #[test]
    fn test_frame_round_trip() {
        let headers = encode_string_header(":event-type", "assistantResponseEvent");
        let payload = br#"{"content":"hi"}"#;
        let encoded = encode_frame(&headers, payload);

        let (frame, consumed) = parse_frame(&encoded).unwrap().unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(frame.event_type(), Some("assistantResponseEvent"));
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn test_frame_corrupted_message_crc() {
        let headers = encode_string_header(":event-type", "assistantResponseEvent");
        let mut encoded = encode_frame(&headers, b"{}");
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        assert!(matches!(
            parse_frame(&encoded),
            Err(ParseError::MessageCrcMismatch { .. })
        ));
    }
}
