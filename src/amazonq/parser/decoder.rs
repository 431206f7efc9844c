//! Streaming event decoder
//!
//! Accumulates network chunks and yields complete frames. Corruption is
//! survivable: a bad prelude advances one byte and rescans for the next
//! frame boundary; a bad body skips the whole frame when its length is
//! trustworthy. Too many consecutive failures stop the decoder.

use super::error::{ParseError, ParseResult};
use super::frame::{Frame, PRELUDE_SIZE, parse_frame};
use bytes::{Buf, BytesMut};

/// Default maximum buffer size (16 MB)
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Default maximum consecutive errors
pub const DEFAULT_MAX_ERRORS: usize = 5;

const DEFAULT_BUFFER_CAPACITY: usize = 8192;

/// Decoder state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    /// Ready to receive data
    Ready,
    /// Skipping corrupted data, waiting for more input
    Recovering,
    /// Terminal: too many consecutive errors
    Stopped,
}

/// Streaming event decoder for AWS Event Stream frames
pub struct EventStreamDecoder {
    buffer: BytesMut,
    state: DecoderState,
    frames_decoded: usize,
    error_count: usize,
    max_errors: usize,
    max_buffer_size: usize,
    bytes_skipped: usize,
}

impl Default for EventStreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::with_config(DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_ERRORS, DEFAULT_MAX_BUFFER_SIZE)
    }

    pub fn with_config(capacity: usize, max_errors: usize, max_buffer_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            state: DecoderState::Ready,
            frames_decoded: 0,
            error_count: 0,
            max_errors,
            max_buffer_size,
            bytes_skipped: 0,
        }
    }

    /// Feed a network chunk into the buffer.
    pub fn feed(&mut self, data: &[u8]) -> ParseResult<()> {
        let new_size = self.buffer.len() + data.len();
        if new_size > self.max_buffer_size {
            return Err(ParseError::BufferOverflow {
                size: new_size,
                max: self.max_buffer_size,
            });
        }

        self.buffer.extend_from_slice(data);
        if self.state == DecoderState::Recovering {
            self.state = DecoderState::Ready;
        }
        Ok(())
    }

    /// Try to decode the next frame.
    ///
    /// `Ok(Some(frame))` on success, `Ok(None)` when more data is needed.
    pub fn decode(&mut self) -> ParseResult<Option<Frame>> {
        if self.state == DecoderState::Stopped {
            return Err(ParseError::TooManyErrors {
                count: self.error_count,
                last_error: "decoder stopped".to_string(),
            });
        }
        if self.buffer.is_empty() {
            return Ok(None);
        }

        match parse_frame(&self.buffer) {
            Ok(Some((frame, consumed))) => {
                self.buffer.advance(consumed);
                self.frames_decoded += 1;
                self.error_count = 0;
                self.state = DecoderState::Ready;
                Ok(Some(frame))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.error_count += 1;
                if self.error_count >= self.max_errors {
                    self.state = DecoderState::Stopped;
                    tracing::error!(
                        "Decoder stopped after {} consecutive errors, last: {}",
                        self.error_count,
                        e
                    );
                    return Err(ParseError::TooManyErrors {
                        count: self.error_count,
                        last_error: e.to_string(),
                    });
                }
                self.try_recover(&e);
                self.state = DecoderState::Recovering;
                Err(e)
            }
        }
    }

    /// Drain every frame currently decodable from the buffer.
    ///
    /// Parse errors are recovered from internally; only a stopped decoder
    /// propagates the error.
    pub fn drain(&mut self) -> ParseResult<Vec<Frame>> {
        let mut frames = Vec::new();
        loop {
            match self.decode() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(ParseError::TooManyErrors { count, last_error }) => {
                    return Err(ParseError::TooManyErrors { count, last_error });
                }
                Err(e) => {
                    tracing::warn!("Skipping corrupted event stream data: {}", e);
                    if self.state == DecoderState::Recovering {
                        // Recovery consumed bytes; rescan from the new boundary
                        self.state = DecoderState::Ready;
                    }
                }
            }
        }
        Ok(frames)
    }

    /// Recovery strategy by error phase:
    /// prelude errors scan byte-by-byte for the next boundary; body errors
    /// skip the whole frame when total_length is plausible.
    fn try_recover(&mut self, error: &ParseError) {
        if self.buffer.is_empty() {
            return;
        }

        match error {
            ParseError::MessageCrcMismatch { .. } | ParseError::HeaderParseFailed(_) => {
                if self.buffer.len() >= PRELUDE_SIZE {
                    let total_length = u32::from_be_bytes([
                        self.buffer[0],
                        self.buffer[1],
                        self.buffer[2],
                        self.buffer[3],
                    ]) as usize;
                    if total_length >= 16 && total_length <= self.buffer.len() {
                        tracing::warn!("Skipping corrupted frame ({} bytes)", total_length);
                        self.buffer.advance(total_length);
                        self.bytes_skipped += total_length;
                        return;
                    }
                }
                self.skip_one_byte();
            }
            _ => self.skip_one_byte(),
        }
    }

    fn skip_one_byte(&mut self) {
        let skipped = self.buffer[0];
        self.buffer.advance(1);
        self.bytes_skipped += 1;
        tracing::warn!(
            "Recovery: skipped byte 0x{:02x} ({} total skipped)",
            skipped,
            self.bytes_skipped
        );
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn frames_decoded(&self) -> usize {
        self.frames_decoded
    }

    pub fn bytes_skipped(&self) -> usize {
        self.bytes_skipped
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amazonq::parser::frame::encode_frame;
    use crate::amazonq::parser::header::encode_string_header;

    fn event_frame(event_type: &str, payload: &str) -> Vec<u8> {
        let mut headers = encode_string_header(":message-type", "event");
        headers.extend(encode_string_header(":event-type", event_type));
        encode_frame(&headers, payload.as_bytes())
    }

    #[test]
    fn test_decoder_empty() {
        let mut decoder = EventStreamDecoder::new();
        assert!(matches!(decoder.decode(), Ok(None)));
        assert_eq!(decoder.state(), DecoderState::Ready);
    }

    #[test]
    fn test_decoder_single_frame() {
        let mut decoder = EventStreamDecoder::new();
        decoder
            .feed(&event_frame("assistantResponseEvent", r#"{"content":"hi"}"#))
            .unwrap();
        let frame = decoder.decode().unwrap().unwrap();
        assert_eq!(frame.event_type(), Some("assistantResponseEvent"));
        assert_eq!(decoder.frames_decoded(), 1);
        assert_eq!(decoder.buffer_len(), 0);
    }

    #[test]
    fn test_decoder_split_across_feeds() {
        let mut decoder = EventStreamDecoder::new();
        let frame = event_frame("assistantResponseEvent", r#"{"content":"split"}"#);
        let (a, b) = frame.split_at(frame.len() / 2);

        decoder.feed(a).unwrap();
        assert!(matches!(decoder.decode(), Ok(None)));
        decoder.feed(b).unwrap();
        assert!(decoder.decode().unwrap().is_some());
    }

    #[test]
    fn test_decoder_multiple_frames_one_chunk() {
        let mut decoder = EventStreamDecoder::new();
        let mut data = event_frame("assistantResponseEvent", r#"{"content":"a"}"#);
        data.extend(event_frame("assistantResponseEnd", "{}"));
        decoder.feed(&data).unwrap();

        let frames = decoder.drain().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].event_type(), Some("assistantResponseEnd"));
    }

    #[test]
    fn test_decoder_recovers_from_garbage_prefix() {
        let mut decoder = EventStreamDecoder::with_config(1024, 64, DEFAULT_MAX_BUFFER_SIZE);
        // 0xFF prefixes parse as an oversized total_length, forcing resync
        let mut data = vec![0xFF, 0xFF, 0xFF];
        data.extend(event_frame("assistantResponseEvent", r#"{"content":"ok"}"#));
        decoder.feed(&data).unwrap();

        let frames = decoder.drain().unwrap();
        assert_eq!(frames.len(), 1);
        assert!(decoder.bytes_skipped() > 0);
    }

    #[test]
    fn test_decoder_buffer_overflow() {
        let mut decoder = EventStreamDecoder::with_config(16, 5, 100);
        assert!(matches!(
            decoder.feed(&[0u8; 101]),
            Err(ParseError::BufferOverflow { .. })
        ));
    }

    #[test]
    fn test_decoder_stops_after_max_errors() {
        let mut decoder = EventStreamDecoder::with_config(1024, 3, 4096);
        // A run of zero preludes produces MalformedPrelude on every scan
        decoder.feed(&[0u8; 64]).unwrap();
        let result = decoder.drain();
        assert!(matches!(result, Err(ParseError::TooManyErrors { .. })));
        assert_eq!(decoder.state(), DecoderState::Stopped);
    }
}
