//! Event stream parse errors

use thiserror::Error;

/// Parse error types
#[derive(Debug, Error)]
pub enum ParseError {
    /// Insufficient data, need more bytes
    #[error("insufficient data: need {needed} bytes, have {available}")]
    Incomplete { needed: usize, available: usize },

    #[error("prelude CRC mismatch: expected 0x{expected:08x}, actual 0x{actual:08x}")]
    PreludeCrcMismatch { expected: u32, actual: u32 },

    #[error("message CRC mismatch: expected 0x{expected:08x}, actual 0x{actual:08x}")]
    MessageCrcMismatch { expected: u32, actual: u32 },

    #[error("invalid header value type: {0}")]
    InvalidHeaderType(u8),

    #[error("header parsing failed: {0}")]
    HeaderParseFailed(String),

    /// total_length < 16 or headers_length > total_length
    #[error("malformed prelude: total={total}, headers={headers}")]
    MalformedPrelude { total: u32, headers: u32 },

    #[error("message exceeds limit: {length} bytes (max {max})")]
    MessageTooLarge { length: u32, max: u32 },

    #[error("invalid message type: {0}")]
    InvalidMessageType(String),

    #[error("payload deserialization failed: {0}")]
    PayloadDeserialize(#[from] serde_json::Error),

    #[error("too many consecutive errors ({count}), decoder stopped: {last_error}")]
    TooManyErrors { count: usize, last_error: String },

    #[error("buffer overflow: {size} bytes (max {max})")]
    BufferOverflow { size: usize, max: usize },
}

/// Parse result type
pub type ParseResult<T> = Result<T, ParseError>;
