//! AWS Event Stream header parsing
//!
//! Headers are a packed sequence of `name_len u8 | name | type u8 | value`,
//! with ten typed value encodings. The gateway only routes on the string
//! headers `:message-type`, `:event-type`, `:exception-type` and
//! `:error-code`, but all types must be walked to keep offsets aligned.

use super::error::{ParseError, ParseResult};
use std::collections::HashMap;

/// Header value type identifier (AWS Event Stream protocol)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderValueType {
    BoolTrue = 0,
    BoolFalse = 1,
    Byte = 2,
    Short = 3,
    Integer = 4,
    Long = 5,
    ByteArray = 6,
    String = 7,
    Timestamp = 8,
    Uuid = 9,
}

impl TryFrom<u8> for HeaderValueType {
    type Error = ParseError;

    fn try_from(value: u8) -> ParseResult<Self> {
        match value {
            0 => Ok(Self::BoolTrue),
            1 => Ok(Self::BoolFalse),
            2 => Ok(Self::Byte),
            3 => Ok(Self::Short),
            4 => Ok(Self::Integer),
            5 => Ok(Self::Long),
            6 => Ok(Self::ByteArray),
            7 => Ok(Self::String),
            8 => Ok(Self::Timestamp),
            9 => Ok(Self::Uuid),
            _ => Err(ParseError::InvalidHeaderType(value)),
        }
    }
}

/// Header value
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Bool(bool),
    Byte(i8),
    Short(i16),
    Integer(i32),
    Long(i64),
    ByteArray(Vec<u8>),
    String(String),
    Timestamp(i64),
    Uuid([u8; 16]),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Message header collection
#[derive(Debug, Clone, Default)]
pub struct Headers {
    inner: HashMap<String, HeaderValue>,
}

impl Headers {
    pub fn new() -> Self {
        Self {
            inner: HashMap::new(),
        }
    }

    pub fn insert(&mut self, name: String, value: HeaderValue) {
        self.inner.insert(name, value);
    }

    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.inner.get(name)
    }

    pub fn get_string(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.as_str())
    }

    pub fn message_type(&self) -> Option<&str> {
        self.get_string(":message-type")
    }

    pub fn event_type(&self) -> Option<&str> {
        self.get_string(":event-type")
    }

    pub fn exception_type(&self) -> Option<&str> {
        self.get_string(":exception-type")
    }

    pub fn error_code(&self) -> Option<&str> {
        self.get_string(":error-code")
    }
}

/// Parse the header block of a frame.
pub fn parse_headers(data: &[u8]) -> ParseResult<Headers> {
    let mut headers = Headers::new();
    let mut offset = 0;

    while offset < data.len() {
        let name_len = data[offset] as usize;
        offset += 1;

        if name_len == 0 {
            return Err(ParseError::HeaderParseFailed(
                "header name length cannot be 0".to_string(),
            ));
        }
        if offset + name_len + 1 > data.len() {
            return Err(ParseError::Incomplete {
                needed: name_len + 1,
                available: data.len() - offset,
            });
        }

        let name = String::from_utf8_lossy(&data[offset..offset + name_len]).to_string();
        offset += name_len;

        let value_type = HeaderValueType::try_from(data[offset])?;
        offset += 1;

        let (value, consumed) = parse_header_value(&data[offset..], value_type)?;
        offset += consumed;
        headers.insert(name, value);
    }

    Ok(headers)
}

/// Parse one typed value; returns the value and its encoded length.
fn parse_header_value(data: &[u8], value_type: HeaderValueType) -> ParseResult<(HeaderValue, usize)> {
    let ensure = |needed: usize| -> ParseResult<()> {
        if data.len() < needed {
            Err(ParseError::Incomplete {
                needed,
                available: data.len(),
            })
        } else {
            Ok(())
        }
    };

    match value_type {
        HeaderValueType::BoolTrue => Ok((HeaderValue::Bool(true), 0)),
        HeaderValueType::BoolFalse => Ok((HeaderValue::Bool(false), 0)),
        HeaderValueType::Byte => {
            ensure(1)?;
            Ok((HeaderValue::Byte(data[0] as i8), 1))
        }
        HeaderValueType::Short => {
            ensure(2)?;
            Ok((HeaderValue::Short(i16::from_be_bytes([data[0], data[1]])), 2))
        }
        HeaderValueType::Integer => {
            ensure(4)?;
            Ok((
                HeaderValue::Integer(i32::from_be_bytes([data[0], data[1], data[2], data[3]])),
                4,
            ))
        }
        HeaderValueType::Long => {
            ensure(8)?;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&data[..8]);
            Ok((HeaderValue::Long(i64::from_be_bytes(buf)), 8))
        }
        HeaderValueType::Timestamp => {
            ensure(8)?;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&data[..8]);
            Ok((HeaderValue::Timestamp(i64::from_be_bytes(buf)), 8))
        }
        HeaderValueType::ByteArray => {
            ensure(2)?;
            let len = u16::from_be_bytes([data[0], data[1]]) as usize;
            ensure(2 + len)?;
            Ok((HeaderValue::ByteArray(data[2..2 + len].to_vec()), 2 + len))
        }
        HeaderValueType::String => {
            ensure(2)?;
            let len = u16::from_be_bytes([data[0], data[1]]) as usize;
            ensure(2 + len)?;
            let s = String::from_utf8_lossy(&data[2..2 + len]).to_string();
            Ok((HeaderValue::String(s), 2 + len))
        }
        HeaderValueType::Uuid => {
            ensure(16)?;
            let mut uuid = [0u8; 16];
            uuid.copy_from_slice(&data[..16]);
            Ok((HeaderValue::Uuid(uuid), 16))
        }
    }
}

/// Encode a single string header (test fixtures build frames with this).
pub fn encode_string_header(name: &str, value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + name.len() + value.len());
    out.push(name.len() as u8);
    out.extend_from_slice(name.as_bytes());
    out.push(HeaderValueType::String as u8);
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_value_type_conversion() {
        assert_eq!(
            HeaderValueType::try_from(0).unwrap(),
            HeaderValueType::BoolTrue
        );
        assert_eq!(HeaderValueType::try_from(7).unwrap(), HeaderValueType::String);
        assert!(HeaderValueType::try_from(10).is_err());
    }

    #[test]
    fn test_parse_headers_string() {
        // name_len(1) + "x" + type(7) + value_len(2) + "ab"
        let data = [1u8, b'x', 7, 0, 2, b'a', b'b'];
        let headers = parse_headers(&data).unwrap();
        assert_eq!(headers.get_string("x"), Some("ab"));
    }

    #[test]
    fn test_parse_headers_event_type() {
        let data = encode_string_header(":event-type", "assistantResponseEvent");
        let headers = parse_headers(&data).unwrap();
        assert_eq!(headers.event_type(), Some("assistantResponseEvent"));
    }

    #[test]
    fn test_parse_headers_mixed_types() {
        let mut data = vec![1u8, b'b', 0]; // bool true, zero-length value
        data.extend(encode_string_header("s", "hi"));
        let headers = parse_headers(&data).unwrap();
        assert_eq!(headers.get("b"), Some(&HeaderValue::Bool(true)));
        assert_eq!(headers.get_string("s"), Some("hi"));
    }

    #[test]
    fn test_zero_length_name_rejected() {
        let data = [0u8, 7, 0, 0];
        assert!(matches!(
            parse_headers(&data),
            Err(ParseError::HeaderParseFailed(_))
        ));
    }
}
