//! Line protocol spoken by the cache service.
//!
//! Requests are arrays of bulk strings. Replies start with a one byte type
//! marker followed by a length, a number or a text, and are terminated by
//! CRLF. Only the reply *headers* are parsed here; reading the bodies is the
//! transport's job since it owns the socket.

use thiserror::Error;

pub const CRLF: &[u8] = b"\r\n";

const STATUS_MARKER: char = '+';
const ERROR_MARKER: char = '-';
const INTEGER_MARKER: char = ':';
const BULK_MARKER: char = '$';
const MULTI_BULK_MARKER: char = '*';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Reply header is missing")]
    MissingHeader,
    #[error("Unexpected reply prefix, expected '{expected}': {line:?}")]
    UnexpectedPrefix { expected: char, line: String },
    #[error("Unknown reply type: {0:?}")]
    UnknownReplyType(String),
    #[error("Invalid length in reply header: {0:?}")]
    InvalidLength(String),
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Header of a bulk string reply, `$<length>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StringReplyHeader {
    length: usize,
}

impl StringReplyHeader {
    /// Parses a bulk string header. A missing line, a different type marker or
    /// a length that is not a non-negative decimal number are all protocol
    /// errors.
    pub fn parse(line: Option<&str>) -> Result<Self> {
        let line = trim_line(line.ok_or(ProtocolError::MissingHeader)?);

        let digits = line
            .strip_prefix(BULK_MARKER)
            .ok_or_else(|| ProtocolError::UnexpectedPrefix {
                expected: BULK_MARKER,
                line: line.to_string(),
            })?;

        Ok(Self {
            length: parse_decimal(digits)?,
        })
    }

    pub fn length(&self) -> usize {
        self.length
    }
}

/// Any reply header the transport may see on its connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyHeader {
    Status(String),
    Error(String),
    Integer(i64),
    Bulk(usize),
    Null,
    MultiBulk(usize),
    NullMultiBulk,
}

impl ReplyHeader {
    pub fn parse(line: Option<&str>) -> Result<Self> {
        let line = trim_line(line.ok_or(ProtocolError::MissingHeader)?);
        let mut chars = line.chars();
        let marker = chars.next().ok_or(ProtocolError::MissingHeader)?;
        let rest = chars.as_str();

        match marker {
            STATUS_MARKER => Ok(Self::Status(rest.to_string())),
            ERROR_MARKER => Ok(Self::Error(rest.to_string())),
            INTEGER_MARKER => rest
                .parse::<i64>()
                .map(Self::Integer)
                .map_err(|_| ProtocolError::InvalidLength(line.to_string())),
            BULK_MARKER if rest == "-1" => Ok(Self::Null),
            BULK_MARKER => StringReplyHeader::parse(Some(line)).map(|h| Self::Bulk(h.length())),
            MULTI_BULK_MARKER if rest == "-1" => Ok(Self::NullMultiBulk),
            MULTI_BULK_MARKER => parse_decimal(rest).map(Self::MultiBulk),
            _ => Err(ProtocolError::UnknownReplyType(line.to_string())),
        }
    }
}

fn trim_line(line: &str) -> &str {
    line.trim_end_matches(['\r', '\n'])
}

fn parse_decimal(digits: &str) -> Result<usize> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::InvalidLength(digits.to_string()));
    }
    digits
        .parse::<usize>()
        .map_err(|_| ProtocolError::InvalidLength(digits.to_string()))
}

/// Encodes a command as an array of bulk strings.
pub fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let body_len: usize = args.iter().map(|a| a.len() + 16).sum();
    let mut out = Vec::with_capacity(body_len + 16);

    out.push(MULTI_BULK_MARKER as u8);
    out.extend_from_slice(args.len().to_string().as_bytes());
    out.extend_from_slice(CRLF);

    for arg in args {
        out.push(BULK_MARKER as u8);
        out.extend_from_slice(arg.len().to_string().as_bytes());
        out.extend_from_slice(CRLF);
        out.extend_from_slice(arg);
        out.extend_from_slice(CRLF);
    }

    out
}

pub fn publish_command(channel: &str, payload: &[u8]) -> Vec<u8> {
    encode_command(&[b"PUBLISH", channel.as_bytes(), payload])
}

pub fn subscribe_command(channels: &[&str]) -> Vec<u8> {
    channel_command(b"SUBSCRIBE", channels)
}

pub fn unsubscribe_command(channels: &[&str]) -> Vec<u8> {
    channel_command(b"UNSUBSCRIBE", channels)
}

pub fn ping_command() -> Vec<u8> {
    encode_command(&[b"PING"])
}

fn channel_command(name: &[u8], channels: &[&str]) -> Vec<u8> {
    let mut args: Vec<&[u8]> = Vec::with_capacity(channels.len() + 1);
    args.push(name);
    args.extend(channels.iter().map(|c| c.as_bytes()));
    encode_command(&args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_reply_header_missing() {
        assert_eq!(
            StringReplyHeader::parse(None),
            Err(ProtocolError::MissingHeader)
        );
    }

    #[test]
    fn test_string_reply_header_bad_number() {
        assert!(matches!(
            StringReplyHeader::parse(Some("$100A")),
            Err(ProtocolError::InvalidLength(_))
        ));
        assert!(StringReplyHeader::parse(Some("$")).is_err());
        assert!(StringReplyHeader::parse(Some("$-1")).is_err());
        assert!(StringReplyHeader::parse(Some("$+10")).is_err());
    }

    #[test]
    fn test_string_reply_header_bad_prefix() {
        assert!(matches!(
            StringReplyHeader::parse(Some("*")),
            Err(ProtocolError::UnexpectedPrefix { expected: '$', .. })
        ));
        assert!(StringReplyHeader::parse(Some("")).is_err());
    }

    #[test]
    fn test_string_reply_header_valid() {
        let header = StringReplyHeader::parse(Some("$1000")).unwrap();
        assert_eq!(header.length(), 1000);

        let header = StringReplyHeader::parse(Some("$0\r\n")).unwrap();
        assert_eq!(header.length(), 0);
    }

    #[test]
    fn test_reply_header_kinds() {
        assert_eq!(
            ReplyHeader::parse(Some("+OK")).unwrap(),
            ReplyHeader::Status("OK".into())
        );
        assert_eq!(
            ReplyHeader::parse(Some("-ERR unknown command")).unwrap(),
            ReplyHeader::Error("ERR unknown command".into())
        );
        assert_eq!(
            ReplyHeader::parse(Some(":3")).unwrap(),
            ReplyHeader::Integer(3)
        );
        assert_eq!(ReplyHeader::parse(Some("$-1")).unwrap(), ReplyHeader::Null);
        assert_eq!(
            ReplyHeader::parse(Some("*3\r\n")).unwrap(),
            ReplyHeader::MultiBulk(3)
        );
        assert!(matches!(
            ReplyHeader::parse(Some("?what")),
            Err(ProtocolError::UnknownReplyType(_))
        ));
        assert!(ReplyHeader::parse(Some(":x")).is_err());
    }

    #[test]
    fn test_encode_publish() {
        let encoded = publish_command("+14152222222:1", b"\x00\x01");
        let mut expected = b"*3\r\n$7\r\nPUBLISH\r\n$14\r\n+14152222222:1\r\n$2\r\n".to_vec();
        expected.extend_from_slice(b"\x00\x01\r\n");
        assert_eq!(encoded, expected);
    }

    #[test]
    fn test_encode_subscribe_many() {
        let encoded = subscribe_command(&["a:1", "a:1:c"]);
        assert_eq!(
            encoded,
            b"*3\r\n$9\r\nSUBSCRIBE\r\n$3\r\na:1\r\n$5\r\na:1:c\r\n".to_vec()
        );
    }
}
