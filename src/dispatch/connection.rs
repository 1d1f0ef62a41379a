use super::{DispatchError, Result};
use bytes::Bytes;
use dispatchcore::resp::{ProtocolError, ReplyHeader};
use log::trace;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

// Same ceiling the cache service applies to a single bulk string.
const MAX_BULK_LENGTH: usize = 512 * 1024 * 1024;
const MAX_ARRAY_LENGTH: usize = 1024 * 1024;
const MAX_LINE_LENGTH: u64 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Status(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Bytes>),
    Array(Option<Vec<Reply>>),
}

/// Replies seen on a connection in subscribe mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubSubReply {
    Message { channel: String, data: Bytes },
    Subscribed { channel: String, count: i64 },
    Unsubscribed { channel: String, count: i64 },
    Pong,
    Other(Reply),
}

impl TryFrom<Reply> for PubSubReply {
    type Error = ProtocolError;

    fn try_from(reply: Reply) -> std::result::Result<Self, Self::Error> {
        let items = match reply {
            Reply::Array(Some(items)) => items,
            // A connection with no subscriptions yet answers PING plainly.
            Reply::Status(status) if status.eq_ignore_ascii_case("PONG") => return Ok(Self::Pong),
            other => return Ok(Self::Other(other)),
        };

        let kind = match items.first() {
            Some(Reply::Bulk(Some(kind))) => kind.clone(),
            _ => return Ok(Self::Other(Reply::Array(Some(items)))),
        };

        match (&kind[..], items.as_slice()) {
            (b"message", [_, Reply::Bulk(Some(channel)), Reply::Bulk(Some(data))]) => {
                Ok(Self::Message {
                    channel: channel_name(channel)?,
                    data: data.clone(),
                })
            }
            (b"subscribe", [_, Reply::Bulk(Some(channel)), Reply::Integer(count)]) => {
                Ok(Self::Subscribed {
                    channel: channel_name(channel)?,
                    count: *count,
                })
            }
            (b"unsubscribe", [_, Reply::Bulk(channel), Reply::Integer(count)]) => {
                let channel = match channel {
                    Some(channel) => channel_name(channel)?,
                    None => String::new(),
                };
                Ok(Self::Unsubscribed {
                    channel,
                    count: *count,
                })
            }
            (b"pong", _) => Ok(Self::Pong),
            (b"message", _) | (b"subscribe", _) | (b"unsubscribe", _) => Err(
                ProtocolError::UnexpectedReply(format!("malformed {:?} push", kind)),
            ),
            _ => Ok(Self::Other(Reply::Array(Some(items)))),
        }
    }
}

fn channel_name(raw: &Bytes) -> std::result::Result<String, ProtocolError> {
    String::from_utf8(raw.to_vec())
        .map_err(|_| ProtocolError::UnexpectedReply("channel name is not UTF-8".into()))
}

/// Reads replies off a cache connection.
pub struct ReplyReader<R> {
    inner: BufReader<R>,
    line: Vec<u8>,
}

impl<R: AsyncRead + Unpin> ReplyReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            line: Vec::with_capacity(64),
        }
    }

    /// Reads one complete reply. `Ok(None)` means the peer closed the
    /// connection cleanly between replies.
    pub async fn read_reply(&mut self) -> Result<Option<Reply>> {
        let Some(header) = self.read_header().await? else {
            return Ok(None);
        };

        let reply = match header {
            ReplyHeader::MultiBulk(len) => {
                if len > MAX_ARRAY_LENGTH {
                    return Err(ProtocolError::InvalidLength(len.to_string()).into());
                }
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    let header = self.read_header().await?.ok_or(DispatchError::Closed)?;
                    if matches!(
                        header,
                        ReplyHeader::MultiBulk(_) | ReplyHeader::NullMultiBulk
                    ) {
                        return Err(ProtocolError::UnexpectedReply(
                            "nested arrays are not used by pub/sub".into(),
                        )
                        .into());
                    }
                    items.push(self.read_scalar(header).await?);
                }
                Reply::Array(Some(items))
            }
            ReplyHeader::NullMultiBulk => Reply::Array(None),
            scalar => self.read_scalar(scalar).await?,
        };

        trace!("<-- {reply:?}");
        Ok(Some(reply))
    }

    async fn read_header(&mut self) -> Result<Option<ReplyHeader>> {
        self.line.clear();
        let read = (&mut self.inner)
            .take(MAX_LINE_LENGTH)
            .read_until(b'\n', &mut self.line)
            .await?;
        if read == 0 {
            return Ok(None);
        }
        if read as u64 == MAX_LINE_LENGTH && !self.line.ends_with(b"\n") {
            let detail = format!("header longer than {MAX_LINE_LENGTH} bytes");
            return Err(ProtocolError::InvalidLength(detail).into());
        }
        if !self.line.ends_with(b"\r\n") {
            return Err(DispatchError::Closed);
        }

        let line = std::str::from_utf8(&self.line)
            .map_err(|_| ProtocolError::UnexpectedReply("reply header is not UTF-8".into()))?;
        Ok(Some(ReplyHeader::parse(Some(line))?))
    }

    async fn read_scalar(&mut self, header: ReplyHeader) -> Result<Reply> {
        match header {
            ReplyHeader::Status(s) => Ok(Reply::Status(s)),
            ReplyHeader::Error(e) => Ok(Reply::Error(e)),
            ReplyHeader::Integer(i) => Ok(Reply::Integer(i)),
            ReplyHeader::Null => Ok(Reply::Bulk(None)),
            ReplyHeader::Bulk(len) => Ok(Reply::Bulk(Some(self.read_bulk_body(len).await?))),
            ReplyHeader::MultiBulk(_) | ReplyHeader::NullMultiBulk => Err(
                ProtocolError::UnexpectedReply("array where a scalar was expected".into()).into(),
            ),
        }
    }

    async fn read_bulk_body(&mut self, len: usize) -> Result<Bytes> {
        if len > MAX_BULK_LENGTH {
            return Err(ProtocolError::InvalidLength(len.to_string()).into());
        }

        let mut body = vec![0u8; len + 2];
        self.inner.read_exact(&mut body).await?;
        if !body.ends_with(b"\r\n") {
            return Err(ProtocolError::UnexpectedReply("bulk string not CRLF terminated".into()).into());
        }
        body.truncate(len);
        Ok(Bytes::from(body))
    }
}
