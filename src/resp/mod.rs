//! RESP2 framing for the remote key-value backend.
//!
//! Commands travel as arrays of bulk strings; replies may be any [`Frame`].
//! Parsing is incremental in the same way as HTTP request parsing: a buffer
//! that does not yet hold a whole frame yields [`FrameError::Incomplete`] and
//! the caller reads more bytes before trying again.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Largest bulk string we are willing to buffer (512 MiB, the server-side limit).
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Upper bound on pre-allocated array slots; longer arrays grow as they parse.
const MAX_PREALLOC: usize = 1024;

/// Errors produced while decoding a frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is incomplete, more data needed")]
    Incomplete,

    #[error("invalid frame type byte {0:#04x}")]
    InvalidPrefix(u8),

    #[error("invalid integer or length in frame")]
    InvalidInteger,

    #[error("frame text is not valid UTF-8")]
    InvalidUtf8,

    #[error("bulk string exceeds maximum allowed size of {max_bytes} bytes")]
    TooLarge { max_bytes: usize },

    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

/// A single RESP2 value.
///
/// # Examples
///
/// ```
/// use cellar::resp::Frame;
///
/// let (frame, used) = Frame::parse(b"$5\r\nhello\r\n").unwrap();
/// assert_eq!(frame, Frame::Bulk("hello".into()));
/// assert_eq!(used, 11);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Null,
    Array(Vec<Frame>),
}

impl Frame {
    /// Builds a command frame (an array of bulk strings) from its arguments.
    pub fn command<I, A>(args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        Frame::Array(
            args.into_iter()
                .map(|arg| Frame::Bulk(Bytes::copy_from_slice(arg.as_ref())))
                .collect(),
        )
    }

    /// Parses one frame from the front of `buf`.
    ///
    /// Returns the frame and the number of bytes it occupied.
    ///
    /// # Errors
    ///
    /// - [`FrameError::Incomplete`]: `buf` ends before the frame does.
    /// - Any other variant: the bytes are not valid RESP2.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), FrameError> {
        parse_at(buf, 0)
    }

    /// Appends the wire encoding of this frame to `buf`.
    pub fn write_to(&self, buf: &mut BytesMut) {
        match self {
            Frame::Simple(s) => {
                buf.put_u8(b'+');
                buf.put(s.as_bytes());
                buf.put(&b"\r\n"[..]);
            }
            Frame::Error(s) => {
                buf.put_u8(b'-');
                buf.put(s.as_bytes());
                buf.put(&b"\r\n"[..]);
            }
            Frame::Integer(n) => {
                buf.put(format!(":{n}\r\n").as_bytes());
            }
            Frame::Bulk(data) => {
                buf.put(format!("${}\r\n", data.len()).as_bytes());
                buf.put(data.as_ref());
                buf.put(&b"\r\n"[..]);
            }
            Frame::Null => buf.put(&b"$-1\r\n"[..]),
            Frame::Array(items) => {
                buf.put(format!("*{}\r\n", items.len()).as_bytes());
                for item in items {
                    item.write_to(buf);
                }
            }
        }
    }

    /// Serializes this frame into a fresh buffer.
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(64);
        self.write_to(&mut buf);
        buf
    }

    /// Returns the payload of a bulk or simple string frame.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Frame::Bulk(data) => Some(data),
            Frame::Simple(s) => Some(s.as_bytes()),
            _ => None,
        }
    }
}

fn parse_at(buf: &[u8], pos: usize) -> Result<(Frame, usize), FrameError> {
    let Some(&prefix) = buf.get(pos) else {
        return Err(FrameError::Incomplete);
    };
    let (line, next) = read_line(buf, pos + 1)?;

    match prefix {
        b'+' => Ok((Frame::Simple(utf8(line)?), next)),
        b'-' => Ok((Frame::Error(utf8(line)?), next)),
        b':' => Ok((Frame::Integer(integer(line)?), next)),
        b'$' => {
            let len = integer(line)?;
            if len == -1 {
                return Ok((Frame::Null, next));
            }
            let len = usize::try_from(len).map_err(|_| FrameError::InvalidInteger)?;
            if len > MAX_BULK_LEN {
                return Err(FrameError::TooLarge {
                    max_bytes: MAX_BULK_LEN,
                });
            }

            let end = next + len;
            if buf.len() < end + 2 {
                return Err(FrameError::Incomplete);
            }
            if &buf[end..end + 2] != b"\r\n" {
                return Err(FrameError::Malformed("bulk string not terminated by CRLF"));
            }
            Ok((Frame::Bulk(Bytes::copy_from_slice(&buf[next..end])), end + 2))
        }
        b'*' => {
            let count = integer(line)?;
            if count == -1 {
                return Ok((Frame::Null, next));
            }
            let count = usize::try_from(count).map_err(|_| FrameError::InvalidInteger)?;

            let mut items = Vec::with_capacity(count.min(MAX_PREALLOC));
            let mut cursor = next;
            for _ in 0..count {
                let (item, after) = parse_at(buf, cursor)?;
                items.push(item);
                cursor = after;
            }
            Ok((Frame::Array(items), cursor))
        }
        other => Err(FrameError::InvalidPrefix(other)),
    }
}

// Returns the bytes between `start` and the next CRLF, plus the offset after it.
fn read_line(buf: &[u8], start: usize) -> Result<(&[u8], usize), FrameError> {
    let rest = buf.get(start..).ok_or(FrameError::Incomplete)?;
    match rest.windows(2).position(|w| w == b"\r\n") {
        Some(idx) => Ok((&rest[..idx], start + idx + 2)),
        None => Err(FrameError::Incomplete),
    }
}

fn utf8(line: &[u8]) -> Result<String, FrameError> {
    std::str::from_utf8(line)
        .map(str::to_owned)
        .map_err(|_| FrameError::InvalidUtf8)
}

fn integer(line: &[u8]) -> Result<i64, FrameError> {
    std::str::from_utf8(line)
        .map_err(|_| FrameError::InvalidInteger)?
        .parse()
        .map_err(|_| FrameError::InvalidInteger)
}
