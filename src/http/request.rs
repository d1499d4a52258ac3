//! Request parsing on top of [`httparse`].

use bytes::Bytes;
use serde::de::DeserializeOwned;
use thiserror::Error;

use super::{Headers, Method};

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid Content-Length header")]
    InvalidContentLength,

    #[error("body of {len} bytes exceeds the {max} byte limit")]
    BodyTooLarge { len: usize, max: usize },
}

/// Largest `Content-Length` accepted.
pub const MAX_BODY_LEN: usize = 1024 * 1024;

/// A parsed request with its complete body.
///
/// ```
/// use cellar::http::Request;
///
/// let raw = b"POST /cache/get HTTP/1.1\r\nContent-Length: 14\r\n\r\n{\"name\":\"foo\"}";
/// let (request, used) = Request::parse(raw).unwrap();
/// assert_eq!(request.path(), "/cache/get");
/// assert_eq!(used, raw.len());
/// ```
#[derive(Debug)]
pub struct Request {
    method: Method,
    path: String,
    version: u8,
    headers: Headers,
    body: Bytes,
}

impl Request {
    const MAX_HEADERS: usize = 64;

    /// Parses one request from the front of `buf`.
    ///
    /// Returns the request and the number of bytes it occupied (headers plus
    /// `Content-Length` bytes of body). Bytes after that belong to the next
    /// pipelined request.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`]: the headers or the body have not fully arrived.
    /// - Any other variant: the request is malformed.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut slots = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw = httparse::Request::new(&mut slots);

        let body_start = match raw.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method = Method::from(raw.method.ok_or(RequestError::MissingField { field: "method" })?);
        let target = raw.path.ok_or(RequestError::MissingField { field: "path" })?;
        let path = target.split_once('?').map_or(target, |(p, _)| p).to_owned();
        let version = raw.version.ok_or(RequestError::MissingField { field: "version" })?;

        let mut headers = Headers::with_capacity(raw.headers.len());
        for header in raw.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                headers.insert(header.name, value);
            }
        }

        let body_len = match headers.get("content-length") {
            Some(v) => v
                .trim()
                .parse::<usize>()
                .map_err(|_| RequestError::InvalidContentLength)?,
            None => 0,
        };
        if body_len > MAX_BODY_LEN {
            return Err(RequestError::BodyTooLarge {
                len: body_len,
                max: MAX_BODY_LEN,
            });
        }
        let end = body_start
            .checked_add(body_len)
            .ok_or(RequestError::InvalidContentLength)?;
        if buf.len() < end {
            return Err(RequestError::Incomplete);
        }

        Ok((
            Self {
                method,
                path,
                version,
                headers,
                body: Bytes::copy_from_slice(&buf[body_start..end]),
            },
            end,
        ))
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Path without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Decodes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Value of the `Cookie` request header, if any.
    pub fn cookies(&self) -> Option<&str> {
        self.headers.get("cookie")
    }

    /// HTTP/1.1 keeps the connection open unless told otherwise; HTTP/1.0
    /// closes it unless asked to keep it.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(v) if v.eq_ignore_ascii_case("close") => false,
            Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
            _ => self.version == 1,
        }
    }
}
