//! RESP connections to the remote key-value service.
//!
//! [`RedisManager`] plugs into [`Pool`](super::Pool): it dials TCP, performs
//! `AUTH` when a password is configured, and uses `PING` as the liveness probe.

use std::fmt;

use async_trait::async_trait;
use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::Manager;
use crate::resp::{Frame, FrameError};

const INITIAL_BUF_SIZE: usize = 4096;

/// Errors raised while talking to the remote service.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Frame(#[from] FrameError),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("unexpected reply to {command}: {reply:?}")]
    UnexpectedReply { command: &'static str, reply: Frame },

    #[error("connection closed by server")]
    Closed,
}

/// One open connection to the remote service.
pub struct Connection {
    stream: TcpStream,
    buf: BytesMut,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.stream.peer_addr().ok())
            .field("buffered", &self.buf.len())
            .finish()
    }
}

impl Connection {
    /// Opens a TCP connection to `host` (a `host:port` string).
    pub async fn connect(host: &str) -> Result<Self, ConnectionError> {
        let stream = TcpStream::connect(host).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            buf: BytesMut::with_capacity(INITIAL_BUF_SIZE),
        })
    }

    /// Sends one command and waits for its reply.
    ///
    /// An error reply from the server is returned as
    /// [`ConnectionError::Server`] so callers only ever see data frames.
    pub async fn command<A: AsRef<[u8]>>(&mut self, args: &[A]) -> Result<Frame, ConnectionError> {
        let request = Frame::command(args).to_bytes();
        self.stream.write_all(&request).await?;
        self.stream.flush().await?;

        match self.read_frame().await? {
            Frame::Error(message) => Err(ConnectionError::Server(message)),
            frame => Ok(frame),
        }
    }

    async fn read_frame(&mut self) -> Result<Frame, ConnectionError> {
        loop {
            if !self.buf.is_empty() {
                match Frame::parse(&self.buf) {
                    Ok((frame, used)) => {
                        let _ = self.buf.split_to(used);
                        return Ok(frame);
                    }
                    Err(FrameError::Incomplete) => {}
                    Err(e) => return Err(e.into()),
                }
            }

            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return Err(ConnectionError::Closed);
            }
        }
    }

    /// Sends `PING` and checks for `PONG`.
    pub async fn ping(&mut self) -> Result<(), ConnectionError> {
        match self.command(&["PING"]).await? {
            Frame::Simple(s) if s == "PONG" => Ok(()),
            reply => Err(ConnectionError::UnexpectedReply {
                command: "PING",
                reply,
            }),
        }
    }

    async fn auth(&mut self, password: &str) -> Result<(), ConnectionError> {
        match self.command(&["AUTH", password]).await {
            Ok(Frame::Simple(s)) if s == "OK" => Ok(()),
            Ok(reply) => Err(ConnectionError::UnexpectedReply {
                command: "AUTH",
                reply,
            }),
            Err(ConnectionError::Server(message)) => Err(ConnectionError::Auth(message)),
            Err(e) => Err(e),
        }
    }
}

/// Dial parameters for the remote service.
#[derive(Clone)]
pub struct RedisManager {
    host: String,
    password: Option<String>,
}

impl fmt::Debug for RedisManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisManager")
            .field("host", &self.host)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl RedisManager {
    /// `password` of `None` (or empty) skips `AUTH`.
    pub fn new(host: impl Into<String>, password: Option<String>) -> Self {
        Self {
            host: host.into(),
            password: password.filter(|p| !p.is_empty()),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

#[async_trait]
impl Manager for RedisManager {
    type Connection = Connection;
    type Error = ConnectionError;

    async fn connect(&self) -> Result<Connection, ConnectionError> {
        let mut conn = Connection::connect(&self.host).await?;
        if let Some(password) = &self.password {
            conn.auth(password).await?;
            trace!(host = %self.host, "authenticated connection");
        }
        debug!(host = %self.host, "connected to remote cache");
        Ok(conn)
    }

    async fn probe(&self, conn: &mut Connection) -> Result<(), ConnectionError> {
        conn.ping().await
    }
}
