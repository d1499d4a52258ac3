//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and dispatches HTTP/1.1 requests to a handler
//! function. Connections are persistent unless the client asks otherwise.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::http::request::MAX_BODY_LEN;
use crate::http::{Request, RequestError, Response, StatusCode};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Largest request (headers plus body) buffered before answering 413.
const MAX_REQUEST_SIZE: usize = MAX_BODY_LEN + 64 * 1024;

const INITIAL_BUF_SIZE: usize = 4096;

/// How long in-flight connections get to finish after shutdown is requested.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The demo HTTP server.
///
/// ```rust,no_run
/// use cellar::server::Server;
/// use cellar::http::{Response, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::bind("127.0.0.1:4000").await?;
///     server
///         .run_until(
///             |_req| async { Response::new(StatusCode::Ok).body("Hello!") },
///             async { tokio::signal::ctrl_c().await.ok(); },
///         )
///         .await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound.
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves until `shutdown` resolves, then stops accepting, lets open
    /// connections finish their current request and waits up to ten seconds
    /// for them to close.
    pub async fn run_until<H, F, S>(self, handler: H, shutdown: S) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
        S: Future<Output = ()>,
    {
        let handler = Arc::new(handler);
        let tracker = TaskTracker::new();
        let token = CancellationToken::new();
        info!(address = %self.local_addr, "listening");

        tokio::pin!(shutdown);
        loop {
            let (stream, peer) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        continue;
                    }
                },
            };

            debug!(peer = %peer, "connection accepted");
            let handler = Arc::clone(&handler);
            let token = token.clone();
            tracker.spawn(async move {
                if let Err(e) = handle_connection(stream, peer, handler, token).await {
                    warn!(peer = %peer, error = %e, "connection closed with error");
                }
            });
        }

        info!(open = tracker.len(), "shutting down");
        drop(self.listener);
        token.cancel();
        tracker.close();
        if tokio::time::timeout(DRAIN_TIMEOUT, tracker.wait()).await.is_err() {
            warn!(open = tracker.len(), "connections still open after drain timeout");
        }
        Ok(())
    }
}

/// Serves one connection until the peer leaves, asks for `Connection: close`,
/// or shutdown is signalled while the connection is idle.
async fn handle_connection<H, F>(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<H>,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error>
where
    H: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        match Request::parse(&buf) {
            Ok((request, used)) => {
                let _ = buf.split_to(used);
                let keep_alive = request.is_keep_alive() && !shutdown.is_cancelled();
                debug!(
                    peer = %peer,
                    method = %request.method(),
                    path = %request.path(),
                    "dispatching request"
                );

                let response = handler(request).await.keep_alive(keep_alive);
                stream.write_all(&response.into_bytes()).await?;
                stream.flush().await?;

                if !keep_alive {
                    break;
                }
                continue;
            }
            Err(RequestError::Incomplete) => {}
            Err(e @ RequestError::BodyTooLarge { .. }) => {
                warn!(peer = %peer, error = %e, "request body too large");
                let response = Response::new(StatusCode::PayloadTooLarge)
                    .body("Request entity too large")
                    .keep_alive(false);
                stream.write_all(&response.into_bytes()).await?;
                break;
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "bad request");
                let response = Response::new(StatusCode::BadRequest)
                    .body(format!("Bad Request: {e}"))
                    .keep_alive(false);
                stream.write_all(&response.into_bytes()).await?;
                break;
            }
        }

        if buf.len() > MAX_REQUEST_SIZE {
            warn!(peer = %peer, size = buf.len(), "request too large");
            let response = Response::new(StatusCode::PayloadTooLarge)
                .body("Request entity too large")
                .keep_alive(false);
            stream.write_all(&response.into_bytes()).await?;
            break;
        }

        let read = tokio::select! {
            _ = shutdown.cancelled(), if buf.is_empty() => break,
            read = stream.read_buf(&mut buf) => read?,
        };
        if read == 0 {
            debug!(peer = %peer, "connection closed by peer");
            break;
        }
    }

    Ok(())
}
