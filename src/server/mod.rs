//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and feeds each HTTP/1.1 request, stamped with the
//! connection's peer address, to a handler (normally [`Pipeline::handle`]).
//! Persistent connections are kept open between requests.
//!
//! [`Pipeline::handle`]: crate::middleware::Pipeline::handle

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::http::{
    StatusCode,
    request::{Request, RequestError},
    response::Response,
};
use crate::middleware::Pipeline;

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

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The earngate HTTP server.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use earngate::middleware::{LoggerMiddleware, Pipeline};
/// use earngate::{Response, Router, Server, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut router = Router::new();
///     router.get("/health", |_ctx| async { Response::new(StatusCode::Ok).body("ok") });
///     let pipeline = Arc::new(Pipeline::new(router).layer(LoggerMiddleware));
///
///     let server = Server::bind("127.0.0.1:3001").await?;
///     server.serve(pipeline).await?;
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
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
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

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Runs every request through `pipeline`.
    ///
    /// # Errors
    ///
    /// See [`run`](Self::run).
    pub async fn serve(self, pipeline: Arc<Pipeline>) -> Result<(), ServerError> {
        self.run(move |request| {
            let pipeline = Arc::clone(&pipeline);
            async move { pipeline.handle(request).await }
        })
        .await
    }

    /// Starts accepting connections and dispatching requests to `handler`.
    ///
    /// The handler is shared across all connection tasks. Runs until the
    /// process is terminated.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run<H, F>(self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        let handler = Arc::new(handler);
        info!(address = %self.local_addr, "earngate listening");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let handler = Arc::clone(&handler);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, handler).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Serves one connection, one request per loop iteration, until the peer
/// closes it or asks for `Connection: close`.
async fn handle_connection<H, F>(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<H>,
) -> Result<(), std::io::Error>
where
    H: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        let bytes_read = stream.read_buf(&mut buf).await?;

        if bytes_read == 0 {
            debug!(peer = %peer_addr, "connection closed by peer");
            break;
        }

        // Guard against excessively large requests.
        if buf.len() > MAX_REQUEST_SIZE {
            warn!(peer = %peer_addr, "request too large, sending 413");
            let response = error_response(StatusCode::PayloadTooLarge, "Request entity too large");
            stream.write_all(&response.into_bytes()).await?;
            break;
        }

        // Attempt to parse the buffered data as an HTTP request.
        let (request, body_offset) = match Request::parse(&buf) {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => continue,
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                let response = error_response(StatusCode::BadRequest, &format!("Bad Request: {e}"));
                stream.write_all(&response.into_bytes()).await?;
                break;
            }
        };

        // Wait for the full body to arrive if Content-Length is set.
        let content_length = request.content_length().unwrap_or(0);
        let total_needed = match body_offset.checked_add(content_length) {
            Some(total) if total <= MAX_REQUEST_SIZE => total,
            _ => {
                warn!(peer = %peer_addr, content_length, "declared body too large, sending 413");
                let response =
                    error_response(StatusCode::PayloadTooLarge, "Request entity too large");
                stream.write_all(&response.into_bytes()).await?;
                break;
            }
        };
        if buf.len() < total_needed {
            continue;
        }

        let mut request = request.with_peer_addr(peer_addr);
        request.truncate_body(content_length);
        let keep_alive = request.is_keep_alive();

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        let response = handler(request).await;
        stream.write_all(&response.into_bytes()).await?;
        stream.flush().await?;

        let _ = buf.split_to(total_needed);

        if !keep_alive {
            debug!(peer = %peer_addr, "Connection: close, shutting down");
            break;
        }
    }

    Ok(())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    Response::json(
        status,
        &serde_json::json!({ "statusCode": status.as_u16(), "message": message }),
    )
    .keep_alive(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Router;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn spawn_echo_peer() -> SocketAddr {
        let mut router = Router::new();
        router.post("/echo", |ctx: crate::context::Context| async move {
            let peer = ctx
                .request()
                .peer_addr()
                .map(|a| a.ip().to_string())
                .unwrap_or_default();
            let body = String::from_utf8_lossy(ctx.request().body()).into_owned();
            Response::new(StatusCode::Ok).body(format!("{peer}|{body}"))
        });
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.serve(Arc::new(Pipeline::new(router))));
        addr
    }

    #[tokio::test]
    async fn stamps_peer_and_trims_body() {
        let addr = spawn_echo_peer().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello")
            .await
            .unwrap();

        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();
        assert!(raw.starts_with("HTTP/1.1 200"));
        assert!(raw.ends_with("127.0.0.1|hello"), "{raw}");
    }

    #[tokio::test]
    async fn malformed_request_gets_json_400() {
        let addr = spawn_echo_peer().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"\x01\x02 nonsense\r\n\r\n").await.unwrap();

        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();
        assert!(raw.starts_with("HTTP/1.1 400"));
        assert!(raw.contains("\"statusCode\":400"));
    }

    #[tokio::test]
    async fn oversized_content_length_gets_json_413() {
        let addr = spawn_echo_peer().await;
        for declared in ["18446744073709551615", "8388609"] {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let head = format!("POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: {declared}\r\n\r\n");
            stream.write_all(head.as_bytes()).await.unwrap();

            let mut raw = String::new();
            stream.read_to_string(&mut raw).await.unwrap();
            assert!(raw.starts_with("HTTP/1.1 413"), "{raw}");
            assert!(raw.contains("\"statusCode\":413"));
        }

        // The server keeps accepting connections afterwards.
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
            .await
            .unwrap();
        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();
        assert!(raw.starts_with("HTTP/1.1 200"));
    }
}
