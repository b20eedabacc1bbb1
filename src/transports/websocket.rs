//! WebSocket transport implementation using `tokio-tungstenite`.
//!
//! This module provides [`WebSocketTransport`], a [`Transport`] implementation
//! that carries channel frames over a WebSocket connection, and
//! [`WebSocketConnector`], the [`Connector`] a
//! [`ConnectionManager`](crate::connection::ConnectionManager) uses to open one
//! per connection attempt. Both `ws://` and `wss://` URLs are supported.
//!
//! # Feature gate
//!
//! This module is only available when the `transport-websocket` feature is enabled
//! (it is enabled by default).
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), rookline_client::RooklineError> {
//! use rookline_client::{Transport, WebSocketTransport};
//!
//! let mut transport = WebSocketTransport::connect("ws://localhost:8080/ws").await?;
//! transport
//!     .send(r#"{"op":"subscribe","id":"s1","topic":"/topic/game/1"}"#.to_string())
//!     .await?;
//!
//! if let Some(Ok(frame)) = transport.recv().await {
//!     println!("received: {frame}");
//! }
//!
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::error::RooklineError;
use crate::transport::{Connector, Transport};

/// Type alias for the underlying WebSocket stream.
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A [`Transport`] backed by a WebSocket connection.
///
/// For advanced use-cases (custom TLS, proxy, headers) construct the stream
/// yourself and use [`WebSocketTransport::from_stream`].
///
/// # Cancel Safety
///
/// The [`recv`](Transport::recv) method is cancel-safe. Dropping the future
/// returned by `recv` before it completes will not consume or lose any frames.
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WsStream,
    closed: bool,
}

impl WebSocketTransport {
    /// Establish a new WebSocket connection to the given URL.
    ///
    /// # Errors
    ///
    /// Returns [`RooklineError::Unauthorized`] if the server answers the
    /// handshake with 401 or 403, and [`RooklineError::Io`] for every other
    /// failure. I/O error kinds are preserved; all other errors map to
    /// [`ErrorKind::Other`](std::io::ErrorKind::Other).
    pub async fn connect(url: &str) -> Result<Self, RooklineError> {
        tracing::debug!(url = %redact(url), "connecting to WebSocket server");

        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(handshake_error)?;

        tracing::info!(url = %redact(url), "WebSocket connection established");

        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-established WebSocket stream.
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }

    /// Like [`connect`](Self::connect), but fails with
    /// [`RooklineError::Timeout`] if the connection is not established in time.
    ///
    /// # Errors
    ///
    /// Returns [`RooklineError::Timeout`] if the deadline elapses, or any
    /// error that [`connect`](Self::connect) may return.
    pub async fn connect_with_timeout(url: &str, timeout: Duration) -> Result<Self, RooklineError> {
        tokio::time::timeout(timeout, Self::connect(url))
            .await
            .map_err(|_| RooklineError::Timeout)?
    }
}

fn handshake_error(e: tokio_tungstenite::tungstenite::Error) -> RooklineError {
    use tokio_tungstenite::tungstenite::Error;

    match &e {
        Error::Http(response)
            if matches!(
                response.status(),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
            ) =>
        {
            RooklineError::Unauthorized(format!("handshake rejected: {}", response.status()))
        }
        Error::Io(io) => RooklineError::Io(std::io::Error::new(io.kind(), e.to_string())),
        _ => RooklineError::Io(std::io::Error::other(e)),
    }
}

/// Strip the query string so tokens never reach the logs.
fn redact(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, message: String) -> Result<(), RooklineError> {
        if self.closed {
            return Err(RooklineError::TransportClosed);
        }
        self.stream
            .send(Message::Text(message.into()))
            .await
            .map_err(|e| RooklineError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, RooklineError>> {
        loop {
            let msg = match self.stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    return Some(Err(RooklineError::TransportReceive(e.to_string())));
                }
                None => return None,
            };

            match msg {
                Message::Text(text) => return Some(Ok(text.to_string())),
                Message::Close(frame) => {
                    tracing::debug!(?frame, "received WebSocket close frame");
                    return None;
                }
                // tungstenite queues the pong itself.
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Binary(_) => {
                    tracing::warn!("received unexpected binary WebSocket frame, skipping");
                }
                Message::Frame(_) => {
                    tracing::debug!("received raw WebSocket frame, skipping");
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), RooklineError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .close(None)
            .await
            .map_err(|e| RooklineError::TransportSend(e.to_string()))
    }
}

// ── Connector ───────────────────────────────────────────────────────

/// Default timeout for one connection attempt.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// [`Connector`] that opens a [`WebSocketTransport`] per attempt.
///
/// The credential is passed as a `token` query parameter, since browsers and
/// most proxies cannot set headers on the upgrade request.
///
/// ```
/// use rookline_client::WebSocketConnector;
///
/// let connector = WebSocketConnector::new("ws://localhost:8080/ws");
/// assert_eq!(connector.url_for(Some("abc")), "ws://localhost:8080/ws?token=abc");
/// assert_eq!(connector.url_for(None), "ws://localhost:8080/ws");
/// ```
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Set the timeout for one connection attempt. Defaults to **10 seconds**.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// URL used for an attempt carrying `token`.
    pub fn url_for(&self, token: Option<&str>) -> String {
        match token {
            None => self.url.clone(),
            Some(token) => {
                let separator = if self.url.contains('?') { '&' } else { '?' };
                format!("{}{separator}token={}", self.url, encode_query_value(token))
            }
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, token: Option<String>) -> Result<Box<dyn Transport>, RooklineError> {
        let url = self.url_for(token.as_deref());
        let transport = WebSocketTransport::connect_with_timeout(&url, self.connect_timeout).await?;
        Ok(Box::new(transport))
    }
}

/// Percent-encode everything outside the URL unreserved set.
fn encode_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    #[test]
    fn websocket_transport_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<WebSocketTransport>();
    }

    #[test]
    fn url_for_appends_encoded_token() {
        let connector = WebSocketConnector::new("ws://h/ws?v=2");
        assert_eq!(connector.url_for(Some("a b/c")), "ws://h/ws?v=2&token=a%20b%2Fc");
        assert_eq!(redact("ws://h/ws?token=secret"), "ws://h/ws");
    }

    #[tokio::test]
    async fn connect_fails_with_invalid_url() {
        let err = WebSocketTransport::connect("not-a-valid-url")
            .await
            .unwrap_err();
        assert!(matches!(err, RooklineError::Io(_)));
    }

    #[tokio::test]
    async fn connect_fails_with_unreachable_host() {
        let err = WebSocketTransport::connect("ws://127.0.0.1:1")
            .await
            .unwrap_err();
        assert!(matches!(err, RooklineError::Io(_)));
    }

    // ── Mock-server helpers ──────────────────────────────────────────────

    /// Start a local WebSocket server that runs `handler` on the accepted
    /// connection and returns the address to connect to.
    async fn start_mock_server<F, Fut>(handler: F) -> String
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            handler(ws).await;
        });

        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn recv_receives_text_and_skips_binary() {
        let url = start_mock_server(|mut ws| async move {
            ws.send(Message::Binary(vec![0xDE, 0xAD].into()))
                .await
                .unwrap();
            ws.send(Message::Text(r#"{"op":"error","message":"x"}"#.into()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        let frame = transport.recv().await.unwrap().unwrap();
        assert_eq!(frame, r#"{"op":"error","message":"x"}"#);
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn send_after_close_returns_transport_closed() {
        let url = start_mock_server(|mut ws| async move {
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();

        let err = transport.send("oops".to_string()).await.unwrap_err();
        assert!(matches!(err, RooklineError::TransportClosed));
    }

    #[tokio::test]
    async fn connect_with_timeout_times_out() {
        // Non-routable address.
        let err = WebSocketTransport::connect_with_timeout("ws://192.0.2.1:1", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RooklineError::Timeout));
    }

    #[tokio::test]
    async fn connector_passes_token_in_query() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (uri_tx, uri_rx) = tokio::sync::oneshot::channel::<String>();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                let _ = uri_tx.send(req.uri().to_string());
                Ok(resp)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(tcp, callback)
                .await
                .unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let connector = WebSocketConnector::new(format!("ws://{addr}/ws"));
        let mut transport = connector.connect(Some("tok".into())).await.unwrap();
        assert_eq!(uri_rx.await.unwrap(), "/ws?token=tok");
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn connector_maps_401_to_unauthorized() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let callback = |_req: &Request, _resp: Response| -> Result<Response, ErrorResponse> {
                let mut rejection = ErrorResponse::new(Some("bad token".into()));
                *rejection.status_mut() = StatusCode::UNAUTHORIZED;
                Err(rejection)
            };
            let _ = tokio_tungstenite::accept_hdr_async(tcp, callback).await;
        });

        let connector = WebSocketConnector::new(format!("ws://{addr}/ws"));
        let Err(err) = connector.connect(Some("stale".into())).await else {
            panic!("a rejected handshake must not yield a transport");
        };
        assert!(err.is_auth_failure(), "got {err:?}");
    }
}
