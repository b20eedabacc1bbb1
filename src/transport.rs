//! Transport abstraction for the realtime push channel.
//!
//! The [`Transport`] trait defines a bidirectional text message channel between
//! the client and the match server. Channel frames
//! ([`ClientFrame`](crate::protocol::ClientFrame) /
//! [`ServerFrame`](crate::protocol::ServerFrame)) are JSON text, so every
//! transport implementation handles message framing internally (WebSocket
//! frames, length-prefixed TCP, an in-process channel, ...).
//!
//! # Connection Setup
//!
//! A [`ConnectionManager`](crate::connection::ConnectionManager) reconnects on
//! its own, so it does not take a transport but a [`Connector`]: a factory
//! that opens a fresh transport with the current credential on every attempt.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use rookline_client::error::RooklineError;
//! use rookline_client::transport::Transport;
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn send(&mut self, message: String) -> Result<(), RooklineError> {
//!         // Send the JSON text frame over your transport
//!         todo!()
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, RooklineError>> {
//!         // Receive the next JSON text frame
//!         // Return None when the connection is closed cleanly
//!         todo!()
//!     }
//!
//!     async fn close(&mut self) -> Result<(), RooklineError> {
//!         // Gracefully shut down the connection
//!         todo!()
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::RooklineError;

/// A bidirectional text message transport.
///
/// Each call to [`send`](Transport::send) transmits one complete JSON frame.
/// Each call to [`recv`](Transport::recv) returns one complete JSON frame.
///
/// # Cancel Safety
///
/// The [`recv`](Transport::recv) method **MUST** be cancel-safe because it is used
/// inside `tokio::select!`. If `recv` is cancelled before completion, calling it
/// again must not lose data. Channel-based implementations (e.g., wrapping
/// `mpsc::Receiver`) are naturally cancel-safe.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send a JSON text frame to the server.
    ///
    /// # Errors
    ///
    /// Returns [`RooklineError::TransportSend`] if the frame could not be sent.
    async fn send(&mut self, message: String) -> Result<(), RooklineError>;

    /// Receive the next JSON text frame from the server.
    ///
    /// Returns:
    /// - `Some(Ok(text))`: a complete frame was received
    /// - `Some(Err(e))`: a transport error occurred
    /// - `None`: the connection was closed cleanly by the server
    async fn recv(&mut self) -> Option<Result<String, RooklineError>>;

    /// Close the transport connection gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error if the graceful shutdown fails. Implementations should
    /// still release resources even if the close handshake fails.
    async fn close(&mut self) -> Result<(), RooklineError>;
}

#[async_trait]
impl Transport for Box<dyn Transport> {
    async fn send(&mut self, message: String) -> Result<(), RooklineError> {
        (**self).send(message).await
    }

    async fn recv(&mut self) -> Option<Result<String, RooklineError>> {
        (**self).recv().await
    }

    async fn close(&mut self) -> Result<(), RooklineError> {
        (**self).close().await
    }
}

/// Opens transports for a [`ConnectionManager`](crate::connection::ConnectionManager).
///
/// Called once per connection attempt with the credential read at that
/// moment.
///
/// # Errors
///
/// Implementations return [`RooklineError::Unauthorized`] when the server
/// rejects the credential; the connection manager treats that as terminal and
/// retries every other error after its reconnect delay.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, token: Option<String>) -> Result<Box<dyn Transport>, RooklineError>;
}
