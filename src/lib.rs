//! # Rookline Client
//!
//! Client-side synchronizer for two-player timed chess matches.
//!
//! The crate keeps a local view of one match consistent with the server over
//! two links: a realtime push channel and a request/response repository. It
//! validates local actions before dispatch, applies server snapshots through a
//! single staleness check, estimates live clocks between snapshots and manages
//! matchmaking-queue membership.
//!
//! ## Features
//!
//! - **Confirm-then-render**: the displayed position only changes when the
//!   server confirms it
//! - **Dual link**: actions go over the push channel when it is live and fall
//!   back to REST otherwise
//! - **Transport-agnostic**: implement [`Transport`] and [`Connector`] for any
//!   backend; the default `transport-websocket` feature provides
//!   [`WebSocketConnector`]
//! - **Pluggable rules**: legality comes from a [`LegalMoveOracle`]; the
//!   `rules-chess` feature provides one backed by the `chess` crate
//! - **Event-driven**: sessions report changes as typed events on a bounded
//!   channel
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use rookline_client::{
//!     ConnectionConfig, ConnectionManager, HttpMatchRepository, HttpRepositoryConfig,
//!     MatchSession, SessionConfig, SessionServices, StaticCredentials, WebSocketConnector,
//!     ChessRulesOracle,
//! };
//!
//! let credentials = Arc::new(StaticCredentials::new("token"));
//! let repository = Arc::new(HttpMatchRepository::new(
//!     HttpRepositoryConfig::new("https://rookline.example"),
//!     credentials.clone(),
//! )?);
//! let connection = ConnectionManager::connect(
//!     Arc::new(WebSocketConnector::new("wss://rookline.example/ws")),
//!     credentials,
//!     ConnectionConfig::new(),
//! );
//! let services = SessionServices::new(repository, Arc::new(ChessRulesOracle::new()), connection);
//! let (session, mut events) = MatchSession::open(42, 7, services, SessionConfig::new()).await?;
//! ```

pub mod clock;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod error_codes;
pub mod matchmaking;
pub mod oracle;
pub mod position;
pub mod protocol;
pub mod repositories;
pub mod repository;
pub mod session;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use clock::ClockReading;
pub use connection::{ConnectionConfig, ConnectionManager, ConnectionPhase, DisconnectReason, Subscription};
pub use credentials::{CredentialProvider, SessionCredentials, StaticCredentials};
pub use error::RooklineError;
pub use error_codes::RejectionCode;
pub use matchmaking::{MatchmakingConfig, MatchmakingEvent, MatchmakingSession, MatchmakingState};
#[cfg(feature = "rules-chess")]
pub use oracle::ChessRulesOracle;
pub use oracle::{LegalMoveOracle, PermissiveOracle};
pub use position::{Color, PromotionPiece, Square};
pub use protocol::{
    DrawNegotiation, GameOutcome, GameType, GameUpdate, MatchId, MatchSnapshot, MatchStatus,
    MoveIntent, PlayerId,
};
#[cfg(feature = "http-repository")]
pub use repositories::{HttpMatchRepository, HttpRepositoryConfig};
pub use repository::MatchRepository;
pub use session::{
    ActionOutcome, LocalSessionState, MatchSession, MoveSubmission, PushDisposition, SessionConfig,
    SessionEvent, SessionServices,
};
pub use transport::{Connector, Transport};
#[cfg(feature = "transport-websocket")]
pub use transports::{WebSocketConnector, WebSocketTransport};
