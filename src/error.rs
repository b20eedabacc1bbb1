//! Error types for the Rookline client.

use thiserror::Error;

use crate::error_codes::RejectionCode;
use crate::protocol::MatchId;

/// Errors that can occur when using the Rookline client.
///
/// Local validation failures (`IllegalMove`, `PromotionRequired`, `MovePending`,
/// ...) are raised before any state is touched and are always recoverable.
#[derive(Debug, Error)]
pub enum RooklineError {
    /// The match session could not be opened.
    #[error("failed to load match {match_id}: {reason}")]
    Load {
        /// Match that was requested.
        match_id: MatchId,
        /// Why the initial snapshot could not be fetched.
        reason: String,
    },

    /// The rules engine rejected the move.
    #[error("illegal move: {0}")]
    IllegalMove(String),

    /// The move reaches the last rank and needs a promotion piece.
    #[error("promotion piece required")]
    PromotionRequired,

    /// A previous move is still waiting for confirmation.
    #[error("a move is already pending confirmation")]
    MovePending,

    /// A move was attempted from a square that is not the current selection.
    #[error("no piece selected on the origin square")]
    NoSelection,

    /// It is the opponent's turn.
    #[error("not your turn")]
    NotYourTurn,

    /// The match has finished.
    #[error("match is not ongoing")]
    MatchNotOngoing,

    /// The local identity is not one of the two players.
    #[error("local player is not a participant of this match")]
    NotAParticipant,

    /// There is no draw offer to answer.
    #[error("no draw offer pending")]
    NoDrawOffer,

    /// The pending draw offer was made by the local player.
    #[error("cannot answer your own draw offer")]
    OwnDrawOffer,

    /// The server refused an action.
    #[error("action rejected: {message}")]
    ActionRejected {
        /// Classified reason.
        code: RejectionCode,
        /// Raw server text.
        message: String,
    },

    /// The requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The credential is missing or was rejected.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Attempted an operation that requires a live channel.
    #[error("not connected to server")]
    NotConnected,

    /// Failed to send a message through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a message from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed unexpectedly.
    #[error("transport connection closed")]
    TransportClosed,

    /// The operation is not valid in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Failed to serialize or deserialize a protocol message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An HTTP request failed below the protocol level.
    #[cfg(feature = "http-repository")]
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl RooklineError {
    /// Returns `true` for credential failures, which are never retried.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
            || matches!(
                self,
                Self::ActionRejected {
                    code: RejectionCode::Unauthorized,
                    ..
                }
            )
    }

    /// Build an [`ActionRejected`](Self::ActionRejected) from raw server text.
    pub fn rejected(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::ActionRejected {
            code: RejectionCode::classify(&message),
            message,
        }
    }
}

/// A specialized [`Result`] type for Rookline client operations.
pub type Result<T> = std::result::Result<T, RooklineError>;
