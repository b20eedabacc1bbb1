//! Rejection codes for actions the match server refused.
//!
//! The match server reports refusals as free-form text (`"Not your turn"`,
//! `"A draw offer is already pending"`, ...). [`RejectionCode::classify`] maps
//! that text onto a closed set of codes so callers can branch on the reason
//! without string matching. Codes serialize as `SCREAMING_SNAKE_CASE`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Structured reason for a refused match action.
///
/// Use [`description()`](RejectionCode::description) for a human-readable explanation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionCode {
    // Turn and lifecycle
    NotYourTurn,
    MatchNotOngoing,

    // Draw negotiation
    DrawOfferPending,
    NoDrawOffer,
    OwnDrawOffer,

    // Moves
    InvalidMove,

    // Access
    Unauthorized,
    NotFound,

    /// Text that matched none of the known refusals.
    Unknown,
}

impl RejectionCode {
    /// Classify a server refusal message.
    ///
    /// Matching is case-insensitive and keyed on the phrases the match server
    /// uses. Anything unrecognised becomes [`RejectionCode::Unknown`].
    ///
    /// ```
    /// use rookline_client::error_codes::RejectionCode;
    ///
    /// assert_eq!(RejectionCode::classify("Not your turn"), RejectionCode::NotYourTurn);
    /// assert_eq!(RejectionCode::classify("boom"), RejectionCode::Unknown);
    /// ```
    pub fn classify(message: &str) -> Self {
        let text = message.to_ascii_lowercase();
        if text.contains("not your turn") {
            Self::NotYourTurn
        } else if text.contains("not ongoing") {
            Self::MatchNotOngoing
        } else if text.contains("already pending") {
            Self::DrawOfferPending
        } else if text.contains("no draw offer") {
            Self::NoDrawOffer
        } else if text.contains("your own draw offer") {
            Self::OwnDrawOffer
        } else if text.contains("invalid move") || text.contains("illegal") {
            Self::InvalidMove
        } else if text.contains("unauthorized") {
            Self::Unauthorized
        } else if text.contains("not found") {
            Self::NotFound
        } else {
            Self::Unknown
        }
    }

    /// Returns a human-readable description of this code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::NotYourTurn => "It is the opponent's turn to move.",
            Self::MatchNotOngoing => {
                "The match has already finished. No further actions are accepted."
            }
            Self::DrawOfferPending => {
                "A draw offer is already pending. Answer it before making a new one."
            }
            Self::NoDrawOffer => "There is no draw offer to answer.",
            Self::OwnDrawOffer => "You cannot accept or decline your own draw offer.",
            Self::InvalidMove => "The move is not legal in the current position.",
            Self::Unauthorized => {
                "Access denied. The session credential is missing, invalid or expired."
            }
            Self::NotFound => "The requested match could not be found.",
            Self::Unknown => "The server refused the action.",
        }
    }
}

impl fmt::Display for RejectionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_server_phrases() {
        let cases = [
            ("Not your turn", RejectionCode::NotYourTurn),
            ("Match is not ongoing", RejectionCode::MatchNotOngoing),
            ("A draw offer is already pending", RejectionCode::DrawOfferPending),
            ("No draw offer pending", RejectionCode::NoDrawOffer),
            (
                "You cannot accept your own draw offer",
                RejectionCode::OwnDrawOffer,
            ),
            ("Invalid move", RejectionCode::InvalidMove),
            ("Unauthorized", RejectionCode::Unauthorized),
            ("Match not found: 7", RejectionCode::NotFound),
        ];
        for (text, expected) in cases {
            assert_eq!(RejectionCode::classify(text), expected, "{text}");
        }
    }

    #[test]
    fn unknown_text_falls_through() {
        assert_eq!(
            RejectionCode::classify("database on fire"),
            RejectionCode::Unknown
        );
    }

    #[test]
    fn serializes_screaming_snake_case() {
        let json = serde_json::to_string(&RejectionCode::DrawOfferPending).ok();
        assert_eq!(json.as_deref(), Some("\"DRAW_OFFER_PENDING\""));
    }
}
