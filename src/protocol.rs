//! Wire-compatible types for the match server.
//!
//! Every type in this module produces the JSON the match server speaks on its
//! REST endpoints and push topics. Key adaptations:
//!
//! - Java `Long` ids → `u64`
//! - `LocalDateTime` → `String` (ISO 8601); parsed on demand by [`crate::clock`]
//! - Push bodies are validated into the closed [`GameUpdate`] enum at the boundary

use serde::{Deserialize, Serialize};

use crate::position::{Color, PromotionPiece, Square};

// ── Type aliases ────────────────────────────────────────────────────

/// Unique identifier for matches.
pub type MatchId = u64;

/// Unique identifier for players.
pub type PlayerId = u64;

// ── Enums ───────────────────────────────────────────────────────────

/// Time-control family of a match.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameType {
    /// 30 minutes, no increment.
    Classical,
    /// 10 minutes, no increment.
    Rapid,
    /// 3 minutes plus 2 seconds per move.
    Blitz,
    /// 1 minute plus 1 second per move.
    Bullet,
}

impl GameType {
    /// Clock settings for this game type.
    pub fn time_control(self) -> TimeControl {
        let (initial_seconds, increment_seconds) = match self {
            Self::Classical => (1800, 0),
            Self::Rapid => (600, 0),
            Self::Blitz => (180, 2),
            Self::Bullet => (60, 1),
        };
        TimeControl {
            initial_seconds,
            increment_seconds,
        }
    }

    /// Wire name, as used in query strings.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Classical => "CLASSICAL",
            Self::Rapid => "RAPID",
            Self::Blitz => "BLITZ",
            Self::Bullet => "BULLET",
        }
    }
}

/// Initial clock and per-move increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeControl {
    pub initial_seconds: u32,
    pub increment_seconds: u32,
}

/// Lifecycle status of a match.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MatchStatus {
    #[serde(rename = "ONGOING")]
    Ongoing,
    #[serde(rename = "PLAYER1_WON")]
    Player1Won,
    #[serde(rename = "PLAYER2_WON")]
    Player2Won,
    #[serde(rename = "DRAW")]
    Draw,
    #[serde(rename = "ABANDONED")]
    Abandoned,
}

impl MatchStatus {
    /// `true` once the match can no longer change.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Ongoing)
    }
}

/// State of draw negotiation, derived from `drawOfferedByPlayerId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawNegotiation {
    None,
    OfferedByMe,
    OfferedByOpponent,
}

/// How a finished match ended, from the local player's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameOutcome {
    Won,
    Lost,
    Drawn,
    Abandoned,
    /// Result seen by a non-participant.
    WhiteWon,
    /// Result seen by a non-participant.
    BlackWon,
}

// ── Structs ─────────────────────────────────────────────────────────

/// Complete server-confirmed match record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchSnapshot {
    pub id: MatchId,
    pub player1_id: PlayerId,
    pub player2_id: PlayerId,
    pub game_type: GameType,
    pub status: MatchStatus,
    /// Current position in FEN.
    #[serde(rename = "fenCurrent")]
    pub position_notation: String,
    /// Last move in compact (UCI) form.
    #[serde(rename = "lastMoveUci", default, skip_serializing_if = "Option::is_none")]
    pub last_move_notation: Option<String>,
    /// `None` means the game type's initial time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player1_time_left_seconds: Option<u32>,
    /// `None` means the game type's initial time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player2_time_left_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_move_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draw_offered_by_player_id: Option<PlayerId>,
    #[serde(default)]
    pub current_ply: u32,
}

impl MatchSnapshot {
    /// `true` while moves and offers are still accepted.
    pub fn is_ongoing(&self) -> bool {
        self.status == MatchStatus::Ongoing
    }

    /// Color played by `player`, or `None` for a non-participant.
    pub fn color_of(&self, player: PlayerId) -> Option<Color> {
        if player == self.player1_id {
            Some(Color::White)
        } else if player == self.player2_id {
            Some(Color::Black)
        } else {
            None
        }
    }

    /// Player holding `color`.
    pub fn player_for(&self, color: Color) -> PlayerId {
        match color {
            Color::White => self.player1_id,
            Color::Black => self.player2_id,
        }
    }

    /// Stored remaining time for `color`, defaulting to the initial time.
    pub fn stored_time_left(&self, color: Color) -> u32 {
        let stored = match color {
            Color::White => self.player1_time_left_seconds,
            Color::Black => self.player2_time_left_seconds,
        };
        stored.unwrap_or_else(|| self.game_type.time_control().initial_seconds)
    }

    /// Draw negotiation state relative to `me`.
    pub fn draw_negotiation(&self, me: PlayerId) -> DrawNegotiation {
        match self.draw_offered_by_player_id {
            None => DrawNegotiation::None,
            Some(by) if by == me => DrawNegotiation::OfferedByMe,
            Some(_) => DrawNegotiation::OfferedByOpponent,
        }
    }

    /// Outcome relative to `me`, or `None` while the match is ongoing.
    pub fn outcome_for(&self, me: PlayerId) -> Option<GameOutcome> {
        let winner = match self.status {
            MatchStatus::Ongoing => return None,
            MatchStatus::Draw => return Some(GameOutcome::Drawn),
            MatchStatus::Abandoned => return Some(GameOutcome::Abandoned),
            MatchStatus::Player1Won => Color::White,
            MatchStatus::Player2Won => Color::Black,
        };
        Some(match self.color_of(me) {
            Some(mine) if mine == winner => GameOutcome::Won,
            Some(_) => GameOutcome::Lost,
            None if winner == Color::White => GameOutcome::WhiteWon,
            None => GameOutcome::BlackWon,
        })
    }
}

/// A move as requested by the local player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MoveIntent {
    pub from: Square,
    pub to: Square,
    pub promotion: Option<PromotionPiece>,
}

impl MoveIntent {
    pub fn new(from: Square, to: Square, promotion: Option<PromotionPiece>) -> Self {
        Self {
            from,
            to,
            promotion,
        }
    }

    /// Compact (UCI) notation, e.g. `e7e8q`.
    pub fn to_uci(&self) -> String {
        let mut uci = format!("{}{}", self.from, self.to);
        if let Some(piece) = self.promotion {
            uci.push(piece.as_char());
        }
        uci
    }

    /// Parse compact (UCI) notation.
    pub fn from_uci(uci: &str) -> Option<Self> {
        let from = uci.get(0..2)?.parse().ok()?;
        let to = uci.get(2..4)?.parse().ok()?;
        let promotion = match uci.get(4..)? {
            "" => None,
            rest => {
                let mut chars = rest.chars();
                let piece = PromotionPiece::from_char(chars.next()?)?;
                if chars.next().is_some() {
                    return None;
                }
                Some(piece)
            }
        };
        Some(Self {
            from,
            to,
            promotion,
        })
    }
}

/// Body of a move submission, for both publish and REST.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveCommand {
    pub move_uci: String,
}

impl From<&MoveIntent> for MoveCommand {
    fn from(intent: &MoveIntent) -> Self {
        Self {
            move_uci: intent.to_uci(),
        }
    }
}

/// Body of a direct match creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMatchRequest {
    pub player2_id: PlayerId,
    pub game_type: GameType,
}

/// One entry of a match's move history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveRecord {
    pub ply: u32,
    pub move_notation: String,
    pub from_square: Square,
    pub to_square: Square,
    pub fen_after: String,
    #[serde(default)]
    pub check: bool,
    #[serde(default)]
    pub checkmate: bool,
}

/// Result of joining the matchmaking queue over REST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueJoin {
    /// The server paired the player synchronously.
    Matched(Box<MatchSnapshot>),
    /// The player is waiting; a push will follow.
    Pending,
}

// ── Push messages ───────────────────────────────────────────────────

/// Raw push envelope as delivered on game and matchmaking topics.
///
/// Only used at the ingestion boundary; everything past it works with
/// [`GameUpdate`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<MatchSnapshot>,
    #[serde(default, alias = "moveNotation", skip_serializing_if = "Option::is_none")]
    pub move_uci: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resigned_player_id: Option<PlayerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Discriminant of a [`GameUpdate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushKind {
    MoveMade,
    Resigned,
    Draw,
    DrawOffered,
    DrawDeclined,
    Error,
}

impl PushKind {
    /// Parse the envelope's `type` field.
    pub fn from_wire(kind: &str) -> Option<Self> {
        Some(match kind {
            "MOVE_MADE" => Self::MoveMade,
            "RESIGNED" => Self::Resigned,
            "DRAW" => Self::Draw,
            "DRAW_OFFERED" => Self::DrawOffered,
            "DRAW_DECLINED" => Self::DrawDeclined,
            "ERROR" => Self::Error,
            _ => return None,
        })
    }

    /// Wire name of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MoveMade => "MOVE_MADE",
            Self::Resigned => "RESIGNED",
            Self::Draw => "DRAW",
            Self::DrawOffered => "DRAW_OFFERED",
            Self::DrawDeclined => "DRAW_DECLINED",
            Self::Error => "ERROR",
        }
    }

    /// Kinds that only change draw negotiation state.
    pub fn is_draw_negotiation(self) -> bool {
        matches!(self, Self::Draw | Self::DrawOffered | Self::DrawDeclined)
    }
}

/// Why a push body was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidPush {
    #[error("malformed push body: {0}")]
    Malformed(String),
    #[error("unknown push type {0:?}")]
    UnknownKind(String),
    #[error("{} push without a match snapshot", .0.as_str())]
    MissingSnapshot(PushKind),
}

/// A validated game-topic push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameUpdate {
    MoveMade {
        snapshot: Box<MatchSnapshot>,
        move_notation: Option<String>,
    },
    Resigned {
        snapshot: Box<MatchSnapshot>,
        resigned_player_id: Option<PlayerId>,
    },
    Draw {
        snapshot: Box<MatchSnapshot>,
    },
    DrawOffered {
        snapshot: Box<MatchSnapshot>,
    },
    DrawDeclined {
        snapshot: Box<MatchSnapshot>,
    },
    Error {
        message: String,
    },
}

impl GameUpdate {
    /// Validate a JSON push body.
    pub fn from_value(value: serde_json::Value) -> Result<Self, InvalidPush> {
        let envelope: PushEnvelope =
            serde_json::from_value(value).map_err(|e| InvalidPush::Malformed(e.to_string()))?;
        Self::try_from(envelope)
    }

    /// Validate a JSON push body given as text.
    pub fn from_json(text: &str) -> Result<Self, InvalidPush> {
        let envelope: PushEnvelope =
            serde_json::from_str(text).map_err(|e| InvalidPush::Malformed(e.to_string()))?;
        Self::try_from(envelope)
    }

    pub fn kind(&self) -> PushKind {
        match self {
            Self::MoveMade { .. } => PushKind::MoveMade,
            Self::Resigned { .. } => PushKind::Resigned,
            Self::Draw { .. } => PushKind::Draw,
            Self::DrawOffered { .. } => PushKind::DrawOffered,
            Self::DrawDeclined { .. } => PushKind::DrawDeclined,
            Self::Error { .. } => PushKind::Error,
        }
    }

    /// The carried snapshot, for every kind except `Error`.
    pub fn snapshot(&self) -> Option<&MatchSnapshot> {
        match self {
            Self::MoveMade { snapshot, .. }
            | Self::Resigned { snapshot, .. }
            | Self::Draw { snapshot }
            | Self::DrawOffered { snapshot }
            | Self::DrawDeclined { snapshot } => Some(snapshot),
            Self::Error { .. } => None,
        }
    }
}

impl TryFrom<PushEnvelope> for GameUpdate {
    type Error = InvalidPush;

    fn try_from(envelope: PushEnvelope) -> Result<Self, InvalidPush> {
        let kind =
            PushKind::from_wire(&envelope.kind).ok_or(InvalidPush::UnknownKind(envelope.kind))?;
        if kind == PushKind::Error {
            return Ok(GameUpdate::Error {
                message: envelope
                    .error
                    .unwrap_or_else(|| "unspecified server error".to_string()),
            });
        }
        let snapshot = Box::new(envelope.snapshot.ok_or(InvalidPush::MissingSnapshot(kind))?);
        Ok(match kind {
            PushKind::MoveMade => Self::MoveMade {
                snapshot,
                move_notation: envelope.move_uci,
            },
            PushKind::Resigned => Self::Resigned {
                snapshot,
                resigned_player_id: envelope.resigned_player_id,
            },
            PushKind::Draw => Self::Draw { snapshot },
            PushKind::DrawOffered => Self::DrawOffered { snapshot },
            PushKind::DrawDeclined | PushKind::Error => Self::DrawDeclined { snapshot },
        })
    }
}

// ── Topics and destinations ─────────────────────────────────────────

/// Topic carrying game updates for one match.
pub fn game_topic(match_id: MatchId) -> String {
    format!("/topic/game/{match_id}")
}

/// Topic carrying pairing notifications for one player.
pub fn matchmaking_topic(player_id: PlayerId) -> String {
    format!("/topic/matchmaking/{player_id}")
}

/// A mutating match action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GameAction {
    Move,
    Resign,
    OfferDraw,
    AcceptDraw,
    DeclineDraw,
}

impl GameAction {
    /// Path suffix shared by the publish destination and the REST endpoint.
    pub fn path(self) -> &'static str {
        match self {
            Self::Move => "move",
            Self::Resign => "resign",
            Self::OfferDraw => "draw",
            Self::AcceptDraw => "draw/accept",
            Self::DeclineDraw => "draw/decline",
        }
    }

    /// Publish destination for this action on `match_id`.
    pub fn destination(self, match_id: MatchId) -> String {
        format!("/app/game/{match_id}/{}", self.path())
    }
}

// ── Channel frames ──────────────────────────────────────────────────

/// Frames sent from client to server over a [`Transport`](crate::Transport).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Start receiving messages for `topic`.
    Subscribe { id: String, topic: String },
    /// Stop the subscription `id`.
    Unsubscribe { id: String },
    /// Deliver `body` to an application destination.
    Publish {
        destination: String,
        body: serde_json::Value,
    },
}

/// Frames sent from server to client over a [`Transport`](crate::Transport).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerFrame {
    /// A message published on a subscribed topic.
    Message {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subscription: Option<String>,
        topic: String,
        body: serde_json::Value,
    },
    /// Channel-level error reported by the broker.
    Error { message: String },
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot_json() -> serde_json::Value {
        json!({
            "id": 9,
            "player1Id": 1,
            "player2Id": 2,
            "status": "ONGOING",
            "currentPly": 0,
            "fenCurrent": crate::position::STARTING_POSITION,
            "lastMoveUci": null,
            "gameType": "RAPID",
            "startedAt": "2026-03-01T10:00:00",
            "finishedAt": null,
            "createdAt": "2026-03-01T10:00:00",
            "drawOfferedByPlayerId": null,
            "player1TimeLeftSeconds": 600,
            "player2TimeLeftSeconds": 600,
            "lastMoveAt": null
        })
    }

    #[test]
    fn snapshot_parses_server_json() {
        let snap: MatchSnapshot = serde_json::from_value(snapshot_json()).unwrap();
        assert_eq!(snap.id, 9);
        assert_eq!(snap.game_type, GameType::Rapid);
        assert_eq!(snap.status, MatchStatus::Ongoing);
        assert_eq!(snap.position_notation, crate::position::STARTING_POSITION);
        assert_eq!(snap.last_move_notation, None);
        assert_eq!(snap.player1_time_left_seconds, Some(600));
        assert_eq!(snap.started_at.as_deref(), Some("2026-03-01T10:00:00"));
    }

    #[test]
    fn snapshot_tolerates_missing_optional_fields() {
        let snap: MatchSnapshot = serde_json::from_value(json!({
            "id": 1, "player1Id": 1, "player2Id": 2, "gameType": "BULLET",
            "status": "PLAYER2_WON", "fenCurrent": "8/8/8/8/8/8/8/8 w - - 0 1"
        }))
        .unwrap();
        assert_eq!(snap.current_ply, 0);
        assert_eq!(snap.stored_time_left(Color::White), 60);
        assert_eq!(snap.status, MatchStatus::Player2Won);
    }

    #[test]
    fn status_wire_names() {
        for (status, wire) in [
            (MatchStatus::Ongoing, "ONGOING"),
            (MatchStatus::Player1Won, "PLAYER1_WON"),
            (MatchStatus::Player2Won, "PLAYER2_WON"),
            (MatchStatus::Draw, "DRAW"),
            (MatchStatus::Abandoned, "ABANDONED"),
        ] {
            assert_eq!(serde_json::to_value(status).unwrap(), json!(wire));
        }
    }

    #[test]
    fn time_controls_per_game_type() {
        assert_eq!(GameType::Classical.time_control().initial_seconds, 1800);
        assert_eq!(GameType::Rapid.time_control().increment_seconds, 0);
        assert_eq!(
            GameType::Blitz.time_control(),
            TimeControl {
                initial_seconds: 180,
                increment_seconds: 2
            }
        );
        assert_eq!(GameType::Bullet.as_str(), "BULLET");
    }

    #[test]
    fn draw_negotiation_and_outcome_are_relative() {
        let mut snap: MatchSnapshot = serde_json::from_value(snapshot_json()).unwrap();
        assert_eq!(snap.draw_negotiation(1), DrawNegotiation::None);
        snap.draw_offered_by_player_id = Some(2);
        assert_eq!(snap.draw_negotiation(1), DrawNegotiation::OfferedByOpponent);
        assert_eq!(snap.draw_negotiation(2), DrawNegotiation::OfferedByMe);

        assert_eq!(snap.outcome_for(1), None);
        snap.status = MatchStatus::Player2Won;
        assert_eq!(snap.outcome_for(1), Some(GameOutcome::Lost));
        assert_eq!(snap.outcome_for(2), Some(GameOutcome::Won));
        assert_eq!(snap.outcome_for(77), Some(GameOutcome::BlackWon));
        snap.status = MatchStatus::Draw;
        assert_eq!(snap.outcome_for(1), Some(GameOutcome::Drawn));
    }

    #[test]
    fn move_intent_uci() {
        let plain = MoveIntent::from_uci("e2e4").unwrap();
        assert_eq!(plain.promotion, None);
        assert_eq!(plain.to_uci(), "e2e4");

        let promo = MoveIntent::from_uci("e7e8q").unwrap();
        assert_eq!(promo.promotion, Some(PromotionPiece::Queen));
        assert_eq!(promo.to_uci(), "e7e8q");

        for bad in ["", "e2", "e2e9", "e7e8k", "e7e8qq"] {
            assert!(MoveIntent::from_uci(bad).is_none(), "{bad}");
        }
    }

    #[test]
    fn move_command_is_camel_case() {
        let intent = MoveIntent::from_uci("g1f3").unwrap();
        let body = serde_json::to_value(MoveCommand::from(&intent)).unwrap();
        assert_eq!(body, json!({ "moveUci": "g1f3" }));
    }

    #[test]
    fn push_move_made_validates() {
        let body = json!({ "type": "MOVE_MADE", "match": snapshot_json(), "moveUci": "e2e4" });
        let update = GameUpdate::from_value(body).unwrap();
        assert_eq!(update.kind(), PushKind::MoveMade);
        assert_eq!(update.snapshot().map(|s| s.id), Some(9));
        if let GameUpdate::MoveMade { move_notation, .. } = update {
            assert_eq!(move_notation.as_deref(), Some("e2e4"));
        } else {
            panic!("expected MoveMade");
        }
    }

    #[test]
    fn push_accepts_move_notation_alias() {
        let body = json!({ "type": "MOVE_MADE", "match": snapshot_json(), "moveNotation": "d2d4" });
        let update = GameUpdate::from_value(body).unwrap();
        assert!(matches!(
            update,
            GameUpdate::MoveMade { move_notation: Some(ref m), .. } if m == "d2d4"
        ));
    }

    #[test]
    fn push_error_needs_no_snapshot() {
        let update = GameUpdate::from_json(r#"{"type":"ERROR","error":"Not your turn"}"#).unwrap();
        assert_eq!(
            update,
            GameUpdate::Error {
                message: "Not your turn".into()
            }
        );
        assert!(update.snapshot().is_none());
    }

    #[test]
    fn push_rejects_unknown_and_incomplete_bodies() {
        assert_eq!(
            GameUpdate::from_json(r#"{"type":"CHAT"}"#),
            Err(InvalidPush::UnknownKind("CHAT".into()))
        );
        assert_eq!(
            GameUpdate::from_json(r#"{"type":"RESIGNED"}"#),
            Err(InvalidPush::MissingSnapshot(PushKind::Resigned))
        );
        assert!(matches!(
            GameUpdate::from_json("not json"),
            Err(InvalidPush::Malformed(_))
        ));
    }

    #[test]
    fn destinations_and_topics() {
        assert_eq!(game_topic(5), "/topic/game/5");
        assert_eq!(matchmaking_topic(8), "/topic/matchmaking/8");
        assert_eq!(GameAction::Move.destination(5), "/app/game/5/move");
        assert_eq!(GameAction::AcceptDraw.destination(5), "/app/game/5/draw/accept");
        assert_eq!(GameAction::DeclineDraw.path(), "draw/decline");
    }

    #[test]
    fn frames_are_op_tagged() {
        let frame = ClientFrame::Subscribe {
            id: "s1".into(),
            topic: "/topic/game/1".into(),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({ "op": "subscribe", "id": "s1", "topic": "/topic/game/1" })
        );
        let incoming: ServerFrame =
            serde_json::from_str(r#"{"op":"message","topic":"/t","body":{"id":42}}"#).unwrap();
        assert_eq!(
            incoming,
            ServerFrame::Message {
                subscription: None,
                topic: "/t".into(),
                body: json!({ "id": 42 }),
            }
        );
    }
}
