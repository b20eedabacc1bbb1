//! Rules-engine seam.
//!
//! The session never decides legality itself. It asks a [`LegalMoveOracle`]
//! for the targets of a selected square and for a verdict on a move before
//! dispatching it. The server remains the authority; the oracle only filters
//! obviously illegal input.
//!
//! With the `rules-chess` feature enabled, [`ChessRulesOracle`] implements the
//! trait on top of the `chess` crate.

use crate::error::{Result, RooklineError};
use crate::position::{Position, Square};
use crate::protocol::MoveIntent;

/// Terminal condition reached by an applied move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    Checkmate,
    Stalemate,
}

/// Result of applying a legal move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMove {
    /// Position notation after the move.
    pub position: String,
    /// Set when the move ends the game.
    pub terminal: Option<TerminalState>,
}

/// Legality queries against a position given in FEN.
///
/// Implementations must be cheap enough to call from inside the session's
/// state lock; they are synchronous and must not block.
pub trait LegalMoveOracle: Send + Sync + 'static {
    /// Squares the piece on `square` may legally move to.
    ///
    /// Returns an empty list for empty squares or unparsable positions.
    fn legal_targets(&self, position: &str, square: Square) -> Vec<Square>;

    /// Apply `intent` to `position`.
    ///
    /// # Errors
    ///
    /// Returns [`RooklineError::IllegalMove`] if the move is not legal.
    fn apply(&self, position: &str, intent: &MoveIntent) -> Result<AppliedMove>;

    /// Whether moving `from` → `to` is a pawn reaching its last rank.
    fn requires_promotion(&self, position: &str, from: Square, to: Square) -> bool {
        Position::parse(position).is_some_and(|pos| pos.is_promotion(from, to))
    }
}

#[cfg(feature = "rules-chess")]
pub use self::chess_rules::ChessRulesOracle;

#[cfg(feature = "rules-chess")]
mod chess_rules {
    use std::str::FromStr;

    use chess::{Board, BoardStatus, ChessMove, File, MoveGen, Rank};

    use super::{AppliedMove, LegalMoveOracle, TerminalState};
    use crate::error::{Result, RooklineError};
    use crate::position::{PromotionPiece, Square};
    use crate::protocol::MoveIntent;

    /// [`LegalMoveOracle`] backed by the `chess` crate's move generator.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct ChessRulesOracle;

    impl ChessRulesOracle {
        pub fn new() -> Self {
            Self
        }
    }

    fn to_engine(square: Square) -> chess::Square {
        chess::Square::make_square(
            Rank::from_index(usize::from(square.rank())),
            File::from_index(usize::from(square.file())),
        )
    }

    fn from_engine(square: chess::Square) -> Option<Square> {
        let file = u8::try_from(square.get_file().to_index()).ok()?;
        let rank = u8::try_from(square.get_rank().to_index()).ok()?;
        Square::new(file, rank)
    }

    fn promotion_piece(piece: PromotionPiece) -> chess::Piece {
        match piece {
            PromotionPiece::Queen => chess::Piece::Queen,
            PromotionPiece::Rook => chess::Piece::Rook,
            PromotionPiece::Bishop => chess::Piece::Bishop,
            PromotionPiece::Knight => chess::Piece::Knight,
        }
    }

    impl LegalMoveOracle for ChessRulesOracle {
        fn legal_targets(&self, position: &str, square: Square) -> Vec<Square> {
            let Ok(board) = Board::from_str(position) else {
                return Vec::new();
            };
            let origin = to_engine(square);
            let mut targets: Vec<Square> = MoveGen::new_legal(&board)
                .filter(|mv| mv.get_source() == origin)
                .filter_map(|mv| from_engine(mv.get_dest()))
                .collect();
            // Promotions yield one move per piece.
            targets.sort();
            targets.dedup();
            targets
        }

        fn apply(&self, position: &str, intent: &MoveIntent) -> Result<AppliedMove> {
            let board = Board::from_str(position)
                .map_err(|e| RooklineError::IllegalMove(format!("unreadable position: {e}")))?;
            let mv = ChessMove::new(
                to_engine(intent.from),
                to_engine(intent.to),
                intent.promotion.map(promotion_piece),
            );
            if !board.legal(mv) {
                return Err(RooklineError::IllegalMove(intent.to_uci()));
            }
            let next = board.make_move_new(mv);
            let terminal = match next.status() {
                BoardStatus::Ongoing => None,
                BoardStatus::Checkmate => Some(TerminalState::Checkmate),
                BoardStatus::Stalemate => Some(TerminalState::Stalemate),
            };
            Ok(AppliedMove {
                position: next.to_string(),
                terminal,
            })
        }
    }

    #[cfg(test)]
    #[allow(clippy::unwrap_used, clippy::expect_used)]
    mod tests {
        use super::*;
        use crate::position::STARTING_POSITION;

        fn sq(name: &str) -> Square {
            name.parse().unwrap()
        }

        #[test]
        fn pawn_targets_from_start() {
            let targets = ChessRulesOracle.legal_targets(STARTING_POSITION, sq("e2"));
            assert_eq!(targets, vec![sq("e3"), sq("e4")]);
        }

        #[test]
        fn empty_square_has_no_targets() {
            assert!(ChessRulesOracle
                .legal_targets(STARTING_POSITION, sq("e4"))
                .is_empty());
        }

        #[test]
        fn rejects_illegal_move() {
            let intent = MoveIntent::from_uci("e2e5").unwrap();
            assert!(matches!(
                ChessRulesOracle.apply(STARTING_POSITION, &intent),
                Err(RooklineError::IllegalMove(_))
            ));
        }

        #[test]
        fn detects_mate() {
            // Fool's mate, black to deliver.
            let fen = "rnbqkbnr/pppp1ppp/8/4p3/6P1/5P2/PPPPP2P/RNBQKBNR b KQkq - 0 2";
            let intent = MoveIntent::from_uci("d8h4").unwrap();
            let applied = ChessRulesOracle.apply(fen, &intent).unwrap();
            assert_eq!(applied.terminal, Some(TerminalState::Checkmate));
        }
    }
}

/// Oracle that accepts any move of a piece belonging to the side to move.
///
/// Useful for spectator tooling and demos where no rules engine is linked.
/// It never reports a terminal state and does not update the position.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissiveOracle;

impl LegalMoveOracle for PermissiveOracle {
    fn legal_targets(&self, position: &str, square: Square) -> Vec<Square> {
        let Some(pos) = Position::parse(position) else {
            return Vec::new();
        };
        let Some(piece) = pos.piece_at(square) else {
            return Vec::new();
        };
        if piece.color != pos.side_to_move() {
            return Vec::new();
        }
        (0..8u8)
            .flat_map(|rank| (0..8u8).filter_map(move |file| Square::new(file, rank)))
            .filter(|&target| {
                target != square
                    && pos
                        .piece_at(target)
                        .is_none_or(|other| other.color != piece.color)
            })
            .collect()
    }

    fn apply(&self, position: &str, intent: &MoveIntent) -> Result<AppliedMove> {
        if !self.legal_targets(position, intent.from).contains(&intent.to) {
            return Err(RooklineError::IllegalMove(intent.to_uci()));
        }
        Ok(AppliedMove {
            position: position.to_string(),
            terminal: None,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::position::STARTING_POSITION;

    fn sq(name: &str) -> Square {
        name.parse().unwrap()
    }

    #[test]
    fn permissive_oracle_respects_ownership() {
        let oracle = PermissiveOracle;
        let targets = oracle.legal_targets(STARTING_POSITION, sq("e2"));
        assert!(targets.contains(&sq("e4")));
        assert!(targets.contains(&sq("e7")));
        assert!(!targets.contains(&sq("d2")));
        assert!(oracle.legal_targets(STARTING_POSITION, sq("e7")).is_empty());
    }

    #[test]
    fn permissive_oracle_rejects_own_capture() {
        let intent = MoveIntent::from_uci("e1e2").unwrap();
        assert!(PermissiveOracle.apply(STARTING_POSITION, &intent).is_err());
    }

    #[test]
    fn default_promotion_check_reads_position() {
        let fen = "8/4P3/8/8/8/8/8/k6K w - - 0 1";
        assert!(PermissiveOracle.requires_promotion(fen, sq("e7"), sq("e8")));
        assert!(!PermissiveOracle.requires_promotion(fen, sq("h1"), sq("h2")));
        assert!(!PermissiveOracle.requires_promotion("garbage", sq("e7"), sq("e8")));
    }
}
