//! Board vocabulary and read-only access to the position notation.
//!
//! The match server serializes positions as FEN. This module reads just enough
//! of it for the session to decide whose turn it is and which pieces belong to
//! whom. It does not generate or validate moves; that is the job of a
//! [`LegalMoveOracle`](crate::oracle::LegalMoveOracle).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// FEN of the standard starting position.
pub const STARTING_POSITION: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

/// Side of the board. Player 1 plays white.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    White,
    Black,
}

impl Color {
    /// The other side.
    pub fn opponent(self) -> Self {
        match self {
            Self::White => Self::Black,
            Self::Black => Self::White,
        }
    }

    /// Rank index (0-based) a pawn of this color promotes on.
    fn promotion_rank(self) -> u8 {
        match self {
            Self::White => 7,
            Self::Black => 0,
        }
    }
}

/// Kind of chess piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PieceKind {
    Pawn,
    Knight,
    Bishop,
    Rook,
    Queen,
    King,
}

/// A colored piece on a square.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Piece {
    pub color: Color,
    pub kind: PieceKind,
}

impl Piece {
    fn from_fen_char(c: char) -> Option<Self> {
        let color = if c.is_ascii_uppercase() {
            Color::White
        } else {
            Color::Black
        };
        let kind = match c.to_ascii_lowercase() {
            'p' => PieceKind::Pawn,
            'n' => PieceKind::Knight,
            'b' => PieceKind::Bishop,
            'r' => PieceKind::Rook,
            'q' => PieceKind::Queen,
            'k' => PieceKind::King,
            _ => return None,
        };
        Some(Self { color, kind })
    }
}

/// Piece a pawn may promote to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PromotionPiece {
    #[serde(rename = "q")]
    Queen,
    #[serde(rename = "r")]
    Rook,
    #[serde(rename = "b")]
    Bishop,
    #[serde(rename = "n")]
    Knight,
}

impl PromotionPiece {
    /// Lowercase letter used in compact move notation.
    pub fn as_char(self) -> char {
        match self {
            Self::Queen => 'q',
            Self::Rook => 'r',
            Self::Bishop => 'b',
            Self::Knight => 'n',
        }
    }

    /// Parse the compact-notation letter (either case).
    pub fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_lowercase() {
            'q' => Some(Self::Queen),
            'r' => Some(Self::Rook),
            'b' => Some(Self::Bishop),
            'n' => Some(Self::Knight),
            _ => None,
        }
    }
}

/// A board square such as `e4`.
///
/// ```
/// use rookline_client::position::Square;
///
/// let sq: Square = "e4".parse().unwrap();
/// assert_eq!(sq.to_string(), "e4");
/// assert!("i9".parse::<Square>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Square {
    file: u8,
    rank: u8,
}

impl Square {
    /// Build a square from 0-based file (a = 0) and rank (1 = 0).
    pub fn new(file: u8, rank: u8) -> Option<Self> {
        (file < 8 && rank < 8).then_some(Self { file, rank })
    }

    /// 0-based file index.
    pub fn file(self) -> u8 {
        self.file
    }

    /// 0-based rank index.
    pub fn rank(self) -> u8 {
        self.rank
    }

    fn index(self) -> usize {
        usize::from(self.rank) * 8 + usize::from(self.file)
    }
}

/// Error returned when parsing a malformed square name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid square: {0:?}")]
pub struct InvalidSquare(pub String);

impl FromStr for Square {
    type Err = InvalidSquare;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let (Some(f), Some(r), None) = (chars.next(), chars.next(), chars.next()) else {
            return Err(InvalidSquare(s.to_string()));
        };
        let file = match f {
            'a'..='h' => f as u8 - b'a',
            _ => return Err(InvalidSquare(s.to_string())),
        };
        let rank = match r {
            '1'..='8' => r as u8 - b'1',
            _ => return Err(InvalidSquare(s.to_string())),
        };
        Ok(Self { file, rank })
    }
}

impl TryFrom<String> for Square {
    type Error = InvalidSquare;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Square> for String {
    fn from(value: Square) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Square {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}",
            char::from(b'a' + self.file),
            char::from(b'1' + self.rank)
        )
    }
}

/// Parsed piece placement and side to move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    squares: [Option<Piece>; 64],
    side_to_move: Color,
}

impl Position {
    /// Parse the placement and active-color fields of a FEN string.
    ///
    /// Returns `None` when either field is malformed. Castling, en passant and
    /// move counters are ignored.
    pub fn parse(notation: &str) -> Option<Self> {
        let mut fields = notation.split_whitespace();
        let placement = fields.next()?;
        let side_to_move = match fields.next()? {
            "w" => Color::White,
            "b" => Color::Black,
            _ => return None,
        };

        let mut squares = [None; 64];
        let mut rows = 0u8;
        for (row, text) in placement.split('/').enumerate() {
            let rank = 7u8.checked_sub(u8::try_from(row).ok()?)?;
            let mut file = 0u8;
            for c in text.chars() {
                if let Some(skip) = c.to_digit(10) {
                    file += u8::try_from(skip).ok()?;
                    continue;
                }
                let square = Square::new(file, rank)?;
                *squares.get_mut(square.index())? = Some(Piece::from_fen_char(c)?);
                file += 1;
            }
            if file != 8 {
                return None;
            }
            rows += 1;
        }
        if rows != 8 {
            return None;
        }

        Some(Self {
            squares,
            side_to_move,
        })
    }

    /// Side whose turn it is.
    pub fn side_to_move(&self) -> Color {
        self.side_to_move
    }

    /// Piece on `square`, if any.
    pub fn piece_at(&self, square: Square) -> Option<Piece> {
        self.squares.get(square.index()).copied().flatten()
    }

    /// Whether moving the piece on `from` to `to` is a pawn reaching its last rank.
    pub fn is_promotion(&self, from: Square, to: Square) -> bool {
        match self.piece_at(from) {
            Some(Piece {
                kind: PieceKind::Pawn,
                color,
            }) => to.rank() == color.promotion_rank(),
            _ => false,
        }
    }
}

/// Side to move read from the notation, or `None` if it is malformed.
pub fn side_to_move(notation: &str) -> Option<Color> {
    match notation.split_whitespace().nth(1)? {
        "w" => Some(Color::White),
        "b" => Some(Color::Black),
        _ => None,
    }
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

    fn sq(name: &str) -> Square {
        name.parse().unwrap()
    }

    #[test]
    fn square_parse_and_display() {
        assert_eq!(sq("a1"), Square::new(0, 0).unwrap());
        assert_eq!(sq("h8"), Square::new(7, 7).unwrap());
        assert_eq!(sq("e2").to_string(), "e2");
        for bad in ["", "e", "e9", "z1", "e22", "E2"] {
            assert!(bad.parse::<Square>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn square_serde_uses_name() {
        let json = serde_json::to_string(&sq("g7")).unwrap();
        assert_eq!(json, "\"g7\"");
        let back: Square = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sq("g7"));
        assert!(serde_json::from_str::<Square>("\"k1\"").is_err());
    }

    #[test]
    fn parses_starting_position() {
        let pos = Position::parse(STARTING_POSITION).unwrap();
        assert_eq!(pos.side_to_move(), Color::White);
        assert_eq!(
            pos.piece_at(sq("e2")),
            Some(Piece {
                color: Color::White,
                kind: PieceKind::Pawn
            })
        );
        assert_eq!(
            pos.piece_at(sq("e8")),
            Some(Piece {
                color: Color::Black,
                kind: PieceKind::King
            })
        );
        assert_eq!(pos.piece_at(sq("e4")), None);
    }

    #[test]
    fn rejects_malformed_notation() {
        assert!(Position::parse("").is_none());
        assert!(Position::parse("8/8/8/8/8/8/8/8 x - - 0 1").is_none());
        assert!(Position::parse("8/8/8/8/8/8/8 w - - 0 1").is_none());
        assert!(Position::parse("9/8/8/8/8/8/8/8 w - - 0 1").is_none());
        assert!(Position::parse("8/8/8/8/8/8/8/7X w - - 0 1").is_none());
    }

    #[test]
    fn side_to_move_reads_active_color() {
        assert_eq!(side_to_move(STARTING_POSITION), Some(Color::White));
        assert_eq!(
            side_to_move("rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq - 0 1"),
            Some(Color::Black)
        );
        assert_eq!(side_to_move("garbage"), None);
    }

    #[test]
    fn detects_promotion_moves() {
        let pos = Position::parse("8/4P3/8/8/8/8/3p4/k6K w - - 0 1").unwrap();
        assert!(pos.is_promotion(sq("e7"), sq("e8")));
        assert!(pos.is_promotion(sq("d2"), sq("d1")));
        assert!(!pos.is_promotion(sq("h1"), sq("h2")));
        assert!(!pos.is_promotion(sq("e7"), sq("e6")));
    }

    #[test]
    fn promotion_piece_letters() {
        for piece in [
            PromotionPiece::Queen,
            PromotionPiece::Rook,
            PromotionPiece::Bishop,
            PromotionPiece::Knight,
        ] {
            assert_eq!(PromotionPiece::from_char(piece.as_char()), Some(piece));
        }
        assert_eq!(PromotionPiece::from_char('k'), None);
    }
}
