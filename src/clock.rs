//! Live clock estimation from discrete snapshots.
//!
//! The server stores each side's remaining time as of the last move. Between
//! snapshots the side to move keeps losing time, so the displayed clock is
//! re-derived on every tick from the snapshot and the current wall-clock time.

use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, Utc};

use crate::position::{self, Color};
use crate::protocol::MatchSnapshot;

/// Remaining time per side, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockReading {
    pub white_millis: u64,
    pub black_millis: u64,
}

impl ClockReading {
    /// Whole seconds left for white (floored).
    pub fn white_seconds(&self) -> u64 {
        self.white_millis / 1000
    }

    /// Whole seconds left for black (floored).
    pub fn black_seconds(&self) -> u64 {
        self.black_millis / 1000
    }

    /// Milliseconds left for `color`.
    pub fn millis_for(&self, color: Color) -> u64 {
        match color {
            Color::White => self.white_millis,
            Color::Black => self.black_millis,
        }
    }
}

/// Estimate both clocks at `now_millis` (Unix epoch milliseconds).
///
/// Finished matches report stored values verbatim. For ongoing matches the
/// time elapsed since `lastMoveAt` (or `startedAt`, or `session_start_millis`
/// when neither is present or readable) is subtracted from the side to move
/// only, floored at zero.
///
/// Timestamps without an offset are read as UTC. Use [`estimate_in`] when the
/// server writes local date-times in another zone.
///
/// ```
/// use rookline_client::clock::estimate;
/// # use rookline_client::protocol::{GameType, MatchSnapshot, MatchStatus};
/// # let snapshot = MatchSnapshot {
/// #     id: 1, player1_id: 1, player2_id: 2, game_type: GameType::Blitz,
/// #     status: MatchStatus::Ongoing,
/// #     position_notation: rookline_client::position::STARTING_POSITION.into(),
/// #     last_move_notation: None, player1_time_left_seconds: Some(180),
/// #     player2_time_left_seconds: Some(180), last_move_at: None, started_at: None,
/// #     created_at: None, finished_at: None, draw_offered_by_player_id: None,
/// #     current_ply: 0,
/// # };
/// // White to move, 5 seconds since the session started.
/// let reading = estimate(&snapshot, 5_000, 0);
/// assert_eq!(reading.white_seconds(), 175);
/// assert_eq!(reading.black_seconds(), 180);
/// ```
pub fn estimate(snapshot: &MatchSnapshot, now_millis: u64, session_start_millis: u64) -> ClockReading {
    estimate_in(snapshot, now_millis, session_start_millis, Utc.fix())
}

/// [`estimate`] with offset-less timestamps read in `server_offset`.
pub fn estimate_in(
    snapshot: &MatchSnapshot,
    now_millis: u64,
    session_start_millis: u64,
    server_offset: FixedOffset,
) -> ClockReading {
    let stored = ClockReading {
        white_millis: u64::from(snapshot.stored_time_left(Color::White)) * 1000,
        black_millis: u64::from(snapshot.stored_time_left(Color::Black)) * 1000,
    };
    if !snapshot.is_ongoing() {
        return stored;
    }
    let Some(to_move) = position::side_to_move(&snapshot.position_notation) else {
        return stored;
    };

    let reference = snapshot
        .last_move_at
        .as_deref()
        .or(snapshot.started_at.as_deref())
        .and_then(|text| parse_timestamp_millis_in(text, server_offset))
        .unwrap_or(session_start_millis);
    let elapsed = now_millis.saturating_sub(reference);

    match to_move {
        Color::White => ClockReading {
            white_millis: stored.white_millis.saturating_sub(elapsed),
            ..stored
        },
        Color::Black => ClockReading {
            black_millis: stored.black_millis.saturating_sub(elapsed),
            ..stored
        },
    }
}

/// Current wall-clock time in Unix epoch milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Parse an ISO-8601 timestamp into Unix epoch milliseconds.
///
/// Accepts RFC 3339 (with offset) and offset-less local date-times, which are
/// read as UTC. Returns `None` for anything else or for pre-epoch instants.
pub fn parse_timestamp_millis(text: &str) -> Option<u64> {
    parse_timestamp_millis_in(text, Utc.fix())
}

/// Like [`parse_timestamp_millis`], but offset-less date-times are local to
/// `server_offset`. Explicit offsets in `text` always win.
pub fn parse_timestamp_millis_in(text: &str, server_offset: FixedOffset) -> Option<u64> {
    let millis = match DateTime::parse_from_rfc3339(text) {
        Ok(dt) => dt.timestamp_millis(),
        Err(_) => NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()?
            .and_local_timezone(server_offset)
            .single()?
            .timestamp_millis(),
    };
    u64::try_from(millis).ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::position::STARTING_POSITION;
    use crate::protocol::{GameType, MatchStatus};

    const BLACK_TO_MOVE: &str = "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq - 0 1";

    fn snapshot() -> MatchSnapshot {
        MatchSnapshot {
            id: 1,
            player1_id: 10,
            player2_id: 20,
            game_type: GameType::Rapid,
            status: MatchStatus::Ongoing,
            position_notation: STARTING_POSITION.to_string(),
            last_move_notation: None,
            player1_time_left_seconds: Some(600),
            player2_time_left_seconds: Some(590),
            last_move_at: None,
            started_at: None,
            created_at: None,
            finished_at: None,
            draw_offered_by_player_id: None,
            current_ply: 0,
        }
    }

    #[test]
    fn parses_offset_and_naive_timestamps() {
        let with_offset = parse_timestamp_millis("2026-03-01T10:00:00Z").unwrap();
        let naive = parse_timestamp_millis("2026-03-01T10:00:00").unwrap();
        let fractional = parse_timestamp_millis("2026-03-01T10:00:00.250").unwrap();
        assert_eq!(with_offset, naive);
        assert_eq!(fractional, naive + 250);
        assert_eq!(
            parse_timestamp_millis("2026-03-01T12:00:00+02:00"),
            Some(with_offset)
        );
        assert_eq!(parse_timestamp_millis("yesterday"), None);
    }

    #[test]
    fn naive_timestamps_follow_the_server_offset() {
        let cet = FixedOffset::east_opt(3600).unwrap();
        let utc = parse_timestamp_millis("2026-03-01T10:00:00").unwrap();
        assert_eq!(
            parse_timestamp_millis_in("2026-03-01T10:00:00", cet),
            Some(utc - 3_600_000)
        );
        // An explicit offset is not reinterpreted.
        assert_eq!(
            parse_timestamp_millis_in("2026-03-01T10:00:00Z", cet),
            Some(utc)
        );

        let mut snap = snapshot();
        snap.last_move_at = Some("2026-03-01T11:00:00".into());
        // 11:00 in UTC+1 is 10:00 UTC; ten seconds later white has 590 s left.
        let reading = estimate_in(&snap, utc + 10_000, 0, cet);
        assert_eq!(reading.white_seconds(), 590);
        assert_eq!(reading.black_seconds(), 590);
    }

    #[test]
    fn only_side_to_move_loses_time() {
        let mut snap = snapshot();
        snap.last_move_at = Some("2026-03-01T10:00:00".into());
        let base = parse_timestamp_millis("2026-03-01T10:00:00").unwrap();

        let reading = estimate(&snap, base + 12_500, 0);
        assert_eq!(reading.white_millis, 600_000 - 12_500);
        assert_eq!(reading.black_millis, 590_000);
        assert_eq!(reading.white_seconds(), 587);

        snap.position_notation = BLACK_TO_MOVE.into();
        let reading = estimate(&snap, base + 12_500, 0);
        assert_eq!(reading.white_millis, 600_000);
        assert_eq!(reading.black_millis, 590_000 - 12_500);
    }

    #[test]
    fn last_move_at_wins_over_started_at() {
        let mut snap = snapshot();
        snap.started_at = Some("2026-03-01T10:00:00".into());
        snap.last_move_at = Some("2026-03-01T10:01:00".into());
        let started = parse_timestamp_millis("2026-03-01T10:00:00").unwrap();
        let reading = estimate(&snap, started + 61_000, 0);
        assert_eq!(reading.white_millis, 599_000);
    }

    #[test]
    fn falls_back_to_session_start() {
        let mut snap = snapshot();
        snap.started_at = Some("not a timestamp".into());
        let reading = estimate(&snap, 10_000, 4_000);
        assert_eq!(reading.white_millis, 594_000);
    }

    #[test]
    fn never_goes_negative_or_backwards() {
        let snap = snapshot();
        assert_eq!(estimate(&snap, 10_000_000, 0).white_millis, 0);
        // `now` before the reference point counts as no time elapsed.
        assert_eq!(estimate(&snap, 1_000, 5_000).white_millis, 600_000);
    }

    #[test]
    fn finished_match_reports_stored_values() {
        let mut snap = snapshot();
        snap.status = MatchStatus::Player1Won;
        snap.last_move_at = Some("2026-03-01T10:00:00".into());
        let first = estimate(&snap, 0, 0);
        let later = estimate(&snap, u64::MAX / 2, 0);
        assert_eq!(first, later);
        assert_eq!(first.white_millis, 600_000);
        assert_eq!(first.black_millis, 590_000);
    }

    #[test]
    fn missing_stored_time_uses_initial_time() {
        let mut snap = snapshot();
        snap.game_type = GameType::Blitz;
        snap.player1_time_left_seconds = None;
        snap.player2_time_left_seconds = None;
        snap.status = MatchStatus::Draw;
        let reading = estimate(&snap, 0, 0);
        assert_eq!(reading.millis_for(Color::White), 180_000);
        assert_eq!(reading.millis_for(Color::Black), 180_000);
    }
}
