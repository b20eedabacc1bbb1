//! Request/response access to the match server.
//!
//! [`MatchRepository`] is the pull side of the dual link. Every action the
//! session can publish on the realtime channel also exists here, so a session
//! stays correct while the channel is down. A concrete `reqwest` implementation
//! lives in [`repositories::http`](crate::repositories) behind the
//! `http-repository` feature.

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::{GameType, MatchId, MatchSnapshot, MoveIntent, MoveRecord, PlayerId, QueueJoin};

/// Persistence backend for matches and the matchmaking queue.
///
/// Every mutating call returns the snapshot the server holds after the action,
/// which the caller feeds through the same staleness check as pushed
/// snapshots.
///
/// # Errors
///
/// Implementations report missing matches as
/// [`RooklineError::NotFound`](crate::RooklineError::NotFound), credential
/// problems as [`RooklineError::Unauthorized`](crate::RooklineError::Unauthorized)
/// and server refusals as
/// [`RooklineError::ActionRejected`](crate::RooklineError::ActionRejected).
#[async_trait]
pub trait MatchRepository: Send + Sync + 'static {
    /// Fetch the current snapshot of a match.
    async fn get(&self, match_id: MatchId) -> Result<MatchSnapshot>;

    /// Submit a move.
    async fn submit_move(&self, match_id: MatchId, intent: &MoveIntent) -> Result<MatchSnapshot>;

    async fn resign(&self, match_id: MatchId) -> Result<MatchSnapshot>;

    async fn offer_draw(&self, match_id: MatchId) -> Result<MatchSnapshot>;

    async fn accept_draw(&self, match_id: MatchId) -> Result<MatchSnapshot>;

    async fn decline_draw(&self, match_id: MatchId) -> Result<MatchSnapshot>;

    /// Enter the matchmaking queue for `game_type`.
    async fn join_queue(&self, game_type: GameType) -> Result<QueueJoin>;

    /// Leave the matchmaking queue. Succeeds when not queued.
    async fn leave_queue(&self) -> Result<()>;

    /// Moves played so far, in ply order.
    async fn move_history(&self, match_id: MatchId) -> Result<Vec<MoveRecord>>;

    /// All matches the player takes part in.
    async fn player_matches(&self, player_id: PlayerId) -> Result<Vec<MatchSnapshot>>;

    /// Start a match directly against `opponent`, bypassing the queue.
    async fn create_match(&self, opponent: PlayerId, game_type: GameType) -> Result<MatchSnapshot>;
}
