//! Match session synchronizer.
//!
//! [`MatchSession`] reconciles the local player's actions with the snapshots
//! the server confirms. Local actions are validated against the current
//! snapshot and a [`LegalMoveOracle`], then dispatched over the realtime
//! channel when it is live and over the [`MatchRepository`] otherwise. The
//! displayed position only ever changes when a server snapshot is applied,
//! whether it arrives as a push or as a REST response.
//!
//! Every snapshot passes the same staleness check, keyed on `currentPly`:
//!
//! - lower than the held ply: stale, dropped
//! - higher: applied
//! - equal: applied only when it finishes the game, or when it changes the
//!   draw offer and came from a draw-negotiation push or a REST response;
//!   exact duplicates and anything arriving after the game finished are dropped
//!
//! A background pump feeds pushes, connection phase changes and the pending
//! move deadline into the session. State and a bounded event channel are the
//! only outputs.
//!
//! # Example
//!
//! ```rust,ignore
//! let services = SessionServices::new(repository, oracle, connection);
//! let (mut session, mut events) =
//!     MatchSession::open(42, my_id, services, SessionConfig::new()).await?;
//!
//! session.select_square("e2".parse()?).await?;
//! session.attempt_move("e2".parse()?, "e4".parse()?, None).await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SessionEvent::SnapshotUpdated { snapshot, .. } => { /* redraw */ }
//!         SessionEvent::GameOver(outcome) => { /* … */ }
//!         SessionEvent::Closed => break,
//!         _ => {}
//!     }
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::clock::{self, ClockReading};
use crate::connection::{ConnectionManager, ConnectionPhase, Subscription};
use crate::error::{Result, RooklineError};
use crate::error_codes::RejectionCode;
use crate::oracle::LegalMoveOracle;
use crate::position::{self, Color, Position, PromotionPiece, Square};
use crate::protocol::{
    game_topic, DrawNegotiation, GameAction, GameOutcome, GameUpdate, InvalidPush, MatchId,
    MatchSnapshot, MoveCommand, MoveIntent, MoveRecord, PlayerId, PushKind,
};
use crate::repository::MatchRepository;

/// Default capacity of the bounded event channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default ceiling on how long a move may wait for confirmation.
const DEFAULT_PENDING_MOVE_TIMEOUT: Duration = Duration::from_secs(8);

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`MatchSession`].
///
/// # Example
///
/// ```
/// use rookline_client::session::SessionConfig;
/// use std::time::Duration;
///
/// let config = SessionConfig::new()
///     .with_pending_move_timeout(Duration::from_secs(5))
///     .with_resync_on_reconnect(false);
/// assert_eq!(config.pending_move_timeout, Duration::from_secs(5));
/// assert_eq!(config.event_channel_capacity, 256);
/// ```
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Capacity of the bounded event channel.
    ///
    /// When the consumer cannot keep up, events are dropped with a warning.
    /// The final [`SessionEvent::Closed`] is always delivered.
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// How long a submitted move blocks further attempts while waiting for
    /// confirmation. Defaults to **8 seconds**.
    pub pending_move_timeout: Duration,
    /// Re-fetch the snapshot over REST when the channel comes back from
    /// `Reconnecting`. Defaults to **true**.
    pub resync_on_reconnect: bool,
    /// Time the pump task gets to stop on [`MatchSession::close`] before it
    /// is aborted. Defaults to **1 second**.
    pub shutdown_timeout: Duration,
    /// Zone the server writes offset-less timestamps in. Defaults to **UTC**.
    pub server_utc_offset: FixedOffset,
}

impl SessionConfig {
    pub fn new() -> Self {
        Self {
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            pending_move_timeout: DEFAULT_PENDING_MOVE_TIMEOUT,
            resync_on_reconnect: true,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            server_utc_offset: Utc.fix(),
        }
    }

    /// Defaults to **256**. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_pending_move_timeout(mut self, timeout: Duration) -> Self {
        self.pending_move_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_resync_on_reconnect(mut self, enabled: bool) -> Self {
        self.resync_on_reconnect = enabled;
        self
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Read the server's offset-less timestamps in `offset` when estimating clocks.
    #[must_use]
    pub fn with_server_utc_offset(mut self, offset: FixedOffset) -> Self {
        self.server_utc_offset = offset;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Collaborators a session works with.
#[derive(Clone)]
pub struct SessionServices {
    pub repository: Arc<dyn MatchRepository>,
    pub oracle: Arc<dyn LegalMoveOracle>,
    /// Channel owned by this session; closed together with it.
    pub connection: ConnectionManager,
}

impl SessionServices {
    pub fn new(
        repository: Arc<dyn MatchRepository>,
        oracle: Arc<dyn LegalMoveOracle>,
        connection: ConnectionManager,
    ) -> Self {
        Self {
            repository,
            oracle,
            connection,
        }
    }
}

// ── State ───────────────────────────────────────────────────────────

/// A move dispatched but not yet confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMove {
    pub intent: MoveIntent,
    pub submitted_at: Instant,
    /// Ply the confirming snapshot will carry.
    pub expected_ply: u32,
}

/// Selected square and the targets the oracle allows from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub square: Square,
    pub targets: Vec<Square>,
}

/// Client-side view of the match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSessionState {
    /// Last server-confirmed snapshot.
    pub snapshot: MatchSnapshot,
    pub pending_move: Option<PendingMove>,
    pub connection_phase: ConnectionPhase,
    pub selection: Option<Selection>,
    /// `None` for a spectator.
    pub my_color: Option<Color>,
    pub my_id: PlayerId,
}

impl LocalSessionState {
    pub fn draw_negotiation(&self) -> DrawNegotiation {
        self.snapshot.draw_negotiation(self.my_id)
    }

    pub fn outcome(&self) -> Option<GameOutcome> {
        self.snapshot.outcome_for(self.my_id)
    }

    /// Whether the local player is the side to move in an ongoing match.
    pub fn is_my_turn(&self) -> bool {
        self.snapshot.is_ongoing()
            && self.my_color.is_some()
            && self.my_color == position::side_to_move(&self.snapshot.position_notation)
    }
}

// ── Events and outcomes ─────────────────────────────────────────────

/// Notifications emitted by a [`MatchSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A server snapshot replaced the local one.
    SnapshotUpdated {
        snapshot: Box<MatchSnapshot>,
        /// Push kind that delivered it, `None` for a REST response.
        via: Option<PushKind>,
    },
    /// The pending move was confirmed at `ply`.
    MoveConfirmed {
        ply: u32,
        notation: Option<String>,
    },
    /// The pending move was not confirmed in time and was cleared.
    PendingMoveExpired { intent: MoveIntent },
    DrawNegotiationChanged(DrawNegotiation),
    GameOver(GameOutcome),
    /// The server reported an error on the game topic.
    ServerNotice {
        code: RejectionCode,
        message: String,
    },
    ConnectionChanged(ConnectionPhase),
    /// Always the last event.
    Closed,
}

/// How an action left the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Published on the realtime channel; the confirming push follows.
    Published,
    /// Sent over REST and the response was run through the staleness check.
    Confirmed,
    /// Nothing to do in the current state.
    Skipped,
}

/// Result of a successful [`MatchSession::attempt_move`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveSubmission {
    pub intent: MoveIntent,
    pub outcome: ActionOutcome,
}

/// What happened to an incoming snapshot or push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushDisposition {
    Applied,
    /// Older than the held state.
    Stale,
    /// Identical to the held snapshot.
    Duplicate,
    /// For another match, or the session is closed.
    Ignored,
    /// An `ERROR` push surfaced as [`SessionEvent::ServerNotice`].
    Notice,
}

// ── Core state machine ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Origin {
    Push(PushKind),
    Rest,
}

impl Origin {
    fn may_change_draw_offer(self) -> bool {
        match self {
            Self::Push(kind) => kind.is_draw_negotiation(),
            Self::Rest => true,
        }
    }

    fn push_kind(self) -> Option<PushKind> {
        match self {
            Self::Push(kind) => Some(kind),
            Self::Rest => None,
        }
    }
}

/// Synchronous session state. Every method runs under the session lock.
#[derive(Debug)]
struct SessionCore {
    state: LocalSessionState,
}

impl SessionCore {
    fn new(snapshot: MatchSnapshot, my_id: PlayerId, connection_phase: ConnectionPhase) -> Self {
        let my_color = snapshot.color_of(my_id);
        Self {
            state: LocalSessionState {
                snapshot,
                pending_move: None,
                connection_phase,
                selection: None,
                my_color,
                my_id,
            },
        }
    }

    fn verdict(&self, incoming: &MatchSnapshot, origin: Origin) -> PushDisposition {
        let held = &self.state.snapshot;
        if incoming.id != held.id {
            return PushDisposition::Ignored;
        }
        if incoming.current_ply < held.current_ply {
            return PushDisposition::Stale;
        }
        if incoming.current_ply > held.current_ply {
            return PushDisposition::Applied;
        }
        if incoming == held {
            return PushDisposition::Duplicate;
        }
        if !held.is_ongoing() {
            return PushDisposition::Stale;
        }
        if !incoming.is_ongoing() {
            return PushDisposition::Applied;
        }
        if incoming.draw_offered_by_player_id != held.draw_offered_by_player_id
            && origin.may_change_draw_offer()
        {
            return PushDisposition::Applied;
        }
        PushDisposition::Stale
    }

    fn apply_snapshot(
        &mut self,
        incoming: MatchSnapshot,
        origin: Origin,
    ) -> (PushDisposition, Vec<SessionEvent>) {
        let disposition = self.verdict(&incoming, origin);
        if disposition != PushDisposition::Applied {
            debug!(
                match_id = incoming.id,
                ply = incoming.current_ply,
                held_ply = self.state.snapshot.current_ply,
                ?disposition,
                "snapshot not applied"
            );
            return (disposition, Vec::new());
        }

        let my_id = self.state.my_id;
        let previous = std::mem::replace(&mut self.state.snapshot, incoming);
        let current = &self.state.snapshot;
        debug!(match_id = current.id, ply = current.current_ply, "snapshot applied");

        let mut events = vec![SessionEvent::SnapshotUpdated {
            snapshot: Box::new(current.clone()),
            via: origin.push_kind(),
        }];

        if current.current_ply != previous.current_ply || !current.is_ongoing() {
            self.state.selection = None;
        }

        if let Some(pending) = &self.state.pending_move {
            if current.current_ply >= pending.expected_ply {
                events.push(SessionEvent::MoveConfirmed {
                    ply: current.current_ply,
                    notation: current.last_move_notation.clone(),
                });
                self.state.pending_move = None;
            } else if !current.is_ongoing() {
                self.state.pending_move = None;
            }
        }

        let negotiation = current.draw_negotiation(my_id);
        if negotiation != previous.draw_negotiation(my_id) {
            events.push(SessionEvent::DrawNegotiationChanged(negotiation));
        }

        if previous.is_ongoing() {
            if let Some(outcome) = current.outcome_for(my_id) {
                info!(match_id = current.id, ?outcome, "match finished");
                events.push(SessionEvent::GameOver(outcome));
            }
        }

        (PushDisposition::Applied, events)
    }

    /// Turn checks shared by selection and moves.
    fn ensure_can_move(&self) -> Result<Color> {
        let snapshot = &self.state.snapshot;
        if !snapshot.is_ongoing() {
            return Err(RooklineError::MatchNotOngoing);
        }
        let mine = self.state.my_color.ok_or(RooklineError::NotAParticipant)?;
        if position::side_to_move(&snapshot.position_notation) != Some(mine) {
            return Err(RooklineError::NotYourTurn);
        }
        Ok(mine)
    }

    fn select_square(
        &mut self,
        oracle: &dyn LegalMoveOracle,
        square: Square,
    ) -> Result<Option<Selection>> {
        let mine = self.ensure_can_move()?;

        if self.state.selection.as_ref().map(|s| s.square) == Some(square) {
            self.state.selection = None;
            return Ok(None);
        }

        let notation = &self.state.snapshot.position_notation;
        let own_piece = Position::parse(notation)
            .and_then(|pos| pos.piece_at(square))
            .is_some_and(|piece| piece.color == mine);
        if own_piece {
            let selection = Selection {
                square,
                targets: oracle.legal_targets(notation, square),
            };
            self.state.selection = Some(selection.clone());
            return Ok(Some(selection));
        }

        self.state.selection = None;
        Ok(None)
    }

    /// Clear the pending move if its deadline has passed.
    fn expire_pending(&mut self, now: Instant, timeout: Duration) -> Option<PendingMove> {
        let expired = self
            .state
            .pending_move
            .as_ref()
            .is_some_and(|p| now.saturating_duration_since(p.submitted_at) >= timeout);
        if expired {
            self.state.pending_move.take()
        } else {
            None
        }
    }

    fn pending_deadline(&self, timeout: Duration) -> Option<Instant> {
        self.state
            .pending_move
            .as_ref()
            .map(|p| p.submitted_at + timeout)
    }

    /// Validate a move and record it as pending.
    fn prepare_move(
        &mut self,
        oracle: &dyn LegalMoveOracle,
        intent: MoveIntent,
        now: Instant,
        timeout: Duration,
    ) -> Result<(MoveIntent, Vec<SessionEvent>)> {
        let mut events = Vec::new();
        self.ensure_can_move()?;

        if let Some(expired) = self.expire_pending(now, timeout) {
            events.push(SessionEvent::PendingMoveExpired {
                intent: expired.intent,
            });
        }
        if self.state.pending_move.is_some() {
            return Err(RooklineError::MovePending);
        }

        let Some(selection) = self
            .state
            .selection
            .as_ref()
            .filter(|s| s.square == intent.from)
        else {
            return Err(RooklineError::NoSelection);
        };
        if !selection.targets.contains(&intent.to) {
            return Err(RooklineError::IllegalMove(intent.to_uci()));
        }

        let notation = &self.state.snapshot.position_notation;
        if intent.promotion.is_none() && oracle.requires_promotion(notation, intent.from, intent.to)
        {
            return Err(RooklineError::PromotionRequired);
        }
        oracle.apply(notation, &intent)?;

        self.state.pending_move = Some(PendingMove {
            intent,
            submitted_at: now,
            expected_ply: self.state.snapshot.current_ply + 1,
        });
        self.state.selection = None;
        Ok((intent, events))
    }

    /// Validate a non-move action. `Ok(false)` means skip without dispatch.
    fn check_action(&self, action: GameAction) -> Result<bool> {
        let snapshot = &self.state.snapshot;
        if self.state.my_color.is_none() {
            return Err(RooklineError::NotAParticipant);
        }
        if action == GameAction::Resign {
            return Ok(snapshot.is_ongoing());
        }
        if !snapshot.is_ongoing() {
            return Err(RooklineError::MatchNotOngoing);
        }
        match (action, self.state.draw_negotiation()) {
            (GameAction::OfferDraw, DrawNegotiation::None) => Ok(true),
            (GameAction::OfferDraw, DrawNegotiation::OfferedByMe) => Ok(false),
            (GameAction::OfferDraw, DrawNegotiation::OfferedByOpponent) => {
                Err(RooklineError::ActionRejected {
                    code: RejectionCode::DrawOfferPending,
                    message: "A draw offer is already pending".into(),
                })
            }
            (_, DrawNegotiation::None) => Err(RooklineError::NoDrawOffer),
            (_, DrawNegotiation::OfferedByMe) => Err(RooklineError::OwnDrawOffer),
            (_, DrawNegotiation::OfferedByOpponent) => Ok(true),
        }
    }
}

// ── Shared state ────────────────────────────────────────────────────

/// State shared between the session handle and the pump task.
struct Shared {
    match_id: MatchId,
    core: Mutex<SessionCore>,
    relevant: AtomicBool,
    repository: Arc<dyn MatchRepository>,
    oracle: Arc<dyn LegalMoveOracle>,
    connection: ConnectionManager,
    events: mpsc::Sender<SessionEvent>,
    pending_changed: Notify,
    config: SessionConfig,
    session_start_millis: u64,
}

impl Shared {
    fn is_relevant(&self) -> bool {
        self.relevant.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_relevant() {
            Ok(())
        } else {
            Err(RooklineError::InvalidState("session is closed".into()))
        }
    }

    /// Run a server snapshot through the staleness check.
    async fn apply(&self, snapshot: MatchSnapshot, origin: Origin) -> PushDisposition {
        if !self.is_relevant() {
            return PushDisposition::Ignored;
        }
        let mut core = self.core.lock().await;
        let had_pending = core.state.pending_move.is_some();
        let (disposition, events) = core.apply_snapshot(snapshot, origin);
        // Emitted under the lock so event order matches apply order.
        for event in events {
            emit_event(&self.events, event);
        }
        if had_pending && core.state.pending_move.is_none() {
            self.pending_changed.notify_one();
        }
        disposition
    }

    async fn ingest(&self, update: GameUpdate) -> PushDisposition {
        if !self.is_relevant() {
            return PushDisposition::Ignored;
        }
        let kind = update.kind();
        match update {
            GameUpdate::Error { message } => {
                let code = RejectionCode::classify(&message);
                warn!(match_id = self.match_id, %message, ?code, "server error push");
                emit_event(&self.events, SessionEvent::ServerNotice { code, message });
                PushDisposition::Notice
            }
            GameUpdate::MoveMade { snapshot, .. }
            | GameUpdate::Resigned { snapshot, .. }
            | GameUpdate::Draw { snapshot }
            | GameUpdate::DrawOffered { snapshot }
            | GameUpdate::DrawDeclined { snapshot } => {
                self.apply(*snapshot, Origin::Push(kind)).await
            }
        }
    }

    async fn ingest_value(&self, body: serde_json::Value) {
        match GameUpdate::from_value(body) {
            Ok(update) => {
                self.ingest(update).await;
            }
            Err(e) => warn!(match_id = self.match_id, "dropping push: {e}"),
        }
    }

    async fn refresh(&self) -> Result<PushDisposition> {
        let snapshot = self.repository.get(self.match_id).await?;
        Ok(self.apply(snapshot, Origin::Rest).await)
    }

    async fn on_phase(self: &Arc<Self>, phase: ConnectionPhase) {
        let previous = {
            let mut core = self.core.lock().await;
            std::mem::replace(&mut core.state.connection_phase, phase.clone())
        };
        if previous == phase {
            return;
        }
        emit_event(&self.events, SessionEvent::ConnectionChanged(phase.clone()));

        if previous == ConnectionPhase::Reconnecting
            && phase == ConnectionPhase::Live
            && self.config.resync_on_reconnect
        {
            let shared = Arc::clone(self);
            tokio::spawn(async move {
                match shared.refresh().await {
                    Ok(disposition) => debug!(match_id = shared.match_id, ?disposition, "resynced"),
                    Err(e) => warn!(match_id = shared.match_id, "resync failed: {e}"),
                }
            });
        }
    }

    async fn expire_pending(&self) {
        let mut core = self.core.lock().await;
        if let Some(expired) = core.expire_pending(Instant::now(), self.config.pending_move_timeout) {
            warn!(
                match_id = self.match_id,
                uci = %expired.intent.to_uci(),
                "pending move not confirmed in time"
            );
            emit_event(
                &self.events,
                SessionEvent::PendingMoveExpired {
                    intent: expired.intent,
                },
            );
        }
    }

    async fn pending_deadline(&self) -> Option<Instant> {
        self.core
            .lock()
            .await
            .pending_deadline(self.config.pending_move_timeout)
    }

    /// Publish if live, else (or if the publish fails) call REST.
    async fn dispatch(
        &self,
        action: GameAction,
        body: serde_json::Value,
        intent: Option<&MoveIntent>,
    ) -> Result<ActionOutcome> {
        if self.connection.is_live() {
            match self
                .connection
                .publish(action.destination(self.match_id), body)
                .await
            {
                Ok(()) => return Ok(ActionOutcome::Published),
                Err(e) => debug!(match_id = self.match_id, "publish failed, using REST: {e}"),
            }
        }

        let id = self.match_id;
        let snapshot = match (action, intent) {
            (GameAction::Move, Some(intent)) => self.repository.submit_move(id, intent).await?,
            (GameAction::Move, None) => {
                return Err(RooklineError::InvalidState("move dispatched without intent".into()))
            }
            (GameAction::Resign, _) => self.repository.resign(id).await?,
            (GameAction::OfferDraw, _) => self.repository.offer_draw(id).await?,
            (GameAction::AcceptDraw, _) => self.repository.accept_draw(id).await?,
            (GameAction::DeclineDraw, _) => self.repository.decline_draw(id).await?,
        };
        self.apply(snapshot, Origin::Rest).await;
        Ok(ActionOutcome::Confirmed)
    }
}

// ── Session handle ──────────────────────────────────────────────────

/// Live synchronizer for one match.
///
/// Created by [`MatchSession::open`]. Operations take `&self` and may be
/// called concurrently; they serialize on an internal lock that is never held
/// across network calls.
pub struct MatchSession {
    shared: Arc<Shared>,
    task: Option<tokio::task::JoinHandle<()>>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl MatchSession {
    /// Load match `match_id` and start synchronizing it for player `my_id`.
    ///
    /// # Errors
    ///
    /// Returns [`RooklineError::Load`] if the initial snapshot cannot be
    /// fetched.
    pub async fn open(
        match_id: MatchId,
        my_id: PlayerId,
        services: SessionServices,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>)> {
        let snapshot = services
            .repository
            .get(match_id)
            .await
            .map_err(|e| RooklineError::Load {
                match_id,
                reason: e.to_string(),
            })?;
        if snapshot.id != match_id {
            return Err(RooklineError::Load {
                match_id,
                reason: format!("server returned match {}", snapshot.id),
            });
        }

        let subscription = match services.connection.subscribe(game_topic(match_id)) {
            Ok(sub) => Some(sub),
            Err(e) => {
                warn!(match_id, "push channel unavailable, REST only: {e}");
                None
            }
        };
        let phases = services.connection.phases();
        let phase = phases.borrow().clone();

        let capacity = config.event_channel_capacity.max(1);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (stop_tx, stop_rx) = oneshot::channel();

        info!(
            match_id,
            my_id,
            ply = snapshot.current_ply,
            "match session opened"
        );
        let shared = Arc::new(Shared {
            match_id,
            core: Mutex::new(SessionCore::new(snapshot, my_id, phase)),
            relevant: AtomicBool::new(true),
            repository: services.repository,
            oracle: services.oracle,
            connection: services.connection,
            events: event_tx,
            pending_changed: Notify::new(),
            config,
            session_start_millis: clock::now_millis(),
        });

        let task = tokio::spawn(pump(Arc::clone(&shared), subscription, phases, stop_rx));

        Ok((
            Self {
                shared,
                task: Some(task),
                stop_tx: Some(stop_tx),
            },
            event_rx,
        ))
    }

    pub fn match_id(&self) -> MatchId {
        self.shared.match_id
    }

    /// Select or deselect a square. No network effect.
    ///
    /// Returns the new selection, or `None` if nothing is selected afterwards.
    ///
    /// # Errors
    ///
    /// [`RooklineError::MatchNotOngoing`], [`RooklineError::NotAParticipant`]
    /// or [`RooklineError::NotYourTurn`].
    pub async fn select_square(&self, square: Square) -> Result<Option<Selection>> {
        self.shared.ensure_open()?;
        let mut core = self.shared.core.lock().await;
        core.select_square(self.shared.oracle.as_ref(), square)
    }

    /// Validate and submit a move from the selected square.
    ///
    /// The displayed position does not change until the server confirms the
    /// move; until then further attempts fail with
    /// [`RooklineError::MovePending`].
    ///
    /// # Errors
    ///
    /// Local validation errors leave all state untouched. A REST failure
    /// clears the pending move and is returned as-is.
    pub async fn attempt_move(
        &self,
        from: Square,
        to: Square,
        promotion: Option<PromotionPiece>,
    ) -> Result<MoveSubmission> {
        self.shared.ensure_open()?;
        let intent = {
            let mut core = self.shared.core.lock().await;
            let (intent, events) = core.prepare_move(
                self.shared.oracle.as_ref(),
                MoveIntent::new(from, to, promotion),
                Instant::now(),
                self.shared.config.pending_move_timeout,
            )?;
            for event in events {
                emit_event(&self.shared.events, event);
            }
            intent
        };
        self.shared.pending_changed.notify_one();
        debug!(match_id = self.shared.match_id, uci = %intent.to_uci(), "move submitted");

        let body = serde_json::to_value(MoveCommand::from(&intent))?;
        match self.shared.dispatch(GameAction::Move, body, Some(&intent)).await {
            Ok(outcome) => Ok(MoveSubmission { intent, outcome }),
            Err(e) => {
                if self.shared.is_relevant() {
                    let mut core = self.shared.core.lock().await;
                    if core.state.pending_move.as_ref().map(|p| p.intent) == Some(intent) {
                        core.state.pending_move = None;
                    }
                }
                self.shared.pending_changed.notify_one();
                warn!(match_id = self.shared.match_id, "move submission failed: {e}");
                Err(e)
            }
        }
    }

    /// Resign. A no-op on a finished match.
    ///
    /// # Errors
    ///
    /// [`RooklineError::NotAParticipant`] for spectators, or the REST error.
    pub async fn resign(&self) -> Result<ActionOutcome> {
        self.act(GameAction::Resign).await
    }

    /// Offer a draw. A no-op while the local offer stands.
    ///
    /// # Errors
    ///
    /// `ActionRejected { code: DrawOfferPending }` while the opponent's offer
    /// stands, [`RooklineError::MatchNotOngoing`], or the REST error.
    pub async fn offer_draw(&self) -> Result<ActionOutcome> {
        self.act(GameAction::OfferDraw).await
    }

    /// Accept the opponent's draw offer.
    ///
    /// # Errors
    ///
    /// [`RooklineError::NoDrawOffer`] or [`RooklineError::OwnDrawOffer`]
    /// without any dispatch, [`RooklineError::MatchNotOngoing`], or the REST
    /// error.
    pub async fn accept_draw(&self) -> Result<ActionOutcome> {
        self.act(GameAction::AcceptDraw).await
    }

    /// Decline the opponent's draw offer. Same preconditions as
    /// [`accept_draw`](Self::accept_draw).
    pub async fn decline_draw(&self) -> Result<ActionOutcome> {
        self.act(GameAction::DeclineDraw).await
    }

    async fn act(&self, action: GameAction) -> Result<ActionOutcome> {
        self.shared.ensure_open()?;
        let proceed = self.shared.core.lock().await.check_action(action)?;
        if !proceed {
            debug!(match_id = self.shared.match_id, action = action.path(), "action skipped");
            return Ok(ActionOutcome::Skipped);
        }
        self.shared
            .dispatch(action, serde_json::json!({}), None)
            .await
    }

    /// Feed a raw push body into the session.
    ///
    /// The pump does this for every message on the game topic; calling it
    /// directly is useful when pushes arrive through another route.
    ///
    /// # Errors
    ///
    /// Returns the validation failure for malformed or unknown bodies; the
    /// session state is untouched in that case.
    pub async fn ingest_push(
        &self,
        body: serde_json::Value,
    ) -> std::result::Result<PushDisposition, InvalidPush> {
        let update = GameUpdate::from_value(body)?;
        Ok(self.shared.ingest(update).await)
    }

    /// Feed an already validated push into the session.
    pub async fn ingest_update(&self, update: GameUpdate) -> PushDisposition {
        self.shared.ingest(update).await
    }

    /// Re-fetch the snapshot over REST and apply it.
    ///
    /// # Errors
    ///
    /// Returns the REST error; the held snapshot is untouched.
    pub async fn refresh(&self) -> Result<PushDisposition> {
        self.shared.ensure_open()?;
        self.shared.refresh().await
    }

    /// Moves played so far.
    ///
    /// # Errors
    ///
    /// Returns the REST error.
    pub async fn move_history(&self) -> Result<Vec<MoveRecord>> {
        self.shared.repository.move_history(self.shared.match_id).await
    }

    /// Copy of the current local state.
    pub async fn state(&self) -> LocalSessionState {
        self.shared.core.lock().await.state.clone()
    }

    pub async fn draw_negotiation(&self) -> DrawNegotiation {
        self.shared.core.lock().await.state.draw_negotiation()
    }

    pub async fn outcome(&self) -> Option<GameOutcome> {
        self.shared.core.lock().await.state.outcome()
    }

    /// Clock estimate at `now_millis` (Unix epoch milliseconds).
    pub async fn clock(&self, now_millis: u64) -> ClockReading {
        let core = self.shared.core.lock().await;
        clock::estimate_in(
            &core.state.snapshot,
            now_millis,
            self.shared.session_start_millis,
            self.shared.config.server_utc_offset,
        )
    }

    /// Clock estimate at the current wall-clock time.
    pub async fn clock_now(&self) -> ClockReading {
        self.clock(clock::now_millis()).await
    }

    pub fn is_open(&self) -> bool {
        self.shared.is_relevant()
    }

    /// Stop synchronizing and close the channel. Idempotent.
    ///
    /// In-flight REST completions that land afterwards are discarded.
    pub async fn close(&mut self) {
        if !self.shared.relevant.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!(match_id = self.shared.match_id, "MatchSession: close requested");

        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(mut task) = self.task.take() {
            let timeout = self.shared.config.shutdown_timeout;
            match tokio::time::timeout(timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => warn!("session pump terminated with join error: {join_err}"),
                Err(_) => {
                    warn!("session pump did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("session pump aborted: {join_err}");
                    }
                }
            }
        }

        self.shared.connection.close().await;

        // `Closed` is the last event and must not be dropped, but a stalled
        // consumer may not block close forever either.
        let send = self.shared.events.send(SessionEvent::Closed);
        let delivered = tokio::time::timeout(self.shared.config.shutdown_timeout, send).await;
        if !matches!(delivered, Ok(Ok(()))) {
            debug!("event channel closed or full, Closed not delivered");
        }
        info!(match_id = self.shared.match_id, "match session closed");
    }
}

impl std::fmt::Debug for MatchSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchSession")
            .field("match_id", &self.shared.match_id)
            .field("open", &self.is_open())
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for MatchSession {
    fn drop(&mut self) {
        self.shared.relevant.store(false, Ordering::Release);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Pump ────────────────────────────────────────────────────────────

/// Background task feeding pushes, phase changes and the pending-move
/// deadline into the session.
async fn pump(
    shared: Arc<Shared>,
    mut subscription: Option<Subscription>,
    mut phases: watch::Receiver<ConnectionPhase>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    debug!(match_id = shared.match_id, "session pump started");
    let mut watching_phases = true;

    loop {
        let deadline = shared.pending_deadline().await;

        tokio::select! {
            _ = &mut stop_rx => break,

            body = next_message(&mut subscription) => match body {
                Some(body) => shared.ingest_value(body).await,
                None => {
                    debug!(match_id = shared.match_id, "game topic subscription ended");
                    subscription = None;
                }
            },

            changed = phases.changed(), if watching_phases => {
                if changed.is_err() {
                    watching_phases = false;
                    continue;
                }
                let phase = phases.borrow_and_update().clone();
                shared.on_phase(phase).await;
            }

            () = sleep_until(deadline) => shared.expire_pending().await,

            () = shared.pending_changed.notified() => {}
        }
    }

    if let Some(sub) = subscription {
        sub.unsubscribe();
    }
    debug!(match_id = shared.match_id, "session pump exited");
}

async fn next_message(subscription: &mut Option<Subscription>) -> Option<serde_json::Value> {
    match subscription {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Emit an event to the event channel. If the channel is full, log a warning
/// and drop the event rather than block the caller.
pub(crate) fn emit_event<E>(event_tx: &mpsc::Sender<E>, event: E) {
    match event_tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            warn!(
                "event channel full, dropping event: {:?}",
                std::mem::discriminant(&dropped)
            );
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("event channel closed, receiver dropped");
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

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
    use crate::oracle::PermissiveOracle;
    use crate::position::STARTING_POSITION;
    use crate::protocol::{GameType, MatchStatus};

    const WHITE: PlayerId = 10;
    const BLACK: PlayerId = 20;

    fn snapshot(ply: u32) -> MatchSnapshot {
        MatchSnapshot {
            id: 1,
            player1_id: WHITE,
            player2_id: BLACK,
            game_type: GameType::Rapid,
            status: MatchStatus::Ongoing,
            position_notation: STARTING_POSITION.to_string(),
            last_move_notation: None,
            player1_time_left_seconds: Some(600),
            player2_time_left_seconds: Some(600),
            last_move_at: None,
            started_at: None,
            created_at: None,
            finished_at: None,
            draw_offered_by_player_id: None,
            current_ply: ply,
        }
    }

    fn core(me: PlayerId, ply: u32) -> SessionCore {
        SessionCore::new(snapshot(ply), me, ConnectionPhase::Live)
    }

    fn sq(name: &str) -> Square {
        name.parse().unwrap()
    }

    #[test]
    fn higher_ply_applies_lower_is_stale() {
        let mut core = core(WHITE, 3);
        let (d, _) = core.apply_snapshot(snapshot(2), Origin::Push(PushKind::MoveMade));
        assert_eq!(d, PushDisposition::Stale);
        let (d, events) = core.apply_snapshot(snapshot(4), Origin::Push(PushKind::MoveMade));
        assert_eq!(d, PushDisposition::Applied);
        assert!(matches!(events[0], SessionEvent::SnapshotUpdated { .. }));
        assert_eq!(core.state.snapshot.current_ply, 4);
    }

    #[test]
    fn duplicate_is_dropped() {
        let mut core = core(WHITE, 3);
        let (d, events) = core.apply_snapshot(snapshot(3), Origin::Rest);
        assert_eq!(d, PushDisposition::Duplicate);
        assert!(events.is_empty());
    }

    #[test]
    fn equal_ply_terminal_applies_once() {
        let mut core = core(WHITE, 6);
        let mut finished = snapshot(6);
        finished.status = MatchStatus::Player2Won;
        let (d, events) = core.apply_snapshot(finished.clone(), Origin::Push(PushKind::Resigned));
        assert_eq!(d, PushDisposition::Applied);
        assert!(events.contains(&SessionEvent::GameOver(GameOutcome::Lost)));

        // Anything at the same ply after the game finished is dropped.
        let (d, _) = core.apply_snapshot(snapshot(6), Origin::Push(PushKind::DrawOffered));
        assert_eq!(d, PushDisposition::Stale);
        assert_eq!(core.state.snapshot.status, MatchStatus::Player2Won);
    }

    #[test]
    fn equal_ply_draw_offer_needs_negotiation_origin() {
        let mut core = core(WHITE, 2);
        let mut offered = snapshot(2);
        offered.draw_offered_by_player_id = Some(BLACK);

        let (d, _) = core.apply_snapshot(offered.clone(), Origin::Push(PushKind::MoveMade));
        assert_eq!(d, PushDisposition::Stale);

        let (d, events) = core.apply_snapshot(offered, Origin::Push(PushKind::DrawOffered));
        assert_eq!(d, PushDisposition::Applied);
        assert!(events.contains(&SessionEvent::DrawNegotiationChanged(
            DrawNegotiation::OfferedByOpponent
        )));

        let (d, _) = core.apply_snapshot(snapshot(2), Origin::Rest);
        assert_eq!(d, PushDisposition::Applied);
        assert_eq!(core.state.draw_negotiation(), DrawNegotiation::None);
    }

    #[test]
    fn foreign_match_is_ignored() {
        let mut core = core(WHITE, 0);
        let mut other = snapshot(5);
        other.id = 99;
        let (d, _) = core.apply_snapshot(other, Origin::Rest);
        assert_eq!(d, PushDisposition::Ignored);
    }

    #[test]
    fn blocked_pawn_on_seventh_is_illegal_not_a_promotion() {
        let oracle = PermissiveOracle;
        let mut blocked = snapshot(0);
        blocked.position_notation = "k3K3/4P3/8/8/8/8/8/8 w - - 0 1".to_string();
        let mut core = SessionCore::new(blocked, WHITE, ConnectionPhase::Live);

        let selection = core.select_square(&oracle, sq("e7")).unwrap().unwrap();
        assert!(!selection.targets.contains(&sq("e8")));

        let timeout = Duration::from_secs(8);
        let err = core
            .prepare_move(
                &oracle,
                MoveIntent::new(sq("e7"), sq("e8"), None),
                Instant::now(),
                timeout,
            )
            .unwrap_err();
        assert!(matches!(err, RooklineError::IllegalMove(ref uci) if uci == "e7e8"));
        assert!(core.state.pending_move.is_none());
        assert_eq!(core.state.selection, Some(selection));
    }

    #[test]
    fn selection_rules() {
        let oracle = PermissiveOracle;
        let mut core = core(WHITE, 0);

        // Empty square with nothing selected: no-op.
        assert_eq!(core.select_square(&oracle, sq("e4")).unwrap(), None);
        // Own piece selects.
        let selection = core.select_square(&oracle, sq("e2")).unwrap().unwrap();
        assert_eq!(selection.square, sq("e2"));
        assert!(selection.targets.contains(&sq("e4")));
        // Another own piece switches.
        assert_eq!(
            core.select_square(&oracle, sq("g1")).unwrap().map(|s| s.square),
            Some(sq("g1"))
        );
        // Re-selecting clears.
        assert_eq!(core.select_square(&oracle, sq("g1")).unwrap(), None);
        assert!(core.state.selection.is_none());
        // Opponent piece while selected clears.
        core.select_square(&oracle, sq("e2")).unwrap();
        assert_eq!(core.select_square(&oracle, sq("e7")).unwrap(), None);
        assert!(core.state.selection.is_none());
    }

    #[test]
    fn selection_requires_turn_and_participation() {
        let oracle = PermissiveOracle;
        assert!(matches!(
            core(BLACK, 0).select_square(&oracle, sq("e7")),
            Err(RooklineError::NotYourTurn)
        ));
        assert!(matches!(
            core(77, 0).select_square(&oracle, sq("e2")),
            Err(RooklineError::NotAParticipant)
        ));
        let mut finished = core(WHITE, 0);
        finished.state.snapshot.status = MatchStatus::Draw;
        assert!(matches!(
            finished.select_square(&oracle, sq("e2")),
            Err(RooklineError::MatchNotOngoing)
        ));
    }

    #[test]
    fn prepare_move_validates_in_order() {
        let oracle = PermissiveOracle;
        let now = Instant::now();
        let timeout = Duration::from_secs(8);
        let mut core = core(WHITE, 0);
        let intent = MoveIntent::new(sq("e2"), sq("e4"), None);

        assert!(matches!(
            core.prepare_move(&oracle, intent, now, timeout),
            Err(RooklineError::NoSelection)
        ));

        core.select_square(&oracle, sq("e2")).unwrap();
        let (prepared, _) = core.prepare_move(&oracle, intent, now, timeout).unwrap();
        assert_eq!(prepared, intent);
        assert_eq!(core.state.pending_move.as_ref().unwrap().expected_ply, 1);
        assert!(core.state.selection.is_none());
        // Snapshot is untouched until confirmation.
        assert_eq!(core.state.snapshot, snapshot(0));

        core.state.selection = Some(Selection {
            square: sq("d2"),
            targets: vec![],
        });
        assert!(matches!(
            core.prepare_move(&oracle, MoveIntent::new(sq("d2"), sq("d4"), None), now, timeout),
            Err(RooklineError::MovePending)
        ));

        // Past the deadline the stale pending move is cleared first.
        let later = now + timeout;
        let (_, events) = core
            .prepare_move(&oracle, MoveIntent::new(sq("d2"), sq("d4"), None), later, timeout)
            .unwrap();
        assert_eq!(
            events,
            vec![SessionEvent::PendingMoveExpired { intent }]
        );
    }

    #[test]
    fn promotion_must_be_explicit() {
        let oracle = PermissiveOracle;
        let mut core = core(WHITE, 10);
        core.state.snapshot.position_notation = "k7/4P3/8/8/8/8/8/7K w - - 0 1".into();
        core.select_square(&oracle, sq("e7")).unwrap();
        let bare = MoveIntent::new(sq("e7"), sq("e8"), None);
        assert!(matches!(
            core.prepare_move(&oracle, bare, Instant::now(), Duration::from_secs(8)),
            Err(RooklineError::PromotionRequired)
        ));
        let queen = MoveIntent::new(sq("e7"), sq("e8"), Some(PromotionPiece::Queen));
        assert!(core
            .prepare_move(&oracle, queen, Instant::now(), Duration::from_secs(8))
            .is_ok());
    }

    #[test]
    fn confirmation_clears_pending() {
        let oracle = PermissiveOracle;
        let mut core = core(WHITE, 0);
        core.select_square(&oracle, sq("e2")).unwrap();
        core.prepare_move(
            &oracle,
            MoveIntent::new(sq("e2"), sq("e4"), None),
            Instant::now(),
            Duration::from_secs(8),
        )
        .unwrap();

        let mut confirmed = snapshot(1);
        confirmed.last_move_notation = Some("e2e4".into());
        let (_, events) = core.apply_snapshot(confirmed, Origin::Push(PushKind::MoveMade));
        assert!(core.state.pending_move.is_none());
        assert!(events.contains(&SessionEvent::MoveConfirmed {
            ply: 1,
            notation: Some("e2e4".into())
        }));
    }

    #[test]
    fn action_preconditions() {
        let mut me = core(WHITE, 4);
        assert!(me.check_action(GameAction::OfferDraw).unwrap());
        assert!(matches!(
            me.check_action(GameAction::AcceptDraw),
            Err(RooklineError::NoDrawOffer)
        ));

        me.state.snapshot.draw_offered_by_player_id = Some(WHITE);
        assert!(!me.check_action(GameAction::OfferDraw).unwrap());
        assert!(matches!(
            me.check_action(GameAction::DeclineDraw),
            Err(RooklineError::OwnDrawOffer)
        ));

        me.state.snapshot.draw_offered_by_player_id = Some(BLACK);
        assert!(me.check_action(GameAction::AcceptDraw).unwrap());
        assert!(matches!(
            me.check_action(GameAction::OfferDraw),
            Err(RooklineError::ActionRejected {
                code: RejectionCode::DrawOfferPending,
                ..
            })
        ));

        me.state.snapshot.status = MatchStatus::Draw;
        assert!(!me.check_action(GameAction::Resign).unwrap());
        assert!(matches!(
            me.check_action(GameAction::OfferDraw),
            Err(RooklineError::MatchNotOngoing)
        ));

        assert!(matches!(
            core(77, 0).check_action(GameAction::Resign),
            Err(RooklineError::NotAParticipant)
        ));
    }

    #[test]
    fn config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.event_channel_capacity, 256);
        assert_eq!(config.pending_move_timeout, Duration::from_secs(8));
        assert!(config.resync_on_reconnect);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
        assert_eq!(
            SessionConfig::new()
                .with_event_channel_capacity(0)
                .event_channel_capacity,
            1
        );
    }
}
