//! Matchmaking queue membership.
//!
//! A [`MatchmakingSession`] joins the queue for one game type and waits for a
//! pairing. The pairing may come back directly in the REST join response, as a
//! push on the player's matchmaking topic, or (when polling is enabled) as a
//! new ongoing match in the player's match list. Whichever arrives first wins;
//! exactly one [`MatchmakingEvent::Matched`] is emitted per search.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::connection::{ConnectionManager, Subscription};
use crate::error::{Result, RooklineError};
use crate::protocol::{matchmaking_topic, GameType, MatchId, MatchSnapshot, PlayerId, QueueJoin};
use crate::repository::MatchRepository;
use crate::session::emit_event;

const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 64;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2500);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for a [`MatchmakingSession`].
#[derive(Debug, Clone)]
pub struct MatchmakingConfig {
    /// Capacity of the bounded event channel. Defaults to **64**.
    pub event_channel_capacity: usize,
    /// How often to look for a new match in the player's match list while
    /// searching. `None` disables polling. Defaults to **2.5 seconds**.
    pub poll_interval: Option<Duration>,
    /// Time the search task gets to stop on cancel before it is aborted.
    /// Defaults to **1 second**.
    pub shutdown_timeout: Duration,
}

impl MatchmakingConfig {
    pub fn new() -> Self {
        Self {
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            poll_interval: Some(DEFAULT_POLL_INTERVAL),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Rely on the REST response and pushes only.
    #[must_use]
    pub fn without_polling(mut self) -> Self {
        self.poll_interval = None;
        self
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchmakingState {
    Idle,
    Searching { game_type: GameType },
    Matched { match_id: MatchId },
    Cancelled,
    Errored { message: String },
}

impl MatchmakingState {
    pub fn is_searching(&self) -> bool {
        matches!(self, Self::Searching { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchmakingEvent {
    Searching {
        game_type: GameType,
    },
    /// Paired. `snapshot` is present when the pairing carried one.
    Matched {
        match_id: MatchId,
        snapshot: Option<Box<MatchSnapshot>>,
    },
    Cancelled,
    Errored {
        message: String,
    },
}

/// Body pushed on the matchmaking topic: either a full envelope with `match`
/// or a bare match object.
#[derive(Debug, Deserialize)]
struct PairingPush {
    #[serde(rename = "match", default)]
    snapshot: Option<MatchSnapshot>,
    #[serde(default)]
    id: Option<MatchId>,
}

fn parse_pairing(body: serde_json::Value) -> Option<(MatchId, Option<MatchSnapshot>)> {
    let push: PairingPush = match serde_json::from_value(body) {
        Ok(push) => push,
        Err(e) => {
            warn!("dropping malformed matchmaking push: {e}");
            return None;
        }
    };
    match (push.snapshot, push.id) {
        (Some(snapshot), _) => Some((snapshot.id, Some(snapshot))),
        (None, Some(id)) => Some((id, None)),
        (None, None) => {
            warn!("matchmaking push without a match id");
            None
        }
    }
}

struct SearchTask {
    handle: JoinHandle<()>,
    stop_tx: oneshot::Sender<()>,
}

struct Tracker {
    state: MatchmakingState,
    /// Bumped on every `start`; completions from older searches are ignored.
    generation: u64,
    task: Option<SearchTask>,
}

struct Shared {
    my_id: PlayerId,
    repository: Arc<dyn MatchRepository>,
    connection: ConnectionManager,
    events: mpsc::Sender<MatchmakingEvent>,
    config: MatchmakingConfig,
    tracker: Mutex<Tracker>,
}

impl Shared {
    /// Settle the search as matched. Returns `false` if it was already settled.
    async fn resolve(
        &self,
        generation: u64,
        match_id: MatchId,
        snapshot: Option<MatchSnapshot>,
    ) -> bool {
        let mut tracker = self.tracker.lock().await;
        if tracker.generation != generation || !tracker.state.is_searching() {
            debug!(match_id, "pairing arrived after the search settled");
            return false;
        }
        tracker.state = MatchmakingState::Matched { match_id };
        if let Some(task) = tracker.task.take() {
            let _ = task.stop_tx.send(());
        }
        info!(my_id = self.my_id, match_id, "matched");
        emit_event(
            &self.events,
            MatchmakingEvent::Matched {
                match_id,
                snapshot: snapshot.map(Box::new),
            },
        );
        true
    }

    async fn fail(&self, generation: u64, message: String) -> bool {
        let mut tracker = self.tracker.lock().await;
        if tracker.generation != generation || !tracker.state.is_searching() {
            return false;
        }
        tracker.state = MatchmakingState::Errored {
            message: message.clone(),
        };
        if let Some(task) = tracker.task.take() {
            let _ = task.stop_tx.send(());
        }
        warn!(my_id = self.my_id, "matchmaking failed: {message}");
        emit_event(&self.events, MatchmakingEvent::Errored { message });
        true
    }

    /// Ids of ongoing matches already present when the search starts.
    async fn baseline(&self) -> Option<HashSet<MatchId>> {
        match self.repository.player_matches(self.my_id).await {
            Ok(matches) => Some(
                matches
                    .iter()
                    .filter(|m| m.is_ongoing())
                    .map(|m| m.id)
                    .collect(),
            ),
            Err(e) => {
                warn!(my_id = self.my_id, "match list unavailable, polling disabled: {e}");
                None
            }
        }
    }

    async fn poll_once(&self, baseline: &HashSet<MatchId>) -> Option<MatchSnapshot> {
        match self.repository.player_matches(self.my_id).await {
            Ok(matches) => matches
                .into_iter()
                .find(|m| m.is_ongoing() && !baseline.contains(&m.id)),
            Err(e) => {
                debug!(my_id = self.my_id, "matchmaking poll failed: {e}");
                None
            }
        }
    }
}

/// One player's matchmaking queue membership.
pub struct MatchmakingSession {
    shared: Arc<Shared>,
}

impl MatchmakingSession {
    /// Create an idle session for `my_id`. The connection is only used for the
    /// matchmaking topic and is left open when the search settles.
    pub fn new(
        my_id: PlayerId,
        repository: Arc<dyn MatchRepository>,
        connection: ConnectionManager,
        config: MatchmakingConfig,
    ) -> (Self, mpsc::Receiver<MatchmakingEvent>) {
        let (events, event_rx) = mpsc::channel(config.event_channel_capacity.max(1));
        let shared = Arc::new(Shared {
            my_id,
            repository,
            connection,
            events,
            config,
            tracker: Mutex::new(Tracker {
                state: MatchmakingState::Idle,
                generation: 0,
                task: None,
            }),
        });
        (Self { shared }, event_rx)
    }

    pub async fn state(&self) -> MatchmakingState {
        self.shared.tracker.lock().await.state.clone()
    }

    /// Join the queue for `game_type`.
    ///
    /// Returns the state once the REST join has completed: `Matched` when
    /// the server paired synchronously, `Searching` while waiting.
    ///
    /// # Errors
    ///
    /// [`RooklineError::InvalidState`] while a search is already running, or
    /// the REST join error (the session is then `Errored`).
    pub async fn start(&self, game_type: GameType) -> Result<MatchmakingState> {
        if self.shared.tracker.lock().await.state.is_searching() {
            return Err(RooklineError::InvalidState("already searching".into()));
        }

        let baseline = match self.shared.config.poll_interval {
            Some(_) => self.shared.baseline().await,
            None => None,
        };
        let topic = matchmaking_topic(self.shared.my_id);
        let subscription = match self.shared.connection.subscribe(topic) {
            Ok(sub) => Some(sub),
            Err(e) => {
                warn!(my_id = self.shared.my_id, "matchmaking topic unavailable: {e}");
                None
            }
        };

        let generation = {
            let mut tracker = self.shared.tracker.lock().await;
            if tracker.state.is_searching() {
                return Err(RooklineError::InvalidState("already searching".into()));
            }
            tracker.generation += 1;
            tracker.state = MatchmakingState::Searching { game_type };
            let (stop_tx, stop_rx) = oneshot::channel();
            let handle = tokio::spawn(search_loop(
                Arc::clone(&self.shared),
                tracker.generation,
                subscription,
                baseline,
                stop_rx,
            ));
            tracker.task = Some(SearchTask { handle, stop_tx });
            emit_event(&self.shared.events, MatchmakingEvent::Searching { game_type });
            tracker.generation
        };
        info!(my_id = self.shared.my_id, game_type = game_type.as_str(), "joining queue");

        match self.shared.repository.join_queue(game_type).await {
            Ok(QueueJoin::Matched(snapshot)) => {
                self.shared
                    .resolve(generation, snapshot.id, Some(*snapshot))
                    .await;
            }
            Ok(QueueJoin::Pending) => debug!(my_id = self.shared.my_id, "queued, waiting"),
            Err(e) => {
                if self.shared.fail(generation, e.to_string()).await {
                    return Err(e);
                }
            }
        }
        Ok(self.state().await)
    }

    /// Leave the queue. Tears the search down even if the server call fails.
    ///
    /// A no-op unless a search is running. Returns the final state.
    pub async fn cancel(&self) -> MatchmakingState {
        let task = {
            let mut tracker = self.shared.tracker.lock().await;
            if !tracker.state.is_searching() {
                return tracker.state.clone();
            }
            tracker.state = MatchmakingState::Cancelled;
            tracker.task.take()
        };

        if let Some(task) = task {
            let _ = task.stop_tx.send(());
            let mut handle = task.handle;
            if tokio::time::timeout(self.shared.config.shutdown_timeout, &mut handle)
                .await
                .is_err()
            {
                warn!("matchmaking task did not exit within timeout; aborting task");
                handle.abort();
            }
        }

        if let Err(e) = self.shared.repository.leave_queue().await {
            warn!(my_id = self.shared.my_id, "leave_queue failed: {e}");
        }
        info!(my_id = self.shared.my_id, "matchmaking cancelled");
        emit_event(&self.shared.events, MatchmakingEvent::Cancelled);
        MatchmakingState::Cancelled
    }
}

impl std::fmt::Debug for MatchmakingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchmakingSession")
            .field("my_id", &self.shared.my_id)
            .finish_non_exhaustive()
    }
}

impl Drop for MatchmakingSession {
    fn drop(&mut self) {
        if let Ok(mut tracker) = self.shared.tracker.try_lock() {
            if let Some(task) = tracker.task.take() {
                task.handle.abort();
            }
        }
    }
}

/// Waits for a pairing push or a poll hit until stopped.
async fn search_loop(
    shared: Arc<Shared>,
    generation: u64,
    mut subscription: Option<Subscription>,
    baseline: Option<HashSet<MatchId>>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut poll = match (shared.config.poll_interval, &baseline) {
        (Some(period), Some(_)) => {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Some(interval)
        }
        _ => None,
    };
    let empty = HashSet::new();
    let known = baseline.as_ref().unwrap_or(&empty);

    loop {
        tokio::select! {
            _ = &mut stop_rx => break,

            body = next_message(&mut subscription) => match body {
                Some(body) => {
                    if let Some((match_id, snapshot)) = parse_pairing(body) {
                        shared.resolve(generation, match_id, snapshot).await;
                        break;
                    }
                    debug!(my_id = shared.my_id, "ignoring unrecognized matchmaking push");
                }
                None => subscription = None,
            },

            () = tick(&mut poll) => {
                if let Some(found) = shared.poll_once(known).await {
                    shared.resolve(generation, found.id, Some(found)).await;
                    break;
                }
            }
        }
    }

    if let Some(sub) = subscription {
        sub.unsubscribe();
    }
    debug!(my_id = shared.my_id, generation, "matchmaking task exited");
}

async fn next_message(subscription: &mut Option<Subscription>) -> Option<serde_json::Value> {
    match subscription {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

async fn tick(poll: &mut Option<Interval>) {
    match poll {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pairing_push_accepts_bare_id() {
        let (id, snapshot) = parse_pairing(json!({ "id": 42 })).unwrap();
        assert_eq!(id, 42);
        assert!(snapshot.is_none());
    }

    #[test]
    fn pairing_push_prefers_embedded_match() {
        let body = json!({
            "type": "MATCH_FOUND",
            "match": {
                "id": 7,
                "player1Id": 1,
                "player2Id": 2,
                "gameType": "BLITZ",
                "status": "ONGOING",
                "fenCurrent": crate::position::STARTING_POSITION,
                "currentPly": 0
            }
        });
        let (id, snapshot) = parse_pairing(body).unwrap();
        assert_eq!(id, 7);
        assert_eq!(snapshot.unwrap().game_type, GameType::Blitz);
    }

    #[test]
    fn pairing_push_without_id_is_dropped() {
        assert!(parse_pairing(json!({ "status": "waiting" })).is_none());
        assert!(parse_pairing(json!("nonsense")).is_none());
    }

    #[test]
    fn config_defaults() {
        let config = MatchmakingConfig::default();
        assert_eq!(config.event_channel_capacity, 64);
        assert_eq!(config.poll_interval, Some(Duration::from_millis(2500)));
        assert_eq!(MatchmakingConfig::new().without_polling().poll_interval, None);
    }
}
