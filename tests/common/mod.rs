#![allow(
    dead_code,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Shared test utilities for Rookline client integration tests.
//!
//! Provides a channel-driven [`ChannelTransport`] whose far end is a
//! [`ServerEnd`] the test drives, a scripted [`MockConnector`], an in-memory
//! [`MockRepository`] and snapshot/push helpers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use rookline_client::connection::{ConnectionConfig, ConnectionManager, ConnectionPhase};
use rookline_client::credentials::StaticCredentials;
use rookline_client::oracle::{AppliedMove, LegalMoveOracle};
use rookline_client::position::{Square, STARTING_POSITION};
use rookline_client::protocol::{
    ClientFrame, GameType, MatchId, MatchSnapshot, MatchStatus, MoveIntent, MoveRecord, PlayerId,
    QueueJoin, ServerFrame,
};
use rookline_client::{Connector, MatchRepository, RooklineError, Transport};

pub const WHITE: PlayerId = 1;
pub const BLACK: PlayerId = 2;
pub const MATCH: MatchId = 500;

/// How long helpers wait for something to happen before failing the test.
pub const WAIT: Duration = Duration::from_secs(2);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── ChannelTransport ────────────────────────────────────────────────

/// Client side of an in-process channel.
pub struct ChannelTransport {
    to_server: mpsc::UnboundedSender<String>,
    from_server: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicBool>,
}

/// Server side of a [`ChannelTransport`], driven by the test.
pub struct ServerEnd {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
    /// Set once the client calls `close()`.
    pub closed: Arc<AtomicBool>,
}

pub fn channel_pair() -> (ChannelTransport, ServerEnd) {
    let (to_server, from_client) = mpsc::unbounded_channel();
    let (to_client, from_server) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    (
        ChannelTransport {
            to_server,
            from_server,
            closed: Arc::clone(&closed),
        },
        ServerEnd {
            to_client,
            from_client,
            closed,
        },
    )
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, message: String) -> Result<(), RooklineError> {
        self.to_server
            .send(message)
            .map_err(|_| RooklineError::TransportClosed)
    }

    async fn recv(&mut self) -> Option<Result<String, RooklineError>> {
        // `None` once the test drops its ServerEnd.
        self.from_server.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), RooklineError> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

impl ServerEnd {
    /// Next frame the client wrote.
    pub async fn next_frame(&mut self) -> ClientFrame {
        let text = tokio::time::timeout(WAIT, self.from_client.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client side dropped");
        serde_json::from_str(&text).expect("client frame should parse")
    }

    /// Next frame, or `None` if nothing arrives within `wait`.
    pub async fn try_next_frame(&mut self, wait: Duration) -> Option<ClientFrame> {
        match tokio::time::timeout(wait, self.from_client.recv()).await {
            Ok(Some(text)) => Some(serde_json::from_str(&text).expect("client frame should parse")),
            _ => None,
        }
    }

    /// Skip frames until a subscribe for `topic` arrives; returns its id.
    pub async fn expect_subscribe(&mut self, topic: &str) -> String {
        loop {
            if let ClientFrame::Subscribe { id, topic: t } = self.next_frame().await {
                if t == topic {
                    return id;
                }
            }
        }
    }

    /// Skip frames until a publish arrives.
    pub async fn expect_publish(&mut self) -> (String, Value) {
        loop {
            if let ClientFrame::Publish { destination, body } = self.next_frame().await {
                return (destination, body);
            }
        }
    }

    /// Deliver `body` on `topic`.
    pub fn push(&self, topic: &str, body: Value) {
        let frame = ServerFrame::Message {
            subscription: None,
            topic: topic.to_string(),
            body,
        };
        self.send_raw(serde_json::to_string(&frame).unwrap());
    }

    pub fn send_raw(&self, text: String) {
        let _ = self.to_client.send(text);
    }
}

// ── MockConnector ───────────────────────────────────────────────────

/// Result of one scripted connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Accept,
    /// Transient failure.
    Fail,
    /// Credential rejected.
    Reject,
}

/// Connector that follows a script. Accepted connections hand their
/// [`ServerEnd`] to the test through the receiver returned by `new`.
pub struct MockConnector {
    script: StdMutex<VecDeque<ConnectOutcome>>,
    tokens: StdMutex<Vec<Option<String>>>,
    servers: mpsc::UnboundedSender<ServerEnd>,
}

impl MockConnector {
    /// Attempts beyond the script fail transiently.
    pub fn new(script: Vec<ConnectOutcome>) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (servers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            script: StdMutex::new(VecDeque::from(script)),
            tokens: StdMutex::new(Vec::new()),
            servers,
        });
        (connector, rx)
    }

    /// Tokens seen by each attempt, in order.
    pub fn tokens(&self) -> Vec<Option<String>> {
        self.tokens.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.tokens.lock().unwrap().len()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, token: Option<String>) -> Result<Box<dyn Transport>, RooklineError> {
        self.tokens.lock().unwrap().push(token);
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ConnectOutcome::Fail);
        match outcome {
            ConnectOutcome::Accept => {
                let (transport, server) = channel_pair();
                let _ = self.servers.send(server);
                Ok(Box::new(transport))
            }
            ConnectOutcome::Fail => Err(RooklineError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "scripted failure",
            ))),
            ConnectOutcome::Reject => Err(RooklineError::Unauthorized("scripted rejection".into())),
        }
    }
}

pub fn fast_connection_config() -> ConnectionConfig {
    ConnectionConfig::new()
        .with_reconnect_delay(Duration::from_millis(20))
        .with_shutdown_timeout(Duration::from_millis(200))
}

/// Connection manager over a scripted connector with a static token.
pub fn connection_with(
    script: Vec<ConnectOutcome>,
) -> (
    ConnectionManager,
    Arc<MockConnector>,
    mpsc::UnboundedReceiver<ServerEnd>,
) {
    connection_with_config(script, fast_connection_config())
}

pub fn connection_with_config(
    script: Vec<ConnectOutcome>,
    config: ConnectionConfig,
) -> (
    ConnectionManager,
    Arc<MockConnector>,
    mpsc::UnboundedReceiver<ServerEnd>,
) {
    let (connector, servers) = MockConnector::new(script);
    let manager = ConnectionManager::connect(
        connector.clone(),
        Arc::new(StaticCredentials::new("test-token")),
        config,
    );
    (manager, connector, servers)
}

/// Connection manager whose connector never succeeds. Stays `Connecting`
/// (retrying in the background) so every action goes over REST.
pub fn offline_connection() -> ConnectionManager {
    let (manager, _connector, _servers) = connection_with(vec![]);
    manager
}

pub async fn next_server(servers: &mut mpsc::UnboundedReceiver<ServerEnd>) -> ServerEnd {
    tokio::time::timeout(WAIT, servers.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("connector dropped")
}

/// Wait until the manager's phase satisfies `pred`.
pub async fn wait_for_phase(
    manager: &ConnectionManager,
    pred: impl Fn(&ConnectionPhase) -> bool,
) -> ConnectionPhase {
    let mut phases = manager.phases();
    tokio::time::timeout(WAIT, async {
        loop {
            let current = phases.borrow_and_update().clone();
            if pred(&current) {
                return current;
            }
            if phases.changed().await.is_err() {
                return manager.phase();
            }
        }
    })
    .await
    .expect("timed out waiting for connection phase")
}

/// Receive the next item from `rx` or fail the test.
pub async fn recv_within<T>(rx: &mut mpsc::Receiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Receive items until one matches `pred`.
pub async fn recv_until<T: std::fmt::Debug>(
    rx: &mut mpsc::Receiver<T>,
    pred: impl Fn(&T) -> bool,
) -> T {
    loop {
        let item = recv_within(rx).await;
        if pred(&item) {
            return item;
        }
    }
}

// ── MockRepository ──────────────────────────────────────────────────

/// One recorded repository call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoCall {
    Get(MatchId),
    SubmitMove(MatchId, MoveIntent),
    Resign(MatchId),
    OfferDraw(MatchId),
    AcceptDraw(MatchId),
    DeclineDraw(MatchId),
    JoinQueue(GameType),
    LeaveQueue,
    MoveHistory(MatchId),
    PlayerMatches(PlayerId),
    CreateMatch(PlayerId, GameType),
}

/// In-memory repository.
///
/// `get` serves the stored snapshot. Mutating calls pop scripted responses
/// and fail with a rejection once the script is empty.
#[derive(Default)]
pub struct MockRepository {
    snapshot: StdMutex<Option<MatchSnapshot>>,
    responses: StdMutex<VecDeque<Result<MatchSnapshot, RooklineError>>>,
    join_responses: StdMutex<VecDeque<Result<QueueJoin, RooklineError>>>,
    player_matches: StdMutex<Vec<MatchSnapshot>>,
    history: StdMutex<Vec<MoveRecord>>,
    fail_leave: AtomicBool,
    delay: StdMutex<Duration>,
    calls: StdMutex<Vec<RepoCall>>,
}

impl MockRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_snapshot(snapshot: MatchSnapshot) -> Arc<Self> {
        let repo = Self::new();
        repo.set_snapshot(snapshot);
        repo
    }

    pub fn set_snapshot(&self, snapshot: MatchSnapshot) {
        *self.snapshot.lock().unwrap() = Some(snapshot);
    }

    pub fn push_response(&self, response: Result<MatchSnapshot, RooklineError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn push_join(&self, response: Result<QueueJoin, RooklineError>) {
        self.join_responses.lock().unwrap().push_back(response);
    }

    pub fn set_player_matches(&self, matches: Vec<MatchSnapshot>) {
        *self.player_matches.lock().unwrap() = matches;
    }

    pub fn set_history(&self, history: Vec<MoveRecord>) {
        *self.history.lock().unwrap() = history;
    }

    pub fn fail_leave(&self) {
        self.fail_leave.store(true, Ordering::Relaxed);
    }

    /// Delay applied to every call before it answers.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> Vec<RepoCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls other than `get`, which sessions issue on open and resync.
    pub fn action_calls(&self) -> Vec<RepoCall> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, RepoCall::Get(_) | RepoCall::PlayerMatches(_)))
            .collect()
    }

    async fn record(&self, call: RepoCall) {
        self.calls.lock().unwrap().push(call);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn next_response(&self) -> Result<MatchSnapshot, RooklineError> {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(RooklineError::rejected("no scripted response")))
    }
}

#[async_trait]
impl MatchRepository for MockRepository {
    async fn get(&self, match_id: MatchId) -> Result<MatchSnapshot, RooklineError> {
        self.record(RepoCall::Get(match_id)).await;
        self.snapshot
            .lock()
            .unwrap()
            .clone()
            .filter(|s| s.id == match_id)
            .ok_or_else(|| RooklineError::NotFound(format!("match {match_id}")))
    }

    async fn submit_move(
        &self,
        match_id: MatchId,
        intent: &MoveIntent,
    ) -> Result<MatchSnapshot, RooklineError> {
        self.record(RepoCall::SubmitMove(match_id, *intent)).await;
        self.next_response()
    }

    async fn resign(&self, match_id: MatchId) -> Result<MatchSnapshot, RooklineError> {
        self.record(RepoCall::Resign(match_id)).await;
        self.next_response()
    }

    async fn offer_draw(&self, match_id: MatchId) -> Result<MatchSnapshot, RooklineError> {
        self.record(RepoCall::OfferDraw(match_id)).await;
        self.next_response()
    }

    async fn accept_draw(&self, match_id: MatchId) -> Result<MatchSnapshot, RooklineError> {
        self.record(RepoCall::AcceptDraw(match_id)).await;
        self.next_response()
    }

    async fn decline_draw(&self, match_id: MatchId) -> Result<MatchSnapshot, RooklineError> {
        self.record(RepoCall::DeclineDraw(match_id)).await;
        self.next_response()
    }

    async fn join_queue(&self, game_type: GameType) -> Result<QueueJoin, RooklineError> {
        self.record(RepoCall::JoinQueue(game_type)).await;
        self.join_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(QueueJoin::Pending))
    }

    async fn leave_queue(&self) -> Result<(), RooklineError> {
        self.record(RepoCall::LeaveQueue).await;
        if self.fail_leave.load(Ordering::Relaxed) {
            Err(RooklineError::rejected("leave failed"))
        } else {
            Ok(())
        }
    }

    async fn move_history(&self, match_id: MatchId) -> Result<Vec<MoveRecord>, RooklineError> {
        self.record(RepoCall::MoveHistory(match_id)).await;
        Ok(self.history.lock().unwrap().clone())
    }

    async fn player_matches(
        &self,
        player_id: PlayerId,
    ) -> Result<Vec<MatchSnapshot>, RooklineError> {
        self.record(RepoCall::PlayerMatches(player_id)).await;
        Ok(self.player_matches.lock().unwrap().clone())
    }

    async fn create_match(
        &self,
        opponent: PlayerId,
        game_type: GameType,
    ) -> Result<MatchSnapshot, RooklineError> {
        self.record(RepoCall::CreateMatch(opponent, game_type)).await;
        self.next_response()
    }
}

// ── ScriptedOracle ──────────────────────────────────────────────────

/// Oracle that only knows the moves it was told about.
#[derive(Default)]
pub struct ScriptedOracle {
    moves: StdMutex<HashMap<Square, Vec<Square>>>,
}

impl ScriptedOracle {
    pub fn allowing(moves: &[(&str, &str)]) -> Arc<Self> {
        let oracle = Self::default();
        {
            let mut table = oracle.moves.lock().unwrap();
            for (from, to) in moves {
                table
                    .entry(sq(from))
                    .or_default()
                    .push(sq(to));
            }
        }
        Arc::new(oracle)
    }
}

impl LegalMoveOracle for ScriptedOracle {
    fn legal_targets(&self, _position: &str, square: Square) -> Vec<Square> {
        self.moves
            .lock()
            .unwrap()
            .get(&square)
            .cloned()
            .unwrap_or_default()
    }

    fn apply(&self, position: &str, intent: &MoveIntent) -> Result<AppliedMove, RooklineError> {
        if self.legal_targets(position, intent.from).contains(&intent.to) {
            Ok(AppliedMove {
                position: position.to_string(),
                terminal: None,
            })
        } else {
            Err(RooklineError::IllegalMove(intent.to_uci()))
        }
    }
}

// ── Snapshot and push helpers ───────────────────────────────────────

pub fn sq(name: &str) -> Square {
    name.parse().expect("valid square")
}

pub const AFTER_E4: &str = "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq - 0 1";
pub const AFTER_E4_E5: &str = "rnbqkbnr/pppp1ppp/8/4p3/4P3/8/PPPP1PPP/RNBQKBNR w KQkq - 0 2";
pub const AFTER_E4_E5_NF3: &str =
    "rnbqkbnr/pppp1ppp/8/4p3/4P3/5N2/PPPP1PPP/RNBQKB1R b KQkq - 1 2";

/// Ongoing match `MATCH` at the starting position, WHITE vs BLACK.
pub fn snapshot() -> MatchSnapshot {
    MatchSnapshot {
        id: MATCH,
        player1_id: WHITE,
        player2_id: BLACK,
        game_type: GameType::Rapid,
        status: MatchStatus::Ongoing,
        position_notation: STARTING_POSITION.to_string(),
        last_move_notation: None,
        player1_time_left_seconds: Some(600),
        player2_time_left_seconds: Some(600),
        last_move_at: None,
        started_at: Some("2026-01-01T12:00:00".into()),
        created_at: Some("2026-01-01T12:00:00".into()),
        finished_at: None,
        draw_offered_by_player_id: None,
        current_ply: 0,
    }
}

/// `snapshot()` advanced to `ply` with a matching side to move.
pub fn snapshot_at(ply: u32) -> MatchSnapshot {
    let position = match ply {
        0 => STARTING_POSITION,
        1 => AFTER_E4,
        2 => AFTER_E4_E5,
        n if n % 2 == 1 => AFTER_E4_E5_NF3,
        _ => AFTER_E4_E5,
    };
    MatchSnapshot {
        position_notation: position.to_string(),
        last_move_notation: (ply > 0).then(|| "e2e4".to_string()),
        current_ply: ply,
        ..snapshot()
    }
}

pub fn push(kind: &str, snapshot: &MatchSnapshot) -> Value {
    json!({ "type": kind, "match": snapshot })
}

pub fn move_push(snapshot: &MatchSnapshot) -> Value {
    json!({
        "type": "MOVE_MADE",
        "match": snapshot,
        "moveUci": snapshot.last_move_notation,
    })
}

pub fn error_push(message: &str) -> Value {
    json!({ "type": "ERROR", "error": message })
}
