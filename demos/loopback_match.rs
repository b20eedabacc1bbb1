//! # Loopback Match Example
//!
//! Plays a short scripted match against an in-process server:
//!
//! 1. Open a `MatchSession` over a loopback push channel
//! 2. Select and move a pawn; the server confirms and the opponent replies
//! 3. Offer a draw, which the opponent declines
//! 4. Resign and close the session
//!
//! The server half implements both links the session uses: it answers
//! `MatchRepository` calls and pushes snapshots over the channel.
//!
//! ## Running
//!
//! ```sh
//! RUST_LOG=debug cargo run --example loopback_match
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rookline_client::credentials::StaticCredentials;
use rookline_client::position::STARTING_POSITION;
use rookline_client::protocol::{
    game_topic, ClientFrame, GameType, MatchId, MatchSnapshot, MatchStatus, MoveIntent,
    MoveRecord, PlayerId, QueueJoin, ServerFrame,
};
use rookline_client::{
    ConnectionConfig, ConnectionManager, Connector, MatchRepository, MatchSession,
    PermissiveOracle, RooklineError, SessionConfig, SessionEvent, SessionServices, Transport,
};
use serde_json::json;
use tokio::sync::mpsc;

const MATCH_ID: MatchId = 1;
const ME: PlayerId = 10;
const OPPONENT: PlayerId = 20;

const AFTER_E4: &str = "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq - 0 1";
const AFTER_E4_E5: &str = "rnbqkbnr/pppp1ppp/8/4p3/4P3/8/PPPP1PPP/RNBQKBNR w KQkq - 0 2";

// ─────────────────────────────────────────────────────────────────────
// Loopback transport
// ─────────────────────────────────────────────────────────────────────

struct LoopbackTransport {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, message: String) -> Result<(), RooklineError> {
        self.tx
            .send(message)
            .map_err(|_| RooklineError::TransportClosed)
    }

    async fn recv(&mut self) -> Option<Result<String, RooklineError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), RooklineError> {
        Ok(())
    }
}

/// Opens a loopback channel and starts a server task on its far end.
struct LoopbackConnector {
    server: Arc<DemoServer>,
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, token: Option<String>) -> Result<Box<dyn Transport>, RooklineError> {
        if token.is_none() {
            return Err(RooklineError::Unauthorized("no token".into()));
        }
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        tokio::spawn(Arc::clone(&self.server).serve(server_rx, server_tx));
        Ok(Box::new(LoopbackTransport {
            tx: client_tx,
            rx: client_rx,
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────
// Demo server
// ─────────────────────────────────────────────────────────────────────

struct DemoServer {
    snapshot: Mutex<MatchSnapshot>,
}

impl DemoServer {
    fn new() -> Self {
        Self {
            snapshot: Mutex::new(MatchSnapshot {
                id: MATCH_ID,
                player1_id: ME,
                player2_id: OPPONENT,
                game_type: GameType::Blitz,
                status: MatchStatus::Ongoing,
                position_notation: STARTING_POSITION.into(),
                last_move_notation: None,
                player1_time_left_seconds: Some(180),
                player2_time_left_seconds: Some(180),
                last_move_at: None,
                started_at: None,
                created_at: None,
                finished_at: None,
                draw_offered_by_player_id: None,
                current_ply: 0,
            }),
        }
    }

    fn current(&self) -> MatchSnapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn update(&self, change: impl FnOnce(&mut MatchSnapshot)) -> MatchSnapshot {
        let mut snapshot = self
            .snapshot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        change(&mut snapshot);
        snapshot.clone()
    }

    async fn serve(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<String>,
        tx: mpsc::UnboundedSender<String>,
    ) {
        let topic = game_topic(MATCH_ID);
        let push = |kind: &str, snapshot: &MatchSnapshot| {
            let frame = ServerFrame::Message {
                subscription: None,
                topic: topic.clone(),
                body: json!({ "type": kind, "match": snapshot, "moveUci": snapshot.last_move_notation }),
            };
            if let Ok(text) = serde_json::to_string(&frame) {
                let _ = tx.send(text);
            }
        };

        while let Some(text) = rx.recv().await {
            let Ok(ClientFrame::Publish { destination, .. }) = serde_json::from_str(&text) else {
                continue;
            };
            let action = destination.rsplit_once(&format!("/{MATCH_ID}/")).map(|(_, a)| a);
            match action {
                Some("move") => {
                    let mine = self.update(|s| {
                        s.position_notation = AFTER_E4.into();
                        s.last_move_notation = Some("e2e4".into());
                        s.current_ply += 1;
                    });
                    push("MOVE_MADE", &mine);

                    tokio::time::sleep(Duration::from_millis(300)).await;
                    let reply = self.update(|s| {
                        s.position_notation = AFTER_E4_E5.into();
                        s.last_move_notation = Some("e7e5".into());
                        s.current_ply += 1;
                    });
                    push("MOVE_MADE", &reply);
                }
                Some("draw") => {
                    let offered = self.update(|s| s.draw_offered_by_player_id = Some(ME));
                    push("DRAW_OFFERED", &offered);

                    tokio::time::sleep(Duration::from_millis(300)).await;
                    let declined = self.update(|s| s.draw_offered_by_player_id = None);
                    push("DRAW_DECLINED", &declined);
                }
                Some("resign") => {
                    let resigned = self.update(|s| s.status = MatchStatus::Player2Won);
                    push("RESIGNED", &resigned);
                }
                _ => tracing::warn!(%destination, "demo server ignores destination"),
            }
        }
    }
}

fn unsupported<T>() -> Result<T, RooklineError> {
    Err(RooklineError::rejected("not supported by the demo server"))
}

#[async_trait]
impl MatchRepository for DemoServer {
    async fn get(&self, match_id: MatchId) -> Result<MatchSnapshot, RooklineError> {
        if match_id == MATCH_ID {
            Ok(self.current())
        } else {
            Err(RooklineError::NotFound(format!("match {match_id}")))
        }
    }

    async fn submit_move(&self, _: MatchId, _: &MoveIntent) -> Result<MatchSnapshot, RooklineError> {
        unsupported()
    }

    async fn resign(&self, _: MatchId) -> Result<MatchSnapshot, RooklineError> {
        Ok(self.update(|s| s.status = MatchStatus::Player2Won))
    }

    async fn offer_draw(&self, _: MatchId) -> Result<MatchSnapshot, RooklineError> {
        unsupported()
    }

    async fn accept_draw(&self, _: MatchId) -> Result<MatchSnapshot, RooklineError> {
        unsupported()
    }

    async fn decline_draw(&self, _: MatchId) -> Result<MatchSnapshot, RooklineError> {
        unsupported()
    }

    async fn join_queue(&self, _: GameType) -> Result<QueueJoin, RooklineError> {
        Ok(QueueJoin::Pending)
    }

    async fn leave_queue(&self) -> Result<(), RooklineError> {
        Ok(())
    }

    async fn move_history(&self, _: MatchId) -> Result<Vec<MoveRecord>, RooklineError> {
        Ok(Vec::new())
    }

    async fn player_matches(&self, _: PlayerId) -> Result<Vec<MatchSnapshot>, RooklineError> {
        Ok(vec![self.current()])
    }

    async fn create_match(&self, _: PlayerId, _: GameType) -> Result<MatchSnapshot, RooklineError> {
        unsupported()
    }
}

// ─────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let server = Arc::new(DemoServer::new());
    let connection = ConnectionManager::connect(
        Arc::new(LoopbackConnector {
            server: Arc::clone(&server),
        }),
        Arc::new(StaticCredentials::new("demo-token")),
        ConnectionConfig::new(),
    );
    let services = SessionServices::new(server, Arc::new(PermissiveOracle), connection.clone());
    let (mut session, mut events) =
        MatchSession::open(MATCH_ID, ME, services, SessionConfig::new()).await?;

    // Wait for the channel so actions are published rather than sent over REST.
    let mut phases = connection.phases();
    phases.wait_for(|p| p.is_live()).await?;

    session.select_square("e2".parse()?).await?;
    let submitted = session.attempt_move("e2".parse()?, "e4".parse()?, None).await?;
    tracing::info!(uci = %submitted.intent.to_uci(), outcome = ?submitted.outcome, "move sent");

    let mut offered = false;
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::SnapshotUpdated { snapshot, via } => {
                let clock = session.clock_now().await;
                tracing::info!(
                    ply = snapshot.current_ply,
                    via = via.map_or("rest", |k| k.as_str()),
                    white = clock.white_seconds(),
                    black = clock.black_seconds(),
                    "position {}",
                    snapshot.position_notation
                );
                if snapshot.current_ply == 2 && !offered {
                    offered = true;
                    session.offer_draw().await?;
                }
            }
            SessionEvent::DrawNegotiationChanged(state) => {
                tracing::info!(?state, "draw negotiation");
                if state == rookline_client::DrawNegotiation::None {
                    session.resign().await?;
                }
            }
            SessionEvent::GameOver(outcome) => {
                tracing::info!(?outcome, "game over");
                break;
            }
            other => tracing::debug!(?other, "event"),
        }
    }

    session.close().await;
    Ok(())
}
