//! Integration tests for `MatchmakingSession`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use rookline_client::connection::ConnectionPhase;
use rookline_client::protocol::{matchmaking_topic, ClientFrame, GameType, QueueJoin};
use rookline_client::{
    ConnectionManager, MatchmakingConfig, MatchmakingEvent, MatchmakingSession, MatchmakingState,
    RooklineError,
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

use common::{
    connection_with, next_server, offline_connection, recv_until, recv_within, snapshot,
    wait_for_phase, ConnectOutcome, MockRepository, RepoCall, ServerEnd, MATCH, WAIT, WHITE,
};

fn session(
    repo: &Arc<MockRepository>,
    connection: ConnectionManager,
    config: MatchmakingConfig,
) -> (MatchmakingSession, mpsc::Receiver<MatchmakingEvent>) {
    MatchmakingSession::new(WHITE, repo.clone(), connection, config)
}

async fn live_connection() -> (ConnectionManager, ServerEnd) {
    let (connection, _connector, mut servers) = connection_with(vec![ConnectOutcome::Accept]);
    let server = next_server(&mut servers).await;
    wait_for_phase(&connection, ConnectionPhase::is_live).await;
    (connection, server)
}

fn is_matched(event: &MatchmakingEvent) -> bool {
    matches!(event, MatchmakingEvent::Matched { .. })
}

#[tokio::test]
async fn push_resolves_a_pending_search_once() {
    common::init_tracing();
    let repo = MockRepository::new();
    let (connection, mut server) = live_connection().await;
    let (mm, mut events) = session(&repo, connection, MatchmakingConfig::new().without_polling());

    let state = assert_ok!(mm.start(GameType::Blitz).await);
    assert_eq!(
        state,
        MatchmakingState::Searching {
            game_type: GameType::Blitz
        }
    );
    assert_eq!(repo.calls(), vec![RepoCall::JoinQueue(GameType::Blitz)]);
    assert_eq!(
        recv_within(&mut events).await,
        MatchmakingEvent::Searching {
            game_type: GameType::Blitz
        }
    );

    let topic = matchmaking_topic(WHITE);
    let sub_id = server.expect_subscribe(&topic).await;
    server.push(&topic, json!({ "id": 42 }));
    server.push(&topic, json!({ "id": 43 }));

    assert_eq!(
        recv_within(&mut events).await,
        MatchmakingEvent::Matched {
            match_id: 42,
            snapshot: None
        }
    );
    assert_eq!(mm.state().await, MatchmakingState::Matched { match_id: 42 });

    // The subscription is torn down and nothing else is reported.
    assert_eq!(server.next_frame().await, ClientFrame::Unsubscribe { id: sub_id });
    assert!(
        tokio::time::timeout(Duration::from_millis(100), events.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn synchronous_pairing_wins_over_later_push() {
    let repo = MockRepository::new();
    repo.push_join(Ok(QueueJoin::Matched(Box::new(snapshot()))));
    let (connection, server) = live_connection().await;
    let (mm, mut events) = session(&repo, connection, MatchmakingConfig::new().without_polling());

    let state = assert_ok!(mm.start(GameType::Rapid).await);
    assert_eq!(state, MatchmakingState::Matched { match_id: MATCH });

    let matched = recv_until(&mut events, is_matched).await;
    assert_eq!(
        matched,
        MatchmakingEvent::Matched {
            match_id: MATCH,
            snapshot: Some(Box::new(snapshot()))
        }
    );

    server.push(&matchmaking_topic(WHITE), json!({ "id": 77 }));
    assert!(
        tokio::time::timeout(Duration::from_millis(100), events.recv())
            .await
            .is_err()
    );
    assert_eq!(mm.state().await, MatchmakingState::Matched { match_id: MATCH });
}

#[tokio::test]
async fn join_failure_errors_the_search() {
    let repo = MockRepository::new();
    repo.push_join(Err(RooklineError::Unauthorized("expired".into())));
    let (mm, mut events) = session(
        &repo,
        offline_connection(),
        MatchmakingConfig::new().without_polling(),
    );

    let err = assert_err!(mm.start(GameType::Bullet).await);
    assert!(err.is_auth_failure());
    assert!(matches!(mm.state().await, MatchmakingState::Errored { .. }));
    recv_until(&mut events, |e| matches!(e, MatchmakingEvent::Errored { .. })).await;

    // A new search may start after an error.
    assert_ok!(mm.start(GameType::Bullet).await);
    assert!(mm.state().await.is_searching());
}

#[tokio::test]
async fn cancel_leaves_the_queue_and_is_final() {
    let repo = MockRepository::new();
    repo.fail_leave();
    let (connection, mut server) = live_connection().await;
    let (mm, mut events) = session(&repo, connection, MatchmakingConfig::new().without_polling());

    mm.start(GameType::Classical).await.unwrap();
    let topic = matchmaking_topic(WHITE);
    server.expect_subscribe(&topic).await;

    // A failing leave call still ends the search.
    assert_eq!(mm.cancel().await, MatchmakingState::Cancelled);
    assert_eq!(mm.cancel().await, MatchmakingState::Cancelled);
    assert_eq!(
        repo.calls(),
        vec![RepoCall::JoinQueue(GameType::Classical), RepoCall::LeaveQueue]
    );
    recv_until(&mut events, |e| *e == MatchmakingEvent::Cancelled).await;

    server.push(&topic, json!({ "id": 42 }));
    assert!(
        tokio::time::timeout(Duration::from_millis(100), events.recv())
            .await
            .is_err()
    );
    assert_eq!(mm.state().await, MatchmakingState::Cancelled);
}

#[tokio::test]
async fn pairing_that_lands_after_cancel_is_discarded() {
    let repo = MockRepository::new();
    repo.push_join(Ok(QueueJoin::Matched(Box::new(snapshot()))));
    repo.set_delay(Duration::from_millis(150));
    let (mm, mut events) = session(
        &repo,
        offline_connection(),
        MatchmakingConfig::new().without_polling(),
    );
    let mm = Arc::new(mm);

    let starter = tokio::spawn({
        let mm = Arc::clone(&mm);
        async move { mm.start(GameType::Blitz).await }
    });
    tokio::time::timeout(WAIT, async {
        while !repo.calls().contains(&RepoCall::JoinQueue(GameType::Blitz)) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("join never started");

    assert_eq!(mm.cancel().await, MatchmakingState::Cancelled);
    let state = assert_ok!(starter.await.unwrap());
    assert_eq!(state, MatchmakingState::Cancelled);
    assert_eq!(mm.state().await, MatchmakingState::Cancelled);

    let mut seen = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(100), events.recv()).await {
        seen.push(event);
    }
    assert_eq!(
        seen,
        vec![
            MatchmakingEvent::Searching {
                game_type: GameType::Blitz
            },
            MatchmakingEvent::Cancelled
        ]
    );
}

#[tokio::test]
async fn cancel_without_search_is_a_noop() {
    let repo = MockRepository::new();
    let (mm, _events) = session(&repo, offline_connection(), MatchmakingConfig::new());
    assert_eq!(mm.cancel().await, MatchmakingState::Idle);
    assert!(repo.calls().is_empty());
}

#[tokio::test]
async fn second_start_while_searching_is_refused() {
    let repo = MockRepository::new();
    let (mm, _events) = session(
        &repo,
        offline_connection(),
        MatchmakingConfig::new().without_polling(),
    );
    mm.start(GameType::Blitz).await.unwrap();
    assert!(matches!(
        mm.start(GameType::Rapid).await,
        Err(RooklineError::InvalidState(_))
    ));
}

#[tokio::test]
async fn polling_finds_a_new_ongoing_match() {
    let repo = MockRepository::new();
    let mut existing = snapshot();
    existing.id = 7;
    repo.set_player_matches(vec![existing.clone()]);

    let config = MatchmakingConfig::new().with_poll_interval(Duration::from_millis(30));
    let (mm, mut events) = session(&repo, offline_connection(), config);
    mm.start(GameType::Rapid).await.unwrap();

    // Matches that were already running do not count.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(mm.state().await.is_searching());

    let mut fresh = snapshot();
    fresh.id = 8;
    repo.set_player_matches(vec![existing, fresh.clone()]);

    let matched = recv_until(&mut events, is_matched).await;
    assert_eq!(
        matched,
        MatchmakingEvent::Matched {
            match_id: 8,
            snapshot: Some(Box::new(fresh))
        }
    );
    assert_eq!(mm.state().await, MatchmakingState::Matched { match_id: 8 });
}
