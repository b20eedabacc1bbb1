//! `reqwest`-backed [`MatchRepository`].
//!
//! Every request carries `Authorization: Bearer <token>` read from the
//! [`CredentialProvider`] at call time. Status mapping:
//!
//! | Status         | Error                                   |
//! |----------------|-----------------------------------------|
//! | 401            | [`RooklineError::Unauthorized`]         |
//! | 403            | `ActionRejected { code: Unauthorized }` |
//! | 404            | [`RooklineError::NotFound`]             |
//! | other non-2xx  | [`RooklineError::ActionRejected`]       |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::credentials::CredentialProvider;
use crate::error::{Result, RooklineError};
use crate::error_codes::RejectionCode;
use crate::protocol::{
    CreateMatchRequest, GameAction, GameType, MatchId, MatchSnapshot, MoveCommand, MoveIntent,
    MoveRecord, PlayerId, QueueJoin,
};
use crate::repository::MatchRepository;

/// Default timeout for a whole request.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for establishing the TCP/TLS connection.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for an [`HttpMatchRepository`].
///
/// ```
/// use rookline_client::repositories::HttpRepositoryConfig;
/// use std::time::Duration;
///
/// let config = HttpRepositoryConfig::new("http://localhost:8080/")
///     .with_request_timeout(Duration::from_secs(3));
/// assert_eq!(config.base_url, "http://localhost:8080");
/// ```
#[derive(Debug, Clone)]
pub struct HttpRepositoryConfig {
    /// Server root, without a trailing slash.
    pub base_url: String,
    /// Defaults to **10 seconds**.
    pub request_timeout: Duration,
    /// Defaults to **5 seconds**.
    pub connect_timeout: Duration,
}

impl HttpRepositoryConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// REST client for the match server.
pub struct HttpMatchRepository {
    http: Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpMatchRepository {
    /// Build a repository.
    ///
    /// # Errors
    ///
    /// Returns [`RooklineError::Http`] if the HTTP client cannot be built
    /// (e.g. the TLS backend fails to initialise).
    pub fn new(config: HttpRepositoryConfig, credentials: Arc<dyn CredentialProvider>) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url,
            credentials,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn match_url(&self, match_id: MatchId, action: GameAction) -> String {
        self.url(&format!("/api/matches/{match_id}/{}", action.path()))
    }

    /// Attach the bearer token, send, and map error statuses.
    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let token = self
            .credentials
            .current_token()
            .ok_or_else(|| RooklineError::Unauthorized("not logged in".into()))?;
        let response = request.bearer_auth(token).send().await?;
        check_status(response).await
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = self.send(request).await?;
        Ok(response.json().await?)
    }

    async fn post_action(&self, match_id: MatchId, action: GameAction) -> Result<MatchSnapshot> {
        debug!(match_id, action = action.path(), "posting match action");
        self.send_json(self.http.post(self.match_url(match_id, action)))
            .await
    }
}

impl std::fmt::Debug for HttpMatchRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpMatchRepository")
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Map a non-success response to an error, passing successes through.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = error_message(status, response.text().await.unwrap_or_default());
    warn!(status = status.as_u16(), %message, "request rejected");
    Err(match status {
        StatusCode::UNAUTHORIZED => RooklineError::Unauthorized(message),
        StatusCode::FORBIDDEN => RooklineError::ActionRejected {
            code: RejectionCode::Unauthorized,
            message,
        },
        StatusCode::NOT_FOUND => RooklineError::NotFound(message),
        _ => RooklineError::rejected(message),
    })
}

/// Pull `message` or `error` out of a JSON error body, else use the raw text.
fn error_message(status: StatusCode, body: String) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&body) {
        for key in ["message", "error"] {
            if let Some(text) = value.get(key).and_then(|v| v.as_str()) {
                return text.to_string();
            }
        }
    }
    if body.trim().is_empty() {
        status.to_string()
    } else {
        body
    }
}

#[async_trait]
impl MatchRepository for HttpMatchRepository {
    #[instrument(skip(self))]
    async fn get(&self, match_id: MatchId) -> Result<MatchSnapshot> {
        self.send_json(self.http.get(self.url(&format!("/api/matches/{match_id}"))))
            .await
    }

    #[instrument(skip(self), fields(uci = %intent.to_uci()))]
    async fn submit_move(&self, match_id: MatchId, intent: &MoveIntent) -> Result<MatchSnapshot> {
        let body = MoveCommand::from(intent);
        self.send_json(
            self.http
                .post(self.match_url(match_id, GameAction::Move))
                .json(&body),
        )
        .await
    }

    async fn resign(&self, match_id: MatchId) -> Result<MatchSnapshot> {
        self.post_action(match_id, GameAction::Resign).await
    }

    async fn offer_draw(&self, match_id: MatchId) -> Result<MatchSnapshot> {
        self.post_action(match_id, GameAction::OfferDraw).await
    }

    async fn accept_draw(&self, match_id: MatchId) -> Result<MatchSnapshot> {
        self.post_action(match_id, GameAction::AcceptDraw).await
    }

    async fn decline_draw(&self, match_id: MatchId) -> Result<MatchSnapshot> {
        self.post_action(match_id, GameAction::DeclineDraw).await
    }

    #[instrument(skip(self))]
    async fn join_queue(&self, game_type: GameType) -> Result<QueueJoin> {
        let request = self
            .http
            .post(self.url("/api/matchmaking/join"))
            .query(&[("gameType", game_type.as_str())]);
        let response = self.send(request).await?;
        let created = response.status() == StatusCode::CREATED;
        let body: serde_json::Value = response.json().await?;
        // 200 carries `{"status":"waiting"}`; 201 carries the new match.
        if created || body.get("id").is_some() {
            let snapshot: MatchSnapshot = serde_json::from_value(body)?;
            debug!(match_id = snapshot.id, "paired synchronously");
            Ok(QueueJoin::Matched(Box::new(snapshot)))
        } else {
            Ok(QueueJoin::Pending)
        }
    }

    async fn leave_queue(&self) -> Result<()> {
        self.send(self.http.post(self.url("/api/matchmaking/leave")))
            .await?;
        Ok(())
    }

    async fn move_history(&self, match_id: MatchId) -> Result<Vec<MoveRecord>> {
        self.send_json(
            self.http
                .get(self.url(&format!("/api/matches/{match_id}/history"))),
        )
        .await
    }

    async fn player_matches(&self, player_id: PlayerId) -> Result<Vec<MatchSnapshot>> {
        self.send_json(
            self.http
                .get(self.url(&format!("/api/matches/user/{player_id}"))),
        )
        .await
    }

    async fn create_match(&self, opponent: PlayerId, game_type: GameType) -> Result<MatchSnapshot> {
        let body = CreateMatchRequest {
            player2_id: opponent,
            game_type,
        };
        self.send_json(
            self.http
                .post(self.url("/api/matches/create"))
                .json(&body),
        )
        .await
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
    use crate::credentials::StaticCredentials;
    use crate::position::STARTING_POSITION;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn snapshot_body(ply: u32) -> String {
        serde_json::json!({
            "id": 7, "player1Id": 1, "player2Id": 2, "gameType": "BLITZ",
            "status": "ONGOING", "fenCurrent": STARTING_POSITION, "currentPly": ply
        })
        .to_string()
    }

    /// Serve one HTTP response and hand back the raw request text.
    async fn serve_once(
        status: &'static str,
        body: String,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.ok();
            String::from_utf8_lossy(&request).to_string()
        });
        (format!("http://{addr}"), handle)
    }

    fn repository(base_url: &str, token: Option<&str>) -> HttpMatchRepository {
        let credentials = match token {
            Some(t) => StaticCredentials::new(t),
            None => StaticCredentials::anonymous(),
        };
        HttpMatchRepository::new(HttpRepositoryConfig::new(base_url), Arc::new(credentials)).unwrap()
    }

    #[test]
    fn config_defaults() {
        let config = HttpRepositoryConfig::new("http://h");
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn error_message_prefers_json_fields() {
        assert_eq!(
            error_message(StatusCode::BAD_REQUEST, r#"{"message":"Not your turn"}"#.into()),
            "Not your turn"
        );
        assert_eq!(
            error_message(StatusCode::BAD_REQUEST, r#"{"error":"Invalid move"}"#.into()),
            "Invalid move"
        );
        assert_eq!(error_message(StatusCode::BAD_REQUEST, "plain".into()), "plain");
        assert_eq!(
            error_message(StatusCode::BAD_REQUEST, String::new()),
            "400 Bad Request"
        );
    }

    #[tokio::test]
    async fn submit_move_posts_uci_with_bearer_token() {
        let (url, server) = serve_once("200 OK", snapshot_body(1)).await;
        let repo = repository(&url, Some("tok-1"));

        let intent = MoveIntent::from_uci("e2e4").unwrap();
        let snapshot = repo.submit_move(7, &intent).await.unwrap();
        assert_eq!(snapshot.current_ply, 1);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/matches/7/move "));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer tok-1"));
        assert!(request.contains(r#"{"moveUci":"e2e4"}"#));
    }

    #[tokio::test]
    async fn join_queue_distinguishes_waiting_from_matched() {
        let (url, server) = serve_once("200 OK", r#"{"status":"waiting"}"#.into()).await;
        let repo = repository(&url, Some("t"));
        assert_eq!(repo.join_queue(GameType::Blitz).await.unwrap(), QueueJoin::Pending);
        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/matchmaking/join?gameType=BLITZ "));

        let (url, _server) = serve_once("201 Created", snapshot_body(0)).await;
        let repo = repository(&url, Some("t"));
        match repo.join_queue(GameType::Blitz).await.unwrap() {
            QueueJoin::Matched(snapshot) => assert_eq!(snapshot.id, 7),
            QueueJoin::Pending => panic!("expected a match"),
        }
    }

    #[tokio::test]
    async fn player_matches_lists_by_user() {
        let (url, server) = serve_once("200 OK", format!("[{}]", snapshot_body(4))).await;
        let repo = repository(&url, Some("t"));

        let matches = repo.player_matches(1).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, 7);
        assert_eq!(matches[0].current_ply, 4);

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /api/matches/user/1 "));
    }

    #[tokio::test]
    async fn create_match_posts_opponent_and_game_type() {
        let (url, server) = serve_once("200 OK", snapshot_body(0)).await;
        let repo = repository(&url, Some("t"));

        let snapshot = repo.create_match(2, GameType::Blitz).await.unwrap();
        assert_eq!(snapshot.player2_id, 2);
        assert_eq!(snapshot.game_type, GameType::Blitz);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/matches/create "));
        assert!(request.contains(r#"{"player2Id":2,"gameType":"BLITZ"}"#));
    }

    #[tokio::test]
    async fn status_codes_map_to_errors() {
        let (url, _s) = serve_once("401 Unauthorized", String::new()).await;
        let err = repository(&url, Some("t")).get(7).await.unwrap_err();
        assert!(matches!(err, RooklineError::Unauthorized(_)));

        let (url, _s) = serve_once("404 Not Found", r#"{"message":"Match not found"}"#.into()).await;
        let err = repository(&url, Some("t")).get(7).await.unwrap_err();
        assert!(matches!(err, RooklineError::NotFound(ref m) if m == "Match not found"));

        let (url, _s) =
            serve_once("400 Bad Request", r#"{"message":"Not your turn"}"#.into()).await;
        let err = repository(&url, Some("t")).resign(7).await.unwrap_err();
        assert!(matches!(
            err,
            RooklineError::ActionRejected {
                code: RejectionCode::NotYourTurn,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn missing_token_fails_without_request() {
        let repo = repository("http://127.0.0.1:9", None);
        let err = repo.get(1).await.unwrap_err();
        assert!(err.is_auth_failure());
    }
}
