//! Realtime channel lifecycle.
//!
//! [`ConnectionManager`] is a cheaply cloneable handle to a background task
//! that owns one physical channel. The task connects through a [`Connector`],
//! re-sends every live subscription after each (re)connect, routes incoming
//! messages to [`Subscription`]s and reconnects with a fixed delay when the
//! transport drops. A rejected credential ends the task for good.
//!
//! Phase transitions are published on a `watch` channel:
//!
//! ```text
//! Connecting ──► Live ──► Reconnecting ──► Live ...
//!      │          │            │
//!      └──────────┴────────────┴──► Disconnected (close / auth rejected)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let manager = ConnectionManager::connect(connector, credentials, ConnectionConfig::new());
//! let mut sub = manager.subscribe("/topic/game/7")?;
//! while let Some(body) = sub.recv().await {
//!     println!("{body}");
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};

use crate::credentials::CredentialProvider;
use crate::error::{Result, RooklineError};
use crate::protocol::{ClientFrame, ServerFrame};
use crate::transport::{Connector, Transport};

/// Default delay between connection attempts.
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Default capacity of each subscription's message buffer.
const DEFAULT_SUBSCRIPTION_CAPACITY: usize = 64;

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`ConnectionManager`].
///
/// ```
/// use rookline_client::connection::ConnectionConfig;
/// use std::time::Duration;
///
/// let config = ConnectionConfig::new().with_reconnect_delay(Duration::from_secs(5));
/// assert_eq!(config.reconnect_delay, Duration::from_secs(5));
/// assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Fixed delay before each retry after a failed attempt or a dropped
    /// transport. Defaults to **3 seconds**.
    pub reconnect_delay: Duration,
    /// Time the background task gets to close the transport on
    /// [`ConnectionManager::close`] before it is aborted.
    /// Defaults to **1 second**.
    pub shutdown_timeout: Duration,
    /// Messages buffered per subscription before new ones are dropped.
    /// Defaults to **64**. Values below 1 are clamped to 1.
    pub subscription_capacity: usize,
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            subscription_capacity: DEFAULT_SUBSCRIPTION_CAPACITY,
        }
    }

    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_subscription_capacity(mut self, capacity: usize) -> Self {
        self.subscription_capacity = capacity.max(1);
        self
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ── Phases ──────────────────────────────────────────────────────────

/// Why a channel ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// [`ConnectionManager::close`] was called.
    Closed,
    /// The credential was missing or refused.
    AuthRejected(String),
}

/// Lifecycle phase of the realtime channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// First connection attempt(s) in progress.
    Connecting,
    /// Connected; subscriptions are active and publishing works.
    Live,
    /// The transport dropped after having been live; retrying.
    Reconnecting,
    /// Terminal.
    Disconnected { reason: DisconnectReason },
}

impl ConnectionPhase {
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live)
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected { .. })
    }
}

// ── Commands ────────────────────────────────────────────────────────

enum Command {
    Subscribe {
        id: String,
        topic: String,
        tx: mpsc::Sender<serde_json::Value>,
    },
    Unsubscribe {
        id: String,
    },
    Publish {
        destination: String,
        body: serde_json::Value,
        ack: oneshot::Sender<Result<()>>,
    },
}

// ── Handle ──────────────────────────────────────────────────────────

struct Inner {
    cmd_tx: mpsc::UnboundedSender<Command>,
    phase: Arc<watch::Sender<ConnectionPhase>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    shutdown_timeout: Duration,
    subscription_capacity: usize,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // No executor context here; abort instead of a graceful close.
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

/// Handle to one realtime channel.
///
/// Clones share the channel. The background task is aborted when the last
/// clone is dropped; call [`close`](Self::close) for a graceful shutdown.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Spawn the connection task and start connecting.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialProvider>,
        config: ConnectionConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let phase = Arc::new(watch::Sender::new(ConnectionPhase::Connecting));

        let task = tokio::spawn(
            ConnectionLoop {
                connector,
                credentials,
                reconnect_delay: config.reconnect_delay,
                cmd_rx,
                shutdown_rx,
                phase: Arc::clone(&phase),
                routes: HashMap::new(),
                been_live: false,
            }
            .run(),
        );

        Self {
            inner: Arc::new(Inner {
                cmd_tx,
                phase,
                task: Mutex::new(Some(task)),
                shutdown_tx: Mutex::new(Some(shutdown_tx)),
                shutdown_timeout: config.shutdown_timeout,
                subscription_capacity: config.subscription_capacity.max(1),
            }),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> ConnectionPhase {
        self.inner.phase.borrow().clone()
    }

    /// Receiver notified on every phase transition.
    pub fn phases(&self) -> watch::Receiver<ConnectionPhase> {
        self.inner.phase.subscribe()
    }

    pub fn is_live(&self) -> bool {
        self.inner.phase.borrow().is_live()
    }

    /// Register interest in `topic`.
    ///
    /// Works in every phase except `Disconnected`; while not live the
    /// subscription is recorded and sent on the next connect.
    ///
    /// # Errors
    ///
    /// Returns [`RooklineError::NotConnected`] once the channel has ended.
    pub fn subscribe(&self, topic: impl Into<String>) -> Result<Subscription> {
        let topic = topic.into();
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.inner.subscription_capacity);
        self.inner
            .cmd_tx
            .send(Command::Subscribe {
                id: id.clone(),
                topic: topic.clone(),
                tx,
            })
            .map_err(|_| RooklineError::NotConnected)?;
        debug!(%topic, %id, "subscription registered");
        Ok(Subscription {
            id,
            topic,
            rx,
            cmd_tx: self.inner.cmd_tx.clone(),
            active: true,
        })
    }

    /// Publish `body` to an application destination.
    ///
    /// There is no outbound queue: the call fails unless the channel is live
    /// at the time the frame is written.
    ///
    /// # Errors
    ///
    /// Returns [`RooklineError::NotConnected`] when not live, or
    /// [`RooklineError::TransportSend`] if the write fails.
    pub async fn publish(&self, destination: impl Into<String>, body: serde_json::Value) -> Result<()> {
        if !self.is_live() {
            return Err(RooklineError::NotConnected);
        }
        let (ack, ack_rx) = oneshot::channel();
        self.inner
            .cmd_tx
            .send(Command::Publish {
                destination: destination.into(),
                body,
                ack,
            })
            .map_err(|_| RooklineError::NotConnected)?;
        ack_rx.await.map_err(|_| RooklineError::NotConnected)?
    }

    /// Close the channel and stop the background task. Idempotent.
    pub async fn close(&self) {
        if let Some(tx) = self.inner.shutdown_tx.lock().await.take() {
            debug!("ConnectionManager: close requested");
            let _ = tx.send(());
        }

        if let Some(mut task) = self.inner.task.lock().await.take() {
            match tokio::time::timeout(self.inner.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("connection task terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("connection task did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("connection task aborted: {join_err}");
                    }
                }
            }
        }

        // An aborted task never got to publish the final phase.
        self.inner.phase.send_if_modified(|phase| {
            if phase.is_disconnected() {
                false
            } else {
                *phase = ConnectionPhase::Disconnected {
                    reason: DisconnectReason::Closed,
                };
                true
            }
        });
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("phase", &self.phase())
            .finish()
    }
}

// ── Subscription ────────────────────────────────────────────────────

/// Messages published on one topic.
///
/// Dropping the subscription unsubscribes it.
#[derive(Debug)]
pub struct Subscription {
    id: String,
    topic: String,
    rx: mpsc::Receiver<serde_json::Value>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    active: bool,
}

impl Subscription {
    /// Next message body. Returns `None` once the channel has ended.
    ///
    /// Cancel-safe.
    pub async fn recv(&mut self) -> Option<serde_json::Value> {
        self.rx.recv().await
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Stop receiving messages.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if std::mem::take(&mut self.active) {
            // The task may already be gone; nothing left to unsubscribe then.
            let _ = self.cmd_tx.send(Command::Unsubscribe {
                id: self.id.clone(),
            });
            debug!(topic = %self.topic, id = %self.id, "unsubscribed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Subscribe { id, topic, .. } => {
                write!(f, "Subscribe({id}, {topic})")
            }
            Self::Unsubscribe { id } => write!(f, "Unsubscribe({id})"),
            Self::Publish { destination, .. } => write!(f, "Publish({destination})"),
        }
    }
}

// ── Connection loop ─────────────────────────────────────────────────

struct Route {
    topic: String,
    tx: mpsc::Sender<serde_json::Value>,
}

/// How a live or waiting stretch of the loop ended.
enum Exit {
    /// Keep going with the next step.
    Continue,
    /// The transport failed; reconnect.
    Lost(String),
    /// Close requested or every handle dropped.
    Shutdown,
}

struct ConnectionLoop {
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialProvider>,
    reconnect_delay: Duration,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    shutdown_rx: oneshot::Receiver<()>,
    phase: Arc<watch::Sender<ConnectionPhase>>,
    routes: HashMap<String, Route>,
    /// Set once the first channel reached `Live`; until then losses stay `Connecting`.
    been_live: bool,
}

impl ConnectionLoop {
    async fn run(mut self) {
        debug!("connection task started");
        let mut first_attempt = true;

        loop {
            if !first_attempt {
                if let Exit::Shutdown = self.wait_offline(self.reconnect_delay).await {
                    break;
                }
            }
            first_attempt = false;

            let Some(token) = self.credentials.current_token() else {
                self.fail_auth("no credential available".into());
                return;
            };

            let transport = match self.connect_offline(token).await {
                Err(Exit::Shutdown) => break,
                Err(_) => continue,
                Ok(Err(e)) if e.is_auth_failure() => {
                    self.fail_auth(e.to_string());
                    return;
                }
                Ok(Err(e)) => {
                    warn!("connection attempt failed: {e}");
                    continue;
                }
                Ok(Ok(transport)) => transport,
            };

            match self.run_live(transport).await {
                Exit::Shutdown => break,
                Exit::Lost(reason) if self.been_live => {
                    warn!(%reason, "channel lost; reconnecting");
                    self.set_phase(ConnectionPhase::Reconnecting);
                }
                Exit::Lost(reason) => {
                    warn!(%reason, "channel lost before going live; retrying");
                }
                Exit::Continue => {}
            }
        }

        self.set_phase(ConnectionPhase::Disconnected {
            reason: DisconnectReason::Closed,
        });
        debug!("connection task exited");
    }

    fn set_phase(&self, next: ConnectionPhase) {
        self.phase.send_if_modified(|phase| {
            if *phase == next {
                false
            } else {
                info!(from = ?phase, to = ?next, "connection phase changed");
                *phase = next;
                true
            }
        });
    }

    fn fail_auth(&self, reason: String) {
        warn!(%reason, "credential rejected; giving up");
        self.set_phase(ConnectionPhase::Disconnected {
            reason: DisconnectReason::AuthRejected(reason),
        });
    }

    /// Run one connect attempt while still serving commands.
    async fn connect_offline(
        &mut self,
        token: String,
    ) -> std::result::Result<Result<Box<dyn Transport>>, Exit> {
        let connector = Arc::clone(&self.connector);
        let connect = connector.connect(Some(token));
        tokio::pin!(connect);

        loop {
            tokio::select! {
                _ = &mut self.shutdown_rx => return Err(Exit::Shutdown),
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.apply_offline(cmd),
                    None => return Err(Exit::Shutdown),
                },
                result = &mut connect => return Ok(result),
            }
        }
    }

    /// Sleep for `delay` while still serving commands.
    async fn wait_offline(&mut self, delay: Duration) -> Exit {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut self.shutdown_rx => return Exit::Shutdown,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.apply_offline(cmd),
                    None => return Exit::Shutdown,
                },
                () = &mut sleep => return Exit::Continue,
            }
        }
    }

    fn apply_offline(&mut self, cmd: Command) {
        match cmd {
            Command::Subscribe { id, topic, tx } => {
                self.routes.insert(id, Route { topic, tx });
            }
            Command::Unsubscribe { id } => {
                self.routes.remove(&id);
            }
            Command::Publish { ack, .. } => {
                let _ = ack.send(Err(RooklineError::NotConnected));
            }
        }
    }

    async fn run_live(&mut self, mut transport: Box<dyn Transport>) -> Exit {
        // Re-establish every route on the fresh channel.
        let frames: Vec<ClientFrame> = self
            .routes
            .iter()
            .map(|(id, route)| ClientFrame::Subscribe {
                id: id.clone(),
                topic: route.topic.clone(),
            })
            .collect();
        for frame in frames {
            if let Err(e) = send_frame(&mut transport, &frame).await {
                return Exit::Lost(e.to_string());
            }
        }
        debug!(routes = self.routes.len(), "subscriptions restored");
        self.been_live = true;
        self.set_phase(ConnectionPhase::Live);

        loop {
            tokio::select! {
                _ = &mut self.shutdown_rx => {
                    debug!("shutdown signal received");
                    let _ = transport.close().await;
                    return Exit::Shutdown;
                }

                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        debug!("command channel closed, shutting down connection task");
                        let _ = transport.close().await;
                        return Exit::Shutdown;
                    };
                    if let Err(e) = self.apply_live(&mut transport, cmd).await {
                        return Exit::Lost(e.to_string());
                    }
                }

                incoming = transport.recv() => match incoming {
                    Some(Ok(text)) => self.route_incoming(&text),
                    Some(Err(e)) => return Exit::Lost(format!("transport receive error: {e}")),
                    None => return Exit::Lost("transport closed by server".into()),
                },
            }
        }
    }

    async fn apply_live(&mut self, transport: &mut Box<dyn Transport>, cmd: Command) -> Result<()> {
        match cmd {
            Command::Subscribe { id, topic, tx } => {
                let frame = ClientFrame::Subscribe {
                    id: id.clone(),
                    topic: topic.clone(),
                };
                self.routes.insert(id, Route { topic, tx });
                send_frame(transport, &frame).await
            }
            Command::Unsubscribe { id } => {
                if self.routes.remove(&id).is_some() {
                    send_frame(transport, &ClientFrame::Unsubscribe { id }).await
                } else {
                    Ok(())
                }
            }
            Command::Publish {
                destination,
                body,
                ack,
            } => {
                debug!(%destination, "publishing");
                let result = send_frame(transport, &ClientFrame::Publish { destination, body }).await;
                let outcome = match &result {
                    Ok(()) => Ok(()),
                    Err(e) => Err(RooklineError::TransportSend(e.to_string())),
                };
                let _ = ack.send(outcome);
                result
            }
        }
    }

    fn route_incoming(&mut self, text: &str) {
        let frame = match serde_json::from_str::<ServerFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("failed to deserialize server frame: {e}");
                return;
            }
        };
        match frame {
            ServerFrame::Message {
                subscription,
                topic,
                body,
            } => {
                let targets: Vec<&Route> = match &subscription {
                    Some(id) => self.routes.get(id).into_iter().collect(),
                    None => self.routes.values().filter(|r| r.topic == topic).collect(),
                };
                if targets.is_empty() {
                    debug!(%topic, "message for unknown subscription dropped");
                }
                for route in targets {
                    deliver(route, body.clone());
                }
            }
            ServerFrame::Error { message } => {
                warn!(%message, "channel error frame");
            }
        }
    }
}

async fn send_frame(transport: &mut Box<dyn Transport>, frame: &ClientFrame) -> Result<()> {
    let json = serde_json::to_string(frame)?;
    transport.send(json).await
}

/// Hand a message to a subscriber without blocking the loop.
fn deliver(route: &Route, body: serde_json::Value) {
    match route.tx.try_send(body) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(topic = %route.topic, "subscription buffer full, dropping message");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(topic = %route.topic, "subscriber gone");
        }
    }
}
