//! Transport connection lifecycle for one document session.
//!
//! Owns exactly one logical WebSocket connection to the relay endpoint and
//! drives the recovery state machine:
//!
//! ```text
//! Disconnected → Connecting → Connected ──┐
//!        ▲            ▲                   │ non-graceful drop
//!        │            └── Reconnecting ◄──┘
//!        └──────────── Closed (terminal, explicit close only)
//! ```
//!
//! Reconnects use capped exponential backoff with jitter, bounded by
//! `max_reconnect_attempts`. The backoff timer callback refreshes the
//! credential and only then dials, so a fresh connection never embeds a
//! stale token. Every timer callback checks the liveness flag first —
//! teardown mid-reconnect leaves no timer that touches a dead session.

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::auth::TokenManager;
use crate::protocol::OutboundEnvelope;

/// Connection lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// Connection state, owned by the manager and read by everyone else.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    pub connected_at: Option<SystemTime>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            reconnect_attempts: 0,
            last_error: None,
            connected_at: None,
        }
    }
}

/// Who we present as on the wire.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub user_id: Uuid,
    pub user_name: String,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Relay endpoint base, e.g. `ws://127.0.0.1:9090`.
    pub endpoint: String,
    /// Heartbeat ping period. A missed pong is not itself fatal; the
    /// transport's own close event is the deadness signal.
    pub heartbeat_interval: Duration,
    /// First reconnect delay; doubles per attempt.
    pub base_delay: Duration,
    /// Backoff ceiling.
    pub cap_delay: Duration,
    /// Random jitter added on top of the capped delay.
    pub max_jitter: Duration,
    /// Reconnect attempts before reporting a fatal connection failure.
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:9090".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            base_delay: Duration::from_secs(1),
            cap_delay: Duration::from_secs(30),
            max_jitter: Duration::from_secs(1),
            max_reconnect_attempts: 10,
        }
    }
}

/// Events surfaced to the engine's event loop.
#[derive(Debug)]
pub enum TransportEvent {
    /// Connection established; handshake should run now.
    Opened,
    /// An inbound transport frame.
    Frame(Message),
    /// The connection dropped. Non-graceful drops also schedule a reconnect.
    Closed { graceful: bool },
    /// A reconnect attempt has been scheduled.
    Reconnecting { attempt: u32, delay: Duration },
    /// Reconnect attempts exhausted; reported exactly once.
    Failed { attempts: u32 },
}

/// Deterministic part of the reconnect delay:
/// `min(base · 2^(attempt−1), cap)` plus random jitter up to `max_jitter`.
pub fn backoff_delay(config: &ConnectionConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let doubled = config.base_delay.saturating_mul(1u32 << exp);
    let capped = doubled.min(config.cap_delay);
    let jitter_ms = config.max_jitter.as_millis() as u64;
    if jitter_ms == 0 {
        capped
    } else {
        capped + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Manages the transport socket: connect, heartbeat, graceful close,
/// exponential-backoff reconnect.
pub struct ConnectionManager {
    config: ConnectionConfig,
    document_id: Uuid,
    identity: ClientIdentity,
    tokens: Arc<TokenManager>,
    state: Arc<RwLock<ConnectionState>>,
    outgoing: Arc<RwLock<Option<mpsc::Sender<Message>>>>,
    events: mpsc::Sender<TransportEvent>,
    alive: Arc<AtomicBool>,
    fatal_reported: AtomicBool,
    reconnect_pending: AtomicBool,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        document_id: Uuid,
        identity: ClientIdentity,
        tokens: Arc<TokenManager>,
        events: mpsc::Sender<TransportEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            document_id,
            identity,
            tokens,
            state: Arc::new(RwLock::new(ConnectionState::default())),
            outgoing: Arc::new(RwLock::new(None)),
            events,
            alive: Arc::new(AtomicBool::new(true)),
            fatal_reported: AtomicBool::new(false),
            reconnect_pending: AtomicBool::new(false),
            heartbeat_task: Mutex::new(None),
            reconnect_task: Mutex::new(None),
            reader_task: Mutex::new(None),
        })
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.state.read().await.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.state.read().await.phase == ConnectionPhase::Connected
    }

    /// Relay URL with the document in the path and credential/identity as
    /// query parameters. The token is omitted entirely for anonymous
    /// sessions.
    fn build_url(&self, token: Option<&str>) -> String {
        let mut url = format!(
            "{}/{}?",
            self.config.endpoint.trim_end_matches('/'),
            self.document_id
        );
        if let Some(token) = token {
            url.push_str("token=");
            url.push_str(&urlencoding::encode(token));
            url.push('&');
        }
        url.push_str("userId=");
        url.push_str(&self.identity.user_id.to_string());
        url.push_str("&userName=");
        url.push_str(&urlencoding::encode(&self.identity.user_name));
        url
    }

    /// Open the transport. On success: phase `Connected`, attempt counter
    /// reset, heartbeat started, and `Opened` emitted so the sync handler
    /// runs the handshake and presence broadcast. On failure a reconnect is
    /// scheduled (unless closed).
    pub fn connect(
        self: &Arc<Self>,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<(), ConnectionError>> + Send + '_>,
    > {
        // Boxed because `connect` is indirectly recursive via
        // `schedule_reconnect`, which defeats Send inference on the
        // opaque `async fn` future.
        Box::pin(self.connect_inner())
    }

    async fn connect_inner(self: &Arc<Self>) -> Result<(), ConnectionError> {
        {
            let mut st = self.state.write().await;
            if st.phase == ConnectionPhase::Closed {
                return Err(ConnectionError::Closed);
            }
            st.phase = ConnectionPhase::Connecting;
        }

        let token = self.tokens.current().await;
        let url = self.build_url(token.as_ref().map(|c| c.token.as_str()));
        log::debug!("Dialing relay for document {}", self.document_id);

        let ws = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                {
                    let mut st = self.state.write().await;
                    st.last_error = Some(e.to_string());
                }
                log::warn!("Connect failed: {e}");
                self.schedule_reconnect().await;
                return Err(ConnectionError::Transport(e.to_string()));
            }
        };

        let (mut writer, mut reader) = ws.split();

        // Writer task: forward the outgoing channel to the socket.
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });
        *self.outgoing.write().await = Some(out_tx);

        {
            let mut st = self.state.write().await;
            st.phase = ConnectionPhase::Connected;
            st.reconnect_attempts = 0;
            st.last_error = None;
            st.connected_at = Some(SystemTime::now());
        }
        log::info!(
            "Connected to relay for document {} as {}",
            self.document_id,
            self.identity.user_name
        );

        // Reader task: feed inbound frames to the engine; classify the drop
        // when the stream ends.
        let manager = self.clone();
        let reader_handle = tokio::spawn(async move {
            let mut graceful = false;
            while let Some(item) = reader.next().await {
                if !manager.alive.load(Ordering::SeqCst) {
                    return;
                }
                match item {
                    Ok(Message::Close(frame)) => {
                        graceful = frame
                            .as_ref()
                            .map(|f| matches!(f.code, CloseCode::Normal | CloseCode::Away))
                            .unwrap_or(true);
                        break;
                    }
                    Ok(msg) => {
                        if manager.events.send(TransportEvent::Frame(msg)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        log::warn!("Transport error: {e}");
                        manager.state.write().await.last_error = Some(e.to_string());
                        break;
                    }
                }
            }

            if !manager.alive.load(Ordering::SeqCst) {
                return;
            }
            {
                let st = manager.state.read().await;
                if st.phase == ConnectionPhase::Closed {
                    return;
                }
            }
            let _ = manager.events.send(TransportEvent::Closed { graceful }).await;
            if graceful {
                manager.state.write().await.phase = ConnectionPhase::Disconnected;
            } else {
                manager.schedule_reconnect().await;
            }
        });
        if let Ok(mut slot) = self.reader_task.try_lock() {
            if let Some(old) = slot.replace(reader_handle) {
                old.abort();
            }
        }

        self.start_heartbeat();
        let _ = self.events.send(TransportEvent::Opened).await;
        Ok(())
    }

    /// Serialize and transmit. A warning no-op when not connected — callers
    /// never fail just because the link is momentarily down.
    pub async fn send(&self, envelope: &OutboundEnvelope) -> Result<(), ConnectionError> {
        {
            let st = self.state.read().await;
            if st.phase != ConnectionPhase::Connected {
                log::warn!(
                    "Dropping {} send while {:?}",
                    envelope.kind(),
                    st.phase
                );
                return Ok(());
            }
        }
        let msg = envelope
            .encode(self.identity.user_id)
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
        let tx = self.outgoing.read().await.clone();
        match tx {
            Some(tx) => tx
                .send(msg)
                .await
                .map_err(|_| ConnectionError::NotConnected),
            None => Err(ConnectionError::NotConnected),
        }
    }

    /// Schedule the next reconnect attempt. Bounded by
    /// `max_reconnect_attempts`; exhaustion reports a fatal failure exactly
    /// once and stops.
    pub async fn schedule_reconnect(self: &Arc<Self>) {
        if !self.alive.load(Ordering::SeqCst) {
            return;
        }
        if self.reconnect_pending.swap(true, Ordering::SeqCst) {
            return;
        }

        let (attempt, give_up) = {
            let mut st = self.state.write().await;
            if st.phase == ConnectionPhase::Closed {
                self.reconnect_pending.store(false, Ordering::SeqCst);
                return;
            }
            st.reconnect_attempts += 1;
            if st.reconnect_attempts > self.config.max_reconnect_attempts {
                st.phase = ConnectionPhase::Disconnected;
                (st.reconnect_attempts - 1, true)
            } else {
                st.phase = ConnectionPhase::Reconnecting;
                (st.reconnect_attempts, false)
            }
        };

        if give_up {
            self.reconnect_pending.store(false, Ordering::SeqCst);
            if !self.fatal_reported.swap(true, Ordering::SeqCst) {
                log::error!("Giving up after {attempt} reconnect attempts");
                let _ = self.events.send(TransportEvent::Failed { attempts: attempt }).await;
            }
            return;
        }

        let delay = backoff_delay(&self.config, attempt);
        log::info!("Reconnect attempt {attempt} in {delay:?}");
        let _ = self
            .events
            .send(TransportEvent::Reconnecting { attempt, delay })
            .await;

        let manager = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !manager.alive.load(Ordering::SeqCst) {
                return;
            }
            manager.reconnect_pending.store(false, Ordering::SeqCst);
            // Refresh strictly before dialing; never connect with a stale
            // token.
            manager.tokens.ensure_valid_token().await;
            if let Err(e) = manager.connect().await {
                log::warn!("Reconnect attempt {attempt} failed: {e}");
            }
        });
        if let Ok(mut slot) = self.reconnect_task.try_lock() {
            // The previous task is either finished or is the caller itself
            // (a failed dial rescheduling); never abort it here.
            let _ = slot.replace(handle);
        }
    }

    fn start_heartbeat(self: &Arc<Self>) {
        let manager = self.clone();
        let interval = self.config.heartbeat_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !manager.alive.load(Ordering::SeqCst) {
                    break;
                }
                if manager.state.read().await.phase != ConnectionPhase::Connected {
                    break;
                }
                if manager.send(&OutboundEnvelope::Ping).await.is_err() {
                    break;
                }
            }
        });
        if let Ok(mut slot) = self.heartbeat_task.try_lock() {
            if let Some(old) = slot.replace(handle) {
                old.abort();
            }
        }
    }

    /// Graceful close: normal-closure frame, timers stopped, terminal
    /// `Closed` phase.
    pub async fn close(&self, reason: &str) {
        self.cancel_timers().await;
        if let Some(tx) = self.outgoing.write().await.take() {
            let _ = tx
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: reason.to_string().into(),
                })))
                .await;
        }
        self.state.write().await.phase = ConnectionPhase::Closed;
        log::info!("Connection closed: {reason}");
    }

    /// Abort the reconnect and heartbeat timers.
    pub async fn cancel_timers(&self) {
        if let Some(handle) = self.reconnect_task.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.heartbeat_task.lock().await.take() {
            handle.abort();
        }
        self.reconnect_pending.store(false, Ordering::SeqCst);
    }

    /// Teardown: clears the liveness flag (so no timer callback acts again),
    /// closes the transport with a normal-closure code, and resets the state
    /// to `Disconnected`.
    pub async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.cancel_timers().await;
        if let Some(handle) = self.reader_task.lock().await.take() {
            handle.abort();
        }
        if let Some(tx) = self.outgoing.write().await.take() {
            let _ = tx
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "session destroyed".into(),
                })))
                .await;
        }
        let mut st = self.state.write().await;
        *st = ConnectionState::default();
    }
}

/// Transport failures. Recovered locally via backoff; only exhaustion is
/// surfaced outward (as [`TransportEvent::Failed`]).
#[derive(Debug, Clone)]
pub enum ConnectionError {
    Transport(String),
    NotConnected,
    /// The manager was closed; terminal.
    Closed,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "Transport error: {e}"),
            Self::NotConnected => write!(f, "Not connected"),
            Self::Closed => write!(f, "Connection manager closed"),
        }
    }
}

impl std::error::Error for ConnectionError {}
