//! Engine facade: one instance per open document session.
//!
//! Wires the document handle, connection manager, sync handler, save
//! coordinator, and token manager together and drives them from a single
//! event loop:
//!
//! ```text
//!                 ┌────────────────────────────────────┐
//!  transport ───► │            engine loop             │ ──► SyncEvent
//!  doc updates ─► │ dispatch frames / broadcast edits  │     observers
//!                 │ classify edits ──► save coordinator│
//!                 └────────────────────────────────────┘
//! ```
//!
//! Local edits fan out twice: broadcast to peers immediately, and (when the
//! classifier says content) handed to the save coordinator as a full-state
//! snapshot. Network-origin updates are never re-broadcast; their resulting
//! state is recorded in the save ledger so our own autosave of an echoed
//! state skips.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::auth::{IdentityProvider, TokenConfig, TokenManager};
use crate::backend::{PersistenceError, UpdateBackend};
use crate::classifier::{ClassifierConfig, ContentChangeClassifier, UpdateClass};
use crate::connection::{
    ClientIdentity, ConnectionConfig, ConnectionError, ConnectionManager, ConnectionState,
    TransportEvent,
};
use crate::doc::{DocHandle, DocUpdate, UpdateOrigin};
use crate::presence::{PresenceRoster, PresenceUser, UserPresence};
use crate::protocol::{OutboundEnvelope, ProtocolError};
use crate::saves::{content_hash, PersistFn, SaveConfig, SaveCoordinator, SaveKind, SaveOutcome};
use crate::sync::SyncHandler;

/// All engine tunables, one section per component.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub connection: ConnectionConfig,
    pub token: TokenConfig,
    pub save: SaveConfig,
    pub classifier: ClassifierConfig,
}

/// Observable session events, consumed via [`SyncEngine::take_event_rx`].
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Transport opened and handshake initiated.
    Connected,
    /// Handshake diff applied; we have converged with a peer.
    Synced,
    Disconnected { graceful: bool },
    Reconnecting { attempt: u32 },
    /// Reconnect attempts exhausted. Emitted exactly once.
    ConnectionFailed { attempts: u32 },
    PresenceChanged { user_id: Uuid, left: bool },
    PermissionsChanged { document_id: Uuid, triggered_by: Uuid },
    RelayError { code: String, message: String },
    SaveCompleted { kind: SaveKind, outcome: SaveOutcome },
    SaveFailed { kind: SaveKind, error: String },
}

/// Collaborative session engine for one document.
pub struct SyncEngine {
    document_id: Uuid,
    identity: ClientIdentity,
    doc: Arc<DocHandle>,
    conn: Arc<ConnectionManager>,
    tokens: Arc<TokenManager>,
    saves: Arc<SaveCoordinator>,
    handler: Arc<SyncHandler>,
    backend: Arc<dyn UpdateBackend>,
    roster: Arc<RwLock<PresenceRoster>>,
    own_presence: Arc<RwLock<UserPresence>>,
    event_tx: mpsc::UnboundedSender<SyncEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<SyncEvent>>>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl SyncEngine {
    pub fn new(
        config: EngineConfig,
        document_id: Uuid,
        identity: ClientIdentity,
        provider: Arc<dyn IdentityProvider>,
        backend: Arc<dyn UpdateBackend>,
    ) -> Result<Arc<Self>, ProtocolError> {
        let tokens = TokenManager::new(provider, config.token);

        let (transport_tx, transport_rx) = mpsc::channel(256);
        let conn = ConnectionManager::new(
            config.connection,
            document_id,
            identity.clone(),
            tokens.clone(),
            transport_tx,
        );

        let mut doc = DocHandle::new();
        let doc_updates = doc.observe_updates()?;
        let doc = Arc::new(doc);

        let saves = SaveCoordinator::new(config.save, document_id, identity.user_id, tokens.clone());

        let roster = Arc::new(RwLock::new(PresenceRoster::new()));
        let own_presence = Arc::new(RwLock::new(UserPresence::new(PresenceUser::named(
            identity.user_id,
            &identity.user_name,
        ))));

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let handler = Arc::new(SyncHandler::new(
            doc.clone(),
            conn.clone(),
            tokens.clone(),
            roster.clone(),
            own_presence.clone(),
            identity.user_id,
            event_tx.clone(),
        ));

        let engine = Arc::new(Self {
            document_id,
            identity,
            doc,
            conn,
            tokens,
            saves,
            handler,
            backend,
            roster,
            own_presence,
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            loop_task: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        });

        engine.spawn_loop(transport_rx, doc_updates, config.classifier);
        Ok(engine)
    }

    /// The single event loop: transport events and document updates, nothing
    /// else mutates session state.
    fn spawn_loop(
        self: &Arc<Self>,
        mut transport_rx: mpsc::Receiver<TransportEvent>,
        mut doc_updates: mpsc::UnboundedReceiver<DocUpdate>,
        classifier_config: ClassifierConfig,
    ) {
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            let mut classifier = ContentChangeClassifier::new(classifier_config);
            loop {
                tokio::select! {
                    event = transport_rx.recv() => match event {
                        None => break,
                        Some(event) => engine.handle_transport_event(event).await,
                    },
                    update = doc_updates.recv() => match update {
                        None => break,
                        Some(update) => engine.handle_doc_update(update, &mut classifier).await,
                    },
                }
            }
            log::debug!("Engine loop for document {} ended", engine.document_id);
        });
        if let Ok(mut slot) = self.loop_task.try_lock() {
            if let Some(old) = slot.replace(handle) {
                old.abort();
            }
        }
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => self.handler.on_connected().await,
            TransportEvent::Frame(msg) => self.handler.handle_frame(&msg).await,
            TransportEvent::Closed { graceful } => {
                // Peers will re-announce themselves after the handshake.
                self.roster.write().await.clear();
                let _ = self.event_tx.send(SyncEvent::Disconnected { graceful });
            }
            TransportEvent::Reconnecting { attempt, .. } => {
                let _ = self.event_tx.send(SyncEvent::Reconnecting { attempt });
            }
            TransportEvent::Failed { attempts } => {
                let _ = self.event_tx.send(SyncEvent::ConnectionFailed { attempts });
            }
        }
    }

    /// Local updates broadcast and (when content) persist. Network-origin
    /// updates only feed the dedup ledger: the peer that authored them is
    /// responsible for their durability.
    async fn handle_doc_update(
        self: &Arc<Self>,
        update: DocUpdate,
        classifier: &mut ContentChangeClassifier,
    ) {
        if update.origin.is_network() {
            let hash = content_hash(&self.doc.encode_full_state());
            self.saves.record_external(&hash, Uuid::nil()).await;
            return;
        }

        if let Err(e) = self
            .conn
            .send(&OutboundEnvelope::Update {
                bytes: update.bytes.clone(),
            })
            .await
        {
            log::warn!("Failed to broadcast local update: {e}");
        }

        if classifier.classify(&update.bytes) == UpdateClass::Content {
            // Relay-path saves are Sync; Auto is for caller-driven saves.
            self.spawn_save(SaveKind::Sync);
        }
    }

    fn spawn_save(self: &Arc<Self>, kind: SaveKind) {
        let engine = self.clone();
        tokio::spawn(async move {
            match engine.save(kind).await {
                Ok(outcome) => {
                    let _ = engine.event_tx.send(SyncEvent::SaveCompleted { kind, outcome });
                }
                Err(PersistenceError::NotAuthenticated) => {
                    // Anonymous sessions collaborate without persistence.
                    log::debug!("Skipping {kind:?} save: anonymous session");
                }
                Err(e) => {
                    log::warn!("{kind:?} save failed: {e}");
                    let _ = engine.event_tx.send(SyncEvent::SaveFailed {
                        kind,
                        error: e.to_string(),
                    });
                }
            }
        });
    }

    /// Fetch the credential, start background tasks, and dial. A failed dial
    /// is not fatal: the reconnect schedule takes over.
    pub async fn start(self: &Arc<Self>) -> Result<(), ConnectionError> {
        self.tokens.ensure_valid_token().await;
        self.tokens.start_refresh();
        self.saves.start_cleanup();
        self.conn.connect().await
    }

    /// Replay the durable update log into the document. Stored updates that
    /// fail to decode are skipped, not fatal. The replayed state is recorded
    /// as externally saved so the first autosave of unchanged content skips.
    pub async fn load_initial_state(&self) -> Result<usize, PersistenceError> {
        let updates = self.backend.fetch_updates(self.document_id).await?;
        let count = updates.len();
        for bytes in &updates {
            if let Err(e) = self.doc.apply_update(bytes, UpdateOrigin::Replay) {
                log::warn!("Skipping corrupt stored update: {e}");
            }
        }
        let hash = content_hash(&self.doc.encode_full_state());
        self.saves.record_external(&hash, Uuid::nil()).await;
        log::info!(
            "Replayed {count} stored updates for document {}",
            self.document_id
        );
        Ok(count)
    }

    /// Persist the current full document state, deduplicated and retried by
    /// the save coordinator.
    pub async fn save(&self, kind: SaveKind) -> Result<SaveOutcome, PersistenceError> {
        let content = self.doc.encode_full_state();
        let backend = self.backend.clone();
        let document_id = self.document_id;
        let bytes = content.clone();
        let persist: PersistFn = Arc::new(move || {
            let backend = backend.clone();
            let bytes = bytes.clone();
            Box::pin(async move { backend.append_update(document_id, &bytes).await })
        });
        self.saves.coordinate_save(&content, kind, persist).await
    }

    /// The underlying document. Edit through [`DocHandle::local_txn`]; the
    /// engine observes, broadcasts, and persists the resulting updates.
    pub fn doc(&self) -> &DocHandle {
        &self.doc
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub fn user_id(&self) -> Uuid {
        self.identity.user_id
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.is_connected().await
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.conn.connection_state().await
    }

    /// Whether the sync handshake has completed on the current connection.
    pub fn is_synced(&self) -> bool {
        self.handler.is_synced()
    }

    /// Snapshot of the current remote peers.
    pub async fn awareness(&self) -> Vec<(Uuid, UserPresence)> {
        self.roster.read().await.entries()
    }

    /// Replace our presence and broadcast it (if connected).
    pub async fn update_awareness(&self, user: PresenceUser) {
        let presence = UserPresence::new(user);
        *self.own_presence.write().await = presence.clone();
        let envelope = OutboundEnvelope::Awareness {
            user_id: self.identity.user_id,
            presence,
        };
        if let Err(e) = self.conn.send(&envelope).await {
            log::warn!("Failed to broadcast presence: {e}");
        }
    }

    /// Tell peers to re-fetch authoritative permission state. The frame
    /// carries no permission claims of its own.
    pub async fn send_permission_update_notification(&self) -> Result<(), ConnectionError> {
        self.conn
            .send(&OutboundEnvelope::PermissionsChanged {
                document_id: self.document_id,
                triggered_by: self.identity.user_id,
            })
            .await
    }

    /// Force a credential refresh now.
    pub async fn refresh_auth_token(&self) {
        self.tokens.ensure_valid_token().await;
    }

    /// Take the event receiver. Single consumer; returns `None` after the
    /// first call.
    pub async fn take_event_rx(&self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.event_rx.lock().await.take()
    }

    /// Graceful close: normal-closure frame, terminal `Closed` phase. The
    /// session cannot reconnect afterwards; use [`SyncEngine::destroy`] for
    /// full teardown.
    pub async fn close(&self) {
        self.conn.close("client closed").await;
    }

    /// Tear the session down in dependency order: save coordination first
    /// (no persistence timer may fire mid-teardown), then the connection
    /// timers, then token refresh, then the transport itself. Idempotent;
    /// any timer that was already scheduled finds the liveness flags cleared
    /// and does nothing.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Destroying sync session for document {}", self.document_id);

        self.saves.shutdown().await;
        self.conn.cancel_timers().await;
        self.tokens.shutdown().await;
        self.conn.shutdown().await;

        if let Some(handle) = self.loop_task.lock().await.take() {
            handle.abort();
        }
        self.roster.write().await.clear();
    }
}
