//! Sync protocol handler: handshake and inbound frame dispatch.
//!
//! On every (re)connection the handshake runs:
//!
//! ```text
//! us ──── sync step 1 (our state vector) ────► peers
//! us ◄─── sync step 2 (diff we are missing) ── peer
//! us ──── sync step 2 (diff peer is missing) ► peer   (reply to their step 1)
//! ```
//!
//! Steady-state updates arrive as raw binary frames and are applied with a
//! network origin tag, so the update observer never echoes them back out.
//! Malformed frames are logged and dropped; a bad frame never terminates the
//! connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::auth::TokenManager;
use crate::connection::ConnectionManager;
use crate::doc::{is_noop_update, DocHandle, UpdateOrigin};
use crate::engine::SyncEvent;
use crate::presence::{PresenceRoster, UserPresence};
use crate::protocol::{is_auth_error_code, InboundFrame, OutboundEnvelope};

/// Peers silent for longer than this are swept from the roster.
const STALE_PRESENCE_AGE: std::time::Duration = std::time::Duration::from_secs(5 * 60);

/// Dispatches inbound frames against the document, the presence roster, and
/// the credential manager. One per engine instance.
pub struct SyncHandler {
    doc: Arc<DocHandle>,
    conn: Arc<ConnectionManager>,
    tokens: Arc<TokenManager>,
    roster: Arc<RwLock<PresenceRoster>>,
    own_presence: Arc<RwLock<UserPresence>>,
    user_id: Uuid,
    synced: AtomicBool,
    events: mpsc::UnboundedSender<SyncEvent>,
}

impl SyncHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        doc: Arc<DocHandle>,
        conn: Arc<ConnectionManager>,
        tokens: Arc<TokenManager>,
        roster: Arc<RwLock<PresenceRoster>>,
        own_presence: Arc<RwLock<UserPresence>>,
        user_id: Uuid,
        events: mpsc::UnboundedSender<SyncEvent>,
    ) -> Self {
        Self {
            doc,
            conn,
            tokens,
            roster,
            own_presence,
            user_id,
            synced: AtomicBool::new(false),
            events,
        }
    }

    /// Whether the handshake has completed on the current connection.
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    /// Runs on every `Opened` transport event: initiate the handshake with
    /// our state vector, then announce our presence. Re-runs identically
    /// after a reconnect, which is what converges missed edits.
    pub async fn on_connected(&self) {
        self.synced.store(false, Ordering::SeqCst);

        let envelope = OutboundEnvelope::SyncStep1 {
            state_vector: self.doc.state_vector(),
        };
        if let Err(e) = self.conn.send(&envelope).await {
            log::warn!("Failed to send handshake step 1: {e}");
        }

        let presence = {
            let mut own = self.own_presence.write().await;
            own.touch();
            own.clone()
        };
        let envelope = OutboundEnvelope::Awareness {
            user_id: self.user_id,
            presence,
        };
        if let Err(e) = self.conn.send(&envelope).await {
            log::warn!("Failed to broadcast presence: {e}");
        }

        let _ = self.events.send(SyncEvent::Connected);
    }

    /// Dispatch one inbound transport message.
    pub async fn handle_frame(&self, msg: &Message) {
        let frame = match InboundFrame::parse(msg) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                log::warn!("Dropping malformed frame: {e}");
                return;
            }
        };

        match frame {
            InboundFrame::Update(bytes) => {
                if let Err(e) = self.doc.apply_update(&bytes, UpdateOrigin::Remote) {
                    log::warn!("Dropping rejected remote update: {e}");
                }
            }
            InboundFrame::Sync { step: 1, data } => self.reply_with_diff(&data).await,
            InboundFrame::Sync { step: 2, data } => {
                match self.doc.apply_update(&data, UpdateOrigin::Remote) {
                    Ok(()) => {
                        self.synced.store(true, Ordering::SeqCst);
                        let _ = self.events.send(SyncEvent::Synced);
                    }
                    Err(e) => log::warn!("Dropping rejected handshake diff: {e}"),
                }
            }
            InboundFrame::Sync { step, .. } => {
                log::warn!("Dropping sync frame with unknown step {step}");
            }
            InboundFrame::Awareness {
                user_id,
                presence,
                left,
            } => self.handle_awareness(user_id, presence, left).await,
            InboundFrame::Ping => {
                if let Err(e) = self.conn.send(&OutboundEnvelope::Pong).await {
                    log::warn!("Failed to answer ping: {e}");
                }
            }
            InboundFrame::Pong => {
                log::trace!("Heartbeat pong");
            }
            InboundFrame::Error { code, message } => self.handle_error(&code, &message).await,
            InboundFrame::PermissionsChanged {
                document_id,
                triggered_by,
            } => {
                log::info!("Permissions changed for document {document_id} by {triggered_by}");
                let _ = self.events.send(SyncEvent::PermissionsChanged {
                    document_id,
                    triggered_by,
                });
            }
        }
    }

    /// Reply to a peer's state vector with the diff it is missing. A no-op
    /// diff is not sent; the peer is already caught up.
    async fn reply_with_diff(&self, peer_vector: &[u8]) {
        let diff = match self.doc.diff_since(peer_vector) {
            Ok(diff) => diff,
            Err(e) => {
                log::warn!("Dropping handshake with undecodable state vector: {e}");
                return;
            }
        };
        if is_noop_update(&diff) {
            log::debug!("Peer already caught up, skipping step 2");
            return;
        }
        if let Err(e) = self
            .conn
            .send(&OutboundEnvelope::SyncStep2 { update: diff })
            .await
        {
            log::warn!("Failed to send handshake step 2: {e}");
        }
    }

    async fn handle_awareness(&self, user_id: Uuid, presence: Option<UserPresence>, left: bool) {
        if user_id == self.user_id {
            return;
        }
        let mut roster = self.roster.write().await;
        // Peers that dropped uncleanly never sent a leave signal; sweep them
        // while the roster is hot.
        let pruned = roster.prune_stale(STALE_PRESENCE_AGE);
        if pruned > 0 {
            log::debug!("Pruned {pruned} stale presence entries");
        }
        if left {
            if roster.remove(&user_id) {
                log::debug!("Peer {user_id} left");
                let _ = self.events.send(SyncEvent::PresenceChanged {
                    user_id,
                    left: true,
                });
            }
        } else if let Some(presence) = presence {
            roster.apply(user_id, presence);
            let _ = self.events.send(SyncEvent::PresenceChanged {
                user_id,
                left: false,
            });
        }
    }

    /// Structured errors: auth-coded ones route to the token manager (the
    /// reconnect path then dials with the refreshed credential); everything
    /// else is logged and surfaced.
    async fn handle_error(&self, code: &str, message: &str) {
        if is_auth_error_code(code) {
            log::warn!("Auth error from relay ({code}): {message}");
            self.tokens.handle_auth_error().await;
        } else {
            log::error!("Relay error ({code}): {message}");
        }
        let _ = self.events.send(SyncEvent::RelayError {
            code: code.to_string(),
            message: message.to_string(),
        });
    }
}
