//! Wire protocol for the relay transport.
//!
//! Two frame shapes travel over the WebSocket:
//!
//! ```text
//! ┌──────────────────────┬──────────────────────────────────────────┐
//! │ Binary frame         │ raw CRDT update bytes, no envelope       │
//! │ Text frame           │ JSON {type, payload?, userId?, timestamp?}│
//! └──────────────────────┴──────────────────────────────────────────┘
//! ```
//!
//! Binary frames carry content-bearing updates unframed for size efficiency.
//! Everything else — sync handshake steps, awareness, ping/pong, errors,
//! permission notifications — is a tagged JSON text frame with
//! `type ∈ {sync, awareness, ping, pong, error, permissionsUpdated}`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::presence::UserPresence;

/// Error codes on inbound `error` frames that identify credential problems.
/// These route to the token manager instead of the reconnect path.
pub const AUTH_ERROR_CODES: &[&str] = &["auth_failed", "token_expired", "unauthorized"];

/// Outbound message kinds. Created per-send, immediately serialized,
/// never retained.
#[derive(Debug, Clone)]
pub enum OutboundEnvelope {
    /// Handshake step 1: our state vector, asking peers what we're missing.
    SyncStep1 { state_vector: Vec<u8> },
    /// Handshake step 2: the diff a peer is missing relative to its vector.
    SyncStep2 { update: Vec<u8> },
    /// Content-bearing update, sent as a raw binary frame.
    Update { bytes: Vec<u8> },
    /// Ephemeral presence broadcast.
    Awareness { user_id: Uuid, presence: UserPresence },
    /// Heartbeat.
    Ping,
    /// Heartbeat reply.
    Pong,
    /// Tells peers to re-fetch authoritative permission state.
    PermissionsChanged { document_id: Uuid, triggered_by: Uuid },
}

/// JSON shape of every text frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub kind: ControlKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    /// Unix millis at send time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlKind {
    Sync,
    Awareness,
    Ping,
    Pong,
    Error,
    #[serde(rename = "permissionsUpdated")]
    PermissionsUpdated,
}

/// Payload of a `sync` frame. Handshake payloads are base64 inside JSON;
/// steady-state updates go over binary frames instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncPayload {
    /// 1 = state vector, 2 = diff update.
    pub step: u8,
    /// Base64-encoded bytes.
    pub data: String,
}

/// Payload of an `awareness` frame. A frame with `left = true` (or no user)
/// is the peer-left signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwarenessPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<UserPresence>,
    #[serde(default)]
    pub left: bool,
}

/// Payload of an inbound `error` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// Payload of a `permissionsUpdated` frame. Carries no claims beyond
/// identifying the document and the triggering actor — recipients re-fetch
/// authoritative permission state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionsPayload {
    pub document_id: Uuid,
    pub triggered_by: Uuid,
}

impl OutboundEnvelope {
    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SyncStep1 { .. } => "sync-step1",
            Self::SyncStep2 { .. } => "sync-step2",
            Self::Update { .. } => "update",
            Self::Awareness { .. } => "awareness",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::PermissionsChanged { .. } => "permissionsUpdated",
        }
    }

    /// Serialize to a transport frame. `Update` becomes a raw binary frame;
    /// all other kinds become tagged JSON text frames.
    pub fn encode(&self, sender: Uuid) -> Result<Message, ProtocolError> {
        let control = match self {
            OutboundEnvelope::Update { bytes } => {
                return Ok(Message::Binary(bytes.clone().into()));
            }
            OutboundEnvelope::SyncStep1 { state_vector } => ControlMessage {
                kind: ControlKind::Sync,
                payload: Some(to_value(&SyncPayload {
                    step: 1,
                    data: BASE64.encode(state_vector),
                })?),
                user_id: Some(sender),
                timestamp: Some(now_millis()),
            },
            OutboundEnvelope::SyncStep2 { update } => ControlMessage {
                kind: ControlKind::Sync,
                payload: Some(to_value(&SyncPayload {
                    step: 2,
                    data: BASE64.encode(update),
                })?),
                user_id: Some(sender),
                timestamp: Some(now_millis()),
            },
            OutboundEnvelope::Awareness { user_id, presence } => ControlMessage {
                kind: ControlKind::Awareness,
                payload: Some(to_value(&AwarenessPayload {
                    presence: Some(presence.clone()),
                    left: false,
                })?),
                user_id: Some(*user_id),
                timestamp: Some(now_millis()),
            },
            OutboundEnvelope::Ping => ControlMessage {
                kind: ControlKind::Ping,
                payload: None,
                user_id: Some(sender),
                timestamp: Some(now_millis()),
            },
            OutboundEnvelope::Pong => ControlMessage {
                kind: ControlKind::Pong,
                payload: None,
                user_id: Some(sender),
                timestamp: Some(now_millis()),
            },
            OutboundEnvelope::PermissionsChanged {
                document_id,
                triggered_by,
            } => ControlMessage {
                kind: ControlKind::PermissionsUpdated,
                payload: Some(to_value(&PermissionsPayload {
                    document_id: *document_id,
                    triggered_by: *triggered_by,
                })?),
                user_id: Some(sender),
                timestamp: Some(now_millis()),
            },
        };

        let text = serde_json::to_string(&control)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Message::Text(text.into()))
    }
}

/// A parsed inbound frame, ready for dispatch.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    /// Raw CRDT update bytes from a binary frame.
    Update(Vec<u8>),
    /// Handshake step (1 = peer state vector, 2 = diff for us).
    Sync { step: u8, data: Vec<u8> },
    /// Presence update or peer-left signal.
    Awareness {
        user_id: Uuid,
        presence: Option<UserPresence>,
        left: bool,
    },
    Ping,
    Pong,
    /// Structured error from the relay.
    Error { code: String, message: String },
    PermissionsChanged { document_id: Uuid, triggered_by: Uuid },
}

impl InboundFrame {
    /// Parse a transport message. Returns `None` for frames that carry no
    /// protocol meaning (close frames are handled by the connection layer,
    /// transport-level ping/pong by tungstenite itself).
    pub fn parse(msg: &Message) -> Result<Option<InboundFrame>, ProtocolError> {
        match msg {
            Message::Binary(data) => Ok(Some(InboundFrame::Update(data.to_vec()))),
            Message::Text(text) => Self::parse_control(text.as_str()).map(Some),
            _ => Ok(None),
        }
    }

    fn parse_control(text: &str) -> Result<InboundFrame, ProtocolError> {
        let control: ControlMessage = serde_json::from_str(text)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;

        match control.kind {
            ControlKind::Sync => {
                let payload: SyncPayload = from_payload(control.payload)?;
                let data = BASE64
                    .decode(&payload.data)
                    .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;
                Ok(InboundFrame::Sync {
                    step: payload.step,
                    data,
                })
            }
            ControlKind::Awareness => {
                let user_id = control
                    .user_id
                    .ok_or_else(|| ProtocolError::InvalidPayload("awareness without userId".into()))?;
                let payload: AwarenessPayload = from_payload(control.payload)?;
                let left = payload.left || payload.presence.is_none();
                Ok(InboundFrame::Awareness {
                    user_id,
                    presence: payload.presence,
                    left,
                })
            }
            ControlKind::Ping => Ok(InboundFrame::Ping),
            ControlKind::Pong => Ok(InboundFrame::Pong),
            ControlKind::Error => {
                let payload: ErrorPayload = from_payload(control.payload)?;
                Ok(InboundFrame::Error {
                    code: payload.code,
                    message: payload.message,
                })
            }
            ControlKind::PermissionsUpdated => {
                let payload: PermissionsPayload = from_payload(control.payload)?;
                Ok(InboundFrame::PermissionsChanged {
                    document_id: payload.document_id,
                    triggered_by: payload.triggered_by,
                })
            }
        }
    }
}

/// Whether an error code identifies an authentication failure.
pub fn is_auth_error_code(code: &str) -> bool {
    AUTH_ERROR_CODES.contains(&code)
}

fn to_value<T: Serialize>(value: &T) -> Result<serde_json::Value, ProtocolError> {
    serde_json::to_value(value).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn from_payload<T: for<'de> Deserialize<'de>>(
    payload: Option<serde_json::Value>,
) -> Result<T, ProtocolError> {
    let value = payload.ok_or_else(|| ProtocolError::InvalidPayload("missing payload".into()))?;
    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Protocol errors. Malformed inbound frames are logged and dropped by the
/// handler — they never terminate the connection.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    InvalidPayload(String),
    /// The CRDT rejected an update.
    UpdateRejected(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidPayload(e) => write!(f, "Invalid payload: {e}"),
            Self::UpdateRejected(e) => write!(f, "Update rejected: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
