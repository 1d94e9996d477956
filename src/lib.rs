//! # scribe-sync — Real-time document sync engine
//!
//! Client-side engine for collaborative document editing: CRDT-backed
//! document state, WebSocket relay transport with reconnection, presence
//! broadcast, token lifecycle, and deduplicated save coordination.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    WebSocket     ┌─────────────┐
//! │  SyncEngine  │ ◄───────────────► │ sync relay  │ ◄──► other clients
//! │ (per doc)    │  binary + JSON    │ (external)  │
//! └──────┬───────┘                  └─────────────┘
//!        │
//!        ├── DocHandle          CRDT state + origin-tagged updates
//!        ├── ConnectionManager  connect / heartbeat / backoff reconnect
//!        ├── SyncHandler        handshake + inbound frame dispatch
//!        ├── SaveCoordinator    content-hash dedup + retrying persistence
//!        └── TokenManager       bearer credential lifecycle
//!                                      │
//!                                      ▼ HTTP
//!                               ┌──────────────┐
//!                               │ persistence  │
//!                               │ + identity   │
//!                               └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Wire frames (raw binary updates, tagged JSON control)
//! - [`doc`] — CRDT document handle with origin-tagged update observation
//! - [`connection`] — Transport lifecycle and reconnection state machine
//! - [`sync`] — Handshake protocol and frame dispatch
//! - [`presence`] — Ephemeral peer roster
//! - [`saves`] — Save coordination: dedup ledger, fan-in, retries
//! - [`auth`] — Token manager and identity backend boundary
//! - [`backend`] — Durable update log boundary (HTTP client included)
//! - [`classifier`] — Content vs. ephemeral update classification
//! - [`engine`] — The per-document facade tying it all together

pub mod auth;
pub mod backend;
pub mod classifier;
pub mod connection;
pub mod doc;
pub mod engine;
pub mod presence;
pub mod protocol;
pub mod saves;
pub mod sync;

// Re-exports for convenience
pub use auth::{AuthError, Credential, HttpIdentityProvider, IdentityProvider, TokenConfig, TokenManager};
pub use backend::{HttpUpdateBackend, PersistenceError, UpdateBackend};
pub use classifier::{ClassifierConfig, ContentChangeClassifier, UpdateClass};
pub use connection::{
    ClientIdentity, ConnectionConfig, ConnectionError, ConnectionManager, ConnectionPhase,
    ConnectionState, TransportEvent,
};
pub use doc::{DocHandle, DocUpdate, UpdateOrigin};
pub use engine::{EngineConfig, SyncEngine, SyncEvent};
pub use presence::{PresenceRoster, PresenceUser, UserPresence};
pub use protocol::{ControlKind, ControlMessage, InboundFrame, OutboundEnvelope, ProtocolError};
pub use saves::{
    content_hash, SaveConfig, SaveCoordinator, SaveKind, SaveOutcome, SkipReason,
};
pub use sync::SyncHandler;
