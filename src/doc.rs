//! Replicated-document handle: a thin wrapper over a Yrs [`Doc`] that pins
//! down the contract the engine relies on.
//!
//! ```text
//! local edit ──► local_txn() ──► Doc ──► update event (origin = local)
//!                                 ▲
//! network frame ─► apply_update(bytes, Remote) ─┘ (origin = remote)
//! ```
//!
//! Every applied update carries an origin tag. The sync handler only relays
//! updates whose origin is local — a received update is never re-emitted as
//! if it were ours, which is what prevents infinite broadcast loops.
//!
//! Yrs merges are commutative and idempotent: applying the same update twice
//! is a no-op, so redelivery after reconnect is harmless.

use tokio::sync::mpsc;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Origin, ReadTxn, StateVector, Subscription, Transact, TransactionMut, Update};

use crate::protocol::ProtocolError;

/// Origin tag for edits made through [`DocHandle::local_txn`].
pub const LOCAL_ORIGIN: &str = "local";
/// Origin tag for updates received over the transport.
pub const REMOTE_ORIGIN: &str = "remote";
/// Origin tag for updates replayed from the persisted log on initial load.
pub const REPLAY_ORIGIN: &str = "replay";

/// Where an applied update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    Local,
    Remote,
    Replay,
}

impl UpdateOrigin {
    /// Network-sourced updates must not be re-broadcast.
    pub fn is_network(&self) -> bool {
        matches!(self, UpdateOrigin::Remote | UpdateOrigin::Replay)
    }

    pub fn as_yrs(&self) -> Origin {
        match self {
            UpdateOrigin::Local => Origin::from(LOCAL_ORIGIN),
            UpdateOrigin::Remote => Origin::from(REMOTE_ORIGIN),
            UpdateOrigin::Replay => Origin::from(REPLAY_ORIGIN),
        }
    }

    /// Untagged transactions are treated as local edits.
    pub fn from_yrs(origin: Option<&Origin>) -> Self {
        match origin {
            Some(o) if *o == Origin::from(REMOTE_ORIGIN) => UpdateOrigin::Remote,
            Some(o) if *o == Origin::from(REPLAY_ORIGIN) => UpdateOrigin::Replay,
            _ => UpdateOrigin::Local,
        }
    }
}

/// An update emitted by the document, with its origin tag.
#[derive(Debug, Clone)]
pub struct DocUpdate {
    pub bytes: Vec<u8>,
    pub origin: UpdateOrigin,
}

/// Yrs encodes "nothing changed" as the two-byte update `[0, 0]`.
/// Used to suppress pointless SyncStep2 replies.
pub fn is_noop_update(bytes: &[u8]) -> bool {
    bytes.is_empty() || bytes == [0u8, 0u8]
}

/// Handle to the shared replicated document for one session.
///
/// All mutation goes through Yrs transactions; the engine's single event
/// loop guarantees the handle is never mutated from two call sites at once.
pub struct DocHandle {
    doc: Doc,
    _update_sub: Option<Subscription>,
}

impl DocHandle {
    pub fn new() -> Self {
        Self {
            doc: Doc::new(),
            _update_sub: None,
        }
    }

    /// The underlying Yrs document (for reads and shared-type access).
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Open a write transaction tagged as a local edit. Updates emitted from
    /// this transaction are relayed and considered for persistence.
    pub fn local_txn(&self) -> TransactionMut<'_> {
        self.doc.transact_mut_with(LOCAL_ORIGIN)
    }

    /// Compact summary of what this replica has already seen.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Minimal diff containing everything a peer at `peer_vector` is missing.
    pub fn diff_since(&self, peer_vector: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let sv = StateVector::decode_v1(peer_vector)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Canonical full-state encoding: the diff since the empty state vector.
    /// Deterministic for replicas in the same state, which is what makes
    /// content-hash save deduplication meaningful across clients.
    pub fn encode_full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_diff_v1(&StateVector::default())
    }

    /// Merge an update into the document under the given origin tag.
    pub fn apply_update(&self, bytes: &[u8], origin: UpdateOrigin) -> Result<(), ProtocolError> {
        let update = Update::decode_v1(bytes)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        let mut txn = self.doc.transact_mut_with(origin.as_yrs());
        txn.apply_update(update)
            .map_err(|e| ProtocolError::UpdateRejected(e.to_string()))
    }

    /// Subscribe to update emissions. Each emission carries the update bytes
    /// and the origin tag of the transaction that produced them.
    ///
    /// Installs the observer; calling again replaces the previous receiver.
    pub fn observe_updates(&mut self) -> Result<mpsc::UnboundedReceiver<DocUpdate>, ProtocolError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = self
            .doc
            .observe_update_v1(move |txn, event| {
                let origin = UpdateOrigin::from_yrs(txn.origin());
                let _ = tx.send(DocUpdate {
                    bytes: event.update.clone(),
                    origin,
                });
            })
            .map_err(|e| ProtocolError::UpdateRejected(e.to_string()))?;
        self._update_sub = Some(sub);
        Ok(rx)
    }
}

impl Default for DocHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{GetString, Text};

    fn edit(handle: &DocHandle, field: &str, text: &str) {
        let root = handle.doc().get_or_insert_text(field);
        let mut txn = handle.local_txn();
        let len = root.get_string(&txn).len() as u32;
        root.insert(&mut txn, len, text);
    }

    fn read(handle: &DocHandle, field: &str) -> String {
        let root = handle.doc().get_or_insert_text(field);
        let txn = handle.doc().transact();
        root.get_string(&txn)
    }

    #[test]
    fn test_idempotent_merge() {
        let source = DocHandle::new();
        edit(&source, "content", "hello");
        let update = source.encode_full_state();

        let target = DocHandle::new();
        target.apply_update(&update, UpdateOrigin::Remote).unwrap();
        let once = read(&target, "content");

        target.apply_update(&update, UpdateOrigin::Remote).unwrap();
        let twice = read(&target, "content");

        assert_eq!(once, "hello");
        assert_eq!(once, twice, "applying the same update twice must be a no-op");
    }

    #[test]
    fn test_handshake_convergence() {
        let a = DocHandle::new();
        let b = DocHandle::new();
        edit(&a, "content", "from-a ");
        edit(&b, "content", "from-b ");

        // One SyncStep1/SyncStep2 round in each direction.
        let diff_for_b = a.diff_since(&b.state_vector()).unwrap();
        let diff_for_a = b.diff_since(&a.state_vector()).unwrap();
        b.apply_update(&diff_for_b, UpdateOrigin::Remote).unwrap();
        a.apply_update(&diff_for_a, UpdateOrigin::Remote).unwrap();

        assert_eq!(read(&a, "content"), read(&b, "content"));
        assert_eq!(a.state_vector(), b.state_vector());
    }

    #[test]
    fn test_origin_tags_on_emitted_updates() {
        let mut local = DocHandle::new();
        let mut rx = local.observe_updates().unwrap();
        edit(&local, "content", "typed locally");
        let emitted = rx.try_recv().unwrap();
        assert_eq!(emitted.origin, UpdateOrigin::Local);
        assert!(!emitted.origin.is_network());

        let mut remote = DocHandle::new();
        let mut remote_rx = remote.observe_updates().unwrap();
        remote
            .apply_update(&emitted.bytes, UpdateOrigin::Remote)
            .unwrap();
        let re_emitted = remote_rx.try_recv().unwrap();
        assert_eq!(re_emitted.origin, UpdateOrigin::Remote);
        assert!(re_emitted.origin.is_network());
    }

    #[test]
    fn test_replay_origin_is_network() {
        let mut handle = DocHandle::new();
        let mut rx = handle.observe_updates().unwrap();

        let source = DocHandle::new();
        edit(&source, "content", "persisted");
        handle
            .apply_update(&source.encode_full_state(), UpdateOrigin::Replay)
            .unwrap();

        let emitted = rx.try_recv().unwrap();
        assert_eq!(emitted.origin, UpdateOrigin::Replay);
        assert!(emitted.origin.is_network());
    }

    #[test]
    fn test_noop_diff_detection() {
        let a = DocHandle::new();
        let b = DocHandle::new();
        // Identical (empty) replicas: the diff carries nothing.
        let diff = a.diff_since(&b.state_vector()).unwrap();
        assert!(is_noop_update(&diff));

        edit(&a, "content", "x");
        let diff = a.diff_since(&b.state_vector()).unwrap();
        assert!(!is_noop_update(&diff));
    }

    #[test]
    fn test_malformed_update_rejected() {
        let handle = DocHandle::new();
        let result = handle.apply_update(&[0xFF, 0xFE, 0xFD, 0xFC], UpdateOrigin::Remote);
        assert!(result.is_err());
    }

    #[test]
    fn test_malformed_state_vector_rejected() {
        let handle = DocHandle::new();
        assert!(handle.diff_since(&[0xFF, 0xFF, 0xFF]).is_err());
    }
}
