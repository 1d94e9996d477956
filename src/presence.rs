//! Presence (awareness) roster for a document session.
//!
//! Presence is ephemeral per-user state — display name, color, last-seen —
//! broadcast to collaborators but never persisted and never routed through
//! save coordination. The roster is an instance-owned map with its lifetime
//! tied to the engine; there are no process-wide singletons.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::protocol::now_millis;

/// Display identity of a collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUser {
    pub name: String,
    /// RGBA color for cursor/selection rendering, stable per user id.
    pub color: [f32; 4],
}

impl PresenceUser {
    /// Build a presence identity with a stable color derived from the id.
    pub fn named(user_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: color_from_id(user_id),
        }
    }
}

/// Derive a stable RGBA color from a user id hash.
fn color_from_id(id: Uuid) -> [f32; 4] {
    let hash = id.as_u128();
    let r = (hash & 0xFF) as f32 / 255.0;
    let g = ((hash >> 8) & 0xFF) as f32 / 255.0;
    let b = ((hash >> 16) & 0xFF) as f32 / 255.0;
    [r, g, b, 1.0]
}

/// One peer's broadcast presence state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPresence {
    pub user: PresenceUser,
    /// Unix millis of the peer's last broadcast.
    #[serde(rename = "lastSeen")]
    pub last_seen: u64,
}

impl UserPresence {
    pub fn new(user: PresenceUser) -> Self {
        Self {
            user,
            last_seen: now_millis(),
        }
    }

    /// Refresh the last-seen stamp to now.
    pub fn touch(&mut self) {
        self.last_seen = now_millis();
    }
}

/// In-memory `user_id -> presence` map, updated from awareness frames.
#[derive(Debug, Default)]
pub struct PresenceRoster {
    entries: HashMap<Uuid, UserPresence>,
}

impl PresenceRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a peer's presence.
    pub fn apply(&mut self, user_id: Uuid, presence: UserPresence) {
        self.entries.insert(user_id, presence);
    }

    /// Remove a peer (peer-left signal). Returns true if it was present.
    pub fn remove(&mut self, user_id: &Uuid) -> bool {
        self.entries.remove(user_id).is_some()
    }

    /// Snapshot of all known peers.
    pub fn entries(&self) -> Vec<(Uuid, UserPresence)> {
        self.entries
            .iter()
            .map(|(id, p)| (*id, p.clone()))
            .collect()
    }

    pub fn get(&self, user_id: &Uuid) -> Option<&UserPresence> {
        self.entries.get(user_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop peers that have not broadcast within `max_age`. Peers that
    /// disconnect uncleanly never send a leave signal, so the roster is
    /// swept opportunistically.
    pub fn prune_stale(&mut self, max_age: Duration) -> usize {
        let cutoff = now_millis().saturating_sub(max_age.as_millis() as u64);
        let before = self.entries.len();
        self.entries.retain(|_, p| p.last_seen >= cutoff);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
