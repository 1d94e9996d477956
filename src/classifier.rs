//! Content-change classifier.
//!
//! Decides whether an emitted update is content-bearing (must be considered
//! for persistence) or ephemeral noise (cursor churn, empty transactions).
//!
//! The structural signal comes first: bytes that do not decode as a CRDT
//! update, or that decode to the no-op update, are never content. On top of
//! that sits a documented heuristic carried over from the original system —
//! a minimum byte-size threshold and an inter-arrival spacing guard that
//! coalesces bursts. The heuristic is approximate on purpose: dropping a
//! mid-burst tick is safe because persistence always snapshots the full
//! document state, so the next content-classified update captures
//! everything.

use std::time::{Duration, Instant};
use yrs::updates::decoder::Decode;
use yrs::Update;

use crate::doc::is_noop_update;

/// Classification of an emitted update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateClass {
    /// Content-bearing; hand to the save coordinator.
    Content,
    /// Presence-only or noise; never persisted.
    Ephemeral,
}

/// Tunables for the classification heuristic.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Updates smaller than this are treated as ephemeral.
    pub min_content_bytes: usize,
    /// Content updates arriving closer together than this are coalesced:
    /// only the first of a burst is classified as content.
    pub min_interval: Duration,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            min_content_bytes: 8,
            min_interval: Duration::from_millis(25),
        }
    }
}

/// Stateful classifier; one per engine instance.
pub struct ContentChangeClassifier {
    config: ClassifierConfig,
    last_content_at: Option<Instant>,
}

impl ContentChangeClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            config,
            last_content_at: None,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ClassifierConfig::default())
    }

    /// Classify an emitted update.
    pub fn classify(&mut self, bytes: &[u8]) -> UpdateClass {
        if is_noop_update(bytes) || bytes.len() < self.config.min_content_bytes {
            return UpdateClass::Ephemeral;
        }
        // Structural gate: must decode as a CRDT update at all.
        if Update::decode_v1(bytes).is_err() {
            return UpdateClass::Ephemeral;
        }

        let now = Instant::now();
        if let Some(last) = self.last_content_at {
            if now.duration_since(last) < self.config.min_interval {
                return UpdateClass::Ephemeral;
            }
        }
        self.last_content_at = Some(now);
        UpdateClass::Content
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::{DocHandle, UpdateOrigin};
    use yrs::Text;

    fn content_update(text: &str) -> Vec<u8> {
        let handle = DocHandle::new();
        let root = handle.doc().get_or_insert_text("content");
        {
            let mut txn = handle.local_txn();
            root.insert(&mut txn, 0, text);
        }
        handle.encode_full_state()
    }

    #[test]
    fn test_real_update_is_content() {
        let mut classifier = ContentChangeClassifier::with_defaults();
        let update = content_update("a genuine edit");
        assert_eq!(classifier.classify(&update), UpdateClass::Content);
    }

    #[test]
    fn test_noop_update_is_ephemeral() {
        let mut classifier = ContentChangeClassifier::with_defaults();
        assert_eq!(classifier.classify(&[]), UpdateClass::Ephemeral);
        assert_eq!(classifier.classify(&[0, 0]), UpdateClass::Ephemeral);
    }

    #[test]
    fn test_undecodable_bytes_are_ephemeral() {
        let mut classifier = ContentChangeClassifier::with_defaults();
        let garbage = vec![0xFF; 64];
        assert_eq!(classifier.classify(&garbage), UpdateClass::Ephemeral);
    }

    #[test]
    fn test_tiny_update_is_ephemeral() {
        let mut classifier = ContentChangeClassifier::new(ClassifierConfig {
            min_content_bytes: 32,
            ..ClassifierConfig::default()
        });
        let update = content_update("x");
        if update.len() < 32 {
            assert_eq!(classifier.classify(&update), UpdateClass::Ephemeral);
        }
    }

    #[test]
    fn test_burst_coalescing() {
        let mut classifier = ContentChangeClassifier::new(ClassifierConfig {
            min_content_bytes: 8,
            min_interval: Duration::from_secs(60),
        });
        let update = content_update("burst of keystrokes");
        assert_eq!(classifier.classify(&update), UpdateClass::Content);
        // Immediately after: coalesced.
        assert_eq!(classifier.classify(&update), UpdateClass::Ephemeral);
    }

    #[test]
    fn test_spaced_updates_both_content() {
        let mut classifier = ContentChangeClassifier::new(ClassifierConfig {
            min_content_bytes: 8,
            min_interval: Duration::from_millis(0),
        });
        let update = content_update("slow and deliberate");
        assert_eq!(classifier.classify(&update), UpdateClass::Content);
        assert_eq!(classifier.classify(&update), UpdateClass::Content);
    }

    #[test]
    fn test_remote_update_bytes_still_classify() {
        // The classifier judges bytes only; origin gating happens upstream.
        let mut classifier = ContentChangeClassifier::with_defaults();
        let update = content_update("remote text");
        let target = DocHandle::new();
        target.apply_update(&update, UpdateOrigin::Remote).unwrap();
        assert_eq!(classifier.classify(&update), UpdateClass::Content);
    }
}
