//! Save coordination: many clients independently decide "this content
//! changed, persist it"; the backend must see each distinct content state
//! once, with retries, without cross-client locking.
//!
//! ```text
//! coordinate_save(content, kind, persist)
//!       │
//!       ├─ no credential ──────────────► Err(NotAuthenticated)
//!       ├─ hash in recent ledger ──────► Skipped (same/different actor echo)
//!       ├─ hash already in flight ─────► fan-in: wait for shared outcome
//!       └─ else ── coordination delay ─► persist ── retry w/ backoff ──► ledger
//! ```
//!
//! The coordination delay gives near-simultaneous callers a chance to
//! collapse into the fan-in path. Cross-client dedup is best-effort via the
//! timestamp ledger: two different clients can still race within the delay
//! window. That is an accepted limitation, not a bug — the CRDT makes the
//! duplicate harmless, just redundant.

use futures_util::future::BoxFuture;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::auth::TokenManager;
use crate::backend::PersistenceError;

/// A persistence closure. Retained for the lifetime of its pending entry so
/// retries re-invoke the original closure instead of re-deriving it.
pub type PersistFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), PersistenceError>> + Send + Sync>;

/// What triggered a save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveKind {
    /// User-visible explicit save; gets the short coordination delay and a
    /// doubled dedup window.
    Manual,
    /// Background autosave.
    Auto,
    /// Save triggered by the sync relay path.
    Sync,
}

/// Why a save was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// We persisted this exact content within the window ourselves.
    SameActorEcho,
    /// Another client's save of this content echoed back within the window.
    DifferentActorEcho,
}

/// Outcome of a coordinated save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Persisted,
    Skipped(SkipReason),
}

impl SaveOutcome {
    pub fn persisted(&self) -> bool {
        matches!(self, SaveOutcome::Persisted)
    }
}

/// One persistence attempt's identity, held while it is in flight.
#[derive(Debug, Clone)]
pub struct SaveOperation {
    pub content_hash: String,
    pub started_at: Instant,
    pub actor_id: Uuid,
    pub kind: SaveKind,
    pub document_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct SaveConfig {
    /// Identical-content saves within this span are duplicates.
    pub dedup_window: Duration,
    /// Coordination delay before a manual save persists.
    pub manual_delay: Duration,
    /// Coordination delay before an auto/sync save persists.
    pub auto_delay: Duration,
    /// Retry attempts after the initial failure.
    pub max_retries: u32,
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(2),
            manual_delay: Duration::from_millis(50),
            auto_delay: Duration::from_millis(200),
            max_retries: 3,
        }
    }
}

/// Stable hex SHA-256 over the content's canonical serialization.
pub fn content_hash(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone)]
struct LedgerEntry {
    at: Instant,
    actor_id: Uuid,
}

/// `content_hash -> {timestamp, actor}` for recently persisted content.
/// Entries older than `10 × dedup_window` are evicted lazily on access.
struct RecentSaveLedger {
    entries: HashMap<String, LedgerEntry>,
    window: Duration,
}

impl RecentSaveLedger {
    fn new(window: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            window,
        }
    }

    fn max_age(&self) -> Duration {
        self.window * 10
    }

    /// Returns the entry if this hash was saved within the dedup window for
    /// the given kind. Manual saves use a doubled window: they are
    /// user-visible and should be skipped even more conservatively.
    fn recent(&mut self, hash: &str, kind: SaveKind) -> Option<LedgerEntry> {
        let entry = self.entries.get(hash)?.clone();
        let age = entry.at.elapsed();
        if age > self.max_age() {
            self.entries.remove(hash);
            return None;
        }
        let window = match kind {
            SaveKind::Manual => self.window * 2,
            SaveKind::Auto | SaveKind::Sync => self.window,
        };
        (age <= window).then_some(entry)
    }

    fn record(&mut self, hash: &str, actor_id: Uuid) {
        self.entries.insert(
            hash.to_string(),
            LedgerEntry {
                at: Instant::now(),
                actor_id,
            },
        );
    }

    /// Full sweep; returns how many entries were evicted.
    fn cleanup(&mut self) -> usize {
        let max_age = self.max_age();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.at.elapsed() <= max_age);
        before - self.entries.len()
    }
}

/// An in-flight save: the operation, the driver task, and the completion
/// senders of every caller that fanned in while it was pending.
struct PendingSave {
    op: SaveOperation,
    waiters: Vec<oneshot::Sender<Result<(), PersistenceError>>>,
    task: JoinHandle<()>,
}

/// Deduplicating, retrying persistence coordinator for one document session.
pub struct SaveCoordinator {
    config: SaveConfig,
    document_id: Uuid,
    actor_id: Uuid,
    tokens: Arc<TokenManager>,
    ledger: Arc<Mutex<RecentSaveLedger>>,
    pending: Arc<Mutex<HashMap<String, PendingSave>>>,
    alive: Arc<AtomicBool>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl SaveCoordinator {
    pub fn new(
        config: SaveConfig,
        document_id: Uuid,
        actor_id: Uuid,
        tokens: Arc<TokenManager>,
    ) -> Arc<Self> {
        let ledger = Arc::new(Mutex::new(RecentSaveLedger::new(config.dedup_window)));
        Arc::new(Self {
            config,
            document_id,
            actor_id,
            tokens,
            ledger,
            pending: Arc::new(Mutex::new(HashMap::new())),
            alive: Arc::new(AtomicBool::new(true)),
            cleanup_task: Mutex::new(None),
        })
    }

    /// Coordinate one persistence request.
    ///
    /// Returns `Ok(Persisted)` when this call (or an in-flight attempt it
    /// fanned into) durably persisted the content, `Ok(Skipped(..))` when the
    /// dedup ledger says the content was already saved within the window.
    pub async fn coordinate_save(
        &self,
        content: &[u8],
        kind: SaveKind,
        persist: PersistFn,
    ) -> Result<SaveOutcome, PersistenceError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(PersistenceError::ShuttingDown);
        }
        // Persistence must not run unauthenticated.
        if self.tokens.current().await.is_none() {
            return Err(PersistenceError::NotAuthenticated);
        }

        let hash = content_hash(content);

        {
            let mut ledger = self.ledger.lock().await;
            if let Some(entry) = ledger.recent(&hash, kind) {
                let reason = if entry.actor_id == self.actor_id {
                    SkipReason::SameActorEcho
                } else {
                    SkipReason::DifferentActorEcho
                };
                log::debug!(
                    "Skipping {kind:?} save of {hash}: saved {:?} ago ({reason:?})",
                    entry.at.elapsed()
                );
                return Ok(SaveOutcome::Skipped(reason));
            }
        }

        let rx = {
            let mut pending = self.pending.lock().await;
            let (tx, rx) = oneshot::channel();
            if let Some(entry) = pending.get_mut(&hash) {
                // Fan-in: one attempt in flight per hash; everyone shares
                // its outcome.
                log::debug!("Joining in-flight save for {hash}");
                entry.waiters.push(tx);
            } else {
                let op = SaveOperation {
                    content_hash: hash.clone(),
                    started_at: Instant::now(),
                    actor_id: self.actor_id,
                    kind,
                    document_id: self.document_id,
                };
                let task = self.spawn_driver(hash.clone(), kind, persist);
                pending.insert(
                    hash.clone(),
                    PendingSave {
                        op,
                        waiters: vec![tx],
                        task,
                    },
                );
            }
            rx
        };

        match rx.await {
            Ok(Ok(())) => Ok(SaveOutcome::Persisted),
            Ok(Err(e)) => Err(e),
            // Driver dropped without resolving: torn down mid-save.
            Err(_) => Err(PersistenceError::ShuttingDown),
        }
    }

    /// Drives one pending save: coordination delay, then persist with
    /// exponential backoff retries, then ledger record + waiter fan-out.
    fn spawn_driver(&self, hash: String, kind: SaveKind, persist: PersistFn) -> JoinHandle<()> {
        let ledger = self.ledger.clone();
        let pending = self.pending.clone();
        let alive = self.alive.clone();
        let actor_id = self.actor_id;
        let config = self.config.clone();

        tokio::spawn(async move {
            let delay = match kind {
                SaveKind::Manual => config.manual_delay,
                SaveKind::Auto | SaveKind::Sync => config.auto_delay,
            };
            tokio::time::sleep(delay).await;
            if !alive.load(Ordering::SeqCst) {
                return;
            }

            let mut attempt: u32 = 0;
            let result = loop {
                match persist().await {
                    Ok(()) => break Ok(()),
                    Err(e) => {
                        if attempt >= config.max_retries {
                            break Err(PersistenceError::RetriesExhausted {
                                attempts: attempt + 1,
                                last: e.to_string(),
                            });
                        }
                        let backoff = Duration::from_secs(1u64 << attempt.min(16));
                        log::warn!(
                            "Save attempt {} for {hash} failed ({e}); retrying in {backoff:?}",
                            attempt + 1
                        );
                        attempt += 1;
                        tokio::time::sleep(backoff).await;
                        if !alive.load(Ordering::SeqCst) {
                            return;
                        }
                    }
                }
            };

            if result.is_ok() {
                ledger.lock().await.record(&hash, actor_id);
                log::debug!("Persisted {hash} (attempt {})", attempt + 1);
            }

            if let Some(entry) = pending.lock().await.remove(&hash) {
                log::debug!(
                    "Resolving {:?} save of {hash} ({} waiters, started {:?} ago)",
                    entry.op.kind,
                    entry.waiters.len(),
                    entry.op.started_at.elapsed()
                );
                for waiter in entry.waiters {
                    let _ = waiter.send(result.clone());
                }
            }
        })
    }

    /// Record that another client persisted this content. Fed by the engine
    /// when remote updates arrive, so our own autosave of the echoed state
    /// skips as a different-actor echo.
    pub async fn record_external(&self, hash: &str, actor_id: Uuid) {
        self.ledger.lock().await.record(hash, actor_id);
    }

    /// Evict ledger entries older than `10 × dedup_window`.
    pub async fn cleanup(&self) -> usize {
        self.ledger.lock().await.cleanup()
    }

    /// Start the periodic ledger sweep.
    pub fn start_cleanup(self: &Arc<Self>) {
        let coordinator = self.clone();
        let period = self.config.dedup_window * 10;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !coordinator.alive.load(Ordering::SeqCst) {
                    break;
                }
                let evicted = coordinator.cleanup().await;
                if evicted > 0 {
                    log::debug!("Save ledger sweep evicted {evicted} entries");
                }
            }
        });
        if let Ok(mut slot) = self.cleanup_task.try_lock() {
            if let Some(old) = slot.replace(handle) {
                old.abort();
            }
        }
    }

    /// Cancel timers and drop all pending retry state. Waiters resolve with
    /// [`PersistenceError::ShuttingDown`]. Idempotent.
    pub async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(handle) = self.cleanup_task.lock().await.take() {
            handle.abort();
        }
        let mut pending = self.pending.lock().await;
        for (_, entry) in pending.drain() {
            entry.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthError, Credential, IdentityProvider, TokenConfig};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct FixedProvider(Option<String>);

    #[async_trait]
    impl IdentityProvider for FixedProvider {
        async fn fetch_credential(&self) -> Result<Option<Credential>, AuthError> {
            Ok(self.0.clone().map(Credential::new))
        }
    }

    async fn authed_tokens() -> Arc<TokenManager> {
        let tokens = TokenManager::new(
            Arc::new(FixedProvider(Some("tok".into()))),
            TokenConfig::default(),
        );
        tokens.ensure_valid_token().await;
        tokens
    }

    async fn anonymous_tokens() -> Arc<TokenManager> {
        TokenManager::new(Arc::new(FixedProvider(None)), TokenConfig::default())
    }

    fn coordinator(config: SaveConfig, tokens: Arc<TokenManager>) -> Arc<SaveCoordinator> {
        SaveCoordinator::new(config, Uuid::new_v4(), Uuid::new_v4(), tokens)
    }

    /// Persist closure failing `fail_first` times before succeeding.
    fn scripted_persist(counter: Arc<AtomicU32>, fail_first: u32) -> PersistFn {
        Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < fail_first {
                    Err(PersistenceError::Http("backend unavailable".into()))
                } else {
                    Ok(())
                }
            })
        })
    }

    fn fast_config() -> SaveConfig {
        SaveConfig {
            dedup_window: Duration::from_millis(2000),
            manual_delay: Duration::from_millis(50),
            auto_delay: Duration::from_millis(200),
            max_retries: 3,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedup_within_window() {
        let coordinator = coordinator(fast_config(), authed_tokens().await);
        let calls = Arc::new(AtomicU32::new(0));

        let first = coordinator
            .coordinate_save(b"abc123", SaveKind::Auto, scripted_persist(calls.clone(), 0))
            .await
            .unwrap();
        assert_eq!(first, SaveOutcome::Persisted);

        tokio::time::advance(Duration::from_millis(1000)).await;

        let second = coordinator
            .coordinate_save(b"abc123", SaveKind::Auto, scripted_persist(calls.clone(), 0))
            .await
            .unwrap();
        assert_eq!(second, SaveOutcome::Skipped(SkipReason::SameActorEcho));
        assert_eq!(calls.load(Ordering::SeqCst), 1, "persistFn invoked exactly once");
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_content_both_persist() {
        let coordinator = coordinator(fast_config(), authed_tokens().await);
        let calls = Arc::new(AtomicU32::new(0));

        coordinator
            .coordinate_save(b"one", SaveKind::Auto, scripted_persist(calls.clone(), 0))
            .await
            .unwrap();
        coordinator
            .coordinate_save(b"two", SaveKind::Auto, scripted_persist(calls.clone(), 0))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_window_is_doubled() {
        let config = SaveConfig {
            dedup_window: Duration::from_millis(1000),
            ..fast_config()
        };
        let coordinator = coordinator(config, authed_tokens().await);
        let calls = Arc::new(AtomicU32::new(0));

        coordinator
            .coordinate_save(b"content", SaveKind::Auto, scripted_persist(calls.clone(), 0))
            .await
            .unwrap();

        // 1.5s later: outside the 1s auto window, inside the 2s manual one.
        tokio::time::advance(Duration::from_millis(1500)).await;

        let manual = coordinator
            .coordinate_save(b"content", SaveKind::Manual, scripted_persist(calls.clone(), 0))
            .await
            .unwrap();
        assert!(matches!(manual, SaveOutcome::Skipped(_)));

        let auto = coordinator
            .coordinate_save(b"content", SaveKind::Auto, scripted_persist(calls.clone(), 0))
            .await
            .unwrap();
        assert_eq!(auto, SaveOutcome::Persisted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_fan_in() {
        let coordinator = coordinator(fast_config(), authed_tokens().await);
        let calls = Arc::new(AtomicU32::new(0));

        let (a, b) = tokio::join!(
            coordinator.coordinate_save(b"same", SaveKind::Auto, scripted_persist(calls.clone(), 0)),
            coordinator.coordinate_save(b"same", SaveKind::Auto, scripted_persist(calls.clone(), 0)),
        );
        assert_eq!(a.unwrap(), SaveOutcome::Persisted);
        assert_eq!(b.unwrap(), SaveOutcome::Persisted);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "callers collapsed into one attempt");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let coordinator = coordinator(fast_config(), authed_tokens().await);
        let calls = Arc::new(AtomicU32::new(0));

        let outcome = coordinator
            .coordinate_save(b"flaky", SaveKind::Auto, scripted_persist(calls.clone(), 2))
            .await
            .unwrap();
        assert_eq!(outcome, SaveOutcome::Persisted);
        assert_eq!(calls.load(Ordering::SeqCst), 3, "two failures then one success");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let config = SaveConfig {
            max_retries: 2,
            ..fast_config()
        };
        let coordinator = coordinator(config, authed_tokens().await);
        let calls = Arc::new(AtomicU32::new(0));

        let result = coordinator
            .coordinate_save(b"doomed", SaveKind::Auto, scripted_persist(calls.clone(), u32::MAX))
            .await;
        match result {
            Err(PersistenceError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("Expected RetriesExhausted, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // A failed save leaves no ledger entry: the next attempt runs.
        let outcome = coordinator
            .coordinate_save(b"doomed", SaveKind::Auto, scripted_persist(Arc::new(AtomicU32::new(0)), 0))
            .await
            .unwrap();
        assert_eq!(outcome, SaveOutcome::Persisted);
    }

    #[tokio::test]
    async fn test_unauthenticated_fails_fast() {
        let coordinator = coordinator(fast_config(), anonymous_tokens().await);
        let calls = Arc::new(AtomicU32::new(0));

        let result = coordinator
            .coordinate_save(b"content", SaveKind::Manual, scripted_persist(calls.clone(), 0))
            .await;
        assert!(matches!(result, Err(PersistenceError::NotAuthenticated)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_actor_echo() {
        let coordinator = coordinator(fast_config(), authed_tokens().await);
        let peer = Uuid::new_v4();

        coordinator
            .record_external(&content_hash(b"their edit"), peer)
            .await;

        let outcome = coordinator
            .coordinate_save(b"their edit", SaveKind::Auto, scripted_persist(Arc::new(AtomicU32::new(0)), 0))
            .await
            .unwrap();
        assert_eq!(outcome, SaveOutcome::Skipped(SkipReason::DifferentActorEcho));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ledger_cleanup_evicts_old_entries() {
        let config = SaveConfig {
            dedup_window: Duration::from_millis(100),
            ..fast_config()
        };
        let coordinator = coordinator(config, authed_tokens().await);
        coordinator
            .coordinate_save(b"old", SaveKind::Auto, scripted_persist(Arc::new(AtomicU32::new(0)), 0))
            .await
            .unwrap();

        // Inside 10×window: nothing to evict.
        assert_eq!(coordinator.cleanup().await, 0);

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert_eq!(coordinator.cleanup().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drops_pending_saves() {
        let coordinator = coordinator(fast_config(), authed_tokens().await);
        let calls = Arc::new(AtomicU32::new(0));

        let pending = {
            let coordinator = coordinator.clone();
            let persist = scripted_persist(calls.clone(), 0);
            tokio::spawn(async move {
                coordinator
                    .coordinate_save(b"in flight", SaveKind::Auto, persist)
                    .await
            })
        };
        // Let the save reach its coordination delay.
        tokio::task::yield_now().await;

        coordinator.shutdown().await;
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(PersistenceError::ShuttingDown)));

        // Any previously scheduled timer firing after destroy has no effect.
        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0, "no persist after shutdown");

        let late = coordinator
            .coordinate_save(b"late", SaveKind::Auto, scripted_persist(calls.clone(), 0))
            .await;
        assert!(matches!(late, Err(PersistenceError::ShuttingDown)));
    }

    #[test]
    fn test_content_hash_stable_hex() {
        let a = content_hash(b"abc123");
        let b = content_hash(b"abc123");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, content_hash(b"abc124"));
    }
}
