//! Bearer-credential lifecycle for the transport and persistence calls.
//!
//! The token manager keeps a best-effort credential available without ever
//! blocking the engine on its absence: anonymous operation is a supported
//! mode, so a failed or empty fetch degrades instead of failing. A periodic
//! task refreshes the credential ahead of its typical lifetime, and the
//! reconnect path refreshes synchronously before dialing so a stale token is
//! never embedded in a fresh connection.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

/// A bearer credential and when it was obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    pub token: String,
    pub obtained_at: SystemTime,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            obtained_at: SystemTime::now(),
        }
    }
}

/// Identity backend boundary. `Ok(None)` signals an anonymous session.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn fetch_credential(&self) -> Result<Option<Credential>, AuthError>;
}

#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// Proactive refresh period; shorter than the typical 60-minute
    /// token lifetime.
    pub refresh_interval: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(45 * 60),
        }
    }
}

/// Owns the credential; everyone else reads.
pub struct TokenManager {
    provider: Arc<dyn IdentityProvider>,
    credential: RwLock<Option<Credential>>,
    config: TokenConfig,
    alive: AtomicBool,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl TokenManager {
    pub fn new(provider: Arc<dyn IdentityProvider>, config: TokenConfig) -> Arc<Self> {
        Arc::new(Self {
            provider,
            credential: RwLock::new(None),
            config,
            alive: AtomicBool::new(true),
            refresh_task: Mutex::new(None),
        })
    }

    /// Fetch a fresh credential and store it. On fetch failure the previous
    /// (possibly absent) credential stays in place — this never errors,
    /// since unauthenticated operation is supported.
    pub async fn ensure_valid_token(&self) {
        match self.provider.fetch_credential().await {
            Ok(Some(cred)) => {
                log::debug!("Obtained credential (at {:?})", cred.obtained_at);
                *self.credential.write().await = Some(cred);
            }
            Ok(None) => {
                log::debug!("Identity backend reports anonymous session");
                *self.credential.write().await = None;
            }
            Err(e) => {
                log::warn!("Credential fetch failed, keeping previous: {e}");
            }
        }
    }

    /// Current credential, if any.
    pub async fn current(&self) -> Option<Credential> {
        self.credential.read().await.clone()
    }

    /// Invalidate the stored credential and fetch a replacement. Driven by
    /// auth-coded error frames from the relay.
    pub async fn handle_auth_error(&self) {
        log::info!("Auth error signalled; invalidating credential");
        *self.credential.write().await = None;
        self.ensure_valid_token().await;
    }

    /// Start the periodic proactive refresh task.
    pub fn start_refresh(self: &Arc<Self>) {
        let manager = self.clone();
        let interval = self.config.refresh_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it, connect() already fetched.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !manager.alive.load(Ordering::SeqCst) {
                    break;
                }
                manager.ensure_valid_token().await;
            }
        });
        // Replace any previous task.
        if let Ok(mut slot) = self.refresh_task.try_lock() {
            if let Some(old) = slot.replace(handle) {
                old.abort();
            }
        }
    }

    /// Stop the refresh task and mark the manager dead. Idempotent.
    pub async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(handle) = self.refresh_task.lock().await.take() {
            handle.abort();
        }
    }
}

/// Shape of the identity backend's response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    access_token: String,
    /// Unix millis; absent means "just now".
    #[serde(default)]
    obtained_at: Option<u64>,
}

/// HTTP identity client. A 204 response is the anonymous signal.
pub struct HttpIdentityProvider {
    http: reqwest::Client,
    url: String,
}

impl HttpIdentityProvider {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn fetch_credential(&self) -> Result<Option<Credential>, AuthError> {
        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| AuthError::Http(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(AuthError::Http(format!(
                "identity backend returned {}",
                response.status()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;

        let obtained_at = body
            .obtained_at
            .map(|ms| UNIX_EPOCH + Duration::from_millis(ms))
            .unwrap_or_else(SystemTime::now);

        Ok(Some(Credential {
            token: body.access_token,
            obtained_at,
        }))
    }
}

/// Credential errors. These stay internal to the token manager — callers see
/// a missing credential, never a thrown fetch failure.
#[derive(Debug, Clone)]
pub enum AuthError {
    Http(String),
    InvalidResponse(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http(e) => write!(f, "Identity request failed: {e}"),
            Self::InvalidResponse(e) => write!(f, "Invalid identity response: {e}"),
        }
    }
}

impl std::error::Error for AuthError {}
