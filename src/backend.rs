//! Persistence API boundary.
//!
//! The durable store is an external collaborator reached over HTTP:
//!
//! ```text
//! POST /updates {documentId, updateData}   append a durable update record
//! GET  /updates?documentId=...             ordered log for load-and-replay
//! ```
//!
//! The engine only talks to it through [`UpdateBackend`], so tests swap in
//! in-memory implementations. Binary update bytes are base64 inside JSON.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::TokenManager;

/// Durable update log boundary.
#[async_trait]
pub trait UpdateBackend: Send + Sync {
    /// Append one update record to the document's durable log.
    async fn append_update(&self, document_id: Uuid, update: &[u8])
        -> Result<(), PersistenceError>;

    /// Fetch the ordered update log for initial load-and-replay.
    async fn fetch_updates(&self, document_id: Uuid) -> Result<Vec<Vec<u8>>, PersistenceError>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AppendRequest {
    pub document_id: Uuid,
    /// Base64-encoded update bytes.
    pub update_data: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UpdateRecord {
    pub update_data: String,
}

/// HTTP client for the persistence API. Sends the bearer credential when
/// one is available; anonymous appends are the backend's call to reject.
pub struct HttpUpdateBackend {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenManager>,
}

impl HttpUpdateBackend {
    pub fn new(base_url: impl Into<String>, tokens: Arc<TokenManager>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            tokens,
        }
    }

    async fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.tokens.current().await {
            Some(cred) => request.bearer_auth(cred.token),
            None => request,
        }
    }
}

#[async_trait]
impl UpdateBackend for HttpUpdateBackend {
    async fn append_update(
        &self,
        document_id: Uuid,
        update: &[u8],
    ) -> Result<(), PersistenceError> {
        let body = AppendRequest {
            document_id,
            update_data: BASE64.encode(update),
        };
        let request = self.http.post(format!("{}/updates", self.base_url)).json(&body);
        let response = self
            .authorize(request)
            .await
            .send()
            .await
            .map_err(|e| PersistenceError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PersistenceError::Backend {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    async fn fetch_updates(&self, document_id: Uuid) -> Result<Vec<Vec<u8>>, PersistenceError> {
        let request = self
            .http
            .get(format!("{}/updates", self.base_url))
            .query(&[("documentId", document_id.to_string())]);
        let response = self
            .authorize(request)
            .await
            .send()
            .await
            .map_err(|e| PersistenceError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PersistenceError::Backend {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let records: Vec<UpdateRecord> = response
            .json()
            .await
            .map_err(|e| PersistenceError::Http(e.to_string()))?;

        records
            .into_iter()
            .map(|r| {
                BASE64
                    .decode(&r.update_data)
                    .map_err(|e| PersistenceError::Http(format!("bad update record: {e}")))
            })
            .collect()
    }
}

/// Persistence failures. Surfaced to the caller after retries; live
/// collaboration is unaffected — only durability is at risk.
#[derive(Debug, Clone)]
pub enum PersistenceError {
    /// Persistence must not run unauthenticated.
    NotAuthenticated,
    Http(String),
    Backend { status: u16, message: String },
    RetriesExhausted { attempts: u32, last: String },
    /// The coordinator was torn down while this save was pending.
    ShuttingDown,
}

impl std::fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAuthenticated => write!(f, "No valid credential for persistence"),
            Self::Http(e) => write!(f, "Persistence request failed: {e}"),
            Self::Backend { status, message } => {
                write!(f, "Persistence backend returned {status}: {message}")
            }
            Self::RetriesExhausted { attempts, last } => {
                write!(f, "Save failed after {attempts} attempts: {last}")
            }
            Self::ShuttingDown => write!(f, "Save coordinator shutting down"),
        }
    }
}

impl std::error::Error for PersistenceError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_request_shape() {
        let body = AppendRequest {
            document_id: Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap(),
            update_data: BASE64.encode([1u8, 2, 3]),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["documentId"], "550e8400-e29b-41d4-a716-446655440000");
        assert_eq!(value["updateData"], "AQID");
    }

    #[test]
    fn test_update_record_parse() {
        let records: Vec<UpdateRecord> =
            serde_json::from_str(r#"[{"updateData":"AQID"},{"updateData":"BAU="}]"#).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(BASE64.decode(&records[0].update_data).unwrap(), vec![1, 2, 3]);
        assert_eq!(BASE64.decode(&records[1].update_data).unwrap(), vec![4, 5]);
    }

    #[test]
    fn test_error_display() {
        let e = PersistenceError::RetriesExhausted {
            attempts: 4,
            last: "503".into(),
        };
        assert!(e.to_string().contains("4 attempts"));
    }
}
