// Signed-in session handling
// The access token is kept base64-encoded in local storage and re-read on every request

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::storage::{LocalStorage, StorageError};

pub const SESSION_STORAGE_KEY: &str = "session";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No active session; sign in first")]
    Missing,

    #[error("Stored session is unreadable: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Session {
    pub user_id: String,
    access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(user_id: &str, access_token: &str, expires_at: Option<DateTime<Utc>>) -> Self {
        Session {
            user_id: user_id.to_string(),
            access_token: BASE64.encode(access_token),
            expires_at,
        }
    }

    pub fn access_token(&self) -> Result<String, SessionError> {
        let bytes = BASE64
            .decode(&self.access_token)
            .map_err(|e| SessionError::Corrupt(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| SessionError::Corrupt(e.to_string()))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

pub fn save_session(storage: &dyn LocalStorage, session: &Session) -> Result<(), SessionError> {
    let raw = serde_json::to_string_pretty(session).map_err(|e| SessionError::Corrupt(e.to_string()))?;
    storage.set_item(SESSION_STORAGE_KEY, &raw)?;
    info!("Session saved for {}", session.user_id);
    Ok(())
}

pub fn load_session(storage: &dyn LocalStorage) -> Result<Option<Session>, SessionError> {
    let raw = match storage.get_item(SESSION_STORAGE_KEY)? {
        Some(raw) => raw,
        None => return Ok(None),
    };
    let session: Session = serde_json::from_str(&raw).map_err(|e| SessionError::Corrupt(e.to_string()))?;
    Ok(Some(session))
}

pub fn clear_session(storage: &dyn LocalStorage) -> Result<(), SessionError> {
    storage.remove_item(SESSION_STORAGE_KEY)?;
    Ok(())
}

/// Source of the bearer token used for authenticated backend calls.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Fetch the current access token. Called once per delivery attempt.
    async fn access_token(&self) -> Result<String, SessionError>;
}

/// Reads the session from local storage on every call, so a token refreshed
/// by another part of the app is picked up immediately.
pub struct StoredSession {
    storage: Arc<dyn LocalStorage>,
}

impl StoredSession {
    pub fn new(storage: Arc<dyn LocalStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl SessionProvider for StoredSession {
    async fn access_token(&self) -> Result<String, SessionError> {
        let session = load_session(self.storage.as_ref())?.ok_or(SessionError::Missing)?;
        if session.is_expired(Utc::now()) {
            // The backend decides; an expired token just fails with 401 on each path
            warn!("Session for {} has expired; requests may be rejected", session.user_id);
        }
        session.access_token()
    }
}
