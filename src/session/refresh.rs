//! Refresh tokens.
//!
//! Each session has at most one live refresh token. Two keys are written per
//! token with the same TTL:
//!
//! - `refresh:<refresh_id>` → [`RefreshRecord`]
//! - `session-refresh:<session_id>` → `refresh_id`

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::Result;
use crate::store::{Keyspace, KvStore};

/// Binding metadata captured when a refresh token is issued
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshMeta {
    /// Client IP at issuance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// User agent at issuance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// Stored refresh record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRecord {
    /// Session this token can renew
    pub session_id: String,
    /// Binding metadata
    #[serde(flatten)]
    pub meta: RefreshMeta,
}

/// A freshly minted refresh token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedRefresh {
    /// Client-facing handle
    pub refresh_id: String,
    /// TTL applied
    pub ttl_seconds: u64,
}

/// Issues, resolves and deletes refresh tokens
#[derive(Clone)]
pub struct RefreshTokenManager {
    store: Arc<dyn KvStore>,
    keys: Keyspace,
}

impl RefreshTokenManager {
    /// Create a manager over `store`
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>, keys: Keyspace) -> Self {
        Self { store, keys }
    }

    /// Mint a refresh token for `session_id` and record the reverse mapping.
    pub async fn create_refresh_token(
        &self,
        session_id: &str,
        ttl: Duration,
        meta: RefreshMeta,
    ) -> Result<IssuedRefresh> {
        let refresh_id = Uuid::new_v4().to_string();
        let record = RefreshRecord {
            session_id: session_id.to_string(),
            meta,
        };
        let value = serde_json::to_string(&record)?;

        self.store
            .set(&self.keys.refresh(&refresh_id), &value, ttl)
            .await?;
        self.store
            .set(&self.keys.session_refresh(session_id), &refresh_id, ttl)
            .await?;

        debug!(session_id = %session_id, "Issued refresh token");
        Ok(IssuedRefresh {
            refresh_id,
            ttl_seconds: ttl.as_secs(),
        })
    }

    /// Resolve a refresh handle. Unknown or unreadable handles are `None`.
    pub async fn get_session_id_by_refresh(&self, refresh_id: &str) -> Result<Option<RefreshRecord>> {
        let key = self.keys.refresh(refresh_id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(error = %e, "Discarding unreadable refresh record");
                self.store.delete(&key).await?;
                Ok(None)
            }
        }
    }

    /// Current refresh handle for a session, if any
    pub async fn refresh_id_for_session(&self, session_id: &str) -> Result<Option<String>> {
        Ok(self.store.get(&self.keys.session_refresh(session_id)).await?)
    }

    /// Delete a refresh token. The reverse index is dropped only while it
    /// still points at this token.
    pub async fn remove_refresh_token(&self, refresh_id: &str) -> Result<()> {
        if let Some(record) = self.get_session_id_by_refresh(refresh_id).await? {
            let index_key = self.keys.session_refresh(&record.session_id);
            if self.store.get(&index_key).await?.as_deref() == Some(refresh_id) {
                self.store.delete(&index_key).await?;
            }
        }
        self.store.delete(&self.keys.refresh(refresh_id)).await?;
        Ok(())
    }

    /// Delete the refresh token of a session together with the index entry
    pub async fn remove_refresh_by_session(&self, session_id: &str) -> Result<()> {
        let index_key = self.keys.session_refresh(session_id);
        if let Some(refresh_id) = self.store.get(&index_key).await? {
            self.store.delete(&self.keys.refresh(&refresh_id)).await?;
        }
        self.store.delete(&index_key).await?;
        Ok(())
    }
}
