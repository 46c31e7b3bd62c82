//! Session records and the login index.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use super::refresh::RefreshTokenManager;
use super::{CreatedSession, Session, SessionPayload};
use crate::Result;
use crate::store::{Keyspace, KvStore};

/// Upper bound on any session lifetime, whatever the backend asks for
pub const MAX_SESSION_TTL_SECONDS: u64 = 365 * 86_400;

/// Stores sessions under `session:<id>` and maps normalized logins to the
/// current session under `login:<login>`.
///
/// Every write goes through the [`KvStore`] TTL; reads additionally enforce
/// the absolute `expires_at` recorded in the session.
#[derive(Clone)]
pub struct SessionRepository {
    store: Arc<dyn KvStore>,
    keys: Keyspace,
    default_ttl: Duration,
    refresh: RefreshTokenManager,
}

impl SessionRepository {
    /// Create a repository. `default_ttl` applies when a caller gives no TTL.
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>, keys: Keyspace, default_ttl: Duration) -> Self {
        let refresh = RefreshTokenManager::new(Arc::clone(&store), keys.clone());
        Self {
            store,
            keys,
            default_ttl,
            refresh,
        }
    }

    /// Refresh tokens sharing this repository's store and keyspace
    #[must_use]
    pub fn refresh_tokens(&self) -> &RefreshTokenManager {
        &self.refresh
    }

    fn effective_ttl(&self, ttl_seconds: Option<u64>) -> u64 {
        ttl_seconds
            .filter(|ttl| *ttl > 0)
            .unwrap_or_else(|| self.default_ttl.as_secs().max(1))
            .min(MAX_SESSION_TTL_SECONDS)
    }

    /// Write a new session under a fresh v4 UUID.
    pub async fn create_session(
        &self,
        payload: SessionPayload,
        ttl_seconds: Option<u64>,
    ) -> Result<CreatedSession> {
        let session_id = Uuid::new_v4().to_string();
        let ttl_seconds = self.effective_ttl(ttl_seconds);
        let session = self.write(&session_id, payload, ttl_seconds).await?;

        debug!(session_id = %session_id, ttl = ttl_seconds, "Session created");
        Ok(CreatedSession {
            session_id,
            ttl_seconds,
            expires_at: session.expires_at,
        })
    }

    /// Overwrite an existing session and restart its TTL.
    pub async fn update_session(
        &self,
        session_id: &str,
        payload: SessionPayload,
        ttl_seconds: Option<u64>,
    ) -> Result<Session> {
        let ttl_seconds = self.effective_ttl(ttl_seconds);
        self.write(session_id, payload, ttl_seconds).await
    }

    async fn write(
        &self,
        session_id: &str,
        payload: SessionPayload,
        ttl_seconds: u64,
    ) -> Result<Session> {
        let created_at = Utc::now();
        let expires_at = chrono::Duration::from_std(Duration::from_secs(ttl_seconds))
            .ok()
            .and_then(|ttl| created_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let session = Session {
            session_id: session_id.to_string(),
            payload,
            created_at,
            expires_at,
            ttl_seconds,
        };

        let value = serde_json::to_string(&session)?;
        self.store
            .set(
                &self.keys.session(session_id),
                &value,
                Duration::from_secs(ttl_seconds),
            )
            .await?;
        Ok(session)
    }

    /// Read a session. Past-expiry records are removed and read as `None`;
    /// unreadable records are discarded the same way.
    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let Some(session) = self.read(session_id).await? else {
            return Ok(None);
        };

        if session.is_expired_at(Utc::now()) {
            debug!(session_id = %session_id, "Session expired on read");
            self.remove_session(session_id, session.payload.login.as_deref())
                .await?;
            return Ok(None);
        }

        Ok(Some(session))
    }

    async fn read(&self, session_id: &str) -> Result<Option<Session>> {
        let key = self.keys.session(session_id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };

        match serde_json::from_str::<Session>(&raw) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Discarding unreadable session record");
                self.store.delete(&key).await?;
                Ok(None)
            }
        }
    }

    /// Delete a session, its refresh token and its login index entry.
    ///
    /// Removing an unknown session is a no-op. When `login` is not given it is
    /// recovered from the stored record. The login index is only cleared
    /// while it still points at this session.
    pub async fn remove_session(&self, session_id: &str, login: Option<&str>) -> Result<()> {
        let login = match login {
            Some(login) => Some(login.to_string()),
            None => self
                .read(session_id)
                .await?
                .and_then(|session| session.payload.login),
        };

        self.store.delete(&self.keys.session(session_id)).await?;
        self.refresh.remove_refresh_by_session(session_id).await?;

        if let Some(login) = login {
            if self.get_session_id_by_login(&login).await?.as_deref() == Some(session_id) {
                self.remove_session_index(&login).await?;
            }
        }

        debug!(session_id = %session_id, "Session removed");
        Ok(())
    }

    /// Point `login` at `session_id`
    pub async fn set_session_id_for_login(
        &self,
        login: &str,
        session_id: &str,
        ttl_seconds: Option<u64>,
    ) -> Result<()> {
        let ttl = Duration::from_secs(self.effective_ttl(ttl_seconds));
        self.store
            .set(&self.keys.login(login), session_id, ttl)
            .await?;
        Ok(())
    }

    /// Session currently indexed for `login`
    pub async fn get_session_id_by_login(&self, login: &str) -> Result<Option<String>> {
        Ok(self.store.get(&self.keys.login(login)).await?)
    }

    /// Drop the login index entry
    pub async fn remove_session_index(&self, login: &str) -> Result<()> {
        self.store.delete(&self.keys.login(login)).await?;
        Ok(())
    }
}
