//! Multi-key session sequences.
//!
//! None of these are transactional. A failure part way through leaves the
//! store in a state that still resolves safely: an orphaned record simply
//! expires, and a session without a refresh token works until its TTL runs
//! out.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::{RefreshMeta, RotationError, SessionPayload, SessionRepository};
use crate::Result;

/// A session opened at login
#[derive(Debug, Clone, PartialEq)]
pub struct OpenedSession {
    /// New session handle
    pub session_id: String,
    /// Access TTL applied
    pub ttl_seconds: u64,
    /// Absolute expiry
    pub expires_at: DateTime<Utc>,
    /// Refresh handle, when one could be minted
    pub refresh_id: Option<String>,
    /// Refresh TTL
    pub refresh_ttl_seconds: u64,
}

/// Outcome of a successful rotation
#[derive(Debug, Clone, PartialEq)]
pub struct RotatedSession {
    /// Replacement session handle
    pub session_id: String,
    /// Replacement refresh handle
    pub refresh_id: String,
    /// Access TTL carried over from the old session
    pub ttl_seconds: u64,
    /// Refresh TTL
    pub refresh_ttl_seconds: u64,
    /// User carried over from the old session
    pub user: Option<serde_json::Value>,
}

/// Opens, rotates and closes sessions
pub struct SessionLifecycle {
    repo: Arc<SessionRepository>,
    refresh_ttl: Duration,
}

impl SessionLifecycle {
    /// Create a lifecycle over `repo`, minting refresh tokens valid for `refresh_ttl`.
    #[must_use]
    pub fn new(repo: Arc<SessionRepository>, refresh_ttl: Duration) -> Self {
        Self { repo, refresh_ttl }
    }

    /// Underlying repository
    #[must_use]
    pub fn repository(&self) -> &Arc<SessionRepository> {
        &self.repo
    }

    /// Open a session for a freshly authenticated user.
    ///
    /// Any session still indexed for the same login is removed first (last
    /// login wins). Then the new session is written, indexed and given a
    /// refresh token bound to the login IP and user agent.
    pub async fn open_session(
        &self,
        payload: SessionPayload,
        ttl_seconds: Option<u64>,
    ) -> Result<OpenedSession> {
        let login = payload.login.clone();

        if let Some(login) = login.as_deref() {
            if let Some(previous) = self.repo.get_session_id_by_login(login).await? {
                self.repo.remove_session(&previous, Some(login)).await?;
                telemetry_metrics::counter!("broker_sessions_evicted_total").increment(1);
                info!(login = %login, previous = %previous, "Evicted previous session for login");
            }
        }

        let meta = RefreshMeta {
            ip: payload.ip.clone(),
            user_agent: payload.user_agent.clone(),
        };
        let created = self.repo.create_session(payload, ttl_seconds).await?;

        if let Some(login) = login.as_deref() {
            self.repo
                .set_session_id_for_login(login, &created.session_id, Some(created.ttl_seconds))
                .await?;
        }

        let refresh_id = match self
            .repo
            .refresh_tokens()
            .create_refresh_token(&created.session_id, self.refresh_ttl, meta)
            .await
        {
            Ok(issued) => Some(issued.refresh_id),
            Err(e) => {
                error!(session_id = %created.session_id, error = %e, "Failed to issue refresh token");
                None
            }
        };

        telemetry_metrics::counter!("broker_sessions_opened_total").increment(1);
        Ok(OpenedSession {
            session_id: created.session_id,
            ttl_seconds: created.ttl_seconds,
            expires_at: created.expires_at,
            refresh_id,
            refresh_ttl_seconds: self.refresh_ttl.as_secs(),
        })
    }

    /// Exchange a refresh handle for a new session and a new refresh handle.
    ///
    /// Refresh handles are single use: the old session and the old handle
    /// are both gone once this returns `Ok`.
    pub async fn rotate(
        &self,
        refresh_id: &str,
        client_ip: &str,
        user_agent: Option<&str>,
    ) -> Result<RotatedSession> {
        let result = self.try_rotate(refresh_id, client_ip, user_agent).await;
        match &result {
            Ok(_) => telemetry_metrics::counter!("broker_refresh_total", "outcome" => "rotated").increment(1),
            Err(crate::Error::Rotation(e)) => {
                telemetry_metrics::counter!("broker_refresh_total", "outcome" => e.kind()).increment(1);
            }
            Err(_) => {}
        }
        result
    }

    async fn try_rotate(
        &self,
        refresh_id: &str,
        client_ip: &str,
        user_agent: Option<&str>,
    ) -> Result<RotatedSession> {
        let refresh = self.repo.refresh_tokens();

        let Some(record) = refresh.get_session_id_by_refresh(refresh_id).await? else {
            return Err(RotationError::InvalidRefresh.into());
        };

        let Some(old) = self.repo.get_session(&record.session_id).await? else {
            refresh.remove_refresh_token(refresh_id).await?;
            return Err(RotationError::SessionExpired.into());
        };

        if record.meta.ip.as_deref().is_some_and(|ip| ip != client_ip) {
            warn!(
                session_id = %record.session_id,
                client_ip = %client_ip,
                "Refresh presented from a different IP"
            );
            refresh.remove_refresh_token(refresh_id).await?;
            return Err(RotationError::IpMismatch.into());
        }

        let login = old.payload.login.clone();
        self.repo
            .remove_session(&old.session_id, login.as_deref())
            .await?;

        let created = self
            .repo
            .create_session(old.payload.clone(), Some(old.ttl_seconds))
            .await?;

        if let Some(login) = login.as_deref() {
            self.repo
                .set_session_id_for_login(login, &created.session_id, Some(created.ttl_seconds))
                .await?;
        }

        let issued = refresh
            .create_refresh_token(
                &created.session_id,
                self.refresh_ttl,
                RefreshMeta {
                    ip: Some(client_ip.to_string()),
                    user_agent: user_agent.map(str::to_string),
                },
            )
            .await?;
        refresh.remove_refresh_token(refresh_id).await?;

        debug!(
            old_session = %old.session_id,
            new_session = %created.session_id,
            "Rotated session"
        );

        Ok(RotatedSession {
            session_id: created.session_id,
            refresh_id: issued.refresh_id,
            ttl_seconds: created.ttl_seconds,
            refresh_ttl_seconds: issued.ttl_seconds,
            user: old.payload.user,
        })
    }

    /// Best-effort logout. Store failures are logged and swallowed so the
    /// client can always clear its cookies.
    pub async fn logout(&self, session_id: Option<&str>, refresh_id: Option<&str>) {
        if let Some(session_id) = session_id {
            if let Err(e) = self.repo.remove_session(session_id, None).await {
                warn!(session_id = %session_id, error = %e, "Failed to remove session on logout");
            }
        }

        if let Some(refresh_id) = refresh_id {
            if let Err(e) = self.repo.refresh_tokens().remove_refresh_token(refresh_id).await {
                warn!(error = %e, "Failed to remove refresh token on logout");
            }
        }

        telemetry_metrics::counter!("broker_logouts_total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::session::repository::MAX_SESSION_TTL_SECONDS;
    use crate::store::{InMemoryStore, Keyspace, KvStore};

    fn lifecycle() -> (SessionLifecycle, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let repo = Arc::new(SessionRepository::new(
            store.clone(),
            Keyspace::new("t:"),
            Duration::from_secs(86_400),
        ));
        (
            SessionLifecycle::new(repo, Duration::from_secs(7 * 86_400)),
            store,
        )
    }

    fn payload(login: &str, ip: &str) -> SessionPayload {
        SessionPayload {
            backend_token: format!("token-for-{login}"),
            login: Some(login.to_string()),
            ip: Some(ip.to_string()),
            user_agent: Some("agent/1.0".to_string()),
            ..SessionPayload::default()
        }
    }

    #[tokio::test]
    async fn open_session_indexes_login_and_mints_refresh() {
        let (lifecycle, _store) = lifecycle();

        let opened = lifecycle
            .open_session(payload("a@x.com", "1.1.1.1"), Some(3600))
            .await
            .unwrap();

        let repo = lifecycle.repository();
        assert_eq!(opened.ttl_seconds, 3600);
        assert_eq!(opened.refresh_ttl_seconds, 7 * 86_400);
        assert_eq!(
            repo.get_session_id_by_login("a@x.com").await.unwrap(),
            Some(opened.session_id.clone())
        );

        let refresh_id = opened.refresh_id.unwrap();
        let record = repo
            .refresh_tokens()
            .get_session_id_by_refresh(&refresh_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.session_id, opened.session_id);
        assert_eq!(record.meta.ip.as_deref(), Some("1.1.1.1"));
        assert_eq!(record.meta.user_agent.as_deref(), Some("agent/1.0"));
    }

    #[tokio::test]
    async fn huge_backend_expiry_opens_a_clamped_session() {
        let (lifecycle, _store) = lifecycle();

        let opened = lifecycle
            .open_session(payload("a@x.com", "1.1.1.1"), Some(u64::MAX))
            .await
            .unwrap();

        assert_eq!(opened.ttl_seconds, MAX_SESSION_TTL_SECONDS);
        assert!(opened.refresh_id.is_some());
        assert!(
            lifecycle
                .repository()
                .get_session(&opened.session_id)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn second_login_evicts_first() {
        // GIVEN: user a@x.com logged in once
        let (lifecycle, _store) = lifecycle();
        let first = lifecycle
            .open_session(payload("a@x.com", "1.1.1.1"), Some(3600))
            .await
            .unwrap();

        // WHEN: they log in again
        let second = lifecycle
            .open_session(payload("a@x.com", "1.1.1.1"), Some(3600))
            .await
            .unwrap();

        // THEN: only the newer session resolves, and the first refresh handle is dead
        let repo = lifecycle.repository();
        assert!(repo.get_session(&first.session_id).await.unwrap().is_none());
        assert!(repo.get_session(&second.session_id).await.unwrap().is_some());
        assert_eq!(
            repo.get_session_id_by_login("a@x.com").await.unwrap(),
            Some(second.session_id)
        );

        let err = lifecycle
            .rotate(&first.refresh_id.unwrap(), "1.1.1.1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rotation(RotationError::InvalidRefresh)));
    }

    #[tokio::test]
    async fn different_logins_do_not_evict_each_other() {
        let (lifecycle, _store) = lifecycle();
        let a = lifecycle
            .open_session(payload("a@x.com", "1.1.1.1"), None)
            .await
            .unwrap();
        let b = lifecycle
            .open_session(payload("b@x.com", "1.1.1.1"), None)
            .await
            .unwrap();

        let repo = lifecycle.repository();
        assert!(repo.get_session(&a.session_id).await.unwrap().is_some());
        assert!(repo.get_session(&b.session_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rotate_replaces_session_and_refresh() {
        // GIVEN: an open session
        let (lifecycle, _store) = lifecycle();
        let opened = lifecycle
            .open_session(payload("a@x.com", "1.1.1.1"), Some(3600))
            .await
            .unwrap();
        let r1 = opened.refresh_id.clone().unwrap();

        // WHEN: the refresh handle is rotated from the same IP
        let rotated = lifecycle.rotate(&r1, "1.1.1.1", Some("agent/2.0")).await.unwrap();

        // THEN: a new session with the same payload and TTL replaces the old one
        let repo = lifecycle.repository();
        assert_ne!(rotated.session_id, opened.session_id);
        assert_ne!(rotated.refresh_id, r1);
        assert_eq!(rotated.ttl_seconds, 3600);
        assert!(repo.get_session(&opened.session_id).await.unwrap().is_none());

        let session = repo.get_session(&rotated.session_id).await.unwrap().unwrap();
        assert_eq!(session.payload.backend_token, "token-for-a@x.com");
        assert_eq!(
            repo.get_session_id_by_login("a@x.com").await.unwrap(),
            Some(rotated.session_id.clone())
        );

        let record = repo
            .refresh_tokens()
            .get_session_id_by_refresh(&rotated.refresh_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.meta.user_agent.as_deref(), Some("agent/2.0"));

        // AND: the old handle cannot be replayed
        let replay = lifecycle.rotate(&r1, "1.1.1.1", None).await.unwrap_err();
        assert!(matches!(replay, Error::Rotation(RotationError::InvalidRefresh)));
    }

    #[tokio::test]
    async fn rotate_from_other_ip_burns_refresh_but_keeps_session() {
        let (lifecycle, _store) = lifecycle();
        let opened = lifecycle
            .open_session(payload("a@x.com", "1.1.1.1"), Some(3600))
            .await
            .unwrap();
        let r1 = opened.refresh_id.clone().unwrap();

        let err = lifecycle.rotate(&r1, "2.2.2.2", None).await.unwrap_err();
        assert!(matches!(err, Error::Rotation(RotationError::IpMismatch)));

        // The session survives; the refresh handle does not
        let repo = lifecycle.repository();
        assert!(repo.get_session(&opened.session_id).await.unwrap().is_some());
        let retry = lifecycle.rotate(&r1, "1.1.1.1", None).await.unwrap_err();
        assert!(matches!(retry, Error::Rotation(RotationError::InvalidRefresh)));
    }

    #[tokio::test]
    async fn rotate_unknown_refresh_is_invalid() {
        let (lifecycle, _store) = lifecycle();
        let err = lifecycle.rotate("unknown", "1.1.1.1", None).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_refresh");
    }

    #[tokio::test]
    async fn rotate_after_session_gone_is_session_expired() {
        // GIVEN: a refresh record whose session has disappeared
        let (lifecycle, store) = lifecycle();
        let issued = lifecycle
            .repository()
            .refresh_tokens()
            .create_refresh_token("ghost", Duration::from_secs(60), RefreshMeta::default())
            .await
            .unwrap();

        // WHEN: it is rotated
        let err = lifecycle
            .rotate(&issued.refresh_id, "1.1.1.1", None)
            .await
            .unwrap_err();

        // THEN: the dangling record is cleaned up
        assert_eq!(err.kind(), "session_expired");
        assert!(!store.contains_key(&format!("t:refresh:{}", issued.refresh_id)));
    }

    #[tokio::test]
    async fn logout_removes_everything_and_is_repeatable() {
        let (lifecycle, store) = lifecycle();
        let opened = lifecycle
            .open_session(payload("a@x.com", "1.1.1.1"), Some(3600))
            .await
            .unwrap();

        lifecycle
            .logout(Some(&opened.session_id), opened.refresh_id.as_deref())
            .await;
        lifecycle
            .logout(Some(&opened.session_id), opened.refresh_id.as_deref())
            .await;

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn logout_swallows_store_failures() {
        let (lifecycle, store) = lifecycle();
        store.close().await.unwrap();

        lifecycle.logout(Some("s"), Some("r")).await;
    }

    #[tokio::test]
    async fn open_session_fails_when_store_is_down() {
        let (lifecycle, store) = lifecycle();
        store.close().await.unwrap();

        let err = lifecycle
            .open_session(payload("a@x.com", "1.1.1.1"), None)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::SERVICE_UNAVAILABLE);
    }
}
