//! Expiring key-value store.
//!
//! The [`KvStore`] trait is the only shared state of the broker: every session,
//! login index entry and refresh token lives behind it. Each operation is atomic
//! for a single key; nothing here is transactional across keys.
//!
//! Two backends are provided:
//!
//! - [`InMemoryStore`]: `DashMap` with per-entry deadlines, lazy eviction on read
//!   and an optional background reaper. Used for tests and single-instance runs.
//! - [`RedisStore`]: `SET EX` / `GET` / `DEL` over a multiplexed connection.

mod memory;
mod redis_store;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::{StoreBackend, StoreConfig};

pub use self::memory::{InMemoryStore, spawn_reaper};
pub use self::redis_store::RedisStore;

/// Errors surfaced by a store backend.
///
/// Any of these must reach the caller as "store unavailable", never as an
/// absent record.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend unreachable or the command failed
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The handle was closed
    #[error("Store connection closed")]
    Closed,
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        Self::Unavailable(e.to_string())
    }
}

/// Generic expiring key-value backend.
#[async_trait::async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Store `value` under `key`, replacing any previous value and TTL.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Fetch the value under `key`. Expired keys read as `None`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Delete `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Release the underlying connection. Later calls fail with
    /// [`StoreError::Closed`].
    async fn close(&self) -> Result<(), StoreError>;
}

/// Open the store backend selected in configuration.
///
/// The in-memory backend gets a reaper task that stops when `shutdown` fires.
pub async fn connect(
    config: &StoreConfig,
    shutdown: tokio::sync::broadcast::Receiver<()>,
) -> Result<Arc<dyn KvStore>, StoreError> {
    match config.backend {
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory session store - sessions are lost on restart");
            let store = Arc::new(InMemoryStore::new());
            spawn_reaper(Arc::clone(&store), config.reap_interval, shutdown);
            Ok(store)
        }
        StoreBackend::Redis => {
            let url = config
                .url
                .as_deref()
                .ok_or_else(|| StoreError::Unavailable("store.url is not set".to_string()))?;
            let store = RedisStore::connect(url).await?;
            Ok(Arc::new(store))
        }
    }
}

/// Logical key layout. Four independent namespaces under one prefix, each
/// written with its own TTL.
#[derive(Debug, Clone)]
pub struct Keyspace {
    prefix: String,
}

impl Keyspace {
    /// Create a keyspace rooted at `prefix` (may be empty).
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// `session id -> session record`
    #[must_use]
    pub fn session(&self, session_id: &str) -> String {
        format!("{}session:{session_id}", self.prefix)
    }

    /// `normalized login -> session id`
    #[must_use]
    pub fn login(&self, login: &str) -> String {
        format!("{}login:{login}", self.prefix)
    }

    /// `refresh id -> refresh record`
    #[must_use]
    pub fn refresh(&self, refresh_id: &str) -> String {
        format!("{}refresh:{refresh_id}", self.prefix)
    }

    /// `session id -> refresh id`
    #[must_use]
    pub fn session_refresh(&self, session_id: &str) -> String {
        format!("{}session-refresh:{session_id}", self.prefix)
    }
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new("broker:")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaces_do_not_collide() {
        let keys = Keyspace::new("bff:");
        let id = "0b9f6c1e-6f1a-4f7e-9d7a-2f4e5b6c7d8e";

        let all = [
            keys.session(id),
            keys.login(id),
            keys.refresh(id),
            keys.session_refresh(id),
        ];

        for (i, a) in all.iter().enumerate() {
            assert!(a.starts_with("bff:"));
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[tokio::test]
    async fn connect_memory_backend() {
        let config = StoreConfig::default();
        let (_tx, rx) = tokio::sync::broadcast::channel(1);
        let store = connect(&config, rx).await.unwrap();

        store.set("k", "v", Duration::from_secs(5)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn connect_redis_without_url_fails() {
        let config = StoreConfig {
            backend: StoreBackend::Redis,
            url: None,
            ..StoreConfig::default()
        };

        let (_tx, rx) = tokio::sync::broadcast::channel(1);
        assert!(matches!(
            connect(&config, rx).await,
            Err(StoreError::Unavailable(_))
        ));
    }
}
