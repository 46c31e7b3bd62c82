//! In-memory store backed by a `DashMap`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use super::{KvStore, StoreError};

/// A stored value with its absolute deadline.
///
/// `None` means the TTL reaches past what `Instant` can represent.
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

/// In-memory expiring store.
///
/// Expired entries are evicted lazily on `get` and periodically by
/// [`spawn_reaper`].
pub struct InMemoryStore {
    entries: DashMap<String, Entry>,
    closed: AtomicBool,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of keys currently held, including expired ones not yet reaped.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `key` is physically present, ignoring expiry.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove every expired entry. Returns the number removed.
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl KvStore for InMemoryStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now().checked_add(ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.ensure_open()?;
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };

        if entry.is_expired(Instant::now()) {
            drop(entry);
            self.entries.remove(key);
            debug!(key = %key, "Lazy-evicted expired key");
            return Ok(None);
        }

        Ok(Some(entry.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.entries.remove(key);
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        self.entries.clear();
        Ok(())
    }
}

/// Spawn a background task that reaps expired keys every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_reaper(
    store: Arc<InMemoryStore>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = store.reap_expired();
                    if reaped > 0 {
                        debug!(count = reaped, "Reaped expired keys");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Store reaper shutting down");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_returns_value() {
        // GIVEN: a store with one key
        let store = InMemoryStore::new();
        store.set("a", "1", Duration::from_secs(60)).await.unwrap();

        // WHEN: we read it back
        let value = store.get("a").await.unwrap();

        // THEN: the value is returned
        assert_eq!(value.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn set_overwrites_value_and_ttl() {
        let store = InMemoryStore::new();
        store.set("a", "1", Duration::from_millis(10)).await.unwrap();
        store.set("a", "2", Duration::from_secs(60)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn get_lazy_evicts_expired_key() {
        // GIVEN: a key with a very short TTL
        let store = InMemoryStore::new();
        store.set("a", "1", Duration::from_millis(20)).await.unwrap();

        // WHEN: the TTL has passed
        tokio::time::sleep(Duration::from_millis(50)).await;
        let value = store.get("a").await.unwrap();

        // THEN: it reads as absent and is physically gone
        assert!(value.is_none());
        assert!(!store.contains_key("a"));
    }

    #[tokio::test]
    async fn unrepresentable_ttl_does_not_overflow() {
        let store = InMemoryStore::new();
        store.set("a", "1", Duration::MAX).await.unwrap();

        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.reap_expired(), 0);
    }

    #[tokio::test]
    async fn delete_missing_key_is_ok() {
        let store = InMemoryStore::new();
        store.delete("nope").await.unwrap();
        store.delete("nope").await.unwrap();
    }

    #[tokio::test]
    async fn reap_removes_only_expired() {
        // GIVEN: one live key and two expiring keys
        let store = InMemoryStore::new();
        store.set("live", "1", Duration::from_secs(60)).await.unwrap();
        store.set("old1", "1", Duration::from_millis(5)).await.unwrap();
        store.set("old2", "1", Duration::from_millis(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // WHEN: we reap
        let reaped = store.reap_expired();

        // THEN: two are removed and the live key remains
        assert_eq!(reaped, 2);
        assert_eq!(store.len(), 1);
        assert!(store.contains_key("live"));
    }

    #[tokio::test]
    async fn closed_store_rejects_operations() {
        let store = InMemoryStore::new();
        store.set("a", "1", Duration::from_secs(60)).await.unwrap();

        store.close().await.unwrap();

        assert!(matches!(store.get("a").await, Err(StoreError::Closed)));
        assert!(matches!(
            store.set("a", "1", Duration::from_secs(1)).await,
            Err(StoreError::Closed)
        ));
        assert!(matches!(store.delete("a").await, Err(StoreError::Closed)));
    }

    #[tokio::test]
    async fn reaper_stops_on_shutdown() {
        let store = Arc::new(InMemoryStore::new());
        store.set("old", "1", Duration::from_millis(5)).await.unwrap();

        let (tx, rx) = tokio::sync::broadcast::channel(1);
        spawn_reaper(Arc::clone(&store), Duration::from_millis(10), rx);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.is_empty());

        tx.send(()).unwrap();
    }
}
