//! Redis-backed store.

use std::time::Duration;

use parking_lot::RwLock;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{debug, info};

use super::{KvStore, StoreError};

/// Store backed by a Redis server.
///
/// Holds a multiplexed, auto-reconnecting connection. The connection is
/// cloned out of the lock for each command so no guard is held across an
/// await point.
pub struct RedisStore {
    conn: RwLock<Option<ConnectionManager>>,
}

impl RedisStore {
    /// Connect to the Redis server at `url` (`redis://host:port/db`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        info!("Connected to Redis session store");
        Ok(Self {
            conn: RwLock::new(Some(manager)),
        })
    }

    fn connection(&self) -> Result<ConnectionManager, StoreError> {
        self.conn.read().clone().ok_or(StoreError::Closed)
    }
}

/// Redis rejects `SET EX 0`; round sub-second TTLs up to one second.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait::async_trait]
impl KvStore for RedisStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        conn.set_ex::<_, _, ()>(key, value, ttl_secs(ttl)).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection()?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        if self.conn.write().take().is_some() {
            debug!("Redis session store closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_is_rounded_up_to_one_second() {
        assert_eq!(ttl_secs(Duration::from_millis(200)), 1);
        assert_eq!(ttl_secs(Duration::ZERO), 1);
        assert_eq!(ttl_secs(Duration::from_secs(3600)), 3600);
    }

    #[tokio::test]
    async fn connect_rejects_malformed_url() {
        let result = RedisStore::connect("not a redis url").await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
