// Shared presence and room-membership state.
//
// Every instance mutates the same logical store, so each operation here is
// a single atomic step at the store level. No operation assumes exclusive
// access and nothing takes a distributed lock; stale presence entries die
// by TTL.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;

use super::error::Result;

/// Presence entries expire after this long without a refreshing CONNECT.
pub const PRESENCE_TTL: Duration = Duration::from_secs(60 * 60);

pub fn presence_key(user_id: &str) -> String {
    format!("ws:user:{user_id}")
}

pub fn room_members_key(room_id: &str) -> String {
    format!("room:{room_id}:users")
}

/// Atomic key-value operations the relay needs from the shared store.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn set_add(&self, key: &str, member: &str) -> Result<()>;
    async fn set_remove(&self, key: &str, member: &str) -> Result<()>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ValueEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl ValueEntry {
    fn expired(&self) -> bool {
        matches!(self.expires_at, Some(at) if Instant::now() >= at)
    }
}

/// Process-local store. Backs tests and single-instance deployments; all
/// instances under test share one of these behind an `Arc`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: DashMap<String, ValueEntry>,
    sets: DashMap<String, DashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.values.insert(
            key.to_string(),
            ValueEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let hit = self.values.get(key).map(|e| (e.expired(), e.value.clone()));
        match hit {
            Some((false, value)) => Ok(Some(value)),
            Some((true, _)) => {
                // Lazy expiry. remove_if re-checks under the shard lock so a
                // concurrent refresh is not clobbered.
                self.values.remove_if(key, |_, entry| entry.expired());
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.values.remove(key);
        self.sets.remove(key);
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        if let Some(set) = self.sets.get(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .sets
            .get(key)
            .map(|set| set.iter().map(|m| m.clone()).collect())
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Redis store
// ---------------------------------------------------------------------------

/// Redis-backed store for multi-instance deployments. The multiplexed
/// connection is cheap to clone and shared across callers.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(key, member).await?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.srem(key, member).await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(key).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_formats() {
        assert_eq!(presence_key("alice"), "ws:user:alice");
        assert_eq!(room_members_key("r1"), "room:r1:users");
    }

    #[tokio::test]
    async fn test_set_get_last_write_wins() {
        let store = MemoryStore::new();
        store
            .set_with_expiry("ws:user:a", "i1", Duration::from_secs(60))
            .await
            .unwrap();
        store
            .set_with_expiry("ws:user:a", "i2", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("ws:user:a").await.unwrap(), Some("i2".into()));
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let store = MemoryStore::new();
        assert_eq!(store.get("ws:user:nobody").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expiry_removes_entry() {
        let store = MemoryStore::new();
        store
            .set_with_expiry("ws:user:a", "i1", Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(store.get("ws:user:a").await.unwrap(), Some("i1".into()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get("ws:user:a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_then_get() {
        let store = MemoryStore::new();
        store
            .set_with_expiry("ws:user:a", "i1", Duration::from_secs(60))
            .await
            .unwrap();
        store.delete("ws:user:a").await.unwrap();
        assert_eq!(store.get("ws:user:a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let store = MemoryStore::new();
        store.delete("ws:user:ghost").await.unwrap();
    }

    #[tokio::test]
    async fn test_set_add_remove_members() {
        let store = MemoryStore::new();
        store.set_add("room:r:users", "a").await.unwrap();
        store.set_add("room:r:users", "b").await.unwrap();
        store.set_add("room:r:users", "a").await.unwrap();

        let mut members = store.set_members("room:r:users").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["a", "b"]);

        store.set_remove("room:r:users", "a").await.unwrap();
        assert_eq!(store.set_members("room:r:users").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_set_ops_on_missing_key() {
        let store = MemoryStore::new();
        store.set_remove("room:x:users", "a").await.unwrap();
        assert!(store.set_members("room:x:users").await.unwrap().is_empty());
    }
}
