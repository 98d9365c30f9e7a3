use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::AsyncCommands;

/// Byte-oriented cache used by the gateway to store serialized
/// responses keyed on a request fingerprint. A miss is not an error.
#[async_trait]
pub trait BytesCache: Send + Sync {
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set_bytes(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;
}

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|exp| now > exp)
    }
}

/// In-process TTL cache. Entries carry an absolute expiry; reads past
/// expiry delete lazily.
pub struct TtlCache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl TtlCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for TtlCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BytesCache for TtlCache {
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        {
            let entries = self.entries.read().expect("cache lock poisoned");
            match entries.get(key) {
                Some(e) if !e.is_expired(now) => return Ok(Some(e.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // Expired: drop it under the write lock.
        let mut entries = self.entries.write().expect("cache lock poisoned");
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set_bytes(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let expires_at = (ttl > Duration::ZERO).then(|| Instant::now() + ttl);
        let mut entries = self.entries.write().expect("cache lock poisoned");
        entries.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }
}

/// Remote cache backed by Redis, same contract as [`TtlCache`].
pub struct RedisCache {
    conn: redis::aio::ConnectionManager,
}

impl RedisCache {
    pub async fn connect(addr: &str) -> Result<Self> {
        let client = redis::Client::open(addr).context("redis open")?;
        let conn = client
            .get_connection_manager()
            .await
            .context("redis connect")?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl BytesCache for RedisCache {
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await.context("redis get")?;
        Ok(value)
    }

    async fn set_bytes(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let secs = ttl.as_secs().max(1);
        let _: () = conn.set_ex(key, value, secs).await.context("redis set")?;
        Ok(())
    }
}

/// Two-level cache: L1 in-memory, L2 remote. Reads check L1 first and
/// backfill it on a remote hit; writes go to both levels.
pub struct LayeredCache<L2> {
    l1: TtlCache,
    l2: L2,
    /// TTL applied when backfilling L1 from a remote hit (the remote
    /// entry's remaining TTL is not observable).
    l1_backfill_ttl: Duration,
}

impl<L2: BytesCache> LayeredCache<L2> {
    pub fn new(l2: L2, l1_backfill_ttl: Duration) -> Self {
        Self {
            l1: TtlCache::new(),
            l2,
            l1_backfill_ttl,
        }
    }
}

#[async_trait]
impl<L2: BytesCache> BytesCache for LayeredCache<L2> {
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(v) = self.l1.get_bytes(key).await? {
            return Ok(Some(v));
        }
        match self.l2.get_bytes(key).await? {
            Some(v) => {
                self.l1
                    .set_bytes(key, v.clone(), self.l1_backfill_ttl)
                    .await?;
                Ok(Some(v))
            }
            None => Ok(None),
        }
    }

    async fn set_bytes(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.l1.set_bytes(key, value.clone(), ttl).await?;
        self.l2.set_bytes(key, value, ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_after_set_within_ttl_returns_value() {
        let c = TtlCache::new();
        c.set_bytes("k", b"v".to_vec(), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(c.get_bytes("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn expired_entry_misses_and_is_deleted() {
        let c = TtlCache::new();
        c.set_bytes("k", b"v".to_vec(), Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(c.get_bytes("k").await.unwrap(), None);
        assert!(c.entries.read().unwrap().get("k").is_none());
    }

    #[tokio::test]
    async fn zero_ttl_never_expires() {
        let c = TtlCache::new();
        c.set_bytes("k", b"v".to_vec(), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(c.get_bytes("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn missing_key_is_a_miss_not_an_error() {
        let c = TtlCache::new();
        assert_eq!(c.get_bytes("absent").await.unwrap(), None);
    }

    #[tokio::test]
    async fn layered_reads_prefer_l1_and_backfill_from_l2() {
        let layered = LayeredCache::new(TtlCache::new(), Duration::from_secs(30));
        // Seed only L2.
        layered
            .l2
            .set_bytes("k", b"remote".to_vec(), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(
            layered.get_bytes("k").await.unwrap(),
            Some(b"remote".to_vec())
        );
        // Backfilled into L1.
        assert_eq!(
            layered.l1.get_bytes("k").await.unwrap(),
            Some(b"remote".to_vec())
        );
    }

    #[tokio::test]
    async fn layered_writes_hit_both_levels() {
        let layered = LayeredCache::new(TtlCache::new(), Duration::from_secs(30));
        layered
            .set_bytes("k", b"v".to_vec(), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(layered.l1.get_bytes("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(layered.l2.get_bytes("k").await.unwrap(), Some(b"v".to_vec()));
    }
}
