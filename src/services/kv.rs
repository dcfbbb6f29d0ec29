use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::ports::KvStore;

struct Entry {
    value: u64,
    expires_at: Instant,
}

/// In-process TTL-backed store, same `Mutex<HashMap<...>>` shape as the
/// teacher's `TypingBuffer` map in `functions::gateway`. Good enough for a
/// single-binary deployment; a real multi-instance rollout swaps this for a
/// Redis-backed `KvStore` without touching callers.
pub struct InMemoryKvStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn incr_with_expiry(&self, key: &str, ttl_secs: u64) -> anyhow::Result<u64> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(key.to_string()).or_insert(Entry {
            value: 0,
            expires_at: now + Duration::from_secs(ttl_secs),
        });
        if entry.expires_at <= now {
            entry.value = 0;
            entry.expires_at = now + Duration::from_secs(ttl_secs);
        }
        entry.value += 1;
        Ok(entry.value)
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap();
        Ok(entries.get(key).is_some_and(|entry| entry.expires_at > now))
    }

    async fn set(&self, key: &str, ttl_secs: u64) -> anyhow::Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key.to_string(),
            Entry {
                value: 1,
                expires_at: now + Duration::from_secs(ttl_secs),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn incr_counts_within_window() {
        let kv = InMemoryKvStore::new();
        assert_eq!(kv.incr_with_expiry("a", 60).await.unwrap(), 1);
        assert_eq!(kv.incr_with_expiry("a", 60).await.unwrap(), 2);
        assert_eq!(kv.incr_with_expiry("a", 60).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn exists_reflects_a_prior_set_until_ttl() {
        let kv = InMemoryKvStore::new();
        assert!(!kv.exists("dup").await.unwrap());
        kv.set("dup", 60).await.unwrap();
        assert!(kv.exists("dup").await.unwrap());
    }
}
