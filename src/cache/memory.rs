//! In-process cache backend.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::{
    CacheCounters, CacheError, CacheStats, CachedReply, Expiry, Fingerprint, ResponseCache, now_ms,
};

#[derive(Debug, Clone)]
struct Entry {
    reply: CachedReply,
    expires_at_ms: Option<i64>,
}

impl Entry {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_some_and(|deadline| deadline <= now_ms)
    }
}

/// Cache held in a concurrent map; lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
    counters: CacheCounters,
}

impl MemoryCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ResponseCache for MemoryCache {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CachedReply>, CacheError> {
        let now = now_ms();
        let found = self
            .entries
            .get(fingerprint.as_str())
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.reply.clone());
        self.counters.record_lookup(found.is_some());
        Ok(found)
    }

    async fn put(
        &self,
        fingerprint: &Fingerprint,
        reply: &CachedReply,
        expiry: Expiry,
    ) -> Result<(), CacheError> {
        if expiry.stores_nothing() {
            return Ok(());
        }
        self.entries.insert(
            fingerprint.as_str().to_string(),
            Entry {
                reply: reply.clone(),
                expires_at_ms: expiry.deadline_ms(now_ms()),
            },
        );
        self.counters.record_write();
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, CacheError> {
        let now = now_ms();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len()) as u64;
        debug!(removed, "purged expired cache entries");
        Ok(removed)
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.entries.clear();
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }
}
