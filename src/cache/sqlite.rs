//! SQLite-backed cache that survives process restarts.

use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument};

use super::{
    CacheCounters, CacheError, CacheStats, CachedReply, Expiry, Fingerprint, ResponseCache, now_ms,
};
use crate::db::Database;

/// Persistent cache stored in the `response_cache` table.
#[derive(Debug)]
pub struct SqliteCache {
    db: Database,
    counters: CacheCounters,
}

impl SqliteCache {
    /// Opens or creates the cache file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Database`] if the file cannot be opened or
    /// migrated.
    #[instrument(skip(path), fields(path = %path.display()))]
    pub async fn open(path: &Path) -> Result<Self, CacheError> {
        let db = Database::new(path).await?;
        Ok(Self::with_database(db))
    }

    /// Creates a cache in a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Database`] if the schema cannot be applied.
    pub async fn in_memory() -> Result<Self, CacheError> {
        let db = Database::new_in_memory().await?;
        Ok(Self::with_database(db))
    }

    /// Wraps an already-migrated database.
    #[must_use]
    pub fn with_database(db: Database) -> Self {
        Self {
            db,
            counters: CacheCounters::default(),
        }
    }

    /// Number of stored rows, expired ones included.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Query`] if the count fails.
    pub async fn len(&self) -> Result<u64, CacheError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM response_cache")
            .fetch_one(self.db.pool())
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

#[async_trait]
impl ResponseCache for SqliteCache {
    #[instrument(skip(self), fields(fingerprint = %fingerprint))]
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CachedReply>, CacheError> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            "SELECT payload FROM response_cache \
             WHERE fingerprint = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(fingerprint.as_str())
        .bind(now_ms())
        .fetch_optional(self.db.pool())
        .await?;

        let reply = match row {
            None => None,
            Some((None,)) => Some(CachedReply::Absent),
            Some((Some(payload),)) => Some(CachedReply::Found(serde_json::from_str::<Value>(
                &payload,
            )?)),
        };
        self.counters.record_lookup(reply.is_some());
        Ok(reply)
    }

    #[instrument(skip(self, reply), fields(fingerprint = %fingerprint))]
    async fn put(
        &self,
        fingerprint: &Fingerprint,
        reply: &CachedReply,
        expiry: Expiry,
    ) -> Result<(), CacheError> {
        if expiry.stores_nothing() {
            return Ok(());
        }
        let payload = match reply {
            CachedReply::Found(value) => Some(serde_json::to_string(value)?),
            CachedReply::Absent => None,
        };
        let now = now_ms();

        sqlx::query(
            "INSERT INTO response_cache (fingerprint, payload, created_at, expires_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(fingerprint) DO UPDATE SET \
             payload = excluded.payload, \
             created_at = excluded.created_at, \
             expires_at = excluded.expires_at",
        )
        .bind(fingerprint.as_str())
        .bind(payload)
        .bind(now)
        .bind(expiry.deadline_ms(now))
        .execute(self.db.pool())
        .await?;

        self.counters.record_write();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn purge_expired(&self) -> Result<u64, CacheError> {
        let result = sqlx::query(
            "DELETE FROM response_cache WHERE expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(now_ms())
        .execute(self.db.pool())
        .await?;
        let removed = result.rows_affected();
        debug!(removed, "purged expired cache entries");
        Ok(removed)
    }

    #[instrument(skip(self))]
    async fn clear(&self) -> Result<(), CacheError> {
        sqlx::query("DELETE FROM response_cache")
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_round_trip_payload_and_absence() {
        let cache = SqliteCache::in_memory().await.unwrap();
        let found = Fingerprint::from_canonical("found");
        let gone = Fingerprint::from_canonical("gone");
        let payload = CachedReply::Found(serde_json::json!({"IdentifierList": {"CID": [2244]}}));

        cache.put(&found, &payload, Expiry::Never).await.unwrap();
        cache.put(&gone, &CachedReply::Absent, Expiry::Never).await.unwrap();

        assert_eq!(cache.get(&found).await.unwrap(), Some(payload));
        assert_eq!(cache.get(&gone).await.unwrap(), Some(CachedReply::Absent));
        assert_eq!(
            cache
                .get(&Fingerprint::from_canonical("other"))
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_put_replaces_existing() {
        let cache = SqliteCache::in_memory().await.unwrap();
        let fingerprint = Fingerprint::from_canonical("k");
        cache
            .put(&fingerprint, &CachedReply::Absent, Expiry::Never)
            .await
            .unwrap();
        let replacement = CachedReply::Found(serde_json::json!([1]));
        cache
            .put(&fingerprint, &replacement, Expiry::Never)
            .await
            .unwrap();

        assert_eq!(cache.get(&fingerprint).await.unwrap(), Some(replacement));
        assert_eq!(cache.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expired_rows_miss_and_purge() {
        let cache = SqliteCache::in_memory().await.unwrap();
        let old = Fingerprint::from_canonical("old");
        let fresh = Fingerprint::from_canonical("fresh");
        cache
            .put(&old, &CachedReply::Absent, Expiry::After(Duration::ZERO))
            .await
            .unwrap();
        cache
            .put(&fresh, &CachedReply::Absent, Expiry::After(Duration::from_secs(60)))
            .await
            .unwrap();

        assert_eq!(cache.get(&old).await.unwrap(), None);
        assert_eq!(cache.purge_expired().await.unwrap(), 1);
        assert_eq!(cache.len().await.unwrap(), 1);

        cache.clear().await.unwrap();
        assert_eq!(cache.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_always_expiry_skips_write() {
        let cache = SqliteCache::in_memory().await.unwrap();
        cache
            .put(
                &Fingerprint::from_canonical("x"),
                &CachedReply::Absent,
                Expiry::Always,
            )
            .await
            .unwrap();
        assert_eq!(cache.len().await.unwrap(), 0);
        assert_eq!(cache.stats().writes, 0);
    }
}
