//! Response cache keyed by request fingerprint.
//!
//! A cache entry holds either the raw JSON payload of a definitive reply or a
//! "confirmed absent" marker for a remote 404. Transport errors are never
//! stored. Two backends implement [`ResponseCache`]: [`MemoryCache`] and the
//! SQLite-backed [`SqliteCache`].

mod memory;
mod sqlite;

use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::db::DbError;
use crate::transport::{RemoteReply, Request};

pub use memory::MemoryCache;
pub use sqlite::SqliteCache;

/// Default lifetime of a cache entry.
pub const DEFAULT_EXPIRY: Expiry = Expiry::After(Duration::from_secs(7 * 24 * 60 * 60));

/// Default SQLite cache file name.
pub const DEFAULT_CACHE_FILE: &str = "chemfetch_cache.db";

/// Errors raised by cache backends.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Opening or migrating the backing store failed.
    #[error(transparent)]
    Database(#[from] DbError),

    /// A query against the backing store failed.
    #[error("cache query failed: {0}")]
    Query(#[from] sqlx::Error),

    /// A stored payload could not be encoded or decoded.
    #[error("cache payload is not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Stable hash of a request's canonical form (hex SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint of `request`, or `None` for uncacheable requests.
    #[must_use]
    pub fn of(request: &Request) -> Option<Self> {
        request.canonical().map(|text| Self::from_canonical(&text))
    }

    /// Fingerprint of arbitrary canonical text.
    #[must_use]
    pub fn from_canonical(text: &str) -> Self {
        let digest = Sha256::digest(text.as_bytes());
        Self(format!("{digest:x}"))
    }

    /// The hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored definitive reply.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedReply {
    /// JSON payload.
    Found(Value),
    /// Remote confirmed the resource does not exist.
    Absent,
}

impl From<RemoteReply> for CachedReply {
    fn from(reply: RemoteReply) -> Self {
        match reply {
            RemoteReply::Payload(value) => Self::Found(value),
            RemoteReply::Absent => Self::Absent,
        }
    }
}

impl From<CachedReply> for RemoteReply {
    fn from(reply: CachedReply) -> Self {
        match reply {
            CachedReply::Found(value) => Self::Payload(value),
            CachedReply::Absent => Self::Absent,
        }
    }
}

/// How long an entry stays valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Never expires.
    Never,
    /// Never stored; every request goes to the network.
    Always,
    /// Expires this long after being written.
    After(Duration),
}

impl Expiry {
    /// True when entries with this expiry are not stored at all.
    #[must_use]
    pub fn stores_nothing(self) -> bool {
        self == Self::Always
    }

    /// Deadline in Unix milliseconds for an entry written at `now_ms`;
    /// `None` means no deadline.
    #[must_use]
    pub fn deadline_ms(self, now_ms: i64) -> Option<i64> {
        match self {
            Self::Never => None,
            Self::Always => Some(now_ms),
            Self::After(lifetime) => {
                let lifetime = i64::try_from(lifetime.as_millis()).unwrap_or(i64::MAX);
                Some(now_ms.saturating_add(lifetime))
            }
        }
    }
}

/// Hit/miss counters for a cache backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that found nothing usable.
    pub misses: u64,
    /// Entries written.
    pub writes: u64,
}

impl CacheStats {
    /// Fraction of lookups served from the cache.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Atomic counters shared by the backends.
#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
}

impl CacheCounters {
    pub(crate) fn record_lookup(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}

/// Current wall-clock time in Unix milliseconds.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

/// Storage for definitive remote replies.
///
/// Implementations must be safe under concurrent use; each write is atomic
/// per fingerprint.
#[async_trait]
pub trait ResponseCache: Send + Sync + Debug {
    /// Returns the live entry for `fingerprint`, if any. Expired entries are
    /// misses.
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CachedReply>, CacheError>;

    /// Stores `reply` under `fingerprint`, replacing any existing entry.
    /// [`Expiry::Always`] stores nothing.
    async fn put(
        &self,
        fingerprint: &Fingerprint,
        reply: &CachedReply,
        expiry: Expiry,
    ) -> Result<(), CacheError>;

    /// Removes every expired entry, returning how many were removed.
    async fn purge_expired(&self) -> Result<u64, CacheError>;

    /// Removes every entry.
    async fn clear(&self) -> Result<(), CacheError>;

    /// Lookup and write counters.
    fn stats(&self) -> CacheStats;
}
