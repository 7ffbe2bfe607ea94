//! The engine context: one rate-limited channel, one cache, one config.
//!
//! Every public retrieval entry point lives here. An [`Engine`] is built once
//! and shared; [`retrieve`] and friends use a lazily-created process-wide
//! default engine for zero-configuration callers.
//!
//! # Example
//!
//! ```no_run
//! use chemfetch_core::{Engine, EngineConfig, RawIdentifier};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::new(EngineConfig::default()).await?;
//! let inputs = [RawIdentifier::from("aspirin"), RawIdentifier::from(1983)];
//! let table = engine.retrieve(&inputs, &["molecular_weight", "cas"]).await?;
//! println!("{}", table.to_csv());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

use crate::cache::{CacheError, CacheStats, MemoryCache, ResponseCache, SqliteCache};
use crate::client::PubChemClient;
use crate::clock::{Clock, TokioClock};
use crate::config::{CacheBackend, ConfigError, EngineConfig};
use crate::dispatch::Dispatcher;
use crate::identifier::RawIdentifier;
use crate::properties::{PropertySelection, UnsupportedProperties, expand_groups};
use crate::record::{CompoundRecord, PropertyValue};
use crate::resolve::Resolver;
use crate::table::{ResultTable, Row, Status};
use crate::transport::{Channel, ClientBuildError, HttpTransport, RateLimiter, Transport};

static DEFAULT_ENGINE: OnceCell<Engine> = OnceCell::const_new();

/// Invocation-level failure. Per-identifier problems never surface here;
/// they are rows of the [`ResultTable`].
#[derive(Debug, Error)]
pub enum EngineError {
    /// One or more requested properties are not in the catalog.
    #[error(transparent)]
    UnsupportedProperties(#[from] UnsupportedProperties),

    /// The configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The cache backend could not be opened.
    #[error("cache backend unavailable: {0}")]
    Cache(#[from] CacheError),

    /// The HTTP client could not be built.
    #[error(transparent)]
    HttpClient(#[from] ClientBuildError),

    /// The caller's deadline passed before the batch completed.
    #[error("retrieval timed out after {timeout:?}")]
    TimedOut {
        /// The deadline that was exceeded.
        timeout: Duration,
    },

    /// A single-compound call did not resolve.
    #[error("{input} was not resolved ({status}){suffix}", suffix = detail_suffix(.detail))]
    NotResolved {
        /// The identifier as supplied.
        input: RawIdentifier,
        /// The row status.
        status: Status,
        /// Reason, candidates or failure.
        detail: Option<String>,
    },

    /// [`install_default_engine`] was called after the default engine existed.
    #[error("default engine is already initialized")]
    DefaultAlreadyInstalled,
}

/// Counters across every call made through one engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineStats {
    /// Wire attempts, retries included.
    pub attempts: usize,
    /// Attempts that were retries.
    pub retried: usize,
    /// Requests that ended in a transport error.
    pub failed: usize,
    /// Requests admitted by the rate limiter.
    pub admitted: u64,
    /// Total time spent waiting on the rate limiter.
    pub rate_limit_delay: Duration,
    /// Cache counters, when caching is enabled.
    pub cache: Option<CacheStats>,
}

/// Explicit context for every retrieval call.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    client: Arc<PubChemClient>,
    resolver: Resolver,
}

impl Engine {
    /// Builds an engine talking HTTP to the configured endpoints.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`], [`EngineError::Cache`] or
    /// [`EngineError::HttpClient`] when construction fails.
    pub async fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let transport = HttpTransport::new(config.connect_timeout, config.request_timeout)?;
        let cache = open_cache(&config.cache).await?;
        Self::from_parts(Arc::new(transport), cache, Arc::new(TokioClock), config)
    }

    /// Builds an engine from explicit parts. `config.cache` is ignored in
    /// favour of `cache`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] when `config` is invalid.
    pub fn from_parts(
        transport: Arc<dyn Transport>,
        cache: Option<Arc<dyn ResponseCache>>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let limiter = Arc::new(RateLimiter::new(
            config.max_requests,
            config.window,
            clock.clone(),
        ));
        let channel = Channel::new(
            transport,
            limiter,
            config.retry_policy(),
            clock,
            config.endpoints(),
        );
        let client = Arc::new(PubChemClient::new(channel, cache, config.expiry));
        let dispatcher = Dispatcher::new(client.clone(), config.dispatch());
        let resolver = Resolver::new(client.clone(), dispatcher, config.max_concurrent_lookups);
        debug!(
            max_requests = config.max_requests,
            max_attempts = config.max_attempts,
            batch_size = config.batch_size,
            cached = client.cache().is_some(),
            "engine ready"
        );
        Ok(Self {
            config,
            client,
            resolver,
        })
    }

    /// The configuration this engine was built with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The cache-aware client.
    #[must_use]
    pub fn client(&self) -> &Arc<PubChemClient> {
        &self.client
    }

    /// Resolves `identifiers` and fetches `properties` for each.
    ///
    /// Property names may be canonical names, aliases, or the groups `core`,
    /// `3d` and `all`. They are checked before any network access.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnsupportedProperties`] listing every unknown
    /// name. Per-identifier failures are rows of the table, not errors.
    #[instrument(skip_all, fields(identifiers = identifiers.len()))]
    pub async fn retrieve<S: AsRef<str>>(
        &self,
        identifiers: &[RawIdentifier],
        properties: &[S],
    ) -> Result<ResultTable, EngineError> {
        let selection = parse_selection(properties)?;
        Ok(self.retrieve_selection(identifiers, &selection).await)
    }

    /// As [`Engine::retrieve`], abandoning the batch after `timeout`.
    ///
    /// Cache writes are atomic per entry, so an abandoned batch leaves the
    /// cache and the rate limiter usable.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TimedOut`] when the deadline passes, or any
    /// error [`Engine::retrieve`] returns.
    pub async fn retrieve_with_timeout<S: AsRef<str>>(
        &self,
        identifiers: &[RawIdentifier],
        properties: &[S],
        timeout: Duration,
    ) -> Result<ResultTable, EngineError> {
        let selection = parse_selection(properties)?;
        tokio::time::timeout(timeout, self.retrieve_selection(identifiers, &selection))
            .await
            .map_err(|_| EngineError::TimedOut { timeout })
    }

    /// Resolves against an already-parsed selection.
    pub async fn retrieve_selection(
        &self,
        identifiers: &[RawIdentifier],
        selection: &PropertySelection,
    ) -> ResultTable {
        let resolutions = self.resolver.resolve(identifiers, selection).await;
        let table = ResultTable::assemble(resolutions, selection);
        info!(
            rows = table.len(),
            resolved = table.with_status(Status::Resolved).count(),
            not_found = table.with_status(Status::NotFound).count(),
            failed = table.with_status(Status::TransportError).count(),
            "retrieval complete"
        );
        table
    }

    /// Every catalog property of one compound.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotResolved`] unless the identifier resolves to
    /// exactly one compound.
    pub async fn compound(
        &self,
        identifier: impl Into<RawIdentifier>,
    ) -> Result<CompoundRecord, EngineError> {
        let input = identifier.into();
        let table = self
            .retrieve_selection(std::slice::from_ref(&input), &PropertySelection::all())
            .await;
        table
            .rows()
            .first()
            .ok_or(EngineError::NotResolved {
                input,
                status: Status::NotFound,
                detail: None,
            })
            .and_then(resolved_record)
    }

    /// Every catalog property of each compound, in input order; `None` where
    /// an identifier did not resolve.
    pub async fn compounds(&self, identifiers: &[RawIdentifier]) -> Vec<Option<CompoundRecord>> {
        let table = self
            .retrieve_selection(identifiers, &PropertySelection::all())
            .await;
        table
            .rows()
            .iter()
            .map(|row| row.record().map(|record| CompoundRecord::clone(record)))
            .collect()
    }

    /// One property of one compound. `Ok(None)` means the compound resolved
    /// but has no value for the property.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnsupportedProperties`] for an unknown property
    /// and [`EngineError::NotResolved`] when the identifier does not resolve.
    pub async fn scalar(
        &self,
        identifier: impl Into<RawIdentifier>,
        property: &str,
    ) -> Result<Option<PropertyValue>, EngineError> {
        let selection = PropertySelection::parse(&[property])?;
        let table = self
            .retrieve_selection(&[identifier.into()], &selection)
            .await;
        let Some(row) = table.rows().first() else {
            return Ok(None);
        };
        let record = resolved_record(row)?;
        Ok(selection
            .names()
            .first()
            .and_then(|name| record.get(name).cloned()))
    }

    /// Counters accumulated by this engine.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let channel = self.client.channel();
        let limiter = channel.limiter();
        EngineStats {
            attempts: channel.stats().attempts(),
            retried: channel.stats().retried(),
            failed: channel.stats().failed(),
            admitted: limiter.admitted(),
            rate_limit_delay: limiter.cumulative_delay(),
            cache: self.client.cache().map(|cache| cache.stats()),
        }
    }

    /// Drops expired cache entries. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Cache`] when the backend fails.
    pub async fn purge_expired(&self) -> Result<u64, EngineError> {
        match self.client.cache() {
            Some(cache) => Ok(cache.purge_expired().await?),
            None => Ok(0),
        }
    }

    /// Empties the cache.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Cache`] when the backend fails.
    pub async fn clear_cache(&self) -> Result<(), EngineError> {
        if let Some(cache) = self.client.cache() {
            cache.clear().await?;
        }
        Ok(())
    }
}

#[allow(clippy::ref_option)]
fn detail_suffix(detail: &Option<String>) -> String {
    detail
        .as_deref()
        .map(|detail| format!(": {detail}"))
        .unwrap_or_default()
}

fn parse_selection<S: AsRef<str>>(properties: &[S]) -> Result<PropertySelection, EngineError> {
    Ok(PropertySelection::parse(&expand_groups(properties))?)
}

fn resolved_record(row: &Row) -> Result<CompoundRecord, EngineError> {
    row.record()
        .map(|record| CompoundRecord::clone(record))
        .ok_or_else(|| EngineError::NotResolved {
            input: row.input().clone(),
            status: row.status(),
            detail: row.detail(),
        })
}

/// Opens the configured cache backend.
///
/// # Errors
///
/// Returns [`CacheError`] when the SQLite file cannot be opened.
pub async fn open_cache(
    backend: &CacheBackend,
) -> Result<Option<Arc<dyn ResponseCache>>, CacheError> {
    Ok(match backend {
        CacheBackend::Disabled => None,
        CacheBackend::Memory => Some(Arc::new(MemoryCache::new())),
        CacheBackend::Sqlite(path) => Some(Arc::new(SqliteCache::open(path).await?)),
    })
}

/// Installs `config` as the process-wide default engine.
///
/// # Errors
///
/// Returns [`EngineError::DefaultAlreadyInstalled`] if a default engine
/// already exists, or any construction error.
pub async fn install_default_engine(config: EngineConfig) -> Result<(), EngineError> {
    if DEFAULT_ENGINE.initialized() {
        return Err(EngineError::DefaultAlreadyInstalled);
    }
    let engine = Engine::new(config).await?;
    DEFAULT_ENGINE
        .set(engine)
        .map_err(|_| EngineError::DefaultAlreadyInstalled)
}

/// The process-wide default engine, created from
/// [`EngineConfig::default`] on first use.
///
/// # Errors
///
/// Returns any construction error; a later call retries construction.
pub async fn default_engine() -> Result<&'static Engine, EngineError> {
    DEFAULT_ENGINE
        .get_or_try_init(|| Engine::new(EngineConfig::default()))
        .await
}

/// [`Engine::retrieve`] on the default engine.
///
/// # Errors
///
/// As [`Engine::retrieve`], plus default-engine construction errors.
pub async fn retrieve<S: AsRef<str>>(
    identifiers: &[RawIdentifier],
    properties: &[S],
) -> Result<ResultTable, EngineError> {
    default_engine().await?.retrieve(identifiers, properties).await
}
