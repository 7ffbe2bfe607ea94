//! Engine configuration and validation.

use std::env;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::cache::{DEFAULT_CACHE_FILE, DEFAULT_EXPIRY, Expiry};
use crate::dispatch::{
    DEFAULT_BATCH_SIZE, DEFAULT_MAX_CONCURRENT_CHUNKS, DEFAULT_MAX_PAGES, DispatchConfig,
};
use crate::resolve::DEFAULT_MAX_CONCURRENT_LOOKUPS;
use crate::transport::{
    DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_BASE_DELAY, DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_MAX_DELAY, DEFAULT_MAX_JITTER, DEFAULT_MAX_REQUESTS, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_REST_BASE, DEFAULT_VIEW_BASE, DEFAULT_WINDOW, Endpoints, RetryPolicy,
};

/// Largest key count PubChem accepts in one property request.
pub const MAX_BATCH_SIZE: usize = 100;

/// Upper bound on attempts per request.
pub const MAX_ATTEMPTS_LIMIT: u32 = 20;

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A numeric setting is outside its allowed range.
    #[error("invalid value for `{field}`: {value}. Expected {expected}")]
    OutOfRange {
        /// Setting name.
        field: &'static str,
        /// Offending value.
        value: String,
        /// Allowed range, human-readable.
        expected: &'static str,
    },

    /// A base URL is not an absolute http(s) URL.
    #[error("invalid base URL for `{field}`: {value}")]
    InvalidUrl {
        /// Setting name.
        field: &'static str,
        /// Offending value.
        value: String,
    },
}

impl ConfigError {
    fn out_of_range(field: &'static str, value: impl ToString, expected: &'static str) -> Self {
        Self::OutOfRange {
            field,
            value: value.to_string(),
            expected,
        }
    }
}

/// Where responses are cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheBackend {
    /// No caching.
    Disabled,
    /// Process-local map.
    Memory,
    /// SQLite file at the given path.
    Sqlite(PathBuf),
}

/// Everything an [`Engine`](crate::Engine) needs to know.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// PUG-REST base URL.
    pub rest_base: String,
    /// PUG-View base URL.
    pub view_base: String,
    /// Requests admitted per window; zero disables limiting.
    pub max_requests: u32,
    /// Trailing rate-limit window.
    pub window: Duration,
    /// Attempts per request, including the first.
    pub max_attempts: u32,
    /// First backoff delay.
    pub base_delay: Duration,
    /// Backoff cap, before jitter.
    pub max_delay: Duration,
    /// Backoff growth per attempt.
    pub backoff_multiplier: f32,
    /// Upper bound of uniform jitter added to each backoff.
    pub max_jitter: Duration,
    /// TCP/TLS connect timeout.
    pub connect_timeout: Duration,
    /// Whole-request timeout.
    pub request_timeout: Duration,
    /// Keys per batch property request.
    pub batch_size: usize,
    /// Batch chunks in flight at once.
    pub max_concurrent_chunks: usize,
    /// Continuation pages followed per chunk.
    pub max_pages: u32,
    /// Name/structure lookups in flight at once.
    pub max_concurrent_lookups: usize,
    /// Cache backend.
    pub cache: CacheBackend,
    /// Cache entry lifetime.
    pub expiry: Expiry,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rest_base: DEFAULT_REST_BASE.to_string(),
            view_base: DEFAULT_VIEW_BASE.to_string(),
            max_requests: DEFAULT_MAX_REQUESTS,
            window: DEFAULT_WINDOW,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_jitter: DEFAULT_MAX_JITTER,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            batch_size: DEFAULT_BATCH_SIZE,
            max_concurrent_chunks: DEFAULT_MAX_CONCURRENT_CHUNKS,
            max_pages: DEFAULT_MAX_PAGES,
            max_concurrent_lookups: DEFAULT_MAX_CONCURRENT_LOOKUPS,
            cache: default_cache_path().map_or(CacheBackend::Memory, CacheBackend::Sqlite),
            expiry: DEFAULT_EXPIRY,
        }
    }
}

impl EngineConfig {
    /// Checks every setting.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_base_url("rest_base", &self.rest_base)?;
        validate_base_url("view_base", &self.view_base)?;

        if self.max_requests > 0 && self.window.is_zero() {
            return Err(ConfigError::out_of_range(
                "window",
                format!("{:?}", self.window),
                "a non-zero window when rate limiting is enabled",
            ));
        }
        if !(1..=MAX_ATTEMPTS_LIMIT).contains(&self.max_attempts) {
            return Err(ConfigError::out_of_range(
                "max_attempts",
                self.max_attempts,
                "1..=20",
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::out_of_range(
                "backoff_multiplier",
                self.backoff_multiplier,
                "a finite value >= 1.0",
            ));
        }
        if self.base_delay > self.max_delay {
            return Err(ConfigError::out_of_range(
                "base_delay",
                format!("{:?}", self.base_delay),
                "at most max_delay",
            ));
        }
        validate_timeout("connect_timeout", self.connect_timeout)?;
        validate_timeout("request_timeout", self.request_timeout)?;
        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(ConfigError::out_of_range(
                "batch_size",
                self.batch_size,
                "1..=100",
            ));
        }
        if self.max_concurrent_chunks == 0 {
            return Err(ConfigError::out_of_range(
                "max_concurrent_chunks",
                0,
                "at least 1",
            ));
        }
        if self.max_concurrent_lookups == 0 {
            return Err(ConfigError::out_of_range(
                "max_concurrent_lookups",
                0,
                "at least 1",
            ));
        }
        if self.max_pages == 0 {
            return Err(ConfigError::out_of_range("max_pages", 0, "at least 1"));
        }
        Ok(())
    }

    /// Retry policy described by this config.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            self.base_delay,
            self.max_delay,
            self.backoff_multiplier,
            self.max_jitter,
        )
    }

    /// Remote base URLs.
    #[must_use]
    pub fn endpoints(&self) -> Endpoints {
        Endpoints::new(&self.rest_base, &self.view_base)
    }

    /// Dispatcher tuning.
    #[must_use]
    pub fn dispatch(&self) -> DispatchConfig {
        DispatchConfig {
            batch_size: self.batch_size,
            max_concurrent_chunks: self.max_concurrent_chunks,
            max_pages: self.max_pages,
        }
    }
}

fn validate_base_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    match url::Url::parse(value) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") && parsed.has_host() => Ok(()),
        _ => Err(ConfigError::InvalidUrl {
            field,
            value: value.to_string(),
        }),
    }
}

fn validate_timeout(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() || value > Duration::from_secs(3600) {
        return Err(ConfigError::out_of_range(
            field,
            format!("{value:?}"),
            "between 1ms and 3600s",
        ));
    }
    Ok(())
}

/// Default SQLite cache location.
///
/// Priority:
/// 1. `$XDG_CACHE_HOME/chemfetch/chemfetch_cache.db`
/// 2. `$HOME/.cache/chemfetch/chemfetch_cache.db`
#[must_use]
pub fn default_cache_path() -> Option<PathBuf> {
    if let Some(cache_home) = env_var_non_empty_os("XDG_CACHE_HOME") {
        return Some(PathBuf::from(cache_home).join("chemfetch").join(DEFAULT_CACHE_FILE));
    }
    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".cache")
            .join("chemfetch")
            .join(DEFAULT_CACHE_FILE),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}
