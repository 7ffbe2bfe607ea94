//! chemfetch core library
//!
//! Resilient batch retrieval of compound properties from PubChem. Mixed
//! identifiers (keys, names, SMILES structures) go in; one validated
//! [`ResultTable`] row per identifier comes out, with per-identifier failures
//! reported instead of aborting the batch.
//!
//! # Architecture
//!
//! - [`identifier`] - Classification of raw inputs into keys, names and structures
//! - [`properties`] - Property catalog and selection parsing
//! - [`transport`] - The single rate-limited, retrying channel to PubChem
//! - [`cache`] - Response cache backends (memory, SQLite via [`db`])
//! - [`client`] - Cache-through PubChem requests
//! - [`dispatch`] - Batched property fetches with continuation paging
//! - [`resolve`] - Per-identifier resolution and record validation
//! - [`table`] - Result assembly and rendering
//! - [`engine`] - The context object tying it together

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod engine;
pub mod identifier;
pub mod properties;
pub mod record;
pub mod resolve;
pub mod table;
pub mod transport;
mod user_agent;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use cache::{CacheStats, Expiry, MemoryCache, ResponseCache, SqliteCache};
pub use clock::{Clock, ManualClock, TokioClock};
pub use config::{CacheBackend, ConfigError, EngineConfig, default_cache_path};
pub use db::Database;
pub use engine::{
    Engine, EngineError, EngineStats, default_engine, install_default_engine, retrieve,
};
pub use identifier::{Identifier, Key, RawIdentifier};
pub use properties::PropertySelection;
pub use record::{CompoundRecord, PropertyValue};
pub use resolve::ResolutionOutcome;
pub use table::{ResultTable, Row, Status};
pub use transport::{Endpoints, FailureKind, HttpTransport, RemoteReply, Transport};
