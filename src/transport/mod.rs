//! The single rate-limited channel to PubChem.
//!
//! - [`Request`] names every remote call the engine makes and knows its URL
//!   and its canonical (cache) form.
//! - [`Transport`] performs one wire attempt. [`HttpTransport`] is the
//!   production implementation; tests substitute scripted ones.
//! - [`Channel`] wraps a transport with the shared [`RateLimiter`] and the
//!   [`RetryPolicy`].

mod channel;
mod error;
mod http;
mod rate_limiter;
mod retry;

use std::fmt::Debug;

use async_trait::async_trait;
use serde_json::Value;

use crate::identifier::Key;

pub use channel::{Channel, ChannelStats};
pub use error::{FailureKind, TransportError, WireFailure};
pub use http::{
    ClientBuildError, DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT, HttpTransport,
};
pub use rate_limiter::{DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW, RateLimiter, parse_retry_after};
pub use retry::{
    DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY,
    DEFAULT_MAX_JITTER, FailureType, RetryDecision, RetryPolicy, StopReason, classify_failure,
};

/// PUG-REST base URL.
pub const DEFAULT_REST_BASE: &str = "https://pubchem.ncbi.nlm.nih.gov/rest/pug";

/// PUG-View base URL.
pub const DEFAULT_VIEW_BASE: &str = "https://pubchem.ncbi.nlm.nih.gov/rest/pug_view/data";

/// A definitive remote answer.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteReply {
    /// A decoded JSON body.
    Payload(Value),
    /// HTTP 404: the remote confirms there is nothing there.
    Absent,
}

/// One wire attempt. Implementations must not retry or rate-limit.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Performs a single GET of `url`.
    async fn execute(&self, url: &str) -> Result<RemoteReply, WireFailure>;
}

/// A remote call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Request {
    /// Keys matching a compound name.
    KeysByName(String),
    /// Keys matching a SMILES string.
    KeysByStructure(String),
    /// Property rows for a set of keys.
    Properties {
        /// Keys, in request order.
        keys: Vec<Key>,
        /// PubChem property tags.
        tags: Vec<String>,
    },
    /// A continuation page of an earlier property request.
    PropertyPage {
        /// The continuation token.
        list_key: String,
        /// PubChem property tags.
        tags: Vec<String>,
    },
    /// The PUG-View CAS section for one key.
    CasRecord(Key),
    /// The synonym list for one key.
    Synonyms(Key),
}

impl Request {
    /// Canonical text for cache fingerprints; `None` if not cacheable.
    ///
    /// Equivalent requests share one canonical form: keys are sorted and
    /// de-duplicated, tags sorted, names trimmed and lower-cased.
    #[must_use]
    pub fn canonical(&self) -> Option<String> {
        match self {
            Self::KeysByName(name) => Some(format!("cids/name/{}", name.trim().to_lowercase())),
            Self::KeysByStructure(smiles) => Some(format!("cids/smiles/{}", smiles.trim())),
            Self::Properties { keys, tags } => {
                let mut keys = keys.iter().map(|key| key.get()).collect::<Vec<_>>();
                keys.sort_unstable();
                keys.dedup();
                let mut tags = tags.clone();
                tags.sort();
                tags.dedup();
                let keys = keys
                    .iter()
                    .map(u64::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                Some(format!("property/{keys}/{}", tags.join(",")))
            }
            Self::PropertyPage { .. } => None,
            Self::CasRecord(key) => Some(format!("view/cas/{key}")),
            Self::Synonyms(key) => Some(format!("synonyms/{key}")),
        }
    }

    /// Short label for logging.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::KeysByName(_) => "keys_by_name",
            Self::KeysByStructure(_) => "keys_by_structure",
            Self::Properties { .. } => "properties",
            Self::PropertyPage { .. } => "property_page",
            Self::CasRecord(_) => "cas",
            Self::Synonyms(_) => "synonyms",
        }
    }
}

/// Base URLs of the two PubChem APIs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    rest_base: String,
    view_base: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self::new(DEFAULT_REST_BASE, DEFAULT_VIEW_BASE)
    }
}

impl Endpoints {
    /// Creates endpoints; trailing slashes are dropped.
    #[must_use]
    pub fn new(rest_base: impl Into<String>, view_base: impl Into<String>) -> Self {
        Self {
            rest_base: rest_base.into().trim_end_matches('/').to_string(),
            view_base: view_base.into().trim_end_matches('/').to_string(),
        }
    }

    /// PUG-REST base URL.
    #[must_use]
    pub fn rest_base(&self) -> &str {
        &self.rest_base
    }

    /// PUG-View base URL.
    #[must_use]
    pub fn view_base(&self) -> &str {
        &self.view_base
    }

    /// Full URL for `request`.
    #[must_use]
    pub fn url(&self, request: &Request) -> String {
        let rest = &self.rest_base;
        match request {
            Request::KeysByName(name) => {
                format!("{rest}/compound/name/{}/cids/JSON", urlencoding::encode(name.trim()))
            }
            Request::KeysByStructure(smiles) => format!(
                "{rest}/compound/smiles/{}/cids/JSON",
                urlencoding::encode(smiles.trim())
            ),
            Request::Properties { keys, tags } => {
                let keys = keys
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                format!("{rest}/compound/cid/{keys}/property/{}/JSON", tags.join(","))
            }
            Request::PropertyPage { list_key, tags } => format!(
                "{rest}/compound/listkey/{}/property/{}/JSON",
                urlencoding::encode(list_key),
                tags.join(",")
            ),
            Request::CasRecord(key) => {
                format!("{}/compound/{key}/JSON?heading=CAS", self.view_base)
            }
            Request::Synonyms(key) => format!("{rest}/compound/cid/{key}/synonyms/JSON"),
        }
    }
}
