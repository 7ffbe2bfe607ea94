//! Cache-through access to PubChem.
//!
//! [`PubChemClient`] pairs the rate-limited [`Channel`] with an optional
//! [`ResponseCache`]. Cacheable requests are answered from the cache when a
//! live entry exists; otherwise the reply is fetched and, if definitive,
//! stored. Cache failures are logged and never fail a request.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::cache::{CachedReply, Expiry, Fingerprint, ResponseCache};
use crate::identifier::Key;
use crate::transport::{Channel, RemoteReply, Request, TransportError};

/// Cache-aware PubChem client shared by the dispatcher and the resolver.
#[derive(Debug)]
pub struct PubChemClient {
    channel: Channel,
    cache: Option<Arc<dyn ResponseCache>>,
    expiry: Expiry,
}

impl PubChemClient {
    /// Creates a client. `cache = None` disables caching.
    #[must_use]
    pub fn new(channel: Channel, cache: Option<Arc<dyn ResponseCache>>, expiry: Expiry) -> Self {
        Self {
            channel,
            cache,
            expiry,
        }
    }

    /// The underlying channel.
    #[must_use]
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// The cache, if enabled.
    #[must_use]
    pub fn cache(&self) -> Option<&Arc<dyn ResponseCache>> {
        self.cache.as_ref()
    }

    /// URL that `request` maps to.
    #[must_use]
    pub fn url(&self, request: &Request) -> String {
        self.channel.endpoints().url(request)
    }

    /// Fetches `request` through the cache and reads the reply with `parse`.
    ///
    /// A fresh reply is stored only once `parse` accepts it, so an unusable
    /// payload is refetched next time instead of being served from cache.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the channel gives up or `parse`
    /// rejects the reply. Errors are not cached.
    #[instrument(skip(self, request, parse), fields(request = request.label()))]
    pub async fn fetch<T, F>(&self, request: &Request, parse: F) -> Result<T, TransportError>
    where
        F: Fn(RemoteReply) -> Result<T, TransportError>,
    {
        let fingerprint = Fingerprint::of(request);
        if let Some(fingerprint) = &fingerprint
            && let Some(hit) = self.cached(fingerprint).await
        {
            match parse(hit.into()) {
                Ok(value) => return Ok(value),
                Err(error) => warn!(%fingerprint, %error, "cached reply unreadable; refetching"),
            }
        }

        let reply = self.channel.send(request).await?;
        let Some(fingerprint) = fingerprint else {
            return parse(reply);
        };
        let stored = CachedReply::from(reply.clone());
        let value = parse(reply)?;
        self.remember(&fingerprint, &stored).await;
        Ok(value)
    }

    /// Sends `request` without touching the cache.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the channel gives up.
    pub async fn send(&self, request: &Request) -> Result<RemoteReply, TransportError> {
        self.channel.send(request).await
    }

    /// Live cache entry for `fingerprint`; backend errors read as a miss.
    pub async fn cached(&self, fingerprint: &Fingerprint) -> Option<CachedReply> {
        let cache = self.cache.as_ref()?;
        match cache.get(fingerprint).await {
            Ok(Some(reply)) => {
                debug!(%fingerprint, "cache hit");
                Some(reply)
            }
            Ok(None) => {
                debug!(%fingerprint, "cache miss");
                None
            }
            Err(error) => {
                warn!(%fingerprint, %error, "cache read failed; treating as miss");
                None
            }
        }
    }

    /// Stores a definitive reply; backend errors are logged and dropped.
    pub async fn remember(&self, fingerprint: &Fingerprint, reply: &CachedReply) {
        let Some(cache) = &self.cache else {
            return;
        };
        if let Err(error) = cache.put(fingerprint, reply, self.expiry).await {
            warn!(%fingerprint, %error, "cache write failed");
        }
    }

    /// Keys registered under a compound name.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] on channel failure or an unreadable payload.
    pub async fn keys_by_name(&self, name: &str) -> Result<Vec<Key>, TransportError> {
        self.lookup(&Request::KeysByName(name.to_string())).await
    }

    /// Keys matching a SMILES string.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] on channel failure or an unreadable payload.
    pub async fn keys_by_structure(&self, smiles: &str) -> Result<Vec<Key>, TransportError> {
        self.lookup(&Request::KeysByStructure(smiles.to_string()))
            .await
    }

    async fn lookup(&self, request: &Request) -> Result<Vec<Key>, TransportError> {
        let url = self.url(request);
        self.fetch(request, |reply| match reply {
            RemoteReply::Absent => Ok(Vec::new()),
            RemoteReply::Payload(payload) => parse_key_list(&payload)
                .ok_or_else(|| TransportError::malformed(url.as_str(), "no IdentifierList.CID")),
        })
        .await
    }

    /// First CAS registry number in the compound's PUG-View record.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] on channel failure or an unreadable payload.
    pub async fn cas(&self, key: Key) -> Result<Option<String>, TransportError> {
        let request = Request::CasRecord(key);
        let url = self.url(&request);
        self.fetch(&request, |reply| match reply {
            RemoteReply::Absent => Ok(None),
            RemoteReply::Payload(payload) => parse_cas(payload)
                .map_err(|error| TransportError::malformed(url.as_str(), error.to_string())),
        })
        .await
    }

    /// The compound's synonym list.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] on channel failure or an unreadable payload.
    pub async fn synonyms(&self, key: Key) -> Result<Option<Vec<String>>, TransportError> {
        let request = Request::Synonyms(key);
        let url = self.url(&request);
        self.fetch(&request, |reply| match reply {
            RemoteReply::Absent => Ok(None),
            RemoteReply::Payload(payload) => parse_synonyms(payload)
                .map_err(|error| TransportError::malformed(url.as_str(), error.to_string())),
        })
        .await
    }
}

#[derive(Debug, Deserialize)]
struct KeyListResponse {
    #[serde(rename = "IdentifierList")]
    identifier_list: KeyList,
}

#[derive(Debug, Deserialize)]
struct KeyList {
    #[serde(rename = "CID", default)]
    cids: Vec<u64>,
}

/// Keys from an `IdentifierList` payload, de-duplicated in order. CID 0
/// (PubChem's "no match" placeholder) is dropped.
fn parse_key_list(payload: &Value) -> Option<Vec<Key>> {
    let response = KeyListResponse::deserialize(payload).ok()?;
    let mut keys: Vec<Key> = Vec::with_capacity(response.identifier_list.cids.len());
    for key in response.identifier_list.cids.into_iter().filter_map(Key::new) {
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    Some(keys)
}

#[derive(Debug, Deserialize)]
struct ViewResponse {
    #[serde(rename = "Record")]
    record: ViewSection,
}

#[derive(Debug, Deserialize)]
struct ViewSection {
    #[serde(rename = "TOCHeading", default)]
    heading: String,
    #[serde(rename = "Section", default)]
    sections: Vec<ViewSection>,
    #[serde(rename = "Information", default)]
    information: Vec<ViewInformation>,
}

#[derive(Debug, Deserialize)]
struct ViewInformation {
    #[serde(rename = "Value")]
    value: Option<ViewValue>,
}

#[derive(Debug, Deserialize)]
struct ViewValue {
    #[serde(rename = "StringWithMarkup", default)]
    strings: Vec<ViewString>,
}

#[derive(Debug, Deserialize)]
struct ViewString {
    #[serde(rename = "String")]
    string: String,
}

impl ViewSection {
    fn find(&self, heading: &str) -> Option<&ViewSection> {
        if self.heading == heading {
            return Some(self);
        }
        self.sections.iter().find_map(|section| section.find(heading))
    }

    fn first_string(&self) -> Option<&str> {
        self.information
            .iter()
            .filter_map(|info| info.value.as_ref())
            .flat_map(|value| value.strings.iter())
            .map(|markup| markup.string.trim())
            .find(|text| !text.is_empty())
    }
}

fn parse_cas(payload: Value) -> Result<Option<String>, serde_json::Error> {
    let response: ViewResponse = serde_json::from_value(payload)?;
    Ok(response
        .record
        .find("CAS")
        .and_then(ViewSection::first_string)
        .map(str::to_string))
}

#[derive(Debug, Deserialize)]
struct SynonymResponse {
    #[serde(rename = "InformationList")]
    information_list: SynonymList,
}

#[derive(Debug, Deserialize)]
struct SynonymList {
    #[serde(rename = "Information", default)]
    information: Vec<SynonymEntry>,
}

#[derive(Debug, Deserialize)]
struct SynonymEntry {
    #[serde(rename = "Synonym", default)]
    synonyms: Vec<String>,
}

fn parse_synonyms(payload: Value) -> Result<Option<Vec<String>>, serde_json::Error> {
    let response: SynonymResponse = serde_json::from_value(payload)?;
    Ok(response
        .information_list
        .information
        .into_iter()
        .next()
        .map(|entry| entry.synonyms)
        .filter(|synonyms| !synonyms.is_empty()))
}
