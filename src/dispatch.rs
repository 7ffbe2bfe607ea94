//! Batched property retrieval with continuation-token pagination.
//!
//! Keys are de-duplicated, sorted and split into chunks of at most
//! `batch_size`. Each chunk is one cacheable unit: the pages the remote
//! returns for it are merged and cached under the chunk's fingerprint.
//! A failing chunk marks only its own keys as failed.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::cache::{CachedReply, Fingerprint};
use crate::client::PubChemClient;
use crate::identifier::Key;
use crate::record::row_key;
use crate::transport::{FailureKind, RemoteReply, Request, TransportError};

/// Default number of keys per batch request.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default number of chunks in flight at once.
pub const DEFAULT_MAX_CONCURRENT_CHUNKS: usize = 2;

/// Default cap on continuation pages per chunk.
pub const DEFAULT_MAX_PAGES: u32 = 30;

/// Dispatcher tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Keys per batch request (at least one).
    pub batch_size: usize,
    /// Chunks in flight at once (at least one).
    pub max_concurrent_chunks: usize,
    /// Pages followed per chunk before giving up.
    pub max_pages: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_concurrent_chunks: DEFAULT_MAX_CONCURRENT_CHUNKS,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }
}

/// What the batch endpoint said about one key.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyFetch {
    /// The raw property row for the key.
    Row(Value),
    /// The remote has no such compound.
    NotFound,
    /// The key's chunk could not be retrieved.
    Failed(FailureKind),
}

/// A set of keys fetched together with one tag set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchChunk {
    keys: Vec<Key>,
    tags: Vec<String>,
}

impl BatchChunk {
    /// Keys in this chunk, ascending.
    #[must_use]
    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    fn request(&self) -> Request {
        Request::Properties {
            keys: self.keys.clone(),
            tags: self.tags.clone(),
        }
    }
}

/// Splits `keys` into sorted, de-duplicated chunks of at most `batch_size`.
#[must_use]
pub fn plan_chunks(keys: &[Key], tags: &[&str], batch_size: usize) -> Vec<BatchChunk> {
    let unique: Vec<Key> = keys.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
    let tags: Vec<String> = tags.iter().map(|tag| (*tag).to_string()).collect();
    unique
        .chunks(batch_size.max(1))
        .map(|keys| BatchChunk {
            keys: keys.to_vec(),
            tags: tags.clone(),
        })
        .collect()
}

/// Merged outcome of one chunk's wire calls.
#[derive(Debug)]
enum ChunkReply {
    Absent,
    Rows(Vec<Value>),
}

/// Fetches property rows for many keys.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    client: Arc<PubChemClient>,
    config: DispatchConfig,
}

impl Dispatcher {
    /// Creates a dispatcher over `client`.
    #[must_use]
    pub fn new(client: Arc<PubChemClient>, config: DispatchConfig) -> Self {
        Self { client, config }
    }

    /// Fetches `tags` for every key. The result has one entry per distinct key.
    #[instrument(skip(self, keys, tags), fields(keys = keys.len(), tags = tags.len()))]
    pub async fn fetch(&self, keys: &[Key], tags: &[&str]) -> HashMap<Key, KeyFetch> {
        let chunks = plan_chunks(keys, tags, self.config.batch_size);
        let chunk_count = chunks.len();

        let results: Vec<HashMap<Key, KeyFetch>> = stream::iter(chunks)
            .map(|chunk| self.fetch_chunk(chunk))
            .buffer_unordered(self.config.max_concurrent_chunks.max(1))
            .collect()
            .await;

        let merged: HashMap<Key, KeyFetch> = results.into_iter().flatten().collect();
        let found = merged
            .values()
            .filter(|fetch| matches!(fetch, KeyFetch::Row(_)))
            .count();
        info!(chunks = chunk_count, keys = merged.len(), found, "batch fetch complete");
        merged
    }

    async fn fetch_chunk(&self, chunk: BatchChunk) -> HashMap<Key, KeyFetch> {
        let request = chunk.request();
        let fingerprint = Fingerprint::of(&request);

        let cached = match &fingerprint {
            Some(fingerprint) => self.client.cached(fingerprint).await,
            None => None,
        };

        let reply = if let Some(cached) = cached {
            match cached {
                CachedReply::Absent => ChunkReply::Absent,
                CachedReply::Found(payload) => ChunkReply::Rows(page_rows(&payload).unwrap_or_default()),
            }
        } else {
            match self.collect_pages(&request).await {
                Ok(reply) => {
                    if let Some(fingerprint) = &fingerprint {
                        self.client.remember(fingerprint, &to_cached(&reply)).await;
                    }
                    reply
                }
                Err(error) => {
                    warn!(keys = chunk.keys.len(), %error, "chunk failed");
                    let kind = error.kind();
                    return chunk
                        .keys
                        .iter()
                        .map(|key| (*key, KeyFetch::Failed(kind)))
                        .collect();
                }
            }
        };

        match reply {
            ChunkReply::Absent => chunk
                .keys
                .iter()
                .map(|key| (*key, KeyFetch::NotFound))
                .collect(),
            ChunkReply::Rows(rows) => assign_rows(&chunk.keys, rows),
        }
    }

    /// Sends the first request and follows continuation tokens, merging
    /// every page's rows.
    async fn collect_pages(&self, first: &Request) -> Result<ChunkReply, TransportError> {
        let url = self.client.url(first);
        let Request::Properties { tags, .. } = first else {
            return Err(TransportError::malformed(url, "not a property request"));
        };

        let mut reply = self.client.send(first).await?;
        let mut rows = Vec::new();
        let mut pages = 0u32;

        loop {
            let payload = match reply {
                RemoteReply::Absent if pages == 0 => return Ok(ChunkReply::Absent),
                RemoteReply::Absent => {
                    return Err(TransportError::malformed(url, "continuation expired"));
                }
                RemoteReply::Payload(payload) => payload,
            };
            pages += 1;

            let page = page_rows(&payload);
            let token = continuation(&payload);
            if page.is_none() && token.is_none() {
                return Err(TransportError::malformed(url, "no PropertyTable or ListKey"));
            }
            rows.extend(page.unwrap_or_default());

            let Some(list_key) = token else {
                break;
            };
            if pages >= self.config.max_pages {
                return Err(TransportError::PaginationLimit {
                    url,
                    pages: self.config.max_pages,
                });
            }
            debug!(pages, %list_key, rows = rows.len(), "following continuation");
            reply = self
                .client
                .send(&Request::PropertyPage {
                    list_key,
                    tags: tags.clone(),
                })
                .await?;
        }

        debug!(pages, rows = rows.len(), "chunk pages merged");
        Ok(ChunkReply::Rows(rows))
    }
}

fn to_cached(reply: &ChunkReply) -> CachedReply {
    match reply {
        ChunkReply::Absent => CachedReply::Absent,
        ChunkReply::Rows(rows) => {
            CachedReply::Found(json!({ "PropertyTable": { "Properties": rows } }))
        }
    }
}

fn page_rows(payload: &Value) -> Option<Vec<Value>> {
    payload
        .pointer("/PropertyTable/Properties")
        .and_then(Value::as_array)
        .cloned()
}

fn continuation(payload: &Value) -> Option<String> {
    let token = payload
        .get("ListKey")
        .or_else(|| payload.pointer("/Waiting/ListKey"))?;
    match token {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Matches rows back to the chunk's keys.
///
/// A key with no row is `NotFound`, unless some row lacked a usable key, in
/// which case the remote's answer cannot be trusted for the unmatched keys.
fn assign_rows(keys: &[Key], rows: Vec<Value>) -> HashMap<Key, KeyFetch> {
    let mut by_key: HashMap<Key, Value> = HashMap::new();
    let mut unkeyed = 0usize;
    for row in rows {
        match row_key(&row) {
            Some(key) => {
                by_key.entry(key).or_insert(row);
            }
            None => unkeyed += 1,
        }
    }
    if unkeyed > 0 {
        warn!(unkeyed, "property rows without a usable CID");
    }

    keys.iter()
        .map(|key| {
            let fetch = match by_key.remove(key) {
                Some(row) => KeyFetch::Row(row),
                None if unkeyed > 0 => KeyFetch::Failed(FailureKind::MalformedPayload),
                None => KeyFetch::NotFound,
            };
            (*key, fetch)
        })
        .collect()
}
