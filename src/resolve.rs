//! Resolution of classified identifiers into per-input outcomes.
//!
//! Names and structures are looked up once per call, every resulting key is
//! fetched through the [`Dispatcher`], rows are validated into
//! [`CompoundRecord`]s, and special properties (CAS, synonyms) are attached.
//! Every input gets exactly one [`ResolutionOutcome`], in input order.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream;
use tracing::{debug, info, instrument, warn};

use crate::client::PubChemClient;
use crate::dispatch::{Dispatcher, KeyFetch};
use crate::identifier::{Identifier, Key, RawIdentifier, classify, looks_like_smiles};
use crate::properties::{PropertySelection, PropertySpec, Special};
use crate::record::{CompoundRecord, PropertyValue, attach_special, validate_row};
use crate::transport::{FailureKind, TransportError};

/// Default number of name/structure lookups in flight at once.
pub const DEFAULT_MAX_CONCURRENT_LOOKUPS: usize = 4;

/// The single outcome for one input identifier.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionOutcome {
    /// The identifier maps to exactly one compound.
    Resolved {
        /// The compound's key.
        key: Key,
        /// Validated properties, shared between duplicate inputs.
        record: Arc<CompoundRecord>,
    },
    /// The remote has no matching compound.
    NotFound,
    /// A name matches several compounds.
    Ambiguous {
        /// Every candidate key, de-duplicated, in remote order.
        candidates: Vec<Key>,
    },
    /// The input was rejected locally or by the remote.
    InvalidInput {
        /// Why.
        reason: String,
    },
    /// The remote could not be reached or answered unusably.
    TransportError {
        /// Failure label.
        kind: FailureKind,
        /// Human-readable detail.
        message: String,
    },
}

impl ResolutionOutcome {
    fn transport(error: &TransportError) -> Self {
        Self::TransportError {
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    /// The resolved record, if any.
    #[must_use]
    pub fn record(&self) -> Option<&Arc<CompoundRecord>> {
        match self {
            Self::Resolved { record, .. } => Some(record),
            _ => None,
        }
    }

    /// The resolved key, if any.
    #[must_use]
    pub fn key(&self) -> Option<Key> {
        match self {
            Self::Resolved { key, .. } => Some(*key),
            _ => None,
        }
    }
}

/// One input and its outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// The input as supplied.
    pub input: RawIdentifier,
    /// The classified form; `None` when classification failed.
    pub identifier: Option<Identifier>,
    /// The outcome.
    pub outcome: ResolutionOutcome,
}

/// Result of looking up one name or structure.
#[derive(Debug, Clone)]
enum Lookup {
    Matched(Key),
    NotFound,
    Ambiguous(Vec<Key>),
    Invalid(String),
    Failed(TransportError),
}

/// What happened to one key after the batch fetch and validation.
#[derive(Debug, Clone)]
enum KeyState {
    Record(Arc<CompoundRecord>),
    NotFound,
    Failed(FailureKind, String),
}

/// Turns identifiers into outcomes.
#[derive(Debug, Clone)]
pub struct Resolver {
    client: Arc<PubChemClient>,
    dispatcher: Dispatcher,
    max_concurrent_lookups: usize,
}

impl Resolver {
    /// Creates a resolver.
    #[must_use]
    pub fn new(client: Arc<PubChemClient>, dispatcher: Dispatcher, max_concurrent_lookups: usize) -> Self {
        Self {
            client,
            dispatcher,
            max_concurrent_lookups: max_concurrent_lookups.max(1),
        }
    }

    /// Resolves every input, preserving order and duplicates.
    #[instrument(skip_all, fields(inputs = inputs.len(), properties = selection.specs().len()))]
    pub async fn resolve(
        &self,
        inputs: &[RawIdentifier],
        selection: &PropertySelection,
    ) -> Vec<Resolution> {
        let classified: Vec<_> = inputs.iter().map(classify).collect();

        let to_lookup: Vec<Identifier> = {
            let mut seen: HashSet<&Identifier> = HashSet::new();
            classified
                .iter()
                .flatten()
                .filter(|identifier| !matches!(identifier, Identifier::Key(_)))
                .filter(|identifier| seen.insert(*identifier))
                .cloned()
                .collect()
        };
        let lookups = self.run_lookups(to_lookup).await;

        let mut keys: Vec<Key> = Vec::new();
        let mut seen_keys: HashSet<Key> = HashSet::new();
        for identifier in classified.iter().flatten() {
            let key = match identifier {
                Identifier::Key(key) => Some(*key),
                other => match lookups.get(other) {
                    Some(Lookup::Matched(key)) => Some(*key),
                    _ => None,
                },
            };
            if let Some(key) = key
                && seen_keys.insert(key)
            {
                keys.push(key);
            }
        }

        let states = self.fetch_records(&keys, selection).await;

        let resolutions: Vec<Resolution> = inputs
            .iter()
            .zip(classified)
            .map(|(input, classified)| {
                let (identifier, outcome) = match classified {
                    Err(error) => (
                        None,
                        ResolutionOutcome::InvalidInput {
                            reason: error.to_string(),
                        },
                    ),
                    Ok(identifier) => {
                        let outcome = outcome_for(&identifier, &lookups, &states);
                        (Some(identifier), outcome)
                    }
                };
                Resolution {
                    input: input.clone(),
                    identifier,
                    outcome,
                }
            })
            .collect();

        let resolved = resolutions
            .iter()
            .filter(|r| matches!(r.outcome, ResolutionOutcome::Resolved { .. }))
            .count();
        info!(inputs = resolutions.len(), resolved, "resolution complete");
        resolutions
    }

    async fn run_lookups(&self, identifiers: Vec<Identifier>) -> HashMap<Identifier, Lookup> {
        stream::iter(identifiers)
            .map(|identifier| async move {
                let lookup = match &identifier {
                    Identifier::Name(name) => self.lookup_name(name).await,
                    Identifier::Structure(smiles) => self.lookup_structure(smiles).await,
                    Identifier::Key(key) => Lookup::Matched(*key),
                };
                debug!(kind = identifier.kind(), %identifier, ?lookup, "lookup finished");
                (identifier, lookup)
            })
            .buffer_unordered(self.max_concurrent_lookups)
            .collect()
            .await
    }

    async fn lookup_name(&self, name: &str) -> Lookup {
        match self.client.keys_by_name(name).await {
            Ok(keys) if keys.is_empty() => {
                if looks_like_smiles(name) {
                    self.structure_fallback(name, Lookup::NotFound).await
                } else {
                    Lookup::NotFound
                }
            }
            Ok(keys) => name_match(keys),
            Err(error) if error.is_bad_request() => {
                let rejected = Lookup::Invalid(format!("remote rejected name {name:?}"));
                if looks_like_smiles(name) {
                    self.structure_fallback(name, rejected).await
                } else {
                    rejected
                }
            }
            Err(error) => Lookup::Failed(error),
        }
    }

    async fn structure_fallback(&self, name: &str, otherwise: Lookup) -> Lookup {
        match self.client.keys_by_structure(name).await {
            Ok(keys) if keys.is_empty() => otherwise,
            Ok(keys) => name_match(keys),
            Err(error) if error.is_bad_request() => otherwise,
            Err(error) => Lookup::Failed(error),
        }
    }

    async fn lookup_structure(&self, smiles: &str) -> Lookup {
        let otherwise = match self.client.keys_by_structure(smiles).await {
            Ok(keys) if keys.is_empty() => Lookup::NotFound,
            Ok(keys) => return structure_match(keys),
            Err(error) if error.is_bad_request() => {
                Lookup::Invalid(format!("remote rejected structure {smiles:?}"))
            }
            Err(error) => return Lookup::Failed(error),
        };

        match self.client.keys_by_name(smiles).await {
            Ok(keys) if keys.is_empty() => otherwise,
            Ok(keys) => structure_match(keys),
            Err(error) if error.is_bad_request() => otherwise,
            Err(error) => Lookup::Failed(error),
        }
    }

    async fn fetch_records(
        &self,
        keys: &[Key],
        selection: &PropertySelection,
    ) -> HashMap<Key, KeyState> {
        if keys.is_empty() {
            return HashMap::new();
        }

        let fetched = self.dispatcher.fetch(keys, &selection.batch_tags()).await;
        let mut records: HashMap<Key, CompoundRecord> = HashMap::new();
        let mut states: HashMap<Key, KeyState> = HashMap::new();

        for (key, fetch) in fetched {
            match fetch {
                KeyFetch::Row(row) => match validate_row(&row, selection) {
                    Ok(record) if record.key() == key => {
                        records.insert(key, record);
                    }
                    Ok(_) | Err(_) => {
                        warn!(%key, "property row failed validation");
                        states.insert(
                            key,
                            KeyState::Failed(
                                FailureKind::MalformedPayload,
                                "property row failed validation".to_string(),
                            ),
                        );
                    }
                },
                KeyFetch::NotFound => {
                    states.insert(key, KeyState::NotFound);
                }
                KeyFetch::Failed(kind) => {
                    states.insert(
                        key,
                        KeyState::Failed(kind, format!("batch property request failed: {kind}")),
                    );
                }
            }
        }

        let specials: Vec<&'static PropertySpec> = selection
            .specs()
            .iter()
            .copied()
            .filter(|spec| spec.special().is_some())
            .collect();

        if specials.is_empty() {
            states.extend(
                records
                    .into_iter()
                    .map(|(key, record)| (key, KeyState::Record(Arc::new(record)))),
            );
            return states;
        }

        let enriched: Vec<(Key, KeyState)> = stream::iter(records)
            .map(|(key, record)| {
                let specials = &specials;
                async move { (key, self.attach_specials(record, specials).await) }
            })
            .buffer_unordered(self.max_concurrent_lookups)
            .collect()
            .await;
        states.extend(enriched);
        states
    }

    async fn attach_specials(
        &self,
        mut record: CompoundRecord,
        specials: &[&'static PropertySpec],
    ) -> KeyState {
        let key = record.key();
        for spec in specials {
            let value = match spec.special() {
                Some(Special::Cas) => self
                    .client
                    .cas(key)
                    .await
                    .map(|cas| cas.map(PropertyValue::Text)),
                Some(Special::Synonyms) => self
                    .client
                    .synonyms(key)
                    .await
                    .map(|synonyms| synonyms.map(PropertyValue::List)),
                None => Ok(None),
            };
            match value {
                Ok(value) => attach_special(&mut record, spec, value),
                Err(error) => {
                    warn!(%key, property = spec.name, %error, "special property failed");
                    return KeyState::Failed(error.kind(), error.to_string());
                }
            }
        }
        KeyState::Record(Arc::new(record))
    }
}

fn name_match(keys: Vec<Key>) -> Lookup {
    if keys.len() == 1 {
        Lookup::Matched(keys[0])
    } else {
        Lookup::Ambiguous(keys)
    }
}

fn structure_match(keys: Vec<Key>) -> Lookup {
    if keys.len() == 1 {
        return Lookup::Matched(keys[0]);
    }
    Lookup::Invalid(format!(
        "structure matches {} compounds: {}",
        keys.len(),
        KeyList(&keys)
    ))
}

fn outcome_for(
    identifier: &Identifier,
    lookups: &HashMap<Identifier, Lookup>,
    states: &HashMap<Key, KeyState>,
) -> ResolutionOutcome {
    let key = match identifier {
        Identifier::Key(key) => *key,
        other => match lookups.get(other) {
            Some(Lookup::Matched(key)) => *key,
            Some(Lookup::NotFound) => return ResolutionOutcome::NotFound,
            Some(Lookup::Ambiguous(candidates)) => {
                return ResolutionOutcome::Ambiguous {
                    candidates: candidates.clone(),
                };
            }
            Some(Lookup::Invalid(reason)) => {
                return ResolutionOutcome::InvalidInput {
                    reason: reason.clone(),
                };
            }
            Some(Lookup::Failed(error)) => return ResolutionOutcome::transport(error),
            None => {
                return ResolutionOutcome::InvalidInput {
                    reason: "identifier was not looked up".to_string(),
                };
            }
        },
    };

    match states.get(&key) {
        Some(KeyState::Record(record)) => ResolutionOutcome::Resolved {
            key,
            record: Arc::clone(record),
        },
        Some(KeyState::NotFound) | None => ResolutionOutcome::NotFound,
        Some(KeyState::Failed(kind, message)) => ResolutionOutcome::TransportError {
            kind: *kind,
            message: message.clone(),
        },
    }
}

/// Comma-separated key list for messages.
pub(crate) struct KeyList<'a>(pub(crate) &'a [Key]);

impl fmt::Display for KeyList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, key) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use serde_json::{Value, json};

    use super::*;
    use crate::cache::Expiry;
    use crate::clock::ManualClock;
    use crate::dispatch::DispatchConfig;
    use crate::testing::ScriptedTransport;
    use crate::transport::{Channel, Endpoints, RateLimiter, RemoteReply, RetryPolicy, WireFailure};

    fn resolver(transport: Arc<ScriptedTransport>) -> Resolver {
        let clock = Arc::new(ManualClock::new());
        let channel = Channel::new(
            transport,
            Arc::new(RateLimiter::new(5, Duration::from_secs(1), clock.clone())),
            RetryPolicy::with_max_attempts(2).without_jitter(),
            clock,
            Endpoints::new("http://pug", "http://view"),
        );
        let client = Arc::new(PubChemClient::new(channel, None, Expiry::Never));
        let dispatcher = Dispatcher::new(client.clone(), DispatchConfig::default());
        Resolver::new(client, dispatcher, DEFAULT_MAX_CONCURRENT_LOOKUPS)
    }

    fn key(value: u64) -> Key {
        Key::new(value).unwrap()
    }

    fn cids(values: &[u64]) -> Value {
        json!({"IdentifierList": {"CID": values}})
    }

    fn selection(names: &[&str]) -> PropertySelection {
        PropertySelection::parse(names).unwrap()
    }

    #[tokio::test]
    async fn test_mixed_inputs_keep_order_and_duplicates() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.json("/name/aspirin/", cids(&[2244]));
        transport.json(
            "/cid/1983,2244/property/MolecularWeight/",
            json!({"PropertyTable": {"Properties": [
                {"CID": 2244, "MolecularWeight": "180.16"},
                {"CID": 1983, "MolecularWeight": "151.16"}
            ]}}),
        );
        let resolver = resolver(transport.clone());

        let inputs = vec![
            RawIdentifier::from("aspirin"),
            RawIdentifier::from(1983),
            RawIdentifier::from(0),
            RawIdentifier::from("aspirin"),
        ];
        let resolutions = resolver.resolve(&inputs, &selection(&["molecular_weight"])).await;

        assert_eq!(resolutions.len(), 4);
        assert_eq!(resolutions[0].outcome.key(), Some(key(2244)));
        assert_eq!(resolutions[1].outcome.key(), Some(key(1983)));
        assert!(matches!(
            resolutions[2].outcome,
            ResolutionOutcome::InvalidInput { .. }
        ));
        assert_eq!(resolutions[3].outcome, resolutions[0].outcome);
        assert_eq!(
            resolutions[0].outcome.record().unwrap().molecular_weight(),
            Some(180.16)
        );
        // one lookup, one batch request
        assert_eq!(transport.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_large_repetitive_batch_looks_up_each_name_once() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.json("/name/aspirin/", cids(&[2244]));
        transport.json("/name/caffeine/", cids(&[2519]));
        transport.json(
            "/cid/2244,2519/property/MolecularWeight/",
            json!({"PropertyTable": {"Properties": [
                {"CID": 2244, "MolecularWeight": "180.16"},
                {"CID": 2519, "MolecularWeight": "194.19"}
            ]}}),
        );
        let resolver = resolver(transport.clone());

        let inputs: Vec<RawIdentifier> = (0..300)
            .map(|i| match i % 3 {
                0 => RawIdentifier::from("aspirin"),
                1 => RawIdentifier::from("caffeine"),
                _ => RawIdentifier::from(2244),
            })
            .collect();
        let resolutions = resolver.resolve(&inputs, &selection(&["molecular_weight"])).await;

        assert_eq!(resolutions.len(), 300);
        assert!(
            resolutions
                .iter()
                .all(|r| matches!(r.outcome, ResolutionOutcome::Resolved { .. }))
        );
        assert_eq!(resolutions[1].outcome.key(), Some(key(2519)));
        assert_eq!(resolutions[299].outcome.key(), Some(key(2244)));
        assert_eq!(transport.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_ambiguous_name_lists_candidates_and_fetches_nothing() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.json("/name/glucose/", cids(&[5793, 107_526, 5793, 79025]));
        let resolver = resolver(transport.clone());

        let resolutions = resolver
            .resolve(&["glucose".into()], &selection(&["cas"]))
            .await;
        assert_eq!(
            resolutions[0].outcome,
            ResolutionOutcome::Ambiguous {
                candidates: vec![key(5793), key(107_526), key(79025)]
            }
        );
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_name_is_not_found() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.always("/name/", Ok(RemoteReply::Absent));
        transport.always("/smiles/", Ok(RemoteReply::Absent));
        let resolver = resolver(transport.clone());

        let resolutions = resolver
            .resolve(&["ThisIsA_FakeCompound".into()], &selection(&["cas"]))
            .await;
        assert_eq!(resolutions[0].outcome, ResolutionOutcome::NotFound);
        // "sI" reads as a silicon token, so the structure lookup is tried too
        assert_eq!(transport.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_key_input_missing_from_batch_is_not_found() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.always("/property/", Ok(RemoteReply::Absent));
        let resolver = resolver(transport.clone());

        let resolutions = resolver.resolve(&[RawIdentifier::from(999_999_999)], &selection(&[])).await;
        assert_eq!(resolutions[0].outcome, ResolutionOutcome::NotFound);
        assert!(transport.calls()[0].contains("/property/MolecularFormula/"));
    }

    #[tokio::test]
    async fn test_structure_with_several_matches_is_invalid() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.json("/smiles/", cids(&[1, 2]));
        let resolver = resolver(transport);

        let resolutions = resolver
            .resolve(&[RawIdentifier::structure("C")], &selection(&[]))
            .await;
        let ResolutionOutcome::InvalidInput { reason } = &resolutions[0].outcome else {
            panic!("expected invalid input");
        };
        assert!(reason.contains("1, 2"));
    }

    #[tokio::test]
    async fn test_rejected_structure_falls_back_to_name() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.always("/smiles/", Err(WireFailure::status(400)));
        transport.json("/name/", cids(&[962]));
        transport.json(
            "/cid/962/",
            json!({"PropertyTable": {"Properties": [{"CID": 962, "MolecularFormula": "H2O"}]}}),
        );
        let resolver = resolver(transport);

        let resolutions = resolver
            .resolve(&[RawIdentifier::structure("O")], &selection(&["formula"]))
            .await;
        assert_eq!(resolutions[0].outcome.key(), Some(key(962)));
    }

    #[tokio::test]
    async fn test_smiles_looking_name_falls_back_to_structure() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.always("/name/", Ok(RemoteReply::Absent));
        transport.json("/smiles/", cids(&[702]));
        transport.json(
            "/cid/702/",
            json!({"PropertyTable": {"Properties": [{"CID": 702}]}}),
        );
        let resolver = resolver(transport);

        let resolutions = resolver.resolve(&["C1CCCCC1".into()], &selection(&[])).await;
        assert_eq!(resolutions[0].outcome.key(), Some(key(702)));
    }

    #[tokio::test]
    async fn test_bad_request_name_is_invalid_input() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.always("/name/", Err(WireFailure::status(400)));
        let resolver = resolver(transport);

        let resolutions = resolver.resolve(&["what ever".into()], &selection(&[])).await;
        assert!(matches!(
            resolutions[0].outcome,
            ResolutionOutcome::InvalidInput { .. }
        ));
    }

    #[tokio::test]
    async fn test_specials_attached_and_absent_is_fine() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.json(
            "/cid/2519/property/",
            json!({"PropertyTable": {"Properties": [{"CID": 2519, "MolecularFormula": "C8H10N4O2"}]}}),
        );
        transport.json(
            "/compound/2519/JSON",
            json!({"Record": {"Section": [{"TOCHeading": "CAS", "Information": [
                {"Value": {"StringWithMarkup": [{"String": "58-08-2"}]}}
            ]}]}}),
        );
        transport.always("/synonyms/", Ok(RemoteReply::Absent));
        let resolver = resolver(transport);

        let resolutions = resolver
            .resolve(&[RawIdentifier::from(2519)], &selection(&["cas", "synonyms"]))
            .await;
        let record = resolutions[0].outcome.record().unwrap();
        assert_eq!(record.cas(), Some("58-08-2"));
        assert!(record.synonyms().is_empty());
    }

    #[tokio::test]
    async fn test_special_failure_isolated_to_its_key() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.json(
            "/cid/1,2/",
            json!({"PropertyTable": {"Properties": [{"CID": 1}, {"CID": 2}]}}),
        );
        transport.json("/cid/1/synonyms/", json!({"InformationList": {"Information": [{"Synonym": ["a"]}]}}));
        transport.always("/cid/2/synonyms/", Err(WireFailure::status(500)));
        let resolver = resolver(transport);

        let resolutions = resolver
            .resolve(&[RawIdentifier::from(1), RawIdentifier::from(2)], &selection(&["synonyms"]))
            .await;
        assert_eq!(resolutions[0].outcome.key(), Some(key(1)));
        assert!(matches!(
            resolutions[1].outcome,
            ResolutionOutcome::TransportError {
                kind: FailureKind::RetriesExhausted,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_lookup_transport_failure() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.always("/name/", Err(WireFailure::Timeout));
        let resolver = resolver(transport);

        let resolutions = resolver.resolve(&["caffeine".into()], &selection(&[])).await;
        assert!(matches!(
            resolutions[0].outcome,
            ResolutionOutcome::TransportError { .. }
        ));
    }
}
