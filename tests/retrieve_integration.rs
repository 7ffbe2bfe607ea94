//! End-to-end retrieval against a fake PubChem served by wiremock.

#![allow(clippy::unwrap_used)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chemfetch_core::{
    CacheBackend, Engine, EngineConfig, Expiry, FailureKind, PropertyValue, RawIdentifier,
    ResolutionOutcome, Status,
};
use serde_json::{Value, json};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const REST: &str = "/rest/pug";
const VIEW: &str = "/rest/pug_view/data";

fn config(server: &MockServer) -> EngineConfig {
    EngineConfig {
        rest_base: format!("{}{REST}", server.uri()),
        view_base: format!("{}{VIEW}", server.uri()),
        max_requests: 0,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
        max_jitter: Duration::ZERO,
        cache: CacheBackend::Memory,
        expiry: Expiry::Never,
        ..EngineConfig::default()
    }
}

fn cids(values: &[u64]) -> Value {
    json!({"IdentifierList": {"CID": values}})
}

fn cas_record(cas: &str) -> Value {
    json!({"Record": {"Section": [{
        "TOCHeading": "Names and Identifiers",
        "Section": [{"TOCHeading": "Other Identifiers", "Section": [{
            "TOCHeading": "CAS",
            "Information": [{"Value": {"StringWithMarkup": [{"String": cas}]}}]
        }]}]
    }]}})
}

async fn mount_name(server: &MockServer, name: &str, keys: &[u64]) {
    Mock::given(method("GET"))
        .and(path(format!("{REST}/compound/name/{name}/cids/JSON")))
        .respond_with(ResponseTemplate::new(200).set_body_json(cids(keys)))
        .mount(server)
        .await;
}

async fn mount_cas(server: &MockServer, key: u64, cas: &str) {
    Mock::given(method("GET"))
        .and(path(format!("{VIEW}/compound/{key}/JSON")))
        .and(query_param("heading", "CAS"))
        .respond_with(ResponseTemplate::new(200).set_body_json(cas_record(cas)))
        .mount(server)
        .await;
}

async fn request_count(server: &MockServer) -> usize {
    server.received_requests().await.unwrap().len()
}

#[tokio::test]
async fn test_names_and_keys_resolve_with_weight_and_cas() {
    let server = MockServer::start().await;
    mount_name(&server, "aspirin", &[2244]).await;
    mount_name(&server, "caffeine", &[2519]).await;
    Mock::given(method("GET"))
        .and(path(format!(
            "{REST}/compound/cid/1983,2244,2519/property/MolecularWeight/JSON"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "PropertyTable": {"Properties": [
                {"CID": 1983, "MolecularWeight": "151.16"},
                {"CID": 2244, "MolecularWeight": "180.16"},
                {"CID": 2519, "MolecularWeight": "194.19"}
            ]}
        })))
        .expect(1)
        .mount(&server)
        .await;
    mount_cas(&server, 2244, "50-78-2").await;
    mount_cas(&server, 2519, "58-08-2").await;
    mount_cas(&server, 1983, "103-90-2").await;

    let engine = Engine::new(config(&server)).await.unwrap();
    let inputs = [
        RawIdentifier::from("aspirin"),
        RawIdentifier::from("caffeine"),
        RawIdentifier::from(1983),
    ];
    let table = engine
        .retrieve(&inputs, &["molecular_weight", "cas"])
        .await
        .unwrap();

    assert_eq!(table.len(), 3);
    let keys: Vec<u64> = table
        .rows()
        .iter()
        .map(|row| row.key().unwrap().get())
        .collect();
    assert_eq!(keys, vec![2244, 2519, 1983]);
    assert!(table.rows().iter().all(|row| row.status() == Status::Resolved));
    assert_eq!(
        table.value(0, "molecular_weight"),
        Some(&PropertyValue::Float(180.16))
    );
    assert_eq!(
        table.value(1, "cas"),
        Some(&PropertyValue::Text("58-08-2".to_string()))
    );
    assert_eq!(
        table.value(2, "cas"),
        Some(&PropertyValue::Text("103-90-2".to_string()))
    );
}

#[tokio::test]
async fn test_unknown_name_is_not_found_with_empty_columns() {
    // unmatched requests get wiremock's default 404
    let server = MockServer::start().await;
    let engine = Engine::new(config(&server)).await.unwrap();

    let table = engine
        .retrieve(&["ThisIsA_FakeCompound".into()], &["cas"])
        .await
        .unwrap();

    assert_eq!(table.len(), 1);
    assert_eq!(table.rows()[0].status(), Status::NotFound);
    assert_eq!(table.rows()[0].key(), None);
    assert!(table.rows()[0].values().iter().all(Option::is_none));
    // name lookup, then the structure fallback ("sI" reads as silicon)
    assert_eq!(request_count(&server).await, 2);
}

#[tokio::test]
async fn test_ambiguous_name_lists_candidates() {
    let server = MockServer::start().await;
    mount_name(&server, "glucose", &[5793, 107_526, 79025]).await;
    let engine = Engine::new(config(&server)).await.unwrap();

    let table = engine
        .retrieve(&["glucose".into()], &["cas"])
        .await
        .unwrap();

    let row = &table.rows()[0];
    assert_eq!(row.status(), Status::Ambiguous);
    match row.outcome() {
        ResolutionOutcome::Ambiguous { candidates } => assert!(candidates.len() >= 2),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(row.values().iter().all(Option::is_none));
    // the lookup only; no property or CAS requests for an ambiguous name
    assert_eq!(request_count(&server).await, 1);
}

#[tokio::test]
async fn test_continuation_pages_are_merged() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!(
            "{REST}/compound/cid/1,2,3/property/MolecularFormula/JSON"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ListKey": "lk42",
            "PropertyTable": {"Properties": [{"CID": 1, "MolecularFormula": "C2H4O2"}]}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!(
            "{REST}/compound/listkey/lk42/property/MolecularFormula/JSON"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "PropertyTable": {"Properties": [
                {"CID": 2, "MolecularFormula": "CH4"},
                {"CID": 3, "MolecularFormula": "H2O"}
            ]}
        })))
        .expect(1)
        .mount(&server)
        .await;
    let engine = Engine::new(config(&server)).await.unwrap();

    let inputs: Vec<RawIdentifier> = [1_i64, 2, 3].into_iter().map(RawIdentifier::from).collect();
    let table = engine
        .retrieve(&inputs, &["molecular_formula"])
        .await
        .unwrap();

    assert_eq!(table.with_status(Status::Resolved).count(), 3);
    assert_eq!(
        table.value(2, "molecular_formula"),
        Some(&PropertyValue::Text("H2O".to_string()))
    );
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{REST}/compound/name/aspirin/cids/JSON")))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    mount_name(&server, "aspirin", &[2244]).await;
    Mock::given(method("GET"))
        .and(path(format!(
            "{REST}/compound/cid/2244/property/MolecularWeight/JSON"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "PropertyTable": {"Properties": [{"CID": 2244, "MolecularWeight": 180.16}]}
        })))
        .mount(&server)
        .await;
    let engine = Engine::new(config(&server)).await.unwrap();

    let table = engine
        .retrieve(&["aspirin".into()], &["molecular_weight"])
        .await
        .unwrap();

    assert_eq!(table.rows()[0].status(), Status::Resolved);
    assert_eq!(engine.stats().retried, 2);
}

#[tokio::test]
async fn test_exhausted_retries_fail_only_that_identifier() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{REST}/compound/name/aspirin/cids/JSON")))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!(
            "{REST}/compound/cid/2519/property/MolecularWeight/JSON"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "PropertyTable": {"Properties": [{"CID": 2519, "MolecularWeight": "194.19"}]}
        })))
        .mount(&server)
        .await;
    let engine = Engine::new(EngineConfig {
        max_attempts: 3,
        ..config(&server)
    })
    .await
    .unwrap();

    let table = engine
        .retrieve(&["aspirin".into(), 2519.into()], &["molecular_weight"])
        .await
        .unwrap();

    match table.rows()[0].outcome() {
        ResolutionOutcome::TransportError { kind, .. } => {
            assert_eq!(*kind, FailureKind::RetriesExhausted);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(table.rows()[1].status(), Status::Resolved);
}

#[tokio::test]
async fn test_warm_cache_repeat_makes_no_new_calls() {
    let server = MockServer::start().await;
    mount_name(&server, "caffeine", &[2519]).await;
    Mock::given(method("GET"))
        .and(path(format!(
            "{REST}/compound/cid/2519/property/MolecularWeight/JSON"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "PropertyTable": {"Properties": [{"CID": 2519, "MolecularWeight": "194.19"}]}
        })))
        .mount(&server)
        .await;
    mount_cas(&server, 2519, "58-08-2").await;
    let engine = Engine::new(config(&server)).await.unwrap();
    let inputs: [RawIdentifier; 2] = ["caffeine".into(), "ThisIsA_FakeCompound".into()];

    let first = engine
        .retrieve(&inputs, &["molecular_weight", "cas"])
        .await
        .unwrap();
    let calls = request_count(&server).await;
    let second = engine
        .retrieve(&inputs, &["molecular_weight", "cas"])
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(request_count(&server).await, calls);
}

#[tokio::test]
async fn test_bad_identifiers_do_not_reduce_resolved_count() {
    let server = MockServer::start().await;
    mount_name(&server, "glucose", &[5793, 107_526]).await;
    Mock::given(method("GET"))
        .and(path(format!(
            "{REST}/compound/cid/2244/property/MolecularFormula/JSON"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "PropertyTable": {"Properties": [{"CID": 2244, "MolecularFormula": "C9H8O4"}]}
        })))
        .mount(&server)
        .await;
    let engine = Engine::new(config(&server)).await.unwrap();

    let inputs = [
        RawIdentifier::from(2244),
        RawIdentifier::from(0),
        RawIdentifier::from("ThisIsA_FakeCompound"),
        RawIdentifier::from("glucose"),
        RawIdentifier::from(""),
        RawIdentifier::from(2244),
    ];
    let table = engine
        .retrieve(&inputs, &["molecular_formula"])
        .await
        .unwrap();

    let statuses: Vec<Status> = table.rows().iter().map(|row| row.status()).collect();
    assert_eq!(
        statuses,
        vec![
            Status::Resolved,
            Status::InvalidInput,
            Status::NotFound,
            Status::Ambiguous,
            Status::InvalidInput,
            Status::Resolved,
        ]
    );
}

#[tokio::test]
async fn test_outbound_rate_stays_under_ceiling() {
    let server = MockServer::start().await;
    let stamps: Arc<Mutex<Vec<Instant>>> = Arc::default();
    let recorder = stamps.clone();
    Mock::given(method("GET"))
        .respond_with(move |_: &Request| {
            recorder.lock().unwrap().push(Instant::now());
            ResponseTemplate::new(404)
        })
        .mount(&server)
        .await;
    let engine = Engine::new(EngineConfig {
        max_requests: 5,
        window: Duration::from_secs(1),
        ..config(&server)
    })
    .await
    .unwrap();

    let names = [
        "alpha", "beta", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india",
        "juliet", "kilo", "lima",
    ];
    let inputs: Vec<RawIdentifier> = names.iter().map(|name| RawIdentifier::from(*name)).collect();
    let table = engine.retrieve(&inputs, &["cas"]).await.unwrap();

    assert_eq!(table.with_status(Status::NotFound).count(), names.len());
    let mut stamps = stamps.lock().unwrap().clone();
    stamps.sort();
    assert_eq!(stamps.len(), names.len());
    // slightly narrower than the window to absorb scheduling jitter
    let window = Duration::from_millis(900);
    for (i, start) in stamps.iter().enumerate() {
        let in_window = stamps[i..]
            .iter()
            .filter(|at| at.duration_since(*start) < window)
            .count();
        assert!(in_window <= 5, "{in_window} requests within {window:?}");
    }
}

#[tokio::test]
async fn test_timeout_abandons_batch_and_engine_stays_usable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(cids(&[1]))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;
    let engine = Engine::new(EngineConfig {
        max_requests: 5,
        window: Duration::from_secs(1),
        ..config(&server)
    })
    .await
    .unwrap();

    let error = engine
        .retrieve_with_timeout(&["slow".into()], &["cas"], Duration::from_millis(200))
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        chemfetch_core::EngineError::TimedOut { .. }
    ));

    server.reset().await;
    mount_name(&server, "aspirin", &[2244]).await;
    Mock::given(method("GET"))
        .and(path(format!(
            "{REST}/compound/cid/2244/property/MolecularFormula/JSON"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "PropertyTable": {"Properties": [{"CID": 2244, "MolecularFormula": "C9H8O4"}]}
        })))
        .mount(&server)
        .await;

    let table = engine
        .retrieve_with_timeout(
            &["aspirin".into()],
            &["molecular_formula"],
            Duration::from_secs(5),
        )
        .await
        .unwrap();

    assert_eq!(table.rows()[0].status(), Status::Resolved);
    assert_eq!(
        table.value(0, "molecular_formula"),
        Some(&PropertyValue::Text("C9H8O4".to_string()))
    );
    let stats = engine.stats();
    // the abandoned lookup plus the two calls of the second batch
    assert_eq!(stats.attempts, 3);
    assert_eq!(stats.admitted, 3);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.retried, 0);
    assert!(stats.cache.is_some());
}
