//! Collector behavior against a scripted upstream: pagination, failure
//! isolation, retries, idempotent re-collection, and cancellation

use crate::support::{
    fast_settings, items, ok_json, rate_limited, status, ArrayStrategy, EnvelopeStrategy,
    GaugedClient, ScriptedClient,
};
use serde::Serialize;
use serde_json::{json, Value};
use stateful_collector::collector::strategy::parse_envelope;
use stateful_collector::collector::{
    ApiResponse, CollectionStrategy, CollectorError, CollectorInput, FailureKind, PageHint,
    ParseError, ParsedPage, Pager, RetryErrorType, RetryPolicy, StatefulApiCollector,
};
use stateful_collector::cursor::inputs_from;
use stateful_collector::shutdown::{Cancellation, SharedCancellation};
use stateful_collector::store::{MemoryStore, RawKey};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

const TABLE: &str = "raw_things";

#[derive(Debug, Clone, Serialize)]
struct Thing {
    id: u64,
}

impl CollectorInput for Thing {
    fn identity(&self) -> String {
        self.id.to_string()
    }
}

fn things(ids: &[u64]) -> stateful_collector::cursor::InputStream<Thing> {
    inputs_from(ids.iter().map(|&id| Thing { id }).collect())
}

fn params() -> Value {
    json!({ "connection_id": 1, "name": "octo/repo" })
}

fn collector<S: CollectionStrategy<Thing>>(
    client: Arc<ScriptedClient>,
    store: Arc<MemoryStore>,
    strategy: S,
) -> StatefulApiCollector<Thing, S> {
    StatefulApiCollector::new(
        TABLE,
        params(),
        "things/{input.id}/parts",
        strategy,
        client,
        store,
    )
    .unwrap()
    .with_settings(fast_settings())
}

#[tokio::test]
async fn test_items_run_in_parallel_up_to_workers_and_pages_in_sequence() {
    let client = GaugedClient::new(3, Duration::from_millis(15));
    let store = Arc::new(MemoryStore::new());
    let collector = StatefulApiCollector::<Thing, _>::new(
        TABLE,
        params(),
        "things/{input.id}/parts",
        EnvelopeStrategy,
        client.clone(),
        store.clone(),
    )
    .unwrap()
    .with_settings(fast_settings().with_workers(3).with_page_size(2));

    let summary = collector.execute(things(&[1, 2, 3, 4, 5, 6, 7, 8])).await;

    assert!(summary.is_completed());
    assert_eq!(summary.processed, 8);
    assert_eq!(store.raw_record_count(TABLE), 24);
    assert_eq!(client.peak(), 3);
    assert_eq!(client.overlapping(), 0);

    let requests = client.requests();
    for id in 1..=8 {
        let path = format!("things/{id}/parts");
        let pages: Vec<u32> = requests
            .iter()
            .filter(|r| r.path == path)
            .map(|r| r.page())
            .collect();
        assert_eq!(pages, vec![1, 2, 3], "pages of {path}");
    }
}

/// 150 parts per thing at 100 per page
fn two_page_envelope(path: &str, page: u32) -> Result<ApiResponse, stateful_collector::collector::TransportError> {
    let body = match page {
        1 => json!({ "items": items(0..100), "total_count": 150 }),
        _ => json!({ "items": items(100..150), "total_count": 150 }),
    };
    ok_json(path, body)
}

#[tokio::test]
async fn test_every_page_of_every_item_is_persisted() {
    let client = ScriptedClient::new(|req| two_page_envelope(&req.path, req.page()));
    let store = Arc::new(MemoryStore::new());

    let summary = collector(client.clone(), store.clone(), EnvelopeStrategy)
        .execute(things(&[1, 2, 3]))
        .await;

    assert!(summary.is_completed());
    assert_eq!(summary.processed, 3);
    assert!(summary.skipped.is_empty());
    assert_eq!(summary.pages_persisted, 6);
    assert_eq!(store.raw_record_count(TABLE), 6);
    assert_eq!(client.request_count(), 6);

    let key = RawKey::new(params().to_string(), "2", 2);
    let record = store.raw_record(TABLE, &key).expect("page 2 of thing 2");
    assert_eq!(record.input, json!({ "id": 2 }));
    assert_eq!(record.url, "things/2/parts");
    let payload: Vec<Value> = serde_json::from_slice(&record.data).unwrap();
    assert_eq!(payload.len(), 50);
    assert_eq!(payload[0], json!({ "n": 100 }));
}

#[tokio::test]
async fn test_deleted_item_is_skipped_and_others_complete() {
    let client = ScriptedClient::new(|req| {
        if req.path == "things/2/parts" {
            status(404, &req.path, r#"{"message":"Not Found"}"#)
        } else {
            two_page_envelope(&req.path, req.page())
        }
    });
    let store = Arc::new(MemoryStore::new());

    let summary = collector(client, store.clone(), EnvelopeStrategy)
        .execute(things(&[1, 2, 3]))
        .await;

    assert!(summary.is_completed());
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.skipped.len(), 1);
    assert_eq!(summary.skipped[0].kind, FailureKind::NotFound);
    assert_eq!(summary.skipped[0].item.to_string(), "2");
    assert!(summary.skipped[0].reason.contains("things/2/parts"));
    assert_eq!(store.raw_record_count(TABLE), 4);
}

#[tokio::test]
async fn test_server_errors_exhaust_retries_then_skip() {
    let client = ScriptedClient::new(|req| {
        if req.path == "things/1/parts" {
            status(503, &req.path, "upstream unavailable")
        } else {
            ok_json(&req.path, json!({ "items": items(0..3), "total_count": 3 }))
        }
    });
    let store = Arc::new(MemoryStore::new());
    let settings = fast_settings().with_retry(
        RetryPolicy::default()
            .with_max_retries(2)
            .with_backoff(Duration::from_millis(1), Duration::from_millis(2)),
    );

    let summary = collector(client.clone(), store.clone(), EnvelopeStrategy)
        .with_settings(settings)
        .execute(things(&[1, 2]))
        .await;

    assert!(summary.is_completed());
    assert_eq!(summary.processed, 1);
    assert_eq!(
        summary.skipped[0].kind,
        FailureKind::RetryExhausted {
            attempts: 3,
            last: RetryErrorType::ServerError(503)
        }
    );
    assert!(summary.skipped[0].reason.contains("upstream unavailable"));
    assert_eq!(client.count_for("things/1/parts"), 3);
    assert_eq!(summary.retries, 2);
    assert_eq!(store.raw_record_count(TABLE), 1);
}

#[tokio::test]
async fn test_rate_limited_page_is_retried() {
    let calls = Arc::new(AtomicU32::new(0));
    let client = ScriptedClient::new({
        let calls = calls.clone();
        move |req| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                rate_limited(&req.path)
            } else {
                ok_json(&req.path, json!({ "items": items(0..2), "total_count": 2 }))
            }
        }
    });
    let store = Arc::new(MemoryStore::new());

    let summary = collector(client.clone(), store.clone(), EnvelopeStrategy)
        .execute(things(&[7]))
        .await;

    assert!(summary.is_completed());
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.retries, 1);
    assert_eq!(client.request_count(), 2);
    assert_eq!(store.raw_record_count(TABLE), 1);
}

#[tokio::test]
async fn test_forbidden_fails_the_collection() {
    let client = ScriptedClient::new(|req| status(403, &req.path, r#"{"message":"Resource not accessible"}"#));
    let store = Arc::new(MemoryStore::new());

    let summary = collector(client, store.clone(), EnvelopeStrategy)
        .execute(things(&[1]))
        .await;

    match summary.error() {
        Some(CollectorError::Aborted { kind, reason, .. }) => {
            assert_eq!(*kind, FailureKind::ClientError { status: 403 });
            assert!(reason.contains("Resource not accessible"));
        }
        other => panic!("expected abort, got {other:?}"),
    }
    assert_eq!(store.raw_record_count(TABLE), 0);
}

#[tokio::test]
async fn test_recollection_replaces_pages_and_drops_stale_tail() {
    let shrunk = Arc::new(AtomicBool::new(false));
    let client = ScriptedClient::new({
        let shrunk = shrunk.clone();
        move |req| {
            if shrunk.load(Ordering::SeqCst) {
                ok_json(&req.path, json!({ "items": items(0..40), "total_count": 40 }))
            } else {
                two_page_envelope(&req.path, req.page())
            }
        }
    });
    let store = Arc::new(MemoryStore::new());
    let collector = collector(client, store.clone(), EnvelopeStrategy);

    collector.execute(things(&[1, 2])).await;
    assert_eq!(store.raw_record_count(TABLE), 4);

    // Same upstream state: same keys, same count
    let again = collector.execute(things(&[1, 2])).await;
    assert!(again.is_completed());
    assert_eq!(store.raw_record_count(TABLE), 4);

    shrunk.store(true, Ordering::SeqCst);
    collector.execute(things(&[1])).await;

    assert_eq!(store.raw_record_count(TABLE), 3);
    let key = |input: &str, page| RawKey::new(params().to_string(), input, page);
    assert!(store.raw_record(TABLE, &key("1", 2)).is_none());
    assert!(store.raw_record(TABLE, &key("2", 2)).is_some());
    let first = store.raw_record(TABLE, &key("1", 1)).unwrap();
    let payload: Vec<Value> = serde_json::from_slice(&first.data).unwrap();
    assert_eq!(payload.len(), 40);
}

#[tokio::test]
async fn test_cancellation_keeps_persisted_pages() {
    let cancel: SharedCancellation = Cancellation::shared();
    let client = ScriptedClient::new({
        let cancel = cancel.clone();
        move |req| {
            cancel.cancel();
            // Full page, so the item would continue without the signal
            ok_json(&req.path, items(0..100))
        }
    });
    let store = Arc::new(MemoryStore::new());

    let summary = collector(client.clone(), store.clone(), ArrayStrategy)
        .with_settings(fast_settings().with_workers(1))
        .with_cancellation(cancel)
        .execute(things(&[1, 2, 3]))
        .await;

    assert!(summary.is_cancelled());
    assert!(summary.error().is_none());
    assert_eq!(client.request_count(), 1);
    assert_eq!(store.raw_record_count(TABLE), 1);
}

/// `{"data": [...], "next": "<cursor>" | null}`
struct CursorStrategy;

impl CollectionStrategy<Thing> for CursorStrategy {
    fn parse_response(&self, response: &ApiResponse, _pager: &Pager) -> Result<ParsedPage, ParseError> {
        let envelope = parse_envelope(&response.body, "data", None)?;
        let next: Value = serde_json::from_slice(&response.body)?;
        Ok(ParsedPage {
            items: envelope.items,
            hint: PageHint::NextCursor(next["next"].as_str().map(str::to_string)),
        })
    }
}

#[tokio::test]
async fn test_cursor_pagination_follows_next_cursor() {
    let client = ScriptedClient::new(|req| match req.param("cursor") {
        None => ok_json(&req.path, json!({ "data": items(0..3), "next": "c2" })),
        Some("c2") => ok_json(&req.path, json!({ "data": items(3..5), "next": null })),
        Some(other) => panic!("unexpected cursor {other}"),
    });
    let store = Arc::new(MemoryStore::new());

    let summary = collector(client.clone(), store.clone(), CursorStrategy)
        .execute(things(&[1]))
        .await;

    assert!(summary.is_completed());
    assert_eq!(store.raw_record_count(TABLE), 2);
    let requests = client.requests();
    assert_eq!(requests[1].param("cursor"), Some("c2"));
    assert_eq!(requests[1].page(), 2);
}
