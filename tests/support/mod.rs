//! Shared fixtures: a scripted upstream, strategies, and context builders

#![allow(dead_code)]

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::{json, Value};
use stateful_collector::collector::strategy::{parse_envelope, parse_item_array, pages_for_count};
use stateful_collector::collector::{
    ApiClient, ApiResponse, CollectionStrategy, CollectorSettings, PageHint, ParseError,
    ParsedPage, Pager, RetryPolicy, TransportError,
};
use stateful_collector::store::MemoryStore;
use stateful_collector::subtask::TaskContext;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One request the scripted client received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub path: String,
    pub query: Vec<(String, String)>,
}

impl Request {
    /// Value of a query parameter
    pub fn param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// `page` query parameter, 1 when absent
    pub fn page(&self) -> u32 {
        self.param("page").and_then(|p| p.parse().ok()).unwrap_or(1)
    }
}

type Handler = dyn Fn(&Request) -> Result<ApiResponse, TransportError> + Send + Sync;

/// Upstream double answering from a closure and logging every request.
pub struct ScriptedClient {
    handler: Box<Handler>,
    log: Mutex<Vec<Request>>,
}

impl ScriptedClient {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&Request) -> Result<ApiResponse, TransportError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            log: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<Request> {
        self.log.lock().unwrap().clone()
    }

    /// Distinct request paths, in first-seen order
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = Vec::new();
        for request in self.log.lock().unwrap().iter() {
            if !paths.contains(&request.path) {
                paths.push(request.path.clone());
            }
        }
        paths
    }

    pub fn request_count(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    pub fn count_for(&self, path: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path == path)
            .count()
    }
}

#[async_trait]
impl ApiClient for ScriptedClient {
    async fn get(&self, path: &str, query: &[(String, String)]) -> Result<ApiResponse, TransportError> {
        let request = Request {
            path: path.to_string(),
            query: query.to_vec(),
        };
        self.log.lock().unwrap().push(request.clone());
        (self.handler)(&request)
    }
}

/// Upstream double that holds every request open for `delay` and records
/// how many were in flight at once, overall and per path.
pub struct GaugedClient {
    delay: Duration,
    pages: u32,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    per_path: Mutex<HashMap<String, usize>>,
    overlapping: AtomicUsize,
    log: Mutex<Vec<Request>>,
}

impl GaugedClient {
    /// Every path answers `pages` pages of two items each
    pub fn new(pages: u32, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            pages,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            per_path: Mutex::new(HashMap::new()),
            overlapping: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        })
    }

    /// Most requests ever in flight at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Requests that started while another request for the same path was open
    pub fn overlapping(&self) -> usize {
        self.overlapping.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Request> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl ApiClient for GaugedClient {
    async fn get(&self, path: &str, query: &[(String, String)]) -> Result<ApiResponse, TransportError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        {
            let mut open = self.per_path.lock().unwrap();
            let count = open.entry(path.to_string()).or_insert(0);
            if *count > 0 {
                self.overlapping.fetch_add(1, Ordering::SeqCst);
            }
            *count += 1;
        }
        self.log.lock().unwrap().push(Request {
            path: path.to_string(),
            query: query.to_vec(),
        });

        tokio::time::sleep(self.delay).await;

        if let Some(count) = self.per_path.lock().unwrap().get_mut(path) {
            *count -= 1;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        ok_json(
            path,
            json!({ "items": items(0..2), "total_count": self.pages as usize * 2 }),
        )
    }
}

/// 200 with a JSON body
pub fn ok_json(path: &str, body: Value) -> Result<ApiResponse, TransportError> {
    Ok(ApiResponse::new(StatusCode::OK, path, body.to_string()))
}

/// Response with an arbitrary status
pub fn status(code: u16, path: &str, body: &str) -> Result<ApiResponse, TransportError> {
    let status = StatusCode::from_u16(code).unwrap();
    Ok(ApiResponse::new(status, path, body.to_string()))
}

/// 429 asking for an immediate retry
pub fn rate_limited(path: &str) -> Result<ApiResponse, TransportError> {
    let mut headers = HeaderMap::new();
    headers.insert(RETRY_AFTER, HeaderValue::from_static("0"));
    Ok(ApiResponse::new(StatusCode::TOO_MANY_REQUESTS, path, "rate limited").with_headers(headers))
}

/// `[{"n": start}, ..., {"n": end - 1}]`
pub fn items(range: std::ops::Range<u32>) -> Value {
    Value::Array(range.map(|n| json!({ "n": n })).collect())
}

/// Default settings with millisecond backoff
pub fn fast_settings() -> CollectorSettings {
    CollectorSettings::default().with_retry(
        RetryPolicy::default().with_backoff(Duration::from_millis(1), Duration::from_millis(5)),
    )
}

/// `{"items": [...], "total_count": n}`
#[derive(Debug, Default)]
pub struct EnvelopeStrategy;

impl<I> CollectionStrategy<I> for EnvelopeStrategy {
    fn parse_response(&self, response: &ApiResponse, pager: &Pager) -> Result<ParsedPage, ParseError> {
        let envelope = parse_envelope(&response.body, "items", Some("total_count"))?;
        let hint = match envelope.total_count {
            Some(count) => PageHint::TotalPages(pages_for_count(count, pager.size)),
            None => PageHint::Unknown,
        };
        Ok(ParsedPage {
            items: envelope.items,
            hint,
        })
    }
}

/// Top-level item array; paginates while pages are full
#[derive(Debug, Default)]
pub struct ArrayStrategy;

impl<I> CollectionStrategy<I> for ArrayStrategy {
    fn parse_response(&self, response: &ApiResponse, _pager: &Pager) -> Result<ParsedPage, ParseError> {
        Ok(ParsedPage {
            items: parse_item_array(&response.body)?,
            hint: PageHint::Unknown,
        })
    }
}

/// Context over one in-memory store for `owner/repo` on connection 1
pub fn github_context(client: Arc<ScriptedClient>) -> (TaskContext, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let ctx = TaskContext::new(
        store.clone(),
        store.clone(),
        client,
        json!({ "connection_id": 1, "name": "octo/repo" }),
    )
    .with_settings(fast_settings());
    (ctx, store)
}
