//! The collection loop.
//!
//! Input items are fetched concurrently, bounded by `CollectorSettings::workers`;
//! the pages of one item are fetched strictly in order. Cancellation and fatal
//! errors are observed at item and page boundaries and while backing off:
//! no new items are dispatched, in-flight items stop before their next page,
//! and pages already written stay in the store.

use super::client::{ApiClient, ApiResponse};
use super::config::{CollectorSettings, BODY_LOG_LIMIT};
use super::pager::Pager;
use super::retry::{format_exhausted, format_retry, parse_retry_after, truncate_body, RetryErrorType};
use super::strategy::{
    CollectionStrategy, CollectorInput, Disposition, FetchAttemptResult, RequestData, StatusClass,
};
use super::template::{TemplateContext, UrlTemplate};
use super::{CollectionOutcome, CollectionSummary, CollectorError, FailureKind, ItemFailure, ItemRef};
use crate::cursor::InputStream;
use crate::metrics::{self, HttpRequestMetrics};
use crate::shutdown::{Cancellation, SharedCancellation};
use crate::store::{RawDataRecord, RawDataStore, StoreError, StoreResult};
use bytes::Bytes;
use chrono::Utc;
use futures_util::{future, StreamExt};
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, debug_span, error, info, info_span, warn, Instrument};

/// Collector for one raw table, generic over its input type `I` and
/// strategy `S`.
pub struct StatefulApiCollector<I, S> {
    table: String,
    params: Value,
    params_key: String,
    template: UrlTemplate,
    strategy: S,
    client: Arc<dyn ApiClient>,
    store: Arc<dyn RawDataStore>,
    settings: CollectorSettings,
    cancel: SharedCancellation,
    _input: PhantomData<fn(&I)>,
}

/// Counters and the abort flag shared by every worker of one run.
#[derive(Default)]
struct RunState {
    aborted: AtomicBool,
    requests: AtomicU64,
    retries: AtomicU64,
    pages: AtomicU64,
}

enum ItemOutcome {
    Processed,
    Skipped(ItemFailure),
    /// Stopped by cancellation or another item's fatal error
    Interrupted,
    Fatal(CollectorError),
}

/// A page fetch that ended without a usable response.
struct FailedFetch {
    result: FetchAttemptResult,
    reason: String,
}

enum Fetch {
    Response(ApiResponse),
    Failed(Box<FailedFetch>),
    Cancelled,
    Fatal(CollectorError),
}

impl<I, S> StatefulApiCollector<I, S>
where
    I: CollectorInput,
    S: CollectionStrategy<I>,
{
    /// Build a collector writing to `table`.
    ///
    /// `params` identifies the connection and entity selector; its canonical
    /// JSON form is the params component of every raw key. `url_template` is
    /// parsed here, so template syntax errors surface before any request.
    pub fn new(
        table: impl Into<String>,
        params: Value,
        url_template: &str,
        strategy: S,
        client: Arc<dyn ApiClient>,
        store: Arc<dyn RawDataStore>,
    ) -> Result<Self, CollectorError> {
        let template = UrlTemplate::parse(url_template)?;
        let params_key = params_key(&params);
        Ok(Self {
            table: table.into(),
            params,
            params_key,
            template,
            strategy,
            client,
            store,
            settings: CollectorSettings::default(),
            cancel: Cancellation::shared(),
            _input: PhantomData,
        })
    }

    /// Replace the runtime settings.
    pub fn with_settings(mut self, settings: CollectorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Observe `cancel` instead of a private, never-fired signal.
    pub fn with_cancellation(mut self, cancel: SharedCancellation) -> Self {
        self.cancel = cancel;
        self
    }

    /// Canonical params string used in raw keys
    pub fn params_key(&self) -> &str {
        &self.params_key
    }

    /// Raw table this collector writes
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Fetch every input and persist every parsed page.
    pub async fn execute(&self, inputs: InputStream<I>) -> CollectionSummary {
        let span = info_span!("collect", table = %self.table, params = %self.params_key);
        self.run(inputs).instrument(span).await
    }

    async fn run(&self, inputs: InputStream<I>) -> CollectionSummary {
        info!(
            workers = self.settings.workers,
            page_size = self.settings.page_size,
            template = %self.template,
            "Collection started"
        );

        let state = RunState::default();
        let state = &state;
        let mut summary = CollectionSummary::new(&self.table);
        let mut fatal: Option<CollectorError> = None;

        let mut outcomes = inputs
            .take_while(|_| {
                future::ready(!self.cancel.is_cancelled() && !state.aborted.load(Ordering::SeqCst))
            })
            .map(|input| self.collect_item(input, state))
            .buffer_unordered(self.settings.workers.max(1));

        while let Some(outcome) = outcomes.next().await {
            match outcome {
                ItemOutcome::Processed => summary.processed += 1,
                ItemOutcome::Skipped(failure) => {
                    warn!(
                        item = %failure.item,
                        kind = %failure.kind,
                        reason = %failure.reason,
                        "Item skipped"
                    );
                    metrics::record_item_skipped(&self.table, failure.kind.label());
                    summary.skipped.push(failure);
                }
                ItemOutcome::Interrupted => {}
                ItemOutcome::Fatal(e) => {
                    error!(error = %e, "Collection aborted");
                    if fatal.is_none() {
                        fatal = Some(e);
                    }
                }
            }
        }
        drop(outcomes);

        summary.requests = state.requests.load(Ordering::SeqCst);
        summary.retries = state.retries.load(Ordering::SeqCst);
        summary.pages_persisted = state.pages.load(Ordering::SeqCst);
        summary.outcome = match fatal {
            Some(e) => CollectionOutcome::Failed(e),
            None if self.cancel.is_cancelled() => CollectionOutcome::Cancelled,
            None => CollectionOutcome::Completed,
        };

        info!(
            processed = summary.processed,
            skipped = summary.skipped.len(),
            pages = summary.pages_persisted,
            requests = summary.requests,
            retries = summary.retries,
            outcome = ?summary.outcome,
            "Collection finished"
        );
        summary
    }

    async fn collect_item(&self, input: StoreResult<I>, state: &RunState) -> ItemOutcome {
        let input = match input {
            Ok(input) => input,
            Err(StoreError::RowDecode { table, id, message }) => {
                return ItemOutcome::Skipped(ItemFailure {
                    item: ItemRef::Unattributable,
                    kind: FailureKind::UndecodableInput,
                    reason: format!("row {id} of {table} could not be decoded: {message}"),
                });
            }
            Err(e) => return self.abort(state, CollectorError::Input(e)),
        };

        let identity = input.identity();
        let span = debug_span!("item", item = %identity);
        match self.collect_pages(&input, &identity, state).instrument(span).await {
            ItemOutcome::Fatal(e) => self.abort(state, e),
            outcome => outcome,
        }
    }

    fn abort(&self, state: &RunState, error: CollectorError) -> ItemOutcome {
        state.aborted.store(true, Ordering::SeqCst);
        ItemOutcome::Fatal(error)
    }

    fn should_stop(&self, state: &RunState) -> bool {
        self.cancel.is_cancelled() || state.aborted.load(Ordering::SeqCst)
    }

    async fn collect_pages(&self, input: &I, identity: &str, state: &RunState) -> ItemOutcome {
        let input_value = match serde_json::to_value(input) {
            Ok(value) => value,
            Err(e) => return ItemOutcome::Fatal(CollectorError::Serialization(e.to_string())),
        };
        let mut pager = Pager::first(self.settings.page_size);
        let mut last_page = 0u32;

        loop {
            if self.should_stop(state) {
                debug!(page = pager.page, "Stopping item at page boundary");
                return ItemOutcome::Interrupted;
            }

            if pager.page > self.settings.max_pages {
                let pages = self.settings.max_pages;
                let result = FetchAttemptResult {
                    item: identity.to_string(),
                    url: self.template.to_string(),
                    page: pager.page,
                    status: None,
                    class: StatusClass::Success,
                    body: String::new(),
                    items: 0,
                    failure: Some(FailureKind::PageCapExceeded { pages }),
                };
                let reason = format!("item has more than {pages} pages");
                return self.on_failure(FailedFetch { result, reason });
            }

            let path = match self.template.render(&TemplateContext {
                params: &self.params,
                input: &input_value,
                pager: &pager,
            }) {
                Ok(path) => path,
                Err(e) => return ItemOutcome::Fatal(e.into()),
            };
            let query = self.strategy.build_request(&RequestData {
                params: &self.params,
                input,
                pager: &pager,
            });

            let response = match self.fetch_with_retry(&path, &query, identity, pager.page, state).await {
                Fetch::Response(response) => response,
                Fetch::Failed(failed) => return self.on_failure(*failed),
                Fetch::Cancelled => return ItemOutcome::Interrupted,
                Fetch::Fatal(e) => return ItemOutcome::Fatal(e),
            };

            let parsed = match self.strategy.parse_response(&response, &pager) {
                Ok(parsed) => parsed,
                Err(e) => {
                    let body = truncate_body(&response.body, BODY_LOG_LIMIT);
                    let reason = format!("unparseable response from {}: {e}: {body}", response.url);
                    let result = FetchAttemptResult {
                        item: identity.to_string(),
                        url: response.url,
                        page: pager.page,
                        status: Some(response.status),
                        class: StatusClass::Success,
                        body,
                        items: 0,
                        failure: Some(FailureKind::ParseError),
                    };
                    return self.on_failure(FailedFetch { result, reason });
                }
            };

            let result = FetchAttemptResult {
                item: identity.to_string(),
                url: response.url.clone(),
                page: pager.page,
                status: Some(response.status),
                class: StatusClass::Success,
                body: String::new(),
                items: parsed.items.len(),
                failure: None,
            };
            match self.strategy.classify_response(&result) {
                Disposition::Continue => {}
                Disposition::SkipItem => {
                    return ItemOutcome::Skipped(ItemFailure {
                        item: ItemRef::Item(identity.to_string()),
                        kind: FailureKind::SkippedByHook,
                        reason: format!("response hook skipped page {} ({})", pager.page, response.url),
                    });
                }
                Disposition::AbortItem => {
                    info!(page = pager.page, "Response hook stopped item, keeping earlier pages");
                    return ItemOutcome::Processed;
                }
                Disposition::AbortAll => {
                    return ItemOutcome::Fatal(CollectorError::Aborted {
                        item: ItemRef::Item(identity.to_string()),
                        kind: FailureKind::AbortedByHook,
                        reason: format!("response hook aborted at page {} ({})", pager.page, response.url),
                    });
                }
            }

            let data = match serde_json::to_vec(&parsed.items) {
                Ok(data) => Bytes::from(data),
                Err(e) => return ItemOutcome::Fatal(CollectorError::Serialization(e.to_string())),
            };
            let record = RawDataRecord {
                params: self.params_key.clone(),
                input_id: identity.to_string(),
                input: input_value.clone(),
                page: pager.page,
                url: response.url,
                data,
                created_at: Utc::now(),
            };
            if let Err(e) = self.store.upsert(&self.table, record).await {
                error!(page = pager.page, error = %e, "Failed to persist raw page");
                return ItemOutcome::Fatal(CollectorError::Persistence(e));
            }
            state.pages.fetch_add(1, Ordering::SeqCst);
            metrics::record_page_persisted(&self.table);
            debug!(page = pager.page, items = parsed.items.len(), "Raw page persisted");
            last_page = pager.page;

            match pager.advance(&parsed.hint, parsed.items.len()) {
                Some(next) => pager = next,
                None => break,
            }
        }

        // Pages beyond the current last page belong to an earlier, longer run.
        match self
            .store
            .retain_pages(&self.table, &self.params_key, identity, last_page)
            .await
        {
            Ok(0) => {}
            Ok(removed) => debug!(removed, last_page, "Dropped stale raw pages"),
            Err(e) => return ItemOutcome::Fatal(CollectorError::Persistence(e)),
        }
        ItemOutcome::Processed
    }

    /// Apply `classify_response` to a failed page.
    fn on_failure(&self, failed: FailedFetch) -> ItemOutcome {
        let FailedFetch { result, reason } = failed;
        let kind = result
            .failure
            .clone()
            .unwrap_or(FailureKind::ParseError);
        let item = ItemRef::Item(result.item.clone());

        match self.strategy.classify_response(&result) {
            Disposition::SkipItem => ItemOutcome::Skipped(ItemFailure { item, kind, reason }),
            Disposition::Continue | Disposition::AbortItem => {
                info!(
                    page = result.page,
                    kind = %kind,
                    reason = %reason,
                    "Item stopped early, keeping earlier pages"
                );
                ItemOutcome::Processed
            }
            Disposition::AbortAll => ItemOutcome::Fatal(CollectorError::Aborted { item, kind, reason }),
        }
    }

    /// One page request with retry on transport errors, 429 and 5xx.
    async fn fetch_with_retry(
        &self,
        path: &str,
        query: &[(String, String)],
        item: &str,
        page: u32,
        state: &RunState,
    ) -> Fetch {
        let policy = self.settings.retry;
        let mut retry = 0u32;

        loop {
            if let Some(limiter) = &self.settings.rate_limiter {
                tokio::select! {
                    acquired = limiter.acquire() => {
                        if let Err(e) = acquired {
                            return Fetch::Fatal(e.into());
                        }
                    }
                    _ = self.cancel.cancelled() => return Fetch::Cancelled,
                }
            }

            state.requests.fetch_add(1, Ordering::SeqCst);
            let request_metrics = HttpRequestMetrics::start(&self.table);
            let (error_type, retry_after, status, url, body) = match self.client.get(path, query).await {
                Ok(response) => {
                    request_metrics.record_complete(response.status.as_u16());
                    match RetryErrorType::from_status(response.status) {
                        None => return Fetch::Response(response),
                        Some(error_type) => (
                            error_type,
                            parse_retry_after(&response.headers),
                            Some(response.status),
                            response.url,
                            truncate_body(&response.body, BODY_LOG_LIMIT),
                        ),
                    }
                }
                Err(e) => {
                    request_metrics.record_transport_error();
                    (
                        RetryErrorType::from_transport(&e),
                        None,
                        None,
                        path.to_string(),
                        e.to_string(),
                    )
                }
            };

            let attempts = retry + 1;
            let failed = |failure: FailureKind, reason: String, url: String, body: String| {
                Fetch::Failed(Box::new(FailedFetch {
                    result: FetchAttemptResult {
                        item: item.to_string(),
                        url,
                        page,
                        status,
                        class: status.map_or(StatusClass::Transport, StatusClass::of),
                        body,
                        items: 0,
                        failure: Some(failure),
                    },
                    reason,
                }))
            };

            if !error_type.is_retryable() {
                let (failure, reason) = match error_type {
                    RetryErrorType::NotFound => (
                        FailureKind::NotFound,
                        format!("404 Not Found - resource likely deleted ({url})"),
                    ),
                    other => (
                        FailureKind::ClientError {
                            status: status.map_or(0, |s| s.as_u16()),
                        },
                        format!("{other} from {url}: {body}"),
                    ),
                };
                return failed(failure, reason, url, body);
            }

            if retry >= policy.max_retries {
                let reason = format!("{} ({url})", format_exhausted(attempts, error_type, &body));
                return failed(
                    FailureKind::RetryExhausted {
                        attempts,
                        last: error_type,
                    },
                    reason,
                    url,
                    body,
                );
            }

            let delay = policy.retry_delay(retry, retry_after);
            warn!(
                url = %url,
                page,
                attempt = attempts,
                status = ?status.map(|s| s.as_u16()),
                "{}",
                format_retry(attempts, policy.max_attempts(), error_type, delay, item)
            );
            state.retries.fetch_add(1, Ordering::SeqCst);
            metrics::record_retry_backoff(&self.table, delay);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => {
                    info!(page, "Cancelled during retry backoff");
                    return Fetch::Cancelled;
                }
            }
            retry += 1;
        }
    }
}

/// Canonical JSON form of a params object.
///
/// `serde_json` maps keep keys sorted, so equal params always produce the
/// same string.
pub fn params_key(params: &Value) -> String {
    params.to_string()
}
