//! The three capabilities a stage plugs into the collector.
//!
//! [`CollectionStrategy`] replaces loose callback fields: `build_request`
//! produces query parameters for a page, `parse_response` turns a 2xx body into
//! items plus a pagination hint, and `classify_response` decides what happens
//! after every response, successful or not.

use super::client::ApiResponse;
use super::pager::{PageHint, Pager};
use super::FailureKind;
use reqwest::StatusCode;
use serde::de::Error as _;
use serde::Serialize;
use serde_json::value::RawValue;
use serde_json::Value;
use std::collections::HashMap;

/// An item that drives one fetch sequence.
pub trait CollectorInput: Serialize + Send + Sync + 'static {
    /// Stable identity used in raw keys, logs, and skip records.
    fn identity(&self) -> String;
}

impl CollectorInput for Value {
    fn identity(&self) -> String {
        match self.get("id") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => self.to_string(),
        }
    }
}

/// Everything `build_request` can look at.
#[derive(Debug)]
pub struct RequestData<'a, I> {
    /// Connection/entity selector
    pub params: &'a Value,
    /// Current input item
    pub input: &'a I,
    /// Current page state
    pub pager: &'a Pager,
}

/// Items extracted from one page.
#[derive(Debug)]
pub struct ParsedPage {
    /// Raw item payloads, untouched
    pub items: Vec<Box<RawValue>>,
    /// Pagination hint for the following page
    pub hint: PageHint,
}

/// A 2xx body that could not be parsed.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ParseError(pub String);

impl From<serde_json::Error> for ParseError {
    fn from(e: serde_json::Error) -> Self {
        Self(e.to_string())
    }
}

/// Coarse status class shown to `classify_response`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusClass {
    /// 2xx
    Success,
    /// 4xx and anything else that is neither 2xx nor 5xx
    ClientError,
    /// 5xx
    ServerError,
    /// No response
    Transport,
}

impl StatusClass {
    /// Class of an HTTP status
    pub fn of(status: StatusCode) -> Self {
        if status.is_success() {
            Self::Success
        } else if status.is_server_error() {
            Self::ServerError
        } else {
            Self::ClientError
        }
    }
}

/// Transient outcome of one page fetch.
#[derive(Debug, Clone)]
pub struct FetchAttemptResult {
    /// Identity of the input item
    pub item: String,
    /// URL path (or full URL once a response arrived)
    pub url: String,
    /// Page ordinal
    pub page: u32,
    /// Last status seen, if any response arrived
    pub status: Option<StatusCode>,
    /// Status class
    pub class: StatusClass,
    /// Response body, truncated for logging
    pub body: String,
    /// Items parsed from the page (0 on failure)
    pub items: usize,
    /// Why this page failed; `None` for a parsed 2xx page
    pub failure: Option<FailureKind>,
}

impl FetchAttemptResult {
    /// Whether this outcome is a parsed success
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// What the collector does after classifying a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Keep the page and paginate on. On a failed page this ends the item
    /// like `AbortItem`, since there is nothing to keep.
    Continue,
    /// Drop the item from this run's results
    SkipItem,
    /// Stop paginating this item; pages already written stay
    AbortItem,
    /// Fail the stage
    AbortAll,
}

/// Default failure policy.
///
/// 404, retry exhaustion and the page cap skip the item; any other client
/// error or an unparseable body fails the stage.
pub fn default_disposition(result: &FetchAttemptResult) -> Disposition {
    match &result.failure {
        None => Disposition::Continue,
        Some(
            FailureKind::NotFound
            | FailureKind::RetryExhausted { .. }
            | FailureKind::PageCapExceeded { .. }
            | FailureKind::UndecodableInput
            | FailureKind::SkippedByHook,
        ) => Disposition::SkipItem,
        Some(
            FailureKind::ClientError { .. }
            | FailureKind::ParseError
            | FailureKind::AbortedByHook,
        ) => Disposition::AbortAll,
    }
}

/// Stage-specific request building, parsing, and response classification.
pub trait CollectionStrategy<I>: Send + Sync {
    /// Query parameters for one page. Defaults to `page`/`per_page` plus
    /// `cursor` when the pager carries one.
    fn build_request(&self, request: &RequestData<'_, I>) -> Vec<(String, String)> {
        page_query(request.pager)
    }

    /// Extract items and the pagination hint from a 2xx response.
    fn parse_response(&self, response: &ApiResponse, pager: &Pager) -> Result<ParsedPage, ParseError>;

    /// Decide what to do with a page outcome.
    fn classify_response(&self, result: &FetchAttemptResult) -> Disposition {
        default_disposition(result)
    }
}

/// `page`/`per_page` query, with `cursor` when present.
pub fn page_query(pager: &Pager) -> Vec<(String, String)> {
    let mut query = vec![
        ("page".to_string(), pager.page.to_string()),
        ("per_page".to_string(), pager.size.to_string()),
    ];
    if let Some(cursor) = &pager.cursor {
        query.push(("cursor".to_string(), cursor.clone()));
    }
    query
}

/// Parse a body whose top level is the item array.
pub fn parse_item_array(body: &[u8]) -> Result<Vec<Box<RawValue>>, ParseError> {
    Ok(serde_json::from_slice(body)?)
}

/// Items and optional count from an object envelope.
#[derive(Debug)]
pub struct Envelope {
    /// Raw items of the array field
    pub items: Vec<Box<RawValue>>,
    /// Value of the count field, when requested and present
    pub total_count: Option<u64>,
}

/// Parse `{ "<items_field>": [...], "<count_field>": n, ... }`.
///
/// Unknown fields are ignored. A missing item field is an error, a missing
/// count field is not.
pub fn parse_envelope(
    body: &[u8],
    items_field: &str,
    count_field: Option<&str>,
) -> Result<Envelope, ParseError> {
    let fields: HashMap<String, Box<RawValue>> = serde_json::from_slice(body)?;
    let items_raw = fields.get(items_field).ok_or_else(|| {
        serde_json::Error::custom(format!("response has no `{items_field}` array"))
    })?;
    let items: Vec<Box<RawValue>> = serde_json::from_str(items_raw.get())?;
    let total_count = count_field
        .and_then(|field| fields.get(field))
        .map(|raw| serde_json::from_str::<u64>(raw.get()))
        .transpose()?;
    Ok(Envelope { items, total_count })
}

/// Number of pages needed for `count` items at `size` per page.
pub fn pages_for_count(count: u64, size: u32) -> u32 {
    let size = u64::from(size.max(1));
    u32::try_from(count.div_ceil(size)).unwrap_or(u32::MAX)
}
