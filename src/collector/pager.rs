//! Page state and page-to-page advancement.

use reqwest::header::{HeaderMap, LINK};

/// Pagination state for one page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pager {
    /// 1-based page ordinal; also the raw record's page key
    pub page: u32,
    /// Requested page size
    pub size: u32,
    /// Upstream cursor for cursor-paginated APIs
    pub cursor: Option<String>,
}

/// What a parsed page says about the pages after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageHint {
    /// The response reports the total number of pages
    TotalPages(u32),
    /// The response embeds the next cursor; `None` means last page
    NextCursor(Option<String>),
    /// Nothing reported: continue while pages come back full
    Unknown,
}

impl Pager {
    /// First page
    pub fn first(size: u32) -> Self {
        Self {
            page: 1,
            size,
            cursor: None,
        }
    }

    /// State for the next page, or `None` when this was the last one.
    pub fn advance(&self, hint: &PageHint, items_on_page: usize) -> Option<Pager> {
        let next = |cursor: Option<String>| Pager {
            page: self.page + 1,
            size: self.size,
            cursor,
        };
        match hint {
            PageHint::TotalPages(total) => {
                (items_on_page > 0 && self.page < *total).then(|| next(None))
            }
            PageHint::NextCursor(Some(cursor)) => {
                // A cursor that points back at this page would loop forever.
                (self.cursor.as_deref() != Some(cursor.as_str())).then(|| next(Some(cursor.clone())))
            }
            PageHint::NextCursor(None) => None,
            PageHint::Unknown => {
                (items_on_page > 0 && items_on_page >= self.size as usize).then(|| next(None))
            }
        }
    }
}

/// Total pages from an RFC 8288 `Link` header's `rel="last"` entry.
///
/// Returns `None` when there is no `last` link (single page responses).
pub fn total_pages_from_link(headers: &HeaderMap) -> Option<u32> {
    let link = headers.get(LINK)?.to_str().ok()?;
    link.split(',').find_map(|entry| {
        let mut parts = entry.split(';');
        let target = parts.next()?.trim().strip_prefix('<')?.strip_suffix('>')?;
        let is_last = parts.any(|p| {
            let p = p.trim();
            p == r#"rel="last""# || p == "rel=last"
        });
        if !is_last {
            return None;
        }
        let query = target.split_once('?')?.1;
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "page")
            .and_then(|(_, value)| value.parse().ok())
    })
}
