//! Unit tests for page advancement and URL rendering

use serde_json::json;
use stateful_collector::collector::strategy::{page_query, pages_for_count};
use stateful_collector::collector::template::TemplateContext;
use stateful_collector::collector::{PageHint, Pager, TemplateError, UrlTemplate};

/// Pages a collector would request for `total` items reported up front.
fn pages_visited(total: u64, size: u32) -> Vec<u32> {
    let hint = PageHint::TotalPages(pages_for_count(total, size));
    let mut pager = Some(Pager::first(size));
    let mut visited = Vec::new();
    let mut remaining = total;
    while let Some(current) = pager {
        visited.push(current.page);
        let on_page = remaining.min(u64::from(size)) as usize;
        remaining -= on_page as u64;
        pager = current.advance(&hint, on_page);
    }
    visited
}

#[test]
fn test_total_count_drives_page_count() {
    assert_eq!(pages_visited(0, 100), vec![1]);
    assert_eq!(pages_visited(100, 100), vec![1]);
    assert_eq!(pages_visited(101, 100), vec![1, 2]);
    assert_eq!(pages_visited(250, 100), vec![1, 2, 3]);
}

#[test]
fn test_pages_for_count_guards_zero_size() {
    assert_eq!(pages_for_count(5, 0), 5);
    assert_eq!(pages_for_count(0, 100), 0);
}

#[test]
fn test_page_query_carries_cursor_only_when_present() {
    let first = Pager::first(30);
    assert_eq!(
        page_query(&first),
        vec![
            ("page".to_string(), "1".to_string()),
            ("per_page".to_string(), "30".to_string())
        ]
    );

    let next = first
        .advance(&PageHint::NextCursor(Some("opaque".into())), 30)
        .unwrap();
    assert!(page_query(&next).contains(&("cursor".to_string(), "opaque".to_string())));
}

#[test]
fn test_template_renders_all_scopes() {
    let template = UrlTemplate::parse("repos/{params.name}/runs/{input.id}/jobs?page={pager.page}").unwrap();
    let params = json!({ "connection_id": 1, "name": "apache/devlake" });
    let input = json!({ "id": 42, "updated_at": null });
    let pager = Pager::first(100);

    let rendered = template
        .render(&TemplateContext {
            params: &params,
            input: &input,
            pager: &pager,
        })
        .unwrap();

    assert_eq!(rendered, "repos/apache/devlake/runs/42/jobs?page=1");
}

#[test]
fn test_template_errors() {
    assert!(matches!(
        UrlTemplate::parse("repos/{params.name"),
        Err(TemplateError::Unclosed(_))
    ));
    assert!(matches!(
        UrlTemplate::parse("repos/{secret.token}"),
        Err(TemplateError::UnknownScope(_))
    ));

    let template = UrlTemplate::parse("runs/{input.id}").unwrap();
    let pager = Pager::first(1);
    let missing = template.render(&TemplateContext {
        params: &json!({}),
        input: &json!({ "name": "x" }),
        pager: &pager,
    });
    assert_eq!(missing, Err(TemplateError::MissingField("input.id".to_string())));
}
