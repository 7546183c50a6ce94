//! URL path templates.
//!
//! A template is a path with `{scope.field}` placeholders, for example
//! `repos/{params.name}/actions/runs/{input.id}/jobs`. Scopes:
//!
//! - `params`: the connection/entity selector object
//! - `input`: the serialized current input item (nested fields with dots)
//! - `pager`: `page`, `size` or `cursor` of the current page
//!
//! Templates are parsed once when the collector is built; rendering a
//! placeholder whose value is missing or not a scalar is an error. Values are
//! substituted verbatim, so `owner/repo` stays a two-segment path.

use super::pager::Pager;
use serde_json::Value;
use std::fmt;

/// Template parse and render errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    /// A `{` without a matching `}`
    #[error("unclosed placeholder in template {0:?}")]
    Unclosed(String),

    /// Placeholder with no field, e.g. `{}` or `{input}`
    #[error("empty placeholder in template {0:?}")]
    Empty(String),

    /// Scope other than params, input, pager
    #[error("unknown placeholder scope {0:?}")]
    UnknownScope(String),

    /// Value absent or null at render time
    #[error("no value for placeholder {{{0}}}")]
    MissingField(String),

    /// Value is an object or array
    #[error("placeholder {{{0}}} does not resolve to a scalar")]
    NotScalar(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Params,
    Input,
    Pager,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder {
        scope: Scope,
        path: Vec<String>,
        source: String,
    },
}

/// Values a template is rendered against.
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    /// Connection/entity selector
    pub params: &'a Value,
    /// Serialized input item
    pub input: &'a Value,
    /// Current page state
    pub pager: &'a Pager,
}

/// Parsed URL template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl UrlTemplate {
    /// Parse `template`.
    pub fn parse(template: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after_open = &rest[open + 1..];
            let close = after_open
                .find('}')
                .ok_or_else(|| TemplateError::Unclosed(template.to_string()))?;
            let placeholder = after_open[..close].trim();

            let mut parts = placeholder.split('.').map(str::trim);
            let scope = match parts.next() {
                Some("params") => Scope::Params,
                Some("input") => Scope::Input,
                Some("pager") => Scope::Pager,
                Some("") | None => return Err(TemplateError::Empty(template.to_string())),
                Some(other) => return Err(TemplateError::UnknownScope(other.to_string())),
            };
            let path: Vec<String> = parts.map(str::to_string).collect();
            if path.is_empty() || path.iter().any(String::is_empty) {
                return Err(TemplateError::Empty(template.to_string()));
            }
            segments.push(Segment::Placeholder {
                scope,
                path,
                source: placeholder.to_string(),
            });
            rest = &after_open[close + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self {
            source: template.to_string(),
            segments,
        })
    }

    /// Template text as given to [`UrlTemplate::parse`]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Substitute every placeholder.
    pub fn render(&self, ctx: &TemplateContext<'_>) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.source.len() + 16);
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder {
                    scope,
                    path,
                    source,
                } => {
                    let value = match scope {
                        Scope::Params => lookup(ctx.params, path, source)?,
                        Scope::Input => lookup(ctx.input, path, source)?,
                        Scope::Pager => pager_field(ctx.pager, path, source)?,
                    };
                    out.push_str(&value);
                }
            }
        }
        Ok(out)
    }
}

impl fmt::Display for UrlTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn lookup(root: &Value, path: &[String], source: &str) -> Result<String, TemplateError> {
    let mut current = root;
    for key in path {
        current = current
            .get(key.as_str())
            .ok_or_else(|| TemplateError::MissingField(source.to_string()))?;
    }
    match current {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Err(TemplateError::MissingField(source.to_string())),
        Value::Array(_) | Value::Object(_) => Err(TemplateError::NotScalar(source.to_string())),
    }
}

fn pager_field(pager: &Pager, path: &[String], source: &str) -> Result<String, TemplateError> {
    match path {
        [field] if field == "page" => Ok(pager.page.to_string()),
        [field] if field == "size" => Ok(pager.size.to_string()),
        [field] if field == "cursor" => pager
            .cursor
            .clone()
            .ok_or_else(|| TemplateError::MissingField(source.to_string())),
        _ => Err(TemplateError::MissingField(source.to_string())),
    }
}
