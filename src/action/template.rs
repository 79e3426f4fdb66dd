//! `{{ path }}` substitution for action targets.
//!
//! Supported paths:
//! - `data.<label>`: a label of the triggering event; everything after `data.` is the key
//! - `event.name`, `event.source.namespace`, `event.source.name`
//! - `target.<a.b.0.c>`: a field of the live object (patch templates only)
//!
//! There is no control flow. Unknown paths and missing values are errors, never empty strings.
//!
//! Structured templates go through [`render_value`]: the document is parsed first and
//! directives are expanded inside string leaves only, so a substituted value can never
//! add keys or change the shape of the document. Rendered object names pass through
//! [`object_name`] or [`label`] before they reach the cluster.

use crate::error::{Error, Result};
use crate::event::Event;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

lazy_static! {
    /// Any `{{ ... }}` directive
    static ref DIRECTIVE: Regex = Regex::new(r"\{\{(.*?)\}\}").unwrap();

    /// A well-formed path inside a directive
    static ref PATH: Regex = Regex::new(r"^[A-Za-z_][\w.\-/]*$").unwrap();

    /// RFC 1123 label
    static ref LABEL: Regex = Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap();

    /// RFC 1123 subdomain
    static ref SUBDOMAIN: Regex =
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap();
}

const MAX_LABEL_LENGTH: usize = 63;
const MAX_SUBDOMAIN_LENGTH: usize = 253;

/// Values a template may read.
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    pub event: &'a Event,
    pub target: Option<&'a Value>,
}

impl<'a> TemplateContext<'a> {
    pub fn new(event: &'a Event) -> Self {
        Self {
            event,
            target: None,
        }
    }

    #[must_use]
    pub fn with_target(mut self, target: &'a Value) -> Self {
        self.target = Some(target);
        self
    }
}

/// Expands every directive in `template`.
pub fn render(template: &str, context: &TemplateContext<'_>) -> Result<String> {
    let mut rendered = String::with_capacity(template.len());
    let mut last = 0;

    for directive in DIRECTIVE.captures_iter(template) {
        let (Some(whole), Some(inner)) = (directive.get(0), directive.get(1)) else {
            continue;
        };
        let path = inner.as_str().trim();
        if !PATH.is_match(path) {
            return Err(Error::TemplateError(format!(
                "malformed directive '{}'",
                whole.as_str()
            )));
        }

        rendered.push_str(&template[last..whole.start()]);
        rendered.push_str(&resolve(path, context)?);
        last = whole.end();
    }

    rendered.push_str(&template[last..]);
    Ok(rendered)
}

/// Expands directives in every string of a parsed document, keys included.
pub fn render_value(value: &Value, context: &TemplateContext<'_>) -> Result<Value> {
    Ok(match value {
        Value::String(s) => Value::String(render(s, context)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| render_value(item, context))
                .collect::<Result<_>>()?,
        ),
        Value::Object(map) => {
            let mut rendered = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                rendered.insert(render(key, context)?, render_value(item, context)?);
            }
            Value::Object(rendered)
        }
        other => other.clone(),
    })
}

/// Renders `template` and checks the result is a valid object name (RFC 1123 subdomain).
pub fn object_name(field: &str, template: &str, context: &TemplateContext<'_>) -> Result<String> {
    let rendered = render(template, context)?;
    if rendered.len() > MAX_SUBDOMAIN_LENGTH || !SUBDOMAIN.is_match(&rendered) {
        return Err(Error::TemplateError(format!(
            "{field} {rendered:?} is not a valid object name"
        )));
    }
    Ok(rendered)
}

/// Renders `template` and checks the result is an RFC 1123 label, as namespaces
/// and container names must be.
pub fn label(field: &str, template: &str, context: &TemplateContext<'_>) -> Result<String> {
    let rendered = render(template, context)?;
    if rendered.len() > MAX_LABEL_LENGTH || !LABEL.is_match(&rendered) {
        return Err(Error::TemplateError(format!(
            "{field} {rendered:?} is not a valid RFC 1123 label"
        )));
    }
    Ok(rendered)
}

/// Namespace of a target that may be cluster-scoped: an empty template stays empty.
pub fn scope(template: &str, context: &TemplateContext<'_>) -> Result<String> {
    if template.is_empty() {
        return Ok(String::new());
    }
    label("namespace", template, context)
}

fn resolve(path: &str, context: &TemplateContext<'_>) -> Result<String> {
    let event = context.event;
    match path {
        "event.name" => Ok(event.name.clone()),
        "event.source.namespace" => Ok(event.source.namespace.clone()),
        "event.source.name" => Ok(event.source.name.clone()),
        _ => {
            if let Some(label) = path.strip_prefix("data.") {
                return event.data.get(label).cloned().ok_or_else(|| {
                    Error::TemplateError(format!("event has no label '{label}'"))
                });
            }
            if let Some(field) = path.strip_prefix("target.") {
                let target = context.target.ok_or_else(|| {
                    Error::TemplateError(format!(
                        "'{path}' is only available in patch templates"
                    ))
                })?;
                return lookup(target, field).map(scalar).ok_or_else(|| {
                    Error::TemplateError(format!("target has no field '{field}'"))
                });
            }
            Err(Error::TemplateError(format!("unknown path '{path}'")))
        }
    }
}

fn lookup<'v>(value: &'v Value, field: &str) -> Option<&'v Value> {
    field.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Strings are inserted bare; anything else as compact JSON.
fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
