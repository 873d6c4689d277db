//! Declarative payload templates
//!
//! A template is any JSON tree whose strings may contain placeholders:
//!
//! - `{{name}}` required; a string that is exactly one placeholder keeps the
//!   bound value's JSON type, otherwise the value is spliced in as text
//! - `{{name?}}` optional; an unbound whole-string placeholder drops the
//!   enclosing object key or array element
//! - `{{name|fallback}}` substitutes `fallback` (parsed as JSON when possible)
//! - `{{_map_X}}` / `{{_extract_X}}` look the parameter `X` up in the mode's
//!   `value_mappings`
//! - `{{_chat_content}}` expands to a chat content array: one text part and
//!   one `image_url` part per attachment

use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{Map, Value, json};

use crate::error::{BatchboxError, Result};
use crate::types::Attachment;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*(\?)?\s*(?:\|([^}]*))?\}\}")
        .expect("placeholder pattern is valid")
});

/// Reserved composite placeholder
pub const CHAT_CONTENT: &str = "_chat_content";

const MAPPING_PREFIXES: [&str; 2] = ["_map_", "_extract_"];

/// Per-mode value mapping tables: mapping name -> (source value -> wire value)
pub type ValueMappings = BTreeMap<String, BTreeMap<String, Value>>;

/// Values a template is rendered against
#[derive(Debug, Clone)]
pub struct TemplateContext<'a> {
    vars: Map<String, Value>,
    attachments: &'a [Attachment],
}

impl<'a> TemplateContext<'a> {
    pub fn new(vars: Map<String, Value>, attachments: &'a [Attachment]) -> Self {
        Self { vars, attachments }
    }

    pub fn vars(&self) -> &Map<String, Value> {
        &self.vars
    }

    pub fn attachments(&self) -> &'a [Attachment] {
        self.attachments
    }

    fn bound(&self, name: &str) -> Option<&Value> {
        self.vars.get(name).filter(|v| !v.is_null())
    }
}

/// Output of [`TemplateEngine::render`]
#[derive(Debug, Clone)]
pub struct Rendered {
    pub body: Value,
    /// Attachments still to be sent as separate parts. Empty when
    /// `{{_chat_content}}` already inlined them into the body.
    pub attachments: Vec<Attachment>,
}

struct Placeholder<'t> {
    name: &'t str,
    optional: bool,
    default: Option<&'t str>,
}

impl<'t> Placeholder<'t> {
    fn from_captures(caps: &Captures<'t>) -> Option<Self> {
        Some(Self {
            name: caps.get(1)?.as_str(),
            optional: caps.get(2).is_some(),
            default: caps.get(3).map(|m| m.as_str().trim()),
        })
    }

    /// Mapping placeholders are implicitly optional
    fn is_optional(&self) -> bool {
        self.optional || self.name.starts_with('_')
    }
}

pub struct TemplateEngine<'m> {
    value_mappings: &'m ValueMappings,
}

impl<'m> TemplateEngine<'m> {
    pub fn new(value_mappings: &'m ValueMappings) -> Self {
        Self { value_mappings }
    }

    /// Render a template into a body plus the attachments still to be sent
    pub fn render(&self, template: &Value, ctx: &TemplateContext<'_>) -> Result<Rendered> {
        let body = self.render_value(template, ctx)?.unwrap_or(Value::Null);
        let inlined = uses_placeholder(template, CHAT_CONTENT);
        let attachments = if inlined {
            Vec::new()
        } else {
            ctx.attachments().to_vec()
        };
        Ok(Rendered { body, attachments })
    }

    /// Render one node; `None` means the node is dropped from its parent
    pub fn render_value(&self, template: &Value, ctx: &TemplateContext<'_>) -> Result<Option<Value>> {
        match template {
            Value::String(s) => self.render_string(s, ctx),
            Value::Object(map) => {
                let mut out = Map::new();
                for (key, value) in map {
                    if let Some(rendered) = self.render_value(value, ctx)? {
                        out.insert(key.clone(), rendered);
                    }
                }
                Ok(Some(Value::Object(out)))
            }
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    if let Some(rendered) = self.render_value(item, ctx)? {
                        out.push(rendered);
                    }
                }
                Ok(Some(Value::Array(out)))
            }
            other => Ok(Some(other.clone())),
        }
    }

    fn render_string(&self, template: &str, ctx: &TemplateContext<'_>) -> Result<Option<Value>> {
        // Whole-string placeholder keeps its type
        if let Some(caps) = PLACEHOLDER.captures(template)
            && let Some(whole) = caps.get(0)
            && whole.start() == 0
            && whole.end() == template.len()
            && let Some(placeholder) = Placeholder::from_captures(&caps)
        {
            return self.lookup(&placeholder, ctx);
        }

        if !PLACEHOLDER.is_match(template) {
            return Ok(Some(Value::String(template.to_string())));
        }

        let mut out = String::with_capacity(template.len());
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(template) {
            let (Some(whole), Some(placeholder)) = (caps.get(0), Placeholder::from_captures(&caps))
            else {
                continue;
            };
            out.push_str(&template[last..whole.start()]);
            if let Some(value) = self.lookup(&placeholder, ctx)? {
                out.push_str(&stringify(&value));
            }
            last = whole.end();
        }
        out.push_str(&template[last..]);
        Ok(Some(Value::String(out)))
    }

    fn lookup(&self, placeholder: &Placeholder<'_>, ctx: &TemplateContext<'_>) -> Result<Option<Value>> {
        let name = placeholder.name;
        let found = if name == CHAT_CONTENT {
            Some(chat_content(ctx))
        } else if name.starts_with('_') {
            self.mapped_value(name, ctx)
        } else {
            ctx.bound(name).cloned()
        };

        match (found, placeholder.default) {
            (Some(value), _) => Ok(Some(value)),
            (None, Some(default)) => Ok(Some(parse_default(default))),
            (None, None) if placeholder.is_optional() => Ok(None),
            (None, None) => Err(BatchboxError::template(
                format!("placeholder '{{{{{name}}}}}' has no bound value and no default"),
                Some(name),
            )),
        }
    }

    /// `_map_size` reads parameter `size` (or the first parameter whose value is a
    /// mapping key) and translates it; unmapped values pass through
    fn mapped_value(&self, name: &str, ctx: &TemplateContext<'_>) -> Option<Value> {
        let mapping = self.value_mappings.get(name)?;

        let direct = MAPPING_PREFIXES
            .iter()
            .find_map(|prefix| name.strip_prefix(prefix))
            .and_then(|param| ctx.bound(param));
        let source = direct.cloned().or_else(|| {
            ctx.vars()
                .values()
                .find(|v| v.as_str().is_some_and(|s| mapping.contains_key(s)))
                .cloned()
        })?;

        let key = stringify(&source);
        Some(mapping.get(&key).cloned().unwrap_or(source))
    }

    /// Every placeholder name used in a template
    pub fn extract_variables(template: &Value) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        collect_names(template, &mut names);
        names
    }
}

fn collect_names(template: &Value, names: &mut BTreeSet<String>) {
    match template {
        Value::String(s) => {
            for caps in PLACEHOLDER.captures_iter(s) {
                if let Some(name) = caps.get(1) {
                    names.insert(name.as_str().to_string());
                }
            }
        }
        Value::Object(map) => map.values().for_each(|v| collect_names(v, names)),
        Value::Array(items) => items.iter().for_each(|v| collect_names(v, names)),
        _ => {}
    }
}

fn uses_placeholder(template: &Value, name: &str) -> bool {
    match template {
        Value::String(s) => PLACEHOLDER
            .captures_iter(s)
            .any(|caps| caps.get(1).is_some_and(|m| m.as_str() == name)),
        Value::Object(map) => map.values().any(|v| uses_placeholder(v, name)),
        Value::Array(items) => items.iter().any(|v| uses_placeholder(v, name)),
        _ => false,
    }
}

fn chat_content(ctx: &TemplateContext<'_>) -> Value {
    let mut parts = Vec::with_capacity(ctx.attachments().len() + 1);
    if let Some(prompt) = ctx.bound("prompt").and_then(Value::as_str)
        && !prompt.is_empty()
    {
        parts.push(json!({"type": "text", "text": prompt}));
    }
    for attachment in ctx.attachments() {
        parts.push(json!({
            "type": "image_url",
            "image_url": {"url": attachment.data_url()}
        }));
    }
    Value::Array(parts)
}

fn parse_default(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Text form of a value for inline substitution and form fields
pub(crate) fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
