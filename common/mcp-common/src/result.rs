//! Accessors over raw `tools/call` responses
//!
//! Callers rarely know whether a tool answered with structured content, a
//! list of typed content blocks, or a bare string. [`CallResult`] lets them
//! ask for the shape they want and get `None` when it is not there.
//!
//! Lookup precedence for every accessor: structured content, then content
//! entries by declared type, then the raw value itself when it is a string.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool call response with shape-agnostic accessors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallResult {
    raw: Value,
}

impl From<Value> for CallResult {
    fn from(raw: Value) -> Self {
        Self { raw }
    }
}

impl CallResult {
    pub fn new(raw: Value) -> Self {
        Self { raw }
    }

    /// The response exactly as received
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn into_raw(self) -> Value {
        self.raw
    }

    /// Some transports nest the payload under `raw`; look there as well
    fn field(&self, key: &str) -> Option<&Value> {
        self.raw
            .get(key)
            .or_else(|| self.raw.get("raw").and_then(|r| r.get(key)))
            .filter(|v| !v.is_null())
    }

    /// Whether the tool flagged its own answer as an error
    pub fn is_error(&self) -> bool {
        self.field("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// The `structuredContent` object, if any
    pub fn structured_content(&self) -> Option<&Value> {
        self.field("structuredContent")
    }

    /// The `content` array, if any
    pub fn content(&self) -> Option<&Vec<Value>> {
        self.field("content").and_then(Value::as_array)
    }

    fn entries_of_type<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
        self.content()
            .into_iter()
            .flatten()
            .filter(move |entry| entry.get("type").and_then(Value::as_str) == Some(kind))
    }

    fn joined(&self, kind: &str, key: &str) -> Option<String> {
        let parts: Vec<&str> = self
            .entries_of_type(kind)
            .filter_map(|entry| entry.get(key).and_then(Value::as_str))
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n"))
        }
    }

    /// Plain text: structured string, joined `text` entries, or the raw string
    pub fn text(&self) -> Option<String> {
        if let Some(Value::String(s)) = self.structured_content() {
            return Some(s.clone());
        }
        if let Some(text) = self.joined("text", "text") {
            return Some(text);
        }
        self.raw.as_str().map(str::to_string)
    }

    /// Markdown: explicit `markdown` entries first, otherwise the text
    pub fn markdown(&self) -> Option<String> {
        if let Some(md) = self
            .joined("markdown", "markdown")
            .or_else(|| self.joined("markdown", "text"))
        {
            return Some(md);
        }
        self.text()
    }

    /// JSON: structured content, `json` entries, then text entries that parse
    pub fn json(&self) -> Option<Value> {
        if let Some(structured) = self.structured_content() {
            if let Value::String(s) = structured {
                if let Ok(parsed) = serde_json::from_str(s) {
                    return Some(parsed);
                }
            } else {
                return Some(structured.clone());
            }
        }
        if let Some(json) = self
            .entries_of_type("json")
            .find_map(|entry| entry.get("json").cloned())
        {
            return Some(json);
        }
        if let Some(parsed) = self
            .entries_of_type("text")
            .filter_map(|entry| entry.get("text").and_then(Value::as_str))
            .find_map(|text| serde_json::from_str::<Value>(text).ok())
        {
            return Some(parsed);
        }
        self.raw
            .as_str()
            .and_then(|s| serde_json::from_str(s).ok())
    }
}
