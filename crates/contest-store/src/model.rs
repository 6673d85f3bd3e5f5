//! Log entry parsing: turns a raw container log line into a storable document.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::{LazyLock, Mutex};
use ulid::Generator;

/// A document as stored and queried: a flat JSON object. The MongoDB backend
/// converts this to/from `bson::Document`; the in-memory backend uses it
/// directly.
pub type Document = Map<String, Value>;

static NESTED_ARRAY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[\s*\[").unwrap());

/// Shared across all entries so ids stay monotonic even when several are
/// generated within the same millisecond (the store relies on `_id` order to
/// find the most recently ingested match).
static ID_GENERATOR: LazyLock<Mutex<Generator>> = LazyLock::new(|| Mutex::new(Generator::new()));

fn next_id() -> String {
    ID_GENERATOR
        .lock()
        .unwrap()
        .generate()
        .expect("system clock moved backwards far enough to exhaust ulid generator")
        .to_string()
}

/// One log entry, either tied to a node's stdout/stderr or an internal
/// engine message (scheduler/engine progress, not attributed to any node).
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub id: String,
    pub node: Option<String>,
    pub stderr: Option<bool>,
    pub body: Document,
}

impl LogEntry {
    /// Parses a single log line for `node`, generating a fresh ULID id.
    ///
    /// Valid JSON lines are used as the document body (with nested arrays
    /// flattened into index-keyed maps when the raw text itself contains a
    /// nested array, since the document store cannot hold arrays of arrays).
    /// Non-JSON lines are wrapped as `{"text": line}`.
    pub fn parse(node: &str, stderr: bool, line: &str) -> Self {
        let body = match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(obj)) => {
                let value = if NESTED_ARRAY.is_match(line) {
                    arrays_to_maps(Value::Object(obj))
                } else {
                    Value::Object(obj)
                };
                match value {
                    Value::Object(obj) => obj,
                    _ => unreachable!("arrays_to_maps preserves object shape at the root"),
                }
            }
            _ => {
                let mut body = Map::new();
                body.insert("text".to_string(), Value::String(line.to_string()));
                body
            }
        };

        Self {
            id: next_id(),
            node: Some(node.to_string()),
            stderr: Some(stderr),
            body,
        }
    }

    /// An engine-internal message, not attributed to any node (scenario
    /// progress, fatal errors, synthetic exit notices).
    pub fn internal(msg: &str, error: Option<String>) -> Self {
        let mut body = Map::new();
        body.insert("msg".to_string(), Value::String(msg.to_string()));
        if let Some(error) = error {
            body.insert("error".to_string(), Value::String(error));
        }

        Self {
            id: next_id(),
            node: None,
            stderr: None,
            body,
        }
    }

    pub fn into_document(self) -> Document {
        let mut doc = self.body;
        doc.insert("_id".to_string(), Value::String(self.id));
        if let Some(node) = self.node {
            doc.insert("node".to_string(), Value::String(node));
        }
        if let Some(stderr) = self.stderr {
            doc.insert("stderr".to_string(), Value::Bool(stderr));
        }
        doc
    }
}

fn arrays_to_maps(value: Value) -> Value {
    match value {
        Value::Array(items) => {
            let mut map = Map::new();
            for (i, item) in items.into_iter().enumerate() {
                map.insert(i.to_string(), arrays_to_maps(item));
            }
            Value::Object(map)
        }
        Value::Object(obj) => {
            let mut out = Map::new();
            for (k, v) in obj {
                out.insert(k, arrays_to_maps(v));
            }
            Value::Object(out)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_line_merges_fields_at_top_level() {
        let entry = LogEntry::parse("no0", false, r#"{"x":{"a":1}}"#);
        assert_eq!(entry.node.as_deref(), Some("no0"));
        assert_eq!(entry.stderr, Some(false));
        let doc = entry.into_document();
        assert_eq!(doc["x"]["a"], 1);
    }

    #[test]
    fn non_json_line_wraps_as_text() {
        let entry = LogEntry::parse("no0", true, "hello");
        let doc = entry.into_document();
        assert_eq!(doc["text"], "hello");
        assert_eq!(doc["stderr"], true);
    }

    #[test]
    fn nested_arrays_are_flattened_to_index_maps() {
        let entry = LogEntry::parse("no0", false, r#"{"b":[[0,1],[2,3]]}"#);
        let doc = entry.into_document();
        assert_eq!(doc["b"]["0"]["0"], 0);
        assert_eq!(doc["b"]["0"]["1"], 1);
        assert_eq!(doc["b"]["1"]["0"], 2);
        assert_eq!(doc["b"]["1"]["1"], 3);
    }

    #[test]
    fn flat_arrays_are_left_alone() {
        let entry = LogEntry::parse("no0", false, r#"{"b":[0,1,2]}"#);
        let doc = entry.into_document();
        assert!(doc["b"].is_array());
    }
}
