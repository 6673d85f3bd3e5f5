//! In-memory document store: used by tests and any run without `--mongodb`.
//!
//! Implements the small slice of MongoDB-style query operators the condition
//! language in the engine actually needs: dotted-field equality (default, aka
//! `$eq`), and `$gt`/`$gte`/`$lt`/`$lte` comparisons.

use crate::model::{Document, LogEntry};
use crate::store::DocumentStore;
use crate::{Result, StoreError};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<Vec<Document>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert_batch(&self, entries: Vec<LogEntry>) -> Result<()> {
        let mut docs = self.docs.write().await;
        for entry in entries {
            docs.push(entry.into_document());
        }
        Ok(())
    }

    async fn find_one(&self, query: &Value) -> Result<Option<Document>> {
        let query = query_object(query)?;
        let docs = self.docs.read().await;
        let found = docs
            .iter()
            .filter(|doc| matches(doc, query))
            .max_by(|a, b| id_of(a).cmp(id_of(b)));
        Ok(found.cloned())
    }

    async fn count(&self, query: &Value) -> Result<u64> {
        let query = query_object(query)?;
        let docs = self.docs.read().await;
        Ok(docs.iter().filter(|doc| matches(doc, query)).count() as u64)
    }
}

fn query_object(query: &Value) -> Result<&serde_json::Map<String, Value>> {
    query
        .as_object()
        .ok_or_else(|| StoreError::InvalidQuery("query must be a JSON object".to_string()))
}

fn id_of(doc: &Document) -> &str {
    doc.get("_id").and_then(Value::as_str).unwrap_or("")
}

fn matches(doc: &Document, query: &serde_json::Map<String, Value>) -> bool {
    query.iter().all(|(path, expected)| {
        let actual = field_at(doc, path);
        match expected {
            Value::Object(ops) if is_comparison_object(ops) => {
                ops.iter().all(|(op, rhs)| compare(actual, op, rhs))
            }
            other => actual == Some(other),
        }
    })
}

fn is_comparison_object(obj: &serde_json::Map<String, Value>) -> bool {
    !obj.is_empty()
        && obj
            .keys()
            .all(|k| matches!(k.as_str(), "$eq" | "$gt" | "$gte" | "$lt" | "$lte"))
}

fn compare(actual: Option<&Value>, op: &str, expected: &Value) -> bool {
    let Some(actual) = actual else {
        return false;
    };
    match op {
        "$eq" => actual == expected,
        _ => match (actual.as_f64(), expected.as_f64()) {
            (Some(a), Some(b)) => match op {
                "$gt" => a > b,
                "$gte" => a >= b,
                "$lt" => a < b,
                "$lte" => a <= b,
                _ => false,
            },
            _ => false,
        },
    }
}

fn field_at<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut current = doc.get(path.split('.').next()?)?;
    let mut parts = path.split('.');
    parts.next();
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(node: &str, line: &str) -> LogEntry {
        LogEntry::parse(node, false, line)
    }

    #[tokio::test]
    async fn equality_query_matches_dotted_path() {
        let store = MemoryStore::new();
        store
            .insert_batch(vec![entry("no0", r#"{"x":{"a":1}}"#)])
            .await
            .unwrap();

        let query: Value = serde_json::from_str(r#"{"x.a": 1}"#).unwrap();
        let found = store.find_one(&query).await.unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn gt_operator_filters_out_non_matching() {
        let store = MemoryStore::new();
        store
            .insert_batch(vec![
                entry("no0", r#"{"x":{"kind":"block"}}"#),
                entry("no0", r#"{"x":{"kind":"block"}}"#),
                entry("no0", r#"{"x":{"kind":"block"}}"#),
            ])
            .await
            .unwrap();

        let query: Value = serde_json::from_str(r#"{"x.kind": "block"}"#).unwrap();
        assert_eq!(store.count(&query).await.unwrap(), 3);

        let gt_query: Value = serde_json::from_str(r#"{"x.kind": {"$eq": "missing"}}"#).unwrap();
        assert_eq!(store.count(&gt_query).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn find_one_returns_most_recently_inserted_match() {
        let store = MemoryStore::new();
        store
            .insert_batch(vec![entry("no0", r#"{"seq":1}"#)])
            .await
            .unwrap();
        store
            .insert_batch(vec![entry("no0", r#"{"seq":2}"#)])
            .await
            .unwrap();

        let query: Value = serde_json::from_str(r#"{"node": "no0"}"#).unwrap();
        let found = store.find_one(&query).await.unwrap().unwrap();
        assert_eq!(found["seq"], 2);
    }
}
