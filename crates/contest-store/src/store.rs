//! The document store contract shared by the in-memory and MongoDB backends.

use crate::model::{Document, LogEntry};
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert_batch(&self, entries: Vec<LogEntry>) -> Result<()>;

    /// Most recent match first.
    async fn find_one(&self, query: &Value) -> Result<Option<Document>>;

    async fn count(&self, query: &Value) -> Result<u64>;
}
