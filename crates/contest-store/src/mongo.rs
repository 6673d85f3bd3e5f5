//! MongoDB-backed document store.

use crate::model::{Document, LogEntry};
use crate::store::DocumentStore;
use crate::{Result, StoreError};
use async_trait::async_trait;
use bson::{doc, Bson};
use mongodb::options::FindOneOptions;
use mongodb::{Client, Collection};
use serde_json::Value;

pub struct MongoStore {
    collection: Collection<bson::Document>,
}

impl MongoStore {
    pub async fn connect(uri: &str, database: &str, collection: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri).await?;
        Ok(Self {
            collection: client.database(database).collection(collection),
        })
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn insert_batch(&self, entries: Vec<LogEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let docs = entries
            .into_iter()
            .map(|entry| json_to_bson_document(entry.into_document()))
            .collect::<Result<Vec<_>>>()?;
        self.collection.insert_many(docs).await?;
        Ok(())
    }

    async fn find_one(&self, query: &Value) -> Result<Option<Document>> {
        let filter = json_to_bson_document(
            query
                .as_object()
                .ok_or_else(|| StoreError::InvalidQuery("query must be a JSON object".to_string()))?
                .clone(),
        )?;
        let options = FindOneOptions::builder().sort(doc! { "_id": -1 }).build();
        let found = self.collection.find_one(filter).with_options(options).await?;
        Ok(found.map(bson_to_json_document))
    }

    async fn count(&self, query: &Value) -> Result<u64> {
        let filter = json_to_bson_document(
            query
                .as_object()
                .ok_or_else(|| StoreError::InvalidQuery("query must be a JSON object".to_string()))?
                .clone(),
        )?;
        Ok(self.collection.count_documents(filter).await?)
    }
}

fn json_to_bson_document(doc: Document) -> Result<bson::Document> {
    let bson = bson::to_bson(&doc)?;
    match bson {
        Bson::Document(doc) => Ok(doc),
        _ => Err(StoreError::InvalidQuery(
            "document did not serialize to a BSON document".to_string(),
        )),
    }
}

fn bson_to_json_document(doc: bson::Document) -> Document {
    match serde_json::to_value(doc) {
        Ok(Value::Object(obj)) => obj,
        _ => Default::default(),
    }
}
