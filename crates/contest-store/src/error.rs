//! Error types for the log store

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("mongodb error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("bson serialization error: {0}")]
    Bson(#[from] bson::ser::Error),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("host error: {0}")]
    Host(#[from] contest_host::HostError),
}

pub type Result<T> = std::result::Result<T, StoreError>;
