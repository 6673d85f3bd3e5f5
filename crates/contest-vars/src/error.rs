//! Error types for the variable store and template compiler

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VarsError {
    #[error("wrong key format; path must start with `.`: {0}")]
    BadPath(String),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("unknown template function: {0}")]
    UnknownFunc(String),

    #[error("template function {name} failed: {source}")]
    FuncFailed {
        name: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("template parse error: {0}")]
    ParseError(String),

    #[error(
        "some variables are not replaced in template string, {line:?} (line: {line_no})"
    )]
    UnresolvedVariable { line: String, line_no: usize },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, VarsError>;
