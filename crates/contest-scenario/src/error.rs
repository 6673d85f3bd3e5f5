//! Error types for scenario parsing and validation

use thiserror::Error;
use std::path::PathBuf;

#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error("failed to read scenario file {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse scenario yaml {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid scenario: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ScenarioError>;
