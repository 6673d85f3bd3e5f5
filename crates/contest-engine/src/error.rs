//! Error types for the expectation engine and action dispatcher

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("variable store error: {0}")]
    Vars(#[from] contest_vars::VarsError),

    #[error("scenario error: {0}")]
    Scenario(#[from] contest_scenario::ScenarioError),

    #[error("host error: {0}")]
    Host(#[from] contest_host::HostError),

    #[error("store error: {0}")]
    Store(#[from] contest_store::StoreError),

    #[error("invalid scenario: {0}")]
    Validation(String),

    #[error("unknown action type: {0}")]
    UnknownAction(String),

    #[error("unknown host: {0}")]
    UnknownHost(String),

    #[error("invalid duration: {0}")]
    InvalidDuration(String),

    #[error("invalid comparison expression: {0}")]
    InvalidComparison(String),

    #[error("host command failed: {0}")]
    CommandFailed(String),

    #[error("contest stopped: {0}")]
    Stopped(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
