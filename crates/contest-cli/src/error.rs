use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("invalid host flag `{0}`: {1}")]
    BadHost(String, String),
    #[error("base directory must be absolute: {0}")]
    RelativeBaseDir(String),
    #[error("scenario error: {0}")]
    Scenario(#[from] contest_scenario::ScenarioError),
    #[error("host error: {0}")]
    Host(#[from] contest_host::HostError),
    #[error("store error: {0}")]
    Store(#[from] contest_store::StoreError),
    #[error("engine error: {0}")]
    Engine(#[from] contest_engine::EngineError),
    #[error("variable store error: {0}")]
    Vars(#[from] contest_vars::VarsError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid duration `{0}`")]
    BadDuration(String),
    #[error("timeout after {0}")]
    Timeout(String),
    #[error("{0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, CliError>;
