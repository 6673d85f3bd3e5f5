//! Error types for host adapters and the host registry

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("failed to connect to container runtime: {0}")]
    Connection(String),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("ssh error: {0}")]
    Ssh(String),

    #[error("sftp error: {0}")]
    Sftp(String),

    #[error("unsupported or unrecognized architecture: {0}")]
    UnsupportedArch(String),

    #[error("no free port found on host")]
    NoFreePort,

    #[error("unknown host id: {0}")]
    UnknownHost(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid host url: {0}")]
    InvalidUrl(String),
}

pub type Result<T> = std::result::Result<T, HostError>;
