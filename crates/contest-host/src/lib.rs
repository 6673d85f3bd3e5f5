//! Host adapters for the scenario engine: local containers over the Docker
//! socket, remote containers reached over SSH, and a registry that assigns
//! scenario nodes to hosts.

mod adapter;
mod docker;
mod error;
mod local;
mod registry;
mod remote;
mod ssh;
mod types;

pub use adapter::{HostAdapter, OnExit};
pub use docker::DockerClient;
pub use error::*;
pub use local::LocalHost;
pub use registry::HostRegistry;
pub use remote::RemoteHost;
pub use types::*;

/// Prefix applied to every container name the engine manages, used on
/// startup to find and reclaim containers left behind by a crashed run.
pub const CONTAINER_LABEL_PREFIX: &str = "contest-";
