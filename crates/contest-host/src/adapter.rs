//! The `HostAdapter` trait: one interface, local and remote implementations.

use crate::types::{CommandOutput, ContainerSpec, ContainerState, ExitResult, LogChunk, Network};
use crate::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::path::Path;

/// Invoked exactly once when a started container exits, whether normally,
/// abnormally, or because the run was cancelled.
pub type OnExit = Box<dyn FnOnce(ExitResult) + Send>;

/// A host capable of running containers and shell commands, local or
/// reached over SSH. `prepare` must run once before any other method.
#[async_trait]
pub trait HostAdapter: Send + Sync {
    /// Address this host was constructed from (as given on the command line).
    fn address(&self) -> &str;

    /// Overrides the address other hosts should use to reach this one, once
    /// discovered (mixed local/remote runs resolve this via `SSH_CONNECTION`
    /// during prepare). No-op unless a host implements it.
    fn set_publish_address(&self, _addr: String) {}

    /// ELF machine tag detected during `prepare` (e.g. `x86_64`, `aarch64`).
    fn arch(&self) -> &str;

    /// Base working directory for this run (`<configured>/<ULID>`).
    fn base_dir(&self) -> &Path;

    /// Absolute path previously registered under `logical_name` by `upload`.
    fn file(&self, logical_name: &str) -> Option<std::path::PathBuf>;

    /// Remove stale managed containers, create the base directory, detect
    /// architecture, record the invoking user. Must run exactly once.
    async fn prepare(&self) -> Result<()>;

    /// Idempotent on `name`: a no-op if already tracked.
    async fn create_container(&self, name: &str, spec: &ContainerSpec) -> Result<()>;

    /// Fails if `name` isn't tracked. `on_exit`, if given, fires exactly once.
    async fn start_container(&self, name: &str, on_exit: Option<OnExit>) -> Result<()>;

    /// Stop with a grace period (default 1s), tolerating an already-stopped
    /// container.
    async fn stop_container(&self, name: &str, timeout: Option<u32>) -> Result<()>;

    /// Missing name is not an error.
    async fn remove_container(&self, name: &str, force: bool) -> Result<()>;

    async fn container_logs(&self, name: &str) -> Result<BoxStream<'static, Result<LogChunk>>>;

    async fn exists_container(&self, name: &str) -> Result<Option<(String, ContainerState)>>;

    /// Cached per `id`: repeat calls with the same `id` return the same port.
    async fn free_port(&self, id: &str, network: Network) -> Result<u16>;

    /// Writes under the base directory; registers `logical_name` in the
    /// host's file registry; chmods to `mode`.
    async fn upload(&self, data: Vec<u8>, logical_name: &str, dest: &str, mode: u32)
        -> Result<()>;

    async fn mkdir(&self, dest: &str, mode: u32) -> Result<()>;

    async fn run_command(&self, cmd: &str) -> Result<CommandOutput>;

    /// Streams a tar of the base directory to `output_path`.
    async fn collect_result(&self, output_path: &Path) -> Result<()>;

    /// Pull `image` if the host doesn't already have it.
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Best-effort teardown: close runtime/SSH clients.
    async fn close(&self) -> Result<()>;
}
