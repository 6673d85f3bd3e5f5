//! Local host adapter: runs commands via a subshell, reaches the Docker
//! daemon over its default socket, uploads via a plain filesystem copy.

use crate::adapter::{HostAdapter, OnExit};
use crate::docker::DockerClient;
use crate::types::{CommandOutput, ContainerSpec, ContainerState, ExitResult, LogChunk, Network};
use crate::{CONTAINER_LABEL_PREFIX, HostError, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::{HashMap, HashSet};
use std::net::{TcpListener, UdpSocket};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tokio::process::Command;

const SUPPORTED_ARCHES: &[&str] = &["Linux x86_64", "Linux aarch64", "Linux armv7l"];

pub struct LocalHost {
    address: String,
    publish_address: OnceLock<String>,
    arch: OnceLock<String>,
    base_dir: PathBuf,
    docker: DockerClient,
    containers: Mutex<HashMap<String, String>>,
    ports: Mutex<HashMap<String, u16>>,
    issued_ports: Mutex<HashSet<u16>>,
    files: Mutex<HashMap<String, PathBuf>>,
}

impl LocalHost {
    /// `socket` overrides the default Docker unix socket, as given by a
    /// `unix://<path>` host flag.
    pub fn new(address: impl Into<String>, base_dir: PathBuf, socket: Option<&str>) -> Result<Self> {
        let docker = match socket {
            Some(path) => DockerClient::connect_socket(path)?,
            None => DockerClient::connect_local()?,
        };
        Ok(Self {
            address: address.into(),
            publish_address: OnceLock::new(),
            arch: OnceLock::new(),
            base_dir,
            docker,
            containers: Mutex::new(HashMap::new()),
            ports: Mutex::new(HashMap::new()),
            issued_ports: Mutex::new(HashSet::new()),
            files: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl HostAdapter for LocalHost {
    fn address(&self) -> &str {
        self.publish_address.get().map(String::as_str).unwrap_or(&self.address)
    }

    fn set_publish_address(&self, addr: String) {
        let _ = self.publish_address.set(addr);
    }

    fn arch(&self) -> &str {
        self.arch.get().map(String::as_str).unwrap_or("")
    }

    fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn file(&self, logical_name: &str) -> Option<PathBuf> {
        self.files.lock().unwrap().get(logical_name).cloned()
    }

    async fn prepare(&self) -> Result<()> {
        self.docker.ping().await?;

        for (name, id) in self
            .docker
            .list_by_label_prefix(CONTAINER_LABEL_PREFIX)
            .await?
        {
            let _ = self.docker.stop_container(&id, 1).await;
            let _ = self.docker.remove_container(&id, true).await;
            tracing::debug!(name, "removed stale container");
        }

        std::fs::create_dir_all(&self.base_dir)?;
        std::fs::set_permissions(&self.base_dir, std::fs::Permissions::from_mode(0o700))?;

        let output = Command::new("uname").arg("-sm").output().await?;
        let reported = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !SUPPORTED_ARCHES.contains(&reported.as_str()) {
            return Err(HostError::UnsupportedArch(reported));
        }
        let _ = self.arch.set(
            reported
                .rsplit(' ')
                .next()
                .unwrap_or_default()
                .to_string(),
        );

        Ok(())
    }

    async fn create_container(&self, name: &str, spec: &ContainerSpec) -> Result<()> {
        if self.containers.lock().unwrap().contains_key(name) {
            return Ok(());
        }
        let id = self.docker.create_container(name, spec).await?;
        self.containers.lock().unwrap().insert(name.to_string(), id);
        Ok(())
    }

    async fn start_container(&self, name: &str, on_exit: Option<OnExit>) -> Result<()> {
        let id = self
            .containers
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| HostError::ContainerNotFound(name.to_string()))?;

        self.docker.start_container(&id).await?;

        if let Some(on_exit) = on_exit {
            let docker = self.docker.clone();
            tokio::spawn(async move {
                match docker.wait(&id).await {
                    Ok(code) => on_exit(ExitResult {
                        exit_code: code,
                        error: None,
                        cancelled: false,
                    }),
                    Err(e) => on_exit(ExitResult {
                        exit_code: None,
                        error: Some(e.to_string()),
                        cancelled: false,
                    }),
                }
            });
        }
        Ok(())
    }

    async fn stop_container(&self, name: &str, timeout: Option<u32>) -> Result<()> {
        let id = self.containers.lock().unwrap().get(name).cloned();
        let Some(id) = id else {
            return Ok(());
        };
        match self.docker.stop_container(&id, timeout.unwrap_or(1)).await {
            Ok(()) => Ok(()),
            Err(HostError::Runtime(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn remove_container(&self, name: &str, force: bool) -> Result<()> {
        let id = self.containers.lock().unwrap().remove(name);
        let Some(id) = id else {
            return Ok(());
        };
        self.docker.remove_container(&id, force).await
    }

    async fn container_logs(&self, name: &str) -> Result<BoxStream<'static, Result<LogChunk>>> {
        use futures::StreamExt;
        let id = self
            .containers
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| HostError::ContainerNotFound(name.to_string()))?;
        let docker = self.docker.clone();
        // Boxing owns the client for the stream's lifetime.
        let stream = async_stream::stream! {
            let docker = docker;
            let mut inner = docker.logs(&id);
            while let Some(item) = inner.next().await {
                yield item;
            }
        };
        Ok(Box::pin(stream))
    }

    async fn exists_container(&self, name: &str) -> Result<Option<(String, ContainerState)>> {
        let id = self.containers.lock().unwrap().get(name).cloned();
        let Some(id) = id else {
            return Ok(None);
        };
        self.docker.inspect_state(&id).await
    }

    async fn free_port(&self, id: &str, network: Network) -> Result<u16> {
        if let Some(port) = self.ports.lock().unwrap().get(id) {
            return Ok(*port);
        }

        let port = match network {
            Network::Tcp => {
                let listener = TcpListener::bind("127.0.0.1:0")?;
                listener.local_addr()?.port()
            }
            Network::Udp => {
                let socket = UdpSocket::bind("127.0.0.1:0")?;
                socket.local_addr()?.port()
            }
        };

        self.ports.lock().unwrap().insert(id.to_string(), port);
        self.issued_ports.lock().unwrap().insert(port);
        Ok(port)
    }

    async fn upload(
        &self,
        data: Vec<u8>,
        logical_name: &str,
        dest: &str,
        mode: u32,
    ) -> Result<()> {
        let path = self.base_dir.join(dest);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, &data)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))?;
        self.files
            .lock()
            .unwrap()
            .insert(logical_name.to_string(), path);
        Ok(())
    }

    async fn mkdir(&self, dest: &str, mode: u32) -> Result<()> {
        let path = self.base_dir.join(dest);
        std::fs::create_dir_all(&path)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    async fn run_command(&self, cmd: &str) -> Result<CommandOutput> {
        let output = Command::new("sh").arg("-c").arg(cmd).output().await?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            exit_ok: output.status.success(),
        })
    }

    async fn collect_result(&self, output_path: &Path) -> Result<()> {
        let file = std::fs::File::create(output_path)?;
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut tar = tar::Builder::new(encoder);
        tar.append_dir_all(".", &self.base_dir)?;
        tar.into_inner()?.finish()?;
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.docker.pull_if_absent(image).await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
