//! Remote host adapter: runs commands and uploads over SSH, points a Docker
//! client at the daemon's TCP endpoint.

use crate::adapter::{HostAdapter, OnExit};
use crate::docker::DockerClient;
use crate::ssh::SshClient;
use crate::types::{CommandOutput, ContainerSpec, ContainerState, ExitResult, LogChunk, Network};
use crate::{CONTAINER_LABEL_PREFIX, HostError, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

const SUPPORTED_ARCHES: &[&str] = &["Linux x86_64", "Linux aarch64", "Linux armv7l"];

/// Kernel local port range, used to bound the random candidate search for
/// remote free-port discovery.
const PORT_RANGE_PATH: &str = "/proc/sys/net/ipv4/ip_local_port_range";

pub struct RemoteHost {
    address: String,
    ssh: SshClient,
    arch: OnceLock<String>,
    base_dir: PathBuf,
    docker: DockerClient,
    containers: Mutex<HashMap<String, String>>,
    ports: Mutex<HashMap<String, u16>>,
    issued_ports: Mutex<HashSet<u16>>,
    files: Mutex<HashMap<String, PathBuf>>,
}

impl RemoteHost {
    pub fn new(
        address: impl Into<String>,
        user: impl Into<String>,
        docker_addr: impl Into<String>,
        base_dir: PathBuf,
    ) -> Result<Self> {
        let address = address.into();
        let docker_addr = docker_addr.into();
        Ok(Self {
            ssh: SshClient::new(address.clone(), user.into()),
            docker: DockerClient::connect_tcp(&docker_addr)?,
            address,
            arch: OnceLock::new(),
            base_dir,
            containers: Mutex::new(HashMap::new()),
            ports: Mutex::new(HashMap::new()),
            issued_ports: Mutex::new(HashSet::new()),
            files: Mutex::new(HashMap::new()),
        })
    }

    fn freeport_shell(&self, network: Network, exclude: &HashSet<u16>) -> String {
        let ss_flag = match network {
            Network::Tcp => "-Htan",
            Network::Udp => "-Huan",
        };
        let exclude_list = exclude
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(",");

        format!(
            r#"read -r lo hi < {PORT_RANGE_PATH}
used=$(ss {ss_flag} | awk '{{print $4}}' | sed -E 's/.*:([0-9]+)$/\1/' | sort -un)
exclude="{exclude_list}"
for p in $(seq "$lo" "$hi" | shuf); do
  if ! echo "$used" | grep -qx "$p" && ! echo ",$exclude," | grep -q ",$p,"; then
    echo "$p"
    exit 0
  fi
done
exit 1
"#
        )
    }
}

#[async_trait]
impl HostAdapter for RemoteHost {
    fn address(&self) -> &str {
        &self.address
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

        let (stdout, _, ok) = self.ssh.exec("uname -sm").await?;
        if !ok || !SUPPORTED_ARCHES.contains(&stdout.as_str()) {
            return Err(HostError::UnsupportedArch(stdout));
        }
        let _ = self
            .arch
            .set(stdout.rsplit(' ').next().unwrap_or_default().to_string());

        self.ssh
            .mkdir(&self.base_dir.to_string_lossy())
            .await
            .or_else(|e| match e {
                HostError::Sftp(_) => Ok(()),
                e => Err(e),
            })?;

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

        let exclude = self.issued_ports.lock().unwrap().clone();
        let script = self.freeport_shell(network, &exclude);
        let (stdout, _, ok) = self.ssh.exec(&script).await?;
        if !ok {
            return Err(HostError::NoFreePort);
        }
        let port: u16 = stdout
            .trim()
            .parse()
            .map_err(|_| HostError::NoFreePort)?;

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
        let full_dest = self.base_dir.join(dest);
        self.ssh
            .upload(&data, &full_dest.to_string_lossy(), mode)
            .await?;
        self.files
            .lock()
            .unwrap()
            .insert(logical_name.to_string(), full_dest);
        Ok(())
    }

    async fn mkdir(&self, dest: &str, _mode: u32) -> Result<()> {
        let full_dest = self.base_dir.join(dest);
        self.ssh.mkdir(&full_dest.to_string_lossy()).await
    }

    async fn run_command(&self, cmd: &str) -> Result<CommandOutput> {
        let (stdout, stderr, exit_ok) = self.ssh.exec(cmd).await?;
        Ok(CommandOutput {
            stdout,
            stderr,
            exit_ok,
        })
    }

    async fn collect_result(&self, output_path: &Path) -> Result<()> {
        let cmd = format!("tar zcf - -C {} .", self.base_dir.to_string_lossy());
        let (stdout, _, ok) = self.ssh.exec(&cmd).await?;
        if !ok {
            return Err(HostError::Runtime("remote tar failed".to_string()));
        }
        std::fs::write(output_path, stdout.into_bytes())?;
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.docker.pull_if_absent(image).await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
