//! Thin bollard wrapper shared by the local and remote host adapters
//!
//! Both adapters drive a Docker daemon — locally over the default socket,
//! remotely over a TCP endpoint dialed through the host's address — so the
//! container-lifecycle calls (create/start/stop/remove/logs/exists) live
//! here once rather than being duplicated per adapter.

use crate::types::{ContainerSpec, ContainerState, LogChunk};
use crate::{HostError, Result};
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::service::HostConfig;
use bollard::Docker;
use futures::stream::{Stream, StreamExt};

#[derive(Clone)]
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Connect to the local daemon over its default unix socket.
    pub fn connect_local() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| HostError::Connection(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Connect to a daemon over TCP, as used for remote hosts reached via
    /// SSH-tunneled or directly exposed Docker ports.
    pub fn connect_tcp(addr: &str) -> Result<Self> {
        let docker = Docker::connect_with_http(addr, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| HostError::Connection(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Connect to a local daemon over a non-default unix socket path, as
    /// given by a `unix://` host flag.
    pub fn connect_socket(path: &str) -> Result<Self> {
        let docker = Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| HostError::Connection(e.to_string()))?;
        Ok(Self { docker })
    }

    pub async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| HostError::Connection(e.to_string()))?;
        Ok(())
    }

    pub async fn create_container(&self, name: &str, spec: &ContainerSpec) -> Result<String> {
        let options = CreateContainerOptions {
            name,
            platform: None,
        };

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let host_config = HostConfig {
            binds: if spec.binds.is_empty() {
                None
            } else {
                Some(spec.binds.clone())
            },
            network_mode: spec.network_mode.clone(),
            publish_all_ports: Some(spec.publish_all_ports),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: if spec.cmd.is_empty() {
                None
            } else {
                Some(spec.cmd.clone())
            },
            env: if env.is_empty() { None } else { Some(env) },
            labels: if spec.labels.is_empty() {
                None
            } else {
                Some(spec.labels.clone())
            },
            host_config: Some(host_config),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| HostError::Runtime(e.to_string()))?;
        Ok(response.id)
    }

    pub async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| HostError::Runtime(e.to_string()))?;
        Ok(())
    }

    pub async fn stop_container(&self, id: &str, timeout: u32) -> Result<()> {
        let options = StopContainerOptions {
            t: timeout as i64,
        };
        self.docker
            .stop_container(id, Some(options))
            .await
            .map_err(|e| HostError::Runtime(e.to_string()))?;
        Ok(())
    }

    pub async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(HostError::Runtime(e.to_string())),
        }
    }

    /// `(id, state)` if the container is tracked by the daemon.
    pub async fn inspect_state(&self, id: &str) -> Result<Option<(String, ContainerState)>> {
        match self.docker.inspect_container(id, None).await {
            Ok(info) => {
                let state = info
                    .state
                    .as_ref()
                    .and_then(|s| s.status)
                    .map(|s| ContainerState::from_bollard(&format!("{s:?}").to_lowercase()))
                    .unwrap_or(ContainerState::Dead);
                Ok(Some((info.id.unwrap_or_default(), state)))
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(HostError::Runtime(e.to_string())),
        }
    }

    pub async fn wait(&self, id: &str) -> Result<Option<i64>> {
        use bollard::container::WaitContainerOptions;
        let mut stream = self.docker.wait_container(
            id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );
        match stream.next().await {
            Some(Ok(resp)) => Ok(Some(resp.status_code)),
            Some(Err(e)) => Err(HostError::Runtime(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn logs(&self, id: &str) -> impl Stream<Item = Result<LogChunk>> + '_ {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        };

        self.docker.logs(id, Some(options)).map(|chunk| {
            chunk
                .map(|out| match out {
                    bollard::container::LogOutput::StdOut { message } => {
                        LogChunk::Stdout(message.to_vec())
                    }
                    bollard::container::LogOutput::StdErr { message } => {
                        LogChunk::Stderr(message.to_vec())
                    }
                    bollard::container::LogOutput::StdIn { message }
                    | bollard::container::LogOutput::Console { message } => {
                        LogChunk::Stdout(message.to_vec())
                    }
                })
                .map_err(|e| HostError::Runtime(e.to_string()))
        })
    }

    pub async fn pull_if_absent(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        use bollard::image::CreateImageOptions;
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(result) = stream.next().await {
            result.map_err(|e| HostError::Runtime(e.to_string()))?;
        }
        Ok(())
    }

    pub async fn list_by_label_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        use bollard::container::ListContainersOptions;
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| HostError::Runtime(e.to_string()))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let name = c
                    .names?
                    .first()?
                    .trim_start_matches('/')
                    .to_string();
                if name.starts_with(prefix) {
                    Some((name, c.id.unwrap_or_default()))
                } else {
                    None
                }
            })
            .collect())
    }
}
