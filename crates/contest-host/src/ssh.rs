//! SSH transport for remote hosts
//!
//! Host-key verification is intentionally permissive: tests trust their
//! fixture hosts and this runner never talks to an untrusted network.

use crate::{HostError, Result};
use russh::client::{self, Handle};
use russh::keys::key;
use russh_sftp::client::SftpSession;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

struct PermissiveHandler;

#[async_trait::async_trait]
impl client::Handler for PermissiveHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// A cached, reconnect-on-failure SSH client for one remote host.
pub struct SshClient {
    addr: String,
    user: String,
    handle: tokio::sync::Mutex<Option<Handle<PermissiveHandler>>>,
}

impl SshClient {
    pub fn new(addr: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            user: user.into(),
            handle: tokio::sync::Mutex::new(None),
        }
    }

    async fn dial(&self) -> Result<Handle<PermissiveHandler>> {
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        });

        let addr = self.addr.clone();
        let mut handle = tokio::time::timeout(Duration::from_secs(10), async move {
            client::connect(config, addr, PermissiveHandler).await
        })
        .await
        .map_err(|_| HostError::Ssh("connect timed out".to_string()))?
        .map_err(|e| HostError::Ssh(e.to_string()))?;

        authenticate(&mut handle, &self.user).await?;
        Ok(handle)
    }

    /// Ensures a handle is cached, dialing (and authenticating) if needed.
    async fn ensure_connected(&self) -> Result<()> {
        let mut guard = self.handle.lock().await;
        if guard.is_none() {
            *guard = Some(self.dial().await?);
        }
        Ok(())
    }

    /// Run `cmd` in a fresh channel. Reconnects and retries once on a
    /// transport-level failure.
    pub async fn exec(&self, cmd: &str) -> Result<(String, String, bool)> {
        match self.exec_once(cmd).await {
            Ok(out) => Ok(out),
            Err(_) => {
                *self.handle.lock().await = None;
                self.exec_once(cmd).await
            }
        }
    }

    async fn exec_once(&self, cmd: &str) -> Result<(String, String, bool)> {
        use russh::ChannelMsg;

        self.ensure_connected().await?;
        let guard = self.handle.lock().await;
        let handle = guard.as_ref().expect("connected above");

        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| HostError::Ssh(e.to_string()))?;
        channel
            .exec(true, cmd)
            .await
            .map_err(|e| HostError::Ssh(e.to_string()))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_ok = false;

        loop {
            let Some(msg) = channel.wait().await else {
                break;
            };
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => exit_ok = exit_status == 0,
                _ => {}
            }
        }

        Ok((
            String::from_utf8_lossy(&stdout).trim().to_string(),
            String::from_utf8_lossy(&stderr).trim().to_string(),
            exit_ok,
        ))
    }

    async fn sftp(&self) -> Result<SftpSession> {
        self.ensure_connected().await?;
        let guard = self.handle.lock().await;
        let handle = guard.as_ref().expect("connected above");

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| HostError::Ssh(e.to_string()))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| HostError::Ssh(e.to_string()))?;
        SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| HostError::Sftp(e.to_string()))
    }

    /// Upload `data` to `dest`, creating parent directories as needed.
    /// Retries up to 3 times with a 1s backoff; `data` is buffered so every
    /// attempt can replay it regardless of whether the original source was
    /// rewindable.
    pub async fn upload(&self, data: &[u8], dest: &str, mode: u32) -> Result<()> {
        let mut last_err = None;
        for attempt in 0..3 {
            match self.upload_once(data, dest, mode).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_err = Some(e);
                    *self.handle.lock().await = None;
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    tracing::warn!(attempt, dest, "sftp upload retrying");
                }
            }
        }
        Err(last_err.expect("looped at least once"))
    }

    async fn upload_once(&self, data: &[u8], dest: &str, mode: u32) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let sftp = self.sftp().await?;
        if let Some(parent) = Path::new(dest).parent() {
            let _ = sftp.create_dir(parent.to_string_lossy()).await;
        }
        let mut file = sftp
            .create(dest)
            .await
            .map_err(|e| HostError::Sftp(e.to_string()))?;
        file.write_all(data)
            .await
            .map_err(HostError::Io)?;
        file.sync_all()
            .await
            .map_err(|e| HostError::Sftp(e.to_string()))?;
        sftp.set_metadata(
            dest,
            russh_sftp::protocol::FileAttributes {
                permissions: Some(mode),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| HostError::Sftp(e.to_string()))?;
        Ok(())
    }

    pub async fn mkdir(&self, dest: &str) -> Result<()> {
        let sftp = self.sftp().await?;
        sftp.create_dir(dest)
            .await
            .map_err(|e| HostError::Sftp(e.to_string()))?;
        Ok(())
    }
}

async fn authenticate(handle: &mut Handle<PermissiveHandler>, user: &str) -> Result<()> {
    if let Ok(mut agent) = russh::keys::agent::client::AgentClient::connect_env().await {
        if let Ok(identities) = agent.request_identities().await {
            for public_key in identities {
                let signer = match russh::keys::agent::client::AgentClient::connect_env().await {
                    Ok(a) => a,
                    Err(_) => continue,
                };
                let (_, result) = handle
                    .authenticate_future(user, public_key, signer)
                    .await;
                if let Ok(true) = result {
                    return Ok(());
                }
            }
        }
    }

    for candidate in ["id_ed25519", "id_rsa"] {
        let path = dirs_home().join(".ssh").join(candidate);
        if let Ok(key) = russh::keys::load_secret_key(&path, None) {
            if let Ok(true) = handle.authenticate_publickey(user, Arc::new(key)).await {
                return Ok(());
            }
        }
    }

    Err(HostError::Ssh(format!(
        "no usable identity authenticated as {user}"
    )))
}

fn dirs_home() -> std::path::PathBuf {
    std::env::var_os("HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::path::PathBuf::from("/root"))
}
