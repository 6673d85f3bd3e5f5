//! Parses a `<host>` CLI argument into a constructed host adapter.
//!
//! `localhost` or an address starting with `127.0.` is local over the
//! default Docker socket; `unix://<path>` is local over a specific socket;
//! anything else (typically `tcp://<addr>[:<port>]`) is remote, dialing
//! Docker on `<addr>:2376` unless a port is given. A trailing
//! `#base=<path>` fragment overrides the per-host base directory.

use crate::error::{CliError, Result};
use contest_host::{HostAdapter, LocalHost, RemoteHost};
use std::path::PathBuf;
use std::sync::Arc;

const DEFAULT_DOCKER_PORT: &str = "2376";
const DEFAULT_SSH_USER: &str = "root";

#[derive(Debug, Clone)]
enum Kind {
    Local { socket: Option<String> },
    Remote { address: String },
}

#[derive(Debug, Clone)]
pub struct HostSpec {
    raw: String,
    kind: Kind,
    base_override: Option<PathBuf>,
}

impl HostSpec {
    pub fn parse(raw: &str) -> Result<Self> {
        let (body, fragment) = match raw.split_once('#') {
            Some((body, frag)) => (body, Some(frag)),
            None => (raw, None),
        };

        let base_override = fragment
            .and_then(|frag| frag.strip_prefix("base="))
            .map(PathBuf::from);

        let kind = if body == "localhost" || body.starts_with("127.0.") {
            Kind::Local { socket: None }
        } else if let Some(path) = body.strip_prefix("unix://") {
            Kind::Local {
                socket: Some(path.to_string()),
            }
        } else if let Some(address) = body.strip_prefix("tcp://") {
            Kind::Remote {
                address: with_default_port(address),
            }
        } else {
            return Err(CliError::BadHost(
                raw.to_string(),
                "expected localhost, 127.0.*, unix://, or tcp://".to_string(),
            ));
        };

        Ok(Self {
            raw: raw.to_string(),
            kind,
            base_override,
        })
    }

    pub fn is_local(&self) -> bool {
        matches!(self.kind, Kind::Local { .. })
    }

    /// Builds the adapter, resolving the base directory as `run_base_dir`
    /// unless this host's fragment overrode it.
    pub fn build(&self, run_base_dir: &std::path::Path) -> Result<Arc<dyn HostAdapter>> {
        let base_dir = self
            .base_override
            .clone()
            .unwrap_or_else(|| run_base_dir.to_path_buf());

        let host: Arc<dyn HostAdapter> = match &self.kind {
            Kind::Local { socket } => {
                Arc::new(LocalHost::new(self.raw.clone(), base_dir, socket.as_deref())?)
            }
            Kind::Remote { address } => {
                let host_only = address.split(':').next().unwrap_or(address).to_string();
                Arc::new(RemoteHost::new(
                    host_only,
                    DEFAULT_SSH_USER,
                    address.clone(),
                    base_dir,
                )?)
            }
        };
        Ok(host)
    }
}

fn with_default_port(address: &str) -> String {
    if address.contains(':') {
        address.to_string()
    } else {
        format!("{address}:{DEFAULT_DOCKER_PORT}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn localhost_is_local() {
        let spec = HostSpec::parse("localhost").unwrap();
        assert!(spec.is_local());
    }

    #[test]
    fn loopback_prefix_is_local() {
        let spec = HostSpec::parse("127.0.0.1").unwrap();
        assert!(spec.is_local());
    }

    #[test]
    fn unix_socket_is_local() {
        let spec = HostSpec::parse("unix:///var/run/docker.sock").unwrap();
        assert!(spec.is_local());
        assert!(matches!(spec.kind, Kind::Local { socket: Some(ref p) } if p == "/var/run/docker.sock"));
    }

    #[test]
    fn tcp_defaults_port() {
        let spec = HostSpec::parse("tcp://10.0.0.5").unwrap();
        assert!(matches!(spec.kind, Kind::Remote { ref address } if address == "10.0.0.5:2376"));
    }

    #[test]
    fn tcp_with_explicit_port_is_kept() {
        let spec = HostSpec::parse("tcp://10.0.0.5:9999").unwrap();
        assert!(matches!(spec.kind, Kind::Remote { ref address } if address == "10.0.0.5:9999"));
    }

    #[test]
    fn base_fragment_is_parsed() {
        let spec = HostSpec::parse("localhost#base=/srv/contest").unwrap();
        assert_eq!(spec.base_override, Some(PathBuf::from("/srv/contest")));
    }

    #[test]
    fn unrecognized_scheme_is_rejected() {
        assert!(HostSpec::parse("ftp://nope").is_err());
    }
}
