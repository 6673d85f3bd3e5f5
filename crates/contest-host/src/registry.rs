//! Assigns scenario nodes to hosts, honoring `same_host` affinity groups and
//! otherwise spreading nodes round-robin across the configured hosts.

use crate::{HostAdapter, HostError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub struct HostRegistry {
    hosts: Vec<Arc<dyn HostAdapter>>,
    cursor: AtomicUsize,
    /// node alias -> index into `hosts`, fixed once a node first lands on a
    /// host so that later lookups (and same-host peers) reuse it.
    assigned: std::sync::Mutex<HashMap<String, usize>>,
}

impl HostRegistry {
    pub fn new(hosts: Vec<Arc<dyn HostAdapter>>) -> Self {
        Self {
            hosts,
            cursor: AtomicUsize::new(0),
            assigned: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    async fn prepare_all(&self) -> Result<()> {
        for host in &self.hosts {
            host.prepare().await?;
        }
        Ok(())
    }

    pub async fn prepare(&self) -> Result<()> {
        self.prepare_all().await
    }

    /// Assigns `alias` a host, picking round-robin unless `same_host` names a
    /// peer alias that has already been assigned, in which case it joins that
    /// peer's host.
    pub fn assign(&self, alias: &str, same_host: &[String]) -> Result<Arc<dyn HostAdapter>> {
        if self.hosts.is_empty() {
            return Err(HostError::UnknownHost(alias.to_string()));
        }

        let mut assigned = self.assigned.lock().unwrap();
        if let Some(idx) = assigned.get(alias) {
            return Ok(self.hosts[*idx].clone());
        }

        for peer in same_host {
            if let Some(idx) = assigned.get(peer) {
                let idx = *idx;
                assigned.insert(alias.to_string(), idx);
                return Ok(self.hosts[idx].clone());
            }
        }

        let idx = self.cursor.fetch_add(1, Ordering::SeqCst) % self.hosts.len();
        assigned.insert(alias.to_string(), idx);
        Ok(self.hosts[idx].clone())
    }

    pub fn host_for(&self, alias: &str) -> Option<Arc<dyn HostAdapter>> {
        let assigned = self.assigned.lock().unwrap();
        assigned.get(alias).map(|idx| self.hosts[*idx].clone())
    }

    pub fn hosts(&self) -> &[Arc<dyn HostAdapter>] {
        &self.hosts
    }

    pub async fn close_all(&self) -> Result<()> {
        for host in &self.hosts {
            host.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CommandOutput, ContainerSpec, ContainerState, LogChunk, Network};
    use crate::OnExit;
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use std::path::{Path, PathBuf};

    struct StubHost(String);

    #[async_trait]
    impl HostAdapter for StubHost {
        fn address(&self) -> &str {
            &self.0
        }
        fn arch(&self) -> &str {
            "x86_64"
        }
        fn base_dir(&self) -> &Path {
            Path::new("/tmp")
        }
        fn file(&self, _logical_name: &str) -> Option<PathBuf> {
            None
        }
        async fn prepare(&self) -> Result<()> {
            Ok(())
        }
        async fn create_container(&self, _name: &str, _spec: &ContainerSpec) -> Result<()> {
            Ok(())
        }
        async fn start_container(&self, _name: &str, _on_exit: Option<OnExit>) -> Result<()> {
            Ok(())
        }
        async fn stop_container(&self, _name: &str, _timeout: Option<u32>) -> Result<()> {
            Ok(())
        }
        async fn remove_container(&self, _name: &str, _force: bool) -> Result<()> {
            Ok(())
        }
        async fn container_logs(
            &self,
            _name: &str,
        ) -> Result<BoxStream<'static, Result<LogChunk>>> {
            Ok(Box::pin(futures::stream::empty()))
        }
        async fn exists_container(
            &self,
            _name: &str,
        ) -> Result<Option<(String, ContainerState)>> {
            Ok(None)
        }
        async fn free_port(&self, _id: &str, _network: Network) -> Result<u16> {
            Ok(0)
        }
        async fn upload(
            &self,
            _data: Vec<u8>,
            _logical_name: &str,
            _dest: &str,
            _mode: u32,
        ) -> Result<()> {
            Ok(())
        }
        async fn mkdir(&self, _dest: &str, _mode: u32) -> Result<()> {
            Ok(())
        }
        async fn run_command(&self, _cmd: &str) -> Result<CommandOutput> {
            Ok(CommandOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_ok: true,
            })
        }
        async fn collect_result(&self, _output_path: &Path) -> Result<()> {
            Ok(())
        }
        async fn pull_image(&self, _image: &str) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn registry(n: usize) -> HostRegistry {
        let hosts: Vec<Arc<dyn HostAdapter>> = (0..n)
            .map(|i| Arc::new(StubHost(format!("host-{i}"))) as Arc<dyn HostAdapter>)
            .collect();
        HostRegistry::new(hosts)
    }

    #[test]
    fn round_robins_across_hosts() {
        let reg = registry(2);
        let a = reg.assign("no1", &[]).unwrap();
        let b = reg.assign("no2", &[]).unwrap();
        let c = reg.assign("no3", &[]).unwrap();
        assert_ne!(a.address(), b.address());
        assert_eq!(a.address(), c.address());
    }

    #[test]
    fn same_host_peers_share_assignment() {
        let reg = registry(3);
        let a = reg.assign("no1", &[]).unwrap();
        let b = reg
            .assign("no2", &["no1".to_string()])
            .unwrap();
        assert_eq!(a.address(), b.address());
    }

    #[test]
    fn repeated_assign_is_stable() {
        let reg = registry(2);
        let a = reg.assign("no1", &[]).unwrap();
        let a2 = reg.assign("no1", &[]).unwrap();
        assert_eq!(a.address(), a2.address());
    }
}
