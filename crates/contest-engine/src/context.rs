//! Shared handles threaded through the expectation engine and action
//! dispatcher: the variable store, host registry, document store and the
//! channels used to report log entries and fatal errors back to the
//! scheduler's exit channel.

use contest_host::HostRegistry;
use contest_store::{DocumentStore, LogEntry};
use contest_vars::Vars;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Flags the action dispatcher renders into every node's command line, set
/// once for the whole run from CLI flags.
#[derive(Debug, Clone)]
pub struct NodeRunFlags {
    pub log_level: String,
    pub log_format: String,
    pub pprof_seconds: u32,
    pub extra_args: Vec<String>,
}

pub struct EngineContext {
    pub vars: Vars,
    pub hosts: Arc<HostRegistry>,
    pub store: Arc<dyn DocumentStore>,
    pub log_tx: mpsc::Sender<LogEntry>,
    /// The scheduler's exit channel: the single fatal-error sink for the
    /// whole run. A send here always accompanies a `cancel()`.
    pub exit_tx: mpsc::Sender<String>,
    pub cancel: CancellationToken,
    pub ignore_abnormal_container_exit: bool,
    pub node_image: String,
    pub run_flags: NodeRunFlags,
    /// Live node alias -> debug-HTTP port, so `on_exit` can drop the entry.
    debug_http: Mutex<HashMap<String, u16>>,
}

impl EngineContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vars: Vars,
        hosts: Arc<HostRegistry>,
        store: Arc<dyn DocumentStore>,
        log_tx: mpsc::Sender<LogEntry>,
        exit_tx: mpsc::Sender<String>,
        cancel: CancellationToken,
        ignore_abnormal_container_exit: bool,
        node_image: impl Into<String>,
        run_flags: NodeRunFlags,
    ) -> Self {
        Self {
            vars,
            hosts,
            store,
            log_tx,
            exit_tx,
            cancel,
            ignore_abnormal_container_exit,
            node_image: node_image.into(),
            run_flags,
            debug_http: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_debug_http(&self, alias: &str, port: u16) {
        self.debug_http.lock().unwrap().insert(alias.to_string(), port);
    }

    pub fn drop_debug_http(&self, alias: &str) {
        self.debug_http.lock().unwrap().remove(alias);
    }

    /// Emits an internal (not node-attributed) log entry. Never fatal: the
    /// channel closing just means the scheduler already tore the pipeline
    /// down.
    pub async fn log(&self, msg: &str, error: Option<String>) {
        let _ = self.log_tx.send(LogEntry::internal(msg, error)).await;
    }

    /// Delivers a fatal error to the scheduler's exit channel and cancels
    /// the run. A no-op if the run is already cancelled, so only the first
    /// fatal error is ever reported.
    pub fn fatal(&self, msg: String) {
        if self.cancel.is_cancelled() {
            return;
        }
        let _ = self.exit_tx.try_send(msg);
        self.cancel.cancel();
    }
}

pub fn container_name(alias: &str) -> String {
    format!("{}{alias}", contest_host::CONTAINER_LABEL_PREFIX)
}
