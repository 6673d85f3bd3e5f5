//! The expectation state machine: pops expects off the scenario in order,
//! compiles each into one or more pollable queries (fanned out over
//! `range`), polls until a match (or a condition-failure policy fires), runs
//! registers then actions, and advances.
//!
//! ```text
//!   IDLE -> [pop expect] -> COMPILED -> [poll]* -> MATCHED -> [register -> act] -> IDLE
//!                           ^                                                       |
//!                           '---- (range continues if queries left) <---------------'
//!                                         (if_condition_failed == stop-contest) -> FAIL
//! ```

use crate::condition::{self, ConditionQuery};
use crate::context::EngineContext;
use crate::dispatch::{self, resolve_host, self_overlay};
use crate::duration::parse_duration;
use crate::{EngineError, Result};
use contest_scenario::{Action, ConditionExpect, Expect, IfConditionFailed, Register, Scenario};
use contest_vars::Vars;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_INTERVAL: Duration = Duration::from_millis(300);

pub struct ExpectationEngine {
    ctx: Arc<EngineContext>,
}

impl ExpectationEngine {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Runs every expect in order. Returns `Ok(())` both when the scenario
    /// is exhausted and when a `stop-contest` action or policy ended it
    /// early — from the engine's own perspective that is a normal finish;
    /// the scheduler distinguishes the two by checking whether `cancel` was
    /// fired for a reason other than its own shutdown.
    pub async fn run(&self, scenario: &Scenario) -> Result<()> {
        self.ctx.log("contest ready", None).await;

        for expect in &scenario.expects {
            if self.ctx.cancel.is_cancelled() {
                return Ok(());
            }

            match expect {
                Expect::LogAnnounce { log } => {
                    let rendered = contest_vars::compile(log, &self.ctx.vars, HashMap::new()).await?;
                    self.ctx.log(&rendered, None).await;
                }
                Expect::Condition(expect) => {
                    self.run_condition_expect(expect).await?;
                }
            }
        }

        Ok(())
    }

    async fn run_condition_expect(&self, expect: &ConditionExpect) -> Result<()> {
        let queries = self.build_queries(expect).await?;

        let interval = match &expect.interval {
            Some(s) => parse_duration(s)?,
            None => DEFAULT_INTERVAL,
        };
        if let Some(wait) = &expect.initial_wait {
            tokio::time::sleep(parse_duration(wait)?).await;
        }

        for (binding_vars, query) in queries {
            if self.ctx.cancel.is_cancelled() {
                return Ok(());
            }

            loop {
                let (bound, matched) = query.find().await?;
                if matched {
                    self.run_registers(&expect.registers, &binding_vars, bound).await?;
                    for action in &expect.actions {
                        dispatch::dispatch(&self.ctx, action).await?;
                    }
                    break;
                }

                match expect.if_condition_failed {
                    IfConditionFailed::Nothing => {
                        tokio::select! {
                            _ = tokio::time::sleep(interval) => {}
                            _ = self.ctx.cancel.cancelled() => return Ok(()),
                        }
                    }
                    IfConditionFailed::StopContest => {
                        let stop = Action {
                            action_type: "stop-contest".to_string(),
                            args: vec![format!("condition failed: {}", query.describe())],
                            properties: None,
                            range: None,
                        };
                        dispatch::dispatch(&self.ctx, &stop).await?;
                        return Ok(());
                    }
                }
            }
        }

        Ok(())
    }

    /// Builds one query per range row (or a single query against the base
    /// store when there is no range), each compiled against a store clone
    /// with `.self.alias` / `.self.host` / `.self.range` bound.
    async fn build_queries(
        &self,
        expect: &ConditionExpect,
    ) -> Result<Vec<(Vars, Box<dyn ConditionQuery>)>> {
        let rows = match &expect.range {
            Some(range) => contest_scenario::fan_out(range)?,
            None => vec![HashMap::new()],
        };

        let mut out = Vec::with_capacity(rows.len());
        for binding in rows {
            let alias = binding.get("node").and_then(Value::as_str).map(str::to_string);

            let host = match &alias {
                Some(alias) => Some(resolve_host(&self.ctx, alias).await?),
                None => self.ctx.hosts.hosts().first().cloned(),
            };

            let overlay = match (&alias, &host) {
                (Some(alias), Some(host)) => self_overlay(alias, host.address(), &binding),
                _ => bare_range_overlay(&binding),
            };

            let clone = self.ctx.vars.clone_with_overlay(overlay).await;
            let query = condition::compile(
                &expect.condition,
                &clone,
                HashMap::new(),
                host,
                self.ctx.store.clone(),
            )
            .await?;
            out.push((clone, query));
        }
        Ok(out)
    }

    async fn run_registers(
        &self,
        registers: &[Register],
        binding_vars: &Vars,
        bound: Option<Value>,
    ) -> Result<()> {
        for register in registers {
            let value = bound.clone().unwrap_or(Value::Null);
            let value = if register.format.as_deref() == Some("json") {
                match value {
                    Value::String(s) => serde_json::from_str(&s).map_err(|e| {
                        EngineError::Validation(format!(
                            "register `{}`: matched value is not valid json: {e}",
                            register.assign
                        ))
                    })?,
                    other => other,
                }
            } else {
                value
            };

            // `assign` may itself be templated (e.g. `.nodes.{{.self.alias}}.ready`)
            // so a ranged expect can register into a distinct path per row; it
            // renders against the row's bound store but always writes into the
            // shared store so later expects see it.
            let assign = contest_vars::compile(&register.assign, binding_vars, HashMap::new()).await?;
            self.ctx.vars.set(&assign, value).await?;
        }
        Ok(())
    }
}

fn bare_range_overlay(binding: &HashMap<String, Value>) -> HashMap<String, Value> {
    let mut range = Map::new();
    for (k, v) in binding {
        range.insert(k.clone(), v.clone());
    }
    let mut self_map = Map::new();
    self_map.insert("range".to_string(), Value::Object(range));

    let mut overlay = HashMap::new();
    overlay.insert("self".to_string(), Value::Object(self_map));
    overlay
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NodeRunFlags;
    use contest_host::{
        CommandOutput, ContainerSpec, ContainerState, ExitResult, HostAdapter, HostRegistry, LogChunk,
        Network, OnExit,
    };
    use contest_store::{DocumentStore, LogEntry, MemoryStore};
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn flags() -> NodeRunFlags {
        NodeRunFlags {
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            pprof_seconds: 30,
            extra_args: Vec::new(),
        }
    }

    /// A host double that never touches a real container runtime. When
    /// `exit_code` is set, `start_container` fires `on_exit` immediately
    /// with that code, simulating a node that dies on launch.
    struct StubHost {
        addr: String,
        exit_code: Option<i64>,
        exited: AtomicBool,
    }

    impl StubHost {
        fn new(addr: &str) -> Self {
            Self { addr: addr.to_string(), exit_code: None, exited: AtomicBool::new(false) }
        }

        fn dying_with(addr: &str, code: i64) -> Self {
            Self { addr: addr.to_string(), exit_code: Some(code), exited: AtomicBool::new(false) }
        }
    }

    #[async_trait]
    impl HostAdapter for StubHost {
        fn address(&self) -> &str {
            &self.addr
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
        async fn prepare(&self) -> contest_host::Result<()> {
            Ok(())
        }
        async fn create_container(&self, _name: &str, _spec: &ContainerSpec) -> contest_host::Result<()> {
            Ok(())
        }
        async fn start_container(&self, _name: &str, on_exit: Option<OnExit>) -> contest_host::Result<()> {
            if let (Some(code), Some(on_exit)) = (self.exit_code, on_exit) {
                self.exited.store(true, Ordering::SeqCst);
                on_exit(ExitResult { exit_code: Some(code), error: None, cancelled: false });
            }
            Ok(())
        }
        async fn stop_container(&self, _name: &str, _timeout: Option<u32>) -> contest_host::Result<()> {
            Ok(())
        }
        async fn remove_container(&self, _name: &str, _force: bool) -> contest_host::Result<()> {
            Ok(())
        }
        async fn container_logs(&self, _name: &str) -> contest_host::Result<BoxStream<'static, contest_host::Result<LogChunk>>> {
            Ok(Box::pin(futures::stream::empty()))
        }
        async fn exists_container(&self, _name: &str) -> contest_host::Result<Option<(String, ContainerState)>> {
            Ok(None)
        }
        async fn free_port(&self, _id: &str, _network: Network) -> contest_host::Result<u16> {
            Ok(4000)
        }
        async fn upload(&self, _data: Vec<u8>, _logical_name: &str, _dest: &str, _mode: u32) -> contest_host::Result<()> {
            Ok(())
        }
        async fn mkdir(&self, _dest: &str, _mode: u32) -> contest_host::Result<()> {
            Ok(())
        }
        async fn run_command(&self, _cmd: &str) -> contest_host::Result<CommandOutput> {
            Ok(CommandOutput { stdout: String::new(), stderr: String::new(), exit_ok: true })
        }
        async fn collect_result(&self, _output_path: &Path) -> contest_host::Result<()> {
            Ok(())
        }
        async fn pull_image(&self, _image: &str) -> contest_host::Result<()> {
            Ok(())
        }
        async fn close(&self) -> contest_host::Result<()> {
            Ok(())
        }
    }

    fn engine_with(store: Arc<dyn DocumentStore>) -> (ExpectationEngine, mpsc::Receiver<LogEntry>, mpsc::Receiver<String>) {
        engine_with_hosts(store, Vec::new())
    }

    fn engine_with_hosts(
        store: Arc<dyn DocumentStore>,
        hosts: Vec<Arc<dyn HostAdapter>>,
    ) -> (ExpectationEngine, mpsc::Receiver<LogEntry>, mpsc::Receiver<String>) {
        let (log_tx, log_rx) = mpsc::channel(64);
        let (exit_tx, exit_rx) = mpsc::channel(1);
        let ctx = Arc::new(EngineContext::new(
            Vars::new(Value::Null),
            Arc::new(HostRegistry::new(hosts)),
            store,
            log_tx,
            exit_tx,
            CancellationToken::new(),
            false,
            "node:latest",
            flags(),
        ));
        (ExpectationEngine::new(ctx), log_rx, exit_rx)
    }

    #[tokio::test]
    async fn log_only_scenario_finishes_immediately() {
        let scenario = Scenario::parse(
            r#"
designs: {}
expects:
  - log: "hello"
"#,
            Path::new("s1.yml"),
        )
        .unwrap();

        let (engine, mut log_rx, _exit_rx) = engine_with(Arc::new(MemoryStore::new()));
        engine.run(&scenario).await.unwrap();

        log_rx.close();
        let mut saw_hello = false;
        while let Some(entry) = log_rx.recv().await {
            if entry.body.get("msg").and_then(Value::as_str) == Some("hello") {
                saw_hello = true;
            }
        }
        assert!(saw_hello);
    }

    #[tokio::test]
    async fn single_find_scenario_matches_injected_entry() {
        let scenario = Scenario::parse(
            r#"
designs: {}
expects:
  - condition: "{\"node\":\"no0\",\"msg\":\"ready\"}"
    interval: "10ms"
"#,
            Path::new("s2.yml"),
        )
        .unwrap();

        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        store
            .insert_batch(vec![LogEntry::parse("no0", false, r#"{"msg":"ready"}"#)])
            .await
            .unwrap();

        let (engine, _log_rx, _exit_rx) = engine_with(store);
        tokio::time::timeout(Duration::from_secs(1), engine.run(&scenario))
            .await
            .expect("scenario should finish promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn count_threshold_scenario_matches_after_third_insert() {
        let scenario = Scenario::parse(
            r#"
designs: {}
expects:
  - condition: {query: "{\"kind\":\"block\"}", count: "> 2"}
    interval: "10ms"
"#,
            Path::new("s3.yml"),
        )
        .unwrap();

        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        for _ in 0..3 {
            store
                .insert_batch(vec![LogEntry::parse("no0", false, r#"{"kind":"block"}"#)])
                .await
                .unwrap();
        }

        let (engine, _log_rx, _exit_rx) = engine_with(store);
        tokio::time::timeout(Duration::from_secs(1), engine.run(&scenario))
            .await
            .expect("scenario should finish promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn expects_run_in_order() {
        let scenario = Scenario::parse(
            r#"
designs: {}
expects:
  - log: "first"
  - log: "second"
  - log: "third"
"#,
            Path::new("s_order.yml"),
        )
        .unwrap();

        let (engine, mut log_rx, _exit_rx) = engine_with(Arc::new(MemoryStore::new()));
        engine.run(&scenario).await.unwrap();

        log_rx.close();
        let mut messages = Vec::new();
        while let Some(entry) = log_rx.recv().await {
            if let Some(msg) = entry.body.get("msg").and_then(Value::as_str) {
                messages.push(msg.to_string());
            }
        }
        assert_eq!(messages, vec!["contest ready", "first", "second", "third"]);
    }

    #[tokio::test]
    async fn stop_contest_on_condition_failure_ends_scenario_without_error() {
        let scenario = Scenario::parse(
            r#"
designs: {}
expects:
  - condition: "{\"node\":\"no0\",\"msg\":\"never\"}"
    interval: "10ms"
    if_condition_failed: "stop-contest"
  - log: "unreachable"
"#,
            Path::new("s_stop.yml"),
        )
        .unwrap();

        let (engine, mut log_rx, _exit_rx) = engine_with(Arc::new(MemoryStore::new()));
        engine.run(&scenario).await.unwrap();

        log_rx.close();
        let mut saw_unreachable = false;
        while let Some(entry) = log_rx.recv().await {
            if entry.body.get("msg").and_then(Value::as_str) == Some("unreachable") {
                saw_unreachable = true;
            }
        }
        assert!(!saw_unreachable);
    }

    #[tokio::test]
    async fn range_fan_out_matches_each_binding_once() {
        let scenario = Scenario::parse(
            r#"
designs: {}
expects:
  - condition: "{\"node\":\"{{.self.range.node}}\",\"msg\":\"ready\"}"
    range: [{node: [no0, no1]}]
    interval: "10ms"
"#,
            Path::new("s4.yml"),
        )
        .unwrap();

        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        store
            .insert_batch(vec![
                LogEntry::parse("no0", false, r#"{"msg":"ready"}"#),
                LogEntry::parse("no1", false, r#"{"msg":"ready"}"#),
            ])
            .await
            .unwrap();

        let hosts: Vec<Arc<dyn HostAdapter>> = vec![Arc::new(StubHost::new("host0"))];
        let (engine, _log_rx, _exit_rx) = engine_with_hosts(store, hosts);
        tokio::time::timeout(Duration::from_secs(1), engine.run(&scenario))
            .await
            .expect("scenario should finish promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn abnormal_node_exit_reports_fatal_error_to_exit_channel() {
        let scenario = Scenario::parse(
            r#"
designs: {}
expects:
  - condition: "{\"node\":\"no0\",\"msg\":\"ready\"}"
    interval: "10ms"
    actions:
      - type: "run-nodes"
        range: [{node: [no0]}]
"#,
            Path::new("s6.yml"),
        )
        .unwrap();

        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        store
            .insert_batch(vec![LogEntry::parse("no0", false, r#"{"msg":"ready"}"#)])
            .await
            .unwrap();

        let hosts: Vec<Arc<dyn HostAdapter>> = vec![Arc::new(StubHost::dying_with("host0", 1))];
        let (engine, _log_rx, mut exit_rx) = engine_with_hosts(store, hosts);

        tokio::time::timeout(Duration::from_secs(1), engine.run(&scenario))
            .await
            .expect("scenario should finish promptly")
            .unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(1), exit_rx.recv())
            .await
            .expect("fatal error should be reported promptly")
            .expect("exit channel should not be dropped before a fatal send");
        assert!(msg.contains("exit=1"), "expected `exit=1` in {msg:?}");
    }
}
