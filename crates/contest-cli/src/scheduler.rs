//! The `run` scheduler: prepares hosts, renders node/genesis designs,
//! spawns the expectation engine, waits for it to finish or be interrupted,
//! then tears everything down.

use crate::error::{CliError, Result};
use crate::hostspec::HostSpec;
use contest_engine::{EngineContext, ExpectationEngine, NodeRunFlags};
use contest_host::{HostRegistry, Network};
use contest_scenario::Scenario;
use contest_store::{DocumentStore, MemoryStore, MongoStore};
use contest_vars::Vars;
use futures::future::try_join_all;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct RunArgs {
    pub base_dir: PathBuf,
    pub scenario_path: PathBuf,
    pub hosts: Vec<String>,
    pub node_binaries: Vec<String>,
    pub mongodb: Option<String>,
    pub timeout: Option<String>,
    pub pprof_seconds: u32,
    pub node_args: Vec<String>,
    pub log_level: String,
    pub log_format: String,
}

/// Node binary path per detected architecture. A single entry with no `=`
/// is used regardless of architecture, for single-arch fleets.
fn parse_node_binaries(raw: &[String]) -> HashMap<String, PathBuf> {
    let mut map = HashMap::new();
    for entry in raw {
        match entry.split_once('=') {
            Some((arch, path)) => {
                map.insert(arch.to_string(), PathBuf::from(path));
            }
            None => {
                map.insert(String::new(), PathBuf::from(entry));
            }
        }
    }
    map
}

fn binary_for_arch<'a>(binaries: &'a HashMap<String, PathBuf>, arch: &str) -> Option<&'a Path> {
    binaries
        .get(arch)
        .or_else(|| binaries.get(""))
        .map(PathBuf::as_path)
}

pub async fn run(args: RunArgs) -> Result<()> {
    if !args.base_dir.is_absolute() {
        return Err(CliError::RelativeBaseDir(args.base_dir.display().to_string()));
    }
    std::fs::create_dir_all(&args.base_dir)?;

    let scenario = Scenario::load_from(&args.scenario_path)?;

    let store: Arc<dyn DocumentStore> = match &args.mongodb {
        Some(uri) => Arc::new(MongoStore::connect(uri, "contest", "logs").await?),
        None => Arc::new(MemoryStore::new()),
    };

    let specs: Vec<HostSpec> = args
        .hosts
        .iter()
        .map(|h| HostSpec::parse(h))
        .collect::<Result<_>>()?;
    let adapters: Vec<Arc<dyn contest_host::HostAdapter>> = specs
        .iter()
        .map(|s| s.build(&args.base_dir))
        .collect::<Result<_>>()?;
    let hosts = Arc::new(HostRegistry::new(adapters));

    prepare_hosts(&hosts).await?;
    resolve_publish_host(&hosts, &specs).await?;

    let binaries = parse_node_binaries(&args.node_binaries);
    upload_node_binaries(&hosts, &binaries).await?;
    prime_ports(&hosts).await?;
    pull_images(&hosts, &scenario).await?;

    let vars = Vars::new(Value::Object(Map::new()));
    vars.set(".vars", scenario.vars.clone()).await.ok();
    render_designs(&vars, &scenario, &hosts, &args.base_dir).await?;

    let (log_tx, log_rx) = tokio::sync::mpsc::channel(8192);
    let (exit_tx, exit_rx) = tokio::sync::mpsc::channel(1);
    let cancel = CancellationToken::new();

    let ctx = Arc::new(EngineContext::new(
        vars,
        hosts.clone(),
        store.clone(),
        log_tx,
        exit_tx,
        cancel.clone(),
        scenario.ignore_abnormal_container_exit,
        binary_image_name(),
        NodeRunFlags {
            log_level: args.log_level.clone(),
            log_format: args.log_format.clone(),
            pprof_seconds: args.pprof_seconds,
            extra_args: args.node_args.clone(),
        },
    ));

    let sink_cancel = cancel.clone();
    let sink_store = store.clone();
    let sink_task = tokio::spawn(contest_store::run_sink(sink_store, log_rx, sink_cancel));

    let engine = ExpectationEngine::new(ctx.clone());
    let engine_scenario = scenario.clone();
    let engine_task = tokio::spawn(async move { engine.run(&engine_scenario).await });

    let result = wait(&args, &cancel, engine_task, exit_rx).await;

    cancel.cancel();
    let _ = sink_task.await;
    collect_results(&hosts, &args.base_dir).await;
    let _ = hosts.close_all().await;

    result
}

async fn prepare_hosts(hosts: &HostRegistry) -> Result<()> {
    try_join_all(hosts.hosts().iter().map(|h| h.prepare())).await?;
    Ok(())
}

/// When the fleet mixes local and remote hosts, local containers must
/// advertise the address a remote peer can actually reach rather than
/// `localhost`; `SSH_CONNECTION`, read on the remote side, names it.
async fn resolve_publish_host(hosts: &HostRegistry, specs: &[HostSpec]) -> Result<()> {
    let has_remote = specs.iter().any(|s| !s.is_local());
    let has_local = specs.iter().any(HostSpec::is_local);
    if !(has_remote && has_local) {
        return Ok(());
    }

    let Some(remote) = specs
        .iter()
        .zip(hosts.hosts())
        .find(|(s, _)| !s.is_local())
        .map(|(_, h)| h)
    else {
        return Ok(());
    };

    let out = remote.run_command("echo $SSH_CONNECTION").await?;
    let Some(publish_addr) = out.stdout.split_whitespace().next() else {
        return Ok(());
    };

    for host in hosts.hosts() {
        host.set_publish_address(publish_addr.to_string());
    }
    Ok(())
}

async fn upload_node_binaries(hosts: &HostRegistry, binaries: &HashMap<String, PathBuf>) -> Result<()> {
    try_join_all(hosts.hosts().iter().map(|host| async move {
        let Some(path) = binary_for_arch(binaries, host.arch()) else {
            return Ok(());
        };
        let data = tokio::fs::read(path).await?;
        host.upload(data, "node-binary", "cmd", 0o755).await?;
        Ok::<_, CliError>(())
    }))
    .await?;
    Ok(())
}

async fn prime_ports(hosts: &HostRegistry) -> Result<()> {
    try_join_all(hosts.hosts().iter().map(|host| async move {
        host.free_port("prime-tcp", Network::Tcp).await?;
        host.free_port("prime-udp", Network::Udp).await?;
        Ok::<_, CliError>(())
    }))
    .await?;
    Ok(())
}

fn binary_image_name() -> &'static str {
    "contest-node:latest"
}

async fn pull_images(hosts: &HostRegistry, scenario: &Scenario) -> Result<()> {
    let mut images = vec![binary_image_name().to_string()];
    for expect in &scenario.expects {
        let contest_scenario::Expect::Condition(c) = expect else {
            continue;
        };
        for action in &c.actions {
            match action.action_type.as_str() {
                "run-redis" => images.push("redis:7-alpine".to_string()),
                "run-nginx" => images.push("nginx:alpine".to_string()),
                _ => {}
            }
        }
    }

    try_join_all(hosts.hosts().iter().flat_map(|host| {
        images.iter().map(move |image| {
            let image = image.clone();
            async move {
                host.pull_image(&image).await?;
                Ok::<_, CliError>(())
            }
        })
    }))
    .await?;
    Ok(())
}

async fn render_designs(
    vars: &Vars,
    scenario: &Scenario,
    hosts: &HostRegistry,
    base_dir: &Path,
) -> Result<()> {
    let aliases = node_aliases(scenario);

    for alias in &aliases {
        let same_host: Vec<String> = scenario
            .nodes
            .same_host
            .iter()
            .filter(|a| a.as_str() != alias)
            .cloned()
            .collect();
        let host = hosts.assign(
            alias,
            if scenario.nodes.same_host.contains(alias) {
                &same_host
            } else {
                &[]
            },
        )?;

        vars.set(".self.alias", Value::String(alias.clone())).await.ok();
        vars.set(".self.host", Value::String(host.address().to_string())).await.ok();

        let common = match &scenario.designs.common {
            Some(t) => contest_vars::compile(t, vars, HashMap::new()).await?,
            None => String::new(),
        };
        let per_node = match scenario.designs.nodes.get(alias) {
            Some(t) => contest_vars::compile(t, vars, HashMap::new()).await?,
            None => String::new(),
        };
        let rendered = format!("{common}{per_node}");

        std::fs::write(base_dir.join(format!("{alias}.yml")), &rendered)?;
        host.mkdir(alias, 0o755).await?;
        host.upload(
            rendered.into_bytes(),
            &format!("{alias}-config"),
            &format!("{alias}/config.yml"),
            0o644,
        )
        .await?;

        vars.rename(".self", &format!(".nodes.{alias}")).await.ok();
    }

    if let Some(genesis) = &scenario.designs.genesis {
        let rendered = contest_vars::compile(genesis, vars, HashMap::new()).await?;
        std::fs::write(base_dir.join("genesis.yml"), &rendered)?;
        try_join_all(hosts.hosts().iter().map(|host| {
            let rendered = rendered.clone();
            async move {
                host.upload(rendered.into_bytes(), "genesis", "genesis.yml", 0o644)
                    .await?;
                Ok::<_, CliError>(())
            }
        }))
        .await?;
    }

    Ok(())
}

fn node_aliases(scenario: &Scenario) -> Vec<String> {
    if !scenario.designs.nodes.is_empty() {
        let mut aliases: Vec<String> = scenario.designs.nodes.keys().cloned().collect();
        aliases.sort();
        aliases
    } else if let Some(n) = scenario.designs.number_nodes {
        (0..n).map(|i| format!("no{i}")).collect()
    } else {
        Vec::new()
    }
}

async fn wait(
    args: &RunArgs,
    cancel: &CancellationToken,
    engine_task: tokio::task::JoinHandle<contest_engine::Result<()>>,
    mut exit_rx: tokio::sync::mpsc::Receiver<String>,
) -> Result<()> {
    let timeout = args
        .timeout
        .as_deref()
        .map(contest_engine::parse_duration)
        .transpose()?;

    let (sigint_tx, mut sigint_rx) = tokio::sync::mpsc::channel(1);
    let _ = ctrlc::set_handler(move || {
        let _ = sigint_tx.try_send(());
    });

    tokio::select! {
        // The exit channel is the single fatal-error sink: a node/redis
        // container dying abnormally, or a `stop-contest` action carrying a
        // miss description, lands here ahead of the engine task's own join.
        Some(msg) = exit_rx.recv() => {
            cancel.cancel();
            Err(CliError::Fatal(msg))
        }
        res = engine_task => {
            match res {
                Ok(inner) => inner.map_err(CliError::from),
                Err(e) => Err(CliError::Io(std::io::Error::other(e.to_string()))),
            }
        }
        _ = async {
            match timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        } => {
            cancel.cancel();
            Err(CliError::Timeout(args.timeout.clone().unwrap_or_default()))
        }
        _ = sigint_rx.recv() => {
            cancel.cancel();
            Ok(())
        }
    }
}

async fn collect_results(hosts: &HostRegistry, base_dir: &Path) {
    for (i, host) in hosts.hosts().iter().enumerate() {
        let output = base_dir.join(format!("result-{i}.tar.gz"));
        if let Err(e) = host.collect_result(&output).await {
            tracing::warn!(error = %e, host = host.address(), "failed to collect result tarball");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_path_binds_to_any_arch() {
        let map = parse_node_binaries(&["/bin/node".to_string()]);
        assert_eq!(binary_for_arch(&map, "aarch64"), Some(Path::new("/bin/node")));
    }

    #[test]
    fn arch_tagged_paths_are_matched_by_key() {
        let map = parse_node_binaries(&[
            "x86_64=/bin/node-amd64".to_string(),
            "aarch64=/bin/node-arm64".to_string(),
        ]);
        assert_eq!(binary_for_arch(&map, "aarch64"), Some(Path::new("/bin/node-arm64")));
        assert_eq!(binary_for_arch(&map, "x86_64"), Some(Path::new("/bin/node-amd64")));
    }

    #[test]
    fn unmatched_arch_without_fallback_is_none() {
        let map = parse_node_binaries(&["x86_64=/bin/node-amd64".to_string()]);
        assert_eq!(binary_for_arch(&map, "aarch64"), None);
    }

    #[test]
    fn default_node_aliases_from_number_nodes() {
        let scenario = Scenario::parse(
            r#"
designs:
  number_nodes: 3
expects:
  - log: "hi"
"#,
            Path::new("s.yml"),
        )
        .unwrap();
        assert_eq!(node_aliases(&scenario), vec!["no0", "no1", "no2"]);
    }

    #[test]
    fn explicit_nodes_map_wins_over_number_nodes() {
        let scenario = Scenario::parse(
            r#"
designs:
  number_nodes: 5
  nodes:
    no0: "a"
    no1: "b"
expects:
  - log: "hi"
"#,
            Path::new("s.yml"),
        )
        .unwrap();
        assert_eq!(node_aliases(&scenario), vec!["no0", "no1"]);
    }
}
