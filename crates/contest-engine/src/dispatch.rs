//! Action dispatcher: turns a compiled [`Action`] into host/container
//! operations. Each action type renders its own `range` (or runs once, with
//! no range, against the base store) against a clone of the variable store
//! with `.self.alias` / `.self.host` / `.self.range` bound, mirroring how
//! the expectation engine binds expectation ranges.

use crate::context::{container_name, EngineContext};
use crate::{EngineError, Result};
use contest_host::{ContainerSpec, ExitResult, HostAdapter, Network};
use contest_scenario::{fan_out, Action, RangeColumn};
use contest_vars::Vars;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

const NGINX_CONFIG_TEMPLATE: &str = "server {\n    listen @@port@@;\n    root /usr/share/nginx/html;\n}\n";
const REDIS_IMAGE: &str = "redis:7-alpine";
const NGINX_IMAGE: &str = "nginx:alpine";

pub async fn dispatch(ctx: &Arc<EngineContext>, action: &Action) -> Result<()> {
    match action.action_type.as_str() {
        "run-nodes" => run_nodes(ctx, action, false).await,
        "init-nodes" => run_nodes(ctx, action, true).await,
        "stop-nodes" => stop_nodes(ctx, action).await,
        "host-command" => host_command(ctx, action).await,
        "run-redis" => run_redis(ctx).await,
        "run-nginx" => run_nginx(ctx, action).await,
        "stop-contest" => stop_contest(ctx, action).await,
        other => Err(EngineError::UnknownAction(other.to_string())),
    }
}

fn bindings(range: &Option<Vec<RangeColumn>>) -> Result<Vec<HashMap<String, Value>>> {
    match range {
        Some(range) => Ok(fan_out(range)?),
        None => Ok(vec![HashMap::new()]),
    }
}

pub(crate) fn binding_alias(binding: &HashMap<String, Value>) -> Result<String> {
    binding
        .get("node")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| EngineError::Validation("action binding missing `node`".to_string()))
}

pub(crate) async fn resolve_host(ctx: &EngineContext, alias: &str) -> Result<Arc<dyn HostAdapter>> {
    if let Some(host) = ctx.hosts.host_for(alias) {
        return Ok(host);
    }
    Ok(ctx.hosts.assign(alias, &[])?)
}

pub(crate) fn self_overlay(alias: &str, host_addr: &str, binding: &HashMap<String, Value>) -> HashMap<String, Value> {
    let mut range = Map::new();
    for (k, v) in binding {
        range.insert(k.clone(), v.clone());
    }
    let mut self_map = Map::new();
    self_map.insert("alias".to_string(), Value::String(alias.to_string()));
    self_map.insert("host".to_string(), Value::String(host_addr.to_string()));
    self_map.insert("range".to_string(), Value::Object(range));

    let mut overlay = HashMap::new();
    overlay.insert("self".to_string(), Value::Object(self_map));
    overlay
}

fn exit_code_display(code: Option<i64>) -> String {
    code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string())
}

async fn render_args(vars: &Vars, args: &[String]) -> Result<Vec<String>> {
    let mut out = Vec::with_capacity(args.len());
    for arg in args {
        out.push(contest_vars::compile(arg, vars, HashMap::new()).await?);
    }
    Ok(out)
}

async fn run_nodes(ctx: &Arc<EngineContext>, action: &Action, init: bool) -> Result<()> {
    for binding in bindings(&action.range)? {
        let alias = binding_alias(&binding)?;
        let host = resolve_host(ctx, &alias).await?;
        let clone = ctx
            .vars
            .clone_with_overlay(self_overlay(&alias, host.address(), &binding))
            .await;

        let mut args = render_args(&clone, &action.args).await?;
        args.push(format!("--log-level={}", ctx.run_flags.log_level));
        args.push(format!("--log-format={}", ctx.run_flags.log_format));
        args.push(format!("--log-out={alias}.log"));

        if !init {
            let debug_port = host.free_port(&format!("debug-{alias}"), Network::Tcp).await?;
            args.push(format!("--debug-http=0.0.0.0:{debug_port}"));
            args.push(format!("--pprof-seconds={}", ctx.run_flags.pprof_seconds));
            ctx.register_debug_http(&alias, debug_port);
        }
        args.extend(ctx.run_flags.extra_args.iter().cloned());

        let name = container_name(&alias);
        let _ = host.remove_container(&name, true).await;

        let spec = ContainerSpec {
            image: ctx.node_image.clone(),
            cmd: {
                let mut cmd = vec!["/data/cmd".to_string()];
                cmd.extend(args);
                cmd
            },
            network_mode: Some("host".to_string()),
            binds: vec![format!("{}:/data", host.base_dir().display())],
            labels: HashMap::from([("managed-by".to_string(), "contest".to_string())]),
            ..Default::default()
        };
        host.create_container(&name, &spec).await?;

        let exit_ctx = ctx.clone();
        let exit_alias = alias.clone();
        let ignore = ctx.ignore_abnormal_container_exit;
        let on_exit = Box::new(move |result: ExitResult| {
            exit_ctx.drop_debug_http(&exit_alias);
            tokio::spawn(async move {
                exit_ctx
                    .log(&format!("node {exit_alias} exited"), result.error.clone())
                    .await;
                let abnormal = !result.cancelled && result.exit_code.unwrap_or(0) != 0;
                if abnormal && !ignore {
                    let msg = format!(
                        "node {exit_alias} exited abnormally (exit={})",
                        exit_code_display(result.exit_code)
                    );
                    exit_ctx.log(&format!("fatal: {msg}"), None).await;
                    exit_ctx.fatal(msg);
                }
            });
        });
        host.start_container(&name, Some(on_exit)).await?;

        contest_store::spawn_ingestor(
            host.clone(),
            name,
            alias,
            host.base_dir(),
            ctx.log_tx.clone(),
            ctx.cancel.clone(),
        );
    }
    Ok(())
}

async fn stop_nodes(ctx: &Arc<EngineContext>, action: &Action) -> Result<()> {
    for binding in bindings(&action.range)? {
        let alias = match binding_alias(&binding) {
            Ok(alias) => alias,
            Err(e) => {
                tracing::error!(error = %e, "stop-nodes: skipping malformed binding");
                continue;
            }
        };
        let Some(host) = ctx.hosts.host_for(&alias) else {
            continue;
        };
        let name = container_name(&alias);
        match host.exists_container(&name).await {
            Ok(Some((_, state))) if state.is_running() => {
                if let Err(e) = host.stop_container(&name, None).await {
                    tracing::error!(error = %e, alias, "stop-nodes: stop failed");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, alias, "stop-nodes: lookup failed"),
        }
    }
    Ok(())
}

fn assemble_command(args: &[String]) -> String {
    if let Some(raw) = args.iter().find_map(|a| a.strip_prefix("$ ")) {
        return raw.to_string();
    }
    args.iter()
        .map(|a| {
            if a.chars().any(char::is_whitespace) {
                format!("'{}'", a.replace('\'', "'\\''"))
            } else {
                a.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

async fn host_command(ctx: &Arc<EngineContext>, action: &Action) -> Result<()> {
    for binding in bindings(&action.range)? {
        let host = match binding_alias(&binding) {
            Ok(alias) => resolve_host(ctx, &alias).await?,
            Err(_) => ctx
                .hosts
                .hosts()
                .first()
                .cloned()
                .ok_or_else(|| EngineError::UnknownHost("no hosts configured".to_string()))?,
        };

        let clone = ctx.vars.clone_with_overlay(HashMap::new()).await;
        let args = render_args(&clone, &action.args).await?;
        let command = assemble_command(&args);

        let out = host.run_command(&command).await?;
        if !out.exit_ok {
            return Err(EngineError::CommandFailed(format!(
                "{command}: {}",
                out.stderr.trim()
            )));
        }
    }
    Ok(())
}

async fn run_redis(ctx: &Arc<EngineContext>) -> Result<()> {
    let name = format!("{}redis", contest_host::CONTAINER_LABEL_PREFIX);
    for host in ctx.hosts.hosts() {
        let port = host.free_port("database-redis", Network::Tcp).await?;
        let spec = ContainerSpec {
            image: REDIS_IMAGE.to_string(),
            cmd: vec![
                "redis-server".to_string(),
                "--port".to_string(),
                port.to_string(),
            ],
            network_mode: Some("host".to_string()),
            ..Default::default()
        };
        let _ = host.remove_container(&name, true).await;
        host.create_container(&name, &spec).await?;

        let exit_ctx = ctx.clone();
        let on_exit = Box::new(move |result: ExitResult| {
            let abnormal = !result.cancelled && result.exit_code.unwrap_or(0) != 0;
            if abnormal {
                tokio::spawn(async move {
                    let msg = format!(
                        "redis container exited abnormally (exit={})",
                        exit_code_display(result.exit_code)
                    );
                    exit_ctx.log(&format!("fatal: {msg}"), result.error.clone()).await;
                    exit_ctx.fatal(msg);
                });
            }
        });
        host.start_container(&name, Some(on_exit)).await?;
    }
    Ok(())
}

async fn run_nginx(ctx: &Arc<EngineContext>, action: &Action) -> Result<()> {
    let props = action
        .properties
        .as_ref()
        .ok_or_else(|| EngineError::Validation("run-nginx requires `properties`".to_string()))?;

    let clone = ctx.vars.clone_with_overlay(HashMap::new()).await;
    let name = render_property(&clone, props, "name").await?;
    let root = render_property(&clone, props, "root").await?;
    let port = render_property(&clone, props, "port").await?;

    let host = match bindings(&action.range)?.into_iter().next() {
        Some(binding) => match binding_alias(&binding) {
            Ok(alias) => resolve_host(ctx, &alias).await?,
            Err(_) => first_host(ctx)?,
        },
        None => first_host(ctx)?,
    };

    let config = NGINX_CONFIG_TEMPLATE.replace("@@port@@", &port);
    let conf_logical = format!("{name}-nginx-conf");
    host.upload(config.into_bytes(), &conf_logical, &format!("{name}.nginx.conf"), 0o644)
        .await?;
    let conf_path = host
        .file(&conf_logical)
        .ok_or_else(|| EngineError::Validation("nginx config upload did not register a path".to_string()))?;

    let container = format!("{}{name}", contest_host::CONTAINER_LABEL_PREFIX);
    let spec = ContainerSpec {
        image: NGINX_IMAGE.to_string(),
        binds: vec![
            format!("{root}:/usr/share/nginx/html:ro"),
            format!("{}:/etc/nginx/conf.d/default.conf:ro", conf_path.display()),
        ],
        network_mode: Some("host".to_string()),
        ..Default::default()
    };
    let _ = host.remove_container(&container, true).await;
    host.create_container(&container, &spec).await?;

    let exit_ctx = ctx.clone();
    let exit_name = name.clone();
    let on_exit = Box::new(move |result: ExitResult| {
        if !result.cancelled {
            tokio::spawn(async move {
                exit_ctx
                    .log(&format!("nginx container {exit_name} exited"), result.error.clone())
                    .await;
            });
        }
    });
    host.start_container(&container, Some(on_exit)).await?;
    Ok(())
}

fn first_host(ctx: &EngineContext) -> Result<Arc<dyn HostAdapter>> {
    ctx.hosts
        .hosts()
        .first()
        .cloned()
        .ok_or_else(|| EngineError::UnknownHost("no hosts configured".to_string()))
}

async fn render_property(vars: &Vars, props: &HashMap<String, Value>, key: &str) -> Result<String> {
    let raw = props
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::Validation(format!("run-nginx requires `properties.{key}`")))?;
    Ok(contest_vars::compile(raw, vars, HashMap::new()).await?)
}

async fn stop_contest(ctx: &Arc<EngineContext>, action: &Action) -> Result<()> {
    let clone = ctx.vars.clone_with_overlay(HashMap::new()).await;
    let args = render_args(&clone, &action.args).await?;
    let error = if args.is_empty() { None } else { Some(args.join(" ")) };
    ctx.log("contest stopped", error.clone()).await;
    match error {
        Some(msg) => ctx.fatal(msg),
        None => ctx.cancel.cancel(),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assemble_quotes_tokens_with_whitespace() {
        let args = vec!["echo".to_string(), "hello world".to_string()];
        assert_eq!(assemble_command(&args), "echo 'hello world'");
    }

    #[test]
    fn assemble_honors_raw_shell_prefix() {
        let args = vec!["ignored".to_string(), "$ true && echo ok".to_string()];
        assert_eq!(assemble_command(&args), "true && echo ok");
    }
}
