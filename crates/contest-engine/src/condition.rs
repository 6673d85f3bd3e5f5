//! Compiled, pollable conditions.
//!
//! A [`ConditionSpec`] from the scenario file is rendered once per poll
//! target (see [`compile`]) into one of three [`ConditionQuery`]
//! implementations, matching the three condition shapes the scenario format
//! allows: a document find, a document count compared against an
//! expression, or a host shell command.

use crate::compare::Comparison;
use crate::{EngineError, Result};
use async_trait::async_trait;
use contest_host::HostAdapter;
use contest_scenario::{ConditionMap, ConditionSpec};
use contest_store::DocumentStore;
use contest_vars::Vars;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A compiled condition, ready to be polled. `find` is side-effect free and
/// may be called repeatedly; a miss is `(_, false)`, never an error.
#[async_trait]
pub trait ConditionQuery: Send + Sync {
    fn describe(&self) -> String;

    async fn find(&self) -> Result<(Option<Value>, bool)>;
}

struct DocumentFind {
    query: String,
    store: Arc<dyn DocumentStore>,
}

#[async_trait]
impl ConditionQuery for DocumentFind {
    fn describe(&self) -> String {
        format!("find {}", self.query)
    }

    async fn find(&self) -> Result<(Option<Value>, bool)> {
        let query = parse_query(&self.query)?;
        let doc = self.store.find_one(&query).await?;
        let matched = doc.is_some();
        Ok((doc.map(Value::Object), matched))
    }
}

struct DocumentCount {
    query: String,
    comparison: Comparison,
    store: Arc<dyn DocumentStore>,
}

#[async_trait]
impl ConditionQuery for DocumentCount {
    fn describe(&self) -> String {
        format!("count {}", self.query)
    }

    async fn find(&self) -> Result<(Option<Value>, bool)> {
        let query = parse_query(&self.query)?;
        let count = self.store.count(&query).await?;
        Ok((None, self.comparison.evaluate(count)))
    }
}

struct HostCommand {
    command: String,
    host: Arc<dyn HostAdapter>,
}

#[async_trait]
impl ConditionQuery for HostCommand {
    fn describe(&self) -> String {
        format!("$ {}", self.command)
    }

    async fn find(&self) -> Result<(Option<Value>, bool)> {
        let out = self.host.run_command(&self.command).await?;
        let mut text = out.stdout.trim().to_string();
        if !out.exit_ok {
            text.push_str(&out.stderr);
        }
        Ok((Some(Value::String(text)), out.exit_ok))
    }
}

fn parse_query(rendered: &str) -> Result<Value> {
    serde_json::from_str(rendered)
        .map_err(|e| EngineError::Validation(format!("invalid query json `{rendered}`: {e}")))
}

/// Renders `spec` against `vars`/`overlay` and builds the matching
/// [`ConditionQuery`]. `host` is required for `$ <command>` conditions;
/// compilation fails if one is used without a host bound in scope.
pub async fn compile(
    spec: &ConditionSpec,
    vars: &Vars,
    overlay: HashMap<String, Value>,
    host: Option<Arc<dyn HostAdapter>>,
    store: Arc<dyn DocumentStore>,
) -> Result<Box<dyn ConditionQuery>> {
    match spec {
        ConditionSpec::String(s) => {
            if let Some(cmd) = s.strip_prefix("$ ") {
                let host = host.ok_or_else(|| {
                    EngineError::Validation(
                        "host command condition requires a host binding".to_string(),
                    )
                })?;
                let rendered = contest_vars::compile(cmd, vars, overlay).await?;
                Ok(Box::new(HostCommand {
                    command: rendered,
                    host,
                }))
            } else {
                let rendered = contest_vars::compile(s, vars, overlay).await?;
                Ok(Box::new(DocumentFind {
                    query: rendered,
                    store,
                }))
            }
        }
        ConditionSpec::Map(ConditionMap { query, count }) => {
            let query = query.as_ref().ok_or_else(|| {
                EngineError::Validation("condition map requires `query`".to_string())
            })?;
            let rendered_query = contest_vars::compile(query, vars, overlay.clone()).await?;

            match count {
                Some(expr) => {
                    let rendered_expr = contest_vars::compile(expr, vars, overlay).await?;
                    let comparison = Comparison::parse(&rendered_expr)?;
                    Ok(Box::new(DocumentCount {
                        query: rendered_query,
                        comparison,
                        store,
                    }))
                }
                None => Ok(Box::new(DocumentFind {
                    query: rendered_query,
                    store,
                })),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contest_store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn document_find_matches_inserted_entry() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let vars = Vars::new(Value::Null);

        let entries = vec![contest_store::LogEntry::parse("no0", false, r#"{"msg":"ready"}"#)];
        store.insert_batch(entries).await.unwrap();

        let spec = ConditionSpec::String(r#"{"node":"no0","msg":"ready"}"#.to_string());
        let query = compile(&spec, &vars, HashMap::new(), None, store).await.unwrap();

        let (doc, matched) = query.find().await.unwrap();
        assert!(matched);
        assert_eq!(doc.unwrap()["msg"], json!("ready"));
    }

    #[tokio::test]
    async fn document_count_evaluates_comparison() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let vars = Vars::new(Value::Null);

        for _ in 0..3 {
            store
                .insert_batch(vec![contest_store::LogEntry::parse(
                    "no0",
                    false,
                    r#"{"kind":"block"}"#,
                )])
                .await
                .unwrap();
        }

        let spec = ConditionSpec::Map(ConditionMap {
            query: Some(r#"{"kind":"block"}"#.to_string()),
            count: Some("> 2".to_string()),
        });
        let query = compile(&spec, &vars, HashMap::new(), None, store).await.unwrap();

        let (bound, matched) = query.find().await.unwrap();
        assert!(matched);
        assert!(bound.is_none());
    }

    #[tokio::test]
    async fn host_command_without_host_is_rejected() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let vars = Vars::new(Value::Null);
        let spec = ConditionSpec::String("$ true".to_string());

        assert!(compile(&spec, &vars, HashMap::new(), None, store)
            .await
            .is_err());
    }
}
