//! In-memory scenario model
//!
//! Mirrors the YAML scenario file one to one; [`Scenario::parse`] both
//! deserializes and validates, so a [`Scenario`] in hand is always
//! well-formed (non-empty `expects`, well-formed node aliases, no duplicate
//! `same_host` entries).

use crate::{Result, ScenarioError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;

fn node_alias_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^no\d+$").expect("static regex"))
}

/// Root of a scenario file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub vars: Value,

    pub designs: Designs,

    #[serde(default)]
    pub nodes: NodesConfig,

    #[serde(default)]
    pub ignore_abnormal_container_exit: bool,

    pub expects: Vec<Expect>,
}

/// Node templates and the shared genesis template.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Designs {
    pub common: Option<String>,
    pub number_nodes: Option<u32>,
    #[serde(default)]
    pub nodes: HashMap<String, String>,
    pub genesis: Option<String>,
}

/// Node placement constraints.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodesConfig {
    #[serde(default)]
    pub same_host: Vec<String>,
}

/// One scenario step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Expect {
    /// No polling: the engine logs the message and advances immediately.
    LogAnnounce { log: String },
    Condition(ConditionExpect),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionExpect {
    pub condition: ConditionSpec,
    pub range: Option<Vec<RangeColumn>>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub registers: Vec<Register>,
    /// Poll interval, e.g. `"500ms"`. Defaults to 300ms if unset.
    pub interval: Option<String>,
    /// Delay before the first poll, e.g. `"2s"`.
    pub initial_wait: Option<String>,
    #[serde(default)]
    pub if_condition_failed: IfConditionFailed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum IfConditionFailed {
    #[default]
    Nothing,
    StopContest,
}

/// A condition before template compilation: either a bare query string
/// (a document query, or a host command if it starts with `$ `), or a map
/// distinguishing a document query from a count expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionSpec {
    String(String),
    Map(ConditionMap),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionMap {
    pub query: Option<String>,
    pub count: Option<String>,
}

/// One column of a range table: a name bound to equal-length values.
pub type RangeColumn = HashMap<String, Vec<Value>>;

/// Merge a list of (possibly single-key) column maps into one binding table
/// and fan it out into per-row bindings, in column declaration order.
pub fn fan_out(range: &[RangeColumn]) -> Result<Vec<HashMap<String, Value>>> {
    let mut columns: Vec<(&str, &Vec<Value>)> = Vec::new();
    for map in range {
        for (name, values) in map {
            columns.push((name.as_str(), values));
        }
    }

    let Some((_, first)) = columns.first() else {
        return Ok(Vec::new());
    };
    let n = first.len();
    for (name, values) in &columns {
        if values.len() != n {
            return Err(ScenarioError::Invalid(format!(
                "range column `{name}` has {} values, expected {n}",
                values.len()
            )));
        }
    }

    let mut rows = Vec::with_capacity(n);
    for i in 0..n {
        let mut row = HashMap::with_capacity(columns.len());
        for (name, values) in &columns {
            row.insert(name.to_string(), values[i].clone());
        }
        rows.push(row);
    }
    Ok(rows)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub properties: Option<HashMap<String, Value>>,
    pub range: Option<Vec<RangeColumn>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Register {
    pub assign: String,
    pub format: Option<String>,
    #[serde(rename = "type")]
    pub register_type: Option<String>,
}

impl Scenario {
    /// Parse and validate a scenario file from disk.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ScenarioError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&content, path)
    }

    /// Parse and validate scenario YAML content. `path` is used only for
    /// error messages.
    pub fn parse(content: &str, path: &Path) -> Result<Self> {
        let scenario: Scenario =
            serde_yaml::from_str(content).map_err(|e| ScenarioError::ParseError {
                path: path.to_path_buf(),
                source: e,
            })?;
        scenario.validate()?;
        Ok(scenario)
    }

    fn validate(&self) -> Result<()> {
        if self.expects.is_empty() {
            return Err(ScenarioError::Invalid("expects must not be empty".into()));
        }

        for alias in self.designs.nodes.keys() {
            if !node_alias_re().is_match(alias) {
                return Err(ScenarioError::Invalid(format!(
                    "node alias `{alias}` must match ^no\\d+$"
                )));
            }
        }

        let mut seen = HashSet::new();
        for alias in &self.nodes.same_host {
            if !seen.insert(alias.as_str()) {
                return Err(ScenarioError::Invalid(format!(
                    "duplicate alias `{alias}` in nodes.same_host"
                )));
            }
        }

        for expect in &self.expects {
            expect.validate()?;
        }

        Ok(())
    }
}

impl Expect {
    fn validate(&self) -> Result<()> {
        let Expect::Condition(c) = self else {
            return Ok(());
        };

        for register in &c.registers {
            if !register.assign.starts_with('.') {
                return Err(ScenarioError::Invalid(format!(
                    "register assign path `{}` must start with `.`",
                    register.assign
                )));
            }
        }

        if let Some(range) = &c.range {
            fan_out(range)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario(yaml: &str) -> Result<Scenario> {
        Scenario::parse(yaml, Path::new("test.yml"))
    }

    #[test]
    fn log_only_parses() {
        let s = scenario(
            r#"
designs:
  genesis: "g"
expects:
  - log: "hello"
"#,
        )
        .unwrap();
        assert_eq!(s.expects.len(), 1);
        assert!(matches!(&s.expects[0], Expect::LogAnnounce { log } if log == "hello"));
    }

    #[test]
    fn empty_expects_rejected() {
        let err = scenario(
            r#"
designs: {}
expects: []
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ScenarioError::Invalid(_)));
    }

    #[test]
    fn bad_node_alias_rejected() {
        let err = scenario(
            r#"
designs:
  nodes:
    node-zero: "x"
expects:
  - log: "hi"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ScenarioError::Invalid(_)));
    }

    #[test]
    fn duplicate_same_host_rejected() {
        let err = scenario(
            r#"
designs: {}
nodes:
  same_host: ["no0", "no0"]
expects:
  - log: "hi"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ScenarioError::Invalid(_)));
    }

    #[test]
    fn condition_expect_with_range_parses() {
        let s = scenario(
            r#"
designs: {}
expects:
  - condition: "{\"node\":\"{{.self.range.node}}\"}"
    range: [ {node: [no0, no1]} ]
    interval: "500ms"
    registers:
      - assign: ".nodes.no0.ready"
        format: "json"
"#,
        )
        .unwrap();
        let Expect::Condition(c) = &s.expects[0] else {
            panic!("expected condition expect");
        };
        assert_eq!(c.registers[0].assign, ".nodes.no0.ready");
        let rows = fan_out(c.range.as_ref().unwrap()).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn fan_out_mismatched_lengths_rejected() {
        let mut a = HashMap::new();
        a.insert("node".to_string(), vec![Value::from("no0"), Value::from("no1")]);
        let mut b = HashMap::new();
        b.insert("port".to_string(), vec![Value::from("1")]);
        let err = fan_out(&[a, b]).unwrap_err();
        assert!(matches!(err, ScenarioError::Invalid(_)));
    }
}
