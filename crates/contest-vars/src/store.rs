//! Hierarchical, dot-path variable store
//!
//! Paths are dot-prefixed (`.a.b.c`); the leading dot is required on every
//! read/write. Branches are JSON objects, created on demand by `set`. Reads
//! and writes are mutually exclusive so `get` never observes a branch that a
//! concurrent `set` is still building.

use crate::{Result, VarsError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A template helper function, registered by name and captured by reference
/// into every render so no per-render allocation of the function table is
/// needed.
pub type VarFn =
    Arc<dyn Fn(&Vars, &[Value]) -> Result<Value> + Send + Sync>;

/// Mutable, hierarchical variable tree shared by clones via an `Arc`.
#[derive(Clone)]
pub struct Vars {
    tree: Arc<RwLock<Value>>,
    funcs: Arc<RwLock<HashMap<String, VarFn>>>,
}

fn split_path(path: &str) -> Result<Vec<&str>> {
    if !path.starts_with('.') {
        return Err(VarsError::BadPath(path.to_string()));
    }
    Ok(path.split('.').skip(1).collect())
}

impl Vars {
    /// Create a new store seeded with `initial` (an object; `Value::Null`
    /// becomes an empty object).
    pub fn new(initial: Value) -> Self {
        let tree = match initial {
            Value::Null => Value::Object(Default::default()),
            v => v,
        };
        Self {
            tree: Arc::new(RwLock::new(tree)),
            funcs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a named template helper function, available in every render.
    pub async fn add_func(&self, name: impl Into<String>, f: VarFn) {
        self.funcs.write().await.insert(name.into(), f);
    }

    pub(crate) async fn funcs_snapshot(&self) -> HashMap<String, VarFn> {
        self.funcs.read().await.clone()
    }

    /// Whether `path` resolves to a value.
    pub async fn exists(&self, path: &str) -> bool {
        self.get(path).await.is_some()
    }

    /// Read `path`. Returns `None` if any intermediate segment is missing.
    pub async fn get(&self, path: &str) -> Option<Value> {
        let keys = split_path(path).ok()?;
        let tree = self.tree.read().await;
        get_path(&tree, &keys).cloned()
    }

    /// Write `value` at `path`, creating intermediate object branches as
    /// needed.
    pub async fn set(&self, path: &str, value: Value) -> Result<()> {
        let keys = split_path(path)?;
        let mut tree = self.tree.write().await;
        set_path(&mut tree, &keys, value)
    }

    /// Move the subtree at `path` to `new_path`. Fails if `path` is absent.
    pub async fn rename(&self, path: &str, new_path: &str) -> Result<()> {
        let keys = split_path(path)?;
        let mut tree = self.tree.write().await;

        let taken = take_path(&mut tree, &keys)
            .ok_or_else(|| VarsError::KeyNotFound(path.to_string()))?;

        let new_keys = split_path(new_path)?;
        set_path(&mut tree, &new_keys, taken)
    }

    /// Deep-copy the current tree and apply `overlay` (a flat map of
    /// top-level keys to values) on top of the copy. The clone shares the
    /// function registry with the original but writes to either side never
    /// affect the other's tree.
    pub async fn clone_with_overlay(&self, overlay: HashMap<String, Value>) -> Self {
        let snapshot = self.tree.read().await.clone();
        let clone = Self {
            tree: Arc::new(RwLock::new(snapshot)),
            funcs: self.funcs.clone(),
        };

        for (k, v) in overlay {
            let _ = clone.set(&format!(".{k}"), v).await;
        }

        clone
    }

    /// Snapshot the full tree as a JSON value.
    pub async fn snapshot(&self) -> Value {
        self.tree.read().await.clone()
    }
}

fn get_path<'a>(root: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    let mut cur = root;
    for k in keys {
        cur = cur.as_object()?.get(*k)?;
    }
    Some(cur)
}

fn set_path(root: &mut Value, keys: &[&str], value: Value) -> Result<()> {
    if keys.is_empty() {
        *root = value;
        return Ok(());
    }

    let mut cur = root;
    for k in &keys[..keys.len() - 1] {
        if !cur.is_object() {
            *cur = Value::Object(Default::default());
        }
        let obj = cur.as_object_mut().expect("just ensured object");
        cur = obj
            .entry(k.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }

    if !cur.is_object() {
        *cur = Value::Object(Default::default());
    }
    cur.as_object_mut()
        .expect("just ensured object")
        .insert(keys[keys.len() - 1].to_string(), value);

    Ok(())
}

fn take_path(root: &mut Value, keys: &[&str]) -> Option<Value> {
    if keys.is_empty() {
        return None;
    }

    let mut cur = root;
    for k in &keys[..keys.len() - 1] {
        cur = cur.as_object_mut()?.get_mut(*k)?;
    }
    cur.as_object_mut()?.remove(keys[keys.len() - 1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let vars = Vars::new(Value::Null);
        vars.set(".a.b.c", json!(42)).await.unwrap();
        assert_eq!(vars.get(".a.b.c").await, Some(json!(42)));
        assert_eq!(vars.get(".a.b.missing").await, None);
    }

    #[tokio::test]
    async fn rename_moves_subtree() {
        let vars = Vars::new(Value::Null);
        vars.set(".self.name", json!("no0")).await.unwrap();
        vars.rename(".self", ".nodes.no0").await.unwrap();

        assert_eq!(vars.get(".self").await, None);
        assert_eq!(vars.get(".nodes.no0.name").await, Some(json!("no0")));
    }

    #[tokio::test]
    async fn rename_missing_source_fails() {
        let vars = Vars::new(Value::Null);
        assert!(vars.rename(".nope", ".elsewhere").await.is_err());
    }

    #[tokio::test]
    async fn clone_is_isolated() {
        let vars = Vars::new(Value::Null);
        vars.set(".x", json!(1)).await.unwrap();

        let cloned = vars.clone_with_overlay(HashMap::new()).await;
        cloned.set(".x", json!(2)).await.unwrap();

        assert_eq!(vars.get(".x").await, Some(json!(1)));
        assert_eq!(cloned.get(".x").await, Some(json!(2)));
    }

    #[tokio::test]
    async fn clone_overlay_applies_on_top() {
        let vars = Vars::new(Value::Null);
        vars.set(".x", json!(1)).await.unwrap();

        let mut overlay = HashMap::new();
        overlay.insert("self".to_string(), json!({"alias": "no0"}));
        let cloned = vars.clone_with_overlay(overlay).await;

        assert_eq!(cloned.get(".x").await, Some(json!(1)));
        assert_eq!(
            cloned.get(".self.alias").await,
            Some(json!("no0"))
        );
        assert_eq!(vars.get(".self").await, None);
    }
}
