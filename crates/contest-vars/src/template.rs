//! Template compiler
//!
//! Renders `{{ .dot.path }}` expressions against the union of a [`Vars`]
//! store and a per-call overlay, and `{{ func arg1 arg2 }}` expressions
//! against the store's registered function table. After rendering, the
//! result is scanned line-by-line and compilation fails if any line still
//! contains the literal sentinel `<no value>` — an unresolved placeholder is
//! treated as a class of bug the compiler must prevent, not silently
//! tolerated.

use crate::store::{Vars, VarFn};
use crate::{Result, VarsError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

const NO_VALUE: &str = "<no value>";

/// Render `source` against `vars`, merging `overlay` into the data used for
/// `.path` resolution only (function-call arguments that start with `.` are
/// resolved against the live store, not the overlay — mirroring the
/// distinction between a template's top-level field access and an explicit
/// `getVar` call).
pub async fn compile(
    source: &str,
    vars: &Vars,
    overlay: HashMap<String, Value>,
) -> Result<String> {
    let merged = merge_overlay(vars.snapshot().await, &overlay);
    let funcs = merged_funcs(vars).await;

    let mut out = String::with_capacity(source.len());
    let mut rest = source;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| {
            VarsError::ParseError("unterminated `{{` in template".to_string())
        })?;
        let expr = after[..end].trim();

        out.push_str(&render_expr(expr, &merged, vars, &funcs).await?);

        rest = &after[end + 2..];
    }
    out.push_str(rest);

    check_no_unresolved(&out)?;

    Ok(out)
}

fn check_no_unresolved(rendered: &str) -> Result<()> {
    for (line_no, line) in rendered.lines().enumerate() {
        if line.contains(NO_VALUE) {
            return Err(VarsError::UnresolvedVariable {
                line: line.to_string(),
                line_no,
            });
        }
    }
    Ok(())
}

fn merge_overlay(mut base: Value, overlay: &HashMap<String, Value>) -> Value {
    if !base.is_object() {
        base = Value::Object(Default::default());
    }
    let obj = base.as_object_mut().expect("just ensured object");
    for (k, v) in overlay {
        obj.insert(k.clone(), v.clone());
    }
    base
}

async fn render_expr(
    expr: &str,
    merged: &Value,
    vars: &Vars,
    funcs: &HashMap<String, VarFn>,
) -> Result<String> {
    if expr.starts_with('.') {
        return Ok(resolve_dotted(merged, expr)
            .map(value_to_template_string)
            .unwrap_or_else(|| NO_VALUE.to_string()));
    }

    let tokens = tokenize(expr)?;
    let Some((name, arg_tokens)) = tokens.split_first() else {
        return Ok(NO_VALUE.to_string());
    };

    let func = funcs
        .get(name.as_str())
        .cloned()
        .ok_or_else(|| VarsError::UnknownFunc(name.as_str().to_string()))?;

    let mut args = Vec::with_capacity(arg_tokens.len());
    for tok in arg_tokens {
        args.push(resolve_token(tok, vars).await);
    }

    let value = func(vars, &args)?;
    Ok(value_to_template_string(&value))
}

fn value_to_template_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// A raw token from a function call: either a quoted literal, a dotted path,
/// or a bare literal (number, bool, or fallback string).
#[derive(Debug, Clone)]
enum Token {
    Quoted(String),
    Path(String),
    Bare(String),
}

impl Token {
    fn as_str(&self) -> &str {
        match self {
            Token::Quoted(s) | Token::Path(s) | Token::Bare(s) => s,
        }
    }
}

fn tokenize(expr: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = expr.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '"' {
            chars.next();
            let mut s = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '"' {
                    closed = true;
                    break;
                }
                s.push(c);
            }
            if !closed {
                return Err(VarsError::ParseError(format!(
                    "unterminated quoted argument in {expr:?}"
                )));
            }
            tokens.push(Token::Quoted(s));
            continue;
        }

        let mut s = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_whitespace() {
                break;
            }
            s.push(c);
            chars.next();
        }
        if s.starts_with('.') {
            tokens.push(Token::Path(s));
        } else {
            tokens.push(Token::Bare(s));
        }
    }

    Ok(tokens)
}

async fn resolve_token(tok: &Token, vars: &Vars) -> Value {
    match tok {
        Token::Quoted(s) => Value::String(s.clone()),
        Token::Path(p) => vars.get(p).await.unwrap_or(Value::Null),
        Token::Bare(s) => bare_to_value(s),
    }
}

fn bare_to_value(s: &str) -> Value {
    if let Ok(i) = s.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = s.parse::<f64>() {
        return Value::from(f);
    }
    match s {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(s.to_string()),
    }
}

fn resolve_dotted<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = data;
    for key in path.split('.').skip(1) {
        if key.is_empty() {
            continue;
        }
        cur = cur.as_object()?.get(key)?;
    }
    Some(cur)
}

/// Base functions, always available, overriding any user-registered
/// function of the same name (mirrors the original's base-overrides-user
/// merge order).
async fn merged_funcs(vars: &Vars) -> HashMap<String, VarFn> {
    let mut m = vars.funcs_snapshot().await;

    m.insert("existsVar".to_string(), base_exists_var());
    m.insert("getVar".to_string(), base_get_var());
    m.insert("setVar".to_string(), base_set_var());
    m.insert("setgetVar".to_string(), base_setget_var());
    m.insert("newKey".to_string(), base_new_key());
    m.insert("addInt".to_string(), base_add_int());

    m
}

fn base_exists_var() -> VarFn {
    Arc::new(|vars, args| {
        let vars = vars.clone();
        let path = path_arg(args, 0)?;
        let found = futures_block(async move { vars.exists(&path).await });
        Ok(Value::Bool(found))
    })
}

fn base_get_var() -> VarFn {
    Arc::new(|vars, args| {
        let vars = vars.clone();
        let path = path_arg(args, 0)?;
        let v = futures_block(async move { vars.get(&path).await });
        Ok(v.unwrap_or(Value::Null))
    })
}

fn base_set_var() -> VarFn {
    Arc::new(|vars, args| {
        let vars = vars.clone();
        let path = path_arg(args, 0)?;
        let value = args.get(1).cloned().unwrap_or(Value::Null);
        futures_block(async move {
            let _ = vars.set(&path, value).await;
        });
        Ok(Value::String(String::new()))
    })
}

fn base_setget_var() -> VarFn {
    Arc::new(|vars, args| {
        let vars = vars.clone();
        let path = path_arg(args, 0)?;
        let value = args.get(1).cloned().unwrap_or(Value::Null);
        let ret = value.clone();
        futures_block(async move {
            let _ = vars.set(&path, value).await;
        });
        Ok(ret)
    })
}

fn base_new_key() -> VarFn {
    Arc::new(|_vars, _args| {
        use ed25519_dalek::SigningKey;
        use rand::rngs::OsRng;

        let key = SigningKey::generate(&mut OsRng);
        Ok(Value::String(hex::encode(key.to_bytes())))
    })
}

fn base_add_int() -> VarFn {
    Arc::new(|_vars, args| {
        let a = args.first().and_then(Value::as_i64).unwrap_or(0);
        let b = args.get(1).and_then(Value::as_i64).unwrap_or(0);
        Ok(Value::from(a + b))
    })
}

fn path_arg(args: &[Value], idx: usize) -> Result<String> {
    args.get(idx)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| VarsError::ParseError(format!("expected path argument at index {idx}")))
}

/// Template rendering is invoked from async contexts but the function-table
/// closures are plain `Fn`, so base functions that touch the store resolve
/// their single `Vars` lock acquisition synchronously rather than making
/// every helper function signature `async`. This never nests under a lock
/// already held by the caller, so it cannot deadlock.
fn futures_block<F: std::future::Future>(fut: F) -> F::Output {
    futures::executor::block_on(fut)
}

mod hex {
    pub fn encode(bytes: [u8; 32]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn renders_dotted_path() {
        let vars = Vars::new(Value::Null);
        vars.set(".name", json!("no0")).await.unwrap();

        let out = compile("hello {{.name}}", &vars, HashMap::new())
            .await
            .unwrap();
        assert_eq!(out, "hello no0");
    }

    #[tokio::test]
    async fn fails_on_unresolved_placeholder() {
        let vars = Vars::new(Value::Null);
        let err = compile("value={{.missing}}", &vars, HashMap::new())
            .await
            .unwrap_err();
        match err {
            VarsError::UnresolvedVariable { line_no, .. } => assert_eq!(line_no, 0),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn renders_overlay_over_store() {
        let vars = Vars::new(Value::Null);
        vars.set(".self.range.port", json!("1")).await.unwrap();

        let out = compile("port={{.self.range.port}}", &vars, HashMap::new())
            .await
            .unwrap();
        assert_eq!(out, "port=1");
    }

    #[tokio::test]
    async fn set_var_then_get_var_function_calls() {
        let vars = Vars::new(Value::Null);
        let out = compile(
            r#"{{setVar ".x" "hi"}}{{getVar ".x"}}"#,
            &vars,
            HashMap::new(),
        )
        .await
        .unwrap();
        assert_eq!(out, "hi");
    }

    #[tokio::test]
    async fn add_int_sums_bare_args() {
        let vars = Vars::new(Value::Null);
        let out = compile("{{addInt 2 3}}", &vars, HashMap::new())
            .await
            .unwrap();
        assert_eq!(out, "5");
    }
}
