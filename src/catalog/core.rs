//! `core`: the application root. Always loaded, runs first.
use serde_json::Value;

use super::component_type;
use crate::component::{Catalog, ComponentSpec, Fragment};
use crate::ir::Expr;
use crate::run::{APP_TYPE, CORE};
use crate::schema::{Schema, Validator};
use crate::scheduler::{GenerationJob, StagedJob};

pub fn register(c: &mut Catalog) {
    c.types_mut().class(APP_TYPE, &[]);
    component_type(c);
    c.types_mut().class("Controller", &[]);
    c.types_mut().class("Nameable", &[]);

    let schema = Schema::new()
        .with_default("name", "node", Validator::custom("node name", node_name))
        .optional("comment", Validator::Str)
        .with_default("build_flags", Value::Array(vec![]), Validator::list(Validator::Str))
        .with_default("libraries", Value::Array(vec![]), Validator::list(Validator::custom("library", library)));
    c.register(ComponentSpec::new(CORE, schema).priority(100.0).to_code(to_code));
}

/// Hostname-safe: lowercase letters, digits and `-`, at most 31 characters.
fn node_name(v: &Value) -> Result<Value, String> {
    let s = v.as_str().ok_or("expected a string")?;
    if s.is_empty() || s.len() > 31 {
        return Err(format!("name `{s}` must be 1 to 31 characters long"));
    }
    if let Some(bad) = s.chars().find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')) {
        return Err(format!("character `{bad}` is not allowed in names"));
    }
    Ok(v.clone())
}

/// `name` or `name@version`.
fn library(v: &Value) -> Result<Value, String> {
    let s = v.as_str().ok_or("expected a library name")?.trim();
    match s.split_once('@') {
        Some((name, version)) if name.is_empty() || version.is_empty() => {
            Err(format!("`{s}` is not of the form name@version"))
        }
        _ if s.is_empty() => Err("library name is empty".into()),
        _ => Ok(Value::String(s.to_string())),
    }
}

fn to_code(f: Fragment) -> Box<dyn GenerationJob> {
    StagedJob::new(f.instance.clone(), f)
        .then(|f, cx| {
            let app = cx.app()?;
            let mut args = vec![Expr::from(f.str("name")?)];
            if let Some(comment) = f.get("comment").and_then(Value::as_str) {
                args.push(comment.into());
            }
            cx.add(&app, "pre_setup", args)?;

            let strings = |key: &str| -> Vec<String> {
                f.get(key)
                    .and_then(Value::as_array)
                    .map(|xs| xs.iter().filter_map(Value::as_str).map(str::to_string).collect())
                    .unwrap_or_default()
            };
            for flag in strings("build_flags") {
                cx.add_build_flag(&flag);
            }
            for lib in strings("libraries") {
                match lib.split_once('@') {
                    Some((name, version)) => cx.add_library(name, Some(version)),
                    None => cx.add_library(&lib, None),
                }
            }
            Ok(())
        })
        .boxed()
}
