//! Config tree primitives: the node type, key paths, and multi-document merge.
use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Diagnostic, ErrorKind};

/// A parsed configuration tree. Mappings keep insertion order (`preserve_order`).
pub type ConfigNode = Value;

// ————————————————————————————————————————————————————————————————————————————
// KEY PATHS
// ————————————————————————————————————————————————————————————————————————————

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(untagged)]
pub enum Seg {
    Key(String),
    Index(usize),
}

/// Location of a value inside one fragment. Renders as `.step_pin.number` / `[2]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct KeyPath(Vec<Seg>);

impl KeyPath {
    pub fn root() -> Self { Self::default() }

    pub fn key(&self, key: &str) -> Self {
        let mut segs = self.0.clone();
        segs.push(Seg::Key(key.to_string()));
        Self(segs)
    }

    pub fn index(&self, i: usize) -> Self {
        let mut segs = self.0.clone();
        segs.push(Seg::Index(i));
        Self(segs)
    }

    pub fn is_root(&self) -> bool { self.0.is_empty() }

    pub fn segments(&self) -> &[Seg] { &self.0 }

    /// Mutable lookup used to patch deferred values after validation.
    pub fn lookup_mut<'a>(&self, mut node: &'a mut Value) -> Option<&'a mut Value> {
        for seg in &self.0 {
            node = match (seg, node) {
                (Seg::Key(k), Value::Object(m)) => m.get_mut(k)?,
                (Seg::Index(i), Value::Array(xs)) => xs.get_mut(*i)?,
                _ => return None,
            };
        }
        Some(node)
    }

    pub fn lookup<'a>(&self, mut node: &'a Value) -> Option<&'a Value> {
        for seg in &self.0 {
            node = match (seg, node) {
                (Seg::Key(k), Value::Object(m)) => m.get(k)?,
                (Seg::Index(i), Value::Array(xs)) => xs.get(*i)?,
                _ => return None,
            };
        }
        Some(node)
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for seg in &self.0 {
            match seg {
                Seg::Key(k) => write!(f, ".{k}")?,
                Seg::Index(i) => write!(f, "[{i}]")?,
            }
        }
        Ok(())
    }
}

// ————————————————————————————————————————————————————————————————————————————
// HELPERS
// ————————————————————————————————————————————————————————————————————————————

pub fn kind_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}

/// Merge several top-level documents into one tree.
///
/// List-valued entries concatenate (`uart: [...]` split over two files);
/// any other key appearing twice is reported against the later document.
pub fn merge_documents<I>(docs: I) -> Result<Value, Vec<Diagnostic>>
where
    I: IntoIterator<Item = Value>,
{
    let mut out = Map::new();
    let mut errors = Vec::new();
    for (doc_ix, doc) in docs.into_iter().enumerate() {
        let Value::Object(map) = doc else {
            errors.push(Diagnostic::new(
                ErrorKind::SchemaViolation,
                format!("<document {doc_ix}>"),
                KeyPath::root(),
                format!("top level must be a mapping, got {}", kind_name(&doc)),
            ));
            continue;
        };
        for (key, value) in map {
            if let Some(existing) = out.get_mut(&key) {
                match (existing, value) {
                    (Value::Array(existing), Value::Array(more)) => existing.extend(more),
                    _ => errors.push(Diagnostic::new(
                        ErrorKind::SchemaViolation,
                        key.clone(),
                        KeyPath::root(),
                        format!("component `{key}` is configured in more than one document"),
                    )),
                }
            } else {
                out.insert(key, value);
            }
        }
    }
    if errors.is_empty() { Ok(Value::Object(out)) } else { Err(errors) }
}
