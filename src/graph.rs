//! Object graph / emission buffer.
//!
//! Append-only. `emissions()` is strictly global append order; the per-entry
//! index is only a view onto it, since later jobs interleave configuration
//! calls against objects declared earlier.
use indexmap::IndexMap;

use crate::ids::Identifier;
use crate::ir::{Emission, Op};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    Pointer,
    Value,
    Array,
    /// Exists in the target runtime; has a value without any emission.
    Imported,
}

#[derive(Debug, Clone)]
pub struct GraphEntry {
    pub id: Identifier,
    pub storage: Storage,
    /// Indices into the global emission list.
    pub emissions: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("ID `{0}` already has a value")]
    Redeclared(String),
    #[error("ID `{0}` has no value yet")]
    NoValue(String),
}

#[derive(Debug, Default)]
pub struct ObjectGraph {
    entries: IndexMap<String, GraphEntry>,
    emissions: Vec<Emission>,
    /// Names that gained a value since the scheduler last looked.
    fresh: Vec<String>,
}

impl ObjectGraph {
    pub fn new() -> Self { Self::default() }

    pub fn import(&mut self, id: &Identifier) {
        self.entries.entry(id.name.clone()).or_insert_with(|| GraphEntry {
            id: id.clone(),
            storage: Storage::Imported,
            emissions: Vec::new(),
        });
    }

    /// Append one emission against `target`; returns its sequence number.
    pub fn append(&mut self, target: &Identifier, op: Op, origin: &str) -> Result<u64, GraphError> {
        let seq = self.emissions.len();
        let deref = if op.is_declaration() {
            if self.entries.contains_key(&target.name) {
                return Err(GraphError::Redeclared(target.name.clone()));
            }
            let storage = match &op {
                Op::New { .. } => Storage::Pointer,
                Op::Progmem { .. } => Storage::Array,
                _ => Storage::Value,
            };
            self.entries.insert(target.name.clone(), GraphEntry {
                id: target.clone(),
                storage,
                emissions: vec![seq],
            });
            self.fresh.push(target.name.clone());
            storage == Storage::Pointer
        } else {
            let entry = self
                .entries
                .get_mut(&target.name)
                .ok_or_else(|| GraphError::NoValue(target.name.clone()))?;
            entry.emissions.push(seq);
            entry.storage == Storage::Pointer
        };
        self.emissions.push(Emission {
            seq: seq as u64,
            target: target.name.clone(),
            deref,
            op,
            origin: origin.to_string(),
        });
        Ok(seq as u64)
    }

    pub fn has_value(&self, name: &str) -> bool { self.entries.contains_key(name) }

    pub fn entry(&self, name: &str) -> Option<&GraphEntry> { self.entries.get(name) }

    pub fn emissions(&self) -> &[Emission] { &self.emissions }

    pub fn emissions_for<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a Emission> + 'a {
        let ixs = self.entries.get(name).map(|e| e.emissions.as_slice()).unwrap_or(&[]);
        ixs.iter().map(move |&i| &self.emissions[i])
    }

    pub(crate) fn take_materialized(&mut self) -> Vec<String> { std::mem::take(&mut self.fresh) }

    pub fn into_emissions(self) -> Vec<Emission> { self.emissions }
}
