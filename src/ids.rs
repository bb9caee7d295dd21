//! Identifier registry: unique handles for generated objects.
//!
//! Declarations are made during validation (so collisions surface before any
//! code is generated) and read during both validation and generation. Type
//! compatibility for references goes through an explicit [`TypeTable`] of
//! is-a edges registered when the component catalog is defined.
use std::fmt;

use indexmap::{IndexMap, IndexSet};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

// ————————————————————————————————————————————————————————————————————————————
// TYPES
// ————————————————————————————————————————————————————————————————————————————

/// Logical target-language type of a generated object, e.g. `uart::UARTComponent`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TypeTag(String);

impl TypeTag {
    pub fn new(path: impl Into<String>) -> Self { Self(path.into()) }

    pub fn as_str(&self) -> &str { &self.0 }

    /// Last path segment in snake case: `web_server_spa::WebServerSpa` → `web_server_spa`.
    pub fn snake_name(&self) -> String {
        let last = self.0.rsplit("::").next().unwrap_or(&self.0);
        let chars: Vec<char> = last.chars().collect();
        let mut out = String::with_capacity(last.len() + 4);
        for (i, &c) in chars.iter().enumerate() {
            if c.is_ascii_uppercase() && i > 0 {
                let prev = chars[i - 1];
                let next_lower = chars.get(i + 1).is_some_and(|n| n.is_ascii_lowercase());
                if prev.is_ascii_lowercase() || prev.is_ascii_digit() || (prev.is_ascii_uppercase() && next_lower) {
                    out.push('_');
                }
            }
            out.push(c.to_ascii_lowercase());
        }
        out
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// Is-a relation between type tags, modeling the target object hierarchy.
#[derive(Debug, Clone, Default)]
pub struct TypeTable {
    parents: IndexMap<TypeTag, Vec<TypeTag>>,
}

impl TypeTable {
    pub fn new() -> Self { Self::default() }

    /// Register `path` with its direct parents; parents need not exist yet.
    pub fn class(&mut self, path: &str, parents: &[&TypeTag]) -> TypeTag {
        let tag = TypeTag::new(path);
        let entry = self.parents.entry(tag.clone()).or_default();
        for p in parents {
            if !entry.contains(p) {
                entry.push((*p).clone());
            }
        }
        tag
    }

    /// Reflexive, transitive is-a check.
    pub fn is_a(&self, sub: &TypeTag, sup: &TypeTag) -> bool {
        let mut seen: IndexSet<&TypeTag> = IndexSet::new();
        let mut stack = vec![sub];
        while let Some(t) = stack.pop() {
            if t == sup {
                return true;
            }
            if !seen.insert(t) {
                continue;
            }
            if let Some(ps) = self.parents.get(t) {
                stack.extend(ps.iter());
            }
        }
        false
    }
}

/// A declared handle. Ordering and hashing follow the name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Identifier {
    pub name: String,
    pub ty: TypeTag,
}

impl Identifier {
    pub fn new(name: impl Into<String>, ty: TypeTag) -> Self {
        Self { name: name.into(), ty }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.name) }
}

/// Where a declaration came from: owning component instance and its position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclSite {
    /// Index of the component instance in validation order.
    pub owner: usize,
    /// Instance-qualified position of the enclosing declaration, e.g. `stepper[0]`.
    pub position: String,
}

#[derive(Debug, Clone)]
pub struct Declaration {
    pub id: Identifier,
    pub site: DeclSite,
    pub generated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("ID `{name}` redefined, it was already declared at {first}")]
    Collision { name: String, first: String },
    #[error("couldn't find ID `{name}`")]
    NotFound { name: String },
    #[error("ID `{name}` has type {found}, expected {expected}")]
    TypeMismatch { name: String, found: TypeTag, expected: TypeTag },
    #[error("no ID of type {expected} has been declared")]
    NoDefault { expected: TypeTag },
    #[error("several IDs of type {expected} are declared ({}), set one explicitly", .candidates.join(", "))]
    Ambiguous { expected: TypeTag, candidates: Vec<String> },
    #[error("`{name}` is not a valid ID: {reason}")]
    InvalidName { name: String, reason: &'static str },
}

// ————————————————————————————————————————————————————————————————————————————
// REGISTRY
// ————————————————————————————————————————————————————————————————————————————

static ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

const RESERVED: &[&str] = &[
    "App", "auto", "bool", "break", "case", "class", "const", "delete", "else", "float",
    "for", "if", "int", "new", "return", "static", "struct", "switch", "this", "void", "while",
];

#[derive(Debug, Clone)]
pub struct IdRegistry {
    types: TypeTable,
    decls: IndexMap<String, Declaration>,
    /// Explicit names known before validation; never handed out by synthesis.
    reserved: IndexSet<String>,
}

impl IdRegistry {
    pub fn new(types: TypeTable) -> Self {
        Self { types, decls: IndexMap::new(), reserved: IndexSet::new() }
    }

    pub fn types(&self) -> &TypeTable { &self.types }

    pub fn validate_name(name: &str) -> Result<(), IdError> {
        if !ID_RE.is_match(name) {
            return Err(IdError::InvalidName {
                name: name.to_string(),
                reason: "use letters, digits and underscores, not starting with a digit",
            });
        }
        if RESERVED.contains(&name) {
            return Err(IdError::InvalidName { name: name.to_string(), reason: "reserved word" });
        }
        Ok(())
    }

    /// Keep `name` free for an explicit declaration still to come.
    pub fn reserve(&mut self, name: &str) { self.reserved.insert(name.to_string()); }

    fn is_taken(&self, name: &str) -> bool { self.decls.contains_key(name) || self.reserved.contains(name) }

    /// Declare a new identifier. With no name, one is synthesized from the type
    /// and the declaration position, stable across runs on unchanged input.
    pub fn declare(&mut self, name: Option<&str>, ty: &TypeTag, site: DeclSite) -> Result<Identifier, IdError> {
        let (name, generated) = match name {
            Some(n) => {
                Self::validate_name(n)?;
                if let Some(prev) = self.decls.get(n) {
                    return Err(IdError::Collision {
                        name: n.to_string(),
                        first: prev.site.position.clone(),
                    });
                }
                (n.to_string(), false)
            }
            None => (self.synthesize(ty, &site.position), true),
        };
        let id = Identifier::new(name.clone(), ty.clone());
        self.decls.insert(name, Declaration { id: id.clone(), site, generated });
        Ok(id)
    }

    fn synthesize(&self, ty: &TypeTag, position: &str) -> String {
        let pos = sanitize(position);
        let mut base = if pos.is_empty() {
            ty.snake_name()
        } else {
            format!("{}_{pos}", ty.snake_name())
        };
        if base.starts_with(|c: char| c.is_ascii_digit()) {
            base.insert(0, '_');
        }
        if !self.is_taken(&base) {
            return base;
        }
        (2..)
            .map(|n| format!("{base}_{n}"))
            .find(|candidate| !self.is_taken(candidate))
            .unwrap_or(base)
    }

    /// Resolve a reference to an already-declared identifier of a compatible type.
    pub fn reference(&self, name: &str, expected: &TypeTag) -> Result<Identifier, IdError> {
        let decl = self.decls.get(name).ok_or_else(|| IdError::NotFound { name: name.to_string() })?;
        if !self.types.is_a(&decl.id.ty, expected) {
            return Err(IdError::TypeMismatch {
                name: name.to_string(),
                found: decl.id.ty.clone(),
                expected: expected.clone(),
            });
        }
        Ok(decl.id.clone())
    }

    /// The only declared identifier compatible with `expected`.
    pub fn default_of(&self, expected: &TypeTag) -> Result<Identifier, IdError> {
        let candidates: Vec<&Declaration> =
            self.decls.values().filter(|d| self.types.is_a(&d.id.ty, expected)).collect();
        match candidates.as_slice() {
            [] => Err(IdError::NoDefault { expected: expected.clone() }),
            [only] => Ok(only.id.clone()),
            many => Err(IdError::Ambiguous {
                expected: expected.clone(),
                candidates: many.iter().map(|d| d.id.name.clone()).collect(),
            }),
        }
    }

    /// Bring in an identifier that exists in the target runtime (e.g. `App`).
    pub fn import(&mut self, name: &str, ty: &TypeTag) -> Identifier {
        let id = Identifier::new(name, ty.clone());
        self.decls.insert(name.to_string(), Declaration {
            id: id.clone(),
            site: DeclSite { owner: usize::MAX, position: "<runtime>".into() },
            generated: false,
        });
        id
    }

    pub fn lookup(&self, name: &str) -> Option<&Declaration> { self.decls.get(name) }

    pub fn declarations(&self) -> impl Iterator<Item = &Declaration> + '_ { self.decls.values() }

    pub fn len(&self) -> usize { self.decls.len() }

    pub fn is_empty(&self) -> bool { self.decls.is_empty() }
}

/// Lowercase alphanumerics; every run of anything else becomes one `_`.
pub fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}
