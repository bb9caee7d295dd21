// Strongly-typed emission IR. No serde_json::Value past `Expr::from_config`.
use std::fmt;

use ordered_float::OrderedFloat;
use serde::Serialize;
use serde_json::Value;

use crate::ids::{Identifier, TypeTag};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Expr {
    Null,
    Bool(bool),
    Int(i64),
    Float(OrderedFloat<f64>),
    Str(String),
    /// Handle of a generated (or imported) object.
    Var(String),
    /// Verbatim target-language token, e.g. an enum constant.
    Raw(String),
    /// `new T(args)` without binding it to an identifier.
    Construct { ty: TypeTag, args: Vec<Expr> },
    /// `target.method(args)` used as a value.
    Call { target: String, method: String, args: Vec<Expr> },
    Lambda { params: Vec<(TypeTag, String)>, ret: TypeTag, body: String },
    Array(Vec<Expr>),
}

impl Expr {
    /// Literal view of a validated scalar or list.
    pub fn from_config(v: &Value) -> Expr {
        match v {
            Value::Null => Expr::Null,
            Value::Bool(b) => Expr::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Expr::Int(i),
                None => Expr::Float(OrderedFloat(n.as_f64().unwrap_or_default())),
            },
            Value::String(s) => Expr::Str(s.clone()),
            Value::Array(xs) => Expr::Array(xs.iter().map(Expr::from_config).collect()),
            Value::Object(m) => match m.get("lambda").and_then(Value::as_str) {
                Some(body) => Expr::Lambda { params: Vec::new(), ret: TypeTag::new("void"), body: body.to_string() },
                None => Expr::Raw(v.to_string()),
            },
        }
    }

    pub fn var(id: &Identifier) -> Expr { Expr::Var(id.name.clone()) }
}

impl From<bool> for Expr { fn from(b: bool) -> Self { Expr::Bool(b) } }
impl From<i64> for Expr { fn from(i: i64) -> Self { Expr::Int(i) } }
impl From<f64> for Expr { fn from(f: f64) -> Self { Expr::Float(OrderedFloat(f)) } }
impl From<&str> for Expr { fn from(s: &str) -> Self { Expr::Str(s.to_string()) } }
impl From<&Identifier> for Expr { fn from(id: &Identifier) -> Self { Expr::var(id) } }

/// What one emission does to its target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    /// `auto *x = new T(args);`, value is a pointer.
    New { ty: TypeTag, args: Vec<Expr> },
    /// `T x = value;`
    Let { ty: TypeTag, value: Expr },
    /// `static const uint8_t x[] PROGMEM = {..};`
    Progmem { data: Vec<u8> },
    /// `x->method(args);` or `x.method(args);`
    Call { method: String, args: Vec<Expr> },
}

impl Op {
    pub fn is_declaration(&self) -> bool { !matches!(self, Op::Call { .. }) }
}

/// One generated statement, in global append order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Emission {
    pub seq: u64,
    pub target: String,
    /// Target is held by pointer (`->`) rather than by value (`.`).
    pub deref: bool,
    #[serde(flatten)]
    pub op: Op,
    /// Component instance whose job appended this.
    pub origin: String,
}

// ————————————————————————————————————————————————————————————————————————————
// TEXT RENDERING
// ————————————————————————————————————————————————————————————————————————————

struct Args<'a>(&'a [Expr]);

impl fmt::Display for Args<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, a) in self.0.iter().enumerate() {
            if i > 0 { f.write_str(", ")?; }
            write!(f, "{a}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Null => f.write_str("nullptr"),
            Expr::Bool(b) => write!(f, "{b}"),
            Expr::Int(i) => write!(f, "{i}"),
            Expr::Float(x) => {
                if x.0.is_finite() && x.0.fract() == 0.0 { write!(f, "{:.1}f", x.0) } else { write!(f, "{}f", x.0) }
            }
            Expr::Str(s) => write!(f, "{s:?}"),
            Expr::Var(name) | Expr::Raw(name) => f.write_str(name),
            Expr::Construct { ty, args } => write!(f, "new {ty}({})", Args(args)),
            Expr::Call { target, method, args } => write!(f, "{target}.{method}({})", Args(args)),
            Expr::Lambda { params, ret, body } => {
                f.write_str("[=](")?;
                for (i, (ty, name)) in params.iter().enumerate() {
                    if i > 0 { f.write_str(", ")?; }
                    write!(f, "{ty} {name}")?;
                }
                write!(f, ") -> {ret} {{ {body} }}")
            }
            Expr::Array(xs) => write!(f, "{{{}}}", Args(xs)),
        }
    }
}

impl fmt::Display for Emission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = &self.target;
        match &self.op {
            Op::New { ty, args } => write!(f, "{ty} *{t} = new {ty}({});", Args(args)),
            Op::Let { ty, value } => write!(f, "{ty} {t} = {value};"),
            Op::Progmem { data } => {
                write!(f, "static const uint8_t {t}[{}] PROGMEM = {{", data.len())?;
                for (i, b) in data.iter().enumerate() {
                    if i > 0 { f.write_str(", ")?; }
                    write!(f, "0x{b:02X}")?;
                }
                f.write_str("};")
            }
            Op::Call { method, args } => {
                let access = if self.deref { "->" } else { "." };
                write!(f, "{t}{access}{method}({});", Args(args))
            }
        }
    }
}
