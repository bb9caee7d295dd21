use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use super::{Schema, Validation};
use crate::config::{KeyPath, kind_name};
use crate::ids::{IdError, TypeTag};

/// Why a single value was rejected.
#[derive(Debug)]
pub enum Fail {
    Invalid(String),
    Id(IdError),
    /// Nested failures were already pushed to the validation context.
    Reported,
}

impl From<IdError> for Fail {
    fn from(e: IdError) -> Self { Fail::Id(e) }
}

/// A named, user-supplied coercion. Returns the normalized value or a message.
#[derive(Clone)]
pub struct Coercion {
    name: &'static str,
    f: Arc<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>,
}

impl Coercion {
    pub fn new<F>(name: &'static str, f: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self { name, f: Arc::new(f) }
    }
}

impl fmt::Debug for Coercion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "Coercion({})", self.name) }
}

/// Symbolic constant set; matching yields the canonical variant tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumSet {
    variants: Vec<String>,
    case_insensitive: bool,
}

impl EnumSet {
    pub fn new<I, S>(variants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { variants: variants.into_iter().map(Into::into).collect(), case_insensitive: false }
    }

    pub fn case_insensitive(mut self) -> Self {
        self.case_insensitive = true;
        self
    }

    pub fn canonical(&self, raw: &str) -> Option<&str> {
        let raw = raw.trim();
        self.variants
            .iter()
            .find(|v| if self.case_insensitive { v.eq_ignore_ascii_case(raw) } else { v.as_str() == raw })
            .map(String::as_str)
    }

    pub fn variants(&self) -> &[String] { &self.variants }
}

#[derive(Debug, Clone)]
pub enum Validator {
    Any,
    Bool,
    Int { min: Option<i64>, max: Option<i64> },
    Float { min: Option<f64>, max: Option<f64> },
    Str,
    /// Value must loosely equal one of these; the listed form is kept.
    OneOf(Vec<Value>),
    Enum(EnumSet),
    /// A lone value is promoted to a one-element list.
    List(Box<Validator>),
    Nested(Schema),
    DeclareId(TypeTag),
    UseId(TypeTag),
    /// `{lambda: code}` or `"!lambda code"`, normalized to `{lambda: code}`.
    Lambda,
    /// A lambda, or whatever the inner validator accepts.
    Templatable(Box<Validator>),
    /// Run validators in sequence, each on the previous output.
    All(Vec<Validator>),
    Custom(Coercion),
}

impl Validator {
    pub fn int_range(min: i64, max: i64) -> Self { Validator::Int { min: Some(min), max: Some(max) } }

    pub fn port() -> Self { Validator::int_range(1, 65535) }

    pub fn positive_float() -> Self { Validator::Float { min: Some(0.0), max: None } }

    pub fn list(inner: Validator) -> Self { Validator::List(Box::new(inner)) }

    pub fn templatable(inner: Validator) -> Self { Validator::Templatable(Box::new(inner)) }

    pub fn one_of<I, V>(options: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Validator::OneOf(options.into_iter().map(Into::into).collect())
    }

    pub fn custom<F>(name: &'static str, f: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        Validator::Custom(Coercion::new(name, f))
    }

    pub fn is_declaration(&self) -> bool {
        match self {
            Validator::DeclareId(_) => true,
            Validator::All(vs) => vs.iter().any(Validator::is_declaration),
            _ => false,
        }
    }

    /// Whether an omitted `generated` key still runs this validator (with null).
    pub fn fills_generated(&self) -> bool {
        matches!(self, Validator::DeclareId(_) | Validator::UseId(_))
    }

    /// Explicit names this validator would declare for `v`, found without validating.
    pub(crate) fn explicit_ids(&self, v: &Value, out: &mut Vec<String>) {
        match (self, v) {
            (Validator::DeclareId(_), Value::String(name)) => out.push(name.clone()),
            (Validator::Nested(schema), _) => schema.explicit_ids(v, out),
            (Validator::List(inner), Value::Array(xs)) => xs.iter().for_each(|x| inner.explicit_ids(x, out)),
            (Validator::List(inner), _) => inner.explicit_ids(v, out),
            (Validator::All(vs), _) => vs.iter().for_each(|x| x.explicit_ids(v, out)),
            _ => {}
        }
    }

    pub(crate) fn apply(
        &self,
        v: &Value,
        path: &KeyPath,
        enclosing: &KeyPath,
        cx: &mut Validation<'_>,
    ) -> Result<Value, Fail> {
        match self {
            Validator::Any => Ok(v.clone()),
            Validator::Bool => coerce_bool(v).map(Value::Bool),
            Validator::Int { min, max } => {
                let i = coerce_int(v)?;
                check_range(i as f64, min.map(|m| m as f64), max.map(|m| m as f64))?;
                Ok(Value::from(i))
            }
            Validator::Float { min, max } => {
                let x = coerce_float(v)?;
                check_range(x, *min, *max)?;
                Ok(Value::from(x))
            }
            Validator::Str => coerce_str(v).map(Value::String),
            Validator::OneOf(options) => options
                .iter()
                .find(|o| loosely_equal(o, v))
                .cloned()
                .ok_or_else(|| {
                    let opts: Vec<String> = options.iter().map(Value::to_string).collect();
                    Fail::Invalid(format!("unknown value {v}, valid options are {}", opts.join(", ")))
                }),
            Validator::Enum(set) => {
                let raw = match v {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    other => return Err(Fail::Invalid(format!("expected a string, got {}", kind_name(other)))),
                };
                set.canonical(&raw)
                    .map(|c| Value::String(c.to_string()))
                    .ok_or_else(|| {
                        Fail::Invalid(format!("unknown value `{raw}`, valid options are {}", set.variants.join(", ")))
                    })
            }
            Validator::List(inner) => {
                let items: Vec<&Value> = match v {
                    Value::Array(xs) => xs.iter().collect(),
                    Value::Null => Vec::new(),
                    other => vec![other],
                };
                let mut out = Vec::with_capacity(items.len());
                let mut failed = false;
                for (i, item) in items.into_iter().enumerate() {
                    let p = path.index(i);
                    match inner.apply(item, &p, &p, cx) {
                        Ok(x) => out.push(x),
                        Err(fail) => {
                            cx.fail(&p, fail);
                            failed = true;
                        }
                    }
                }
                if failed { Err(Fail::Reported) } else { Ok(Value::Array(out)) }
            }
            Validator::Nested(schema) => schema.check(v, path, cx).ok_or(Fail::Reported),
            Validator::DeclareId(ty) => {
                let name = match v {
                    Value::Null => None,
                    Value::String(s) => Some(s.as_str()),
                    other => return Err(Fail::Invalid(format!("expected an ID, got {}", kind_name(other)))),
                };
                let id = cx.declare(name, ty, enclosing)?;
                Ok(Value::String(id.name))
            }
            Validator::UseId(ty) => match v {
                // the only candidate is known once every fragment has declared its IDs
                Value::Null => {
                    cx.defer(path, None, ty);
                    Ok(Value::Null)
                }
                Value::String(name) => match cx.registry.reference(name, ty) {
                    Ok(id) => Ok(Value::String(id.name)),
                    Err(IdError::NotFound { .. }) => {
                        cx.defer(path, Some(name), ty);
                        Ok(v.clone())
                    }
                    Err(e) => Err(e.into()),
                },
                other => Err(Fail::Invalid(format!("expected an ID, got {}", kind_name(other)))),
            },
            Validator::Lambda => lambda(v),
            Validator::Templatable(inner) => {
                if is_lambda_shaped(v) { lambda(v) } else { inner.apply(v, path, enclosing, cx) }
            }
            Validator::All(vs) => {
                let mut cur = v.clone();
                for x in vs {
                    cur = x.apply(&cur, path, enclosing, cx)?;
                }
                Ok(cur)
            }
            Validator::Custom(c) => (c.f)(v).map_err(Fail::Invalid),
        }
    }
}

// ————————————————————————————————————————————————————————————————————————————
// SCALAR COERCIONS
// ————————————————————————————————————————————————————————————————————————————

fn coerce_bool(v: &Value) -> Result<bool, Fail> {
    match v {
        Value::Bool(b) => Ok(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "enable" => Ok(true),
            "false" | "no" | "off" | "disable" => Ok(false),
            _ => Err(Fail::Invalid(format!("expected a boolean, got `{s}`"))),
        },
        other => Err(Fail::Invalid(format!("expected a boolean, got {}", kind_name(other)))),
    }
}

fn coerce_int(v: &Value) -> Result<i64, Fail> {
    match v {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Ok(i);
            }
            match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => Ok(f as i64),
                _ => Err(Fail::Invalid(format!("expected an integer, got {n}"))),
            }
        }
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| Fail::Invalid(format!("expected an integer, got `{s}`"))),
        other => Err(Fail::Invalid(format!("expected an integer, got {}", kind_name(other)))),
    }
}

fn coerce_float(v: &Value) -> Result<f64, Fail> {
    let x = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match x {
        Some(x) if x.is_finite() => Ok(x),
        _ => Err(Fail::Invalid(format!("expected a number, got {v}"))),
    }
}

fn coerce_str(v: &Value) -> Result<String, Fail> {
    match v {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(Fail::Invalid(format!("expected a string, got {}", kind_name(other)))),
    }
}

fn check_range(x: f64, min: Option<f64>, max: Option<f64>) -> Result<(), Fail> {
    if let Some(min) = min {
        if x < min {
            return Err(Fail::Invalid(format!("value must be at least {min}")));
        }
    }
    if let Some(max) = max {
        if x > max {
            return Err(Fail::Invalid(format!("value must be at most {max}")));
        }
    }
    Ok(())
}

fn loosely_equal(option: &Value, v: &Value) -> bool {
    match (option, v) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::Number(a), Value::String(s)) => s.trim().parse::<f64>().ok() == a.as_f64(),
        (a, b) => a == b,
    }
}

fn is_lambda_shaped(v: &Value) -> bool {
    match v {
        Value::String(s) => s.starts_with("!lambda"),
        Value::Object(m) => m.contains_key("lambda"),
        _ => false,
    }
}

fn lambda(v: &Value) -> Result<Value, Fail> {
    let code = match v {
        Value::String(s) => s.strip_prefix("!lambda").map(str::trim),
        Value::Object(m) if m.len() == 1 => m.get("lambda").and_then(Value::as_str),
        _ => None,
    };
    let code = code.ok_or_else(|| Fail::Invalid("expected a lambda (`!lambda ...` or `{lambda: ...}`)".into()))?;
    let mut out = Map::new();
    out.insert("lambda".into(), Value::String(code.to_string()));
    Ok(Value::Object(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{IdRegistry, TypeTable};
    use serde_json::json;

    fn run(v: &Validator, raw: Value) -> Result<Value, String> {
        let mut reg = IdRegistry::new(TypeTable::new());
        let mut cx = Validation::new(&mut reg, 0, "t");
        let p = KeyPath::root().key("k");
        v.apply(&raw, &p, &KeyPath::root(), &mut cx).map_err(|f| format!("{f:?}"))
    }

    #[test]
    fn booleans_accept_words() {
        assert_eq!(run(&Validator::Bool, json!("Off")), Ok(json!(false)));
        assert_eq!(run(&Validator::Bool, json!("YES")), Ok(json!(true)));
        assert!(run(&Validator::Bool, json!(1)).is_err());
    }

    #[test]
    fn enums_map_to_canonical_tags() {
        let models = Validator::Enum(EnumSet::new(["TMC2208", "TMC2209"]).case_insensitive());
        assert_eq!(run(&models, json!("tmc2209")), Ok(json!("TMC2209")));
        assert!(run(&models, json!("tmc5160")).is_err());
        let strict = Validator::Enum(EnumSet::new(["HEAT", "COOL"]));
        assert!(run(&strict, json!("heat")).is_err());
    }

    #[test]
    fn one_of_keeps_listed_form() {
        let microsteps = Validator::one_of([256, 128, 64, 32, 16, 8, 4, 2, 0]);
        assert_eq!(run(&microsteps, json!("16")), Ok(json!(16)));
        assert!(run(&microsteps, json!(3)).is_err());
    }

    #[test]
    fn ranges_and_ports() {
        assert_eq!(run(&Validator::port(), json!("8080")), Ok(json!(8080)));
        assert!(run(&Validator::port(), json!(0)).is_err());
        assert!(run(&Validator::port(), json!(70000)).is_err());
        assert!(run(&Validator::positive_float(), json!(-1.5)).is_err());
        assert!(run(&Validator::Int { min: None, max: None }, json!(2.5)).is_err());
    }

    #[test]
    fn lists_promote_single_values() {
        let v = Validator::list(Validator::Str);
        assert_eq!(run(&v, json!("a")), Ok(json!(["a"])));
        assert_eq!(run(&v, json!(null)), Ok(json!([])));
        assert_eq!(run(&v, json!([1, "b"])), Ok(json!(["1", "b"])));
    }

    #[test]
    fn lambdas_normalize() {
        assert_eq!(run(&Validator::Lambda, json!("!lambda return 1;")), Ok(json!({"lambda": "return 1;"})));
        assert_eq!(run(&Validator::Lambda, json!({"lambda": "x();"})), Ok(json!({"lambda": "x();"})));
        let t = Validator::templatable(Validator::Int { min: None, max: None });
        assert_eq!(run(&t, json!("7")), Ok(json!(7)));
        assert_eq!(run(&t, json!("!lambda return 7;")), Ok(json!({"lambda": "return 7;"})));
    }

    #[test]
    fn all_chains_coercions() {
        let shorthand = Validator::custom("pin", |v| match v {
            Value::Object(_) => Ok(v.clone()),
            other => Ok(json!({"number": other})),
        });
        let pin = Schema::new().required("number", Validator::int_range(0, 39));
        let v = Validator::All(vec![shorthand, Validator::Nested(pin)]);
        assert_eq!(run(&v, json!("12")), Ok(json!({"number": 12})));
        assert!(run(&v, json!(40)).is_err());
    }
}
