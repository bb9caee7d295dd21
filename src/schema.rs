//! Declarative schemas and the validation/normalization engine.
//!
//! A [`Schema`] is an immutable set of key rules plus cross-field
//! constraints. Validation never mutates its input: it builds a new,
//! normalized mapping whose key order follows the schema, so running the
//! same schema over its own output yields the same value.
//!
//! Per key, in order:
//! 1. presence (required / optional / default / generated)
//! 2. default substitution
//! 3. coercion through the key's [`Validator`]
//! 4. nested re-validation when the coerced value is itself a fragment
//!
//! Constraints (`exactly_one_of`, `at_least_one_of`) run only once every key
//! of the fragment passed, and report as [`ErrorKind::ConstraintViolation`].
pub mod validators;

use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::config::{KeyPath, kind_name};
use crate::error::{Diagnostic, ErrorKind};
use crate::ids::{DeclSite, IdError, IdRegistry, Identifier, TypeTag};

pub use validators::{Coercion, EnumSet, Fail, Validator};

// ————————————————————————————————————————————————————————————————————————————
// TYPES
// ————————————————————————————————————————————————————————————————————————————

#[derive(Debug, Clone, PartialEq)]
pub enum Presence {
    Required,
    Optional,
    Default(Value),
    /// Optional; when omitted an ID validator synthesizes or looks up the value.
    Generated,
}

#[derive(Debug, Clone)]
pub struct KeyRule {
    pub presence: Presence,
    pub validator: Validator,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constraint {
    ExactlyOneOf(Vec<String>),
    AtLeastOneOf(Vec<String>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExtraKeys {
    #[default]
    Forbid,
    Allow,
}

#[derive(Debug, Clone, Default)]
pub struct Schema {
    rules: IndexMap<String, KeyRule>,
    constraints: Vec<Constraint>,
    extra: ExtraKeys,
}

/// An ID reference that could not be settled while its fragment was validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredRef {
    pub owner: usize,
    pub component: String,
    pub path: KeyPath,
    /// `None` when the key was omitted and the default instance is wanted.
    pub name: Option<String>,
    pub expected: TypeTag,
}

/// Per-fragment validation state: the shared registry plus collected problems.
pub struct Validation<'r> {
    registry: &'r mut IdRegistry,
    owner: usize,
    component: String,
    allow_extra: bool,
    errors: Vec<Diagnostic>,
    deferred: Vec<DeferredRef>,
}

// ————————————————————————————————————————————————————————————————————————————
// BUILDER
// ————————————————————————————————————————————————————————————————————————————

impl Schema {
    pub fn new() -> Self { Self::default() }

    fn rule(mut self, key: &str, presence: Presence, validator: Validator) -> Self {
        self.rules.insert(key.to_string(), KeyRule { presence, validator });
        self
    }

    pub fn required(self, key: &str, validator: Validator) -> Self {
        self.rule(key, Presence::Required, validator)
    }

    pub fn optional(self, key: &str, validator: Validator) -> Self {
        self.rule(key, Presence::Optional, validator)
    }

    pub fn with_default(self, key: &str, default: impl Into<Value>, validator: Validator) -> Self {
        self.rule(key, Presence::Default(default.into()), validator)
    }

    pub fn generated(self, key: &str, validator: Validator) -> Self {
        self.rule(key, Presence::Generated, validator)
    }

    pub fn exactly_one_of(mut self, keys: &[&str]) -> Self {
        self.constraints.push(Constraint::ExactlyOneOf(keys.iter().map(|k| k.to_string()).collect()));
        self
    }

    pub fn at_least_one_of(mut self, keys: &[&str]) -> Self {
        self.constraints.push(Constraint::AtLeastOneOf(keys.iter().map(|k| k.to_string()).collect()));
        self
    }

    pub fn allow_extra_keys(mut self) -> Self {
        self.extra = ExtraKeys::Allow;
        self
    }

    /// `self` extended by `child`; see [`Schema::merge`].
    pub fn extend(&self, child: &Schema) -> Schema { Schema::merge(self, child) }

    /// New schema with every key of both; on a shared key the child's rule wins
    /// but keeps the parent's position. Constraints concatenate.
    pub fn merge(parent: &Schema, child: &Schema) -> Schema {
        let mut rules = parent.rules.clone();
        for (k, r) in &child.rules {
            rules.insert(k.clone(), r.clone());
        }
        let mut constraints = parent.constraints.clone();
        constraints.extend(child.constraints.iter().cloned());
        let extra = if parent.extra == ExtraKeys::Allow || child.extra == ExtraKeys::Allow {
            ExtraKeys::Allow
        } else {
            ExtraKeys::Forbid
        };
        Schema { rules, constraints, extra }
    }

    pub fn get(&self, key: &str) -> Option<&KeyRule> { self.rules.get(key) }

    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ { self.rules.keys().map(String::as_str) }

    pub fn constraints(&self) -> &[Constraint] { &self.constraints }

    /// Every ID `raw` names explicitly, including in nested fragments.
    pub fn explicit_ids(&self, raw: &Value, out: &mut Vec<String>) {
        let Value::Object(map) = raw else { return };
        for (key, rule) in &self.rules {
            if let Some(v) = map.get(key.as_str()) {
                rule.validator.explicit_ids(v, out);
            }
        }
    }
}

// ————————————————————————————————————————————————————————————————————————————
// VALIDATION
// ————————————————————————————————————————————————————————————————————————————

impl Schema {
    /// Validate one fragment. All problems in the fragment are returned together.
    pub fn validate(&self, raw: &Value, cx: &mut Validation<'_>) -> Result<Value, Vec<Diagnostic>> {
        let mark = cx.errors.len();
        match self.check(raw, &KeyPath::root(), cx) {
            Some(v) if cx.errors.len() == mark => Ok(v),
            _ => Err(cx.errors.split_off(mark)),
        }
    }

    pub(crate) fn check(&self, raw: &Value, path: &KeyPath, cx: &mut Validation<'_>) -> Option<Value> {
        let empty = Map::new();
        let map = match raw {
            Value::Object(m) => m,
            Value::Null => &empty,
            other => {
                cx.report(ErrorKind::SchemaViolation, path, format!("expected a mapping, got {}", kind_name(other)));
                return None;
            }
        };
        let mark = cx.errors.len();

        // declarations first so same-fragment references resolve immediately
        let rules: Vec<(&String, &KeyRule)> = self.rules.iter().collect();
        let mut order: Vec<usize> = (0..rules.len()).collect();
        order.sort_by_key(|&i| !rules[i].1.validator.is_declaration());

        let mut slots: Vec<Option<Value>> = vec![None; rules.len()];
        for ix in order {
            let (key, rule) = rules[ix];
            let key_path = path.key(key);
            // an explicit null is the same as leaving the key out
            let value = match (map.get(key.as_str()).filter(|v| !v.is_null()), &rule.presence) {
                (Some(v), _) => v.clone(),
                (None, Presence::Required) => {
                    cx.report(ErrorKind::SchemaViolation, &key_path, "required key not provided");
                    continue;
                }
                (None, Presence::Optional) => continue,
                (None, Presence::Default(d)) => d.clone(),
                (None, Presence::Generated) if rule.validator.fills_generated() => Value::Null,
                (None, Presence::Generated) => continue,
            };
            match rule.validator.apply(&value, &key_path, path, cx) {
                Ok(v) => slots[ix] = Some(v),
                Err(fail) => cx.fail(&key_path, fail),
            }
        }

        let allow_extra = cx.allow_extra || self.extra == ExtraKeys::Allow;
        let mut extras = Vec::new();
        for (k, v) in map {
            if self.rules.contains_key(k) {
                continue;
            }
            if allow_extra {
                extras.push((k.clone(), v.clone()));
            } else {
                let valid: Vec<&str> = self.keys().collect();
                cx.report(
                    ErrorKind::SchemaViolation,
                    &path.key(k),
                    format!("extra keys not allowed (valid keys: {})", valid.join(", ")),
                );
            }
        }
        if cx.errors.len() > mark {
            return None;
        }

        let mut out = Map::new();
        for ((key, _), slot) in rules.iter().zip(slots) {
            if let Some(v) = slot {
                out.insert((*key).clone(), v);
            }
        }
        out.extend(extras);

        for c in &self.constraints {
            if let Err(msg) = c.check(&out) {
                cx.report(ErrorKind::ConstraintViolation, path, msg);
            }
        }
        if cx.errors.len() > mark { None } else { Some(Value::Object(out)) }
    }
}

impl Constraint {
    fn check(&self, out: &Map<String, Value>) -> Result<(), String> {
        let (keys, exact) = match self {
            Constraint::ExactlyOneOf(keys) => (keys, true),
            Constraint::AtLeastOneOf(keys) => (keys, false),
        };
        let present = keys.iter().filter(|k| out.get(*k).is_some_and(|v| !v.is_null())).count();
        match (present, exact) {
            (0, true) => Err(format!("must contain exactly one of: {}", keys.join(", "))),
            (n, true) if n > 1 => Err(format!("cannot specify more than one of: {}", keys.join(", "))),
            (0, false) => Err(format!("must contain at least one of: {}", keys.join(", "))),
            _ => Ok(()),
        }
    }
}

impl<'r> Validation<'r> {
    pub fn new(registry: &'r mut IdRegistry, owner: usize, component: impl Into<String>) -> Self {
        Self {
            registry,
            owner,
            component: component.into(),
            allow_extra: false,
            errors: Vec::new(),
            deferred: Vec::new(),
        }
    }

    pub fn allow_extra_keys(mut self, allow: bool) -> Self {
        self.allow_extra = allow;
        self
    }

    pub fn registry(&self) -> &IdRegistry { &*self.registry }

    pub fn report(&mut self, kind: ErrorKind, path: &KeyPath, message: impl Into<String>) {
        self.errors.push(Diagnostic::new(kind, self.component.clone(), path.clone(), message));
    }

    pub(crate) fn fail(&mut self, path: &KeyPath, fail: Fail) {
        match fail {
            Fail::Invalid(msg) => self.report(ErrorKind::SchemaViolation, path, msg),
            Fail::Id(err) => {
                let (kind, name) = match &err {
                    IdError::Collision { name, .. } => (ErrorKind::IdentifierCollision, Some(name)),
                    IdError::NotFound { name } | IdError::TypeMismatch { name, .. } => {
                        (ErrorKind::UnresolvedReference, Some(name))
                    }
                    IdError::NoDefault { .. } | IdError::Ambiguous { .. } => (ErrorKind::UnresolvedReference, None),
                    IdError::InvalidName { name, .. } => (ErrorKind::SchemaViolation, Some(name)),
                };
                let mut d = Diagnostic::new(kind, self.component.clone(), path.clone(), err.to_string());
                if let Some(name) = name {
                    d = d.with_identifier(name.clone());
                }
                self.errors.push(d);
            }
            Fail::Reported => {}
        }
    }

    pub(crate) fn declare(&mut self, name: Option<&str>, ty: &TypeTag, enclosing: &KeyPath) -> Result<Identifier, IdError> {
        let site = DeclSite { owner: self.owner, position: format!("{}{}", self.component, enclosing) };
        self.registry.declare(name, ty, site)
    }

    pub(crate) fn defer(&mut self, path: &KeyPath, name: Option<&str>, expected: &TypeTag) {
        tracing::trace!(component = %self.component, path = %path, ?name, "deferring ID reference");
        self.deferred.push(DeferredRef {
            owner: self.owner,
            component: self.component.clone(),
            path: path.clone(),
            name: name.map(str::to_string),
            expected: expected.clone(),
        });
    }

    pub fn into_deferred(self) -> Vec<DeferredRef> { self.deferred }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::TypeTable;
    use serde_json::json;

    fn registry() -> (IdRegistry, TypeTag, TypeTag) {
        let mut t = TypeTable::new();
        let bus = t.class("uart::UARTComponent", &[]);
        let dev = t.class("tmc::TMC2209", &[]);
        (IdRegistry::new(t), bus, dev)
    }

    fn pin() -> Schema {
        Schema::new()
            .required("number", Validator::int_range(0, 39))
            .with_default("inverted", false, Validator::Bool)
    }

    fn device(bus: &TypeTag, dev: &TypeTag) -> Schema {
        Schema::new()
            .generated("id", Validator::DeclareId(dev.clone()))
            .required("step_pin", Validator::Nested(pin()))
            .optional("sleep_pin", Validator::Nested(pin()))
            .with_default("reverse_direction", "no", Validator::Bool)
            .generated("uart_id", Validator::UseId(bus.clone()))
    }

    #[test]
    fn normalizes_defaults_coercions_and_generated_ids() {
        let (mut reg, bus, dev) = registry();
        reg.declare(Some("bus"), &bus, DeclSite { owner: 0, position: "uart[0]".into() }).unwrap();
        let mut cx = Validation::new(&mut reg, 1, "stepper[0]");
        let out = device(&bus, &dev)
            .validate(&json!({"step_pin": {"number": "5"}, "reverse_direction": "ON"}), &mut cx)
            .unwrap();
        assert_eq!(out, json!({
            "id": "tmc2209_stepper_0",
            "step_pin": {"number": 5, "inverted": false},
            "reverse_direction": true,
            "uart_id": null,
        }));
        // an omitted reference waits for every declaration before picking its target
        let deferred = cx.into_deferred();
        assert_eq!(deferred.len(), 1);
        assert_eq!((deferred[0].name.as_deref(), deferred[0].path.to_string()), (None, ".uart_id".to_string()));
    }

    #[test]
    fn accumulates_every_violation_in_a_fragment() {
        let (mut reg, bus, dev) = registry();
        let mut cx = Validation::new(&mut reg, 0, "stepper[0]");
        let errs = device(&bus, &dev)
            .validate(&json!({"sleep_pin": {"number": 99}, "reverse_direction": "maybe", "bogus": 1}), &mut cx)
            .unwrap_err();
        let paths: Vec<String> = errs.iter().map(|e| e.path.to_string()).collect();
        assert!(paths.contains(&".step_pin".to_string()));
        assert!(paths.contains(&".sleep_pin.number".to_string()));
        assert!(paths.contains(&".reverse_direction".to_string()));
        assert!(paths.contains(&".bogus".to_string()));
        assert!(errs.iter().all(|e| e.kind == ErrorKind::SchemaViolation));
    }

    #[test]
    fn validation_is_idempotent() {
        let (_, bus, dev) = registry();
        let schema = device(&bus, &dev);
        let raw = json!({"uart_id": "bus", "step_pin": {"number": 4.0}, "sleep_pin": {"number": 7, "inverted": "yes"}});
        let once = {
            let (mut reg, ..) = registry();
            reg.declare(Some("bus"), &bus, DeclSite { owner: 0, position: "uart".into() }).unwrap();
            schema.validate(&raw, &mut Validation::new(&mut reg, 1, "stepper[0]")).unwrap()
        };
        let twice = {
            let (mut reg, ..) = registry();
            reg.declare(Some("bus"), &bus, DeclSite { owner: 0, position: "uart".into() }).unwrap();
            schema.validate(&once, &mut Validation::new(&mut reg, 1, "stepper[0]")).unwrap()
        };
        assert_eq!(once, twice);
    }

    #[test]
    fn merge_is_last_wins_and_keeps_all_keys() {
        let parent = Schema::new()
            .required("name", Validator::Str)
            .optional("internal", Validator::Bool);
        let child = Schema::new()
            .with_default("internal", true, Validator::Bool)
            .required("pin", Validator::Int { min: None, max: None });
        let merged = parent.extend(&child);
        assert_eq!(merged.keys().collect::<Vec<_>>(), ["name", "internal", "pin"]);
        assert_eq!(merged.get("internal").unwrap().presence, Presence::Default(json!(true)));
        // parent untouched
        assert_eq!(parent.get("internal").unwrap().presence, Presence::Optional);
    }

    #[test]
    fn constraints_run_after_keys_and_report_distinctly() {
        let (mut reg, ..) = registry();
        let schema = Schema::new()
            .optional("tx_pin", Validator::Int { min: None, max: None })
            .optional("rx_pin", Validator::Int { min: None, max: None })
            .at_least_one_of(&["tx_pin", "rx_pin"]);
        let mut cx = Validation::new(&mut reg, 0, "uart[0]");
        let errs = schema.validate(&json!({}), &mut cx).unwrap_err();
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].kind, ErrorKind::ConstraintViolation);

        // a per-key failure suppresses constraint evaluation
        let errs = schema.validate(&json!({"tx_pin": "x"}), &mut cx).unwrap_err();
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].kind, ErrorKind::SchemaViolation);

        let exactly = Schema::new()
            .optional("coolix", Validator::Nested(Schema::new()))
            .optional("toshiba", Validator::Nested(Schema::new()))
            .exactly_one_of(&["coolix", "toshiba"]);
        let errs = exactly.validate(&json!({"coolix": {}, "toshiba": {}}), &mut cx).unwrap_err();
        assert_eq!(errs[0].kind, ErrorKind::ConstraintViolation);
        assert!(exactly.validate(&json!({"toshiba": null}), &mut cx).is_err());
        assert!(exactly.validate(&json!({"coolix": {}}), &mut cx).is_ok());
        assert_eq!(exactly.validate(&json!({"coolix": {}, "toshiba": null}), &mut cx).unwrap(), json!({"coolix": {}}));
    }

    #[test]
    fn explicit_null_means_absent() {
        let (mut reg, ..) = registry();
        let schema = Schema::new()
            .optional("comment", Validator::Str)
            .with_default("port", 80, Validator::port())
            .required("name", Validator::Str);
        let mut cx = Validation::new(&mut reg, 0, "core");
        let out = schema.validate(&json!({"comment": null, "port": null, "name": "n"}), &mut cx).unwrap();
        assert_eq!(out, json!({"port": 80, "name": "n"}));
        let errs = schema.validate(&json!({"name": null}), &mut cx).unwrap_err();
        assert_eq!(errs[0].path.to_string(), ".name");
    }

    #[test]
    fn explicit_ids_are_found_without_validating() {
        let (_, bus, dev) = registry();
        let schema = device(&bus, &dev).extend(
            &Schema::new().optional("extra", Validator::list(Validator::Nested(Schema::new().required("id", Validator::DeclareId(dev.clone()))))),
        );
        let mut names = Vec::new();
        schema.explicit_ids(&json!({"id": "m", "uart_id": "bus", "extra": [{"id": "x"}, {"id": 3}]}), &mut names);
        assert_eq!(names, ["m", "x"]);
    }

    #[test]
    fn same_fragment_reference_resolves_immediately() {
        let (mut reg, bus, _) = registry();
        // the reference key comes first in the schema but declarations run first
        let schema = Schema::new()
            .required("uses", Validator::UseId(bus.clone()))
            .required("id", Validator::DeclareId(bus.clone()));
        let mut cx = Validation::new(&mut reg, 0, "uart[0]");
        let out = schema.validate(&json!({"uses": "b", "id": "b"}), &mut cx).unwrap();
        assert_eq!(out, json!({"uses": "b", "id": "b"}));
        assert!(cx.into_deferred().is_empty());
    }

    #[test]
    fn unknown_reference_is_deferred_not_failed() {
        let (mut reg, bus, dev) = registry();
        let mut cx = Validation::new(&mut reg, 2, "stepper[0]");
        let out = device(&bus, &dev)
            .validate(&json!({"id": "m", "step_pin": {"number": 1}, "uart_id": "later"}), &mut cx)
            .unwrap();
        assert_eq!(out["uart_id"], "later");
        let deferred = cx.into_deferred();
        assert_eq!(deferred.len(), 1);
        assert_eq!(deferred[0].name.as_deref(), Some("later"));
        assert_eq!(deferred[0].path.to_string(), ".uart_id");
    }

    #[test]
    fn collision_is_reported_with_identifier() {
        let (mut reg, bus, _) = registry();
        let schema = Schema::new().required("id", Validator::DeclareId(bus));
        let first = schema.validate(&json!({"id": "bus"}), &mut Validation::new(&mut reg, 0, "uart[0]"));
        assert!(first.is_ok());
        let errs = schema
            .validate(&json!({"id": "bus"}), &mut Validation::new(&mut reg, 1, "uart[1]"))
            .unwrap_err();
        assert_eq!(errs[0].kind, ErrorKind::IdentifierCollision);
        assert_eq!(errs[0].identifier.as_deref(), Some("bus"));
    }
}
