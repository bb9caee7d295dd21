//! One compilation run: owns the identifier registry and the object graph for
//! the lifetime of a single configuration.
//!
//! ```text
//! raw tree ─► instances ─► resolve ─► validate (in order) ─► settle refs ─► schedule jobs ─► Output
//! ```
use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::build::BuildInfo;
use crate::component::{Catalog, ComponentSpec, Fragment};
use crate::config::KeyPath;
use crate::error::{CompileError, Diagnostic, ErrorKind};
use crate::graph::ObjectGraph;
use crate::ids::{IdRegistry, TypeTag};
use crate::ir::Emission;
use crate::resolve::{Resolution, ResolveError, resolve};
use crate::schema::{DeferredRef, Schema, Validation, Validator};
use crate::scheduler::{APP, Scheduler};

/// Always requested when the catalog has it.
pub const CORE: &str = "core";
/// Type of the imported application root.
pub const APP_TYPE: &str = "Application";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    /// Pass unknown keys through instead of rejecting them.
    pub allow_extra_keys: bool,
    /// How many times one job may be resumed before it counts as stuck.
    pub resume_budget: usize,
}

impl Default for CompileOptions {
    fn default() -> Self { Self { allow_extra_keys: false, resume_budget: 256 } }
}

/// A configured (or implicitly pulled-in) component instance, before validation.
#[derive(Debug, Clone)]
struct Instance {
    component: String,
    path: String,
    /// Top-level key and, for list-valued keys, the entry index.
    key: String,
    index: Option<usize>,
    raw: Value,
    implicit: bool,
}

/// Successfully validated configuration, ready for generation.
#[derive(Debug, Clone)]
pub struct Validated {
    resolution: Resolution,
    registry: IdRegistry,
    fragments: Vec<Fragment>,
    config: Value,
}

impl Validated {
    /// Normalized configuration tree.
    pub fn config(&self) -> &Value { &self.config }

    pub fn order(&self) -> &[String] { self.resolution.order() }

    /// Instances in generation queue order.
    pub fn fragments(&self) -> &[Fragment] { &self.fragments }

    pub fn registry(&self) -> &IdRegistry { &self.registry }
}

#[derive(Debug, Clone, Serialize)]
pub struct Output {
    pub order: Vec<String>,
    pub config: Value,
    pub emissions: Vec<Emission>,
    pub build: BuildInfo,
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for e in &self.emissions {
            writeln!(f, "{e}")?;
        }
        if !self.build.flags.is_empty() {
            let flags: Vec<&str> = self.build.flags.iter().map(String::as_str).collect();
            writeln!(f, "// build_flags: {}", flags.join(" "))?;
        }
        if !self.build.libraries.is_empty() {
            writeln!(f, "// lib_deps: {}", self.build.lib_deps().join(", "))?;
        }
        Ok(())
    }
}

pub struct CompilationRun<'c> {
    catalog: &'c Catalog,
    options: CompileOptions,
}

impl<'c> CompilationRun<'c> {
    pub fn new(catalog: &'c Catalog) -> Self { Self::with_options(catalog, CompileOptions::default()) }

    pub fn with_options(catalog: &'c Catalog, options: CompileOptions) -> Self { Self { catalog, options } }

    pub fn compile(&self, raw: &Value) -> Result<Output, CompileError> { self.generate(self.validate(raw)?) }

    /// Validate every instance, accumulating all problems across the tree.
    pub fn validate(&self, raw: &Value) -> Result<Validated, CompileError> {
        let empty = Map::new();
        let root = match raw {
            Value::Object(m) => m,
            Value::Null => &empty,
            _ => {
                return Err(CompileError::Invalid(vec![Diagnostic::new(
                    ErrorKind::SchemaViolation,
                    "<root>",
                    KeyPath::root(),
                    "expected a mapping of components",
                )]));
            }
        };

        let mut diags = Vec::new();
        let mut requested: Vec<String> = Vec::new();
        if self.catalog.get(CORE).is_some() {
            requested.push(CORE.to_string());
        }
        let mut instances = self.collect_instances(root, &mut requested, &mut diags);

        let resolution = match resolve(self.catalog, &requested) {
            Ok(r) => r,
            Err(errs) => {
                for e in errs {
                    match e {
                        ResolveError::Cycle(cycle) => return Err(CompileError::Cycle(cycle)),
                        ResolveError::Unknown { component, requested_by } => diags.push(Diagnostic::new(
                            ErrorKind::SchemaViolation,
                            requested_by.unwrap_or_else(|| component.clone()),
                            KeyPath::root(),
                            format!("component `{component}` not found"),
                        )),
                    }
                }
                return Err(CompileError::Invalid(diags));
            }
        };

        // pulled-in single-instance components that generate code still need an instance
        for name in resolution.order() {
            let Some(spec) = self.catalog.get(name) else { continue };
            let standalone = !spec.multi_conf && !spec.hosts_platforms && spec.platform_of.is_none();
            if spec.to_code.is_some() && standalone && !instances.iter().any(|i| &i.component == name) {
                instances.push(Instance {
                    component: name.clone(),
                    path: name.clone(),
                    key: name.clone(),
                    index: None,
                    raw: Value::Null,
                    implicit: true,
                });
            }
        }
        instances.sort_by_key(|i| resolution.position(&i.component).unwrap_or(usize::MAX));

        let mut registry = IdRegistry::new(self.catalog.types().clone());
        registry.import(APP, &TypeTag::new(APP_TYPE));

        // synthesized names never take one the user wrote, whichever is validated first
        let mut explicit = Vec::new();
        for inst in &instances {
            if let Some(spec) = self.catalog.get(&inst.component) {
                spec.schema.explicit_ids(&inst.raw, &mut explicit);
            }
        }
        explicit.iter().for_each(|name| registry.reserve(name));

        let mut values: Vec<Option<Value>> = Vec::with_capacity(instances.len());
        let mut deferred: Vec<DeferredRef> = Vec::new();
        for (owner, inst) in instances.iter().enumerate() {
            let Some(spec) = self.catalog.get(&inst.component) else {
                values.push(None);
                continue;
            };
            let platform_schema;
            let schema = if spec.platform_of.is_some() {
                platform_schema = Schema::new().required("platform", Validator::Str).extend(&spec.schema);
                &platform_schema
            } else {
                &spec.schema
            };
            let mut cx = Validation::new(&mut registry, owner, inst.path.clone())
                .allow_extra_keys(self.options.allow_extra_keys);
            match schema.validate(&inst.raw, &mut cx) {
                Ok(v) => {
                    deferred.extend(cx.into_deferred());
                    values.push(Some(v));
                }
                Err(errs) if inst.implicit => {
                    let by = resolution.pulled_in_by(&inst.component).unwrap_or(CORE);
                    tracing::debug!(component = %inst.component, problems = errs.len(), "implicit instance is not configurable");
                    diags.push(Diagnostic::new(
                        ErrorKind::SchemaViolation,
                        inst.path.clone(),
                        KeyPath::root(),
                        format!("component `{}` is needed by `{by}` and must be configured", inst.component),
                    ));
                    values.push(None);
                }
                Err(errs) => {
                    diags.extend(errs);
                    values.push(None);
                }
            }
        }

        self.settle(&deferred, &instances, &resolution, &registry, &mut values, &mut diags);

        if !diags.is_empty() {
            tracing::debug!(problems = diags.len(), "validation failed");
            return Err(CompileError::Invalid(diags));
        }

        let config = assemble(root, self.catalog, &instances, &values);
        let fragments = instances
            .into_iter()
            .zip(values)
            .map(|(inst, v)| Fragment { component: inst.component, instance: inst.path, value: v.unwrap_or(Value::Null) })
            .collect();
        tracing::debug!(order = ?resolution.order(), ids = registry.len(), "validation finished");
        Ok(Validated { resolution, registry, fragments, config })
    }

    /// Run generation jobs for a validated configuration.
    pub fn generate(&self, validated: Validated) -> Result<Output, CompileError> {
        let Validated { resolution, mut registry, fragments, config } = validated;

        let mut graph = ObjectGraph::new();
        if let Some(app) = registry.lookup(APP) {
            graph.import(&app.id);
        }

        let mut build = BuildInfo::default();
        for name in resolution.order() {
            if let Some(spec) = self.catalog.get(name) {
                spec.build_flags.iter().for_each(|f| build.add_flag(f));
                spec.libraries.iter().for_each(|l| build.add_library(l));
            }
        }

        let mut scheduler = Scheduler::new(self.options.resume_budget);
        for (owner, fragment) in fragments.into_iter().enumerate() {
            let Some(spec) = self.catalog.get(&fragment.component) else { continue };
            if let Some(to_code) = spec.to_code {
                scheduler.push(to_code(fragment), spec.priority.0, owner);
            }
        }
        scheduler.run(&mut graph, &mut registry, &mut build)?;
        tracing::debug!(emissions = graph.emissions().len(), "generation finished");

        Ok(Output { order: resolution.order().to_vec(), config, emissions: graph.into_emissions(), build })
    }

    fn collect_instances(
        &self,
        root: &Map<String, Value>,
        requested: &mut Vec<String>,
        diags: &mut Vec<Diagnostic>,
    ) -> Vec<Instance> {
        let mut out = Vec::new();
        for (key, value) in root {
            let Some(spec) = self.catalog.get(key).filter(|s| s.platform_of.is_none()) else {
                diags.push(Diagnostic::new(
                    ErrorKind::SchemaViolation,
                    key.clone(),
                    KeyPath::root(),
                    format!("component `{key}` not found"),
                ));
                continue;
            };
            push_unique(requested, key);

            if spec.hosts_platforms {
                for (i, entry) in as_list(value).into_iter().enumerate() {
                    let path = format!("{key}[{i}]");
                    let name = entry.get("platform").and_then(Value::as_str);
                    match name.and_then(|p| self.catalog.platform(key, p)) {
                        Some(platform) => {
                            push_unique(requested, &platform.name);
                            out.push(instance(platform, path, key, Some(i), entry));
                        }
                        None => {
                            let message = match name {
                                Some(p) => format!(
                                    "platform `{p}` not found for `{key}` (available: {})",
                                    self.catalog.platforms_of(key).join(", ")
                                ),
                                None => "required key not provided".to_string(),
                            };
                            diags.push(Diagnostic::new(
                                ErrorKind::SchemaViolation,
                                path,
                                KeyPath::root().key("platform"),
                                message,
                            ));
                        }
                    }
                }
            } else if spec.multi_conf {
                for (i, entry) in as_list(value).into_iter().enumerate() {
                    out.push(instance(spec, format!("{key}[{i}]"), key, Some(i), entry));
                }
            } else {
                out.push(instance(spec, key.clone(), key, None, value));
            }
        }
        out
    }

    /// Resolve references that pointed forward at validation time.
    fn settle(
        &self,
        deferred: &[DeferredRef],
        instances: &[Instance],
        resolution: &Resolution,
        registry: &IdRegistry,
        values: &mut [Option<Value>],
        diags: &mut Vec<Diagnostic>,
    ) {
        for d in deferred {
            let Some(value) = values.get_mut(d.owner).and_then(Option::as_mut) else { continue };
            let found = match &d.name {
                Some(name) => registry.reference(name, &d.expected),
                None => registry.default_of(&d.expected),
            };
            let id = match found {
                Ok(id) => id,
                Err(e) => {
                    let mut diag = Diagnostic::new(ErrorKind::UnresolvedReference, d.component.clone(), d.path.clone(), e.to_string());
                    if let Some(name) = &d.name {
                        diag = diag.with_identifier(name.clone());
                    }
                    diags.push(diag);
                    continue;
                }
            };

            let referrer = &instances[d.owner].component;
            let declarer = registry
                .lookup(&id.name)
                .and_then(|decl| instances.get(decl.site.owner))
                .map(|inst| inst.component.as_str());
            if let Some(declarer) = declarer {
                if declarer != referrer && resolution.requires_transitively(declarer, referrer) {
                    diags.push(
                        Diagnostic::new(
                            ErrorKind::UnresolvedReference,
                            d.component.clone(),
                            d.path.clone(),
                            format!(
                                "ID `{}` is declared by `{declarer}`, which requires `{referrer}` and is set up after it",
                                id.name
                            ),
                        )
                        .with_identifier(id.name.clone()),
                    );
                    continue;
                }
            }

            tracing::trace!(component = %d.component, path = %d.path, id = %id.name, "settled deferred reference");
            if d.name.is_none() {
                if let Some(slot) = d.path.lookup_mut(value) {
                    *slot = Value::String(id.name);
                }
            }
        }
    }
}

fn instance(spec: &ComponentSpec, path: String, key: &str, index: Option<usize>, raw: &Value) -> Instance {
    Instance {
        component: spec.name.clone(),
        path,
        key: key.to_string(),
        index,
        raw: raw.clone(),
        implicit: false,
    }
}

fn push_unique(xs: &mut Vec<String>, name: &str) {
    if !xs.iter().any(|x| x == name) {
        xs.push(name.to_string());
    }
}

fn as_list(v: &Value) -> Vec<&Value> {
    match v {
        Value::Array(xs) => xs.iter().collect(),
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

/// Normalized tree: input key order first, then implicit instances in setup order.
fn assemble(root: &Map<String, Value>, catalog: &Catalog, instances: &[Instance], values: &[Option<Value>]) -> Value {
    let mut out = Map::new();
    for (key, raw) in root {
        let listed = catalog.get(key).is_some_and(|s| s.multi_conf || s.hosts_platforms);
        let slot = if listed { Value::Array(vec![Value::Null; as_list(raw).len()]) } else { Value::Null };
        out.insert(key.clone(), slot);
    }
    for (inst, v) in instances.iter().zip(values) {
        let v = v.clone().unwrap_or(Value::Null);
        if let (Some(i), Some(Value::Array(xs))) = (inst.index, out.get_mut(&inst.key)) {
            if let Some(slot) = xs.get_mut(i) {
                *slot = v;
                continue;
            }
        }
        out.insert(inst.key.clone(), v);
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::TypeTag;
    use crate::ir::{Expr, Op};
    use crate::scheduler::StagedJob;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    // A small catalog over one `Node` type: every component declares an `id`
    // and may point at another node through `link`.

    fn node() -> TypeTag { TypeTag::new("Node") }

    fn node_schema() -> Schema {
        Schema::new()
            .generated("id", Validator::DeclareId(node()))
            .optional("link", Validator::UseId(node()))
            .with_default("level", 1, Validator::int_range(0, 10))
    }

    fn node_job(f: Fragment) -> Box<dyn crate::scheduler::GenerationJob> {
        let link = f.get("link").and_then(Value::as_str).map(str::to_string);
        StagedJob::new(f.instance.clone(), f)
            .after(link.clone(), move |f, cx| {
                let id = cx.identifier(&f.id("id")?)?;
                let mut args = vec![Expr::Int(f.int("level")?)];
                if let Some(l) = &link {
                    args.push(Expr::var(&cx.get_variable(l)?));
                }
                cx.new_pvariable(&id, args)?;
                let app = cx.app()?;
                cx.add(&app, "register_component", vec![Expr::var(&id)])?;
                Ok(())
            })
            .boxed()
    }

    fn spec(name: &str) -> ComponentSpec { ComponentSpec::new(name, node_schema()).to_code(node_job) }

    fn catalog(specs: Vec<ComponentSpec>) -> Catalog {
        let mut c = Catalog::new();
        c.types_mut().class("Node", &[]);
        for s in specs {
            c.register(s);
        }
        c
    }

    fn declared_targets(out: &Output) -> Vec<String> {
        out.emissions
            .iter()
            .filter(|e| e.op.is_declaration())
            .map(|e| e.target.clone())
            .collect()
    }

    #[test]
    fn validation_round_trips_through_its_own_output() {
        let c = catalog(vec![spec("led").multi_conf(), spec("button")]);
        let raw = json!({"led": {"link": "b", "level": "3"}, "button": {"id": "b"}});
        let once = CompilationRun::new(&c).validate(&raw).unwrap();
        let twice = CompilationRun::new(&c).validate(once.config()).unwrap();
        assert_eq!(once.config(), twice.config());
        assert_eq!(once.config()["led"][0]["level"], json!(3));
        assert_eq!(once.config()["led"][0]["id"], json!("node_led_0"));
    }

    #[test]
    fn explicit_name_declared_twice_collides() {
        let c = catalog(vec![spec("led"), spec("button")]);
        let err = CompilationRun::new(&c)
            .validate(&json!({"led": {"id": "x"}, "button": {"id": "x"}}))
            .unwrap_err();
        let ds = err.diagnostics();
        assert_eq!(ds.len(), 1);
        assert_eq!(ds[0].kind, ErrorKind::IdentifierCollision);
        assert_eq!(ds[0].identifier.as_deref(), Some("x"));
    }

    #[test]
    fn forward_reference_into_a_requiring_component_is_unresolved() {
        // `light` requires `output`, so `output` is set up first and cannot see `light`'s IDs
        let c = catalog(vec![spec("output"), spec("light").requires(&["output"])]);
        let err = CompilationRun::new(&c)
            .validate(&json!({"output": {"id": "o", "link": "l"}, "light": {"id": "l", "link": "o"}}))
            .unwrap_err();
        let ds = err.diagnostics();
        assert_eq!(ds.len(), 1);
        assert_eq!(ds[0].kind, ErrorKind::UnresolvedReference);
        assert_eq!(ds[0].component, "output");
        assert_eq!(ds[0].path.to_string(), ".link");
    }

    #[test]
    fn forward_reference_between_unrelated_components_is_settled() {
        let c = catalog(vec![spec("a"), spec("b")]);
        let out = CompilationRun::new(&c)
            .compile(&json!({"a": {"id": "x", "link": "y"}, "b": {"id": "y"}}))
            .unwrap();
        // `a` suspends on `y` until `b` has run
        assert_eq!(declared_targets(&out), ["y", "x"]);
    }

    #[test]
    fn required_cycle_aborts() {
        let c = catalog(vec![
            spec("a").requires(&["b"]),
            spec("b").requires(&["c"]),
            spec("c").requires(&["a"]),
        ]);
        match CompilationRun::new(&c).validate(&json!({"a": {}})) {
            Err(CompileError::Cycle(cycle)) => assert_eq!(cycle.path, ["a", "b", "c", "a"]),
            other => panic!("expected a cycle, got {other:?}"),
        }
    }

    #[test]
    fn auto_loaded_component_is_included() {
        let c = catalog(vec![spec("a").auto_load(&["b"]), spec("b")]);
        let out = CompilationRun::new(&c).compile(&json!({"a": {}})).unwrap();
        assert_eq!(out.order, ["a", "b"]);
        assert_eq!(declared_targets(&out), ["node_a", "node_b"]);
        assert!(out.config.get("b").is_some());
    }

    #[test]
    fn priority_beats_input_order() {
        let c = catalog(vec![spec("reader").priority(5.0), spec("maker").priority(10.0)]);
        let out = CompilationRun::new(&c)
            .compile(&json!({"reader": {"id": "r", "link": "x"}, "maker": {"id": "x"}}))
            .unwrap();
        let first_reader = out.emissions.iter().position(|e| e.origin == "reader").unwrap();
        let maker_decl = out
            .emissions
            .iter()
            .position(|e| e.target == "x" && matches!(e.op, Op::New { .. }))
            .unwrap();
        assert!(maker_decl < first_reader);
    }

    #[test]
    fn ring_of_references_deadlocks() {
        let c = catalog(vec![spec("ring").multi_conf()]);
        let err = CompilationRun::new(&c)
            .compile(&json!({"ring": [
                {"id": "a", "link": "c"},
                {"id": "b", "link": "a"},
                {"id": "c", "link": "b"},
            ]}))
            .unwrap_err();
        match &err {
            CompileError::Deadlock(waits) => assert_eq!(waits.len(), 3),
            other => panic!("expected deadlock, got {other:?}"),
        }
        assert!(err.has_kind(ErrorKind::SchedulingDeadlock));
    }

    #[test]
    fn identical_input_gives_identical_emissions() {
        let c = catalog(vec![spec("a").multi_conf(), spec("b").priority(2.0), spec("c").requires(&["a"])]);
        let raw = json!({
            "c": {"link": "a1"},
            "a": [{"id": "a1", "link": "b1"}, {"level": 4}],
            "b": {"id": "b1"},
        });
        let render = || {
            let out = CompilationRun::new(&c).compile(&raw).unwrap();
            serde_json::to_string(&out.emissions).unwrap()
        };
        assert_eq!(render(), render());
    }

    #[test]
    fn accumulates_problems_across_instances() {
        let c = catalog(vec![spec("led").multi_conf()]);
        let err = CompilationRun::new(&c)
            .validate(&json!({"led": [{"level": 11}, {"level": "high"}], "bogus": {}}))
            .unwrap_err();
        let ds = err.diagnostics();
        let where_: Vec<String> = ds.iter().map(|d| format!("{}{}", d.component, d.path)).collect();
        assert_eq!(where_, ["bogus", "led[0].level", "led[1].level"]);
    }

    #[test]
    fn omitted_generated_reference_is_patched_after_all_fragments() {
        let mut c = Catalog::new();
        let bus = c.types_mut().class("Bus", &[]);
        c.register(ComponentSpec::new("device", Schema::new().generated("bus_id", Validator::UseId(bus.clone()))));
        c.register(ComponentSpec::new("bus", Schema::new().generated("id", Validator::DeclareId(bus))));
        // `device` is validated before any bus exists
        let v = CompilationRun::new(&c).validate(&json!({"device": {}, "bus": {}})).unwrap();
        assert_eq!(v.config()["device"]["bus_id"], json!("bus_bus"));

        let err = CompilationRun::new(&c).validate(&json!({"device": {}})).unwrap_err();
        assert!(err.has_kind(ErrorKind::UnresolvedReference));
    }

    #[test]
    fn explicit_name_wins_over_an_earlier_synthesized_one() {
        let c = catalog(vec![spec("a"), spec("b")]);
        let v = CompilationRun::new(&c).validate(&json!({"a": {}, "b": {"id": "node_a"}})).unwrap();
        assert_eq!(v.config()["a"]["id"], json!("node_a_2"));
        assert_eq!(v.config()["b"]["id"], json!("node_a"));
    }

    #[test]
    fn omitted_reference_with_several_candidates_is_ambiguous() {
        let mut c = Catalog::new();
        let bus = c.types_mut().class("Bus", &[]);
        c.register(ComponentSpec::new("device", Schema::new().generated("bus_id", Validator::UseId(bus.clone()))));
        c.register(ComponentSpec::new("bus", Schema::new().generated("id", Validator::DeclareId(bus))).multi_conf());
        let err = CompilationRun::new(&c).validate(&json!({"bus": [{}, {}], "device": {}})).unwrap_err();
        let ds = err.diagnostics();
        assert_eq!(ds.len(), 1);
        assert_eq!((ds[0].kind, ds[0].component.as_str()), (ErrorKind::UnresolvedReference, "device"));
        assert!(ds[0].message.contains("bus_bus_0, bus_bus_1"), "{}", ds[0].message);

        let v = CompilationRun::new(&c).validate(&json!({"bus": [{}, {"id": "main"}], "device": {"bus_id": "main"}})).unwrap();
        assert_eq!(v.config()["device"]["bus_id"], json!("main"));
    }

    #[test]
    fn extra_keys_follow_options() {
        let c = catalog(vec![spec("led")]);
        let raw = json!({"led": {"color": "red"}});
        assert!(CompilationRun::new(&c).validate(&raw).is_err());
        let lenient = CompileOptions { allow_extra_keys: true, ..CompileOptions::default() };
        let v = CompilationRun::with_options(&c, lenient).validate(&raw).unwrap();
        assert_eq!(v.config()["led"]["color"], "red");
    }
}
