//! Component registration surface: static metadata, validated fragments, and
//! the catalog the resolver and the compilation run look components up in.
use indexmap::IndexMap;
use ordered_float::OrderedFloat;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::build::Library;
use crate::ids::TypeTable;
use crate::path_de::from_value_with_path;
use crate::resolve::Manifest;
use crate::schema::Schema;
use crate::scheduler::{GenerationError, GenerationJob};

/// Builds the generation job for one validated instance.
pub type JobFactory = fn(Fragment) -> Box<dyn GenerationJob>;

#[derive(Debug, Clone)]
pub struct ComponentSpec {
    pub name: String,
    pub schema: Schema,
    pub dependencies: Vec<String>,
    pub auto_load: Vec<String>,
    /// Higher runs earlier.
    pub priority: OrderedFloat<f64>,
    /// Top-level value is a list of instances.
    pub multi_conf: bool,
    pub build_flags: Vec<String>,
    pub libraries: Vec<Library>,
    /// For a platform component (`tmc2209.stepper`), the domain it plugs into.
    pub platform_of: Option<String>,
    /// Domain component whose list entries each name a `platform`.
    pub hosts_platforms: bool,
    pub to_code: Option<JobFactory>,
}

impl ComponentSpec {
    pub fn new(name: &str, schema: Schema) -> Self {
        Self {
            name: name.to_string(),
            schema,
            dependencies: Vec::new(),
            auto_load: Vec::new(),
            priority: OrderedFloat(0.0),
            multi_conf: false,
            build_flags: Vec::new(),
            libraries: Vec::new(),
            platform_of: None,
            hosts_platforms: false,
            to_code: None,
        }
    }

    /// A domain such as `stepper`; its entries are dispatched to platforms.
    pub fn domain(name: &str) -> Self {
        let mut spec = Self::new(name, Schema::new());
        spec.hosts_platforms = true;
        spec
    }

    /// Platform `platform` of `domain`, registered as `platform.domain`.
    pub fn platform(platform: &str, domain: &str, schema: Schema) -> Self {
        let mut spec = Self::new(&format!("{platform}.{domain}"), schema);
        spec.platform_of = Some(domain.to_string());
        spec
    }

    pub fn requires(mut self, deps: &[&str]) -> Self {
        self.dependencies.extend(deps.iter().map(|d| d.to_string()));
        self
    }

    pub fn auto_load(mut self, deps: &[&str]) -> Self {
        self.auto_load.extend(deps.iter().map(|d| d.to_string()));
        self
    }

    pub fn priority(mut self, p: f64) -> Self {
        self.priority = OrderedFloat(p);
        self
    }

    pub fn multi_conf(mut self) -> Self {
        self.multi_conf = true;
        self
    }

    pub fn build_flag(mut self, flag: &str) -> Self {
        self.build_flags.push(flag.to_string());
        self
    }

    pub fn library(mut self, name: &str, version: Option<&str>) -> Self {
        self.libraries.push(Library::new(name, version));
        self
    }

    pub fn to_code(mut self, f: JobFactory) -> Self {
        self.to_code = Some(f);
        self
    }

    /// All static prerequisites, including the domain a platform plugs into.
    pub fn all_requirements(&self) -> Vec<String> {
        let mut out = self.dependencies.clone();
        if let Some(domain) = &self.platform_of {
            if !out.contains(domain) {
                out.insert(0, domain.clone());
            }
        }
        out
    }
}

/// One validated component instance, handed to its generation job.
#[derive(Debug, Clone)]
pub struct Fragment {
    /// Catalog name, e.g. `tmc2209.stepper`.
    pub component: String,
    /// Instance path, e.g. `stepper[0]`.
    pub instance: String,
    pub value: Value,
}

impl Fragment {
    pub fn get(&self, key: &str) -> Option<&Value> { self.value.get(key).filter(|v| !v.is_null()) }

    pub fn has(&self, key: &str) -> bool { self.get(key).is_some() }

    pub fn str(&self, key: &str) -> Result<&str, GenerationError> {
        self.get(key).and_then(Value::as_str).ok_or_else(|| self.missing(key, "a string"))
    }

    /// Name stored under an ID key (declaring or referencing).
    pub fn id(&self, key: &str) -> Result<String, GenerationError> { self.str(key).map(str::to_string) }

    pub fn int(&self, key: &str) -> Result<i64, GenerationError> {
        self.get(key).and_then(Value::as_i64).ok_or_else(|| self.missing(key, "an integer"))
    }

    pub fn bool(&self, key: &str) -> Result<bool, GenerationError> {
        self.get(key).and_then(Value::as_bool).ok_or_else(|| self.missing(key, "a boolean"))
    }

    /// Typed view of the whole fragment.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, GenerationError> {
        from_value_with_path(&self.value).map_err(|e| GenerationError::Config { key: e.path, message: e.message })
    }

    fn missing(&self, key: &str, what: &str) -> GenerationError {
        GenerationError::Config { key: key.to_string(), message: format!("expected {what}") }
    }
}

/// Every known component plus the type hierarchy their schemas refer to.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    components: IndexMap<String, ComponentSpec>,
    types: TypeTable,
}

impl Catalog {
    pub fn new() -> Self { Self::default() }

    pub fn register(&mut self, spec: ComponentSpec) {
        tracing::trace!(component = %spec.name, "registering component");
        self.components.insert(spec.name.clone(), spec);
    }

    pub fn get(&self, name: &str) -> Option<&ComponentSpec> { self.components.get(name) }

    /// Platform `platform` of `domain`, if registered.
    pub fn platform(&self, domain: &str, platform: &str) -> Option<&ComponentSpec> {
        self.components.get(&format!("{platform}.{domain}"))
    }

    /// Platform names available for `domain`.
    pub fn platforms_of(&self, domain: &str) -> Vec<&str> {
        self.components
            .values()
            .filter(|c| c.platform_of.as_deref() == Some(domain))
            .filter_map(|c| c.name.split('.').next())
            .collect()
    }

    pub fn types(&self) -> &TypeTable { &self.types }

    pub fn types_mut(&mut self) -> &mut TypeTable { &mut self.types }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ { self.components.keys().map(String::as_str) }
}

impl Manifest for Catalog {
    fn requires(&self, component: &str) -> Option<Vec<String>> {
        self.get(component).map(ComponentSpec::all_requirements)
    }

    fn auto_loads(&self, component: &str) -> Vec<String> {
        self.get(component).map(|c| c.auto_load.clone()).unwrap_or_default()
    }
}
