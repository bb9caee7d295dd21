//! `stepper` domain with the `tmc2209` and generic `tmc` driver platforms.
use serde::Deserialize;
use serde_json::Value;

use super::{component_type, gpio_pin, pin_expr, register_component, uart};
use crate::component::{Catalog, ComponentSpec, Fragment};
use crate::ids::{Identifier, TypeTag};
use crate::ir::Expr;
use crate::schema::{EnumSet, Schema, Validator};
use crate::scheduler::{GenerationError, GenerationJob, JobContext, StagedJob};

pub const DOMAIN: &str = "stepper";

const INFINITY: &str = "inf";

pub fn register(c: &mut Catalog) {
    let component = component_type(c);
    let stepper = c.types_mut().class("stepper::Stepper", &[]);
    let tmc2209 = c.types_mut().class("tmc::TMC2209", &[&stepper, &component]);
    let tmc = c.types_mut().class("TMC", &[&stepper, &component]);
    for (_, driver) in TMC_MODELS {
        c.types_mut().class(driver, &[]);
    }

    c.register(ComponentSpec::domain(DOMAIN).build_flag("-DUSE_STEPPER"));

    let driver_pins = Schema::new()
        .required("step_pin", gpio_pin())
        .required("dir_pin", gpio_pin())
        .optional("sleep_pin", gpio_pin());

    let tmc2209_schema = stepper_schema()
        .extend(&Schema::new().required("id", Validator::DeclareId(tmc2209)))
        .extend(&driver_pins)
        .extend(&Schema::new().with_default("reverse_direction", false, Validator::Bool))
        .extend(&uart::device_schema());
    c.register(
        ComponentSpec::platform("tmc2209", DOMAIN, tmc2209_schema)
            .requires(&[uart::NAME])
            .to_code(tmc2209_to_code),
    );

    let models = EnumSet::new(TMC_MODELS.iter().map(|(m, _)| *m)).case_insensitive();
    let tmc_schema = stepper_schema()
        .extend(
            &Schema::new()
                .required("id", Validator::DeclareId(tmc))
                .required("model", Validator::Enum(models)),
        )
        .extend(&driver_pins)
        .extend(&Schema::new().optional("setup", Validator::Lambda))
        .extend(&uart::device_schema());
    c.register(
        ComponentSpec::platform("tmc", DOMAIN, tmc_schema)
            .requires(&[uart::NAME])
            .to_code(tmc_to_code),
    );
}

/// Driver model tag → driver-library class passed to `setup` lambdas.
const TMC_MODELS: [(&str, &str); 2] = [("TMC2200", "TMC2208Stepper"), ("TMC2209", "TMC2209Stepper")];

// ————————————————————————————————————————————————————————————————————————————
// SHARED STEPPER KEYS
// ————————————————————————————————————————————————————————————————————————————

pub fn stepper_schema() -> Schema {
    Schema::new()
        .required("max_speed", rate("steps/s", false))
        .with_default("acceleration", INFINITY, rate("steps/s^2", true))
        .with_default("deceleration", INFINITY, rate("steps/s^2", true))
}

/// Positive number with an optional unit suffix; `inf` where allowed.
fn rate(unit: &'static str, allow_inf: bool) -> Validator {
    Validator::custom("stepper rate", move |v| {
        let x = match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => {
                let s = s.trim();
                if allow_inf && s.eq_ignore_ascii_case(INFINITY) {
                    return Ok(Value::String(INFINITY.into()));
                }
                s.strip_suffix(unit).unwrap_or(s).trim().parse::<f64>().ok()
            }
            _ => None,
        };
        match x {
            Some(x) if x.is_finite() && x > 0.0 => Ok(Value::from(x)),
            _ => Err(format!("expected a positive rate in {unit}, got {v}")),
        }
    })
}

fn rate_expr(v: Option<&Value>) -> Expr {
    match v {
        Some(Value::Number(n)) => Expr::from(n.as_f64().unwrap_or_default()),
        _ => Expr::Raw("std::numeric_limits<float>::infinity()".into()),
    }
}

pub fn register_stepper(cx: &mut JobContext<'_>, var: &Identifier, f: &Fragment) -> Result<(), GenerationError> {
    cx.add(var, "set_max_speed", vec![rate_expr(f.get("max_speed"))])?;
    cx.add(var, "set_acceleration", vec![rate_expr(f.get("acceleration"))])?;
    cx.add(var, "set_deceleration", vec![rate_expr(f.get("deceleration"))])
}

// ————————————————————————————————————————————————————————————————————————————
// PLATFORMS
// ————————————————————————————————————————————————————————————————————————————

#[derive(Debug, Deserialize)]
struct DriverConfig {
    id: String,
    step_pin: Value,
    dir_pin: Value,
    #[serde(default)]
    sleep_pin: Option<Value>,
    #[serde(default)]
    reverse_direction: bool,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    setup: Option<Value>,
}

fn tmc2209_to_code(f: Fragment) -> Box<dyn GenerationJob> {
    let bus = uart::device_bus(&f);
    StagedJob::new(f.instance.clone(), f)
        .after(bus, |f, cx| {
            let conf: DriverConfig = f.decode()?;
            let id = cx.identifier(&conf.id)?;
            cx.new_pvariable(&id, vec![
                pin_expr(&conf.step_pin),
                pin_expr(&conf.dir_pin),
                conf.reverse_direction.into(),
            ])?;
            register_component(cx, &id)?;
            register_stepper(cx, &id, f)?;
            uart::register_uart_device(cx, &id, f)?;
            if let Some(pin) = &conf.sleep_pin {
                cx.add(&id, "set_sleep_pin", vec![pin_expr(pin)])?;
            }
            cx.add_library("SPI", None);
            cx.add_library("teemuatlut/TMCStepper", Some("0.7.1"));
            Ok(())
        })
        .boxed()
}

fn tmc_to_code(f: Fragment) -> Box<dyn GenerationJob> {
    let bus = uart::device_bus(&f);
    StagedJob::new(f.instance.clone(), f)
        .after(bus, |f, cx| {
            let conf: DriverConfig = f.decode()?;
            let id = cx.identifier(&conf.id)?;
            cx.new_pvariable(&id, vec![])?;
            register_component(cx, &id)?;
            register_stepper(cx, &id, f)?;
            uart::register_uart_device(cx, &id, f)?;

            cx.add(&id, "set_step_pin", vec![pin_expr(&conf.step_pin)])?;
            cx.add(&id, "set_dir_pin", vec![pin_expr(&conf.dir_pin)])?;
            if let Some(pin) = &conf.sleep_pin {
                cx.add(&id, "set_sleep_pin", vec![pin_expr(pin)])?;
            }
            if let Some(code) = conf.setup.as_ref().and_then(|s| s.get("lambda")).and_then(Value::as_str) {
                let model = conf.model.as_deref().unwrap_or_default();
                let driver = TMC_MODELS
                    .iter()
                    .find(|(m, _)| *m == model)
                    .map(|(_, d)| *d)
                    .ok_or_else(|| GenerationError::Config { key: "model".into(), message: format!("unknown model `{model}`") })?;
                let setup = Expr::Lambda {
                    params: vec![(TypeTag::new(driver), "driver".into())],
                    ret: TypeTag::new("void"),
                    body: code.to_string(),
                };
                cx.add(&id, "set_setup", vec![setup])?;
            }
            cx.add_library("teemuatlut/TMCStepper", Some("0.7.1"));
            Ok(())
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::run::CompilationRun;
    use serde_json::json;

    fn check(raw: Value) -> Result<Value, String> {
        let mut reg = crate::ids::IdRegistry::new(crate::ids::TypeTable::new());
        let mut cx = crate::schema::Validation::new(&mut reg, 0, "stepper[0]");
        stepper_schema()
            .validate(&raw, &mut cx)
            .map_err(|e| e.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))
    }

    #[test]
    fn rates_accept_units_and_infinity() {
        let v = check(json!({"max_speed": "250 steps/s", "acceleration": 100})).unwrap();
        assert_eq!(v, json!({"max_speed": 250.0, "acceleration": 100.0, "deceleration": "inf"}));
        assert_eq!(check(v.clone()).unwrap(), v);
        assert!(check(json!({"max_speed": "inf"})).is_err());
        assert!(check(json!({"max_speed": -3})).is_err());
    }

    #[test]
    fn model_must_be_known() {
        let catalog = Catalog::builtin();
        let raw = json!({
            "uart": {"tx_pin": 1, "baud_rate": 9600},
            "stepper": [{"platform": "tmc", "id": "s", "model": "tmc5160", "max_speed": 1, "step_pin": 2, "dir_pin": 3}],
        });
        let err = CompilationRun::new(&catalog).validate(&raw).unwrap_err();
        let d = &err.diagnostics()[0];
        assert_eq!(d.kind, ErrorKind::SchemaViolation);
        assert_eq!(d.path.to_string(), ".model");
    }

    #[test]
    fn sleep_pin_is_configured_after_registration() {
        let catalog = Catalog::builtin();
        let raw = json!({
            "uart": {"tx_pin": 1, "baud_rate": 9600},
            "stepper": [{"platform": "tmc2209", "id": "m", "max_speed": 1, "step_pin": 2, "dir_pin": 3, "sleep_pin": 4}],
        });
        let out = CompilationRun::new(&catalog).compile(&raw).unwrap();
        assert_eq!(
            out.emissions.last().map(ToString::to_string).as_deref(),
            Some("m->set_sleep_pin(new GPIOPin(4, OUTPUT, false));")
        );
    }
}
