//! Built-in components, enough to drive the pipeline end to end.
pub mod climate;
pub mod core;
pub mod remote_transmitter;
pub mod stepper;
pub mod uart;
pub mod web_server;

use serde_json::{Value, json};

use crate::component::{Catalog, ComponentSpec};
use crate::ids::{Identifier, TypeTag};
use crate::ir::Expr;
use crate::schema::{EnumSet, Schema, Validator};
use crate::scheduler::{GenerationError, JobContext};

impl Catalog {
    pub fn builtin() -> Self {
        let mut c = Catalog::new();
        core::register(&mut c);
        c.register(
            ComponentSpec::new("json", Schema::new())
                .build_flag("-DUSE_JSON")
                .library("ArduinoJson-esphomelib", Some("5.13.3")),
        );
        uart::register(&mut c);
        stepper::register(&mut c);
        remote_transmitter::register(&mut c);
        climate::register(&mut c);
        web_server::register(&mut c);
        c
    }
}

pub(crate) fn component_type(c: &mut Catalog) -> TypeTag { c.types_mut().class("Component", &[]) }

// ————————————————————————————————————————————————————————————————————————————
// PINS
// ————————————————————————————————————————————————————————————————————————————

fn pin_number() -> Validator {
    let prefix = Validator::custom("gpio prefix", |v| match v {
        Value::String(s) => {
            let t = s.trim();
            let digits = t
                .get(..4)
                .filter(|p| p.eq_ignore_ascii_case("gpio"))
                .map_or(t, |_| &t[4..]);
            Ok(Value::String(digits.to_string()))
        }
        other => Ok(other.clone()),
    });
    Validator::All(vec![prefix, Validator::int_range(0, 39)])
}

/// GPIO pin: a bare number (`5`, `"GPIO5"`) or `{number, mode, inverted}`.
pub fn gpio_pin() -> Validator {
    let shorthand = Validator::custom("pin shorthand", |v| match v {
        Value::Object(_) => Ok(v.clone()),
        other => Ok(json!({ "number": other })),
    });
    let schema = Schema::new()
        .required("number", pin_number())
        .with_default("mode", "OUTPUT", Validator::Enum(EnumSet::new(["INPUT", "OUTPUT", "INPUT_PULLUP"]).case_insensitive()))
        .with_default("inverted", false, Validator::Bool);
    Validator::All(vec![shorthand, Validator::Nested(schema)])
}

/// `new GPIOPin(number, mode, inverted)` for a validated pin.
pub fn pin_expr(pin: &Value) -> Expr {
    let number = pin.get("number").and_then(Value::as_i64).unwrap_or_default();
    let mode = pin.get("mode").and_then(Value::as_str).unwrap_or("OUTPUT");
    let inverted = pin.get("inverted").and_then(Value::as_bool).unwrap_or(false);
    Expr::Construct {
        ty: TypeTag::new("GPIOPin"),
        args: vec![Expr::Int(number), Expr::Raw(mode.to_string()), Expr::Bool(inverted)],
    }
}

pub fn register_component(cx: &mut JobContext<'_>, id: &Identifier) -> Result<(), GenerationError> {
    let app = cx.app()?;
    cx.add(&app, "register_component", vec![Expr::var(id)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::ir::Op;
    use crate::run::CompilationRun;
    use pretty_assertions::assert_eq;
    use std::fs;

    fn lines(out: &crate::run::Output) -> Vec<String> { out.emissions.iter().map(ToString::to_string).collect() }

    #[test]
    fn stepper_on_uart() {
        let catalog = Catalog::builtin();
        let raw = json!({
            "uart": {"tx_pin": 17, "rx_pin": "GPIO16", "baud_rate": 115200},
            "stepper": [{
                "platform": "tmc2209",
                "id": "motor",
                "max_speed": "250 steps/s",
                "step_pin": 5,
                "dir_pin": {"number": 18, "inverted": "yes"},
            }],
        });
        let out = CompilationRun::new(&catalog).compile(&raw).unwrap();
        assert_eq!(out.order, ["core", "uart", "stepper", "tmc2209.stepper"]);
        assert_eq!(lines(&out), [
            "App.pre_setup(\"node\");",
            "uart::UARTComponent *uart_component_uart_0 = new uart::UARTComponent();",
            "App.register_component(uart_component_uart_0);",
            "uart_component_uart_0->set_baud_rate(115200);",
            "uart_component_uart_0->set_tx_pin(17);",
            "uart_component_uart_0->set_rx_pin(16);",
            "tmc::TMC2209 *motor = new tmc::TMC2209(new GPIOPin(5, OUTPUT, false), new GPIOPin(18, OUTPUT, true), false);",
            "App.register_component(motor);",
            "motor->set_max_speed(250.0f);",
            "motor->set_acceleration(std::numeric_limits<float>::infinity());",
            "motor->set_deceleration(std::numeric_limits<float>::infinity());",
            "motor->set_uart_parent(uart_component_uart_0);",
        ]);
        assert_eq!(out.build.flags.iter().collect::<Vec<_>>(), ["-DUSE_UART", "-DUSE_STEPPER"]);
        assert_eq!(out.build.lib_deps(), ["SPI", "teemuatlut/TMCStepper@0.7.1"]);
        assert_eq!(out.config["stepper"][0]["uart_id"], "uart_component_uart_0");
    }

    #[test]
    fn stepper_without_a_bus_is_unresolved() {
        let catalog = Catalog::builtin();
        let raw = json!({"stepper": [{"platform": "tmc2209", "id": "m", "max_speed": 100, "step_pin": 1, "dir_pin": 2}]});
        let err = CompilationRun::new(&catalog).validate(&raw).unwrap_err();
        let ds = err.diagnostics();
        assert_eq!(ds.len(), 1);
        assert_eq!(ds[0].kind, ErrorKind::UnresolvedReference);
        assert_eq!(format!("{}{}", ds[0].component, ds[0].path), "stepper[0].uart_id");
    }

    #[test]
    fn unknown_platform_lists_alternatives() {
        let catalog = Catalog::builtin();
        let err = CompilationRun::new(&catalog)
            .validate(&json!({"stepper": [{"platform": "a4988"}]}))
            .unwrap_err();
        let d = &err.diagnostics()[0];
        assert_eq!(d.kind, ErrorKind::SchemaViolation);
        assert!(d.message.contains("tmc2209"), "{}", d.message);
    }

    #[test]
    fn generic_tmc_takes_model_and_setup_lambda() {
        let catalog = Catalog::builtin();
        let raw = json!({
            "uart": {"tx_pin": 1, "baud_rate": 9600},
            "stepper": [{
                "platform": "tmc",
                "id": "axis",
                "model": "tmc2209",
                "max_speed": 800,
                "acceleration": "400 steps/s^2",
                "step_pin": 2,
                "dir_pin": 3,
                "setup": "!lambda driver.toff(5);",
            }],
        });
        let out = CompilationRun::new(&catalog).compile(&raw).unwrap();
        assert_eq!(out.config["stepper"][0]["model"], "TMC2209");
        let text = lines(&out);
        assert!(text.contains(&"axis->set_acceleration(400.0f);".to_string()));
        assert!(text.contains(&"axis->set_setup([=](TMC2209Stepper driver) -> void { driver.toff(5); });".to_string()));
    }

    #[test]
    fn climate_over_remote_transmitter() {
        let catalog = Catalog::builtin();
        let raw = json!({
            "remote_transmitter": {"pin": 4},
            "climate": [{"platform": "remote_transmitter", "name": "Living Room AC", "coolix": {"heat": "on"}}],
        });
        let out = CompilationRun::new(&catalog).compile(&raw).unwrap();
        assert_eq!(out.order, ["core", "remote_transmitter", "climate", "remote_transmitter.climate"]);
        let text = lines(&out);
        assert_eq!(text[1..].to_vec(), [
            "remote_transmitter::RemoteTransmitterComponent *remote_transmitter_component_remote_transmitter_0 = new remote_transmitter::RemoteTransmitterComponent(new GPIOPin(4, OUTPUT, false));",
            "App.register_component(remote_transmitter_component_remote_transmitter_0);",
            "remote_transmitter_component_remote_transmitter_0->set_carrier_duty_percent(50);",
            "remote::CoolixTransmitter *remote_transmitter_climate_climate_0 = new remote::CoolixTransmitter(\"Living Room AC\", true);",
            "remote_transmitter_climate_climate_0->set_parent(remote_transmitter_component_remote_transmitter_0);",
            "Application::MakeClimate make_climate_climate_0 = App.make_climate(remote_transmitter_climate_climate_0);",
            "App.register_climate(remote_transmitter_climate_climate_0);",
        ]);
        assert!(out.build.flags.contains("-DUSE_CLIMATE"));
    }

    #[test]
    fn climate_needs_exactly_one_protocol() {
        let catalog = Catalog::builtin();
        let raw = json!({
            "remote_transmitter": {"pin": 4},
            "climate": [{"platform": "remote_transmitter", "name": "AC", "coolix": {}, "toshiba": {}}],
        });
        let err = CompilationRun::new(&catalog).validate(&raw).unwrap_err();
        assert!(err.has_kind(ErrorKind::ConstraintViolation));
    }

    #[test]
    fn single_page_app_embeds_assets() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), "<html></html>").unwrap();
        fs::write(dir.path().join("app.js"), "go()").unwrap();
        fs::write(dir.path().join("app.js.map"), "{}").unwrap();
        fs::create_dir(dir.path().join("css")).unwrap();
        fs::write(dir.path().join("css").join("site.css"), "a{}").unwrap();

        let catalog = Catalog::builtin();
        let raw = json!({"web_server_spa": {"app_path": dir.path().to_string_lossy()}});
        let out = CompilationRun::new(&catalog).compile(&raw).unwrap();

        assert_eq!(out.order, ["core", "web_server_spa", "json", "web_server_base"]);
        assert_eq!(out.config["web_server_spa"]["web_server_base_id"], "web_server_base_web_server_base");

        let arrays: Vec<(&str, usize)> = out
            .emissions
            .iter()
            .filter_map(|e| match &e.op {
                Op::Progmem { data } => Some((e.target.as_str(), data.len())),
                _ => None,
            })
            .collect();
        assert_eq!(arrays, [("_app_js", 4), ("_css_site_css", 3), ("_index_html", 13)]);

        let text = lines(&out);
        // the base server comes first: higher priority even though it was pulled in later
        assert_eq!(text[1], "web_server_base::WebServerBase *web_server_base_web_server_base = new web_server_base::WebServerBase();");
        assert!(text.contains(&"web_server_base_web_server_base->set_port(80);".to_string()));
        assert!(text.contains(
            &"web_server_spa_web_server_spa->file(\"/index.html\", \"text/html\", _index_html, 13);".to_string()
        ));
        assert!(out.build.flags.contains("-DUSE_JSON"));
    }

    #[test]
    fn single_page_app_needs_an_existing_directory() {
        let catalog = Catalog::builtin();
        let err = CompilationRun::new(&catalog)
            .validate(&json!({"web_server_spa": {"app_path": "/definitely/not/here"}}))
            .unwrap_err();
        let d = &err.diagnostics()[0];
        assert_eq!(d.kind, ErrorKind::SchemaViolation);
        assert_eq!(d.path.to_string(), ".app_path");
    }

    #[test]
    fn builtin_runs_are_reproducible() {
        let catalog = Catalog::builtin();
        let raw = json!({
            "core": {"name": "bench"},
            "remote_transmitter": [{"pin": 4}],
            "climate": [
                {"platform": "remote_transmitter", "name": "A", "toshiba": {}},
                {"platform": "remote_transmitter", "name": "B", "coolix": {}},
            ],
            "uart": [{"rx_pin": 3, "baud_rate": 9600}],
            "stepper": [{"platform": "tmc2209", "id": "m", "max_speed": 10, "step_pin": 1, "dir_pin": 2}],
        });
        let a = CompilationRun::new(&catalog).compile(&raw).unwrap().to_string();
        let b = CompilationRun::new(&catalog).compile(&raw).unwrap().to_string();
        assert_eq!(a, b);
        assert!(a.starts_with("App.pre_setup(\"bench\");"));
    }
}
