//! `climate` domain and the IR-remote platform for air conditioners.
use serde_json::Value;

use super::{component_type, remote_transmitter};
use crate::component::{Catalog, ComponentSpec, Fragment};
use crate::ids::{Identifier, TypeTag};
use crate::ir::Expr;
use crate::schema::{Schema, Validator};
use crate::scheduler::{GenerationError, GenerationJob, JobContext, StagedJob};

pub const DOMAIN: &str = "climate";

/// Protocol key → transmitter class emitting it.
const PROTOCOLS: [(&str, &str); 2] = [("coolix", "remote::CoolixTransmitter"), ("toshiba", "remote::ToshibaTransmitter")];

pub fn register(c: &mut Catalog) {
    let component = component_type(c);
    let climate = c.types_mut().class("climate::Climate", &[]);
    let nameable = c.types_mut().class("Nameable", &[]);
    let remote = c.types_mut().class("remote_transmitter::RemoteTransmitterClimate", &[&climate, &component, &nameable]);
    for (_, class) in PROTOCOLS {
        c.types_mut().class(class, &[&remote]);
    }
    let make = c.types_mut().class("Application::MakeClimate", &[]);

    c.register(ComponentSpec::domain(DOMAIN).build_flag("-DUSE_CLIMATE"));

    let protocol = Schema::new()
        .with_default("heat", true, Validator::Bool)
        .with_default("cool", true, Validator::Bool);
    let keys: Vec<&str> = PROTOCOLS.iter().map(|(k, _)| *k).collect();
    let mut schema = climate_schema(make).extend(
        &Schema::new()
            .generated("id", Validator::DeclareId(remote))
            .generated("transmitter_id", Validator::UseId(remote_transmitter::hub_type())),
    );
    for key in &keys {
        schema = schema.optional(key, Validator::Nested(protocol.clone()));
    }
    c.register(
        ComponentSpec::platform(remote_transmitter::NAME, DOMAIN, schema.exactly_one_of(&keys))
            .requires(&[remote_transmitter::NAME])
            .to_code(remote_to_code),
    );
}

/// Keys shared by every climate platform.
pub fn climate_schema(make: TypeTag) -> Schema {
    Schema::new()
        .required("name", Validator::Str)
        .generated("make_id", Validator::DeclareId(make))
        .optional("visual_min_temperature", Validator::Float { min: None, max: None })
        .optional("visual_max_temperature", Validator::Float { min: None, max: None })
}

/// `App.make_climate(var)` bound to the fragment's `make_id`, then the
/// optional visual limits, then registration with the application.
pub fn register_climate(cx: &mut JobContext<'_>, var: &Identifier, f: &Fragment) -> Result<(), GenerationError> {
    let app = cx.app()?;
    let make = cx.identifier(&f.id("make_id")?)?;
    cx.variable(&make, Expr::Call { target: app.name.clone(), method: "make_climate".into(), args: vec![Expr::var(var)] })?;
    for (key, method) in [("visual_min_temperature", "set_visual_min_temperature_override"), ("visual_max_temperature", "set_visual_max_temperature_override")] {
        if let Some(t) = f.get(key).and_then(Value::as_f64) {
            cx.add(var, method, vec![t.into()])?;
        }
    }
    cx.add(&app, "register_climate", vec![Expr::var(var)])
}

fn remote_to_code(f: Fragment) -> Box<dyn GenerationJob> {
    let hub = f.id("transmitter_id").ok();
    StagedJob::new(f.instance.clone(), f)
        .after(hub, |f, cx| {
            let (key, class) = PROTOCOLS
                .iter()
                .find(|(k, _)| f.has(k))
                .ok_or_else(|| GenerationError::Message("no climate protocol configured".into()))?;
            let options = f.get(key).cloned().unwrap_or(Value::Null);
            let heat = options.get("heat").and_then(Value::as_bool).unwrap_or(true);
            let cool = options.get("cool").and_then(Value::as_bool).unwrap_or(true);

            let id = cx.identifier(&f.id("id")?)?;
            let mut args = vec![Expr::from(f.str("name")?), heat.into()];
            if !cool {
                args.push(cool.into());
            }
            cx.new_pvariable_as(&id, &TypeTag::new(*class), args)?;
            let parent = cx.get_variable(&f.id("transmitter_id")?)?;
            cx.add(&id, "set_parent", vec![Expr::var(&parent)])?;
            register_climate(cx, &id, f)
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::CompilationRun;
    use serde_json::json;

    #[test]
    fn visual_limits_are_applied_before_registration() {
        let catalog = Catalog::builtin();
        let raw = json!({
            "remote_transmitter": {"pin": 4},
            "climate": [{"platform": "remote_transmitter", "name": "AC", "toshiba": {"cool": false}, "visual_min_temperature": 16}],
        });
        let out = CompilationRun::new(&catalog).compile(&raw).unwrap();
        let text: Vec<String> = out.emissions.iter().map(ToString::to_string).collect();
        assert_eq!(text[4], "remote::ToshibaTransmitter *remote_transmitter_climate_climate_0 = new remote::ToshibaTransmitter(\"AC\", true, false);");
        assert_eq!(text[text.len() - 2], "remote_transmitter_climate_climate_0->set_visual_min_temperature_override(16.0f);");
        assert_eq!(text[text.len() - 1], "App.register_climate(remote_transmitter_climate_climate_0);");
    }

    #[test]
    fn explicit_transmitter_must_be_declared() {
        let catalog = Catalog::builtin();
        let raw = json!({
            "remote_transmitter": {"pin": 4, "id": "ir"},
            "climate": [{"platform": "remote_transmitter", "name": "AC", "coolix": {}, "transmitter_id": "rf"}],
        });
        let err = CompilationRun::new(&catalog).validate(&raw).unwrap_err();
        let d = &err.diagnostics()[0];
        assert_eq!(d.kind, crate::error::ErrorKind::UnresolvedReference);
        assert_eq!(d.identifier.as_deref(), Some("rf"));
    }
}
