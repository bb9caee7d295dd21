//! `remote_transmitter`: IR/RF transmitter hub other platforms attach to.
use super::{component_type, gpio_pin, pin_expr, register_component};
use crate::component::{Catalog, ComponentSpec, Fragment};
use crate::ids::TypeTag;
use crate::ir::Expr;
use crate::schema::{Schema, Validator};
use crate::scheduler::{GenerationJob, StagedJob};

pub const NAME: &str = "remote_transmitter";

pub fn hub_type() -> TypeTag { TypeTag::new("remote_transmitter::RemoteTransmitterComponent") }

pub fn register(c: &mut Catalog) {
    let component = component_type(c);
    let hub = c.types_mut().class(hub_type().as_str(), &[&component]);

    let schema = Schema::new()
        .generated("id", Validator::DeclareId(hub))
        .required("pin", gpio_pin())
        .with_default("carrier_duty_percent", 50, Validator::int_range(1, 100));
    c.register(ComponentSpec::new(NAME, schema).multi_conf().build_flag("-DUSE_REMOTE_TRANSMITTER").to_code(to_code));
}

fn to_code(f: Fragment) -> Box<dyn GenerationJob> {
    StagedJob::new(f.instance.clone(), f)
        .then(|f, cx| {
            let id = cx.identifier(&f.id("id")?)?;
            let pin = f.get("pin").map(pin_expr).unwrap_or(Expr::Null);
            cx.new_pvariable(&id, vec![pin])?;
            register_component(cx, &id)?;
            cx.add(&id, "set_carrier_duty_percent", vec![Expr::Int(f.int("carrier_duty_percent")?)])
        })
        .boxed()
}
