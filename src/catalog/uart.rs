//! `uart` buses and the device mix-in for components that talk over one.
use super::{component_type, gpio_pin, register_component};
use crate::component::{Catalog, ComponentSpec, Fragment};
use crate::ids::{Identifier, TypeTag};
use crate::ir::Expr;
use crate::schema::{Schema, Validator};
use crate::scheduler::{GenerationError, GenerationJob, JobContext, StagedJob};

pub const NAME: &str = "uart";

pub fn bus_type() -> TypeTag { TypeTag::new("uart::UARTComponent") }

pub fn register(c: &mut Catalog) {
    let component = component_type(c);
    let bus = c.types_mut().class(bus_type().as_str(), &[&component]);

    let schema = Schema::new()
        .generated("id", Validator::DeclareId(bus))
        .optional("tx_pin", gpio_pin())
        .optional("rx_pin", gpio_pin())
        .required("baud_rate", Validator::Int { min: Some(1), max: None })
        .at_least_one_of(&["tx_pin", "rx_pin"]);
    c.register(ComponentSpec::new(NAME, schema).multi_conf().build_flag("-DUSE_UART").to_code(to_code));
}

/// Keys every UART-attached device carries; extend a device schema with it.
pub fn device_schema() -> Schema { Schema::new().generated("uart_id", Validator::UseId(bus_type())) }

/// Name of the bus a device fragment is attached to, for the job's awaits.
pub fn device_bus(f: &Fragment) -> Option<String> { f.id("uart_id").ok() }

pub fn register_uart_device(cx: &mut JobContext<'_>, var: &Identifier, f: &Fragment) -> Result<(), GenerationError> {
    let parent = cx.get_variable(&f.id("uart_id")?)?;
    cx.add(var, "set_uart_parent", vec![Expr::var(&parent)])
}

fn to_code(f: Fragment) -> Box<dyn GenerationJob> {
    StagedJob::new(f.instance.clone(), f)
        .then(|f, cx| {
            let id = cx.identifier(&f.id("id")?)?;
            cx.new_pvariable(&id, vec![])?;
            register_component(cx, &id)?;
            cx.add(&id, "set_baud_rate", vec![Expr::Int(f.int("baud_rate")?)])?;
            for (key, method) in [("tx_pin", "set_tx_pin"), ("rx_pin", "set_rx_pin")] {
                if let Some(number) = f.get(key).and_then(|p| p.get("number")).and_then(|n| n.as_i64()) {
                    cx.add(&id, method, vec![Expr::Int(number)])?;
                }
            }
            Ok(())
        })
        .boxed()
}
