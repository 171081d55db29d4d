/*!
 * Built-in operators.
 *
 * Each operator owns a slice of the attribute tree, answers the protocol
 * messages for that slice and reports it through `state_for`. Options are read
 * from the device's value store when the operator is selected.
 */
use std::sync::Arc;

use crate::plugin::Plugin;
use crate::registry::{PluginFactory, PluginRegistry};

pub mod clean;
pub mod echo;
pub mod infrared;
pub mod label;
pub mod light;
pub mod multizone;
pub mod power;
pub mod product_info;
pub mod relays;

pub use clean::CleanOperator;
pub use echo::EchoOperator;
pub use infrared::InfraredOperator;
pub use label::LabelOperator;
pub use light::LightOperator;
pub use multizone::MultizoneOperator;
pub use power::PowerOperator;
pub use product_info::ProductInfoOperator;
pub use relays::RelaysOperator;

pub(crate) fn register_builtins(registry: &PluginRegistry) {
    registry.register(PluginFactory::new(power::NAME, |ctx| {
        Ok(Some(Plugin::Operator(Arc::new(PowerOperator::new(
            ctx.info,
            ctx.store.options(power::NAME)?,
        )))))
    }));
    registry.register(PluginFactory::new(label::NAME, |ctx| {
        Ok(Some(Plugin::Operator(Arc::new(LabelOperator::new(
            ctx.store.options(label::NAME)?,
        )))))
    }));
    registry.register(PluginFactory::new(product_info::NAME, |ctx| {
        Ok(Some(Plugin::Operator(Arc::new(ProductInfoOperator::new(
            ctx.info,
        )))))
    }));
    registry.register(PluginFactory::new(echo::NAME, |_| {
        Ok(Some(Plugin::Operator(Arc::new(EchoOperator))))
    }));
    registry.register(PluginFactory::new(light::NAME, |ctx| {
        if !ctx.info.capability().is_light {
            return Ok(None);
        }
        Ok(Some(Plugin::Operator(Arc::new(LightOperator::new(
            ctx.store.options(light::NAME)?,
        )))))
    }));
    registry.register(PluginFactory::new(infrared::NAME, |ctx| {
        if !ctx.info.capability().has_ir {
            return Ok(None);
        }
        Ok(Some(Plugin::Operator(Arc::new(InfraredOperator::new(
            ctx.store.options(infrared::NAME)?,
        )))))
    }));
    registry.register(PluginFactory::new(multizone::NAME, |ctx| {
        if !ctx.info.capability().has_multizone {
            return Ok(None);
        }
        Ok(Some(Plugin::Operator(Arc::new(MultizoneOperator::new(
            ctx.info,
            ctx.store.options(multizone::NAME)?,
        )?))))
    }));
    registry.register(PluginFactory::new(clean::NAME, |ctx| {
        if !ctx.info.capability().has_hev {
            return Ok(None);
        }
        Ok(Some(Plugin::Operator(Arc::new(CleanOperator::new(
            ctx.store.options(clean::NAME)?,
            &ctx.config.clean,
        )?))))
    }));
    registry.register(PluginFactory::new(relays::NAME, |ctx| {
        if !ctx.info.capability().has_relays {
            return Ok(None);
        }
        Ok(Some(Plugin::Operator(Arc::new(RelaysOperator::new(
            ctx.info,
            ctx.store.options(relays::NAME)?,
        )?))))
    }));
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use crate::device::Device;
    use crate::event::{Event, EventKind, EventOptions};
    use crate::protocol::{Message, Packet};

    /// Dispatch `message` as if it arrived on a transport and collect the replies
    pub(crate) async fn ask(device: &Arc<Device>, message: Message) -> (Event, Vec<Message>) {
        let event = Event::new(
            device.serial(),
            EventKind::incoming("test", Packet::new(message).to(device.serial()), None),
        );
        device
            .dispatch(&event, &EventOptions::default())
            .await
            .unwrap();
        let replies = event.replies();
        (event, replies)
    }
}
