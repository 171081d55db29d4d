/*!
 * Light colour.
 *
 * The `color` attribute is an HSBK record guarded by a range hook. A
 * `SetColor` assigns each field through the hook, so an out of range field is
 * rejected on its own and the rest of the colour still changes.
 */
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use lightsim_core::types::Value;

use crate::attrs::{Change, Path};
use crate::device::Device;
use crate::error::RespondError;
use crate::event::Event;
use crate::plugin::{AttrSetter, Operator};
use crate::protocol::{Hsbk, Message, MessageKind};

/// Registry name
pub const NAME: &str = "light";

/// Colour a light comes up with when nothing is configured
pub const DEFAULT_COLOR: Hsbk = Hsbk::new(0.0, 0.0, 1.0, 3500);

fn default_color() -> Hsbk {
    DEFAULT_COLOR
}

/// Options read from the value store
#[derive(Debug, Clone, Deserialize)]
pub struct LightOptions {
    /// Colour after a reset
    #[serde(default = "default_color")]
    pub color: Hsbk,
}

impl Default for LightOptions {
    fn default() -> Self {
        Self {
            color: DEFAULT_COLOR,
        }
    }
}

/// Owns the `color` attribute and answers light state queries
#[derive(Debug)]
pub struct LightOperator {
    options: LightOptions,
    setters: Vec<AttrSetter<LightOptions>>,
}

impl LightOperator {
    /// Create the operator
    pub fn new(options: LightOptions) -> Self {
        Self {
            options,
            setters: vec![AttrSetter::lambda("color", |_, o: &LightOptions| {
                Value::from(o.color)
            })
            .or_zerod(|_, _| Value::from(Hsbk::default()))],
        }
    }

    fn color(device: &Device) -> Hsbk {
        device
            .attrs()
            .get("color")
            .and_then(|v| Hsbk::from_value(&v))
            .unwrap_or_default()
    }
}

#[async_trait]
impl Operator for LightOperator {
    fn name(&self) -> &str {
        NAME
    }

    fn reset_changes(&self, event: &Event, zerod: bool) -> Vec<Change> {
        AttrSetter::changes(&self.setters, event, &self.options, zerod)
    }

    async fn respond(&self, device: &Arc<Device>, event: &Event) -> Result<(), RespondError> {
        match event.incoming() {
            Some(Message::GetColor) => {}
            Some(Message::SetColor { color, .. }) => {
                let color_path = || Path::root("color");
                let changes = vec![
                    color_path().key("hue").change_to(color.hue),
                    color_path().key("saturation").change_to(color.saturation),
                    color_path().key("brightness").change_to(color.brightness),
                    color_path().key("kelvin").change_to(color.kelvin),
                ];
                device.apply(changes, Some(event.clone())).await?;
            }
            _ => return Ok(()),
        }
        event.add_replies(self.state_for(device, MessageKind::LightState));
        Ok(())
    }

    fn state_for(&self, device: &Device, kind: MessageKind) -> Vec<Message> {
        match kind {
            MessageKind::LightState => vec![Message::LightState {
                color: Self::color(device),
                power: device.attrs().int("power").unwrap_or(0) as u16,
                label: device.attrs().string("label").unwrap_or_default(),
            }],
            _ => Vec::new(),
        }
    }
}
