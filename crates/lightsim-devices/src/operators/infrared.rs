/*!
 * Infrared brightness.
 */
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use lightsim_core::types::Value;

use crate::attrs::Change;
use crate::device::Device;
use crate::error::RespondError;
use crate::event::Event;
use crate::plugin::{AttrSetter, Operator};
use crate::protocol::{Message, MessageKind};

/// Registry name
pub const NAME: &str = "infrared";

/// Options read from the value store
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InfraredOptions {
    /// Infrared brightness after a reset
    #[serde(default)]
    pub infrared: u16,
}

/// Owns the `infrared` attribute
#[derive(Debug)]
pub struct InfraredOperator {
    options: InfraredOptions,
    setters: Vec<AttrSetter<InfraredOptions>>,
}

impl InfraredOperator {
    /// Create the operator
    pub fn new(options: InfraredOptions) -> Self {
        Self {
            options,
            setters: vec![AttrSetter::lambda("infrared", |_, o: &InfraredOptions| {
                Value::from(o.infrared)
            })
            .or_zerod(|_, _| Value::from(0u16))],
        }
    }
}

#[async_trait]
impl Operator for InfraredOperator {
    fn name(&self) -> &str {
        NAME
    }

    fn reset_changes(&self, event: &Event, zerod: bool) -> Vec<Change> {
        AttrSetter::changes(&self.setters, event, &self.options, zerod)
    }

    async fn respond(&self, device: &Arc<Device>, event: &Event) -> Result<(), RespondError> {
        match event.incoming() {
            Some(Message::GetInfrared) => {}
            Some(Message::SetInfrared { brightness }) => {
                device
                    .change([("infrared", Value::from(*brightness))], Some(event.clone()))
                    .await?;
            }
            _ => return Ok(()),
        }
        event.add_replies(self.state_for(device, MessageKind::StateInfrared));
        Ok(())
    }

    fn state_for(&self, device: &Device, kind: MessageKind) -> Vec<Message> {
        match kind {
            MessageKind::StateInfrared => vec![Message::StateInfrared {
                brightness: device.attrs().int("infrared").unwrap_or(0) as u16,
            }],
            _ => Vec::new(),
        }
    }
}
