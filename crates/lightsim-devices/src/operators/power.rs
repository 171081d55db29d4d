/*!
 * Device power level.
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
use crate::product::DeviceInfo;
use crate::protocol::{Message, MessageKind};

/// Registry name
pub const NAME: &str = "power";

/// Options read from the value store
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PowerOptions {
    /// Power level after a reset
    #[serde(default)]
    pub power: u16,
}

/// Owns the `power` attribute
#[derive(Debug)]
pub struct PowerOperator {
    is_light: bool,
    options: PowerOptions,
    setters: Vec<AttrSetter<PowerOptions>>,
}

impl PowerOperator {
    /// Create the operator for a device
    pub fn new(info: &DeviceInfo, options: PowerOptions) -> Self {
        Self {
            is_light: info.capability().is_light,
            options,
            setters: vec![AttrSetter::lambda("power", |_, o: &PowerOptions| {
                Value::from(o.power)
            })
            .or_zerod(|_, _| Value::from(0u16))],
        }
    }

    fn level(device: &Device) -> u16 {
        device.attrs().int("power").unwrap_or(0) as u16
    }

    async fn set_level(
        &self,
        device: &Arc<Device>,
        event: &Event,
        level: u16,
    ) -> Result<(), RespondError> {
        device
            .change([("power", Value::from(level))], Some(event.clone()))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Operator for PowerOperator {
    fn name(&self) -> &str {
        NAME
    }

    fn reset_changes(&self, event: &Event, zerod: bool) -> Vec<Change> {
        AttrSetter::changes(&self.setters, event, &self.options, zerod)
    }

    async fn respond(&self, device: &Arc<Device>, event: &Event) -> Result<(), RespondError> {
        let Some(message) = event.incoming() else {
            return Ok(());
        };

        match message {
            Message::GetPower => {}
            Message::SetPower { level } => self.set_level(device, event, *level).await?,
            Message::GetLightPower if self.is_light => {}
            Message::SetLightPower { level, .. } if self.is_light => {
                self.set_level(device, event, *level).await?
            }
            _ => return Ok(()),
        }

        let kind = match message.kind() {
            MessageKind::GetPower | MessageKind::SetPower => MessageKind::StatePower,
            _ => MessageKind::StateLightPower,
        };
        event.add_replies(self.state_for(device, kind));
        Ok(())
    }

    fn state_for(&self, device: &Device, kind: MessageKind) -> Vec<Message> {
        match kind {
            MessageKind::StatePower => vec![Message::StatePower {
                level: Self::level(device),
            }],
            MessageKind::StateLightPower if self.is_light => vec![Message::StateLightPower {
                level: Self::level(device),
            }],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use crate::operators::testing::ask;
    use crate::plugin::{Plugin, ValueStore};
    use crate::product::{Firmware, Product};
    use crate::viewers::Recorder;

    async fn device(product: Product, recorder: &Arc<Recorder>) -> Arc<Device> {
        let device = Device::builder("d073d5000001".parse().unwrap(), product, Firmware::new(3, 90, 0))
            .values(ValueStore::new().with("power", 65535))
            .plugin(Plugin::Viewer(recorder.clone()))
            .build();
        device.reset(false).await.unwrap();
        device
    }

    #[tokio::test]
    async fn test_set_power_replies_with_new_level() {
        let recorder = Arc::new(Recorder::new());
        let device = device(Product::LCM3_A19, &recorder).await;

        let (_, replies) = ask(&device, Message::GetPower).await;
        assert_eq!(replies, vec![Message::StatePower { level: 65535 }]);

        let (event, replies) = ask(&device, Message::SetPower { level: 0 }).await;
        assert_eq!(replies, vec![Message::StatePower { level: 0 }]);
        assert_eq!(device.attrs().int("power"), Some(0));

        let changes = recorder.events_of(EventType::AttributeChange);
        assert_eq!(changes.len(), 1);
        assert!(changes[0].matches(EventType::AttributeChange));
        match &changes[0].kind {
            crate::event::EventKind::AttributeChange { because, .. } => {
                assert_eq!(because.as_deref(), Some(&event));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_light_power_only_on_lights() {
        let recorder = Arc::new(Recorder::new());
        let bulb = device(Product::LCM3_A19, &recorder).await;
        let (_, replies) = ask(&bulb, Message::SetLightPower { level: 100, duration_ms: 0 }).await;
        assert_eq!(replies, vec![Message::StateLightPower { level: 100 }]);

        let switch = device(Product::LCM3_32_SWITCH_I, &recorder).await;
        let (event, replies) = ask(&switch, Message::GetLightPower).await;
        assert!(replies.is_empty());
        assert!(!event.handled());
        assert_eq!(
            switch.state_for(MessageKind::StatePower).unwrap(),
            Message::StatePower { level: 65535 }
        );
    }
}
