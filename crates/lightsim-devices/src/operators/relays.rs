/*!
 * Switch relays.
 */
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use serde::Deserialize;

use lightsim_core::types::Value;

use crate::attrs::{Change, Path};
use crate::device::Device;
use crate::error::{DeviceError, RespondError, Result};
use crate::event::Event;
use crate::plugin::Operator;
use crate::product::DeviceInfo;
use crate::protocol::{Message, MessageKind};

/// Registry name
pub const NAME: &str = "relays";

/// Options read from the value store
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelaysOptions {
    /// Power level of each relay after a reset
    #[serde(default)]
    pub relays: Option<Vec<u16>>,
}

/// Owns the `relays` attribute, one power level per relay
#[derive(Debug)]
pub struct RelaysOperator {
    count: usize,
    levels: Vec<u16>,
}

impl RelaysOperator {
    /// Create the operator, checking configured levels against the relay count
    pub fn new(info: &DeviceInfo, options: RelaysOptions) -> Result<Self> {
        let count = info.product.relays;
        let levels = match options.relays {
            Some(levels) if levels.len() != count => {
                return Err(DeviceError::invalid_options(
                    NAME,
                    format!("expected {} relay levels, got {}", count, levels.len()),
                ))
            }
            Some(levels) => levels,
            None => vec![0; count],
        };
        Ok(Self { count, levels })
    }

    fn level(device: &Device, index: usize) -> u16 {
        device
            .attrs()
            .int(Path::root("relays").index(index))
            .unwrap_or(0) as u16
    }

    fn check(&self, index: u8) -> std::result::Result<usize, RespondError> {
        let index = index as usize;
        if index >= self.count {
            return Err(anyhow!("relay {} out of range, device has {}", index, self.count).into());
        }
        Ok(index)
    }
}

#[async_trait]
impl Operator for RelaysOperator {
    fn name(&self) -> &str {
        NAME
    }

    fn reset_changes(&self, _event: &Event, zerod: bool) -> Vec<Change> {
        let levels: Vec<Value> = if zerod {
            vec![Value::from(0u16); self.count]
        } else {
            self.levels.iter().map(|l| Value::from(*l)).collect()
        };
        vec![Path::root("relays").change_to(levels)]
    }

    async fn respond(
        &self,
        device: &Arc<Device>,
        event: &Event,
    ) -> std::result::Result<(), RespondError> {
        let index = match event.incoming() {
            Some(Message::GetRPower { relay_index }) => self.check(*relay_index)?,
            Some(Message::SetRPower { relay_index, level }) => {
                let index = self.check(*relay_index)?;
                device
                    .change(
                        [(Path::root("relays").index(index), Value::from(*level))],
                        Some(event.clone()),
                    )
                    .await?;
                index
            }
            _ => return Ok(()),
        };
        event.add_reply(Message::StateRPower {
            relay_index: index as u8,
            level: Self::level(device, index),
        });
        Ok(())
    }

    fn state_for(&self, device: &Device, kind: MessageKind) -> Vec<Message> {
        match kind {
            MessageKind::StateRPower => (0..self.count)
                .map(|index| Message::StateRPower {
                    relay_index: index as u8,
                    level: Self::level(device, index),
                })
                .collect(),
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

    #[test]
    fn test_wrong_relay_count_is_invalid() {
        let info = DeviceInfo {
            serial: "d073d5000001".parse().unwrap(),
            product: Product::LCM3_32_SWITCH_I,
            firmware: Firmware::new(3, 90, 0),
        };
        let err = RelaysOperator::new(
            &info,
            RelaysOptions {
                relays: Some(vec![0, 0]),
            },
        )
        .unwrap_err();
        assert!(matches!(err, DeviceError::InvalidOptions { .. }));
    }

    #[tokio::test]
    async fn test_switch_relays() {
        let recorder = Arc::new(Recorder::new());
        let device = Device::builder("d073d5000001".parse().unwrap(), Product::LCM3_32_SWITCH_I, Firmware::new(3, 90, 0))
            .values(ValueStore::new().with("relays", serde_json::json!([0, 65535, 0, 0])))
            .plugin(Plugin::Viewer(recorder.clone()))
            .build();
        device.reset(false).await.unwrap();

        let (_, replies) = ask(&device, Message::SetRPower { relay_index: 2, level: 65535 }).await;
        assert_eq!(replies, vec![Message::StateRPower { relay_index: 2, level: 65535 }]);

        let states = device.states_for(MessageKind::StateRPower, true).unwrap();
        let levels: Vec<u16> = states
            .iter()
            .map(|s| match s {
                Message::StateRPower { level, .. } => *level,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(levels, vec![0, 65535, 65535, 0]);

        let (event, _) = ask(&device, Message::GetRPower { relay_index: 9 }).await;
        assert!(!event.handled());
        assert_eq!(recorder.count(EventType::Annotation), 1);
    }
}
