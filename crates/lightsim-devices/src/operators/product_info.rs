/*!
 * Product and firmware identity.
 */
use std::sync::Arc;

use async_trait::async_trait;

use crate::device::Device;
use crate::error::RespondError;
use crate::event::Event;
use crate::plugin::Operator;
use crate::product::DeviceInfo;
use crate::protocol::{Message, MessageKind};

/// Registry name
pub const NAME: &str = "product_info";

/// Answers version and firmware queries from the device identity
#[derive(Debug)]
pub struct ProductInfoOperator {
    info: DeviceInfo,
}

impl ProductInfoOperator {
    /// Create the operator for a device
    pub fn new(info: &DeviceInfo) -> Self {
        Self { info: info.clone() }
    }
}

#[async_trait]
impl Operator for ProductInfoOperator {
    fn name(&self) -> &str {
        NAME
    }

    async fn respond(&self, device: &Arc<Device>, event: &Event) -> Result<(), RespondError> {
        let kind = match event.incoming().map(Message::kind) {
            Some(MessageKind::GetVersion) => MessageKind::StateVersion,
            Some(MessageKind::GetHostFirmware) => MessageKind::StateHostFirmware,
            _ => return Ok(()),
        };
        event.add_replies(self.state_for(device, kind));
        Ok(())
    }

    fn state_for(&self, _device: &Device, kind: MessageKind) -> Vec<Message> {
        match kind {
            MessageKind::StateVersion => vec![Message::StateVersion {
                vendor: self.info.product.vendor,
                product: self.info.product.pid,
            }],
            MessageKind::StateHostFirmware => vec![Message::StateHostFirmware {
                build: self.info.firmware.build,
                version_major: self.info.firmware.major,
                version_minor: self.info.firmware.minor,
            }],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::testing::ask;
    use crate::product::{Firmware, Product};

    #[tokio::test]
    async fn test_version_and_firmware() {
        let device = Device::builder(
            "d073d5000001".parse().unwrap(),
            Product::LCM2_Z,
            Firmware::new(2, 80, 1_548_977_726),
        )
        .build();
        device.reset(false).await.unwrap();

        let (_, replies) = ask(&device, Message::GetVersion).await;
        assert_eq!(
            replies,
            vec![Message::StateVersion {
                vendor: Product::LCM2_Z.vendor,
                product: Product::LCM2_Z.pid,
            }]
        );

        assert_eq!(
            device.state_for(MessageKind::StateHostFirmware).unwrap(),
            Message::StateHostFirmware {
                build: 1_548_977_726,
                version_major: 2,
                version_minor: 80,
            }
        );
    }
}
