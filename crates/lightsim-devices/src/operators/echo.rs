/*!
 * Echo requests.
 */
use std::sync::Arc;

use async_trait::async_trait;

use crate::device::Device;
use crate::error::RespondError;
use crate::event::Event;
use crate::plugin::Operator;
use crate::protocol::Message;

/// Registry name
pub const NAME: &str = "echo";

/// Sends back whatever an echo request carried
#[derive(Debug)]
pub struct EchoOperator;

#[async_trait]
impl Operator for EchoOperator {
    fn name(&self) -> &str {
        NAME
    }

    async fn respond(&self, _device: &Arc<Device>, event: &Event) -> Result<(), RespondError> {
        if let Some(Message::EchoRequest { echoing }) = event.incoming() {
            event.add_reply(Message::EchoResponse {
                echoing: echoing.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::testing::ask;
    use crate::product::{Firmware, Product};

    #[tokio::test]
    async fn test_echo() {
        let device = Device::builder("d073d5000001".parse().unwrap(), Product::LCM3_A19, Firmware::new(3, 90, 0)).build();
        device.reset(false).await.unwrap();

        let (_, replies) = ask(&device, Message::EchoRequest { echoing: vec![1, 2, 3] }).await;
        assert_eq!(replies, vec![Message::EchoResponse { echoing: vec![1, 2, 3] }]);
    }
}
