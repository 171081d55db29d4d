/*!
 * Device label.
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
pub const NAME: &str = "label";

/// Longest label the protocol carries, in bytes
pub const MAX_LABEL_LEN: usize = 32;

/// Options read from the value store
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LabelOptions {
    /// Label after a reset
    #[serde(default)]
    pub label: String,
}

/// Owns the `label` attribute
#[derive(Debug)]
pub struct LabelOperator {
    options: LabelOptions,
    setters: Vec<AttrSetter<LabelOptions>>,
}

impl LabelOperator {
    /// Create the operator
    pub fn new(options: LabelOptions) -> Self {
        Self {
            options,
            setters: vec![AttrSetter::lambda("label", |_, o: &LabelOptions| {
                Value::from(truncate(&o.label))
            })
            .or_zerod(|_, _| Value::from(""))],
        }
    }
}

fn truncate(label: &str) -> String {
    let mut end = label.len().min(MAX_LABEL_LEN);
    while !label.is_char_boundary(end) {
        end -= 1;
    }
    label[..end].to_string()
}

#[async_trait]
impl Operator for LabelOperator {
    fn name(&self) -> &str {
        NAME
    }

    fn reset_changes(&self, event: &Event, zerod: bool) -> Vec<Change> {
        AttrSetter::changes(&self.setters, event, &self.options, zerod)
    }

    async fn respond(&self, device: &Arc<Device>, event: &Event) -> Result<(), RespondError> {
        match event.incoming() {
            Some(Message::GetLabel) => {}
            Some(Message::SetLabel { label }) => {
                device
                    .change([("label", Value::from(truncate(label)))], Some(event.clone()))
                    .await?;
            }
            _ => return Ok(()),
        }
        event.add_replies(self.state_for(device, MessageKind::StateLabel));
        Ok(())
    }

    fn state_for(&self, device: &Device, kind: MessageKind) -> Vec<Message> {
        match kind {
            MessageKind::StateLabel => vec![Message::StateLabel {
                label: device.attrs().string("label").unwrap_or_default(),
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

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("kitchen"), "kitchen");
        let long = "é".repeat(20);
        let cut = truncate(&long);
        assert!(cut.len() <= MAX_LABEL_LEN);
        assert_eq!(cut.chars().count(), 16);
    }

    #[tokio::test]
    async fn test_set_label() {
        let device = Device::builder("d073d5000001".parse().unwrap(), Product::LCM3_A19, Firmware::new(3, 90, 0))
            .value("label", "kitchen")
            .build();
        device.reset(false).await.unwrap();

        let (_, replies) = ask(&device, Message::SetLabel { label: "hall".into() }).await;
        assert_eq!(replies, vec![Message::StateLabel { label: "hall".into() }]);
        assert_eq!(device.attrs().string("label").as_deref(), Some("hall"));
    }
}
