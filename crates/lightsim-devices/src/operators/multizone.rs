/*!
 * Multizone strips.
 *
 * The `zones` attribute holds one HSBK record per zone. Set requests can be
 * buffered with [`ZoneApply::NoApply`] and flushed by a later request with
 * [`ZoneApply::Apply`] or [`ZoneApply::ApplyOnly`].
 *
 * Replies describing a range of zones are a single `StateZone` when the range
 * covers one zone, otherwise `StateMultiZone` batches of eight starting at the
 * first zone of the range. Batches running past the last zone are padded.
 */
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use lightsim_core::types::Value;

use crate::attrs::{Change, Path};
use crate::device::Device;
use crate::error::{DeviceError, RespondError, Result};
use crate::event::Event;
use crate::plugin::Operator;
use crate::product::DeviceInfo;
use crate::protocol::{Hsbk, Message, MessageKind, ZoneApply};

/// Registry name
pub const NAME: &str = "multizone";

/// Zones carried by one `StateMultiZone`
pub const BATCH: usize = 8;

/// Zones carried by one `StateExtendedColorZones`
pub const EXTENDED_BATCH: usize = 82;

/// Options read from the value store
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MultizoneOptions {
    /// Zone colours after a reset, one per zone
    #[serde(default)]
    pub zones: Option<Vec<Hsbk>>,
}

/// Owns the `zones` attribute
#[derive(Debug)]
pub struct MultizoneOperator {
    extended: bool,
    colors: Vec<Hsbk>,
    pending: Mutex<Vec<(usize, Hsbk)>>,
}

impl MultizoneOperator {
    /// Create the operator, checking configured colours against the zone count
    pub fn new(info: &DeviceInfo, options: MultizoneOptions) -> Result<Self> {
        let count = info.product.zones;
        let colors = match options.zones {
            Some(zones) if zones.len() != count => {
                return Err(DeviceError::invalid_options(
                    NAME,
                    format!("expected {} zone colours, got {}", count, zones.len()),
                ))
            }
            Some(zones) => zones,
            None => vec![super::light::DEFAULT_COLOR; count],
        };
        Ok(Self {
            extended: info.capability().has_extended_multizone,
            colors,
            pending: Mutex::new(Vec::new()),
        })
    }

    /// Current zone colours
    pub fn zones(device: &Device) -> Vec<Hsbk> {
        device
            .attrs()
            .get("zones")
            .and_then(|v| {
                v.as_array()
                    .map(|zones| zones.iter().filter_map(Hsbk::from_value).collect())
            })
            .unwrap_or_default()
    }

    async fn paint(
        &self,
        device: &Arc<Device>,
        event: &Event,
        updates: Vec<(usize, Hsbk)>,
        apply: ZoneApply,
    ) -> Result<()> {
        let updates = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            match apply {
                ZoneApply::NoApply => {
                    pending.extend(updates);
                    return Ok(());
                }
                ZoneApply::Apply => {
                    let mut all = std::mem::take(&mut *pending);
                    all.extend(updates);
                    all
                }
                ZoneApply::ApplyOnly => std::mem::take(&mut *pending),
            }
        };

        let count = self.colors.len();
        let changes: Vec<Change> = updates
            .into_iter()
            .filter(|(index, _)| *index < count)
            .map(|(index, color)| Path::root("zones").index(index).change_to(color))
            .collect();
        if changes.is_empty() {
            debug!("Nothing to paint on {}", device.serial());
            return Ok(());
        }
        device.apply(changes, Some(event.clone())).await?;
        Ok(())
    }
}

/// Replies describing zones `start..=end`, clamped to the strip
pub fn range_replies(zones: &[Hsbk], start: usize, end: usize) -> Vec<Message> {
    let count = zones.len();
    if count == 0 || start >= count {
        return Vec::new();
    }
    let end = end.min(count - 1);
    if end < start {
        return Vec::new();
    }

    let zones_count = count as u8;
    if start == end {
        return vec![Message::StateZone {
            zones_count,
            zone_index: start as u8,
            color: zones[start],
        }];
    }

    (start..=end)
        .step_by(BATCH)
        .map(|first| Message::StateMultiZone {
            zones_count,
            zone_index: first as u8,
            colors: (first..first + BATCH)
                .map(|i| zones.get(i).copied().unwrap_or_default())
                .collect(),
        })
        .collect()
}

fn extended_replies(zones: &[Hsbk]) -> Vec<Message> {
    if zones.is_empty() {
        return Vec::new();
    }
    zones
        .chunks(EXTENDED_BATCH)
        .enumerate()
        .map(|(i, chunk)| Message::StateExtendedColorZones {
            zones_count: zones.len() as u16,
            zone_index: (i * EXTENDED_BATCH) as u16,
            colors: chunk.to_vec(),
        })
        .collect()
}

#[async_trait]
impl Operator for MultizoneOperator {
    fn name(&self) -> &str {
        NAME
    }

    fn reset_changes(&self, _event: &Event, zerod: bool) -> Vec<Change> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        let zones: Vec<Value> = if zerod {
            vec![Value::from(Hsbk::default()); self.colors.len()]
        } else {
            self.colors.iter().map(|c| Value::from(*c)).collect()
        };
        vec![Path::root("zones").change_to(zones)]
    }

    async fn respond(
        &self,
        device: &Arc<Device>,
        event: &Event,
    ) -> std::result::Result<(), RespondError> {
        let Some(message) = event.incoming() else {
            return Ok(());
        };

        match message {
            Message::GetColorZones {
                start_index,
                end_index,
            } => {
                let replies =
                    range_replies(&Self::zones(device), *start_index as usize, *end_index as usize);
                event.add_replies(replies);
            }
            Message::SetColorZones {
                start_index,
                end_index,
                color,
                apply,
                ..
            } => {
                let (start, end) = (*start_index as usize, *end_index as usize);
                let updates = (start..=end).map(|i| (i, *color)).collect();
                self.paint(device, event, updates, *apply).await?;
                event.add_replies(range_replies(&Self::zones(device), start, end));
            }
            Message::GetExtendedColorZones if self.extended => {
                event.add_replies(extended_replies(&Self::zones(device)));
            }
            Message::SetExtendedColorZones {
                zone_index,
                colors,
                apply,
                ..
            } if self.extended => {
                let start = *zone_index as usize;
                let updates = colors
                    .iter()
                    .enumerate()
                    .map(|(i, c)| (start + i, *c))
                    .collect();
                self.paint(device, event, updates, *apply).await?;
                let end = start + colors.len().max(1) - 1;
                event.add_replies(range_replies(&Self::zones(device), start, end));
            }
            _ => return Ok(()),
        }
        event.mark_handled();
        Ok(())
    }

    fn state_for(&self, device: &Device, kind: MessageKind) -> Vec<Message> {
        let zones = Self::zones(device);
        match kind {
            MessageKind::StateMultiZone => range_replies(&zones, 0, zones.len().saturating_sub(1))
                .into_iter()
                .filter(|m| m.kind() == MessageKind::StateMultiZone)
                .collect(),
            MessageKind::StateExtendedColorZones if self.extended => extended_replies(&zones),
            _ => Vec::new(),
        }
    }
}
