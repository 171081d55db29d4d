/*!
 * Logs every event a device shows its viewers.
 */
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, event, Level};

use crate::device::Device;
use crate::error::RespondError;
use crate::event::{Event, EventKind};
use crate::plugin::Operator;

/// Registry name
pub const NAME: &str = "event_logger";

/// Viewer writing events to `tracing`
#[derive(Debug, Default)]
pub struct EventLogger;

#[async_trait]
impl Operator for EventLogger {
    fn name(&self) -> &str {
        NAME
    }

    async fn respond(&self, _device: &Arc<Device>, e: &Event) -> Result<(), RespondError> {
        match &e.kind {
            EventKind::Annotation { level, message } => match *level {
                Level::ERROR => event!(Level::ERROR, serial = %e.serial, "{}", message),
                Level::WARN => event!(Level::WARN, serial = %e.serial, "{}", message),
                Level::INFO => event!(Level::INFO, serial = %e.serial, "{}", message),
                _ => debug!(serial = %e.serial, "{}", message),
            },
            EventKind::AttributeChange { changes, .. } => {
                for change in changes {
                    debug!(serial = %e.serial, "{}", change);
                }
            }
            _ => debug!("{}", e),
        }
        Ok(())
    }
}
