/*!
 * Event recorder.
 *
 * A viewer that keeps every event it sees, for tests and for tools that want
 * to inspect what a device did.
 */
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use lightsim_core::utils::with_timeout;

use crate::device::Device;
use crate::error::{RespondError, Result};
use crate::event::{Event, EventMatcher, EventType};
use crate::plugin::Operator;

/// Registry name
pub const NAME: &str = "recorder";

/// Something that picks out events
pub trait EventPredicate: Send + Sync {
    /// Whether `event` is wanted
    fn test(&self, event: &Event) -> bool;
}

impl EventPredicate for EventType {
    fn test(&self, event: &Event) -> bool {
        event.matches(*self)
    }
}

impl EventPredicate for EventMatcher {
    fn test(&self, event: &Event) -> bool {
        event.matches(self.clone())
    }
}

impl<F> EventPredicate for F
where
    F: Fn(&Event) -> bool + Send + Sync,
{
    fn test(&self, event: &Event) -> bool {
        self(event)
    }
}

/// Viewer keeping every event it is shown
#[derive(Debug, Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
    notify: Notify,
}

impl Recorder {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Event>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every recorded event in order
    pub fn events(&self) -> Vec<Event> {
        self.lock().clone()
    }

    /// Recorded events of one type
    pub fn events_of(&self, event_type: EventType) -> Vec<Event> {
        self.lock()
            .iter()
            .filter(|e| e.matches(event_type))
            .cloned()
            .collect()
    }

    /// Types of the recorded events in order
    pub fn types(&self) -> Vec<EventType> {
        self.lock().iter().map(Event::event_type).collect()
    }

    /// How many events of one type were recorded
    pub fn count(&self, event_type: EventType) -> usize {
        self.lock().iter().filter(|e| e.matches(event_type)).count()
    }

    /// Forget everything recorded so far
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn find<P: EventPredicate>(&self, predicate: &P) -> Option<Event> {
        self.lock().iter().find(|e| predicate.test(e)).cloned()
    }

    /// Wait until an event matching `predicate` has been recorded
    ///
    /// Events recorded before the call count.
    pub async fn wait_for<P: EventPredicate>(&self, predicate: P, timeout: Duration) -> Result<Event> {
        let event = with_timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if let Some(event) = self.find(&predicate) {
                    return Ok(event);
                }
                notified.await;
            }
        })
        .await?;
        Ok(event)
    }
}

#[async_trait]
impl Operator for Recorder {
    fn name(&self) -> &str {
        NAME
    }

    async fn respond(
        &self,
        _device: &Arc<Device>,
        event: &Event,
    ) -> std::result::Result<(), RespondError> {
        self.lock().push(event.clone());
        self.notify.notify_waiters();
        Ok(())
    }
}
