/*!
 * Built-in viewers.
 */
use std::sync::Arc;

use crate::plugin::Plugin;
use crate::registry::{PluginFactory, PluginRegistry};

pub mod logger;
pub mod recorder;

pub use logger::EventLogger;
pub use recorder::{EventPredicate, Recorder};

pub(crate) fn register_builtins(registry: &PluginRegistry) {
    registry.register(PluginFactory::new(logger::NAME, |_| {
        Ok(Some(Plugin::Viewer(Arc::new(EventLogger))))
    }));
}
