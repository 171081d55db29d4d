/*!
 * lightsim Devices
 *
 * The virtual device engine: a [`Device`] with an attribute store, capability
 * plugins selected from its product, an event bus dispatching to viewers, IO
 * plugins and operators, and a per channel packet filter for fault injection.
 */

#![warn(missing_docs)]

// Re-export core types
pub use lightsim_core::prelude;

pub mod attrs;
pub mod device;
pub mod error;
pub mod event;
pub mod filter;
pub mod io;
pub mod operators;
pub mod plugin;
pub mod product;
pub mod protocol;
pub mod registry;
pub mod viewers;

pub use attrs::{Attrs, Change, ChangeKind, Path};
pub use device::{Device, DeviceBuilder, Dispatch, Lifecycle};
pub use error::{DeviceError, RespondError, Result};
pub use event::{Event, EventKind, EventMatcher, EventOptions, EventType};
pub use filter::{Decision, Filter, FilterGuard};
pub use io::{IoChannel, MemoryIo, Received};
pub use plugin::{AttrSetter, Io, Operator, Plugin, PluginContext, ValueStore};
pub use product::{Capability, DeviceInfo, Firmware, Product, Serial};
pub use protocol::{Codec, Hsbk, JsonCodec, Message, MessageKind, Packet};
pub use registry::{default_registry, PluginFactory, PluginRegistry};
pub use viewers::{EventLogger, Recorder};

/// lightsim devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device engine
///
/// Builds the default plugin registry so the first device does not pay for it.
pub fn init() -> std::result::Result<(), lightsim_core::error::Error> {
    let registry = default_registry();
    tracing::info!(
        "lightsim devices {} initialized with {} built-in plugins",
        VERSION,
        registry.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_builds_registry() {
        init().unwrap();
        let names = default_registry().names();
        for name in ["power", "label", "light", "multizone", "clean", "relays", "memory", "event_logger"] {
            assert!(names.iter().any(|n| n == name), "missing {}", name);
        }
    }
}
