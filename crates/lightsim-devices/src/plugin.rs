/*!
 * Capability plugins.
 *
 * Every behaviour a device has comes from a plugin. Operators react to events
 * and own a slice of the attribute tree. Viewers observe. IO plugins bridge the
 * device to a transport. All three share the [`Operator`] trait; the role is
 * carried by the [`Plugin`] wrapper so `Device::prepare` can bucket them.
 */
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;

use lightsim_core::config::Config;
use lightsim_core::types::Value;

use crate::attrs::{Change, Path};
use crate::device::Device;
use crate::error::{DeviceError, RespondError, Result};
use crate::event::Event;
use crate::io::{IoChannel, Received};
use crate::product::DeviceInfo;
use crate::protocol::{Message, MessageKind, Service};

/// Behaviour unit attached to a device
#[async_trait]
pub trait Operator: Send + Sync + fmt::Debug {
    /// Unique name, also used to skip registry entries a device was given explicitly
    fn name(&self) -> &str;

    /// Changes that put this plugin's attributes back to their zero or configured values
    fn reset_changes(&self, _event: &Event, _zerod: bool) -> Vec<Change> {
        Vec::new()
    }

    /// Reset this plugin's attributes as one batch caused by `event`
    async fn reset(&self, device: &Arc<Device>, event: &Event, zerod: bool) -> Result<()> {
        let changes = self.reset_changes(event, zerod);
        if !changes.is_empty() {
            device.apply(changes, Some(event.clone())).await?;
        }
        Ok(())
    }

    /// React to an event
    async fn respond(
        &self,
        _device: &Arc<Device>,
        _event: &Event,
    ) -> std::result::Result<(), RespondError> {
        Ok(())
    }

    /// This plugin's contribution to a state message of `kind`
    fn state_for(&self, _device: &Device, _kind: MessageKind) -> Vec<Message> {
        Vec::new()
    }

    /// Place the plugin during `prepare`. Override to opt out of bucketing.
    fn install(&self, plugin: &Plugin, buckets: &mut Buckets) -> Result<()> {
        buckets.insert(plugin.clone())
    }
}

/// Plugin that owns a transport channel
pub trait Io: Operator {
    /// Name of the channel this plugin claims
    fn io_source(&self) -> &str;

    /// Queue, session and filter of the channel
    fn channel(&self) -> &IoChannel;

    /// Service advertised in discovery
    fn service(&self) -> Service;

    /// Hand encoded bytes back to the transport
    fn send(&self, bytes: Bytes, received: &Received) {
        (received.reply)(bytes)
    }
}

/// A plugin and the role it plays
#[derive(Debug, Clone)]
pub enum Plugin {
    /// Reacts to events and owns attributes
    Operator(Arc<dyn Operator>),
    /// Observes events
    Viewer(Arc<dyn Operator>),
    /// Bridges to a transport
    Io(Arc<dyn Io>),
}

impl Plugin {
    /// Name of the wrapped plugin
    pub fn name(&self) -> &str {
        match self {
            Plugin::Operator(p) | Plugin::Viewer(p) => p.name(),
            Plugin::Io(p) => p.name(),
        }
    }

    /// The IO plugin, if this is one
    pub fn as_io(&self) -> Option<&Arc<dyn Io>> {
        match self {
            Plugin::Io(p) => Some(p),
            _ => None,
        }
    }

    pub(crate) fn install(&self, buckets: &mut Buckets) -> Result<()> {
        match self {
            Plugin::Operator(p) | Plugin::Viewer(p) => p.install(self, buckets),
            Plugin::Io(p) => p.install(self, buckets),
        }
    }

    pub(crate) async fn reset(&self, device: &Arc<Device>, event: &Event, zerod: bool) -> Result<()> {
        match self {
            Plugin::Operator(p) | Plugin::Viewer(p) => p.reset(device, event, zerod).await,
            Plugin::Io(p) => p.reset(device, event, zerod).await,
        }
    }

    pub(crate) async fn respond(
        &self,
        device: &Arc<Device>,
        event: &Event,
    ) -> std::result::Result<(), RespondError> {
        match self {
            Plugin::Operator(p) | Plugin::Viewer(p) => p.respond(device, event).await,
            Plugin::Io(p) => p.respond(device, event).await,
        }
    }

    pub(crate) fn state_for(&self, device: &Device, kind: MessageKind) -> Vec<Message> {
        match self {
            Plugin::Operator(p) | Plugin::Viewer(p) => p.state_for(device, kind),
            Plugin::Io(p) => p.state_for(device, kind),
        }
    }
}

/// Plugins of a prepared device, grouped by role in dispatch order
#[derive(Debug, Default)]
pub struct Buckets {
    viewers: Vec<Plugin>,
    io: Vec<Plugin>,
    operators: Vec<Plugin>,
    sources: BTreeMap<String, Arc<dyn Io>>,
}

impl Buckets {
    /// File a plugin under its role. IO plugins also claim their channel.
    pub fn insert(&mut self, plugin: Plugin) -> Result<()> {
        match &plugin {
            Plugin::Viewer(_) => self.viewers.push(plugin),
            Plugin::Operator(_) => self.operators.push(plugin),
            Plugin::Io(io) => {
                let source = io.io_source().to_string();
                if source.is_empty() {
                    return Err(DeviceError::MissingIoSource(io.name().to_string()));
                }
                if self.sources.contains_key(&source) {
                    return Err(DeviceError::invalid_options(
                        io.name(),
                        format!("io source {} is already claimed", source),
                    ));
                }
                self.sources.insert(source, Arc::clone(io));
                self.io.push(plugin);
            }
        }
        Ok(())
    }

    /// Viewers in registration order
    pub fn viewers(&self) -> &[Plugin] {
        &self.viewers
    }

    /// IO plugins in registration order
    pub fn io(&self) -> &[Plugin] {
        &self.io
    }

    /// Operators in registration order
    pub fn operators(&self) -> &[Plugin] {
        &self.operators
    }

    /// IO plugin claiming `source`
    pub fn io_for(&self, source: &str) -> Option<Arc<dyn Io>> {
        self.sources.get(source).cloned()
    }

    /// Every plugin, viewers first, then IO, then operators
    pub fn all(&self) -> impl Iterator<Item = &Plugin> {
        self.viewers.iter().chain(self.io.iter()).chain(self.operators.iter())
    }

    /// Number of plugins
    pub fn len(&self) -> usize {
        self.viewers.len() + self.io.len() + self.operators.len()
    }

    /// Whether there are no plugins
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per device configured values plugins read their options from
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueStore(serde_json::Map<String, serde_json::Value>);

impl ValueStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder style insertion
    pub fn with<K: Into<String>, V: Into<serde_json::Value>>(mut self, key: K, value: V) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Insert a value
    pub fn insert<K: Into<String>, V: Into<serde_json::Value>>(&mut self, key: K, value: V) {
        self.0.insert(key.into(), value.into());
    }

    /// Look up a value
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    /// Deserialize the options of `plugin` from the whole store
    ///
    /// Options structs name the keys they care about and default the rest, so
    /// every plugin reads the same flat store.
    pub fn options<T: DeserializeOwned>(&self, plugin: &str) -> Result<T> {
        serde_json::from_value(serde_json::Value::Object(self.0.clone()))
            .map_err(|e| DeviceError::invalid_options(plugin, e))
    }
}

/// What plugin selection gets to look at
#[derive(Debug, Clone, Copy)]
pub struct PluginContext<'a> {
    /// Device identity
    pub info: &'a DeviceInfo,
    /// Configured values
    pub store: &'a ValueStore,
    /// Process configuration
    pub config: &'a Config,
}

type SetterFn<O> = Box<dyn Fn(&Event, &O) -> Value + Send + Sync>;

/// Declares how one attribute is set during reset
///
/// A fixed setter always yields the same value. A lambda setter computes the
/// value from the reset event and the plugin's options, and can compute a
/// different value for a zerod reset.
pub struct AttrSetter<O> {
    path: Path,
    configured: Option<SetterFn<O>>,
    zerod: Option<SetterFn<O>>,
}

impl<O> AttrSetter<O> {
    /// Always set `value`
    pub fn fixed<P: Into<Path>, V: Into<Value>>(path: P, value: V) -> Self {
        let value = value.into();
        Self {
            path: path.into(),
            configured: Some(Box::new(move |_, _| value.clone())),
            zerod: None,
        }
    }

    /// Compute the value from the event and options
    pub fn lambda<P, F>(path: P, f: F) -> Self
    where
        P: Into<Path>,
        F: Fn(&Event, &O) -> Value + Send + Sync + 'static,
    {
        Self {
            path: path.into(),
            configured: Some(Box::new(f)),
            zerod: None,
        }
    }

    /// Only touch the attribute on a zerod reset
    pub fn zerod_only<P: Into<Path>, V: Into<Value>>(path: P, value: V) -> Self {
        let value = value.into();
        Self {
            path: path.into(),
            configured: None,
            zerod: Some(Box::new(move |_, _| value.clone())),
        }
    }

    /// Use `f` instead on a zerod reset
    pub fn or_zerod<F>(mut self, f: F) -> Self
    where
        F: Fn(&Event, &O) -> Value + Send + Sync + 'static,
    {
        self.zerod = Some(Box::new(f));
        self
    }

    /// The change this setter makes for a reset
    pub fn change(&self, event: &Event, options: &O, zerod: bool) -> Option<Change> {
        let f = if zerod {
            self.zerod.as_ref().or(self.configured.as_ref())
        } else {
            self.configured.as_ref()
        }?;
        Some(self.path.clone().change_to(f(event, options)))
    }

    /// Changes for a list of setters
    pub fn changes(setters: &[AttrSetter<O>], event: &Event, options: &O, zerod: bool) -> Vec<Change> {
        setters
            .iter()
            .filter_map(|s| s.change(event, options, zerod))
            .collect()
    }
}

impl<O> fmt::Debug for AttrSetter<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttrSetter")
            .field("path", &self.path.to_string())
            .field("zerod", &self.zerod.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::event::EventKind;
    use crate::product::Serial;

    #[derive(Debug, Deserialize)]
    struct Options {
        #[serde(default)]
        power: u16,
        #[serde(default = "default_label")]
        label: String,
    }

    fn default_label() -> String {
        "bulb".into()
    }

    fn reset(zerod: bool) -> Event {
        Event::new(Serial::default(), EventKind::Reset { zerod })
    }

    #[test]
    fn test_options_read_from_flat_store() {
        let store = ValueStore::new().with("power", 65535).with("other", true);
        let options: Options = store.options("power").unwrap();
        assert_eq!(options.power, 65535);
        assert_eq!(options.label, "bulb");

        let bad = ValueStore::new().with("power", "on");
        let err = bad.options::<Options>("power").unwrap_err();
        assert!(matches!(err, DeviceError::InvalidOptions { .. }));
    }

    #[test]
    fn test_setters_zerod_and_configured() {
        let options = Options {
            power: 65535,
            label: "kitchen".into(),
        };
        let setters: Vec<AttrSetter<Options>> = vec![
            AttrSetter::lambda("power", |_, o: &Options| Value::from(o.power))
                .or_zerod(|_, _| Value::from(0)),
            AttrSetter::lambda("label", |_, o: &Options| Value::from(o.label.clone())),
            AttrSetter::fixed("group", "default"),
            AttrSetter::zerod_only("history", Vec::<Value>::new()),
        ];

        let configured = AttrSetter::changes(&setters, &reset(false), &options, false);
        assert_eq!(configured.len(), 3);
        assert_eq!(
            configured[0].kind(),
            &crate::attrs::ChangeKind::Replace(Value::from(65535))
        );

        let zerod = AttrSetter::changes(&setters, &reset(true), &options, true);
        assert_eq!(zerod.len(), 4);
        assert_eq!(zerod[0].kind(), &crate::attrs::ChangeKind::Replace(Value::from(0)));
        assert_eq!(
            zerod[1].kind(),
            &crate::attrs::ChangeKind::Replace(Value::from("kitchen"))
        );
    }
}
