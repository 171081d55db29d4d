/*!
 * The virtual device.
 *
 * A [`Device`] ties together an identity, an attribute store and the plugins
 * selected for it. It raises events, dispatches them to viewers, IO plugins
 * and operators in that order, and runs the prepare, reset and delete
 * lifecycle.
 */
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, info, trace, warn, Instrument, Level};

use lightsim_core::config::Config;
use lightsim_core::logging::{device_span, operation_span};
use lightsim_core::types::Value;

use crate::attrs::{Attrs, Change, Path};
use crate::error::{DeviceError, RespondError, Result};
use crate::event::{Event, EventKind, EventOptions, EventType};
use crate::plugin::{Buckets, Io, Plugin, PluginContext, ValueStore};
use crate::product::{Capability, DeviceInfo, Firmware, Product, Serial};
use crate::protocol::{Message, MessageKind, Service};
use crate::registry::{default_registry, PluginRegistry};

/// Where a device is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// No plugins yet, or deleted
    Uninitialized,
    /// Plugins selected, never reset
    Prepared,
    /// Reset at least once
    Running,
}

/// How a dispatch ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Every plugin saw the event
    Completed,
    /// The caller's stop predicate ended dispatch
    StoppedEarly,
    /// A plugin asked for dispatch to stop
    Stopped,
}

/// Builder for [`Device`]
#[derive(Debug)]
pub struct DeviceBuilder {
    info: DeviceInfo,
    store: ValueStore,
    config: Config,
    plugins: Vec<Plugin>,
    registry: Option<Arc<PluginRegistry>>,
}

impl DeviceBuilder {
    /// Replace the configured values
    pub fn values(mut self, store: ValueStore) -> Self {
        self.store = store;
        self
    }

    /// Add one configured value
    pub fn value<K: Into<String>, V: Into<serde_json::Value>>(mut self, key: K, value: V) -> Self {
        self.store.insert(key, value);
        self
    }

    /// Use this process configuration
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Supply a plugin explicitly. Registry entries with the same name are skipped.
    pub fn plugin(mut self, plugin: Plugin) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Select plugins from this registry instead of the default one
    pub fn registry(mut self, registry: Arc<PluginRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Create the device
    pub fn build(self) -> Arc<Device> {
        Arc::new(Device {
            info: self.info,
            store: self.store,
            config: self.config,
            explicit: self.plugins,
            registry: self.registry.unwrap_or_else(default_registry),
            attrs: Attrs::new(),
            lifecycle: RwLock::new(Lifecycle::Uninitialized),
            buckets: RwLock::new(None),
            has_power: AtomicBool::new(false),
            shutdown: Mutex::new(None),
            tasks: Mutex::new(JoinSet::new()),
        })
    }
}

/// One simulated device
pub struct Device {
    info: DeviceInfo,
    store: ValueStore,
    config: Config,
    explicit: Vec<Plugin>,
    registry: Arc<PluginRegistry>,
    attrs: Attrs,
    lifecycle: RwLock<Lifecycle>,
    buckets: RwLock<Option<Arc<Buckets>>>,
    has_power: AtomicBool,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<JoinSet<()>>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("serial", &self.info.serial)
            .field("product", &self.info.product.name)
            .field("firmware", &self.info.firmware)
            .field("lifecycle", &self.lifecycle())
            .field("has_power", &self.has_power())
            .finish()
    }
}

impl Device {
    /// Start building a device
    pub fn builder(serial: Serial, product: Product, firmware: Firmware) -> DeviceBuilder {
        DeviceBuilder {
            info: DeviceInfo {
                serial,
                product,
                firmware,
            },
            store: ValueStore::new(),
            config: Config::default(),
            plugins: Vec::new(),
            registry: None,
        }
    }

    /// Hardware identifier
    pub fn serial(&self) -> Serial {
        self.info.serial
    }

    /// Identity of the device
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Capability flags for the product on this firmware
    pub fn capability(&self) -> Capability {
        self.info.capability()
    }

    /// Configured values
    pub fn values(&self) -> &ValueStore {
        &self.store
    }

    /// Process configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Attribute store, read only
    pub fn attrs(&self) -> &Attrs {
        &self.attrs
    }

    /// Whether the device is powered
    pub fn has_power(&self) -> bool {
        self.has_power.load(Ordering::SeqCst)
    }

    /// Lifecycle state
    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_lifecycle(&self, lifecycle: Lifecycle) {
        *self.lifecycle.write().unwrap_or_else(|e| e.into_inner()) = lifecycle;
    }

    /// Whether plugins have been selected
    pub fn is_prepared(&self) -> bool {
        self.buckets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn buckets(&self) -> Result<Arc<Buckets>> {
        self.buckets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| DeviceError::NotPrepared(self.info.serial.to_string()))
    }

    /// Select and install plugins. Does nothing if already prepared.
    pub fn prepare(&self) -> Result<()> {
        let mut slot = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Ok(());
        }

        let ctx = PluginContext {
            info: &self.info,
            store: &self.store,
            config: &self.config,
        };
        let supplied: Vec<&str> = self.explicit.iter().map(|p| p.name()).collect();
        let mut plugins = self.explicit.clone();
        plugins.extend(self.registry.select(&ctx, &supplied)?);

        let mut buckets = Buckets::default();
        for plugin in plugins.iter() {
            plugin.install(&mut buckets)?;
        }
        info!(
            "Prepared {} ({}) with {} viewers, {} io, {} operators",
            self.info.serial,
            self.info.product.name,
            buckets.viewers().len(),
            buckets.io().len(),
            buckets.operators().len()
        );

        *slot = Some(Arc::new(buckets));
        drop(slot);
        self.set_lifecycle(Lifecycle::Prepared);
        Ok(())
    }

    /// Raise an event and dispatch it to every plugin
    pub fn event(self: &Arc<Self>, kind: EventKind) -> BoxFuture<'static, Result<Event>> {
        self.event_with_options(kind, EventOptions::default())
    }

    /// Raise an event with control over who sees it
    pub fn event_with_options(
        self: &Arc<Self>,
        kind: EventKind,
        options: EventOptions,
    ) -> BoxFuture<'static, Result<Event>> {
        let device = Arc::clone(self);
        async move {
            let event = Event::new(device.serial(), kind);
            device.dispatch(&event, &options).await?;
            Ok(event)
        }
        .boxed()
    }

    /// Dispatch an existing event: viewers, then IO plugins, then operators
    pub async fn dispatch(self: &Arc<Self>, event: &Event, options: &EventOptions) -> Result<Dispatch> {
        let buckets = self.buckets()?;
        trace!("Dispatching {}", event);

        let groups: [(&[Plugin], bool); 3] = [
            (buckets.viewers(), options.visible),
            (buckets.io(), !options.viewers_only),
            (buckets.operators(), !options.viewers_only),
        ];

        for (plugins, enabled) in groups {
            if !enabled {
                continue;
            }
            for plugin in plugins {
                match plugin.respond(self, event).await {
                    Ok(()) => {}
                    Err(RespondError::Stop) => {
                        debug!("{} stopped dispatch of {}", plugin.name(), event);
                        return Ok(Dispatch::Stopped);
                    }
                    Err(RespondError::Failed(err)) => {
                        let message = format!("{} failed on {}: {:#}", plugin.name(), event, err);
                        warn!("{}", message);
                        if !event.matches(EventType::Annotation) {
                            self.event(EventKind::Annotation {
                                level: Level::ERROR,
                                message,
                            })
                            .await?;
                        }
                    }
                }
                if let Some(stop) = &options.stop_when {
                    if stop(event) {
                        return Ok(Dispatch::StoppedEarly);
                    }
                }
            }
        }
        Ok(Dispatch::Completed)
    }

    /// Apply changes and announce them as one ATTRIBUTE_CHANGE event
    ///
    /// Viewers do not see the event until the store has started.
    pub async fn apply(self: &Arc<Self>, changes: Vec<Change>, because: Option<Event>) -> Result<Event> {
        self.buckets()?;
        let mut changes = changes;
        let started = self.attrs.apply(&mut changes);
        for change in changes.iter().filter(|c| !c.success()) {
            debug!("{} {}", self.info.serial, change);
        }
        let options = if started {
            EventOptions::default()
        } else {
            EventOptions::invisible()
        };
        self.event_with_options(
            EventKind::AttributeChange {
                changes,
                attrs_started: started,
                because: because.map(Box::new),
            },
            options,
        )
        .await
    }

    /// Set values at paths, for collaborators driving state without the protocol
    pub async fn change<I, P, V>(self: &Arc<Self>, values: I, because: Option<Event>) -> Result<Event>
    where
        I: IntoIterator<Item = (P, V)>,
        P: Into<Path>,
        V: Into<Value>,
    {
        let changes = values
            .into_iter()
            .map(|(path, value)| path.into().change_to(value))
            .collect();
        self.apply(changes, because).await
    }

    /// Power off, reset every plugin, then power on again
    ///
    /// With `zerod` attributes go to zero values, otherwise to configured ones.
    pub async fn reset(self: &Arc<Self>, zerod: bool) -> Result<()> {
        let span = device_span(&self.info.serial.to_string(), self.info.product.name);
        async {
            self.prepare()?;
            info!("Resetting (zerod={})", zerod);

            self.attrs.set_started(false);
            self.power_off().await?;

            let buckets = self.buckets()?;
            let event = self.event(EventKind::Reset { zerod }).await?;
            for plugin in buckets.all() {
                plugin
                    .reset(self, &event, zerod)
                    .instrument(operation_span("reset", plugin.name()))
                    .await?;
            }

            self.attrs.set_started(true);
            self.set_lifecycle(Lifecycle::Running);
            self.power_on().await
        }
        .instrument(span)
        .await
    }

    /// Give the device power
    pub async fn power_on(self: &Arc<Self>) -> Result<()> {
        self.has_power.store(true, Ordering::SeqCst);
        self.event(EventKind::PowerOn).await?;
        Ok(())
    }

    /// Take power away
    pub async fn power_off(self: &Arc<Self>) -> Result<()> {
        self.event(EventKind::ShuttingDown).await?;
        self.event(EventKind::PowerOff).await?;
        self.has_power.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Run `block` with the device powered off, then power it back on
    ///
    /// Power is restored before this returns, whether `block` succeeds, fails
    /// or panics. An error from `block` wins over one from powering on.
    pub async fn offline<F, Fut, T, E>(self: &Arc<Self>, block: F) -> std::result::Result<T, E>
    where
        F: FnOnce(Arc<Device>) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<DeviceError>,
    {
        self.power_off().await?;
        let outcome = AssertUnwindSafe(block(Arc::clone(self)))
            .catch_unwind()
            .await;
        let restored = self.power_on().await;
        match outcome {
            Ok(Ok(value)) => {
                restored?;
                Ok(value)
            }
            Ok(Err(e)) => {
                if let Err(restore) = restored {
                    warn!("Failed to restore power after offline block: {}", restore);
                }
                Err(e)
            }
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Announce deletion, stop sessions and drop every plugin
    ///
    /// Calling this on a device that is not prepared does nothing.
    pub async fn delete(self: &Arc<Self>) -> Result<()> {
        if !self.is_prepared() {
            return Ok(());
        }
        self.event(EventKind::Delete).await?;
        self.finish_session().await?;

        self.signal_shutdown();
        self.abort_tasks();

        *self.buckets.write().unwrap_or_else(|e| e.into_inner()) = None;
        self.attrs.clear();
        self.has_power.store(false, Ordering::SeqCst);
        self.set_lifecycle(Lifecycle::Uninitialized);
        info!("Deleted {}", self.info.serial);
        Ok(())
    }

    /// Ask plugins whether the device answers a discovery probe
    pub async fn discoverable(self: &Arc<Self>, service: Service, address: String) -> Result<bool> {
        if !self.has_power() {
            return Ok(false);
        }
        let event = Event::new(self.serial(), EventKind::Discoverable { service, address });
        Ok(self.dispatch(&event, &EventOptions::default()).await? != Dispatch::Stopped)
    }

    /// Every plugin's contribution to a state message of `kind`
    ///
    /// With `expect_any` an empty result is an error.
    pub fn states_for(&self, kind: MessageKind, expect_any: bool) -> Result<Vec<Message>> {
        let buckets = self.buckets()?;
        let states: Vec<Message> = buckets.all().flat_map(|p| p.state_for(self, kind)).collect();
        if expect_any && states.is_empty() {
            return Err(DeviceError::NoStates { kind });
        }
        Ok(states)
    }

    /// The single state message of `kind`
    pub fn state_for(&self, kind: MessageKind) -> Result<Message> {
        let mut states = self.states_for(kind, false)?;
        if states.len() != 1 {
            return Err(DeviceError::ExpectedOneState {
                kind,
                got: states.len(),
            });
        }
        Ok(states.remove(0))
    }

    /// The IO plugin claiming `source`
    pub fn io(&self, source: &str) -> Result<Arc<dyn Io>> {
        self.buckets()?
            .io_for(source)
            .ok_or_else(|| DeviceError::UnknownIo(source.to_string()))
    }

    /// Start a receive session on every IO channel
    pub fn start_session(self: &Arc<Self>) -> Result<()> {
        let buckets = self.buckets()?;
        let shutdown = self
            .shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_or_insert_with(|| watch::channel(false).0)
            .subscribe();
        for io in buckets.io().iter().filter_map(Plugin::as_io) {
            io.channel().start_session(self, Arc::clone(io), shutdown.clone())?;
        }
        Ok(())
    }

    /// Finish the session of every IO channel
    pub async fn finish_session(self: &Arc<Self>) -> Result<()> {
        let buckets = self.buckets()?;
        for io in buckets.io().iter().filter_map(Plugin::as_io) {
            io.channel().finish_session(self).await?;
        }
        Ok(())
    }

    /// Tell every session consumer to stop
    ///
    /// The next `start_session` creates a fresh signal.
    pub(crate) fn signal_shutdown(&self) {
        if let Some(shutdown) = self.shutdown.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = shutdown.send(true);
        }
    }

    /// Cancel everything in the device's task group
    pub(crate) fn abort_tasks(&self) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .abort_all();
    }

    /// Run a task in the device's task group, logging how it ends
    pub fn spawn_task<F>(&self, name: impl Into<String>, fut: F) -> AbortHandle
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            match fut.await {
                Ok(()) => debug!("Task '{}' completed successfully", name),
                Err(e) => warn!("Task '{}' failed: {}", name, e),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::io::{IoChannel, MemoryIo};
    use crate::plugin::Operator;
    use crate::protocol::JsonCodec;
    use crate::viewers::Recorder;

    fn serial() -> Serial {
        "d073d5000001".parse().unwrap()
    }

    #[derive(Debug)]
    struct Logged {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        fail_on: Option<EventType>,
    }

    #[async_trait]
    impl Operator for Logged {
        fn name(&self) -> &str {
            &self.name
        }

        async fn respond(
            &self,
            _device: &Arc<Device>,
            event: &Event,
        ) -> std::result::Result<(), RespondError> {
            if event.matches(EventType::Annotation) {
                return Ok(());
            }
            self.log.lock().unwrap().push(self.name.clone());
            if self.fail_on == Some(event.event_type()) {
                return Err(anyhow::anyhow!("{} broke", self.name).into());
            }
            Ok(())
        }
    }

    #[derive(Debug)]
    struct LoggedIo {
        inner: Logged,
        channel: IoChannel,
    }

    #[async_trait]
    impl Operator for LoggedIo {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn respond(
            &self,
            device: &Arc<Device>,
            event: &Event,
        ) -> std::result::Result<(), RespondError> {
            self.inner.respond(device, event).await
        }
    }

    impl Io for LoggedIo {
        fn io_source(&self) -> &str {
            self.channel.source()
        }

        fn channel(&self) -> &IoChannel {
            &self.channel
        }

        fn service(&self) -> Service {
            Service::Memory
        }
    }

    fn logged(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Logged> {
        Arc::new(Logged {
            name: name.into(),
            log: Arc::clone(log),
            fail_on: None,
        })
    }

    fn logged_io(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Plugin {
        Plugin::Io(Arc::new(LoggedIo {
            inner: Logged {
                name: name.into(),
                log: Arc::clone(log),
                fail_on: None,
            },
            channel: IoChannel::new(name, Arc::new(JsonCodec), &Default::default()),
        }))
    }

    fn bare(plugins: Vec<Plugin>) -> Arc<Device> {
        let mut builder = Device::builder(serial(), Product::LCM3_A19, Firmware::new(3, 90, 0))
            .registry(Arc::new(PluginRegistry::new()));
        for plugin in plugins {
            builder = builder.plugin(plugin);
        }
        builder.build()
    }

    fn ordered(log: &Arc<Mutex<Vec<String>>>) -> (Vec<Plugin>, Vec<&'static str>) {
        let plugins = vec![
            Plugin::Operator(logged("o1", log)),
            logged_io("io1", log),
            Plugin::Viewer(logged("v1", log)),
            Plugin::Operator(logged("o2", log)),
            Plugin::Viewer(logged("v2", log)),
            logged_io("io2", log),
            Plugin::Operator(logged("o3", log)),
        ];
        (plugins, vec!["v1", "v2", "io1", "io2", "o1", "o2", "o3"])
    }

    #[tokio::test]
    async fn test_dispatch_order_viewers_io_operators() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (plugins, expected) = ordered(&log);
        let device = bare(plugins);
        device.prepare().unwrap();

        device.event(EventKind::PowerOn).await.unwrap();
        assert_eq!(*log.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_stop_when_ends_dispatch_immediately() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (plugins, expected) = ordered(&log);
        let device = bare(plugins);
        device.prepare().unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let options = EventOptions::default()
            .stop_when(move |_| counted.fetch_add(1, Ordering::SeqCst) + 1 == 4);
        device
            .event_with_options(EventKind::PowerOn, options)
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), expected[..4].to_vec());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_visibility_options() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (plugins, _) = ordered(&log);
        let device = bare(plugins);
        device.prepare().unwrap();

        device
            .event_with_options(EventKind::PowerOn, EventOptions::invisible())
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["io1", "io2", "o1", "o2", "o3"]);

        log.lock().unwrap().clear();
        device
            .event_with_options(EventKind::PowerOn, EventOptions::viewers_only())
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["v1", "v2"]);
    }

    #[test_log::test(tokio::test)]
    async fn test_failure_becomes_annotation_and_dispatch_continues() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::new(Recorder::new());
        let device = bare(vec![
            Plugin::Viewer(recorder.clone()),
            Plugin::Operator(Arc::new(Logged {
                name: "broken".into(),
                log: Arc::clone(&log),
                fail_on: Some(EventType::PowerOn),
            })),
            Plugin::Operator(logged("after", &log)),
        ]);
        device.prepare().unwrap();

        device.event(EventKind::PowerOn).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["broken", "after"]);

        let annotations = recorder.events_of(EventType::Annotation);
        assert_eq!(annotations.len(), 1);
        match &annotations[0].kind {
            EventKind::Annotation { level, message } => {
                assert_eq!(*level, Level::ERROR);
                assert!(message.contains("broken broke"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[derive(Debug)]
    struct Stopper;

    #[async_trait]
    impl Operator for Stopper {
        fn name(&self) -> &str {
            "stopper"
        }

        async fn respond(
            &self,
            _device: &Arc<Device>,
            _event: &Event,
        ) -> std::result::Result<(), RespondError> {
            Err(RespondError::Stop)
        }
    }

    #[tokio::test]
    async fn test_stop_signal_aborts_dispatch() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let device = bare(vec![
            Plugin::Operator(logged("before", &log)),
            Plugin::Operator(Arc::new(Stopper)),
            Plugin::Operator(logged("after", &log)),
        ]);
        device.prepare().unwrap();

        let event = Event::new(serial(), EventKind::PowerOn);
        let outcome = device.dispatch(&event, &EventOptions::default()).await.unwrap();
        assert_eq!(outcome, Dispatch::Stopped);
        assert_eq!(*log.lock().unwrap(), vec!["before"]);
    }

    #[tokio::test]
    async fn test_prepare_is_idempotent_and_explicit_plugins_win() {
        let recorder = Arc::new(Recorder::new());
        let device = Device::builder(serial(), Product::LCM3_A19, Firmware::new(3, 90, 0))
            .plugin(Plugin::Viewer(recorder.clone()))
            .plugin(Plugin::Io(Arc::new(MemoryIo::new(&Default::default()))))
            .build();
        assert_eq!(device.lifecycle(), Lifecycle::Uninitialized);
        assert!(matches!(
            device.event(EventKind::PowerOn).await,
            Err(DeviceError::NotPrepared(_))
        ));

        tokio_test::assert_ok!(device.prepare());
        tokio_test::assert_ok!(device.prepare());
        assert_eq!(device.lifecycle(), Lifecycle::Prepared);

        let buckets = device.buckets().unwrap();
        assert_eq!(buckets.io().len(), 1);
        assert!(buckets.operators().iter().any(|p| p.name() == "power"));
        assert!(device.io(MemoryIo::SOURCE).is_ok());
        assert!(matches!(device.io("udp"), Err(DeviceError::UnknownIo(_))));
    }

    #[tokio::test]
    async fn test_io_plugin_needs_a_source() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let device = bare(vec![logged_io("", &log)]);
        assert!(matches!(device.prepare(), Err(DeviceError::MissingIoSource(_))));
    }

    fn bulb(recorder: &Arc<Recorder>) -> Arc<Device> {
        Device::builder(serial(), Product::LCM3_A19, Firmware::new(3, 90, 0))
            .value("power", 65535)
            .value("label", "kitchen")
            .plugin(Plugin::Viewer(recorder.clone()))
            .build()
    }

    #[test_log::test(tokio::test)]
    async fn test_reset_sequence_hides_attribute_changes_from_viewers() {
        let recorder = Arc::new(Recorder::new());
        let device = bulb(&recorder);
        device.reset(false).await.unwrap();

        assert_eq!(
            recorder.types(),
            vec![
                EventType::ShuttingDown,
                EventType::PowerOff,
                EventType::Reset,
                EventType::PowerOn,
            ]
        );
        assert!(device.has_power());
        assert!(device.attrs().started());
        assert_eq!(device.lifecycle(), Lifecycle::Running);

        device
            .change([("label", Value::from("hall"))], None)
            .await
            .unwrap();
        let changes = recorder.events_of(EventType::AttributeChange);
        assert_eq!(changes.len(), 1);
        match &changes[0].kind {
            EventKind::AttributeChange {
                changes,
                attrs_started,
                because,
            } => {
                assert!(*attrs_started);
                assert!(because.is_none());
                assert_eq!(changes.len(), 1);
                assert!(changes[0].success());
                assert_eq!(changes[0].before(), Some(&Value::from("kitchen")));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_zerod_then_configured_reset() {
        let recorder = Arc::new(Recorder::new());
        let device = bulb(&recorder);

        device.reset(true).await.unwrap();
        assert_eq!(device.attrs().int("power"), Some(0));
        assert_eq!(device.attrs().string("label").as_deref(), Some(""));
        let first = device.attrs().snapshot();

        device.reset(true).await.unwrap();
        assert_eq!(device.attrs().snapshot(), first);

        device.reset(false).await.unwrap();
        assert_eq!(device.attrs().int("power"), Some(65535));
        assert_eq!(device.attrs().string("label").as_deref(), Some("kitchen"));
        assert_eq!(
            device.state_for(MessageKind::StateLabel).unwrap(),
            Message::StateLabel {
                label: "kitchen".into()
            }
        );
    }

    #[tokio::test]
    async fn test_state_for_cardinality() {
        let recorder = Arc::new(Recorder::new());
        let device = bulb(&recorder);
        device.reset(false).await.unwrap();

        assert!(matches!(
            device.state_for(MessageKind::StateRPower),
            Err(DeviceError::ExpectedOneState { got: 0, .. })
        ));
        assert!(matches!(
            device.states_for(MessageKind::StateRPower, true),
            Err(DeviceError::NoStates { .. })
        ));
        assert!(device
            .states_for(MessageKind::StateRPower, false)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_offline_restores_power_when_block_succeeds() {
        let recorder = Arc::new(Recorder::new());
        let device = bulb(&recorder);
        device.reset(false).await.unwrap();
        recorder.clear();

        let label = device
            .offline(|d| async move {
                assert!(!d.has_power());
                Ok::<_, DeviceError>(d.attrs().string("label"))
            })
            .await
            .unwrap();
        assert!(device.has_power());
        assert_eq!(label, device.attrs().string("label"));
        let power: Vec<EventType> = recorder
            .types()
            .into_iter()
            .filter(|t| {
                matches!(
                    t,
                    EventType::ShuttingDown | EventType::PowerOff | EventType::PowerOn
                )
            })
            .collect();
        assert_eq!(
            power,
            vec![EventType::ShuttingDown, EventType::PowerOff, EventType::PowerOn]
        );
    }

    #[tokio::test]
    async fn test_offline_restores_power_when_block_fails() {
        let recorder = Arc::new(Recorder::new());
        let device = bulb(&recorder);
        device.reset(false).await.unwrap();
        recorder.clear();

        let err = device
            .offline(|_| async { Err::<(), _>(anyhow::anyhow!("guarded block failed")) })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "guarded block failed");
        assert!(device.has_power());
        assert!(recorder.types().contains(&EventType::PowerOn));
    }

    #[tokio::test]
    async fn test_offline_restores_power_when_block_panics() {
        let recorder = Arc::new(Recorder::new());
        let device = bulb(&recorder);
        device.reset(false).await.unwrap();

        let inner = Arc::clone(&device);
        let joined = tokio::spawn(async move {
            inner
                .offline(|_| async {
                    if true {
                        panic!("guarded block panicked");
                    }
                    Ok::<(), DeviceError>(())
                })
                .await
        })
        .await;
        assert!(joined.unwrap_err().is_panic());
        assert!(device.has_power());
    }

    #[tokio::test]
    async fn test_delete_is_repeatable() {
        let recorder = Arc::new(Recorder::new());
        let device = bulb(&recorder);
        device.reset(false).await.unwrap();
        device.start_session().unwrap();

        device.delete().await.unwrap();
        assert!(recorder.types().contains(&EventType::Delete));
        assert_eq!(device.lifecycle(), Lifecycle::Uninitialized);
        assert!(!device.is_prepared());
        assert!(device.attrs().names().is_empty());

        device.delete().await.unwrap();
        device.reset(false).await.unwrap();
        assert_eq!(device.attrs().int("power"), Some(65535));
    }
}
