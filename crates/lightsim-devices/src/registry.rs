/*!
 * Plugin registry for lightsim.
 *
 * The registry holds plugin factories. When a device is prepared, every
 * factory is asked whether its plugin applies to the device and, if so, for
 * an instance. Registration is append-only.
 */
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

use tracing::{debug, warn};

use crate::error::Result;
use crate::plugin::{Plugin, PluginContext};

/// Decides whether a plugin applies to a device, and builds it if so
pub type SelectFn = Arc<dyn Fn(&PluginContext<'_>) -> Result<Option<Plugin>> + Send + Sync>;

/// A named plugin constructor
#[derive(Clone)]
pub struct PluginFactory {
    name: String,
    select: SelectFn,
}

impl PluginFactory {
    /// Create a factory
    pub fn new<S, F>(name: S, select: F) -> Self
    where
        S: Into<String>,
        F: Fn(&PluginContext<'_>) -> Result<Option<Plugin>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            select: Arc::new(select),
        }
    }

    /// Name of the plugin this factory builds
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Build the plugin for a device, if it applies
    pub fn select(&self, ctx: &PluginContext<'_>) -> Result<Option<Plugin>> {
        (self.select)(ctx)
    }
}

impl fmt::Debug for PluginFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginFactory").field("name", &self.name).finish()
    }
}

/// Append-only collection of plugin factories
#[derive(Debug, Default)]
pub struct PluginRegistry {
    factories: RwLock<Vec<PluginFactory>>,
}

impl PluginRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in plugins
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        crate::operators::register_builtins(&registry);
        crate::viewers::register_builtins(&registry);
        crate::io::register_builtins(&registry);
        registry
    }

    /// Add a factory. A second factory with an existing name is refused.
    pub fn register(&self, factory: PluginFactory) -> bool {
        let mut factories = self.factories.write().unwrap_or_else(|e| e.into_inner());
        if factories.iter().any(|f| f.name == factory.name) {
            warn!("Plugin {} is already registered", factory.name);
            return false;
        }
        debug!("Registered plugin {}", factory.name);
        factories.push(factory);
        true
    }

    /// Names of registered plugins in registration order
    pub fn names(&self) -> Vec<String> {
        let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
        factories.iter().map(|f| f.name.clone()).collect()
    }

    /// Number of registered factories
    pub fn len(&self) -> usize {
        self.factories.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Plugins that apply to a device, skipping names in `supplied`
    pub fn select(&self, ctx: &PluginContext<'_>, supplied: &[&str]) -> Result<Vec<Plugin>> {
        let factories = self
            .factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut plugins = Vec::new();
        for factory in factories.iter() {
            if supplied.contains(&factory.name()) {
                debug!("Plugin {} supplied explicitly for {}", factory.name(), ctx.info.serial);
                continue;
            }
            if let Some(plugin) = factory.select(ctx)? {
                plugins.push(plugin);
            }
        }
        Ok(plugins)
    }
}

/// The process wide registry of built-in plugins
pub fn default_registry() -> Arc<PluginRegistry> {
    static DEFAULT: OnceLock<Arc<PluginRegistry>> = OnceLock::new();
    Arc::clone(DEFAULT.get_or_init(|| Arc::new(PluginRegistry::with_builtins())))
}

#[cfg(test)]
mod tests {
    use lightsim_core::config::Config;

    use super::*;
    use crate::plugin::ValueStore;
    use crate::product::{DeviceInfo, Firmware, Product, Serial};
    use crate::viewers::Recorder;

    fn info(product: Product) -> DeviceInfo {
        DeviceInfo {
            serial: Serial::new([0xd0, 0x73, 0xd5, 0, 0, 1]),
            product,
            firmware: Firmware::new(3, 90, 0),
        }
    }

    #[test]
    fn test_register_is_append_only() {
        let registry = PluginRegistry::new();
        assert!(registry.register(PluginFactory::new("a", |_| Ok(None))));
        assert!(registry.register(PluginFactory::new("b", |_| Ok(None))));
        assert!(!registry.register(PluginFactory::new("a", |_| Ok(None))));
        assert_eq!(registry.names(), vec!["a", "b"]);
    }

    #[test]
    fn test_select_skips_supplied_names() {
        let registry = PluginRegistry::new();
        registry.register(PluginFactory::new("recorder", |_| {
            Ok(Some(Plugin::Viewer(Arc::new(Recorder::new()))))
        }));
        let info = info(Product::LCM3_A19);
        let store = ValueStore::new();
        let config = Config::default();
        let ctx = PluginContext {
            info: &info,
            store: &store,
            config: &config,
        };
        assert_eq!(registry.select(&ctx, &[]).unwrap().len(), 1);
        assert!(registry.select(&ctx, &["recorder"]).unwrap().is_empty());
    }

    #[test]
    fn test_builtins_follow_capabilities() {
        let registry = default_registry();
        let store = ValueStore::new();
        let config = Config::default();

        let names = |product: Product| -> Vec<String> {
            let info = info(product);
            let ctx = PluginContext {
                info: &info,
                store: &store,
                config: &config,
            };
            registry
                .select(&ctx, &[])
                .unwrap()
                .iter()
                .map(|p| p.name().to_string())
                .collect()
        };

        let bulb = names(Product::LCM3_A19);
        assert!(bulb.contains(&"light".to_string()));
        assert!(!bulb.contains(&"multizone".to_string()));
        assert!(names(Product::LCM2_Z).contains(&"multizone".to_string()));
        assert!(names(Product::LCM3_A19_CLEAN).contains(&"clean".to_string()));

        let switch = names(Product::LCM3_32_SWITCH_I);
        assert!(switch.contains(&"relays".to_string()));
        assert!(!switch.contains(&"light".to_string()));
        assert!(switch.contains(&"memory".to_string()));
    }
}
