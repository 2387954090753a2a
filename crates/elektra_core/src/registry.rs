//! The module registry.
//!
//! Maps symbolic plugin names to factories producing fresh plugin
//! instances. Every session owns its own registry; the registry is not a
//! process-wide singleton. The built-in modules are registered at
//! construction; embedders and tests may register additional factories
//! before the session is opened.

use crate::config::Config;
use crate::error::{KdbError, KdbResult};
use crate::key::Key;
use crate::keyset::KeySet;
use crate::plugin::{plugin_handle, Plugin, PluginHandle};
use crate::plugins::resolver::FileResolver;
use crate::plugins::storage::StoragePlugin;
use crate::plugins::version::VersionPlugin;
use crate::plugins::BackendPlugin;
use std::collections::BTreeMap;

/// Produces a fresh, unopened plugin instance.
pub type PluginFactory = Box<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

/// A per-session map from plugin names to factories.
pub struct ModuleRegistry {
    factories: BTreeMap<String, PluginFactory>,
}

impl ModuleRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Creates a registry with the statically linked built-in modules.
    ///
    /// The bootstrap subsystem relies on exactly these entries; they are
    /// available even when the mount configuration is broken.
    #[must_use]
    pub fn with_builtins(config: &Config) -> Self {
        let mut registry = Self::new();

        registry.register("backend", || Box::new(BackendPlugin::new()));

        let resolver_config = config.clone();
        registry.register("resolver", move || {
            Box::new(FileResolver::new(&resolver_config))
        });

        registry.register("storage", || Box::new(StoragePlugin::new()));
        registry.register("version", || Box::new(VersionPlugin::new()));

        registry
    }

    /// Registers a factory under a symbolic name, replacing any previous
    /// entry.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// Returns true if a module with this name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Iterates over the registered module names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Creates a plugin instance without opening it.
    ///
    /// # Errors
    ///
    /// Returns an installation error if the name is not registered.
    pub fn instantiate(&self, name: &str) -> KdbResult<Box<dyn Plugin>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            KdbError::installation(format!("no plugin named '{name}' is registered"))
        })?;
        Ok(factory())
    }

    /// Creates and opens a plugin instance.
    ///
    /// # Errors
    ///
    /// Returns an installation error if the name is not registered, or the
    /// plugin's own error if its `open` fails.
    pub fn open_plugin(
        &self,
        name: &str,
        config: &KeySet,
        error_key: &mut Key,
    ) -> KdbResult<PluginHandle> {
        let mut plugin = self.instantiate(name)?;
        plugin.open(config, error_key)?;
        Ok(plugin_handle(plugin))
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
