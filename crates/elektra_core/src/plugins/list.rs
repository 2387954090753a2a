//! The list plugin.
//!
//! Hosts an ordered set of named sub-plugins and fans every invocation out
//! to them. The session mounts one list instance into all ten cross-cutting
//! global positions; contracts mount their global plugins into it through
//! [`ListPlugin::mount_plugin`] and [`ListPlugin::unmount_plugin`], reached
//! via downcast.

use crate::error::KdbResult;
use crate::key::Key;
use crate::keyset::KeySet;
use crate::plugin::{Capabilities, PhaseContext, Plugin, PluginHandle, PluginResult, PluginStatus};
use crate::registry::ModuleRegistry;
use std::sync::Arc;

struct ListEntry {
    name: String,
    plugin: PluginHandle,
}

/// The global plugin host.
pub struct ListPlugin {
    registry: Arc<ModuleRegistry>,
    entries: Vec<ListEntry>,
}

impl ListPlugin {
    /// Creates a list plugin resolving sub-plugin names through a module
    /// registry.
    #[must_use]
    pub fn new(registry: Arc<ModuleRegistry>) -> Self {
        Self {
            registry,
            entries: Vec::new(),
        }
    }

    /// Opens a plugin by name and appends it to the list, replacing any
    /// previously mounted plugin of the same name.
    ///
    /// # Errors
    ///
    /// Returns an installation error if the plugin cannot be loaded.
    pub fn mount_plugin(
        &mut self,
        name: &str,
        config: &KeySet,
        error_key: &mut Key,
    ) -> KdbResult<()> {
        self.unmount_plugin(name, error_key)?;
        let plugin = self.registry.open_plugin(name, config, error_key)?;
        self.entries.push(ListEntry {
            name: name.to_string(),
            plugin,
        });
        Ok(())
    }

    /// Closes and removes a mounted plugin. Removing an absent plugin is
    /// not an error.
    ///
    /// # Errors
    ///
    /// Returns the plugin's own error if its `close` fails.
    pub fn unmount_plugin(&mut self, name: &str, error_key: &mut Key) -> KdbResult<()> {
        if let Some(index) = self.entries.iter().position(|e| e.name == name) {
            let entry = self.entries.remove(index);
            let mut plugin = entry.plugin.lock();
            if plugin.capabilities().close {
                plugin.close(error_key)?;
            }
        }
        Ok(())
    }

    /// Returns the names of the mounted plugins, in order.
    #[must_use]
    pub fn mounted(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }
}

impl Plugin for ListPlugin {
    fn name(&self) -> &str {
        "list"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::none()
            .with_get()
            .with_set()
            .with_commit()
            .with_error()
            .with_close()
    }

    fn get(&mut self, ks: &mut KeySet, parent: &mut Key, ctx: &PhaseContext<'_>) -> PluginResult {
        for entry in &self.entries {
            let mut plugin = entry.plugin.lock();
            if plugin.capabilities().get {
                plugin.get(ks, parent, ctx)?;
            }
        }
        Ok(PluginStatus::Success)
    }

    fn set(&mut self, ks: &mut KeySet, parent: &mut Key, ctx: &PhaseContext<'_>) -> PluginResult {
        for entry in &self.entries {
            let mut plugin = entry.plugin.lock();
            if plugin.capabilities().set {
                plugin.set(ks, parent, ctx)?;
            }
        }
        Ok(PluginStatus::Success)
    }

    fn commit(&mut self, ks: &mut KeySet, parent: &mut Key, ctx: &PhaseContext<'_>) -> PluginResult {
        for entry in &self.entries {
            let mut plugin = entry.plugin.lock();
            if plugin.capabilities().commit {
                plugin.commit(ks, parent, ctx)?;
            }
        }
        Ok(PluginStatus::Success)
    }

    fn error(&mut self, ks: &mut KeySet, parent: &mut Key, ctx: &PhaseContext<'_>) -> PluginResult {
        for entry in &self.entries {
            let mut plugin = entry.plugin.lock();
            if plugin.capabilities().error {
                plugin.error(ks, parent, ctx)?;
            }
        }
        Ok(PluginStatus::Success)
    }

    fn close(&mut self, error_key: &mut Key) -> PluginResult {
        for entry in self.entries.drain(..) {
            let mut plugin = entry.plugin.lock();
            if plugin.capabilities().close {
                plugin.close(error_key)?;
            }
        }
        Ok(PluginStatus::Success)
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl std::fmt::Debug for ListPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListPlugin")
            .field("mounted", &self.mounted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn list() -> ListPlugin {
        ListPlugin::new(Arc::new(ModuleRegistry::with_builtins(&Config::default())))
    }

    #[test]
    fn mount_and_unmount() {
        let mut list = list();
        let mut error_key = Key::parse("/").unwrap();

        list.mount_plugin("storage", &KeySet::new(), &mut error_key)
            .unwrap();
        assert_eq!(list.mounted(), ["storage"]);

        list.unmount_plugin("storage", &mut error_key).unwrap();
        assert!(list.mounted().is_empty());
    }

    #[test]
    fn mounting_twice_replaces() {
        let mut list = list();
        let mut error_key = Key::parse("/").unwrap();

        list.mount_plugin("storage", &KeySet::new(), &mut error_key)
            .unwrap();
        list.mount_plugin("storage", &KeySet::new(), &mut error_key)
            .unwrap();
        assert_eq!(list.mounted(), ["storage"]);
    }

    #[test]
    fn mounting_unknown_plugin_fails() {
        let mut list = list();
        let mut error_key = Key::parse("/").unwrap();
        assert!(list
            .mount_plugin("nosuch", &KeySet::new(), &mut error_key)
            .is_err());
    }
}
