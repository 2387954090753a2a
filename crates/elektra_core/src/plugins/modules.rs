//! The modules plugin.
//!
//! Serves the read-only introspection keys below
//! `system:/elektra/modules/<name>` for one registered module. The session
//! builds the introspection key set from the module's capabilities and
//! hands it over at construction; `init` marks the backend read-only.

use crate::key::name::KeyName;
use crate::key::Key;
use crate::keyset::KeySet;
use crate::plugin::{Capabilities, Phase, PhaseContext, Plugin, PluginResult, PluginStatus};

/// Builds the introspection key set for a module.
#[must_use]
pub fn module_info(root: &KeyName, module: &str, capabilities: Capabilities) -> KeySet {
    let mut info = KeySet::new();
    let mut root_key = Key::new(root.clone());
    root_key = root_key.with_string(format!("{module} plugin waits for your orders"));
    info.append(root_key);

    let exports = root.child("exports");
    info.append(Key::new(exports.clone()));
    let entries = [
        ("open", capabilities.open),
        ("close", capabilities.close),
        ("init", capabilities.init),
        ("get", capabilities.get),
        ("set", capabilities.set),
        ("commit", capabilities.commit),
        ("error", capabilities.error),
    ];
    for (entry, provided) in entries {
        if provided {
            info.append(Key::new(exports.child(entry)).with_string("1"));
        }
    }

    info.append(
        Key::new(root.child("infos").child("version"))
            .with_string(env!("CARGO_PKG_VERSION")),
    );

    info.clear_sync_flags();
    info
}

/// The introspection backend for one module.
#[derive(Debug)]
pub struct ModulesPlugin {
    info: KeySet,
}

impl ModulesPlugin {
    /// Creates an introspection backend serving a prebuilt key set.
    #[must_use]
    pub fn new(info: KeySet) -> Self {
        Self { info }
    }
}

impl Plugin for ModulesPlugin {
    fn name(&self) -> &str {
        "modules"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::none().with_init().with_get()
    }

    fn init(&mut self, _definition: &KeySet, _parent: &mut Key, _ctx: &PhaseContext<'_>) -> PluginResult {
        // introspection mountpoints are always read-only
        Ok(PluginStatus::NoUpdate)
    }

    fn get(&mut self, ks: &mut KeySet, _parent: &mut Key, ctx: &PhaseContext<'_>) -> PluginResult {
        match ctx.phase {
            Phase::Resolver => Ok(PluginStatus::Success),
            Phase::Storage => {
                ks.append_all(&self.info);
                ks.set_needs_sync(false);
                Ok(PluginStatus::Success)
            }
            _ => Ok(PluginStatus::NoUpdate),
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
