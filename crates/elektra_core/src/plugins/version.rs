//! The version plugin.
//!
//! Serves the read-only keys below `system:/elektra/version`. The keys are
//! marked with `restrict/write` and `restrict/remove` metadata so
//! validation layers can reject attempts to shadow them.

use crate::key::Key;
use crate::keyset::KeySet;
use crate::plugin::{Capabilities, Phase, PhaseContext, Plugin, PluginResult, PluginStatus};

/// The version information backend.
#[derive(Debug, Default)]
pub struct VersionPlugin;

impl VersionPlugin {
    /// Creates a version plugin instance.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Plugin for VersionPlugin {
    fn name(&self) -> &str {
        "version"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::none().with_init().with_get()
    }

    fn init(&mut self, _definition: &KeySet, _parent: &mut Key, _ctx: &PhaseContext<'_>) -> PluginResult {
        Ok(PluginStatus::NoUpdate)
    }

    fn get(&mut self, ks: &mut KeySet, parent: &mut Key, ctx: &PhaseContext<'_>) -> PluginResult {
        match ctx.phase {
            Phase::Resolver => Ok(PluginStatus::Success),
            Phase::Storage => {
                let root = parent.name().clone();
                let constants = root.child("constants");
                let entries = [
                    (root.clone(), "version information below".to_string()),
                    (constants.clone(), String::new()),
                    (
                        constants.child("KDB_VERSION"),
                        env!("CARGO_PKG_VERSION").to_string(),
                    ),
                    (
                        constants.child("KDB_VERSION_MAJOR"),
                        env!("CARGO_PKG_VERSION_MAJOR").to_string(),
                    ),
                    (
                        constants.child("KDB_VERSION_MINOR"),
                        env!("CARGO_PKG_VERSION_MINOR").to_string(),
                    ),
                    (
                        constants.child("KDB_VERSION_PATCH"),
                        env!("CARGO_PKG_VERSION_PATCH").to_string(),
                    ),
                ];
                for (name, value) in entries {
                    let key = Key::new(name)
                        .with_string(value)
                        .with_meta("meta:/restrict/write", "1")
                        .with_meta("meta:/restrict/remove", "1");
                    ks.append(key);
                }
                ks.clear_sync_flags();
                Ok(PluginStatus::Success)
            }
            _ => Ok(PluginStatus::NoUpdate),
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::name::KeyName;

    #[test]
    fn storage_phase_serves_version_keys() {
        let mut plugin = VersionPlugin::new();
        let global = std::sync::Arc::new(parking_lot::Mutex::new(KeySet::new()));
        let ctx = PhaseContext::new(Phase::Storage, &global, None);

        let mut ks = KeySet::new();
        let mut parent = Key::parse("system:/elektra/version").unwrap();
        plugin.get(&mut ks, &mut parent, &ctx).unwrap();

        let name = KeyName::parse("system:/elektra/version/constants/KDB_VERSION").unwrap();
        let key = ks.lookup(&name).unwrap();
        assert_eq!(key.as_string(), Some(env!("CARGO_PKG_VERSION")));
        assert_eq!(key.meta("meta:/restrict/write"), Some("1"));
    }

    #[test]
    fn other_phases_report_no_update() {
        let mut plugin = VersionPlugin::new();
        let global = std::sync::Arc::new(parking_lot::Mutex::new(KeySet::new()));
        let ctx = PhaseContext::new(Phase::PostStorage, &global, None);

        let mut ks = KeySet::new();
        let mut parent = Key::parse("system:/elektra/version").unwrap();
        let status = plugin.get(&mut ks, &mut parent, &ctx).unwrap();
        assert_eq!(status, PluginStatus::NoUpdate);
        assert!(ks.is_empty());
    }
}
