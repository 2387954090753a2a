//! Fault-injection plugins.
//!
//! [`CrashStorage`] wraps the default storage plugin and fails at a
//! configured entry point, so pipeline tests can observe rollback
//! behavior. [`PhaseRecorder`] logs every invocation; wired into
//! prestorage or poststorage positions it makes phase ordering visible.

use elektra_core::plugins::StoragePlugin;
use elektra_core::{
    Capabilities, KdbError, Key, KeyName, KeySet, PhaseContext, Plugin, PluginResult,
    PluginStatus,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// A storage plugin that fails at a configured entry point.
///
/// The entry point to sabotage is read from the plugin configuration key
/// `/fail` (`"get"`, `"set"` or `"commit"`); without it the plugin behaves
/// like the default storage.
#[derive(Default)]
pub struct CrashStorage {
    inner: StoragePlugin,
    fail_on: Option<String>,
}

impl CrashStorage {
    /// Creates an unconfigured crash storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn injected(&self, entry: &str) -> Option<KdbError> {
        if self.fail_on.as_deref() == Some(entry) {
            Some(KdbError::resource(format!(
                "injected failure in the {entry} entry point"
            )))
        } else {
            None
        }
    }
}

impl Plugin for CrashStorage {
    fn name(&self) -> &str {
        "crashstorage"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::none().with_open().with_get().with_set()
    }

    fn open(&mut self, config: &KeySet, _error_key: &mut Key) -> PluginResult {
        if let Ok(name) = KeyName::parse("/fail") {
            self.fail_on = config
                .lookup(&name)
                .map(|k| k.string_value().to_string())
                .filter(|v| !v.is_empty());
        }
        Ok(PluginStatus::Success)
    }

    fn get(&mut self, ks: &mut KeySet, parent: &mut Key, ctx: &PhaseContext<'_>) -> PluginResult {
        if let Some(e) = self.injected("get") {
            return Err(e);
        }
        self.inner.get(ks, parent, ctx)
    }

    fn set(&mut self, ks: &mut KeySet, parent: &mut Key, ctx: &PhaseContext<'_>) -> PluginResult {
        if let Some(e) = self.injected("set") {
            return Err(e);
        }
        self.inner.set(ks, parent, ctx)
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// A shared log of plugin invocations, `entry:phase` per line.
pub type PhaseLog = Arc<Mutex<Vec<String>>>;

/// Creates an empty shared phase log.
#[must_use]
pub fn phase_log() -> PhaseLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// A plugin that records every invocation into a shared log.
pub struct PhaseRecorder {
    log: PhaseLog,
}

impl PhaseRecorder {
    /// Creates a recorder writing into the given log.
    #[must_use]
    pub fn new(log: PhaseLog) -> Self {
        Self { log }
    }

    fn record(&self, entry: &str, ctx: &PhaseContext<'_>) {
        self.log
            .lock()
            .push(format!("{entry}:{}", ctx.phase.as_str()));
    }
}

impl Plugin for PhaseRecorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::none()
            .with_get()
            .with_set()
            .with_commit()
            .with_error()
    }

    fn get(&mut self, _ks: &mut KeySet, _parent: &mut Key, ctx: &PhaseContext<'_>) -> PluginResult {
        self.record("get", ctx);
        Ok(PluginStatus::Success)
    }

    fn set(&mut self, _ks: &mut KeySet, _parent: &mut Key, ctx: &PhaseContext<'_>) -> PluginResult {
        self.record("set", ctx);
        Ok(PluginStatus::Success)
    }

    fn commit(&mut self, _ks: &mut KeySet, _parent: &mut Key, ctx: &PhaseContext<'_>) -> PluginResult {
        self.record("commit", ctx);
        Ok(PluginStatus::Success)
    }

    fn error(&mut self, _ks: &mut KeySet, _parent: &mut Key, ctx: &PhaseContext<'_>) -> PluginResult {
        self.record("error", ctx);
        Ok(PluginStatus::Success)
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
