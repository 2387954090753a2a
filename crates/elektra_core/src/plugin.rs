//! The plugin contract.
//!
//! A plugin is a unit of code implementing any subset of the pipeline entry
//! points. Which entry points a plugin actually provides is stated by its
//! [`Capabilities`]; missing entries are legal unless the plugin's role
//! requires them, and the orchestrator checks before calling.
//!
//! Every phase invocation receives a [`PhaseContext`] carrying the current
//! [`Phase`], the session-wide shared key set and, for plugins that belong
//! to a mountpoint, the table of sibling plugins referenced by `#N` array
//! indices from the mountpoint definition. The orchestrator additionally
//! mirrors the current phase into the shared key set under
//! [`GLOBAL_PHASE_KEY`]; plugins must not modify that reserved key.

use crate::error::KdbResult;
use crate::key::Key;
use crate::keyset::KeySet;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Reserved key advertising the currently running phase.
pub const GLOBAL_PHASE_KEY: &str = "system:/elektra/kdb/backend/phase";

/// Reserved key advertising the phase that failed before a rollback.
pub const GLOBAL_FAILED_PHASE_KEY: &str = "system:/elektra/kdb/backend/failedphase";

/// A named step in the `get` or `set` pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// One-time backend initialization after `open`.
    Init,
    /// Resolve the storage identifier (e.g. an absolute file name).
    Resolver,
    /// Decide whether a cached key set is still valid.
    CacheCheck,
    /// Transform the storage medium before it is read or written.
    PreStorage,
    /// Parse or serialize the storage medium.
    Storage,
    /// Validate or annotate the parsed keys; logging only during a write.
    PostStorage,
    /// File-level finalization before the commit (encryption, signing).
    PreCommit,
    /// Atomically swap the temporary storage for the live storage.
    Commit,
    /// Notification after a successful commit; errors become warnings.
    PostCommit,
    /// Notification before a rollback; errors become warnings.
    PreRollback,
    /// Revert every mutation performed since the resolver phase.
    Rollback,
    /// Notification after a rollback; errors become warnings.
    PostRollback,
}

impl Phase {
    /// Returns the phase name as advertised in the shared key set.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Resolver => "resolver",
            Phase::CacheCheck => "cachecheck",
            Phase::PreStorage => "prestorage",
            Phase::Storage => "storage",
            Phase::PostStorage => "poststorage",
            Phase::PreCommit => "precommit",
            Phase::Commit => "commit",
            Phase::PostCommit => "postcommit",
            Phase::PreRollback => "prerollback",
            Phase::Rollback => "rollback",
            Phase::PostRollback => "postrollback",
        }
    }
}

/// Result codes a plugin can report besides a hard error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginStatus {
    /// The operation succeeded and produced or accepted an update.
    Success,
    /// The operation succeeded, nothing changed. During `init` this marks
    /// the backend read-only.
    NoUpdate,
    /// Only valid during the cachecheck phase: the cached key set is valid.
    CacheHit,
}

/// Result type of every plugin entry point.
pub type PluginResult = KdbResult<PluginStatus>;

/// States which entry points a plugin implements.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    /// Implements `open`.
    pub open: bool,
    /// Implements `close`.
    pub close: bool,
    /// Implements `init`.
    pub init: bool,
    /// Implements `get`.
    pub get: bool,
    /// Implements `set`.
    pub set: bool,
    /// Implements `commit`.
    pub commit: bool,
    /// Implements `error`.
    pub error: bool,
}

impl Capabilities {
    /// No entry points.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            open: false,
            close: false,
            init: false,
            get: false,
            set: false,
            commit: false,
            error: false,
        }
    }

    /// Marks `open` as implemented.
    #[must_use]
    pub const fn with_open(mut self) -> Self {
        self.open = true;
        self
    }

    /// Marks `close` as implemented.
    #[must_use]
    pub const fn with_close(mut self) -> Self {
        self.close = true;
        self
    }

    /// Marks `init` as implemented.
    #[must_use]
    pub const fn with_init(mut self) -> Self {
        self.init = true;
        self
    }

    /// Marks `get` as implemented.
    #[must_use]
    pub const fn with_get(mut self) -> Self {
        self.get = true;
        self
    }

    /// Marks `set` as implemented.
    #[must_use]
    pub const fn with_set(mut self) -> Self {
        self.set = true;
        self
    }

    /// Marks `commit` as implemented.
    #[must_use]
    pub const fn with_commit(mut self) -> Self {
        self.commit = true;
        self
    }

    /// Marks `error` as implemented.
    #[must_use]
    pub const fn with_error(mut self) -> Self {
        self.error = true;
        self
    }
}

/// A shared, session-wide key set.
pub type SharedKeySet = Arc<Mutex<KeySet>>;

/// A shared, mutex-guarded plugin instance.
///
/// Plugin instances can be referenced from several mountpoints (the
/// hard-coded root mountpoints share one resolver and storage instance).
pub type PluginHandle = Arc<Mutex<Box<dyn Plugin>>>;

/// Wraps a plugin instance into a shared handle.
#[must_use]
pub fn plugin_handle(plugin: Box<dyn Plugin>) -> PluginHandle {
    Arc::new(Mutex::new(plugin))
}

/// The auxiliary plugins of a mountpoint, keyed by their `#N` array index
/// from the mountpoint definition.
pub type Siblings = Arc<BTreeMap<String, PluginHandle>>;

/// Per-invocation context handed to every phase entry point.
pub struct PhaseContext<'a> {
    /// The phase being executed.
    pub phase: Phase,
    /// The session-wide shared key set.
    pub global: &'a SharedKeySet,
    /// The sibling plugins of the mountpoint, if the plugin belongs to one.
    pub siblings: Option<&'a Siblings>,
}

impl<'a> PhaseContext<'a> {
    /// Creates a context for a phase.
    #[must_use]
    pub fn new(phase: Phase, global: &'a SharedKeySet, siblings: Option<&'a Siblings>) -> Self {
        Self {
            phase,
            global,
            siblings,
        }
    }

    /// Returns a context for the same invocation with a different phase.
    #[must_use]
    pub fn with_phase(&self, phase: Phase) -> PhaseContext<'a> {
        PhaseContext {
            phase,
            global: self.global,
            siblings: self.siblings,
        }
    }

    /// Looks up a sibling plugin by its `#N` array index.
    #[must_use]
    pub fn sibling(&self, reference: &str) -> Option<PluginHandle> {
        self.siblings?.get(reference).map(Arc::clone)
    }
}

/// A polymorphic pipeline component.
///
/// The default method bodies are no-ops; a plugin only overrides the entry
/// points its [`Capabilities`] announce. Dynamic inter-plugin dispatch (the
/// `list` plugin exports mount and unmount operations) goes through
/// [`Plugin::as_any_mut`] downcasting.
pub trait Plugin: Send {
    /// Returns the plugin name.
    fn name(&self) -> &str;

    /// States which entry points this plugin implements.
    fn capabilities(&self) -> Capabilities;

    /// Lifecycle start; receives the plugin configuration.
    fn open(&mut self, _config: &KeySet, _error_key: &mut Key) -> PluginResult {
        Ok(PluginStatus::Success)
    }

    /// Lifecycle end.
    fn close(&mut self, _error_key: &mut Key) -> PluginResult {
        Ok(PluginStatus::Success)
    }

    /// One-time backend initialization with the mountpoint definition.
    fn init(&mut self, _definition: &KeySet, _parent: &mut Key, _ctx: &PhaseContext<'_>) -> PluginResult {
        Ok(PluginStatus::Success)
    }

    /// Read-pipeline entry point.
    fn get(&mut self, _ks: &mut KeySet, _parent: &mut Key, _ctx: &PhaseContext<'_>) -> PluginResult {
        Ok(PluginStatus::Success)
    }

    /// Write-pipeline entry point for the resolver and storage phases.
    fn set(&mut self, _ks: &mut KeySet, _parent: &mut Key, _ctx: &PhaseContext<'_>) -> PluginResult {
        Ok(PluginStatus::Success)
    }

    /// Write-pipeline entry point for the commit phases.
    fn commit(&mut self, _ks: &mut KeySet, _parent: &mut Key, _ctx: &PhaseContext<'_>) -> PluginResult {
        Ok(PluginStatus::Success)
    }

    /// Write-pipeline entry point for the rollback phases.
    fn error(&mut self, _ks: &mut KeySet, _parent: &mut Key, _ctx: &PhaseContext<'_>) -> PluginResult {
        Ok(PluginStatus::Success)
    }

    /// Access for concrete-type downcasts (inter-plugin dispatch).
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_names() {
        assert_eq!(Phase::Resolver.as_str(), "resolver");
        assert_eq!(Phase::PostRollback.as_str(), "postrollback");
    }

    #[test]
    fn capabilities_builder() {
        let caps = Capabilities::none().with_get().with_set();
        assert!(caps.get);
        assert!(caps.set);
        assert!(!caps.commit);
    }
}
