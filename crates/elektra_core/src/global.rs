//! The global plugin table.
//!
//! Global plugins sit in cross-cutting position/subposition slots and are
//! invoked around every per-backend phase. Ten positions exist, four
//! subpositions each; the `maxonce` subposition is the one the session
//! runs during `get` and `set`.

use crate::plugin::PluginHandle;
use std::sync::Arc;

/// A cross-cutting hook position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GlobalPosition {
    /// Before the storage phase of `get`.
    PreGetStorage,
    /// After merging, before the result is handed on (spec processing).
    ProcGetStorage,
    /// After the storage phase of `get`.
    PostGetStorage,
    /// Cleanup at the end of `get`.
    PostGetCleanup,
    /// Before the storage phase of `set` (spec fold-in, validation).
    PreSetStorage,
    /// Cleanup before the commit phases of `set`.
    PreSetCleanup,
    /// Before the commit phase.
    PreCommit,
    /// After the commit phase.
    PostCommit,
    /// Before the rollback phase.
    PreRollback,
    /// After the rollback phase.
    PostRollback,
}

impl GlobalPosition {
    /// All positions in declaration order.
    pub const ALL: [GlobalPosition; 10] = [
        GlobalPosition::PreGetStorage,
        GlobalPosition::ProcGetStorage,
        GlobalPosition::PostGetStorage,
        GlobalPosition::PostGetCleanup,
        GlobalPosition::PreSetStorage,
        GlobalPosition::PreSetCleanup,
        GlobalPosition::PreCommit,
        GlobalPosition::PostCommit,
        GlobalPosition::PreRollback,
        GlobalPosition::PostRollback,
    ];

    /// Returns the position name used in diagnostics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            GlobalPosition::PreGetStorage => "pregetstorage",
            GlobalPosition::ProcGetStorage => "procgetstorage",
            GlobalPosition::PostGetStorage => "postgetstorage",
            GlobalPosition::PostGetCleanup => "postgetcleanup",
            GlobalPosition::PreSetStorage => "presetstorage",
            GlobalPosition::PreSetCleanup => "presetcleanup",
            GlobalPosition::PreCommit => "precommit",
            GlobalPosition::PostCommit => "postcommit",
            GlobalPosition::PreRollback => "prerollback",
            GlobalPosition::PostRollback => "postrollback",
        }
    }

    fn index(self) -> usize {
        Self::ALL.iter().position(|&p| p == self).unwrap_or(0)
    }
}

/// A slot within a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubPosition {
    /// Run once when the position is entered.
    Init,
    /// Run at most once per operation; the slot the session invokes.
    MaxOnce,
    /// Run once when the position is left.
    Deinit,
    /// Run for every backend.
    Foreach,
}

impl SubPosition {
    /// All subpositions in declaration order.
    pub const ALL: [SubPosition; 4] = [
        SubPosition::Init,
        SubPosition::MaxOnce,
        SubPosition::Deinit,
        SubPosition::Foreach,
    ];

    /// Returns the subposition name used in diagnostics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SubPosition::Init => "init",
            SubPosition::MaxOnce => "maxonce",
            SubPosition::Deinit => "deinit",
            SubPosition::Foreach => "foreach",
        }
    }

    fn index(self) -> usize {
        Self::ALL.iter().position(|&p| p == self).unwrap_or(0)
    }
}

/// The per-position, per-subposition slots of a session.
pub struct GlobalPlugins {
    slots: Vec<Option<PluginHandle>>,
}

impl Default for GlobalPlugins {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalPlugins {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: vec![None; GlobalPosition::ALL.len() * SubPosition::ALL.len()],
        }
    }

    fn slot(position: GlobalPosition, sub: SubPosition) -> usize {
        position.index() * SubPosition::ALL.len() + sub.index()
    }

    /// Returns the plugin mounted in a slot.
    #[must_use]
    pub fn get(&self, position: GlobalPosition, sub: SubPosition) -> Option<&PluginHandle> {
        self.slots.get(Self::slot(position, sub))?.as_ref()
    }

    /// Mounts a plugin into a slot, replacing any previous occupant.
    pub fn set(&mut self, position: GlobalPosition, sub: SubPosition, plugin: PluginHandle) {
        let slot = Self::slot(position, sub);
        if slot < self.slots.len() {
            self.slots[slot] = Some(plugin);
        }
    }

    /// Returns every mounted plugin exactly once.
    #[must_use]
    pub fn unique_handles(&self) -> Vec<PluginHandle> {
        let mut unique: Vec<PluginHandle> = Vec::new();
        for handle in self.slots.iter().flatten() {
            if !unique.iter().any(|h| Arc::ptr_eq(h, handle)) {
                unique.push(Arc::clone(handle));
            }
        }
        unique
    }
}

impl std::fmt::Debug for GlobalPlugins {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mounted = self.slots.iter().filter(|s| s.is_some()).count();
        f.debug_struct("GlobalPlugins")
            .field("mounted_slots", &mounted)
            .finish()
    }
}
