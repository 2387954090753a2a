//! Backend records.
//!
//! A backend is the bundle serving one mountpoint: the primary backend
//! plugin, its auxiliary plugins (referenced by `#N` array indices from the
//! mountpoint definition), the definition itself, the working key set of
//! keys currently owned by the mountpoint, and per-operation bookkeeping.

use crate::key::name::KeyName;
use crate::keyset::KeySet;
use crate::plugin::{PluginHandle, Siblings};

/// The per-mountpoint record the pipeline operates on.
#[derive(Clone)]
pub struct Backend {
    pub(crate) mountpoint: KeyName,
    pub(crate) plugin: PluginHandle,
    pub(crate) plugins: Siblings,
    pub(crate) definition: KeySet,
    pub(crate) keys: KeySet,
    pub(crate) initialized: bool,
    pub(crate) read_only: bool,
    pub(crate) needs_update: bool,
    pub(crate) mountpoint_id: Option<String>,
    pub(crate) cache_id: Option<String>,
}

impl Backend {
    /// Creates a backend record for a mountpoint.
    #[must_use]
    pub fn new(
        mountpoint: KeyName,
        plugin: PluginHandle,
        plugins: Siblings,
        definition: KeySet,
    ) -> Self {
        Self {
            mountpoint,
            plugin,
            plugins,
            definition,
            keys: KeySet::new(),
            initialized: false,
            read_only: false,
            needs_update: false,
            mountpoint_id: None,
            cache_id: None,
        }
    }

    /// Returns the mountpoint name.
    #[must_use]
    pub fn mountpoint(&self) -> &KeyName {
        &self.mountpoint
    }

    /// Returns the primary backend plugin.
    #[must_use]
    pub fn plugin(&self) -> &PluginHandle {
        &self.plugin
    }

    /// Returns the auxiliary plugin table.
    #[must_use]
    pub fn plugins(&self) -> &Siblings {
        &self.plugins
    }

    /// Returns the mountpoint definition.
    #[must_use]
    pub fn definition(&self) -> &KeySet {
        &self.definition
    }

    /// Returns true once `init` has run successfully for this backend.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Returns true if `init` marked this backend read-only.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Returns the storage identifier reported by the last resolver phase.
    #[must_use]
    pub fn mountpoint_id(&self) -> Option<&str> {
        self.mountpoint_id.as_deref()
    }

    /// Returns the working key set currently owned by this mountpoint.
    #[must_use]
    pub fn keys(&self) -> &KeySet {
        &self.keys
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("mountpoint", &self.mountpoint.to_string())
            .field("initialized", &self.initialized)
            .field("read_only", &self.read_only)
            .field("keys", &self.keys.len())
            .finish_non_exhaustive()
    }
}
