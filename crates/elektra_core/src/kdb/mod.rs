//! The key database session.
//!
//! A [`Kdb`] handle owns the module registry, the mount table, the global
//! plugin table and the shared global key set. It implements the four
//! operations of the public contract: [`Kdb::open`], [`Kdb::close`],
//! [`Kdb::get`] and [`Kdb::set`].
//!
//! A handle is single-threaded from the caller's perspective; phases run to
//! completion and no plugin is re-entered while another phase on the same
//! handle is in flight. Several handles may exist concurrently, they share
//! nothing mutable.

mod bootstrap;
mod get;
mod mountconf;
mod set;

use crate::backend::Backend;
use crate::config::Config;
use crate::error::{add_warning, merge_warnings, set_error, KdbError, KdbResult};
use crate::global::{GlobalPlugins, GlobalPosition, SubPosition};
use crate::key::name::{KeyName, Namespace};
use crate::key::Key;
use crate::keyset::KeySet;
use crate::mount::{elektra_root, MountTable};
use crate::plugin::{
    plugin_handle, Phase, PhaseContext, PluginHandle, PluginResult, PluginStatus, SharedKeySet,
    GLOBAL_FAILED_PHASE_KEY, GLOBAL_PHASE_KEY,
};
use crate::plugins::ListPlugin;
use crate::registry::ModuleRegistry;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

pub(crate) const MODULE: &str = "kdb";

/// Outcome of a successful [`Kdb::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetOutcome {
    /// Keys changed since the last call; the result key set was updated.
    Updated,
    /// Nothing changed; the result key set was not modified.
    Unchanged,
}

/// Outcome of a successful [`Kdb::set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// All changes were committed atomically.
    Committed,
    /// Nothing needed to be done.
    NoChange,
}

/// A session with the key database.
pub struct Kdb {
    pub(crate) config: Config,
    pub(crate) modules: Arc<ModuleRegistry>,
    pub(crate) backends: MountTable,
    pub(crate) globals: GlobalPlugins,
    pub(crate) global: SharedKeySet,
}

impl Kdb {
    /// Opens a session with the default module registry.
    ///
    /// See [`Kdb::open_with_registry`].
    pub fn open(
        config: Config,
        contract: Option<&KeySet>,
        error_key: &mut Key,
    ) -> KdbResult<Self> {
        let registry = ModuleRegistry::with_builtins(&config);
        Self::open_with_registry(config, registry, contract, error_key)
    }

    /// Opens a session: bootstraps the mount configuration, processes the
    /// contract, parses the mountpoints and installs the hard-coded ones.
    ///
    /// # Errors
    ///
    /// Installation errors abort the open; the error is also mirrored into
    /// the metadata of `error_key`, warnings accumulate there.
    pub fn open_with_registry(
        config: Config,
        registry: ModuleRegistry,
        contract: Option<&KeySet>,
        error_key: &mut Key,
    ) -> KdbResult<Self> {
        match Self::open_inner(config, registry, contract, error_key) {
            Ok(kdb) => Ok(kdb),
            Err(e) => {
                set_error(error_key, &e, MODULE);
                Err(e)
            }
        }
    }

    fn open_inner(
        config: Config,
        registry: ModuleRegistry,
        contract: Option<&KeySet>,
        error_key: &mut Key,
    ) -> KdbResult<Self> {
        debug!(bootstrap_file = %config.bootstrap_file.display(), "opening kdb session");

        let modules = Arc::new(registry);
        let global: SharedKeySet = Arc::new(Mutex::new(KeySet::new()));

        let mut kdb = Kdb {
            config,
            modules: Arc::clone(&modules),
            backends: MountTable::new(),
            globals: GlobalPlugins::new(),
            global,
        };

        // the bootstrap mountpoint is installed once and swapped for the
        // parsed table afterwards
        let bootstrap = bootstrap::elektra_mountpoint(&kdb.modules, &kdb.config, error_key)?;
        kdb.backends.insert(bootstrap);

        let elektra_ks = kdb.bootstrap_get(error_key)?;

        // one list plugin instance serves all ten cross-cutting positions;
        // the verification runs whether or not a contract was supplied
        let list = plugin_handle(Box::new(ListPlugin::new(Arc::clone(&kdb.modules))));
        for position in GlobalPosition::ALL {
            kdb.globals
                .set(position, SubPosition::MaxOnce, Arc::clone(&list));
        }
        kdb.ensure_list_mounted_everywhere(error_key)?;

        if let Some(contract) = contract {
            kdb.ensure_contract(contract, error_key)?;
        }

        let backends = mountconf::parse_mountpoints(&elektra_ks, &kdb.modules, error_key)?;

        // swap from bootstrap to the real mount table
        let old = std::mem::replace(&mut kdb.backends, backends);
        close_backends(old, error_key);

        bootstrap::add_hardcoded_mountpoints(&mut kdb, error_key)?;

        debug!(mountpoints = kdb.backends.len(), "kdb session open");
        Ok(kdb)
    }

    /// Runs the bootstrap `get` of `system:/elektra` and returns the mount
    /// configuration.
    fn bootstrap_get(&mut self, error_key: &mut Key) -> KdbResult<KeySet> {
        let mut elektra_ks = KeySet::new();
        let mut parent = Key::new(elektra_root());
        parent.set_needs_sync(false);

        if let Err(e) = self.get(&mut elektra_ks, &mut parent) {
            merge_warnings(error_key, &parent);
            return Err(KdbError::installation(format!(
                "bootstrapping failed, please fix '{}': {}",
                self.config.bootstrap_file.display(),
                e.reason()
            )));
        }
        merge_warnings(error_key, &parent);
        Ok(elektra_ks)
    }

    /// Verifies that the same list plugin instance occupies all ten
    /// cross-cutting positions.
    fn ensure_list_mounted_everywhere(&self, _error_key: &mut Key) -> KdbResult<()> {
        let first = self
            .globals
            .get(GlobalPosition::ALL[0], SubPosition::MaxOnce)
            .ok_or_else(|| list_not_mounted(GlobalPosition::ALL[0]))?;
        if first.lock().name() != "list" {
            return Err(list_not_mounted(GlobalPosition::ALL[0]));
        }
        for position in &GlobalPosition::ALL[1..] {
            let plugin = self
                .globals
                .get(*position, SubPosition::MaxOnce)
                .ok_or_else(|| list_not_mounted(*position))?;
            // must always be the same instance
            if !Arc::ptr_eq(first, plugin) {
                return Err(list_not_mounted(*position));
            }
        }
        Ok(())
    }

    /// Applies the contract: merges its global key set and mounts its
    /// global plugins into the list plugin.
    fn ensure_contract(&mut self, contract: &KeySet, error_key: &mut Key) -> KdbResult<()> {
        // deep copy, later modifications of the caller's contract must not
        // reach the session
        let mut contract = contract.deep_dup();

        let global_root =
            KeyName::from_parts(Namespace::System, ["elektra", "contract", "globalkeyset"]);
        let mut global_ks = contract.cut(&global_root);
        global_ks.rename(&global_root, &elektra_root());
        self.global.lock().append_all(&global_ks);

        self.ensure_list_mounted_everywhere(error_key)?;

        let mount_root =
            KeyName::from_parts(Namespace::System, ["elektra", "contract", "mountglobal"]);
        let mount_ks = contract.cut(&mount_root);
        let config_root = KeyName::root(Namespace::User);

        let mut plugin_names: Vec<String> = Vec::new();
        for key in mount_ks.iter() {
            if let Some(rest) = key.name().strip_prefix(&mount_root) {
                if let Some(first) = rest.first() {
                    if plugin_names.last() != Some(first) {
                        plugin_names.push(first.clone());
                    }
                }
            }
        }

        for plugin_name in plugin_names {
            let plugin_root = mount_root.child(plugin_name.clone());
            let mut plugin_config = mount_ks.below(&plugin_root);
            plugin_config.rename(&plugin_root, &config_root);

            let list = self
                .globals
                .get(GlobalPosition::PreGetStorage, SubPosition::MaxOnce)
                .map(Arc::clone)
                .ok_or_else(|| list_not_mounted(GlobalPosition::PreGetStorage))?;
            let mut list = list.lock();
            let list = list
                .as_any_mut()
                .downcast_mut::<ListPlugin>()
                .ok_or_else(|| {
                    KdbError::internal("the global maxonce slots do not hold the list plugin")
                })?;

            if let Err(e) = list.mount_plugin(&plugin_name, &plugin_config, error_key) {
                add_warning(error_key, &e, MODULE);
                return Err(KdbError::installation(format!(
                    "the plugin '{plugin_name}' couldn't be mounted globally (via the 'list' \
                     plugin)"
                )));
            }
        }

        Ok(())
    }

    /// Closes the session: closes every backend plugin and every global
    /// plugin, then clears the global key set.
    ///
    /// Failures to close individual plugins become warnings on
    /// `error_key`; `close` itself does not fail.
    pub fn close(self, error_key: &mut Key) {
        close_backends(self.backends, error_key);

        for handle in self.globals.unique_handles() {
            close_plugin(&handle, error_key);
        }

        self.global.lock().clear();
        debug!("kdb session closed");
    }

    /// Returns the session configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the mount table.
    #[must_use]
    pub fn mount_table(&self) -> &MountTable {
        &self.backends
    }

    /// Returns the global plugin table.
    #[must_use]
    pub fn global_plugins(&self) -> &GlobalPlugins {
        &self.globals
    }

    /// Returns the shared global key set.
    #[must_use]
    pub fn global_keyset(&self) -> &SharedKeySet {
        &self.global
    }

    /// Runs the global plugin mounted at (`position`, maxonce), if any.
    pub(crate) fn run_global(
        &self,
        position: GlobalPosition,
        ks: &mut KeySet,
        parent: &mut Key,
    ) -> KdbResult<()> {
        let Some(plugin) = self.globals.get(position, SubPosition::MaxOnce) else {
            return Ok(());
        };
        let ctx = PhaseContext::new(position_phase(position), &self.global, None);
        let mut guard = plugin.lock();
        let result = match position {
            GlobalPosition::PreGetStorage
            | GlobalPosition::ProcGetStorage
            | GlobalPosition::PostGetStorage
            | GlobalPosition::PostGetCleanup => guard.get(ks, parent, &ctx),
            GlobalPosition::PreSetStorage | GlobalPosition::PreSetCleanup => {
                guard.set(ks, parent, &ctx)
            }
            GlobalPosition::PreCommit | GlobalPosition::PostCommit => {
                guard.commit(ks, parent, &ctx)
            }
            GlobalPosition::PreRollback | GlobalPosition::PostRollback => {
                guard.error(ks, parent, &ctx)
            }
        };
        result.map(|_| ())
    }

    /// Writes the failed-phase marker global plugins and backends can react
    /// to during a rollback.
    pub(crate) fn advertise_failed_phase(&self, phase: Phase) {
        let name = KeyName::from_parts(
            Namespace::System,
            ["elektra", "kdb", "backend", "failedphase"],
        );
        debug_assert_eq!(name.to_string(), GLOBAL_FAILED_PHASE_KEY);
        let mut key = Key::new(name).with_string(phase.as_str());
        key.set_needs_sync(false);
        self.global.lock().append(key);
    }
}

impl std::fmt::Debug for Kdb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kdb")
            .field("mountpoints", &self.backends.len())
            .finish_non_exhaustive()
    }
}

fn list_not_mounted(position: GlobalPosition) -> KdbError {
    KdbError::installation(format!(
        "list plugin not mounted at position {}/maxonce",
        position.as_str()
    ))
}

/// Maps a cross-cutting position onto the pipeline phase it wraps.
fn position_phase(position: GlobalPosition) -> Phase {
    match position {
        GlobalPosition::PreGetStorage => Phase::PreStorage,
        GlobalPosition::ProcGetStorage => Phase::Storage,
        GlobalPosition::PostGetStorage | GlobalPosition::PostGetCleanup => Phase::PostStorage,
        GlobalPosition::PreSetStorage | GlobalPosition::PreSetCleanup => Phase::PreStorage,
        GlobalPosition::PreCommit => Phase::PreCommit,
        GlobalPosition::PostCommit => Phase::PostCommit,
        GlobalPosition::PreRollback => Phase::PreRollback,
        GlobalPosition::PostRollback => Phase::PostRollback,
    }
}

/// Closes every plugin of a mount table exactly once.
pub(crate) fn close_backends(table: MountTable, error_key: &mut Key) {
    let mut unique: Vec<PluginHandle> = Vec::new();
    for backend in table.into_backends() {
        for handle in std::iter::once(&backend.plugin).chain(backend.plugins.values()) {
            if !unique.iter().any(|h| Arc::ptr_eq(h, handle)) {
                unique.push(Arc::clone(handle));
            }
        }
    }
    for handle in unique {
        close_plugin(&handle, error_key);
    }
}

fn close_plugin(handle: &PluginHandle, error_key: &mut Key) {
    let mut plugin = handle.lock();
    if !plugin.capabilities().close {
        return;
    }
    let name = plugin.name().to_string();
    if let Err(e) = plugin.close(error_key) {
        drop(plugin);
        add_warning(
            error_key,
            &KdbError::resource(format!("could not close the plugin '{name}': {}", e.reason())),
            MODULE,
        );
    }
}

/// Which trait entry point a phase invocation goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryPoint {
    /// `Plugin::get`
    Get,
    /// `Plugin::set`
    Set,
    /// `Plugin::commit`
    Commit,
    /// `Plugin::error`
    Error,
}

impl EntryPoint {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            EntryPoint::Get => "get",
            EntryPoint::Set => "set",
            EntryPoint::Commit => "commit",
            EntryPoint::Error => "error",
        }
    }

    pub(crate) fn provided_by(self, backend: &Backend) -> bool {
        let caps = backend.plugin.lock().capabilities();
        match self {
            EntryPoint::Get => caps.get,
            EntryPoint::Set => caps.set,
            EntryPoint::Commit => caps.commit,
            EntryPoint::Error => caps.error,
        }
    }
}

/// Invokes one backend's entry point for one phase.
///
/// The parent key is re-targeted at the backend's mountpoint and its name
/// is locked for the duration of the call; `lock_value` additionally locks
/// the value (resolver and commit phases report identifiers through the
/// value and keep it writable). The current phase is mirrored into the
/// shared global key set before the call.
pub(crate) fn call_backend(
    backend: &mut Backend,
    global: &SharedKeySet,
    parent: &mut Key,
    phase: Phase,
    entry: EntryPoint,
    lock_value: bool,
) -> PluginResult {
    advertise_phase(global, phase);

    parent.set_name_internal(backend.mountpoint.clone());
    let value = match phase {
        Phase::Resolver => String::new(),
        _ => backend.mountpoint_id.clone().unwrap_or_default(),
    };
    parent.set_string(value)?;

    parent.set_read_only_name(true);
    parent.set_read_only_value(lock_value);

    let ctx = PhaseContext::new(phase, global, Some(&backend.plugins));
    let result = {
        let mut plugin = backend.plugin.lock();
        match entry {
            EntryPoint::Get => plugin.get(&mut backend.keys, parent, &ctx),
            EntryPoint::Set => plugin.set(&mut backend.keys, parent, &ctx),
            EntryPoint::Commit => plugin.commit(&mut backend.keys, parent, &ctx),
            EntryPoint::Error => plugin.error(&mut backend.keys, parent, &ctx),
        }
    };

    parent.set_read_only_name(false);
    parent.set_read_only_value(false);

    result
}

/// Invokes one backend's `init` entry point.
pub(crate) fn call_backend_init(
    backend: &mut Backend,
    global: &SharedKeySet,
    parent: &mut Key,
) -> PluginResult {
    advertise_phase(global, Phase::Init);

    let mut name = KeyName::from_parts(Namespace::System, ["elektra", "mountpoints"]);
    name.push(backend.mountpoint.to_string());
    parent.set_name_internal(name);
    parent.set_string(String::new())?;
    parent.set_read_only_name(true);

    let ctx = PhaseContext::new(Phase::Init, global, Some(&backend.plugins));
    let result = {
        let mut plugin = backend.plugin.lock();
        plugin.init(&backend.definition, parent, &ctx)
    };

    parent.set_read_only_name(false);
    result
}

fn advertise_phase(global: &SharedKeySet, phase: Phase) {
    let name = KeyName::from_parts(Namespace::System, ["elektra", "kdb", "backend", "phase"]);
    debug_assert_eq!(name.to_string(), GLOBAL_PHASE_KEY);
    let mut key = Key::new(name).with_string(phase.as_str());
    key.set_needs_sync(false);
    global.lock().append(key);
}

/// Records a per-backend phase failure: adds it as a warning and, for the
/// first failure of the operation, remembers it as the terminal error and
/// annotates the parent key with the backend's mountpoint and storage
/// identifier.
pub(crate) fn record_failure(
    parent: &mut Key,
    first_error: &mut Option<KdbError>,
    error: KdbError,
    backend: &Backend,
) {
    add_warning(parent, &error, MODULE);
    if first_error.is_none() {
        crate::error::annotate_error(
            parent,
            Some(&backend.mountpoint.to_string()),
            backend.mountpoint_id.as_deref(),
        );
    }
    first_error.get_or_insert(error);
}

/// Wraps a plugin failure into a warning-friendly error of the same kind
/// with added context.
pub(crate) fn with_context(error: KdbError, context: impl std::fmt::Display) -> KdbError {
    let reason = format!("{context}: {}", error.reason());
    match error {
        KdbError::Interface { .. } => KdbError::interface(reason),
        KdbError::Installation { .. } => KdbError::installation(reason),
        KdbError::Resource { .. } => KdbError::resource(reason),
        KdbError::ConflictingState { .. } => KdbError::conflicting_state(reason),
        KdbError::PluginMisbehavior { .. } => KdbError::plugin_misbehavior(reason),
        KdbError::Internal { .. } => KdbError::internal(reason),
        KdbError::Validation { .. } => KdbError::validation(reason),
    }
}

/// Checks the shared preconditions of `get` and `set`.
///
/// Returns `None` when the parent key cannot even carry error metadata; in
/// that case the operation fails without diagnostics.
pub(crate) fn check_parent(parent: &mut Key) -> Option<KdbResult<()>> {
    if parent.is_meta_read_only() {
        return None;
    }

    crate::error::clear_error_and_warnings(parent);

    if parent.is_name_read_only() {
        return Some(Err(KdbError::interface(
            "parent key with read-only name passed",
        )));
    }
    if parent.is_value_read_only() {
        return Some(Err(KdbError::interface(
            "parent key with read-only value passed",
        )));
    }
    if parent.name().namespace() == Namespace::Meta {
        return Some(Err(KdbError::interface(format!(
            "parent key with meta:/ name passed ('{}')",
            parent.name()
        ))));
    }

    Some(Ok(()))
}

/// Record of PluginStatus handling shared by the phase loops: `CacheHit`
/// outside the cachecheck phase counts as a contract violation.
pub(crate) fn unexpected_status(
    status: PluginStatus,
    backend: &Backend,
    phase: Phase,
    operation: &str,
) -> Option<KdbError> {
    if status == PluginStatus::CacheHit && phase != Phase::CacheCheck {
        return Some(KdbError::plugin_misbehavior(format!(
            "the backend plugin of the mountpoint '{}' reported a cache hit during the {} \
             phase of {operation}",
            backend.mountpoint,
            phase.as_str()
        )));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sandboxed_kdb() -> (Kdb, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = Config::sandboxed(dir.path());
        let mut error_key = Key::parse("/").unwrap();
        let kdb = Kdb::open(config, None, &mut error_key).unwrap();
        (kdb, dir)
    }

    #[test]
    fn open_without_a_contract_mounts_the_list_plugin_everywhere() {
        let (kdb, _dir) = sandboxed_kdb();

        let first = kdb
            .globals
            .get(GlobalPosition::ALL[0], SubPosition::MaxOnce)
            .unwrap();
        assert_eq!(first.lock().name(), "list");

        for position in GlobalPosition::ALL {
            let plugin = kdb.globals.get(position, SubPosition::MaxOnce).unwrap();
            assert!(
                Arc::ptr_eq(first, plugin),
                "position {} holds a different instance",
                position.as_str()
            );
        }

        let mut error_key = Key::parse("/").unwrap();
        assert!(kdb.ensure_list_mounted_everywhere(&mut error_key).is_ok());
    }

    #[test]
    fn empty_global_table_fails_the_list_verification() {
        let (mut kdb, _dir) = sandboxed_kdb();
        kdb.globals = GlobalPlugins::new();

        let mut error_key = Key::parse("/").unwrap();
        let err = kdb
            .ensure_list_mounted_everywhere(&mut error_key)
            .unwrap_err();
        assert!(matches!(err, KdbError::Installation { .. }));
    }

    #[test]
    fn foreign_instance_in_a_slot_fails_the_list_verification() {
        let (mut kdb, _dir) = sandboxed_kdb();

        // a second list instance is still the wrong instance
        let other = plugin_handle(Box::new(ListPlugin::new(Arc::clone(&kdb.modules))));
        kdb.globals
            .set(GlobalPosition::PostCommit, SubPosition::MaxOnce, other);

        let mut error_key = Key::parse("/").unwrap();
        let err = kdb
            .ensure_list_mounted_everywhere(&mut error_key)
            .unwrap_err();
        assert!(matches!(err, KdbError::Installation { .. }));
    }

    #[test]
    fn non_list_plugin_in_the_first_slot_fails_the_list_verification() {
        let (mut kdb, _dir) = sandboxed_kdb();

        let mut error_key = Key::parse("/").unwrap();
        let storage = kdb
            .modules
            .open_plugin("storage", &KeySet::new(), &mut error_key)
            .unwrap();
        for position in GlobalPosition::ALL {
            kdb.globals
                .set(position, SubPosition::MaxOnce, Arc::clone(&storage));
        }

        let err = kdb
            .ensure_list_mounted_everywhere(&mut error_key)
            .unwrap_err();
        assert!(matches!(err, KdbError::Installation { .. }));
    }
}
