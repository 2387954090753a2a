//! The standard backend plugin.
//!
//! One instance serves one (or several identical) mountpoints. During
//! `init` it parses the mountpoint definition: the storage `path` and the
//! `positions/{get,set}/...` tables referencing helper plugins by `#N`
//! array index. During the pipeline phases it dispatches to the configured
//! helpers for the current phase.
//!
//! A mountpoint without a set-resolver is read-only; `init` reports that
//! through the no-update status.

use crate::error::{add_warning, KdbError};
use crate::key::name::KeyName;
use crate::key::Key;
use crate::keyset::KeySet;
use crate::plugin::{
    Capabilities, Phase, PhaseContext, Plugin, PluginHandle, PluginResult, PluginStatus,
};
use std::sync::Arc;

const MODULE: &str = "backend";

/// Helper plugins of the read pipeline.
#[derive(Default)]
struct GetPositions {
    resolver: Option<PluginHandle>,
    prestorage: Vec<PluginHandle>,
    storage: Option<PluginHandle>,
    poststorage: Vec<PluginHandle>,
}

/// Helper plugins of the write pipeline.
#[derive(Default)]
struct SetPositions {
    resolver: Option<PluginHandle>,
    prestorage: Vec<PluginHandle>,
    storage: Option<PluginHandle>,
    poststorage: Vec<PluginHandle>,
    precommit: Vec<PluginHandle>,
    commit: Option<PluginHandle>,
    postcommit: Vec<PluginHandle>,
    prerollback: Vec<PluginHandle>,
    rollback: Option<PluginHandle>,
    postrollback: Vec<PluginHandle>,
}

impl SetPositions {
    fn any_configured(&self) -> bool {
        self.resolver.is_some()
            || self.storage.is_some()
            || self.commit.is_some()
            || self.rollback.is_some()
            || !self.prestorage.is_empty()
            || !self.poststorage.is_empty()
            || !self.precommit.is_empty()
            || !self.postcommit.is_empty()
            || !self.prerollback.is_empty()
            || !self.postrollback.is_empty()
    }
}

/// The standard backend plugin.
#[derive(Default)]
pub struct BackendPlugin {
    path: String,
    get_positions: GetPositions,
    set_positions: SetPositions,
}

impl BackendPlugin {
    /// Creates an unconfigured backend plugin; `init` supplies the
    /// mountpoint definition.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn lookup_value<'a>(definition: &'a KeySet, name: &str) -> Option<&'a str> {
    let name = KeyName::parse(name).ok()?;
    let value = definition.lookup(&name)?.string_value();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn has_key(definition: &KeySet, name: &str) -> bool {
    KeyName::parse(name)
        .ok()
        .and_then(|n| definition.lookup(&n).map(|_| ()))
        .is_some()
}

fn load_plugin(
    ctx: &PhaseContext<'_>,
    definition: &KeySet,
    position: &str,
    parent: &Key,
) -> Result<Option<PluginHandle>, KdbError> {
    let Some(reference) = lookup_value(definition, position) else {
        return Ok(None);
    };
    match ctx.sibling(reference) {
        Some(plugin) => Ok(Some(plugin)),
        None => Err(KdbError::installation(format!(
            "the plugin referenced in '{position}' (value: '{reference}') could not be found \
             (configuration of mountpoint: '{}')",
            parent.name()
        ))),
    }
}

fn load_plugin_list(
    ctx: &PhaseContext<'_>,
    definition: &KeySet,
    position: &str,
    parent: &Key,
) -> Result<Vec<PluginHandle>, KdbError> {
    let Ok(root) = KeyName::parse(position) else {
        return Ok(Vec::new());
    };
    let mut plugins = Vec::new();
    for key in definition.below(&root).iter() {
        if !key.name().is_directly_below(&root) {
            continue;
        }
        let reference = key.string_value();
        match ctx.sibling(reference) {
            Some(plugin) => plugins.push(plugin),
            None => {
                return Err(KdbError::installation(format!(
                    "the plugin referenced in '{}' (value: '{reference}') could not be found \
                     (configuration of mountpoint: '{}')",
                    key.name(),
                    parent.name()
                )))
            }
        }
    }
    Ok(plugins)
}

fn run_each(
    plugins: &[PluginHandle],
    entry: fn(&mut dyn Plugin, &mut KeySet, &mut Key, &PhaseContext<'_>) -> PluginResult,
    ks: &mut KeySet,
    parent: &mut Key,
    ctx: &PhaseContext<'_>,
) -> PluginResult {
    for plugin in plugins {
        entry(&mut **plugin.lock(), ks, parent, ctx)?;
    }
    Ok(PluginStatus::Success)
}

fn run_one(
    plugin: &Option<PluginHandle>,
    entry: fn(&mut dyn Plugin, &mut KeySet, &mut Key, &PhaseContext<'_>) -> PluginResult,
    ks: &mut KeySet,
    parent: &mut Key,
    ctx: &PhaseContext<'_>,
) -> PluginResult {
    match plugin {
        Some(plugin) => entry(&mut **plugin.lock(), ks, parent, ctx),
        None => Ok(PluginStatus::Success),
    }
}

fn entry_get(p: &mut dyn Plugin, ks: &mut KeySet, parent: &mut Key, ctx: &PhaseContext<'_>) -> PluginResult {
    p.get(ks, parent, ctx)
}

fn entry_set(p: &mut dyn Plugin, ks: &mut KeySet, parent: &mut Key, ctx: &PhaseContext<'_>) -> PluginResult {
    p.set(ks, parent, ctx)
}

fn entry_commit(p: &mut dyn Plugin, ks: &mut KeySet, parent: &mut Key, ctx: &PhaseContext<'_>) -> PluginResult {
    p.commit(ks, parent, ctx)
}

fn entry_error(p: &mut dyn Plugin, ks: &mut KeySet, parent: &mut Key, ctx: &PhaseContext<'_>) -> PluginResult {
    p.error(ks, parent, ctx)
}

impl Plugin for BackendPlugin {
    fn name(&self) -> &str {
        "backend"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::none()
            .with_init()
            .with_get()
            .with_set()
            .with_commit()
            .with_error()
    }

    fn init(&mut self, definition: &KeySet, parent: &mut Key, ctx: &PhaseContext<'_>) -> PluginResult {
        let Some(path) = lookup_value(definition, "/path") else {
            return Err(KdbError::installation(format!(
                "you must set 'path' to a non-empty value (configuration of mountpoint: '{}')",
                parent.name()
            )));
        };
        self.path = path.to_string();

        let has_get_resolver = lookup_value(definition, "/positions/get/resolver").is_some();
        let has_set_resolver = lookup_value(definition, "/positions/set/resolver").is_some();

        if has_get_resolver {
            if self.path.starts_with('/') && !has_key(definition, "/path/absolute") {
                add_warning(
                    parent,
                    &KdbError::installation(format!(
                        "a resolver is configured, the absolute path '{}' might not be used \
                         as-is; set 'path/absolute' to silence this warning (configuration of \
                         mountpoint: '{}')",
                        self.path,
                        parent.name()
                    )),
                    MODULE,
                );
            }
        } else {
            if has_set_resolver {
                return Err(KdbError::installation(format!(
                    "if 'positions/set/resolver' is set, 'positions/get/resolver' must also be \
                     set to a non-empty value (configuration of mountpoint: '{}')",
                    parent.name()
                )));
            }
            if !self.path.starts_with('/') {
                return Err(KdbError::installation(format!(
                    "if no resolver is configured, 'path' must be an absolute path \
                     (configuration of mountpoint: '{}')",
                    parent.name()
                )));
            }
        }

        self.get_positions = GetPositions {
            resolver: load_plugin(ctx, definition, "/positions/get/resolver", parent)?,
            prestorage: load_plugin_list(ctx, definition, "/positions/get/prestorage", parent)?,
            storage: load_plugin(ctx, definition, "/positions/get/storage", parent)?,
            poststorage: load_plugin_list(ctx, definition, "/positions/get/poststorage", parent)?,
        };
        self.set_positions = SetPositions {
            resolver: load_plugin(ctx, definition, "/positions/set/resolver", parent)?,
            prestorage: load_plugin_list(ctx, definition, "/positions/set/prestorage", parent)?,
            storage: load_plugin(ctx, definition, "/positions/set/storage", parent)?,
            poststorage: load_plugin_list(ctx, definition, "/positions/set/poststorage", parent)?,
            precommit: load_plugin_list(ctx, definition, "/positions/set/precommit", parent)?,
            commit: load_plugin(ctx, definition, "/positions/set/commit", parent)?,
            postcommit: load_plugin_list(ctx, definition, "/positions/set/postcommit", parent)?,
            prerollback: load_plugin_list(ctx, definition, "/positions/set/prerollback", parent)?,
            rollback: load_plugin(ctx, definition, "/positions/set/rollback", parent)?,
            postrollback: load_plugin_list(ctx, definition, "/positions/set/postrollback", parent)?,
        };

        if self.get_positions.storage.is_none() && !has_key(definition, "/positions/get/storage/omit") {
            add_warning(
                parent,
                &KdbError::installation(format!(
                    "no storage plugin defined for reading; set 'positions/get/storage', or \
                     set 'positions/get/storage/omit' to silence this warning (configuration \
                     of mountpoint: '{}')",
                    parent.name()
                )),
                MODULE,
            );
        }

        let read_only = !has_set_resolver;
        if read_only {
            if self.set_positions.any_configured() {
                add_warning(
                    parent,
                    &KdbError::installation(format!(
                        "the mountpoint is read-only (no set-resolver configured), the plugins \
                         configured below 'positions/set' will be ignored (configuration of \
                         mountpoint: '{}')",
                        parent.name()
                    )),
                    MODULE,
                );
            }
        } else if self.set_positions.storage.is_none()
            && !has_key(definition, "/positions/set/storage/omit")
        {
            add_warning(
                parent,
                &KdbError::installation(format!(
                    "a set-resolver is configured but no storage plugin is defined for \
                     writing; set 'positions/set/storage', or set 'positions/set/storage/omit' \
                     to silence this warning (configuration of mountpoint: '{}')",
                    parent.name()
                )),
                MODULE,
            );
        }

        if let (Some(resolver), Some(commit)) =
            (&self.set_positions.resolver, &self.set_positions.commit)
        {
            if !Arc::ptr_eq(resolver, commit) && !has_key(definition, "/positions/set/commit/differs") {
                add_warning(
                    parent,
                    &KdbError::installation(format!(
                        "the commit plugin differs from the resolver plugin; this is a \
                         non-standard configuration; set 'positions/set/commit/differs' to \
                         silence this warning (configuration of mountpoint: '{}')",
                        parent.name()
                    )),
                    MODULE,
                );
            }
        }
        if let (Some(resolver), Some(rollback)) =
            (&self.set_positions.resolver, &self.set_positions.rollback)
        {
            if !Arc::ptr_eq(resolver, rollback)
                && !has_key(definition, "/positions/set/rollback/differs")
            {
                add_warning(
                    parent,
                    &KdbError::installation(format!(
                        "the rollback plugin differs from the resolver plugin; this is a \
                         non-standard configuration; set 'positions/set/rollback/differs' to \
                         silence this warning (configuration of mountpoint: '{}')",
                        parent.name()
                    )),
                    MODULE,
                );
            }
        }

        if read_only {
            Ok(PluginStatus::NoUpdate)
        } else {
            Ok(PluginStatus::Success)
        }
    }

    fn get(&mut self, ks: &mut KeySet, parent: &mut Key, ctx: &PhaseContext<'_>) -> PluginResult {
        match ctx.phase {
            Phase::Resolver => {
                parent.set_string(self.path.clone())?;
                match &self.get_positions.resolver {
                    // no resolver: the absolute path is the identifier
                    None => Ok(PluginStatus::Success),
                    Some(resolver) => resolver.lock().get(ks, parent, ctx),
                }
            }
            Phase::CacheCheck => Ok(PluginStatus::NoUpdate),
            Phase::PreStorage => run_each(&self.get_positions.prestorage, entry_get, ks, parent, ctx),
            Phase::Storage => run_one(&self.get_positions.storage, entry_get, ks, parent, ctx),
            Phase::PostStorage => {
                run_each(&self.get_positions.poststorage, entry_get, ks, parent, ctx)
            }
            other => Err(KdbError::internal(format!(
                "unknown phase '{}' in the read pipeline",
                other.as_str()
            ))),
        }
    }

    fn set(&mut self, ks: &mut KeySet, parent: &mut Key, ctx: &PhaseContext<'_>) -> PluginResult {
        match ctx.phase {
            Phase::Resolver => {
                parent.set_string(self.path.clone())?;
                match &self.set_positions.resolver {
                    None => Err(KdbError::internal(
                        "the mountpoint has no set-resolver but was initialized read-write",
                    )),
                    Some(resolver) => resolver.lock().set(ks, parent, ctx),
                }
            }
            Phase::PreStorage => run_each(&self.set_positions.prestorage, entry_set, ks, parent, ctx),
            Phase::Storage => run_one(&self.set_positions.storage, entry_set, ks, parent, ctx),
            Phase::PostStorage => {
                run_each(&self.set_positions.poststorage, entry_set, ks, parent, ctx)
            }
            other => Err(KdbError::internal(format!(
                "unknown phase '{}' in the write pipeline",
                other.as_str()
            ))),
        }
    }

    fn commit(&mut self, ks: &mut KeySet, parent: &mut Key, ctx: &PhaseContext<'_>) -> PluginResult {
        match ctx.phase {
            Phase::PreCommit => run_each(&self.set_positions.precommit, entry_commit, ks, parent, ctx),
            Phase::Commit => run_one(&self.set_positions.commit, entry_commit, ks, parent, ctx),
            Phase::PostCommit => {
                run_each(&self.set_positions.postcommit, entry_commit, ks, parent, ctx)
            }
            other => Err(KdbError::internal(format!(
                "unknown phase '{}' in the commit sequence",
                other.as_str()
            ))),
        }
    }

    fn error(&mut self, ks: &mut KeySet, parent: &mut Key, ctx: &PhaseContext<'_>) -> PluginResult {
        match ctx.phase {
            Phase::PreRollback => {
                run_each(&self.set_positions.prerollback, entry_error, ks, parent, ctx)
            }
            Phase::Rollback => run_one(&self.set_positions.rollback, entry_error, ks, parent, ctx),
            Phase::PostRollback => {
                run_each(&self.set_positions.postrollback, entry_error, ks, parent, ctx)
            }
            other => Err(KdbError::internal(format!(
                "unknown phase '{}' in the rollback sequence",
                other.as_str()
            ))),
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl std::fmt::Debug for BackendPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendPlugin")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::warning_count;
    use crate::plugin::{plugin_handle, SharedKeySet, Siblings};
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    struct NullPlugin;

    impl Plugin for NullPlugin {
        fn name(&self) -> &str {
            "null"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::none().with_get().with_set()
        }

        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
    }

    fn siblings(count: usize) -> Siblings {
        let mut map = BTreeMap::new();
        for i in 0..count {
            map.insert(
                KeyName::array_element(i),
                plugin_handle(Box::new(NullPlugin)),
            );
        }
        Arc::new(map)
    }

    fn definition(entries: &[(&str, &str)]) -> KeySet {
        entries
            .iter()
            .map(|(name, value)| Key::parse(name).unwrap().with_string(*value))
            .collect()
    }

    fn init_backend(definition: &KeySet, siblings: &Siblings, parent: &mut Key) -> PluginResult {
        let global: SharedKeySet = Arc::new(Mutex::new(KeySet::new()));
        let ctx = PhaseContext::new(Phase::Init, &global, Some(siblings));
        BackendPlugin::new().init(definition, parent, &ctx)
    }

    #[test]
    fn init_without_path_fails() {
        let def = definition(&[("/positions/get/storage", "#0")]);
        let mut parent = Key::parse("system:/elektra/mountpoints/mp").unwrap();
        let err = init_backend(&def, &siblings(1), &mut parent).unwrap_err();
        assert!(matches!(err, KdbError::Installation { .. }));
    }

    #[test]
    fn read_write_mountpoint_reports_success() {
        let def = definition(&[
            ("/path", "app.ecf"),
            ("/positions/get/resolver", "#0"),
            ("/positions/get/storage", "#1"),
            ("/positions/set/resolver", "#0"),
            ("/positions/set/storage", "#1"),
        ]);
        let mut parent = Key::parse("system:/elektra/mountpoints/mp").unwrap();
        let status = init_backend(&def, &siblings(2), &mut parent).unwrap();
        assert_eq!(status, PluginStatus::Success);
    }

    #[test]
    fn missing_set_resolver_means_read_only() {
        let def = definition(&[
            ("/path", "app.ecf"),
            ("/positions/get/resolver", "#0"),
            ("/positions/get/storage", "#1"),
        ]);
        let mut parent = Key::parse("system:/elektra/mountpoints/mp").unwrap();
        let status = init_backend(&def, &siblings(2), &mut parent).unwrap();
        assert_eq!(status, PluginStatus::NoUpdate);
    }

    #[test]
    fn set_resolver_without_get_resolver_fails() {
        let def = definition(&[
            ("/path", "app.ecf"),
            ("/positions/set/resolver", "#0"),
            ("/positions/get/storage", "#1"),
        ]);
        let mut parent = Key::parse("system:/elektra/mountpoints/mp").unwrap();
        let err = init_backend(&def, &siblings(2), &mut parent).unwrap_err();
        assert!(matches!(err, KdbError::Installation { .. }));
    }

    #[test]
    fn relative_path_without_resolver_fails() {
        let def = definition(&[("/path", "app.ecf"), ("/positions/get/storage", "#0")]);
        let mut parent = Key::parse("system:/elektra/mountpoints/mp").unwrap();
        let err = init_backend(&def, &siblings(1), &mut parent).unwrap_err();
        assert!(matches!(err, KdbError::Installation { .. }));
    }

    #[test]
    fn dangling_plugin_reference_fails() {
        let def = definition(&[
            ("/path", "app.ecf"),
            ("/positions/get/resolver", "#7"),
            ("/positions/get/storage", "#0"),
        ]);
        let mut parent = Key::parse("system:/elektra/mountpoints/mp").unwrap();
        let err = init_backend(&def, &siblings(1), &mut parent).unwrap_err();
        assert!(matches!(err, KdbError::Installation { .. }));
    }

    #[test]
    fn missing_get_storage_warns_unless_silenced() {
        let def = definition(&[("/path", "app.ecf"), ("/positions/get/resolver", "#0")]);
        let mut parent = Key::parse("system:/elektra/mountpoints/mp").unwrap();
        init_backend(&def, &siblings(1), &mut parent).unwrap();
        assert_eq!(warning_count(&parent), 1);

        let def = definition(&[
            ("/path", "app.ecf"),
            ("/positions/get/resolver", "#0"),
            ("/positions/get/storage/omit", "1"),
        ]);
        let mut parent = Key::parse("system:/elektra/mountpoints/mp").unwrap();
        init_backend(&def, &siblings(1), &mut parent).unwrap();
        assert_eq!(warning_count(&parent), 0);
    }

    #[test]
    fn ignored_set_positions_warn_on_read_only_mountpoint() {
        let def = definition(&[
            ("/path", "app.ecf"),
            ("/positions/get/resolver", "#0"),
            ("/positions/get/storage", "#1"),
            ("/positions/set/storage", "#1"),
        ]);
        let mut parent = Key::parse("system:/elektra/mountpoints/mp").unwrap();
        let status = init_backend(&def, &siblings(2), &mut parent).unwrap();
        assert_eq!(status, PluginStatus::NoUpdate);
        assert_eq!(warning_count(&parent), 1);
    }

    #[test]
    fn differing_commit_plugin_warns_unless_silenced() {
        let def = definition(&[
            ("/path", "app.ecf"),
            ("/positions/get/resolver", "#0"),
            ("/positions/get/storage", "#1"),
            ("/positions/set/resolver", "#0"),
            ("/positions/set/storage", "#1"),
            ("/positions/set/commit", "#1"),
        ]);
        let mut parent = Key::parse("system:/elektra/mountpoints/mp").unwrap();
        init_backend(&def, &siblings(2), &mut parent).unwrap();
        assert_eq!(warning_count(&parent), 1);
    }
}
