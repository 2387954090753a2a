//! The bootstrap subsystem and the hard-coded mountpoints.
//!
//! Bootstrap mounts `system:/elektra` with a minimal backend (default
//! resolver + default storage) so the real mount configuration can be read
//! from the bootstrap file. Only statically linked built-in plugins are
//! used; a broken mount configuration must still be diagnosable.
//!
//! After the parsed mount table replaced the bootstrap one, the hard-coded
//! mountpoints are installed: `system:/elektra` itself, the namespace
//! roots, the per-module introspection mountpoints and
//! `system:/elektra/version`.

use crate::backend::Backend;
use crate::config::Config;
use crate::error::{KdbError, KdbResult};
use crate::key::name::{KeyName, Namespace};
use crate::key::Key;
use crate::keyset::KeySet;
use crate::kdb::Kdb;
use crate::mount::elektra_root;
use crate::plugin::{plugin_handle, PluginHandle, Siblings};
use crate::plugins::modules::{module_info, ModulesPlugin};
use crate::registry::ModuleRegistry;
use std::collections::BTreeMap;
use std::sync::Arc;

fn open_builtin(
    registry: &ModuleRegistry,
    name: &str,
    error_key: &mut Key,
) -> KdbResult<PluginHandle> {
    registry.open_plugin(name, &KeySet::new(), error_key).map_err(|e| {
        KdbError::installation(format!(
            "could not open the built-in plugin '{name}': {}",
            e.reason()
        ))
    })
}

fn standard_definition(path: &str, absolute: bool) -> KeySet {
    let mut definition: KeySet = [
        ("/path", path),
        ("/positions/get/resolver", "#0"),
        ("/positions/get/storage", "#1"),
        ("/positions/set/resolver", "#0"),
        ("/positions/set/storage", "#1"),
        ("/positions/set/commit", "#0"),
        ("/positions/set/rollback", "#0"),
    ]
    .into_iter()
    .filter_map(|(name, value)| Key::parse(name).ok().map(|k| k.with_string(value)))
    .collect();
    if absolute {
        if let Ok(key) = Key::parse("/path/absolute") {
            definition.append(key.with_string("1"));
        }
    }
    definition
}

/// Builds the `system:/elektra` mountpoint over the bootstrap file.
pub(crate) fn elektra_mountpoint(
    registry: &ModuleRegistry,
    config: &Config,
    error_key: &mut Key,
) -> KdbResult<Backend> {
    let resolver = open_builtin(registry, "resolver", error_key)?;
    let storage = open_builtin(registry, "storage", error_key)?;
    let backend = open_builtin(registry, "backend", error_key)?;

    let mut plugins = BTreeMap::new();
    plugins.insert(KeyName::array_element(0), resolver);
    plugins.insert(KeyName::array_element(1), storage);

    let definition = standard_definition(&config.bootstrap_file.display().to_string(), true);

    Ok(Backend::new(
        elektra_root(),
        backend,
        Arc::new(plugins),
        definition,
    ))
}

/// Installs the hard-coded mountpoints into an opened session.
pub(crate) fn add_hardcoded_mountpoints(kdb: &mut Kdb, error_key: &mut Key) -> KdbResult<()> {
    // system:/elektra itself
    let elektra = elektra_mountpoint(&kdb.modules, &kdb.config, error_key)?;
    kdb.backends.insert(elektra);

    // one resolver/storage/backend trio shared by all namespace roots
    let resolver = open_builtin(&kdb.modules, "resolver", error_key)?;
    let storage = open_builtin(&kdb.modules, "storage", error_key)?;
    let root_backend = open_builtin(&kdb.modules, "backend", error_key)?;

    let mut plugins = BTreeMap::new();
    plugins.insert(KeyName::array_element(0), resolver);
    plugins.insert(KeyName::array_element(1), storage);
    let plugins: Siblings = Arc::new(plugins);

    let definition = standard_definition(&kdb.config.default_file, false);

    for ns in [
        Namespace::Spec,
        Namespace::System,
        Namespace::User,
        Namespace::Dir,
    ] {
        kdb.backends.insert(Backend::new(
            KeyName::root(ns),
            Arc::clone(&root_backend),
            Arc::clone(&plugins),
            definition.clone(),
        ));
    }

    // introspection mountpoints for every registered module
    let modules_root = elektra_root().child("modules");
    let names: Vec<String> = kdb.modules.names().map(str::to_string).collect();
    for name in names {
        let plugin = kdb.modules.instantiate(&name)?;
        let mountpoint = modules_root.child(name.clone());
        let info = module_info(&mountpoint, &name, plugin.capabilities());
        kdb.backends.insert(Backend::new(
            mountpoint,
            plugin_handle(Box::new(ModulesPlugin::new(info))),
            Arc::new(BTreeMap::new()),
            KeySet::new(),
        ));
    }

    // version information
    let version = open_builtin(&kdb.modules, "version", error_key)?;
    kdb.backends.insert(Backend::new(
        elektra_root().child("version"),
        version,
        Arc::new(BTreeMap::new()),
        KeySet::new(),
    ));

    Ok(())
}
