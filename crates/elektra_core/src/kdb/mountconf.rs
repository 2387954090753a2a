//! Parsing of the mount configuration.
//!
//! The mount configuration lives below `system:/elektra/mountpoints`; each
//! direct child describes one mountpoint:
//!
//! ```text
//! system:/elektra/mountpoints/<escaped-mountpoint>/backend     = #N
//! system:/elektra/mountpoints/<escaped-mountpoint>/plugins/#N/name = <plugin>
//! system:/elektra/mountpoints/<escaped-mountpoint>/plugins/#N/config/...
//! system:/elektra/mountpoints/<escaped-mountpoint>/definition/...
//! ```
//!
//! Plugin configurations and the definition subtree are rewritten to the
//! plugin-relative root `/...` before they are handed to the plugins.

use crate::backend::Backend;
use crate::error::{add_warning, KdbError, KdbResult};
use crate::key::name::{KeyName, Namespace};
use crate::key::Key;
use crate::keyset::KeySet;
use crate::mount::{elektra_root, MountTable};
use crate::plugin::PluginHandle;
use crate::registry::ModuleRegistry;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

const MODULE: &str = "mountconf";

/// Collects the distinct direct-child names below `root`, whether or not
/// the child node itself exists as a key.
fn direct_children(ks: &KeySet, root: &KeyName) -> Vec<String> {
    let mut children: Vec<String> = Vec::new();
    for key in ks.below(root).iter() {
        if let Some(rest) = key.name().strip_prefix(root) {
            if let Some(first) = rest.first() {
                if children.last() != Some(first) {
                    children.push(first.clone());
                }
            }
        }
    }
    children
}

/// Parses the mount configuration into a mount table.
///
/// Mountpoints below the reserved `system:/elektra` subtree are dropped
/// with a warning. Other malformed mountpoints warn as well and make the
/// whole parse fail with an installation error.
pub(crate) fn parse_mountpoints(
    elektra_ks: &KeySet,
    registry: &ModuleRegistry,
    error_key: &mut Key,
) -> KdbResult<MountTable> {
    let mut table = MountTable::new();
    let mountpoints_root = elektra_root().child("mountpoints");
    let mut failed = false;

    for child in direct_children(elektra_ks, &mountpoints_root) {
        let root = mountpoints_root.child(child);

        match parse_mountpoint(elektra_ks, registry, &root, error_key) {
            Ok(Some(backend)) => {
                debug!(mountpoint = %backend.mountpoint(), "parsed mountpoint");
                table.insert(backend);
            }
            Ok(None) => {
                // dropped with a warning (reserved subtree)
            }
            Err(e) => {
                add_warning(error_key, &e, MODULE);
                failed = true;
            }
        }
    }

    if failed {
        return Err(KdbError::installation(
            "some mountpoints couldn't be parsed; see warnings for details",
        ));
    }

    Ok(table)
}

fn parse_mountpoint(
    elektra_ks: &KeySet,
    registry: &ModuleRegistry,
    root: &KeyName,
    error_key: &mut Key,
) -> KdbResult<Option<Backend>> {
    let Some(base) = root.base_name() else {
        return Err(KdbError::installation(format!(
            "'{root}' is not a valid mountpoint configuration"
        )));
    };

    let mountpoint = KeyName::parse(base).map_err(|e| {
        KdbError::installation(format!(
            "'{base}' is not a valid key name, but is used for the mountpoint '{root}': {e}"
        ))
    })?;

    if mountpoint.is_below_or_same(&elektra_root()) {
        add_warning(
            error_key,
            &KdbError::installation(format!(
                "the mountpoint '{base}' (defined at '{root}') is not allowed; everything \
                 below 'system:/elektra' is reserved",
            )),
            MODULE,
        );
        return Ok(None);
    }

    // backend reference
    let backend_ref_name = root.child("backend");
    let backend_ref = elektra_ks
        .lookup(&backend_ref_name)
        .map(|k| k.string_value().to_string())
        .unwrap_or_default();
    if backend_ref.is_empty() {
        return Err(KdbError::installation(format!(
            "the mountpoint '{mountpoint}' defined in '{root}' does not specify a backend \
             plugin"
        )));
    }
    if !KeyName::is_array_element(&backend_ref) {
        return Err(KdbError::installation(format!(
            "the value of '{backend_ref_name}' ('{backend_ref}') is not a valid array index"
        )));
    }

    // open all plugins
    let plugins_root = root.child("plugins");
    let plugins_ks = elektra_ks.below(&plugins_root);
    let mut plugins: BTreeMap<String, PluginHandle> = BTreeMap::new();

    for index in direct_children(&plugins_ks, &plugins_root) {
        let entry_root = plugins_root.child(index.clone());

        let plugin_name = plugins_ks
            .lookup(&entry_root.child("name"))
            .map(|k| k.string_value().to_string())
            .unwrap_or_default();
        if plugin_name.is_empty() {
            return Err(KdbError::installation(format!(
                "the plugin definition at '{entry_root}' doesn't contain a plugin name; set \
                 '{entry_root}/name' to a non-empty string value"
            )));
        }

        let config_root = entry_root.child("config");
        let mut config = plugins_ks.below(&config_root);
        config.rename(&config_root, &KeyName::root(Namespace::Cascading));

        let plugin = registry
            .open_plugin(&plugin_name, &config, error_key)
            .map_err(|e| {
                KdbError::installation(format!(
                    "could not open the plugin '{plugin_name}' defined at '{entry_root}': {}",
                    e.reason()
                ))
            })?;
        plugins.insert(index, plugin);
    }

    let Some(backend_plugin) = plugins.get(&backend_ref).map(Arc::clone) else {
        return Err(KdbError::installation(format!(
            "the mountpoint '{mountpoint}' defined in '{root}' specifies '{backend_ref}' as \
             the index of the backend plugin, but there is no such element in \
             '{root}/plugins'"
        )));
    };

    // definition subtree, rewritten to the plugin-relative root
    let definition_root = root.child("definition");
    let mut definition = elektra_ks.below(&definition_root);
    definition.rename(&definition_root, &KeyName::root(Namespace::Cascading));

    Ok(Some(Backend::new(
        mountpoint,
        backend_plugin,
        Arc::new(plugins),
        definition,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::warning_count;

    fn config_keys(entries: &[(&str, &str)]) -> KeySet {
        entries
            .iter()
            .map(|(name, value)| Key::parse(name).unwrap().with_string(*value))
            .collect()
    }

    fn registry() -> ModuleRegistry {
        ModuleRegistry::with_builtins(&Config::default())
    }

    #[test]
    fn empty_configuration_parses_to_empty_table() {
        let mut error_key = Key::parse("/").unwrap();
        let table = parse_mountpoints(&KeySet::new(), &registry(), &mut error_key).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn parses_a_simple_mountpoint() {
        let ks = config_keys(&[
            ("system:/elektra/mountpoints/user:\\/app/backend", "#2"),
            ("system:/elektra/mountpoints/user:\\/app/plugins/#0/name", "resolver"),
            ("system:/elektra/mountpoints/user:\\/app/plugins/#1/name", "storage"),
            ("system:/elektra/mountpoints/user:\\/app/plugins/#2/name", "backend"),
            ("system:/elektra/mountpoints/user:\\/app/definition/path", "app.ecf"),
            (
                "system:/elektra/mountpoints/user:\\/app/definition/positions/get/resolver",
                "#0",
            ),
        ]);

        let mut error_key = Key::parse("/").unwrap();
        let table = parse_mountpoints(&ks, &registry(), &mut error_key).unwrap();

        assert_eq!(table.len(), 1);
        let mountpoint = KeyName::parse("user:/app").unwrap();
        let backend = table.by_mountpoint(&mountpoint).unwrap();
        assert_eq!(backend.plugins().len(), 3);

        // the definition was rewritten to the plugin-relative root
        let path = KeyName::parse("/path").unwrap();
        assert_eq!(
            backend.definition().lookup(&path).unwrap().as_string(),
            Some("app.ecf")
        );
    }

    #[test]
    fn reserved_mountpoints_are_dropped_with_a_warning() {
        let ks = config_keys(&[
            (
                "system:/elektra/mountpoints/system:\\/elektra\\/foo/backend",
                "#0",
            ),
            (
                "system:/elektra/mountpoints/system:\\/elektra\\/foo/plugins/#0/name",
                "backend",
            ),
        ]);

        let mut error_key = Key::parse("/").unwrap();
        let table = parse_mountpoints(&ks, &registry(), &mut error_key).unwrap();

        assert!(table.is_empty());
        assert_eq!(warning_count(&error_key), 1);
    }

    #[test]
    fn missing_backend_reference_fails() {
        let ks = config_keys(&[(
            "system:/elektra/mountpoints/user:\\/app/plugins/#0/name",
            "storage",
        )]);

        let mut error_key = Key::parse("/").unwrap();
        let err = parse_mountpoints(&ks, &registry(), &mut error_key).unwrap_err();
        assert!(matches!(err, KdbError::Installation { .. }));
        assert_eq!(warning_count(&error_key), 1);
    }

    #[test]
    fn unknown_plugin_name_fails() {
        let ks = config_keys(&[
            ("system:/elektra/mountpoints/user:\\/app/backend", "#0"),
            ("system:/elektra/mountpoints/user:\\/app/plugins/#0/name", "nosuch"),
        ]);

        let mut error_key = Key::parse("/").unwrap();
        assert!(parse_mountpoints(&ks, &registry(), &mut error_key).is_err());
    }

    #[test]
    fn invalid_mountpoint_name_fails() {
        let ks = config_keys(&[(
            "system:/elektra/mountpoints/notaname/backend",
            "#0",
        )]);

        let mut error_key = Key::parse("/").unwrap();
        assert!(parse_mountpoints(&ks, &registry(), &mut error_key).is_err());
    }
}
