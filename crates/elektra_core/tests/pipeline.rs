//! Pipeline mechanics: phase ordering, rollback sequencing, contracts,
//! global plugins and introspection mountpoints.

use elektra_core::error::error_number;
use elektra_core::{
    Config, GlobalPosition, Kdb, KdbError, Key, KeyName, KeySet, ModuleRegistry, SubPosition,
    GLOBAL_FAILED_PHASE_KEY,
};
use elektra_testkit::prelude::*;
use std::sync::Arc;
use tempfile::TempDir;

fn parse_name(name: &str) -> KeyName {
    KeyName::parse(name).unwrap()
}

fn wire_recorder(mounts: &mut MountConfig, mountpoint: &str) {
    mounts.add_raw(mountpoint, &["plugins", "#3", "name"], "recorder");
    for position in [
        ["definition", "positions", "get", "prestorage", "#0"],
        ["definition", "positions", "get", "poststorage", "#0"],
        ["definition", "positions", "set", "prestorage", "#0"],
        ["definition", "positions", "set", "poststorage", "#0"],
        ["definition", "positions", "set", "precommit", "#0"],
        ["definition", "positions", "set", "postcommit", "#0"],
        ["definition", "positions", "set", "prerollback", "#0"],
        ["definition", "positions", "set", "postrollback", "#0"],
    ] {
        mounts.add_raw(mountpoint, &position, "#3");
    }
}

#[test]
fn phases_run_in_the_defined_order() {
    let log = phase_log();
    let registered = log.clone();

    let mut test = TestKdb::open_with(move |mounts, registry| {
        mounts.add_mountpoint("user:/app", "app.ecf");
        wire_recorder(mounts, "user:/app");
        registry.register("recorder", move || {
            Box::new(PhaseRecorder::new(registered.clone()))
        });
    });

    let mut ks = KeySet::new();
    let mut parent = Key::parse("user:/app").unwrap();
    test.kdb.get(&mut ks, &mut parent).unwrap();

    assert_eq!(
        log.lock().as_slice(),
        ["get:prestorage", "get:poststorage"]
    );

    log.lock().clear();
    ks.append(Key::parse("user:/app/k").unwrap().with_string("v"));
    test.kdb.set(&mut ks, &mut parent).unwrap();

    assert_eq!(
        log.lock().as_slice(),
        [
            "set:prestorage",
            "set:poststorage",
            "commit:precommit",
            "commit:postcommit",
        ]
    );
}

#[test]
fn rollback_runs_the_rollback_sequence_and_advertises_the_failed_phase() {
    let log = phase_log();
    let registered = log.clone();

    let mut test = TestKdb::open_with(move |mounts, registry| {
        mounts.add_mountpoint_with_storage("user:/app", "app.ecf", "crashstorage");
        mounts.add_raw("user:/app", &["plugins", "#1", "config", "fail"], "set");
        wire_recorder(mounts, "user:/app");
        registry.register("crashstorage", || Box::new(CrashStorage::new()));
        registry.register("recorder", move || {
            Box::new(PhaseRecorder::new(registered.clone()))
        });
    });

    let mut ks = KeySet::new();
    let mut parent = Key::parse("user:/app").unwrap();
    test.kdb.get(&mut ks, &mut parent).unwrap();

    log.lock().clear();
    ks.append(Key::parse("user:/app/k").unwrap().with_string("v"));
    test.kdb.set(&mut ks, &mut parent).unwrap_err();

    // the failure hit the storage phase: poststorage never ran, the
    // rollback sequence did
    assert_eq!(
        log.lock().as_slice(),
        ["set:prestorage", "error:prerollback", "error:postrollback"]
    );

    let global = test.kdb.global_keyset().lock();
    let failed = global.lookup(&parse_name(GLOBAL_FAILED_PHASE_KEY)).unwrap();
    assert_eq!(failed.as_string(), Some("storage"));
}

#[test]
fn open_without_a_contract_mounts_the_list_plugin_in_every_position() {
    let test = TestKdb::open();

    let table = test.kdb.global_plugins();
    let first = table
        .get(GlobalPosition::ALL[0], SubPosition::MaxOnce)
        .expect("the first maxonce slot must be occupied");
    assert_eq!(first.lock().name(), "list");

    // all ten cross-cutting positions hold the same instance
    for position in GlobalPosition::ALL {
        let plugin = table
            .get(position, SubPosition::MaxOnce)
            .unwrap_or_else(|| panic!("no plugin at position {}/maxonce", position.as_str()));
        assert!(
            Arc::ptr_eq(first, plugin),
            "position {} holds a different instance",
            position.as_str()
        );
    }
}

#[test]
fn contract_merges_global_keyset_and_mounts_global_plugins() {
    let base = TempDir::new().unwrap();
    let config = Config::sandboxed(base.path());

    let log = phase_log();
    let registered = log.clone();
    let mut registry = ModuleRegistry::with_builtins(&config);
    registry.register("recorder", move || {
        Box::new(PhaseRecorder::new(registered.clone()))
    });

    let mut contract = KeySet::new();
    contract.append(
        Key::parse("system:/elektra/contract/globalkeyset/mykey")
            .unwrap()
            .with_string("from contract"),
    );
    contract.append(Key::parse("system:/elektra/contract/mountglobal/recorder").unwrap());

    let mut error_key = Key::parse("/").unwrap();
    let mut kdb =
        Kdb::open_with_registry(config, registry, Some(&contract), &mut error_key).unwrap();

    {
        let global = kdb.global_keyset().lock();
        let key = global.lookup(&parse_name("system:/elektra/mykey")).unwrap();
        assert_eq!(key.as_string(), Some("from contract"));
    }

    // the globally mounted plugin runs around every get
    let mut ks = KeySet::new();
    let mut parent = Key::parse("user:/app").unwrap();
    kdb.get(&mut ks, &mut parent).unwrap();

    let seen = log.lock().clone();
    assert!(
        seen.contains(&"get:storage".to_string())
            && seen.contains(&"get:poststorage".to_string()),
        "global hooks did not run: {seen:?}"
    );

    kdb.close(&mut error_key);
}

#[test]
fn mounting_an_unknown_global_plugin_fails_open() {
    let base = TempDir::new().unwrap();
    let config = Config::sandboxed(base.path());

    let mut contract = KeySet::new();
    contract.append(Key::parse("system:/elektra/contract/mountglobal/nosuch").unwrap());

    let mut error_key = Key::parse("/").unwrap();
    let err = Kdb::open(config, Some(&contract), &mut error_key).unwrap_err();
    assert!(matches!(err, KdbError::Installation { .. }));
}

#[test]
fn broken_bootstrap_file_aborts_open() {
    let base = TempDir::new().unwrap();
    let config = Config::sandboxed(base.path());

    std::fs::create_dir_all(config.bootstrap_file.parent().unwrap()).unwrap();
    std::fs::write(&config.bootstrap_file, "this is not a storage file\n").unwrap();

    let mut error_key = Key::parse("/").unwrap();
    let err = Kdb::open(config, None, &mut error_key).unwrap_err();

    assert!(matches!(err, KdbError::Installation { .. }));
    assert_eq!(error_number(&error_key), Some("C01200"));
}

#[test]
fn module_introspection_is_served() {
    let mut test = TestKdb::open();

    let mut ks = KeySet::new();
    let mut parent = Key::parse("system:/elektra/modules/storage").unwrap();
    test.kdb.get(&mut ks, &mut parent).unwrap();

    assert!(ks
        .lookup(&parse_name("system:/elektra/modules/storage/exports/get"))
        .is_some());
    assert!(ks
        .lookup(&parse_name("system:/elektra/modules/storage/exports/set"))
        .is_some());
    // the storage plugin has no commit entry point
    assert!(ks
        .lookup(&parse_name("system:/elektra/modules/storage/exports/commit"))
        .is_none());
}

#[test]
fn version_keys_are_read_only_metadata_marked() {
    let mut test = TestKdb::open();

    let mut ks = KeySet::new();
    let mut parent = Key::parse("system:/elektra/version").unwrap();
    test.kdb.get(&mut ks, &mut parent).unwrap();

    let version = ks
        .lookup(&parse_name("system:/elektra/version/constants/KDB_VERSION"))
        .unwrap();
    assert_eq!(version.meta("meta:/restrict/write"), Some("1"));
    assert_eq!(version.meta("meta:/restrict/remove"), Some("1"));
}

#[test]
fn cascading_get_spans_namespaces() {
    let mut test = TestKdb::open();

    // write one key into user:/ and one into system:/
    let mut user_ks = KeySet::new();
    let mut user_parent = Key::parse("user:/app").unwrap();
    test.kdb.get(&mut user_ks, &mut user_parent).unwrap();
    user_ks.append(Key::parse("user:/app/k").unwrap().with_string("u"));
    test.kdb.set(&mut user_ks, &mut user_parent).unwrap();

    let mut system_ks = KeySet::new();
    let mut system_parent = Key::parse("system:/app").unwrap();
    test.kdb.get(&mut system_ks, &mut system_parent).unwrap();
    system_ks.append(Key::parse("system:/app/k").unwrap().with_string("s"));
    test.kdb.set(&mut system_ks, &mut system_parent).unwrap();

    // a cascading get on a fresh handle sees both namespaces
    let mut h2 = test.second_handle();
    let mut all = KeySet::new();
    let mut parent = Key::parse("/app").unwrap();
    h2.get(&mut all, &mut parent).unwrap();

    assert!(all.lookup(&parse_name("user:/app/k")).is_some());
    assert!(all.lookup(&parse_name("system:/app/k")).is_some());

    // a cascading lookup resolves through the namespace order
    assert_eq!(
        all.lookup(&parse_name("/app/k")).unwrap().as_string(),
        Some("u")
    );
}
