//! End-to-end scenarios against sandboxed sessions.

use elektra_core::error::{error_number, warning_count};
use elektra_core::{GetOutcome, KdbError, Key, KeyName, KeySet, SetOutcome};
use elektra_testkit::prelude::*;

fn parse_name(name: &str) -> KeyName {
    KeyName::parse(name).unwrap()
}

#[test]
fn bootstrap_on_empty_configuration() {
    let mut test = TestKdb::open();

    let mut ks = KeySet::new();
    let mut parent = Key::parse("/").unwrap();
    let outcome = test.kdb.get(&mut ks, &mut parent).unwrap();

    assert_eq!(outcome, GetOutcome::Updated);
    assert!(ks.is_empty());
    // no error metadata after a successful call
    assert_eq!(error_number(&parent), None);
}

#[test]
fn simple_set_and_get() {
    let mut test = TestKdb::open();

    let mut ks = KeySet::new();
    let mut parent = Key::parse("user:/app").unwrap();
    test.kdb.get(&mut ks, &mut parent).unwrap();
    assert!(ks.is_empty());

    ks.append(Key::parse("user:/app/name").unwrap().with_string("x"));
    ks.append(Key::parse("user:/app/size").unwrap().with_string("7"));
    let outcome = test.kdb.set(&mut ks, &mut parent).unwrap();

    assert_eq!(outcome, SetOutcome::Committed);
    assert!(!ks.any_key_needs_sync(), "sync marks are cleared on commit");
    assert!(test.base().join("user/default.ecf").exists());

    // a second get on the same handle reports no change and leaves the
    // key set alone
    let outcome = test.kdb.get(&mut ks, &mut parent).unwrap();
    assert_eq!(outcome, GetOutcome::Unchanged);
    assert_eq!(ks.len(), 2);
    assert_eq!(
        ks.lookup(&parse_name("user:/app/name")).unwrap().as_string(),
        Some("x")
    );
    assert_eq!(
        ks.lookup(&parse_name("user:/app/size")).unwrap().as_string(),
        Some("7")
    );
}

#[test]
fn round_trip_preserves_values_and_metadata() {
    let test = TestKdb::open();
    let mut h1 = test.second_handle();

    let mut ks = KeySet::new();
    let mut parent = Key::parse("user:/app").unwrap();
    h1.get(&mut ks, &mut parent).unwrap();

    ks.append(
        Key::parse("user:/app/typed")
            .unwrap()
            .with_string("1500")
            .with_meta("meta:/type", "long"),
    );
    let mut blob = Key::parse("user:/app/a\\/slash").unwrap();
    blob.set_binary(vec![0, 159, 146, 150]).unwrap();
    ks.append(blob);
    h1.set(&mut ks, &mut parent).unwrap();

    // an independent handle sees exactly the written state
    let mut h2 = test.second_handle();
    let mut fresh = KeySet::new();
    let mut parent2 = Key::parse("user:/app").unwrap();
    h2.get(&mut fresh, &mut parent2).unwrap();

    let typed = fresh.lookup(&parse_name("user:/app/typed")).unwrap();
    assert_eq!(typed.as_string(), Some("1500"));
    assert_eq!(typed.meta("meta:/type"), Some("long"));
    assert!(!typed.needs_sync());

    let blob = fresh.lookup(&parse_name("user:/app/a\\/slash")).unwrap();
    assert_eq!(blob.as_binary(), Some(&[0u8, 159, 146, 150][..]));
}

#[test]
fn failed_storage_rolls_back_all_backends() {
    let mut test = TestKdb::open_with(|mounts, registry| {
        mounts.add_mountpoint("user:/a", "a.ecf");
        mounts.add_mountpoint_with_storage("user:/b", "b.ecf", "crashstorage");
        mounts.add_raw("user:/b", &["plugins", "#1", "config", "fail"], "set");
        registry.register("crashstorage", || Box::new(CrashStorage::new()));
    });

    let mut ks = KeySet::new();
    let mut parent = Key::parse("user:/").unwrap();
    test.kdb.get(&mut ks, &mut parent).unwrap();

    ks.append(Key::parse("user:/a/k").unwrap().with_string("1"));
    ks.append(Key::parse("user:/b/k").unwrap().with_string("2"));
    let err = test.kdb.set(&mut ks, &mut parent).unwrap_err();
    assert!(matches!(err, KdbError::Resource { .. }), "got {err:?}");
    assert!(error_number(&parent).is_some());

    // the healthy backend was rolled back along with the failing one
    assert!(!test.base().join("user/a.ecf").exists());
    assert!(!test.base().join("user/a.ecf.tmp").exists());
    assert!(!test.base().join("user/b.ecf").exists());
    assert!(!test.base().join("user/b.ecf.tmp").exists());

    // an independent handle observes exactly the state before the set
    let mut h2 = test
        .second_handle_with(|r| r.register("crashstorage", || Box::new(CrashStorage::new())));
    let mut fresh = KeySet::new();
    let mut parent2 = Key::parse("user:/").unwrap();
    h2.get(&mut fresh, &mut parent2).unwrap();
    assert!(fresh.below(&parse_name("user:/a")).is_empty());
    assert!(fresh.below(&parse_name("user:/b")).is_empty());
}

#[test]
fn reserved_mountpoints_warn_and_are_dropped() {
    let mut test = TestKdb::open_with(|mounts, _| {
        mounts.add_mountpoint("system:/elektra/foo", "evil.ecf");
    });

    assert!(warning_count(&test.error_key) >= 1);
    assert!(test
        .kdb
        .mount_table()
        .by_mountpoint(&parse_name("system:/elektra/foo"))
        .is_none());

    // system:/elektra/version cannot be shadowed
    let mut ks = KeySet::new();
    let mut parent = Key::parse("system:/elektra/version").unwrap();
    test.kdb.get(&mut ks, &mut parent).unwrap();
    assert!(ks
        .lookup(&parse_name(
            "system:/elektra/version/constants/KDB_VERSION"
        ))
        .is_some());
}

#[test]
fn set_without_get_conflicts() {
    let test = TestKdb::open();
    let mut h2 = test.second_handle();

    let mut ks = KeySet::new();
    ks.append(Key::parse("user:/c/k").unwrap().with_string("1"));
    let mut parent = Key::parse("user:/c").unwrap();

    let err = h2.set(&mut ks, &mut parent).unwrap_err();
    assert!(matches!(err, KdbError::ConflictingState { .. }));
    assert_eq!(error_number(&parent), Some("C02000"));
    assert!(!test.base().join("user/default.ecf").exists());
}

#[test]
fn concurrent_writer_conflicts() {
    let mut test = TestKdb::open();
    let mut h2 = test.second_handle();

    let mut ks1 = KeySet::new();
    let mut p1 = Key::parse("user:/c").unwrap();
    test.kdb.get(&mut ks1, &mut p1).unwrap();

    let mut ks2 = KeySet::new();
    let mut p2 = Key::parse("user:/c").unwrap();
    h2.get(&mut ks2, &mut p2).unwrap();

    // the first handle commits
    ks1.append(Key::parse("user:/c/k").unwrap().with_string("h1"));
    test.kdb.set(&mut ks1, &mut p1).unwrap();

    // the second handle writes without re-reading
    ks2.append(Key::parse("user:/c/k").unwrap().with_string("h2"));
    let err = h2.set(&mut ks2, &mut p2).unwrap_err();
    assert!(matches!(err, KdbError::ConflictingState { .. }));

    // the first writer's state survives
    let mut h3 = test.second_handle();
    let mut fresh = KeySet::new();
    let mut p3 = Key::parse("user:/c").unwrap();
    h3.get(&mut fresh, &mut p3).unwrap();
    assert_eq!(
        fresh.lookup(&parse_name("user:/c/k")).unwrap().as_string(),
        Some("h1")
    );
}

#[test]
fn read_only_backend_drops_writes_with_a_warning() {
    let mut test = TestKdb::open_with(|mounts, _| {
        mounts.add_read_only_mountpoint("user:/ro", "ro.ecf");
    });

    let mut ks = KeySet::new();
    let mut parent = Key::parse("user:/ro").unwrap();
    test.kdb.get(&mut ks, &mut parent).unwrap();

    ks.append(Key::parse("user:/ro/k").unwrap().with_string("v"));
    let outcome = test.kdb.set(&mut ks, &mut parent).unwrap();
    assert_eq!(outcome, SetOutcome::NoChange);
    assert_eq!(warning_count(&parent), 1);
    assert!(!test.base().join("user/ro.ecf").exists());

    // a following get returns the unchanged prior state
    let outcome = test.kdb.get(&mut ks, &mut parent).unwrap();
    assert_eq!(outcome, GetOutcome::Unchanged);
}

#[test]
fn nested_mountpoints_partition_keys() {
    let mut test = TestKdb::open_with(|mounts, _| {
        mounts.add_mountpoint("user:/a", "a.ecf");
        mounts.add_mountpoint("user:/a/b", "b.ecf");
    });

    let mut ks = KeySet::new();
    let mut parent = Key::parse("user:/a").unwrap();
    test.kdb.get(&mut ks, &mut parent).unwrap();

    ks.append(Key::parse("user:/a/x").unwrap().with_string("shallow"));
    ks.append(Key::parse("user:/a/b/y").unwrap().with_string("deep"));
    test.kdb.set(&mut ks, &mut parent).unwrap();

    // each key went to the deepest mounted ancestor
    let a = std::fs::read_to_string(test.base().join("user/a.ecf")).unwrap();
    assert!(a.contains("k /x"));
    assert!(!a.contains("k /b/y"));

    let b = std::fs::read_to_string(test.base().join("user/b.ecf")).unwrap();
    assert!(b.contains("k /y"));
}

#[test]
fn keys_deleted_by_another_writer_vanish_from_the_result() {
    let mut test = TestKdb::open();
    let mut h2 = test.second_handle();

    // first handle creates a key, second handle sees it
    let mut ks1 = KeySet::new();
    let mut p1 = Key::parse("user:/d").unwrap();
    test.kdb.get(&mut ks1, &mut p1).unwrap();
    ks1.append(Key::parse("user:/d/k").unwrap().with_string("v"));
    test.kdb.set(&mut ks1, &mut p1).unwrap();

    let mut ks2 = KeySet::new();
    let mut p2 = Key::parse("user:/d").unwrap();
    h2.get(&mut ks2, &mut p2).unwrap();
    assert!(ks2.lookup(&parse_name("user:/d/k")).is_some());

    // first handle deletes the key
    ks1.remove(&parse_name("user:/d/k"));
    test.kdb.set(&mut ks1, &mut p1).unwrap();

    // the second handle's next get drops it from the result
    let outcome = h2.get(&mut ks2, &mut p2).unwrap();
    assert_eq!(outcome, GetOutcome::Updated);
    assert!(ks2.lookup(&parse_name("user:/d/k")).is_none());
}

#[test]
fn meta_namespace_parents_are_rejected() {
    let mut test = TestKdb::open();

    let mut ks = KeySet::new();
    let mut parent = Key::parse("meta:/nope").unwrap();

    let err = test.kdb.get(&mut ks, &mut parent).unwrap_err();
    assert!(matches!(err, KdbError::Interface { .. }));
    assert_eq!(error_number(&parent), Some("C01310"));
}

#[test]
fn errors_are_cleared_before_each_call() {
    let mut test = TestKdb::open();

    // force an interface error
    let mut ks = KeySet::new();
    let mut parent = Key::parse("meta:/nope").unwrap();
    test.kdb.get(&mut ks, &mut parent).unwrap_err();
    assert!(error_number(&parent).is_some());

    // a successful call on the same key clears the stale diagnostics
    parent.set_name(KeyName::parse("user:/ok").unwrap()).unwrap();
    test.kdb.get(&mut ks, &mut parent).unwrap();
    assert_eq!(error_number(&parent), None);
    assert_eq!(warning_count(&parent), 0);
}
