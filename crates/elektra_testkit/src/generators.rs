//! Property-based generators for key names.

use elektra_core::{KeyName, Namespace};
use proptest::prelude::*;

/// A strategy for a single unescaped path segment, including characters
/// that require escaping.
pub fn segment() -> impl Strategy<Value = String> {
    proptest::string::string_regex("[a-zA-Z0-9_#%./\\\\ -]{1,12}")
        .expect("valid segment regex")
        .prop_filter("segments must be non-empty", |s| !s.is_empty())
}

/// A strategy for a concrete namespace.
pub fn namespace() -> impl Strategy<Value = Namespace> {
    prop_oneof![
        Just(Namespace::Spec),
        Just(Namespace::Proc),
        Just(Namespace::Dir),
        Just(Namespace::User),
        Just(Namespace::System),
        Just(Namespace::Default),
    ]
}

/// A strategy for a key name with up to `depth` segments.
pub fn key_name(depth: usize) -> impl Strategy<Value = KeyName> {
    (namespace(), proptest::collection::vec(segment(), 0..=depth))
        .prop_map(|(ns, segments)| KeyName::from_parts(ns, segments))
}
