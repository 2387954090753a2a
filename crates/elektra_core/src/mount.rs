//! The mount table.
//!
//! All backends of a session, sorted by mountpoint name, with
//! namespace-aware queries: find the deepest mounted ancestor of a name,
//! select the backends an operation touches, divide a key set among
//! backends by ownership, and merge the per-backend working sets back
//! together.
//!
//! Every concrete namespace root is mounted by a hard-coded backend at
//! session open, so ownership resolution always succeeds for keys in those
//! namespaces.

use crate::backend::Backend;
use crate::error::{KdbError, KdbResult};
use crate::key::name::{KeyName, Namespace};
use crate::keyset::KeySet;
use std::sync::Arc;

/// The set of all backends, indexed by mountpoint.
#[derive(Debug, Default)]
pub struct MountTable {
    backends: Vec<Backend>,
}

impl MountTable {
    /// Creates an empty mount table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of mounted backends.
    #[must_use]
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Returns true if nothing is mounted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Inserts a backend, replacing any backend with the same mountpoint.
    pub fn insert(&mut self, backend: Backend) {
        match self
            .backends
            .binary_search_by(|b| b.mountpoint.cmp(&backend.mountpoint))
        {
            Ok(i) => self.backends[i] = backend,
            Err(i) => self.backends.insert(i, backend),
        }
    }

    /// Returns the backend at an index.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Backend> {
        self.backends.get(index)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut Backend> {
        self.backends.get_mut(index)
    }

    /// Returns the backend mounted exactly at a mountpoint.
    #[must_use]
    pub fn by_mountpoint(&self, mountpoint: &KeyName) -> Option<&Backend> {
        let i = self
            .backends
            .binary_search_by(|b| b.mountpoint.cmp(mountpoint))
            .ok()?;
        self.backends.get(i)
    }

    /// Iterates over all backends in mountpoint order.
    pub fn iter(&self) -> impl Iterator<Item = &Backend> {
        self.backends.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Backend> {
        self.backends.iter_mut()
    }

    pub(crate) fn into_backends(self) -> Vec<Backend> {
        self.backends
    }

    /// Finds the backend owning a name: the deepest mounted ancestor.
    ///
    /// Cascading names have no owner; they select across namespaces
    /// instead.
    #[must_use]
    pub fn find_parent(&self, name: &KeyName) -> Option<usize> {
        if name.namespace() == Namespace::Cascading {
            return None;
        }
        let mut candidate = name.clone();
        loop {
            if let Ok(i) = self
                .backends
                .binary_search_by(|b| b.mountpoint.cmp(&candidate))
            {
                return Some(i);
            }
            candidate = candidate.parent()?;
        }
    }

    /// Selects the backends an operation bounded by `parent` touches: every
    /// backend whose mountpoint lies in the parent's subtree, plus the
    /// backend owning the parent itself.
    ///
    /// A cascading parent selects across all concrete namespaces but never
    /// the reserved `system:/elektra` subtree.
    #[must_use]
    pub fn selection_for(&self, parent: &KeyName) -> Vec<usize> {
        if parent.namespace() == Namespace::Cascading {
            let reserved = elektra_root();
            let mut selection = Vec::new();
            for ns in [
                Namespace::Spec,
                Namespace::Proc,
                Namespace::Dir,
                Namespace::User,
                Namespace::System,
                Namespace::Default,
            ] {
                for index in self.selection_for_concrete(&parent.with_namespace(ns)) {
                    if self.backends[index].mountpoint.is_below_or_same(&reserved) {
                        continue;
                    }
                    if !selection.contains(&index) {
                        selection.push(index);
                    }
                }
            }
            selection.sort_unstable();
            return selection;
        }
        self.selection_for_concrete(parent)
    }

    fn selection_for_concrete(&self, parent: &KeyName) -> Vec<usize> {
        let mut selection: Vec<usize> = (0..self.backends.len())
            .filter(|&i| self.backends[i].mountpoint.is_below_or_same(parent))
            .collect();
        if let Some(owner) = self.find_parent(parent) {
            if !selection.contains(&owner) {
                selection.push(owner);
                selection.sort_unstable();
            }
        }
        selection
    }

    /// Divides a key set among the selected backends by ownership.
    ///
    /// Each selected backend's working set is replaced by its share. Keys
    /// owned by an unselected backend are skipped: they belong to subtrees
    /// the operation does not touch. The per-backend `needs_update` mark is
    /// set when the share differs from the previous working set (new or
    /// missing names, or a key carrying the sync mark).
    ///
    /// # Errors
    ///
    /// Returns an internal error for a key that no backend owns.
    pub fn divide(&mut self, selection: &[usize], ks: &KeySet) -> KdbResult<()> {
        let mut shares: Vec<KeySet> = selection.iter().map(|_| KeySet::new()).collect();

        for key in ks.iter() {
            let owner = self.find_parent(key.name()).ok_or_else(|| {
                KdbError::internal(format!(
                    "no backend owns the key '{}'; the mount table is incomplete",
                    key.name()
                ))
            })?;
            if let Some(slot) = selection.iter().position(|&i| i == owner) {
                shares[slot].append_shared(Arc::clone(key));
            }
        }

        for (slot, &index) in selection.iter().enumerate() {
            let share = std::mem::take(&mut shares[slot]);
            let backend = &mut self.backends[index];
            backend.needs_update = share.any_key_needs_sync() || !same_names(&share, &backend.keys);
            backend.keys = share;
        }

        Ok(())
    }

    /// Merges the working sets of the selected backends into one key set.
    pub fn merge(&self, selection: &[usize], into: &mut KeySet) {
        for &index in selection {
            into.append_all(&self.backends[index].keys);
        }
    }
}

fn same_names(a: &KeySet, b: &KeySet) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| x.name() == y.name())
}

/// Returns the reserved `system:/elektra` root name.
#[must_use]
pub fn elektra_root() -> KeyName {
    KeyName::from_parts(Namespace::System, ["elektra"])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Key;
    use crate::plugin::{plugin_handle, Capabilities, Plugin};
    use std::collections::BTreeMap;

    struct NullPlugin;

    impl Plugin for NullPlugin {
        fn name(&self) -> &str {
            "null"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::none()
        }

        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
    }

    fn backend(mountpoint: &str) -> Backend {
        Backend::new(
            KeyName::parse(mountpoint).unwrap(),
            plugin_handle(Box::new(NullPlugin)),
            Arc::new(BTreeMap::new()),
            KeySet::new(),
        )
    }

    fn table(mountpoints: &[&str]) -> MountTable {
        let mut table = MountTable::new();
        for mp in mountpoints {
            table.insert(backend(mp));
        }
        table
    }

    #[test]
    fn find_parent_picks_deepest_ancestor() {
        let table = table(&["user:/", "user:/a", "user:/a/b"]);

        let name = KeyName::parse("user:/a/b/c/d").unwrap();
        let owner = table.find_parent(&name).unwrap();
        assert_eq!(table.get(owner).unwrap().mountpoint().to_string(), "user:/a/b");

        let name = KeyName::parse("user:/x").unwrap();
        let owner = table.find_parent(&name).unwrap();
        assert_eq!(table.get(owner).unwrap().mountpoint().to_string(), "user:/");
    }

    #[test]
    fn every_key_has_exactly_one_owner() {
        let table = table(&["user:/", "user:/a", "user:/a/b", "system:/"]);
        for name in ["user:/a", "user:/a/b", "user:/a/c", "user:/z", "system:/q"] {
            let name = KeyName::parse(name).unwrap();
            assert!(table.find_parent(&name).is_some(), "no owner for {name}");
        }
    }

    #[test]
    fn selection_includes_subtree_and_owner() {
        let table = table(&["user:/", "user:/app", "user:/app/deep", "user:/other"]);

        let parent = KeyName::parse("user:/app").unwrap();
        let selection = table.selection_for(&parent);
        let names: Vec<String> = selection
            .iter()
            .map(|&i| table.get(i).unwrap().mountpoint().to_string())
            .collect();
        assert_eq!(names, ["user:/app", "user:/app/deep"]);

        // a parent between mountpoints selects only its owner
        let parent = KeyName::parse("user:/other/below").unwrap();
        let selection = table.selection_for(&parent);
        let names: Vec<String> = selection
            .iter()
            .map(|&i| table.get(i).unwrap().mountpoint().to_string())
            .collect();
        assert_eq!(names, ["user:/other"]);
    }

    #[test]
    fn cascading_selection_skips_reserved_subtree() {
        let table = table(&["user:/", "system:/", "system:/elektra", "system:/elektra/version"]);

        let parent = KeyName::parse("/").unwrap();
        let selection = table.selection_for(&parent);
        let names: Vec<String> = selection
            .iter()
            .map(|&i| table.get(i).unwrap().mountpoint().to_string())
            .collect();
        assert_eq!(names, ["user:/", "system:/"]);
    }

    #[test]
    fn divide_assigns_by_deepest_owner() {
        let mut table = table(&["user:/", "user:/a"]);
        let selection = table.selection_for(&KeyName::parse("user:/").unwrap());

        let mut ks = KeySet::new();
        ks.append(Key::parse("user:/a/x").unwrap().with_string("1"));
        ks.append(Key::parse("user:/y").unwrap().with_string("2"));

        table.divide(&selection, &ks).unwrap();

        let a = table.by_mountpoint(&KeyName::parse("user:/a").unwrap()).unwrap();
        let root = table.by_mountpoint(&KeyName::parse("user:/").unwrap()).unwrap();
        assert_eq!(a.keys().len(), 1);
        assert_eq!(root.keys().len(), 1);
    }

    #[test]
    fn divide_fails_for_unowned_namespace() {
        let mut table = table(&["user:/"]);
        let selection = vec![0];

        let mut ks = KeySet::new();
        ks.append(Key::parse("proc:/args").unwrap());

        assert!(table.divide(&selection, &ks).is_err());
    }

    #[test]
    fn divide_tracks_changes() {
        let mut table = table(&["user:/"]);
        let selection = vec![0];

        let mut ks = KeySet::new();
        ks.append(Key::parse("user:/k").unwrap().with_string("v"));
        table.divide(&selection, &ks).unwrap();
        assert!(table.get(0).unwrap().needs_update);

        // same content, sync flags cleared: nothing to do
        let mut clean = ks.deep_dup();
        clean.clear_sync_flags();
        table.get_mut(0).unwrap().keys.clear_sync_flags();
        table.divide(&selection, &clean).unwrap();
        assert!(!table.get(0).unwrap().needs_update);

        // a removed key is a change even though no key is dirty
        let empty = KeySet::new();
        table.divide(&selection, &empty).unwrap();
        assert!(table.get(0).unwrap().needs_update);
    }

    #[test]
    fn merge_concatenates_working_sets() {
        let mut table = table(&["user:/", "user:/a"]);
        let selection = table.selection_for(&KeyName::parse("user:/").unwrap());

        let mut ks = KeySet::new();
        ks.append(Key::parse("user:/a/x").unwrap());
        ks.append(Key::parse("user:/y").unwrap());
        table.divide(&selection, &ks).unwrap();

        let mut merged = KeySet::new();
        table.merge(&selection, &mut merged);
        assert_eq!(merged.len(), 2);
    }
}
