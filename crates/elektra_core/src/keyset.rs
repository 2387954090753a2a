//! Ordered sets of keys.
//!
//! A [`KeySet`] keeps its keys sorted by canonical name order and unique by
//! name. Keys are shared via `Arc`; mutating a shared key through a key set
//! duplicates it first, so other holders never observe the change.
//!
//! Besides pure iteration, a legacy in-set cursor is kept; its only
//! remaining purpose is error reporting (which key triggered an error).
//! Insertions and removals invalidate the cursor, callers re-rewind.

use crate::key::name::{KeyName, Namespace};
use crate::key::Key;
use std::ops::Range;
use std::sync::Arc;

/// An ordered collection of keys with set semantics on the name.
#[derive(Debug, Clone, Default)]
pub struct KeySet {
    keys: Vec<Arc<Key>>,
    cursor: Option<usize>,
    needs_sync: bool,
}

impl KeySet {
    /// Creates an empty key set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty key set with reserved capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            keys: Vec::with_capacity(capacity),
            cursor: None,
            needs_sync: false,
        }
    }

    /// Returns the number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns true if the set contains no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn position(&self, name: &KeyName) -> Result<usize, usize> {
        self.keys.binary_search_by(|k| k.name().cmp(name))
    }

    /// Appends a key, replacing any key with the same name.
    pub fn append(&mut self, key: Key) {
        self.append_shared(Arc::new(key));
    }

    /// Appends an already shared key, replacing any key with the same name.
    pub fn append_shared(&mut self, key: Arc<Key>) {
        match self.position(key.name()) {
            Ok(i) => self.keys[i] = key,
            Err(i) => self.keys.insert(i, key),
        }
        self.cursor = None;
        self.needs_sync = true;
    }

    /// Appends all keys of another set, replacing duplicates by name.
    pub fn append_all(&mut self, other: &KeySet) {
        for key in &other.keys {
            self.append_shared(Arc::clone(key));
        }
    }

    /// Looks up a key by name.
    ///
    /// A cascading name first matches a stored cascading key, then searches
    /// the namespaces `proc dir user system spec default` in that order.
    #[must_use]
    pub fn lookup(&self, name: &KeyName) -> Option<&Arc<Key>> {
        let index = self.lookup_index(name)?;
        self.keys.get(index)
    }

    fn lookup_index(&self, name: &KeyName) -> Option<usize> {
        if name.namespace() == Namespace::Cascading {
            if let Ok(i) = self.position(name) {
                return Some(i);
            }
            for ns in Namespace::CASCADING_ORDER {
                if let Ok(i) = self.position(&name.with_namespace(ns)) {
                    return Some(i);
                }
            }
            return None;
        }
        self.position(name).ok()
    }

    /// Looks up a key and returns a mutable reference, duplicating the key
    /// first if it is shared with another set.
    pub fn lookup_mut(&mut self, name: &KeyName) -> Option<&mut Key> {
        let index = self.lookup_index(name)?;
        Some(Arc::make_mut(&mut self.keys[index]))
    }

    /// Returns the key at an index.
    #[must_use]
    pub fn at(&self, index: usize) -> Option<&Arc<Key>> {
        self.keys.get(index)
    }

    /// Iterates over the keys in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Key>> {
        self.keys.iter()
    }

    /// Removes a key by exact name and returns it.
    pub fn remove(&mut self, name: &KeyName) -> Option<Arc<Key>> {
        let i = self.position(name).ok()?;
        self.cursor = None;
        self.needs_sync = true;
        Some(self.keys.remove(i))
    }

    /// Returns the index range of all keys below-or-same as `parent`.
    #[must_use]
    pub fn find_hierarchy(&self, parent: &KeyName) -> Range<usize> {
        let start = self
            .keys
            .partition_point(|k| k.name() < parent && !k.name().is_below(parent));
        let mut end = start;
        while end < self.keys.len() && self.keys[end].name().is_below_or_same(parent) {
            end += 1;
        }
        start..end
    }

    /// Removes and returns the subtree rooted at `parent` (inclusive).
    pub fn cut(&mut self, parent: &KeyName) -> KeySet {
        let range = self.find_hierarchy(parent);
        if range.is_empty() {
            return KeySet::new();
        }
        let keys: Vec<Arc<Key>> = self.keys.drain(range).collect();
        self.cursor = None;
        self.needs_sync = true;
        KeySet {
            keys,
            cursor: None,
            needs_sync: false,
        }
    }

    /// Returns a copy of the subtree rooted at `parent` (inclusive) without
    /// removing it. The keys are shared, not duplicated.
    #[must_use]
    pub fn below(&self, parent: &KeyName) -> KeySet {
        let range = self.find_hierarchy(parent);
        KeySet {
            keys: self.keys[range].to_vec(),
            cursor: None,
            needs_sync: false,
        }
    }

    /// Rewrites the names of all keys below-or-same as `old` to be below
    /// `new` instead.
    pub fn rename(&mut self, old: &KeyName, new: &KeyName) {
        let range = self.find_hierarchy(old);
        if range.is_empty() {
            return;
        }
        let mut moved: Vec<Arc<Key>> = self.keys.drain(range).collect();
        for key in &mut moved {
            if let Some(name) = key.name().replace_prefix(old, new) {
                Arc::make_mut(key).set_name_internal(name);
            }
        }
        for key in moved {
            self.append_shared(key);
        }
    }

    /// Removes all keys.
    pub fn clear(&mut self) {
        if !self.keys.is_empty() {
            self.needs_sync = true;
        }
        self.keys.clear();
        self.cursor = None;
    }

    /// Returns a deep copy: every key is duplicated instead of shared.
    ///
    /// Used by the write pipeline so that plugin transformations of the
    /// on-disk representation never leak back into the caller's keys.
    #[must_use]
    pub fn deep_dup(&self) -> KeySet {
        KeySet {
            keys: self
                .keys
                .iter()
                .map(|k| Arc::new(Key::clone(k)))
                .collect(),
            cursor: None,
            needs_sync: self.needs_sync,
        }
    }

    /// Rewinds the legacy cursor.
    pub fn rewind(&mut self) {
        self.cursor = None;
    }

    /// Advances the legacy cursor and returns the key it lands on.
    pub fn next_key(&mut self) -> Option<Arc<Key>> {
        let next = match self.cursor {
            None => 0,
            Some(i) => i + 1,
        };
        if next >= self.keys.len() {
            self.cursor = None;
            return None;
        }
        self.cursor = Some(next);
        Some(Arc::clone(&self.keys[next]))
    }

    /// Returns the key under the legacy cursor.
    #[must_use]
    pub fn current(&self) -> Option<&Arc<Key>> {
        self.keys.get(self.cursor?)
    }

    /// Returns true if the set itself was structurally modified since the
    /// flag was last cleared.
    #[must_use]
    pub fn needs_sync(&self) -> bool {
        self.needs_sync
    }

    /// Returns true if any contained key carries the sync mark.
    #[must_use]
    pub fn any_key_needs_sync(&self) -> bool {
        self.keys.iter().any(|k| k.needs_sync())
    }

    pub(crate) fn set_needs_sync(&mut self, value: bool) {
        self.needs_sync = value;
    }

    /// Clears the sync mark on the set and on every contained key.
    pub(crate) fn clear_sync_flags(&mut self) {
        self.needs_sync = false;
        for key in &mut self.keys {
            if key.needs_sync() {
                Arc::make_mut(key).set_needs_sync(false);
            }
        }
    }

    /// Marks the value and metadata of every key read-only (or writable
    /// again). Used by the orchestrator around the storage phases of a
    /// write.
    pub(crate) fn set_read_only(&mut self, value: bool) {
        for key in &mut self.keys {
            let key = Arc::make_mut(key);
            key.set_read_only_value(value);
            key.set_read_only_meta(value);
        }
    }
}

impl FromIterator<Key> for KeySet {
    fn from_iter<T: IntoIterator<Item = Key>>(iter: T) -> Self {
        let mut ks = KeySet::new();
        for key in iter {
            ks.append(key);
        }
        ks.needs_sync = false;
        ks
    }
}

impl PartialEq for KeySet {
    /// Key sets compare by content; cursor and sync marks do not take part.
    fn eq(&self, other: &Self) -> bool {
        self.keys == other.keys
    }
}

impl Eq for KeySet {}
