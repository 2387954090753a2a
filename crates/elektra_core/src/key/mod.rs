//! The key data model.
//!
//! A [`Key`] is an addressable configuration entry: a namespaced
//! hierarchical name, a value that is either a UTF-8 string or an opaque
//! byte buffer, and a set of metadata entries (themselves keys in the
//! `meta:/` namespace).
//!
//! Keys can be shared between several key sets; mutation through a key set
//! duplicates a shared key first (duplicate-on-write). The pipeline
//! orchestrator marks keys read-only while plugins execute; the fallible
//! setters enforce those marks.

pub mod name;

use crate::error::{KdbError, KdbResult};
use crate::keyset::KeySet;
use name::{KeyName, Namespace};

/// The value of a key: a UTF-8 string or an opaque byte buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyValue {
    /// A UTF-8 string value.
    String(String),
    /// An opaque binary value.
    Binary(Vec<u8>),
}

impl Default for KeyValue {
    fn default() -> Self {
        KeyValue::String(String::new())
    }
}

/// An addressable configuration entry.
#[derive(Debug, Clone)]
pub struct Key {
    name: KeyName,
    value: KeyValue,
    meta: KeySet,
    ro_name: bool,
    ro_value: bool,
    ro_meta: bool,
    needs_sync: bool,
}

impl Key {
    /// Creates a key with an empty string value.
    ///
    /// Fresh keys are marked as needing sync, they have never been
    /// persisted.
    #[must_use]
    pub fn new(name: KeyName) -> Self {
        Self {
            name,
            value: KeyValue::default(),
            meta: KeySet::new(),
            ro_name: false,
            ro_value: false,
            ro_meta: false,
            needs_sync: true,
        }
    }

    /// Creates a key from an escaped name.
    ///
    /// # Errors
    ///
    /// Returns an interface error if the name does not parse.
    pub fn parse(name: &str) -> KdbResult<Self> {
        let name = KeyName::parse(name).map_err(|e| KdbError::interface(e.to_string()))?;
        Ok(Self::new(name))
    }

    /// Sets the string value, consuming and returning the key.
    ///
    /// Intended for freshly constructed keys; read-only marks are not
    /// checked.
    #[must_use]
    pub fn with_string(mut self, value: impl Into<String>) -> Self {
        self.value = KeyValue::String(value.into());
        self.needs_sync = true;
        self
    }

    /// Sets a metadata entry, consuming and returning the key.
    ///
    /// Intended for freshly constructed keys. Invalid metadata names are
    /// ignored.
    #[must_use]
    pub fn with_meta(mut self, meta_name: &str, value: &str) -> Self {
        let _ = self.set_meta(meta_name, value);
        self
    }

    /// Returns the name.
    #[must_use]
    pub fn name(&self) -> &KeyName {
        &self.name
    }

    /// Replaces the name.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the name is marked read-only.
    pub fn set_name(&mut self, name: KeyName) -> KdbResult<()> {
        if self.ro_name {
            return Err(KdbError::internal(format!(
                "attempt to rename read-only key '{}'",
                self.name
            )));
        }
        self.name = name;
        self.needs_sync = true;
        Ok(())
    }

    /// Replaces the name regardless of read-only marks.
    ///
    /// Reserved for the orchestrator, which re-targets the parent key
    /// between phases.
    pub(crate) fn set_name_internal(&mut self, name: KeyName) {
        self.name = name;
    }

    /// Returns the value.
    #[must_use]
    pub fn value(&self) -> &KeyValue {
        &self.value
    }

    /// Returns the string value, or `None` for binary keys.
    #[must_use]
    pub fn as_string(&self) -> Option<&str> {
        match &self.value {
            KeyValue::String(s) => Some(s),
            KeyValue::Binary(_) => None,
        }
    }

    /// Returns the string value, or `""` for binary keys.
    #[must_use]
    pub fn string_value(&self) -> &str {
        self.as_string().unwrap_or("")
    }

    /// Returns the binary value, or `None` for string keys.
    #[must_use]
    pub fn as_binary(&self) -> Option<&[u8]> {
        match &self.value {
            KeyValue::String(_) => None,
            KeyValue::Binary(b) => Some(b),
        }
    }

    /// Returns true if the value is binary.
    #[must_use]
    pub fn is_binary(&self) -> bool {
        matches!(self.value, KeyValue::Binary(_))
    }

    /// Sets a string value.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the value is marked read-only.
    pub fn set_string(&mut self, value: impl Into<String>) -> KdbResult<()> {
        self.check_value_writable()?;
        self.value = KeyValue::String(value.into());
        self.needs_sync = true;
        Ok(())
    }

    /// Sets a binary value.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the value is marked read-only.
    pub fn set_binary(&mut self, value: Vec<u8>) -> KdbResult<()> {
        self.check_value_writable()?;
        self.value = KeyValue::Binary(value);
        self.needs_sync = true;
        Ok(())
    }

    fn check_value_writable(&self) -> KdbResult<()> {
        if self.ro_value {
            return Err(KdbError::internal(format!(
                "attempt to modify the value of read-only key '{}'",
                self.name
            )));
        }
        Ok(())
    }

    /// Returns the value of a metadata entry.
    ///
    /// The name must use the `meta:/` namespace, e.g. `meta:/error/number`.
    #[must_use]
    pub fn meta(&self, meta_name: &str) -> Option<&str> {
        let name = KeyName::parse(meta_name).ok()?;
        if name.namespace() != Namespace::Meta {
            return None;
        }
        self.meta.lookup(&name).and_then(|k| k.as_string())
    }

    /// Sets a metadata entry to a string value.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the metadata is marked read-only, or an
    /// interface error if the name does not parse into the `meta:/`
    /// namespace.
    pub fn set_meta(&mut self, meta_name: &str, value: &str) -> KdbResult<()> {
        self.check_meta_writable()?;
        let name = KeyName::parse(meta_name).map_err(|e| KdbError::interface(e.to_string()))?;
        if name.namespace() != Namespace::Meta {
            return Err(KdbError::interface(format!(
                "metadata name '{meta_name}' is not in the meta:/ namespace"
            )));
        }
        let mut meta_key = Key::new(name);
        meta_key.value = KeyValue::String(value.to_string());
        self.meta.append(meta_key);
        self.needs_sync = true;
        Ok(())
    }

    /// Removes a metadata entry if present.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the metadata is marked read-only.
    pub fn remove_meta(&mut self, meta_name: &str) -> KdbResult<()> {
        self.check_meta_writable()?;
        if let Ok(name) = KeyName::parse(meta_name) {
            self.meta.remove(&name);
        }
        Ok(())
    }

    /// Copies all metadata entries from another key.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the metadata is marked read-only.
    pub fn copy_all_meta(&mut self, other: &Key) -> KdbResult<()> {
        self.check_meta_writable()?;
        self.meta.append_all(&other.meta);
        Ok(())
    }

    fn check_meta_writable(&self) -> KdbResult<()> {
        if self.ro_meta {
            return Err(KdbError::internal(format!(
                "attempt to modify the metadata of read-only key '{}'",
                self.name
            )));
        }
        Ok(())
    }

    /// Returns the metadata entries as a key set.
    #[must_use]
    pub fn meta_keys(&self) -> &KeySet {
        &self.meta
    }

    pub(crate) fn meta_mut(&mut self) -> &mut KeySet {
        &mut self.meta
    }

    /// Returns true if the key was modified since it was last persisted.
    #[must_use]
    pub fn needs_sync(&self) -> bool {
        self.needs_sync
    }

    /// Sets or clears the sync mark.
    pub(crate) fn set_needs_sync(&mut self, value: bool) {
        self.needs_sync = value;
    }

    /// Returns true if the name is marked read-only.
    #[must_use]
    pub fn is_name_read_only(&self) -> bool {
        self.ro_name
    }

    /// Returns true if the value is marked read-only.
    #[must_use]
    pub fn is_value_read_only(&self) -> bool {
        self.ro_value
    }

    /// Returns true if the metadata is marked read-only.
    #[must_use]
    pub fn is_meta_read_only(&self) -> bool {
        self.ro_meta
    }

    /// Marks the name read-only. Used by the orchestrator around plugin
    /// calls.
    pub fn set_read_only_name(&mut self, value: bool) {
        self.ro_name = value;
    }

    /// Marks the value read-only. Used by the orchestrator around plugin
    /// calls.
    pub fn set_read_only_value(&mut self, value: bool) {
        self.ro_value = value;
    }

    /// Marks the metadata read-only.
    pub fn set_read_only_meta(&mut self, value: bool) {
        self.ro_meta = value;
    }
}

impl PartialEq for Key {
    /// Keys compare by name, value and metadata; read-only and sync marks
    /// are transient state and do not take part.
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.value == other.value && self.meta == other.meta
    }
}

impl Eq for Key {}
