//! Error types for the key database.
//!
//! Errors carry one of a closed set of kinds, each with a stable error
//! number. Besides being returned as `Result`s, terminal errors and
//! accumulated warnings are mirrored into the metadata of the caller's
//! parent key (`meta:/error/*` and `meta:/warnings/#N/*`), so that the
//! information survives across language and process boundaries.

use crate::key::name::KeyName;
use crate::key::Key;
use std::panic::Location;
use thiserror::Error;

/// Result type for key database operations.
pub type KdbResult<T> = Result<T, KdbError>;

/// Errors that can occur in key database operations.
///
/// The set of kinds is closed; plugins report errors using the same type.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KdbError {
    /// Caller misuse: null-ish arguments, wrong namespace, `set` without `get`.
    #[error("interface error: {reason}")]
    Interface {
        /// Description of the misuse.
        reason: String,
    },

    /// Mount configuration or plugin load failure; aborts `open`.
    #[error("installation error: {reason}")]
    Installation {
        /// Description of the broken installation.
        reason: String,
    },

    /// Resource exhaustion (allocation, file descriptors, I/O).
    #[error("resource error: {reason}")]
    Resource {
        /// Description of the exhausted resource.
        reason: String,
    },

    /// Another writer modified the storage since the last `get`.
    #[error("conflicting state: {reason}")]
    ConflictingState {
        /// Description of the conflict.
        reason: String,
    },

    /// A plugin violated its contract.
    #[error("plugin misbehavior: {reason}")]
    PluginMisbehavior {
        /// Description of the violation.
        reason: String,
    },

    /// Invariant violation in the core (a bug).
    #[error("internal error: {reason}")]
    Internal {
        /// Description of the violated invariant.
        reason: String,
    },

    /// A validation plugin rejected the data.
    #[error("validation error: {reason}")]
    Validation {
        /// Description of the rejected data.
        reason: String,
    },
}

impl KdbError {
    /// Creates an interface error.
    pub fn interface(reason: impl Into<String>) -> Self {
        Self::Interface {
            reason: reason.into(),
        }
    }

    /// Creates an installation error.
    pub fn installation(reason: impl Into<String>) -> Self {
        Self::Installation {
            reason: reason.into(),
        }
    }

    /// Creates a resource error.
    pub fn resource(reason: impl Into<String>) -> Self {
        Self::Resource {
            reason: reason.into(),
        }
    }

    /// Creates a conflicting-state error.
    pub fn conflicting_state(reason: impl Into<String>) -> Self {
        Self::ConflictingState {
            reason: reason.into(),
        }
    }

    /// Creates a plugin-misbehavior error.
    pub fn plugin_misbehavior(reason: impl Into<String>) -> Self {
        Self::PluginMisbehavior {
            reason: reason.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Creates a validation error.
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    /// Returns the stable error number written into `meta:/error/number`.
    #[must_use]
    pub fn number(&self) -> &'static str {
        match self {
            Self::Resource { .. } => "C01100",
            Self::Installation { .. } => "C01200",
            Self::Interface { .. } => "C01310",
            Self::PluginMisbehavior { .. } => "C01320",
            Self::Internal { .. } => "C01330",
            Self::ConflictingState { .. } => "C02000",
            Self::Validation { .. } => "C03200",
        }
    }

    /// Returns the human-readable kind description.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::Resource { .. } => "Resource",
            Self::Installation { .. } => "Installation",
            Self::Interface { .. } => "Interface",
            Self::PluginMisbehavior { .. } => "Plugin Misbehavior",
            Self::Internal { .. } => "Internal",
            Self::ConflictingState { .. } => "Conflicting State",
            Self::Validation { .. } => "Validation",
        }
    }

    /// Returns the reason text.
    #[must_use]
    pub fn reason(&self) -> &str {
        match self {
            Self::Interface { reason }
            | Self::Installation { reason }
            | Self::Resource { reason }
            | Self::ConflictingState { reason }
            | Self::PluginMisbehavior { reason }
            | Self::Internal { reason }
            | Self::Validation { reason } => reason,
        }
    }
}

impl From<std::io::Error> for KdbError {
    fn from(err: std::io::Error) -> Self {
        Self::resource(err.to_string())
    }
}

fn meta_name(path: &str) -> KeyName {
    // error/warning metadata names are fixed strings, parsing cannot fail
    KeyName::parse(path).unwrap_or_else(|_| KeyName::root(crate::key::name::Namespace::Meta))
}

/// Removes all `meta:/error/*` and `meta:/warnings/*` entries from a key.
///
/// Called at the start of every top-level operation so stale diagnostics
/// never leak into the next call.
pub fn clear_error_and_warnings(key: &mut Key) {
    key.meta_mut().cut(&meta_name("meta:/error"));
    key.meta_mut().cut(&meta_name("meta:/warnings"));
}

fn write_record(key: &mut Key, prefix: &str, error: &KdbError, module: &str, location: &Location) {
    // metadata writes on a read-only-meta key are dropped, matching the
    // caller-precondition checks that reject such parent keys up front
    let _ = key.set_meta(&format!("{prefix}/number"), error.number());
    let _ = key.set_meta(&format!("{prefix}/description"), error.description());
    let _ = key.set_meta(&format!("{prefix}/reason"), error.reason());
    let _ = key.set_meta(&format!("{prefix}/module"), module);
    let _ = key.set_meta(&format!("{prefix}/file"), location.file());
    let _ = key.set_meta(&format!("{prefix}/line"), &location.line().to_string());
}

/// Sets the terminal error metadata (`meta:/error/*`) on a key.
#[track_caller]
pub fn set_error(key: &mut Key, error: &KdbError, module: &str) {
    let location = Location::caller();
    write_record(key, "meta:/error", error, module, location);
}

/// Adds optional `meta:/error/mountpoint` and `meta:/error/configfile`
/// details to a previously set error.
pub fn annotate_error(key: &mut Key, mountpoint: Option<&str>, configfile: Option<&str>) {
    if let Some(mp) = mountpoint {
        let _ = key.set_meta("meta:/error/mountpoint", mp);
    }
    if let Some(file) = configfile {
        let _ = key.set_meta("meta:/error/configfile", file);
    }
}

/// Appends a warning record (`meta:/warnings/#N/*`) to a key.
///
/// Warnings accumulate and never change the outcome of an operation.
#[track_caller]
pub fn add_warning(key: &mut Key, error: &KdbError, module: &str) {
    let location = Location::caller();
    let index = warning_count(key);
    let prefix = format!("meta:/warnings/{}", KeyName::array_element(index));
    write_record(key, &prefix, error, module, location);
}

fn warning_groups(key: &Key) -> Vec<String> {
    let root = meta_name("meta:/warnings");
    let mut groups = Vec::new();
    for meta in key.meta_keys().below(&root).iter() {
        if let Some(rest) = meta.name().strip_prefix(&root) {
            if let Some(first) = rest.first() {
                if groups.last() != Some(first) {
                    groups.push(first.clone());
                }
            }
        }
    }
    groups
}

/// Returns the number of warnings recorded on a key.
#[must_use]
pub fn warning_count(key: &Key) -> usize {
    warning_groups(key).len()
}

/// Appends all warnings of `src` to `dst`, renumbering them after the
/// warnings `dst` already carries.
pub fn merge_warnings(dst: &mut Key, src: &Key) {
    let root = meta_name("meta:/warnings");
    for group in warning_groups(src) {
        let group_root = root.child(group);
        let new_root = root.child(KeyName::array_element(warning_count(dst)));
        for meta in src.meta_keys().below(&group_root).iter() {
            if let Some(name) = meta.name().replace_prefix(&group_root, &new_root) {
                let _ = dst.set_meta(&name.to_string(), meta.string_value());
            }
        }
    }
}

/// Returns the error number recorded on a key, if any.
#[must_use]
pub fn error_number(key: &Key) -> Option<&str> {
    key.meta("meta:/error/number")
}
