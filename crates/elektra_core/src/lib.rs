//! # Elektra Core
//!
//! The key database (KDB) core: a single hierarchical namespace of typed
//! keys backed by pluggable storage backends.
//!
//! This crate provides:
//! - The [`Key`]/[`KeySet`] data model (namespaces, hierarchy, metadata,
//!   sync marks, canonical name ordering)
//! - The [`Plugin`] contract and the per-session module registry
//! - Backend records, the mount table and the global plugin table
//! - The [`Kdb`] session with its `get` and `set` pipelines and the
//!   two-phase commit across heterogeneous backends
//! - The bootstrap subsystem and the statically linked built-in plugins
//!
//! ## Example
//!
//! ```rust,ignore
//! use elektra_core::{Config, Kdb, Key, KeySet};
//!
//! let mut error_key = Key::parse("/")?;
//! let mut kdb = Kdb::open(Config::default(), None, &mut error_key)?;
//!
//! let mut ks = KeySet::new();
//! let mut parent = Key::parse("user:/myapp")?;
//! kdb.get(&mut ks, &mut parent)?;
//!
//! ks.append(Key::parse("user:/myapp/answer")?.with_string("42"));
//! kdb.set(&mut ks, &mut parent)?;
//!
//! kdb.close(&mut error_key);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod config;
pub mod error;
pub mod global;
pub mod kdb;
pub mod key;
pub mod keyset;
pub mod mount;
pub mod plugin;
pub mod plugins;
pub mod registry;

pub use backend::Backend;
pub use config::Config;
pub use error::{KdbError, KdbResult};
pub use global::{GlobalPlugins, GlobalPosition, SubPosition};
pub use kdb::{GetOutcome, Kdb, SetOutcome};
pub use key::name::{KeyName, KeyNameError, Namespace};
pub use key::{Key, KeyValue};
pub use keyset::KeySet;
pub use mount::MountTable;
pub use plugin::{
    plugin_handle, Capabilities, Phase, PhaseContext, Plugin, PluginHandle, PluginResult,
    PluginStatus, SharedKeySet, Siblings, GLOBAL_FAILED_PHASE_KEY, GLOBAL_PHASE_KEY,
};
pub use registry::ModuleRegistry;
