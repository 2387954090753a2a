//! The default resolver plugin.
//!
//! Maps the `path` of a mountpoint definition to an absolute file below the
//! per-namespace base directory, detects out-of-band modifications through
//! content stamps, and implements the prepare/commit/rollback protocol of
//! the write pipeline: writes go to a temporary file next to the live one,
//! the commit phase atomically renames it into place, the rollback phase
//! removes it. An advisory lock guards the window between prepare and
//! commit.

use crate::config::Config;
use crate::error::{KdbError, KdbResult};
use crate::key::name::Namespace;
use crate::key::Key;
use crate::keyset::KeySet;
use crate::plugin::{Capabilities, PhaseContext, Plugin, PluginResult, PluginStatus};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Content stamp of a storage file, used for change and conflict detection.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    digest: [u8; 32],
}

fn stamp(path: &Path) -> KdbResult<Option<FileStamp>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let digest: [u8; 32] = Sha256::digest(&bytes).into();
    Ok(Some(FileStamp {
        len: bytes.len() as u64,
        digest,
    }))
}

/// A prepared but not yet committed write.
#[derive(Debug)]
struct PendingCommit {
    live: PathBuf,
    lock_file: File,
}

/// The built-in file resolver.
#[derive(Debug)]
pub struct FileResolver {
    system_dir: PathBuf,
    user_dir: PathBuf,
    spec_dir: PathBuf,
    dir_dir: PathBuf,
    /// Stamp of each resolved file as of the last read.
    stamps: HashMap<PathBuf, Option<FileStamp>>,
    /// Prepared writes, keyed by the temporary identifier.
    pending: HashMap<PathBuf, PendingCommit>,
}

impl FileResolver {
    /// Creates a resolver with base directories from the session
    /// configuration.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            system_dir: config.system_dir.clone(),
            user_dir: config.user_dir.clone(),
            spec_dir: config.spec_dir.clone(),
            dir_dir: config.dir_dir.clone(),
            stamps: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    fn base_dir(&self, namespace: Namespace) -> &Path {
        match namespace {
            Namespace::User => &self.user_dir,
            Namespace::Spec => &self.spec_dir,
            Namespace::Dir => &self.dir_dir,
            _ => &self.system_dir,
        }
    }

    fn resolve(&self, namespace: Namespace, relative: &str) -> PathBuf {
        if relative.starts_with('/') {
            PathBuf::from(relative)
        } else {
            self.base_dir(namespace).join(relative)
        }
    }

    fn temp_path(live: &Path) -> PathBuf {
        let mut name = live.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn lock_path(live: &Path) -> PathBuf {
        let mut name = live.as_os_str().to_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }
}

impl Plugin for FileResolver {
    fn name(&self) -> &str {
        "resolver"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::none()
            .with_open()
            .with_get()
            .with_set()
            .with_commit()
            .with_error()
    }

    fn open(&mut self, config: &KeySet, _error_key: &mut Key) -> PluginResult {
        // base directories can be overridden per mountpoint
        let overrides = [
            ("/dirs/system", &mut self.system_dir),
            ("/dirs/user", &mut self.user_dir),
            ("/dirs/spec", &mut self.spec_dir),
            ("/dirs/dir", &mut self.dir_dir),
        ];
        for (name, dir) in overrides {
            if let Ok(key_name) = crate::key::name::KeyName::parse(name) {
                if let Some(key) = config.lookup(&key_name) {
                    *dir = PathBuf::from(key.string_value());
                }
            }
        }
        Ok(PluginStatus::Success)
    }

    /// Resolver phase of `get`: report the storage identifier and whether
    /// the file changed since the last read.
    fn get(&mut self, _ks: &mut KeySet, parent: &mut Key, _ctx: &PhaseContext<'_>) -> PluginResult {
        let live = self.resolve(parent.name().namespace(), parent.string_value());
        parent.set_string(live.display().to_string())?;

        let current = stamp(&live)?;
        let status = match self.stamps.get(&live) {
            Some(previous) if *previous == current => PluginStatus::NoUpdate,
            _ => PluginStatus::Success,
        };
        self.stamps.insert(live, current);
        Ok(status)
    }

    /// Resolver phase of `set`: detect concurrent writers, take the lock
    /// and report the temporary identifier subsequent phases write to.
    fn set(&mut self, _ks: &mut KeySet, parent: &mut Key, _ctx: &PhaseContext<'_>) -> PluginResult {
        let live = self.resolve(parent.name().namespace(), parent.string_value());

        let current = stamp(&live)?;
        match self.stamps.get(&live) {
            Some(previous) if *previous == current => {}
            Some(_) => {
                return Err(KdbError::conflicting_state(format!(
                    "the file '{}' was modified since it was last read; retrieve the \
                     configuration again before writing",
                    live.display()
                )))
            }
            None => {
                return Err(KdbError::conflicting_state(format!(
                    "the file '{}' was never read through this handle; retrieve the \
                     configuration before writing",
                    live.display()
                )))
            }
        }

        if let Some(dir) = live.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(Self::lock_path(&live))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(KdbError::conflicting_state(format!(
                "another process is writing '{}'",
                live.display()
            )));
        }

        let temp = Self::temp_path(&live);
        parent.set_string(temp.display().to_string())?;
        self.pending.insert(temp, PendingCommit { live, lock_file });
        Ok(PluginStatus::Success)
    }

    /// Commit phase: atomically swap the temporary file for the live one.
    fn commit(&mut self, _ks: &mut KeySet, parent: &mut Key, _ctx: &PhaseContext<'_>) -> PluginResult {
        let temp = PathBuf::from(parent.string_value());
        let pending = self.pending.remove(&temp).ok_or_else(|| {
            KdbError::internal(format!(
                "commit phase reached without a prepared write for '{}'",
                temp.display()
            ))
        })?;

        if temp.exists() {
            std::fs::rename(&temp, &pending.live)?;
        }
        let new_stamp = stamp(&pending.live)?;
        self.stamps.insert(pending.live.clone(), new_stamp);

        parent.set_string(pending.live.display().to_string())?;
        drop(pending.lock_file);
        Ok(PluginStatus::Success)
    }

    /// Rollback phase: remove the temporary file, release the lock.
    fn error(&mut self, _ks: &mut KeySet, parent: &mut Key, _ctx: &PhaseContext<'_>) -> PluginResult {
        let temp = PathBuf::from(parent.string_value());
        if let Some(pending) = self.pending.remove(&temp) {
            if temp.exists() {
                let _ = std::fs::remove_file(&temp);
            }
            drop(pending.lock_file);
        }
        Ok(PluginStatus::Success)
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
