//! Session fixtures and mount-configuration helpers.
//!
//! [`TestKdb`] opens a session whose namespace directories and bootstrap
//! file all live in a temporary directory. [`MountConfig`] writes mount
//! configurations into that bootstrap file before the session opens.

use elektra_core::plugins::storage;
use elektra_core::{
    Config, Kdb, Key, KeyName, KeySet, ModuleRegistry, Namespace,
};
use std::path::Path;
use tempfile::TempDir;

/// A mount-configuration builder for the bootstrap file.
#[derive(Debug, Default)]
pub struct MountConfig {
    ks: KeySet,
}

impl MountConfig {
    /// Creates an empty mount configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn mountpoint_root(mountpoint: &str) -> KeyName {
        KeyName::from_parts(
            Namespace::System,
            ["elektra", "mountpoints", mountpoint],
        )
    }

    fn add(&mut self, name: KeyName, value: &str) {
        self.ks.append(Key::new(name).with_string(value));
    }

    /// Adds a standard file-backed mountpoint: default resolver, the given
    /// storage plugin and the standard backend plugin.
    pub fn add_mountpoint_with_storage(
        &mut self,
        mountpoint: &str,
        file: &str,
        storage_plugin: &str,
    ) -> &mut Self {
        let root = Self::mountpoint_root(mountpoint);
        self.add(root.child("backend"), "#2");
        self.add(root.child("plugins").child("#0").child("name"), "resolver");
        self.add(
            root.child("plugins").child("#1").child("name"),
            storage_plugin,
        );
        self.add(root.child("plugins").child("#2").child("name"), "backend");

        let definition = root.child("definition");
        self.add(definition.child("path"), file);
        let positions = definition.child("positions");
        self.add(positions.child("get").child("resolver"), "#0");
        self.add(positions.child("get").child("storage"), "#1");
        self.add(positions.child("set").child("resolver"), "#0");
        self.add(positions.child("set").child("storage"), "#1");
        self.add(positions.child("set").child("commit"), "#0");
        self.add(positions.child("set").child("rollback"), "#0");
        self
    }

    /// Adds a standard file-backed mountpoint with the default storage
    /// plugin.
    pub fn add_mountpoint(&mut self, mountpoint: &str, file: &str) -> &mut Self {
        self.add_mountpoint_with_storage(mountpoint, file, "storage")
    }

    /// Adds a read-only file-backed mountpoint: only the read positions
    /// are configured, so the backend initializes as read-only.
    pub fn add_read_only_mountpoint(&mut self, mountpoint: &str, file: &str) -> &mut Self {
        let root = Self::mountpoint_root(mountpoint);
        self.add(root.child("backend"), "#2");
        self.add(root.child("plugins").child("#0").child("name"), "resolver");
        self.add(root.child("plugins").child("#1").child("name"), "storage");
        self.add(root.child("plugins").child("#2").child("name"), "backend");

        let definition = root.child("definition");
        self.add(definition.child("path"), file);
        let positions = definition.child("positions");
        self.add(positions.child("get").child("resolver"), "#0");
        self.add(positions.child("get").child("storage"), "#1");
        self
    }

    /// Adds one raw configuration key below the mountpoint configuration
    /// of `mountpoint`.
    pub fn add_raw(&mut self, mountpoint: &str, relative: &[&str], value: &str) -> &mut Self {
        let mut name = Self::mountpoint_root(mountpoint);
        for segment in relative {
            name.push(*segment);
        }
        self.add(name, value);
        self
    }

    /// Writes the configuration into the bootstrap file of `config`.
    ///
    /// # Panics
    ///
    /// Panics when the bootstrap file cannot be written; fixtures fail
    /// loudly.
    pub fn write(&self, config: &Config) {
        let parent = KeyName::from_parts(Namespace::System, ["elektra"]);
        let text = storage::encode(&self.ks, &parent).expect("mount configuration must encode");
        if let Some(dir) = config.bootstrap_file.parent() {
            std::fs::create_dir_all(dir).expect("bootstrap directory must be creatable");
        }
        std::fs::write(&config.bootstrap_file, text).expect("bootstrap file must be writable");
    }
}

/// A key database session in a temporary sandbox, with automatic cleanup.
pub struct TestKdb {
    /// The open session.
    pub kdb: Kdb,
    /// The key carrying open-time warnings.
    pub error_key: Key,
    /// The sandbox directory (kept alive to prevent cleanup).
    _base: TempDir,
}

impl TestKdb {
    /// Opens a session in a fresh sandbox with the built-in modules only.
    #[must_use]
    pub fn open() -> Self {
        Self::open_with(|_, _| {})
    }

    /// Opens a session in a fresh sandbox. The setup callback may write a
    /// mount configuration and register extra plugins before the session
    /// opens.
    #[must_use]
    pub fn open_with(setup: impl FnOnce(&mut MountConfig, &mut ModuleRegistry)) -> Self {
        let base = TempDir::new().expect("failed to create sandbox directory");
        let config = Config::sandboxed(base.path());

        let mut mounts = MountConfig::new();
        let mut registry = ModuleRegistry::with_builtins(&config);
        setup(&mut mounts, &mut registry);
        mounts.write(&config);

        let mut error_key = Key::parse("/").expect("root key name");
        let kdb = Kdb::open_with_registry(config, registry, None, &mut error_key)
            .expect("failed to open sandboxed session");

        Self {
            kdb,
            error_key,
            _base: base,
        }
    }

    /// Opens an additional, independent session over the same sandbox.
    ///
    /// Useful for concurrent-writer scenarios; the second handle shares
    /// the storage files but no in-process state.
    #[must_use]
    pub fn second_handle(&self) -> Kdb {
        self.second_handle_with(|_| {})
    }

    /// Opens an additional session over the same sandbox with extra
    /// plugins registered.
    #[must_use]
    pub fn second_handle_with(&self, setup: impl FnOnce(&mut ModuleRegistry)) -> Kdb {
        let config = self.kdb.config().clone();
        let mut registry = ModuleRegistry::with_builtins(&config);
        setup(&mut registry);
        let mut error_key = Key::parse("/").expect("root key name");
        Kdb::open_with_registry(config, registry, None, &mut error_key)
            .expect("failed to open second handle")
    }

    /// Returns the sandbox base directory.
    #[must_use]
    pub fn base(&self) -> &Path {
        self._base.path()
    }
}

impl std::ops::Deref for TestKdb {
    type Target = Kdb;

    fn deref(&self) -> &Self::Target {
        &self.kdb
    }
}

impl std::ops::DerefMut for TestKdb {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.kdb
    }
}
