//! Session configuration.
//!
//! The storage locations are regular configuration rather than compile-time
//! constants, so tests and embedders can redirect every namespace into a
//! scratch directory.

use std::path::{Path, PathBuf};

/// Configuration for opening a key database session.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for `system:/` storage files.
    pub system_dir: PathBuf,

    /// Base directory for `user:/` storage files.
    pub user_dir: PathBuf,

    /// Base directory for `spec:/` storage files.
    pub spec_dir: PathBuf,

    /// Base directory for `dir:/` storage files.
    pub dir_dir: PathBuf,

    /// Absolute path of the bootstrap file holding the mount configuration.
    pub bootstrap_file: PathBuf,

    /// File name used by the hard-coded root mountpoints.
    pub default_file: String,
}

impl Default for Config {
    fn default() -> Self {
        let system_dir = PathBuf::from("/etc/kdb");
        let user_dir = std::env::var_os("HOME")
            .map(|home| Path::new(&home).join(".config/kdb"))
            .unwrap_or_else(|| PathBuf::from(".config/kdb"));

        Self {
            bootstrap_file: system_dir.join("elektra.ecf"),
            spec_dir: system_dir.join("spec"),
            system_dir,
            user_dir,
            dir_dir: PathBuf::from("."),
            default_file: "default.ecf".to_string(),
        }
    }
}

impl Config {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base directory for `system:/` storage files.
    #[must_use]
    pub fn system_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.system_dir = path.into();
        self
    }

    /// Sets the base directory for `user:/` storage files.
    #[must_use]
    pub fn user_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.user_dir = path.into();
        self
    }

    /// Sets the base directory for `spec:/` storage files.
    #[must_use]
    pub fn spec_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.spec_dir = path.into();
        self
    }

    /// Sets the base directory for `dir:/` storage files.
    #[must_use]
    pub fn dir_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.dir_dir = path.into();
        self
    }

    /// Sets the bootstrap file path.
    #[must_use]
    pub fn bootstrap_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.bootstrap_file = path.into();
        self
    }

    /// Sets the file name used by the hard-coded root mountpoints.
    #[must_use]
    pub fn default_file(mut self, name: impl Into<String>) -> Self {
        self.default_file = name.into();
        self
    }

    /// Redirects every namespace directory and the bootstrap file into one
    /// base directory. Convenient for tests and sandboxed embedders.
    #[must_use]
    pub fn sandboxed(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        Self {
            system_dir: base.join("system"),
            user_dir: base.join("user"),
            spec_dir: base.join("spec"),
            dir_dir: base.join("dir"),
            bootstrap_file: base.join("system/elektra.ecf"),
            default_file: "default.ecf".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.default_file, "default.ecf");
        assert!(config.bootstrap_file.ends_with("elektra.ecf"));
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .system_dir("/tmp/sys")
            .default_file("other.ecf");

        assert_eq!(config.system_dir, PathBuf::from("/tmp/sys"));
        assert_eq!(config.default_file, "other.ecf");
    }

    #[test]
    fn sandboxed_redirects_everything() {
        let config = Config::sandboxed("/tmp/kdb-test");
        assert_eq!(config.user_dir, PathBuf::from("/tmp/kdb-test/user"));
        assert_eq!(
            config.bootstrap_file,
            PathBuf::from("/tmp/kdb-test/system/elektra.ecf")
        );
    }
}
