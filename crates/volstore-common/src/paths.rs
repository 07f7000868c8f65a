//! Standard filesystem paths for volstore.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default root directory for volume data.
pub static VOLSTORE_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("VOLSTORE_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/volstore"))
});

/// Default root of the NFS export tree.
pub static VOLSTORE_EXPORTS: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("VOLSTORE_EXPORTS")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/exports"))
});

/// Standard paths touched by volstore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    /// Root data directory (default: /var/lib/volstore).
    pub root: PathBuf,
    /// Root of the export tree (default: /exports).
    pub exports: PathBuf,
    /// System configuration directory (default: /etc).
    pub etc: PathBuf,
    /// Live mount table (default: /proc/mounts).
    pub mount_table: PathBuf,
}

impl StoragePaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom data root.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Place the export tree, system configuration and mount table under
    /// `prefix` instead of `/`.
    #[must_use]
    pub fn with_system_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        let prefix = prefix.into();
        self.exports = prefix.join("exports");
        self.etc = prefix.join("etc");
        self.mount_table = prefix.join("proc").join("mounts");
        self
    }

    /// Directory holding tenant volumes.
    #[must_use]
    pub fn volumes(&self) -> PathBuf {
        self.root.join("volumes")
    }

    /// NFS exports table.
    #[must_use]
    pub fn exports_table(&self) -> PathBuf {
        self.etc.join("exports")
    }

    /// TCP wrappers allow file.
    #[must_use]
    pub fn hosts_allow(&self) -> PathBuf {
        self.etc.join("hosts.allow")
    }

    /// TCP wrappers deny file.
    #[must_use]
    pub fn hosts_deny(&self) -> PathBuf {
        self.etc.join("hosts.deny")
    }

    /// Create the data and export directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.volumes())?;
        std::fs::create_dir_all(&self.exports)?;
        Ok(())
    }
}

impl Default for StoragePaths {
    fn default() -> Self {
        Self {
            root: VOLSTORE_ROOT.clone(),
            exports: VOLSTORE_EXPORTS.clone(),
            etc: PathBuf::from("/etc"),
            mount_table: PathBuf::from("/proc/mounts"),
        }
    }
}
