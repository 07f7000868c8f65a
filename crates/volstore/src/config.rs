//! Configuration file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use volstore_common::paths::{VOLSTORE_EXPORTS, VOLSTORE_ROOT};
use volstore_common::{Privilege, StoragePaths, VolstoreError, VolstoreResult};
use volstore_nfs::{DaemonCommands, NfsConfig};
use volstore_volume::DriverType;

/// Default configuration file location.
pub const DEFAULT_CONFIG: &str = "/etc/volstore/volstore.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Volume storage.
    pub storage: StorageConfig,
    /// NFS exports.
    pub nfs: NfsSection,
}

/// `[storage]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend used for new roots.
    pub driver: DriverType,
    /// Data root; volumes live in its `volumes` directory.
    pub root: PathBuf,
    /// Backend-specific arguments.
    pub args: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            driver: DriverType::Rsync,
            root: VOLSTORE_ROOT.clone(),
            args: Vec::new(),
        }
    }
}

/// `[nfs]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NfsSection {
    /// Whether volumes are exported over NFS.
    pub enabled: bool,
    /// Subtree name under the exports root.
    pub exported_name: String,
    /// Network allowed to mount, in CIDR notation.
    pub network: String,
    /// Client addresses allowed through TCP wrappers.
    pub clients: Vec<String>,
    /// Exports root.
    pub exports: PathBuf,
    /// System configuration directory.
    pub etc: PathBuf,
    /// Live mount table.
    pub mount_table: PathBuf,
    /// Daemon lifecycle commands.
    pub daemon: DaemonCommands,
}

impl Default for NfsSection {
    fn default() -> Self {
        let paths = StoragePaths::new();
        Self {
            enabled: false,
            exported_name: "volstore_var".to_string(),
            network: "0.0.0.0/0".to_string(),
            clients: Vec::new(),
            exports: VOLSTORE_EXPORTS.clone(),
            etc: paths.etc,
            mount_table: paths.mount_table,
            daemon: DaemonCommands::default(),
        }
    }
}

impl Config {
    /// Load `path`, falling back to defaults when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`VolstoreError::Config`] if the file cannot be parsed, or an
    /// I/O error if it cannot be read.
    pub fn load(path: &Path) -> VolstoreResult<Self> {
        match fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file; using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Parse TOML.
    ///
    /// # Errors
    ///
    /// Returns [`VolstoreError::Config`] on malformed input.
    pub fn from_toml(content: &str) -> VolstoreResult<Self> {
        toml::from_str(content).map_err(|e| VolstoreError::Config {
            message: format!("Failed to parse TOML: {e}"),
        })
    }

    /// Serialize to TOML.
    ///
    /// # Errors
    ///
    /// Returns [`VolstoreError::Serialization`] if serialization fails.
    pub fn to_toml(&self) -> VolstoreResult<String> {
        toml::to_string_pretty(self).map_err(|e| VolstoreError::Serialization(e.to_string()))
    }

    /// Use `root` as the data root.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage.root = root.into();
        self
    }

    /// Paths derived from the configuration.
    #[must_use]
    pub fn paths(&self) -> StoragePaths {
        StoragePaths {
            root: self.storage.root.clone(),
            exports: self.nfs.exports.clone(),
            etc: self.nfs.etc.clone(),
            mount_table: self.nfs.mount_table.clone(),
        }
    }

    /// Root directory the volume driver binds to.
    #[must_use]
    pub fn volumes_root(&self) -> PathBuf {
        self.paths().volumes()
    }

    /// Settings for the export synchronizer.
    #[must_use]
    pub fn nfs_config(&self, privilege: Privilege) -> NfsConfig {
        NfsConfig::new(
            self.volumes_root(),
            self.nfs.exported_name.clone(),
            self.nfs.network.clone(),
        )
        .with_paths(self.paths())
        .with_daemon(self.nfs.daemon.clone())
        .with_privilege(privilege)
    }
}
