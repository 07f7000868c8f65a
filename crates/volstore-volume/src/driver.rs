//! Driver and volume interfaces.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use volstore_common::{CommandRunner, Privilege, VolstoreError, VolstoreResult};

/// Directory names under a driver root that are never volumes.
pub(crate) const RESERVED_NAMES: &[&str] = &["monitor"];

/// Backend kinds.
///
/// The declaration order is the order in which marker directories are
/// checked during detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverType {
    /// Copy-on-write subvolumes.
    Btrfs,
    /// Plain directories with copied snapshots.
    Rsync,
    /// Thin-provisioned block devices.
    DeviceMapper,
}

impl DriverType {
    /// Every backend kind, in detection order.
    pub const ALL: [Self; 3] = [Self::Btrfs, Self::Rsync, Self::DeviceMapper];

    /// Canonical name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Btrfs => "btrfs",
            Self::Rsync => "rsync",
            Self::DeviceMapper => "devicemapper",
        }
    }

    /// Name of the marker directory a driver of this kind keeps under its root.
    #[must_use]
    pub fn marker(self) -> String {
        format!(".{}", self.as_str())
    }
}

impl fmt::Display for DriverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverType {
    type Err = VolstoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "btrfs" => Ok(Self::Btrfs),
            "rsync" => Ok(Self::Rsync),
            "devicemapper" | "device-mapper" => Ok(Self::DeviceMapper),
            other => Err(VolstoreError::DriverNotSupported {
                kind: other.to_string(),
            }),
        }
    }
}

/// Aggregate status of one driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Backend kind.
    pub driver: DriverType,
    /// Driver root.
    pub root: PathBuf,
    /// Bytes available to unprivileged users.
    pub data_space_available: u64,
    /// Bytes in use.
    pub data_space_used: u64,
    /// Filesystem size in bytes.
    pub data_space_total: u64,
    /// Backend-specific identifiers.
    pub details: BTreeMap<String, String>,
}

impl Status {
    /// Space usage of the filesystem holding `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the filesystem cannot be queried.
    pub fn for_root(driver: DriverType, root: &Path) -> VolstoreResult<Self> {
        let vfs = rustix::fs::statvfs(root).map_err(std::io::Error::from)?;
        let block = vfs.f_frsize;

        Ok(Self {
            driver,
            root: root.to_path_buf(),
            data_space_available: vfs.f_bavail.saturating_mul(block),
            data_space_used: vfs.f_blocks.saturating_sub(vfs.f_bfree).saturating_mul(block),
            data_space_total: vfs.f_blocks.saturating_mul(block),
            details: BTreeMap::new(),
        })
    }
}

/// Statuses keyed by driver root or volume name.
pub type Statuses = BTreeMap<String, Status>;

/// What a driver constructor gets besides its root and arguments.
#[derive(Debug, Clone)]
pub struct DriverContext {
    /// Executor for backend commands.
    pub runner: Arc<dyn CommandRunner>,
    /// How privileged commands are launched.
    pub privilege: Privilege,
}

impl DriverContext {
    /// Create a context.
    pub fn new(runner: Arc<dyn CommandRunner>, privilege: Privilege) -> Self {
        Self { runner, privilege }
    }
}

/// Constructs a driver bound to a root.
pub type DriverInit =
    Arc<dyn Fn(&Path, &[String], &DriverContext) -> VolstoreResult<Arc<dyn Driver>> + Send + Sync>;

/// Creates, manages and destroys volumes beneath one root directory.
pub trait Driver: Send + Sync + fmt::Debug {
    /// The filesystem root this driver acts on.
    fn root(&self) -> &Path;

    /// The backend kind.
    fn driver_type(&self) -> DriverType;

    /// Create a volume. The volume must not exist already.
    ///
    /// # Errors
    ///
    /// Returns [`VolstoreError::VolumeExists`] if the volume exists.
    fn create(&self, name: &str) -> VolstoreResult<Arc<dyn Volume>>;

    /// Remove a volume and its snapshots. Removing a missing volume is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume cannot be removed.
    fn remove(&self, name: &str) -> VolstoreResult<()>;

    /// Get an existing volume.
    ///
    /// # Errors
    ///
    /// Returns [`VolstoreError::VolumeNotFound`] if the volume does not exist.
    fn get(&self, name: &str) -> VolstoreResult<Arc<dyn Volume>>;

    /// Release runtime resources held for a volume.
    ///
    /// # Errors
    ///
    /// Returns an error if the resources cannot be released.
    fn release(&self, name: &str) -> VolstoreResult<()>;

    /// Names of all volumes, sorted.
    fn list(&self) -> Vec<String>;

    /// Whether a volume exists.
    fn exists(&self, name: &str) -> bool;

    /// Release runtime resources held by the driver itself.
    ///
    /// # Errors
    ///
    /// Returns an error if cleanup fails.
    fn cleanup(&self) -> VolstoreResult<()>;

    /// Space usage and backend details.
    ///
    /// # Errors
    ///
    /// Returns an error if the status cannot be collected.
    fn status(&self) -> VolstoreResult<Status>;
}

/// A directory available to applications that can be snapshotted, rolled
/// back, exported to a file and imported from one.
pub trait Volume: Send + Sync + fmt::Debug {
    /// Volume name.
    fn name(&self) -> &str;

    /// Base tenant of the volume: the name up to the first `_`.
    fn tenant(&self) -> &str {
        tenant_of(self.name())
    }

    /// Filesystem path of the volume.
    fn path(&self) -> &Path;

    /// The driver managing this volume, if it is still alive.
    fn driver(&self) -> Option<Arc<dyn Driver>>;

    /// Snapshot the current state under `label`.
    ///
    /// # Errors
    ///
    /// Returns [`VolstoreError::SnapshotExists`] if `label` is taken.
    fn snapshot(&self, label: &str) -> VolstoreResult<()>;

    /// Open a metadata entry of a snapshot for writing.
    ///
    /// # Errors
    ///
    /// Returns [`VolstoreError::SnapshotDoesNotExist`] for an unknown label.
    fn write_metadata(&self, label: &str, name: &str) -> VolstoreResult<Box<dyn Write + Send>>;

    /// Open a metadata entry of a snapshot for reading.
    ///
    /// # Errors
    ///
    /// Returns [`VolstoreError::SnapshotDoesNotExist`] for an unknown label.
    fn read_metadata(&self, label: &str, name: &str) -> VolstoreResult<Box<dyn Read + Send>>;

    /// Labels of all snapshots, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot directory cannot be read.
    fn snapshots(&self) -> VolstoreResult<Vec<String>>;

    /// Remove the snapshot `label`.
    ///
    /// # Errors
    ///
    /// Returns [`VolstoreError::SnapshotDoesNotExist`] or
    /// [`VolstoreError::RemovingSnapshot`].
    fn remove_snapshot(&self, label: &str) -> VolstoreResult<()>;

    /// Replace the current contents with the snapshot `label`.
    ///
    /// # Errors
    ///
    /// Returns [`VolstoreError::SnapshotDoesNotExist`] for an unknown label.
    fn rollback(&self, label: &str) -> VolstoreResult<()>;

    /// Write the snapshot `label` to `file`, recording `parent` as its base.
    ///
    /// # Errors
    ///
    /// Returns [`VolstoreError::SnapshotDoesNotExist`] for an unknown label.
    fn export(&self, label: &str, parent: &str, file: &Path) -> VolstoreResult<()>;

    /// Import an exported snapshot from `file` as `label`.
    ///
    /// # Errors
    ///
    /// Returns [`VolstoreError::SnapshotExists`] if `label` is taken.
    fn import(&self, label: &str, file: &Path) -> VolstoreResult<()>;
}

/// Whether `name` is a single, visible, normal path component.
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !name.starts_with('.')
        && !name.contains('/')
}

/// Base tenant of a volume name.
#[must_use]
pub fn tenant_of(name: &str) -> &str {
    name.split_once('_').map_or(name, |(tenant, _)| tenant)
}

/// Reject names that are not usable as a volume name.
///
/// # Errors
///
/// Returns [`VolstoreError::InvalidVolumeName`].
pub fn validate_name(name: &str) -> VolstoreResult<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(VolstoreError::InvalidVolumeName {
            name: name.to_string(),
        })
    }
}

/// Volume directories under `root`: visible, non-reserved subdirectories, sorted.
pub(crate) fn volume_dirs(root: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if name.starts_with('.') || RESERVED_NAMES.contains(&name.as_str()) {
            continue;
        }
        names.push(name);
    }
    names.sort();
    Ok(names)
}
