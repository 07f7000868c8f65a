//! Backend detection.
//!
//! Infers which backend, if any, already owns a root directory. Detection
//! only reads: it never creates markers or volumes, so calling it twice on
//! an unchanged directory gives the same answer.

use std::io;
use std::path::Path;

use volstore_common::{CommandRunner, Privilege, VolstoreError, VolstoreResult};

use crate::driver::{DriverType, volume_dirs};

/// `f_type` reported by `statfs` for btrfs.
pub const BTRFS_SUPER_MAGIC: u64 = 0x9123_683E;

/// Filesystem magic of the filesystem holding `path`.
///
/// # Errors
///
/// Returns an error if `statfs` fails.
#[allow(clippy::unnecessary_cast, clippy::cast_sign_loss)]
pub fn filesystem_magic(path: &Path) -> io::Result<u64> {
    let stat = rustix::fs::statfs(path)?;
    // f_type is signed and 32 bits wide on some targets.
    Ok((stat.f_type as u64) & 0xFFFF_FFFF)
}

/// Whether `path` lives on a btrfs filesystem.
///
/// # Errors
///
/// Returns an error if `statfs` fails.
pub fn is_btrfs_filesystem(path: &Path) -> io::Result<bool> {
    Ok(filesystem_magic(path)? == BTRFS_SUPER_MAGIC)
}

/// Inspects a root directory and names its backend.
pub struct Detector<'a> {
    runner: &'a dyn CommandRunner,
    privilege: Privilege,
    magic: fn(&Path) -> io::Result<u64>,
}

impl<'a> Detector<'a> {
    /// A detector probing the real filesystem and running commands through `runner`.
    pub fn new(runner: &'a dyn CommandRunner, privilege: Privilege) -> Self {
        Self {
            runner,
            privilege,
            magic: filesystem_magic,
        }
    }

    /// Replace the filesystem-magic probe.
    #[must_use]
    pub fn with_magic_probe(mut self, magic: fn(&Path) -> io::Result<u64>) -> Self {
        self.magic = magic;
        self
    }

    /// Detect the backend owning `root`.
    ///
    /// In order:
    /// 1. a missing root is uninitialized;
    /// 2. a `.{kind}` marker directory names the backend outright;
    /// 3. a root with no volume directories is uninitialized;
    /// 4. on btrfs, a volume that `btrfs subvolume show` accepts means btrfs;
    /// 5. anything else is rsync.
    ///
    /// # Errors
    ///
    /// Returns [`VolstoreError::DriverNotInit`] for an uninitialized root and
    /// [`VolstoreError::InsufficientPermissions`] when the btrfs probe cannot
    /// be run with the needed rights.
    pub fn detect(&self, root: &Path) -> VolstoreResult<DriverType> {
        tracing::debug!(root = %root.display(), "Detecting driver type");

        match std::fs::metadata(root) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("Root does not exist; no driver has been initialized");
                return Err(not_init(root));
            }
            Err(e) => return Err(e.into()),
        }

        for kind in DriverType::ALL {
            if root.join(kind.marker()).is_dir() {
                tracing::debug!(%kind, "Found marker directory");
                return Ok(kind);
            }
        }

        let names = volume_dirs(root)?;
        let Some(first) = names.first() else {
            tracing::debug!("Found no volumes under the root; assuming no driver");
            return Err(not_init(root));
        };
        tracing::debug!(?names, "Found possible volumes");

        if (self.magic)(root)? == BTRFS_SUPER_MAGIC {
            let privilege = self.verified_privilege()?;
            let probe = privilege.run(
                self.runner,
                "btrfs",
                [
                    "subvolume".to_string(),
                    "show".to_string(),
                    root.join(first).to_string_lossy().into_owned(),
                ],
            )?;
            if probe.success() {
                tracing::debug!(volume = %first, "Volume is a subvolume; detected btrfs");
                return Ok(DriverType::Btrfs);
            }
        }

        Ok(DriverType::Rsync)
    }

    /// Root runs btrfs directly; anyone else needs passwordless sudo.
    fn verified_privilege(&self) -> VolstoreResult<Privilege> {
        if self.privilege.is_root() {
            return Ok(Privilege::Root);
        }
        let out = Privilege::Sudo.run(self.runner, "btrfs", ["help"])?;
        if out.success() {
            Ok(Privilege::Sudo)
        } else {
            tracing::error!("Unable to execute btrfs commands, so can't detect driver type");
            Err(VolstoreError::InsufficientPermissions {
                operation: "btrfs subvolume show".to_string(),
            })
        }
    }
}

/// Detect the backend owning `root` with the real filesystem probe.
///
/// # Errors
///
/// See [`Detector::detect`].
pub fn detect_driver_type(
    root: &Path,
    runner: &dyn CommandRunner,
    privilege: Privilege,
) -> VolstoreResult<DriverType> {
    Detector::new(runner, privilege).detect(root)
}

fn not_init(root: &Path) -> VolstoreError {
    VolstoreError::DriverNotInit {
        path: root.to_path_buf(),
    }
}
