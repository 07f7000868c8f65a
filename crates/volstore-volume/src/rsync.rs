//! Plain-directory driver.
//!
//! Volumes are ordinary directories under the driver root. Snapshots are full
//! copies kept under `{root}/.rsync/`, so this driver works on any
//! filesystem at the cost of snapshot space.

use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use volstore_common::{VolstoreError, VolstoreResult};
use walkdir::WalkDir;

use crate::driver::{
    Driver, DriverContext, DriverType, Status, Volume, validate_name, volume_dirs,
};
use crate::snapshot::SnapshotStore;

/// Driver storing volumes as plain directories.
#[derive(Debug)]
pub struct RsyncDriver {
    root: PathBuf,
    this: Weak<RsyncDriver>,
}

/// Registry constructor for [`RsyncDriver`].
///
/// # Errors
///
/// Returns an error if the root or its marker directory cannot be created.
pub fn init(root: &Path, _args: &[String], _ctx: &DriverContext) -> VolstoreResult<Arc<dyn Driver>> {
    Ok(RsyncDriver::new(root)?)
}

impl RsyncDriver {
    /// Open (creating if needed) a driver at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the root or its marker directory cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> VolstoreResult<Arc<Self>> {
        let root = root.into();
        fs::create_dir_all(root.join(DriverType::Rsync.marker()))?;
        tracing::debug!(root = %root.display(), "Initialized rsync driver");
        Ok(Arc::new_cyclic(|this| Self {
            root,
            this: this.clone(),
        }))
    }

    fn volume_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn snapshots_of(&self, name: &str) -> SnapshotStore {
        SnapshotStore::new(
            name,
            self.root.join(DriverType::Rsync.marker()).join(name),
        )
    }

    fn handle(&self, name: &str) -> Arc<dyn Volume> {
        Arc::new(RsyncVolume {
            name: name.to_string(),
            path: self.volume_path(name),
            snapshots: self.snapshots_of(name),
            driver: self.this.clone(),
        })
    }
}

impl Driver for RsyncDriver {
    fn root(&self) -> &Path {
        &self.root
    }

    fn driver_type(&self) -> DriverType {
        DriverType::Rsync
    }

    fn create(&self, name: &str) -> VolstoreResult<Arc<dyn Volume>> {
        validate_name(name)?;
        if self.exists(name) {
            return Err(VolstoreError::VolumeExists {
                name: name.to_string(),
            });
        }
        let path = self.volume_path(name);
        fs::create_dir(&path)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;

        tracing::info!(name, path = %path.display(), "Volume created");
        Ok(self.handle(name))
    }

    fn remove(&self, name: &str) -> VolstoreResult<()> {
        validate_name(name)?;
        let snapshots = self.snapshots_of(name);
        if snapshots.base().exists() {
            fs::remove_dir_all(snapshots.base())?;
        }
        let path = self.volume_path(name);
        if path.exists() {
            fs::remove_dir_all(&path)?;
            tracing::info!(name, "Volume removed");
        }
        Ok(())
    }

    fn get(&self, name: &str) -> VolstoreResult<Arc<dyn Volume>> {
        if !self.exists(name) {
            return Err(VolstoreError::VolumeNotFound {
                name: name.to_string(),
            });
        }
        Ok(self.handle(name))
    }

    fn release(&self, _name: &str) -> VolstoreResult<()> {
        Ok(())
    }

    fn list(&self) -> Vec<String> {
        volume_dirs(&self.root).unwrap_or_else(|e| {
            tracing::warn!(root = %self.root.display(), error = %e, "Could not list volumes");
            Vec::new()
        })
    }

    fn exists(&self, name: &str) -> bool {
        validate_name(name).is_ok() && self.volume_path(name).is_dir()
    }

    fn cleanup(&self) -> VolstoreResult<()> {
        Ok(())
    }

    fn status(&self) -> VolstoreResult<Status> {
        let mut status = Status::for_root(DriverType::Rsync, &self.root)?;
        status
            .details
            .insert("volumes".to_string(), self.list().len().to_string());
        Ok(status)
    }
}

/// Volume of an [`RsyncDriver`].
#[derive(Debug)]
pub struct RsyncVolume {
    name: String,
    path: PathBuf,
    snapshots: SnapshotStore,
    driver: Weak<RsyncDriver>,
}

impl Volume for RsyncVolume {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn driver(&self) -> Option<Arc<dyn Driver>> {
        self.driver.upgrade().map(|d| d as Arc<dyn Driver>)
    }

    fn snapshot(&self, label: &str) -> VolstoreResult<()> {
        self.snapshots.begin(label)?;
        if let Err(e) = copy_tree(&self.path, &self.snapshots.data_dir(label)) {
            let _ = self.snapshots.forget(label);
            return Err(e);
        }
        tracing::info!(volume = %self.name, label, "Snapshot created");
        Ok(())
    }

    fn write_metadata(&self, label: &str, name: &str) -> VolstoreResult<Box<dyn Write + Send>> {
        self.snapshots.write_metadata(label, name)
    }

    fn read_metadata(&self, label: &str, name: &str) -> VolstoreResult<Box<dyn Read + Send>> {
        self.snapshots.read_metadata(label, name)
    }

    fn snapshots(&self) -> VolstoreResult<Vec<String>> {
        self.snapshots.list()
    }

    fn remove_snapshot(&self, label: &str) -> VolstoreResult<()> {
        self.snapshots.require(label)?;
        self.snapshots.forget(label)?;
        tracing::info!(volume = %self.name, label, "Snapshot removed");
        Ok(())
    }

    fn rollback(&self, label: &str) -> VolstoreResult<()> {
        self.snapshots.require(label)?;
        clear_dir(&self.path)?;
        copy_tree(&self.snapshots.data_dir(label), &self.path)?;
        tracing::info!(volume = %self.name, label, "Rolled back");
        Ok(())
    }

    fn export(&self, label: &str, parent: &str, file: &Path) -> VolstoreResult<()> {
        self.snapshots.export(label, parent, file)
    }

    fn import(&self, label: &str, file: &Path) -> VolstoreResult<()> {
        self.snapshots
            .import(label, file, |data| Ok(fs::create_dir_all(data)?))?;
        Ok(())
    }
}

/// Recursively copy `src` into `dst`, preserving modes and symlinks.
///
/// Sockets, FIFOs and device nodes are recreated rather than read. A device
/// node that cannot be created without privilege is skipped with a warning.
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> VolstoreResult<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(std::io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            let mode = entry.metadata().map_err(std::io::Error::from)?.permissions();
            fs::set_permissions(&target, mode)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
        } else if is_special(file_type) {
            let meta = entry.metadata().map_err(std::io::Error::from)?;
            copy_special(file_type, &meta, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn is_special(file_type: fs::FileType) -> bool {
    file_type.is_socket()
        || file_type.is_fifo()
        || file_type.is_block_device()
        || file_type.is_char_device()
}

fn copy_special(file_type: fs::FileType, meta: &fs::Metadata, target: &Path) -> VolstoreResult<()> {
    use rustix::fs::{CWD, FileType, Mode, mknodat};

    let kind = FileType::from_raw_mode(meta.mode());
    let mode = Mode::from_raw_mode(meta.mode() & 0o7777);
    let device = file_type.is_block_device() || file_type.is_char_device();
    let dev = if device { meta.rdev() } else { 0 };

    match mknodat(CWD, target, kind, mode, dev) {
        Ok(()) => Ok(()),
        Err(e) if device && e == rustix::io::Errno::PERM => {
            tracing::warn!(path = %target.display(), "Skipping device node; not permitted");
            Ok(())
        }
        Err(e) => Err(std::io::Error::from(e).into()),
    }
}

/// Remove everything inside `dir`, keeping `dir` itself.
fn clear_dir(dir: &Path) -> VolstoreResult<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
