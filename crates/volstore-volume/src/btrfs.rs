//! Copy-on-write subvolume driver.
//!
//! Every volume is a btrfs subvolume directly under the driver root and every
//! snapshot a read-only subvolume under `{root}/.btrfs/`. All subvolume
//! manipulation shells out to the `btrfs` tool through the driver's
//! [`CommandRunner`](volstore_common::CommandRunner).

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use volstore_common::{VolstoreError, VolstoreResult};

use crate::detect::is_btrfs_filesystem;
use crate::driver::{
    Driver, DriverContext, DriverType, Status, Volume, validate_name, volume_dirs,
};
use crate::snapshot::SnapshotStore;

/// Driver storing volumes as btrfs subvolumes.
#[derive(Debug)]
pub struct BtrfsDriver {
    root: PathBuf,
    ctx: DriverContext,
    this: Weak<BtrfsDriver>,
}

/// Registry constructor for [`BtrfsDriver`].
///
/// # Errors
///
/// Returns [`VolstoreError::Config`] if `root` is not on a btrfs filesystem.
pub fn init(root: &Path, _args: &[String], ctx: &DriverContext) -> VolstoreResult<Arc<dyn Driver>> {
    fs::create_dir_all(root)?;
    if !is_btrfs_filesystem(root)? {
        return Err(VolstoreError::Config {
            message: format!("{} is not on a btrfs filesystem", root.display()),
        });
    }
    Ok(BtrfsDriver::new(root, ctx.clone())?)
}

impl BtrfsDriver {
    /// Open (creating if needed) a driver at `root` without checking the
    /// filesystem type.
    ///
    /// # Errors
    ///
    /// Returns an error if the root or its marker directory cannot be created.
    pub fn new(root: impl Into<PathBuf>, ctx: DriverContext) -> VolstoreResult<Arc<Self>> {
        let root = root.into();
        fs::create_dir_all(root.join(DriverType::Btrfs.marker()))?;
        tracing::debug!(root = %root.display(), privilege = ?ctx.privilege, "Initialized btrfs driver");
        Ok(Arc::new_cyclic(|this| Self {
            root,
            ctx,
            this: this.clone(),
        }))
    }

    fn volume_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn snapshots_of(&self, name: &str) -> SnapshotStore {
        SnapshotStore::new(
            name,
            self.root.join(DriverType::Btrfs.marker()).join(name),
        )
    }

    fn handle(&self, name: &str) -> Arc<dyn Volume> {
        Arc::new(BtrfsVolume {
            name: name.to_string(),
            path: self.volume_path(name),
            snapshots: self.snapshots_of(name),
            driver: self.this.clone(),
        })
    }

    /// Run `btrfs args..` with the driver's privilege.
    fn btrfs<I, S>(&self, args: I) -> VolstoreResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ctx
            .privilege
            .run_checked(self.ctx.runner.as_ref(), "btrfs", args)?;
        Ok(())
    }

    fn delete_subvolume(&self, path: &Path) -> VolstoreResult<()> {
        self.btrfs(["subvolume".to_string(), "delete".to_string(), display(path)])
    }
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl Driver for BtrfsDriver {
    fn root(&self) -> &Path {
        &self.root
    }

    fn driver_type(&self) -> DriverType {
        DriverType::Btrfs
    }

    fn create(&self, name: &str) -> VolstoreResult<Arc<dyn Volume>> {
        validate_name(name)?;
        if self.exists(name) {
            return Err(VolstoreError::VolumeExists {
                name: name.to_string(),
            });
        }
        let path = self.volume_path(name);
        self.btrfs(["subvolume".to_string(), "create".to_string(), display(&path)])?;

        tracing::info!(name, path = %path.display(), "Subvolume created");
        Ok(self.handle(name))
    }

    fn remove(&self, name: &str) -> VolstoreResult<()> {
        validate_name(name)?;
        let snapshots = self.snapshots_of(name);
        for label in snapshots.list()? {
            let data = snapshots.data_dir(&label);
            if data.exists() {
                self.delete_subvolume(&data)?;
            }
        }
        if snapshots.base().exists() {
            fs::remove_dir_all(snapshots.base())?;
        }
        let path = self.volume_path(name);
        if path.exists() {
            self.delete_subvolume(&path)?;
            tracing::info!(name, "Subvolume removed");
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
            tracing::warn!(root = %self.root.display(), error = %e, "Could not list subvolumes");
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
        let mut status = Status::for_root(DriverType::Btrfs, &self.root)?;
        status
            .details
            .insert("volumes".to_string(), self.list().len().to_string());
        status
            .details
            .insert("privilege".to_string(), format!("{:?}", self.ctx.privilege).to_lowercase());
        Ok(status)
    }
}

/// Volume of a [`BtrfsDriver`].
#[derive(Debug)]
pub struct BtrfsVolume {
    name: String,
    path: PathBuf,
    snapshots: SnapshotStore,
    driver: Weak<BtrfsDriver>,
}

impl BtrfsVolume {
    fn owner(&self) -> VolstoreResult<Arc<BtrfsDriver>> {
        self.driver.upgrade().ok_or_else(|| VolstoreError::DriverNotInit {
            path: self.path.clone(),
        })
    }
}

impl Volume for BtrfsVolume {
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
        let driver = self.owner()?;
        self.snapshots.begin(label)?;
        let data = self.snapshots.data_dir(label);
        let result = driver.btrfs([
            "subvolume".to_string(),
            "snapshot".to_string(),
            "-r".to_string(),
            display(&self.path),
            display(&data),
        ]);
        if let Err(e) = result {
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
        let driver = self.owner()?;
        self.snapshots.require(label)?;
        let data = self.snapshots.data_dir(label);
        if data.exists() {
            driver
                .delete_subvolume(&data)
                .map_err(|e| VolstoreError::RemovingSnapshot {
                    label: label.to_string(),
                    message: e.to_string(),
                })?;
        }
        self.snapshots.forget(label)?;
        tracing::info!(volume = %self.name, label, "Snapshot removed");
        Ok(())
    }

    fn rollback(&self, label: &str) -> VolstoreResult<()> {
        let driver = self.owner()?;
        self.snapshots.require(label)?;
        if self.path.exists() {
            driver.delete_subvolume(&self.path)?;
        }
        driver.btrfs([
            "subvolume".to_string(),
            "snapshot".to_string(),
            display(&self.snapshots.data_dir(label)),
            display(&self.path),
        ])?;
        tracing::info!(volume = %self.name, label, "Rolled back");
        Ok(())
    }

    fn export(&self, label: &str, parent: &str, file: &Path) -> VolstoreResult<()> {
        self.snapshots.export(label, parent, file)
    }

    fn import(&self, label: &str, file: &Path) -> VolstoreResult<()> {
        let driver = self.owner()?;
        self.snapshots.import(label, file, |data| {
            driver.btrfs(["subvolume".to_string(), "create".to_string(), display(data)])
        })?;
        driver.btrfs([
            "property".to_string(),
            "set".to_string(),
            "-ts".to_string(),
            display(&self.snapshots.data_dir(label)),
            "ro".to_string(),
            "true".to_string(),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use volstore_common::{CommandOutput, Privilege, ScriptedRunner};

    /// Stands in for the btrfs tool by creating plain directories.
    fn fake_btrfs() -> Arc<ScriptedRunner> {
        Arc::new(ScriptedRunner::with_handler(|_program, args| {
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            let args = match args.as_slice() {
                ["-n", "btrfs", rest @ ..] => rest.to_vec(),
                other => other.to_vec(),
            };
            match args.as_slice() {
                ["subvolume", "create", path] => fs::create_dir_all(path).unwrap(),
                ["subvolume", "snapshot", .., src, dst] => {
                    crate::rsync::copy_tree(Path::new(src), Path::new(dst)).unwrap();
                }
                ["subvolume", "delete", path] => fs::remove_dir_all(path).unwrap(),
                _ => {}
            }
            CommandOutput::ok()
        }))
    }

    fn driver(root: &Path, runner: Arc<ScriptedRunner>, privilege: Privilege) -> Arc<BtrfsDriver> {
        BtrfsDriver::new(root, DriverContext::new(runner, privilege)).unwrap()
    }

    #[test]
    fn create_runs_subvolume_create() {
        let temp = tempfile::tempdir().unwrap();
        let runner = fake_btrfs();
        let driver = driver(temp.path(), runner.clone(), Privilege::Root);

        let vol = driver.create("tenant1").unwrap();
        assert!(vol.path().is_dir());
        assert_eq!(
            runner.calls(),
            vec![format!(
                "btrfs subvolume create {}",
                temp.path().join("tenant1").display()
            )]
        );
        assert!(matches!(
            driver.create("tenant1"),
            Err(VolstoreError::VolumeExists { .. })
        ));
    }

    #[test]
    fn commands_are_elevated_when_not_root() {
        let temp = tempfile::tempdir().unwrap();
        let runner = fake_btrfs();
        let driver = driver(temp.path(), runner.clone(), Privilege::Sudo);

        driver.create("tenant1").unwrap();
        assert!(runner.calls()[0].starts_with("sudo -n btrfs subvolume create"));
    }

    #[test]
    fn snapshot_lifecycle() {
        let temp = tempfile::tempdir().unwrap();
        let runner = fake_btrfs();
        let driver = driver(temp.path(), runner.clone(), Privilege::Root);
        let vol = driver.create("tenant1").unwrap();
        fs::write(vol.path().join("f"), "v1").unwrap();

        vol.snapshot("s1").unwrap();
        assert_eq!(vol.snapshots().unwrap(), vec!["s1"]);
        assert!(matches!(
            vol.snapshot("s1"),
            Err(VolstoreError::SnapshotExists { .. })
        ));

        fs::write(vol.path().join("f"), "v2").unwrap();
        vol.rollback("s1").unwrap();
        assert_eq!(fs::read_to_string(vol.path().join("f")).unwrap(), "v1");

        vol.remove_snapshot("s1").unwrap();
        assert!(vol.snapshots().unwrap().is_empty());
        assert!(matches!(
            vol.remove_snapshot("s1"),
            Err(VolstoreError::SnapshotDoesNotExist { .. })
        ));
    }

    #[test]
    fn failed_snapshot_command_leaves_no_label() {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir(temp.path().join("tenant1")).unwrap();
        let runner = Arc::new(ScriptedRunner::with_handler(|_, _| {
            CommandOutput::failed(1, "ERROR: not a subvolume")
        }));
        let driver = driver(temp.path(), runner, Privilege::Root);
        let vol = driver.get("tenant1").unwrap();

        let err = vol.snapshot("s1").unwrap_err();
        assert!(matches!(err, VolstoreError::CommandFailed { .. }));
        assert!(vol.snapshots().unwrap().is_empty());
    }

    #[test]
    fn remove_deletes_snapshots_then_volume() {
        let temp = tempfile::tempdir().unwrap();
        let runner = fake_btrfs();
        let driver = driver(temp.path(), runner.clone(), Privilege::Root);
        let vol = driver.create("tenant1").unwrap();
        vol.snapshot("s1").unwrap();
        runner.clear();

        driver.remove("tenant1").unwrap();
        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].ends_with("/.btrfs/tenant1/s1/data"));
        assert!(calls[1].ends_with("/tenant1"));
        assert!(!driver.exists("tenant1"));
    }
}
