//! Tenant volumes exported over NFS.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use volstore_common::{CommandRunner, Privilege, VolstoreResult};
use volstore_nfs::NfsServer;
use volstore_volume::{Driver, DriverRegistry, Volume};

use crate::config::Config;

/// Tenant volumes on one driver root, optionally exported over NFS.
#[derive(Debug)]
pub struct DistributedFilesystem {
    registry: DriverRegistry,
    root: PathBuf,
    nfs: Option<NfsServer>,
}

impl DistributedFilesystem {
    /// Wrap an already initialized driver root.
    ///
    /// # Errors
    ///
    /// Returns [`volstore_common::VolstoreError::DriverNotInit`] if no driver
    /// is bound at `root`.
    pub fn new(
        registry: DriverRegistry,
        root: impl AsRef<Path>,
        nfs: Option<NfsServer>,
    ) -> VolstoreResult<Self> {
        let driver = registry.get_driver(root)?;
        let root = driver.root().to_path_buf();
        if let Some(nfs) = &nfs {
            for name in driver.list() {
                nfs.add_volume(root.join(name));
            }
        }
        Ok(Self {
            registry,
            root,
            nfs,
        })
    }

    /// Bind the configured driver and, if enabled, start the NFS server.
    ///
    /// # Errors
    ///
    /// Returns any error from driver initialization or NFS setup.
    pub fn open(
        config: &Config,
        runner: Arc<dyn CommandRunner>,
        privilege: Privilege,
    ) -> VolstoreResult<Self> {
        let registry = DriverRegistry::with_builtin(runner.clone(), privilege);
        Self::open_with(config, registry, runner, privilege)
    }

    /// Like [`DistributedFilesystem::open`] with a caller-built registry.
    ///
    /// # Errors
    ///
    /// Returns any error from driver initialization or NFS setup.
    pub fn open_with(
        config: &Config,
        registry: DriverRegistry,
        runner: Arc<dyn CommandRunner>,
        privilege: Privilege,
    ) -> VolstoreResult<Self> {
        let root = config.volumes_root();
        registry.init_driver(config.storage.driver, &root, &config.storage.args)?;

        let nfs = if config.nfs.enabled {
            let server = NfsServer::new(config.nfs_config(privilege), runner)?;
            server.set_clients(config.nfs.clients.iter().cloned());
            Some(server)
        } else {
            None
        };
        Self::new(registry, root, nfs)
    }

    /// The driver registry.
    #[must_use]
    pub const fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    /// The driver root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The NFS server, when exports are enabled.
    #[must_use]
    pub const fn nfs(&self) -> Option<&NfsServer> {
        self.nfs.as_ref()
    }

    /// The driver bound at the root.
    ///
    /// # Errors
    ///
    /// Returns an error if the driver has been unbound.
    pub fn driver(&self) -> VolstoreResult<Arc<dyn Driver>> {
        self.registry.get_driver(&self.root)
    }

    /// Create a tenant volume and export it.
    ///
    /// Export failures are logged; the volume is still returned.
    ///
    /// # Errors
    ///
    /// Returns any error from creating the volume.
    pub fn create(&self, tenant: &str) -> VolstoreResult<Arc<dyn Volume>> {
        tracing::debug!(tenant, "Creating volume");
        let volume = self
            .driver()?
            .create(tenant)
            .inspect_err(|e| tracing::error!(tenant, error = %e, "Could not create volume"))?;
        tracing::info!(tenant, path = %volume.path().display(), "Volume created");

        if let Some(nfs) = &self.nfs {
            nfs.add_volume(volume.path());
            if let Err(e) = nfs.sync() {
                tracing::warn!(tenant, error = %e, "Error syncing exports");
            }
        }
        Ok(volume)
    }

    /// Unexport and delete a tenant volume.
    ///
    /// Export failures are logged and do not stop the removal.
    ///
    /// # Errors
    ///
    /// Returns any error from removing the volume.
    pub fn remove(&self, tenant: &str) -> VolstoreResult<()> {
        tracing::debug!(tenant, "Removing volume");
        if let Some(nfs) = &self.nfs {
            nfs.remove_volume(self.root.join(tenant));
            if let Err(e) = nfs.sync() {
                tracing::warn!(tenant, error = %e, "Error syncing exports");
            }
        }
        self.driver()?.remove(tenant)?;
        tracing::info!(tenant, "Volume removed");
        Ok(())
    }

    /// The tenant's volume, created on first use.
    ///
    /// # Errors
    ///
    /// Returns any path resolution or driver error.
    pub fn volume(&self, tenant: &str) -> VolstoreResult<Arc<dyn Volume>> {
        self.registry.find_mount(self.root.join(tenant))
    }

    /// Reconcile NFS exports; a no-op when exports are disabled.
    ///
    /// Returns the stale export directories removed.
    ///
    /// # Errors
    ///
    /// Returns the first failing reconciliation step.
    pub fn sync(&self) -> VolstoreResult<Vec<PathBuf>> {
        match &self.nfs {
            Some(nfs) => nfs.sync(),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use volstore_common::{CommandOutput, ScriptedRunner, VolstoreError};
    use volstore_volume::DriverType;

    fn ext4(_: &Path) -> std::io::Result<u64> {
        Ok(0xEF53)
    }

    fn config(temp: &Path, nfs: bool) -> Config {
        let mut config = Config::default().with_root(temp.join("root"));
        config.nfs.enabled = nfs;
        config.nfs.network = "10.0.0.0/8".to_string();
        config.nfs.exports = temp.join("exports");
        config.nfs.etc = temp.join("etc");
        config.nfs.mount_table = temp.join("mounts");
        config
    }

    fn open(config: &Config, runner: Arc<ScriptedRunner>) -> DistributedFilesystem {
        let registry =
            DriverRegistry::with_builtin(runner.clone(), Privilege::Root).with_magic_probe(ext4);
        DistributedFilesystem::open_with(config, registry, runner, Privilege::Root).unwrap()
    }

    #[test]
    fn create_without_nfs() {
        let temp = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let dfs = open(&config(temp.path(), false), runner.clone());

        let volume = dfs.create("tenant1").unwrap();
        assert_eq!(volume.path(), temp.path().join("root/volumes/tenant1"));
        assert!(dfs.nfs().is_none());
        assert!(dfs.sync().unwrap().is_empty());
        assert!(runner.calls().is_empty());
        assert_eq!(dfs.driver().unwrap().driver_type(), DriverType::Rsync);
    }

    #[test_log::test]
    fn create_exports_and_remove_unexports() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("etc")).unwrap();
        std::fs::write(temp.path().join("mounts"), "").unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let dfs = open(&config(temp.path(), true), runner.clone());

        dfs.create("tenant1").unwrap();
        let exports = std::fs::read_to_string(temp.path().join("etc/exports")).unwrap();
        assert!(exports.contains("volstore_var/tenant1\t10.0.0.0/8("));
        assert_eq!(runner.calls_to("mount").len(), 1);

        dfs.remove("tenant1").unwrap();
        let exports = std::fs::read_to_string(temp.path().join("etc/exports")).unwrap();
        assert!(!exports.contains("tenant1"));
        assert!(!temp.path().join("root/volumes/tenant1").exists());
    }

    #[test_log::test]
    fn sync_failures_do_not_fail_create() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("etc")).unwrap();
        std::fs::write(temp.path().join("mounts"), "").unwrap();
        let runner = Arc::new(ScriptedRunner::with_handler(|program, _| match program {
            "mount" => CommandOutput::failed(1, "mount: permission denied"),
            _ => CommandOutput::ok(),
        }));
        let dfs = open(&config(temp.path(), true), runner);

        let volume = dfs.create("tenant1").unwrap();
        assert!(volume.path().is_dir());
        assert!(matches!(
            dfs.sync(),
            Err(VolstoreError::CommandFailed { .. })
        ));
    }

    #[test_log::test]
    fn existing_volumes_are_exported_on_open() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("etc")).unwrap();
        std::fs::write(temp.path().join("mounts"), "").unwrap();
        let cfg = config(temp.path(), true);

        open(&cfg, Arc::new(ScriptedRunner::new()))
            .create("tenant1")
            .unwrap();

        let dfs = open(&cfg, Arc::new(ScriptedRunner::new()));
        let nfs = dfs.nfs().unwrap();
        assert_eq!(nfs.volumes(), vec![temp.path().join("root/volumes/tenant1")]);
    }

    #[test]
    fn volume_resolves_under_root() {
        let temp = tempfile::tempdir().unwrap();
        let dfs = open(&config(temp.path(), false), Arc::new(ScriptedRunner::new()));
        let volume = dfs.volume("tenant2").unwrap();
        assert_eq!(volume.name(), "tenant2");
        assert!(matches!(
            dfs.volume("../escape"),
            Err(VolstoreError::InvalidVolumeName { .. } | VolstoreError::PathIsDriver { .. } | VolstoreError::DriverNotInit { .. })
        ));
    }
}
