//! Driver registry.
//!
//! Binds backend kinds to constructors and canonical roots to live drivers.
//! One registry is created per process and shared by `Arc`; it replaces any
//! notion of global driver tables.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use volstore_common::fsutil::clean_path;
use volstore_common::{CommandRunner, Privilege, SystemRunner, VolstoreError, VolstoreResult};

use crate::detect::Detector;
use crate::driver::{Driver, DriverContext, DriverInit, DriverType, Statuses};

/// Process-scoped table of driver constructors and bound drivers.
pub struct DriverRegistry {
    ctx: DriverContext,
    detector: Option<fn(&Path) -> std::io::Result<u64>>,
    inits: RwLock<HashMap<DriverType, DriverInit>>,
    pub(crate) drivers: RwLock<HashMap<PathBuf, Arc<dyn Driver>>>,
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.inits.read().keys().copied().collect();
        kinds.sort();
        let mut roots: Vec<_> = self.drivers.read().keys().cloned().collect();
        roots.sort();
        f.debug_struct("DriverRegistry")
            .field("registered", &kinds)
            .field("roots", &roots)
            .finish_non_exhaustive()
    }
}

impl DriverRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, privilege: Privilege) -> Self {
        Self {
            ctx: DriverContext::new(runner, privilege),
            detector: None,
            inits: RwLock::new(HashMap::new()),
            drivers: RwLock::new(HashMap::new()),
        }
    }

    /// A registry with the built-in `btrfs` and `rsync` drivers registered.
    #[must_use]
    pub fn with_builtin(runner: Arc<dyn CommandRunner>, privilege: Privilege) -> Self {
        let registry = Self::new(runner, privilege);
        registry
            .inits
            .write()
            .extend(builtin_drivers());
        registry
    }

    /// A registry for this host: system commands, current privilege, built-in drivers.
    #[must_use]
    pub fn system() -> Self {
        Self::with_builtin(Arc::new(SystemRunner), Privilege::current())
    }

    /// Replace the filesystem-magic probe used during detection.
    #[must_use]
    pub fn with_magic_probe(mut self, probe: fn(&Path) -> std::io::Result<u64>) -> Self {
        self.detector = Some(probe);
        self
    }

    /// Context handed to driver constructors.
    #[must_use]
    pub const fn context(&self) -> &DriverContext {
        &self.ctx
    }

    /// Register a constructor for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`VolstoreError::DriverExists`] if `kind` already has one.
    pub fn register(&self, kind: DriverType, init: DriverInit) -> VolstoreResult<()> {
        let mut inits = self.inits.write();
        if inits.contains_key(&kind) {
            return Err(VolstoreError::DriverExists {
                kind: kind.to_string(),
            });
        }
        inits.insert(kind, init);
        tracing::debug!(%kind, "Registered driver");
        Ok(())
    }

    /// Whether `kind` has a constructor.
    #[must_use]
    pub fn registered(&self, kind: DriverType) -> bool {
        self.inits.read().contains_key(&kind)
    }

    /// Drop the constructor for `kind` and every driver bound with it.
    pub fn unregister(&self, kind: DriverType) {
        self.inits.write().remove(&kind);
        self.drivers
            .write()
            .retain(|_, driver| driver.driver_type() != kind);
    }

    /// Detect the backend owning `root` with this registry's executor.
    ///
    /// # Errors
    ///
    /// See [`Detector::detect`].
    pub fn detect(&self, root: &Path) -> VolstoreResult<DriverType> {
        let mut detector = Detector::new(self.ctx.runner.as_ref(), self.ctx.privilege);
        if let Some(probe) = self.detector {
            detector = detector.with_magic_probe(probe);
        }
        detector.detect(root)
    }

    /// Bind a `kind` driver to `root`.
    ///
    /// Binding an already bound root is a no-op. Otherwise the root must be
    /// absolute and must not already belong to a different backend.
    ///
    /// # Errors
    ///
    /// Returns [`VolstoreError::DriverNotSupported`] for an unregistered kind,
    /// [`VolstoreError::PathIsNotAbs`] for a relative root,
    /// [`VolstoreError::DriverAlreadyInit`] when another backend owns the
    /// root, or any detection or construction error.
    pub fn init_driver(
        &self,
        kind: DriverType,
        root: impl AsRef<Path>,
        args: &[String],
    ) -> VolstoreResult<()> {
        let Some(init) = self.inits.read().get(&kind).cloned() else {
            return Err(VolstoreError::DriverNotSupported {
                kind: kind.to_string(),
            });
        };

        let root = clean_path(root.as_ref());
        let mut drivers = self.drivers.write();
        if drivers.contains_key(&root) {
            return Ok(());
        }
        if !root.is_absolute() {
            return Err(VolstoreError::PathIsNotAbs { path: root });
        }

        match self.detect(&root) {
            Ok(existing) if existing != kind => {
                tracing::error!(
                    requested = %kind,
                    %existing,
                    root = %root.display(),
                    "Unable to initialize driver: root has an existing volume driver"
                );
                return Err(VolstoreError::DriverAlreadyInit {
                    root,
                    requested: kind.to_string(),
                    existing: existing.to_string(),
                });
            }
            Ok(_) | Err(VolstoreError::DriverNotInit { .. }) => {}
            Err(e) => return Err(e),
        }

        let driver = init(&root, args, &self.ctx)?;
        tracing::info!(%kind, root = %root.display(), "Driver initialized");
        drivers.insert(root, driver);
        Ok(())
    }

    /// The driver bound at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`VolstoreError::DriverNotInit`] if nothing is bound there.
    pub fn get_driver(&self, root: impl AsRef<Path>) -> VolstoreResult<Arc<dyn Driver>> {
        let root = clean_path(root.as_ref());
        self.drivers
            .read()
            .get(&root)
            .cloned()
            .ok_or(VolstoreError::DriverNotInit { path: root })
    }

    /// Roots of all bound drivers, sorted.
    #[must_use]
    pub fn roots(&self) -> Vec<PathBuf> {
        let mut roots: Vec<_> = self.drivers.read().keys().cloned().collect();
        roots.sort();
        roots
    }

    /// Clean up every bound driver.
    ///
    /// # Errors
    ///
    /// Returns [`VolstoreError::BadDriverShutdown`] if any driver failed.
    pub fn shutdown_all(&self) -> VolstoreResult<()> {
        let drivers: Vec<_> = self.drivers.read().values().cloned().collect();
        let mut failed = 0;
        for driver in drivers {
            tracing::debug!(
                kind = %driver.driver_type(),
                root = %driver.root().display(),
                "Shutting down driver"
            );
            if let Err(e) = driver.cleanup() {
                tracing::error!(
                    kind = %driver.driver_type(),
                    root = %driver.root().display(),
                    error = %e,
                    "Unable to clean up driver"
                );
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(VolstoreError::BadDriverShutdown { failed });
        }
        Ok(())
    }

    /// Status of drivers.
    ///
    /// With no names, every driver keyed by root. Otherwise each name is
    /// keyed to the status of a driver holding a volume of that name. Drivers
    /// whose status cannot be read are logged and left out.
    #[must_use]
    pub fn status(&self, volume_names: &[&str]) -> Statuses {
        let drivers: Vec<_> = self.drivers.read().values().cloned().collect();
        let mut statuses = Statuses::new();

        for driver in drivers {
            let keys: Vec<String> = if volume_names.is_empty() {
                vec![driver.root().display().to_string()]
            } else {
                volume_names
                    .iter()
                    .filter(|name| driver.get(name).is_ok())
                    .map(ToString::to_string)
                    .collect()
            };
            if keys.is_empty() {
                continue;
            }
            match driver.status() {
                Ok(status) => {
                    for key in keys {
                        statuses.insert(key, status.clone());
                    }
                }
                Err(e) => tracing::warn!(
                    root = %driver.root().display(),
                    error = %e,
                    "Error getting driver status"
                ),
            }
        }
        statuses
    }
}

fn builtin_drivers() -> [(DriverType, DriverInit); 2] {
    [
        (DriverType::Btrfs, Arc::new(crate::btrfs::init) as DriverInit),
        (DriverType::Rsync, Arc::new(crate::rsync::init) as DriverInit),
    ]
}
