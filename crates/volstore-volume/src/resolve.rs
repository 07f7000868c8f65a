//! Path resolution: absolute path to (driver root, volume name).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use volstore_common::fsutil::clean_path;
use volstore_common::{VolstoreError, VolstoreResult};

use crate::driver::Volume;
use crate::registry::DriverRegistry;

impl DriverRegistry {
    /// Split `path` into the nearest bound driver root and the remainder.
    ///
    /// Walking up from the leaf means the longest bound root wins. When
    /// `path` is itself a bound root the remainder is empty.
    ///
    /// # Errors
    ///
    /// Returns [`VolstoreError::PathIsNotAbs`] for relative paths and
    /// [`VolstoreError::DriverNotInit`] when no bound root encloses `path`.
    pub fn split_path(&self, path: impl AsRef<Path>) -> VolstoreResult<(PathBuf, String)> {
        let path = clean_path(path.as_ref());
        if !path.is_absolute() {
            return Err(VolstoreError::PathIsNotAbs { path });
        }

        let drivers = self.drivers.read();
        if drivers.contains_key(&path) {
            return Ok((path, String::new()));
        }

        let mut dir = path.as_path();
        while let Some(parent) = dir.parent() {
            if drivers.contains_key(parent) {
                let rel = path
                    .strip_prefix(parent)
                    .map_err(|e| VolstoreError::Io(std::io::Error::other(e.to_string())))?;
                return Ok((parent.to_path_buf(), rel.to_string_lossy().into_owned()));
            }
            dir = parent;
        }

        Err(VolstoreError::DriverNotInit { path })
    }

    /// Load volume `name` under the driver at `root`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`VolstoreError::BadMount`] when `name` does not resolve to a
    /// direct child of `root`, [`VolstoreError::PathIsDriver`] when it
    /// resolves to the root itself, or any driver error.
    pub fn mount(&self, name: &str, root: impl AsRef<Path>) -> VolstoreResult<Arc<dyn Volume>> {
        let root = clean_path(root.as_ref());
        let (found_root, found_name) = self.split_path(root.join(name))?;
        if found_root != root || found_name != name {
            if found_name.is_empty() && found_root == root {
                tracing::error!(name, root = %root.display(), "Volume path is a driver");
                return Err(VolstoreError::PathIsDriver { path: root });
            }
            tracing::error!(
                name,
                root = %root.display(),
                found = %found_root.display(),
                "Cannot mount volume; it resolves elsewhere"
            );
            return Err(VolstoreError::BadMount {
                name: name.to_string(),
                root,
            });
        }

        tracing::debug!(name, root = %root.display(), "Mounting volume");
        let driver = self.get_driver(&root)?;
        let volume = if driver.exists(name) {
            tracing::debug!(name, "Volume exists; loading");
            driver.get(name)
        } else {
            tracing::debug!(name, "Volume does not exist; creating");
            driver.create(name)
        };
        volume.inspect_err(|e| tracing::error!(name, error = %e, "Error mounting volume"))
    }

    /// Resolve `path` to its driver and mount the volume it names.
    ///
    /// # Errors
    ///
    /// Returns [`VolstoreError::PathIsDriver`] when `path` is a driver root,
    /// or any error from [`DriverRegistry::split_path`] and
    /// [`DriverRegistry::mount`].
    pub fn find_mount(&self, path: impl AsRef<Path>) -> VolstoreResult<Arc<dyn Volume>> {
        let (root, name) = self.split_path(path)?;
        if name.is_empty() {
            return Err(VolstoreError::PathIsDriver { path: root });
        }
        self.mount(&name, root)
    }
}
