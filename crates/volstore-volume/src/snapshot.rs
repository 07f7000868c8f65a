//! On-disk snapshot bookkeeping shared by the built-in drivers.
//!
//! Snapshots of volume `v` live under `{root}/.{kind}/{v}/{label}/`:
//!
//! ```text
//! {label}/
//!   data/        # frozen copy of the volume
//!   metadata/    # opaque entries written by callers
//! ```
//!
//! Exports are tar archives with the same two directories plus a
//! `manifest.json` entry.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use volstore_common::{VolstoreError, VolstoreResult};

use crate::driver::is_valid_name;

const DATA_DIR: &str = "data";
const METADATA_DIR: &str = "metadata";
const MANIFEST: &str = "manifest.json";

/// Describes an exported snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportManifest {
    /// Volume the snapshot was taken from.
    pub volume: String,
    /// Snapshot label.
    pub label: String,
    /// Label the export was based on, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// When the archive was written.
    pub exported_at: DateTime<Utc>,
}

/// Snapshot directory of one volume.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    volume: String,
    base: PathBuf,
}

impl SnapshotStore {
    /// Store for `volume` rooted at `base`.
    pub fn new(volume: &str, base: impl Into<PathBuf>) -> Self {
        Self {
            volume: volume.to_string(),
            base: base.into(),
        }
    }

    /// Directory holding every snapshot of the volume.
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Directory of one snapshot.
    #[must_use]
    pub fn label_dir(&self, label: &str) -> PathBuf {
        self.base.join(label)
    }

    /// Frozen data of one snapshot.
    #[must_use]
    pub fn data_dir(&self, label: &str) -> PathBuf {
        self.label_dir(label).join(DATA_DIR)
    }

    fn metadata_dir(&self, label: &str) -> PathBuf {
        self.label_dir(label).join(METADATA_DIR)
    }

    /// Whether the snapshot exists.
    #[must_use]
    pub fn exists(&self, label: &str) -> bool {
        is_valid_name(label) && self.label_dir(label).is_dir()
    }

    /// Fail unless the label is free; prepare the snapshot's metadata directory.
    ///
    /// The data directory is left for the driver to populate.
    pub(crate) fn begin(&self, label: &str) -> VolstoreResult<()> {
        if !is_valid_name(label) {
            return Err(VolstoreError::InvalidSnapshotLabel {
                label: label.to_string(),
            });
        }
        if self.exists(label) {
            return Err(VolstoreError::SnapshotExists {
                label: label.to_string(),
            });
        }
        fs::create_dir_all(self.metadata_dir(label))?;
        Ok(())
    }

    /// Fail unless the snapshot exists.
    pub(crate) fn require(&self, label: &str) -> VolstoreResult<()> {
        if self.exists(label) {
            Ok(())
        } else {
            Err(VolstoreError::SnapshotDoesNotExist {
                label: label.to_string(),
            })
        }
    }

    /// Labels of all snapshots, sorted.
    pub(crate) fn list(&self) -> VolstoreResult<Vec<String>> {
        if !self.base.exists() {
            return Ok(Vec::new());
        }
        let mut labels = Vec::new();
        for entry in fs::read_dir(&self.base)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(label) = entry.file_name().to_str() {
                labels.push(label.to_string());
            }
        }
        labels.sort();
        Ok(labels)
    }

    pub(crate) fn write_metadata(
        &self,
        label: &str,
        name: &str,
    ) -> VolstoreResult<Box<dyn Write + Send>> {
        self.require(label)?;
        check_metadata_name(label, name)?;
        let dir = self.metadata_dir(label);
        fs::create_dir_all(&dir)?;
        Ok(Box::new(File::create(dir.join(name))?))
    }

    pub(crate) fn read_metadata(
        &self,
        label: &str,
        name: &str,
    ) -> VolstoreResult<Box<dyn Read + Send>> {
        self.require(label)?;
        check_metadata_name(label, name)?;
        Ok(Box::new(File::open(self.metadata_dir(label).join(name))?))
    }

    /// Remove the bookkeeping of a snapshot whose data is already gone.
    pub(crate) fn forget(&self, label: &str) -> VolstoreResult<()> {
        fs::remove_dir_all(self.label_dir(label)).map_err(|e| VolstoreError::RemovingSnapshot {
            label: label.to_string(),
            message: e.to_string(),
        })
    }

    /// Write snapshot `label` as a tar archive.
    pub(crate) fn export(&self, label: &str, parent: &str, file: &Path) -> VolstoreResult<()> {
        self.require(label)?;
        if !parent.is_empty() {
            self.require(parent)?;
        }

        let manifest = ExportManifest {
            volume: self.volume.clone(),
            label: label.to_string(),
            parent: (!parent.is_empty()).then(|| parent.to_string()),
            exported_at: Utc::now(),
        };
        let manifest = serde_json::to_vec_pretty(&manifest)?;

        let mut builder = tar::Builder::new(File::create(file)?);
        builder.follow_symlinks(false);
        let mut header = tar::Header::new_gnu();
        header.set_size(manifest.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(u64::try_from(Utc::now().timestamp()).unwrap_or_default());
        header.set_cksum();
        builder.append_data(&mut header, MANIFEST, manifest.as_slice())?;
        builder.append_dir_all(DATA_DIR, self.data_dir(label))?;
        builder.append_dir_all(METADATA_DIR, self.metadata_dir(label))?;
        builder.into_inner()?.sync_all()?;

        tracing::info!(
            volume = %self.volume,
            label,
            file = %file.display(),
            "Exported snapshot"
        );
        Ok(())
    }

    /// Unpack an archive written by [`SnapshotStore::export`] into `label`.
    ///
    /// `prepare_data` runs before unpacking and must create the data
    /// directory when the backend needs something other than a plain directory.
    pub(crate) fn import(
        &self,
        label: &str,
        file: &Path,
        prepare_data: impl FnOnce(&Path) -> VolstoreResult<()>,
    ) -> VolstoreResult<ExportManifest> {
        self.begin(label)?;
        let result = (|| {
            prepare_data(&self.data_dir(label))?;
            self.unpack(label, file)
        })();
        if result.is_err() {
            let _ = fs::remove_dir_all(self.label_dir(label));
        }
        result
    }

    fn unpack(&self, label: &str, file: &Path) -> VolstoreResult<ExportManifest> {
        let dest = self.label_dir(label);
        let mut archive = tar::Archive::new(File::open(file)?);
        let mut manifest = None;

        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.into_owned();
            if path == Path::new(MANIFEST) {
                let mut buf = Vec::new();
                entry.read_to_end(&mut buf)?;
                manifest = Some(serde_json::from_slice::<ExportManifest>(&buf)?);
                continue;
            }
            // unpack_in refuses entries escaping `dest`
            entry.unpack_in(&dest)?;
        }

        let manifest = manifest.ok_or_else(|| {
            VolstoreError::Serialization(format!("{} has no {MANIFEST}", file.display()))
        })?;
        tracing::info!(
            volume = %self.volume,
            label,
            from = %manifest.label,
            file = %file.display(),
            "Imported snapshot"
        );
        Ok(manifest)
    }
}

fn check_metadata_name(label: &str, name: &str) -> VolstoreResult<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(VolstoreError::InvalidMetadataName {
            label: label.to_string(),
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn begin_rejects_duplicates() {
        let temp = tempdir().unwrap();
        let store = SnapshotStore::new("vol", temp.path());

        store.begin("one").unwrap();
        assert!(matches!(
            store.begin("one"),
            Err(VolstoreError::SnapshotExists { .. })
        ));
        assert_eq!(store.list().unwrap(), vec!["one"]);
    }

    #[test]
    fn bad_labels_and_entry_names_are_named() {
        let temp = tempdir().unwrap();
        let store = SnapshotStore::new("vol", temp.path());

        let err = store.begin("../up").unwrap_err();
        assert!(matches!(
            &err,
            VolstoreError::InvalidSnapshotLabel { label } if label == "../up"
        ));
        assert_eq!(err.to_string(), "Invalid snapshot label: ../up");
        assert!(matches!(
            store.begin(".hidden"),
            Err(VolstoreError::InvalidSnapshotLabel { .. })
        ));

        store.begin("one").unwrap();
        assert!(matches!(
            store.write_metadata("one", "a/b"),
            Err(VolstoreError::InvalidMetadataName { label, name }) if label == "one" && name == "a/b"
        ));
        assert_eq!(store.list().unwrap(), vec!["one"]);
    }

    #[test]
    fn metadata_requires_snapshot() {
        let temp = tempdir().unwrap();
        let store = SnapshotStore::new("vol", temp.path());

        assert!(matches!(
            store.write_metadata("missing", "meta"),
            Err(VolstoreError::SnapshotDoesNotExist { .. })
        ));

        store.begin("one").unwrap();
        store
            .write_metadata("one", "meta")
            .unwrap()
            .write_all(b"hello")
            .unwrap();
        let mut out = String::new();
        store
            .read_metadata("one", "meta")
            .unwrap()
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn export_then_import_under_new_label() {
        let temp = tempdir().unwrap();
        let store = SnapshotStore::new("vol", temp.path().join("snaps"));
        store.begin("one").unwrap();
        fs::create_dir_all(store.data_dir("one").join("sub")).unwrap();
        fs::write(store.data_dir("one").join("sub/file"), "payload").unwrap();
        store
            .write_metadata("one", "services")
            .unwrap()
            .write_all(b"[]")
            .unwrap();

        let archive = temp.path().join("one.tar");
        store.export("one", "", &archive).unwrap();

        let manifest = store
            .import("two", &archive, |data| Ok(fs::create_dir_all(data)?))
            .unwrap();
        assert_eq!(manifest.label, "one");
        assert_eq!(manifest.parent, None);
        assert_eq!(
            fs::read_to_string(store.data_dir("two").join("sub/file")).unwrap(),
            "payload"
        );
        assert!(store.label_dir("two").join("metadata/services").exists());
        assert!(!store.label_dir("two").join(MANIFEST).exists());
    }

    #[test]
    fn failed_import_leaves_no_label() {
        let temp = tempdir().unwrap();
        let store = SnapshotStore::new("vol", temp.path().join("snaps"));
        let bogus = temp.path().join("bogus.tar");
        fs::write(&bogus, "not a tar").unwrap();

        assert!(store.import("x", &bogus, |_| Ok(())).is_err());
        assert!(!store.exists("x"));
    }
}
