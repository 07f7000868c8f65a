//! Bind mounts into the export tree.

use std::fs;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use volstore_common::exec::command_failed;
use volstore_common::fsutil::clean_path;
use volstore_common::{CommandRunner, Privilege, VolstoreResult};

/// Exit-status bit mount(8) sets on a generic mount failure. A bind mount
/// failing this way is taken as a stale NFS handle and retried as a remount.
pub const MOUNT_FAILURE: i32 = 32;

/// One record of the live mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Mounted device or source path.
    pub source: String,
    /// Mount point.
    pub target: PathBuf,
    /// Filesystem type.
    pub fstype: String,
    /// Mount options.
    pub options: String,
}

/// Parse `/proc/mounts`-formatted text.
///
/// Fields are whitespace separated; records with fewer than two fields are
/// skipped. Octal escapes such as `\040` are decoded.
#[must_use]
pub fn parse_mount_table(contents: &str) -> Vec<MountEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = unescape(fields.next()?);
            let target = PathBuf::from(unescape(fields.next()?));
            Some(MountEntry {
                source,
                target,
                fstype: fields.next().map(unescape).unwrap_or_default(),
                options: fields.next().map(unescape).unwrap_or_default(),
            })
        })
        .collect()
}

fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..=i + 3].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = bytes[i + 1..=i + 3]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Bind-mounts volumes into the export tree and reads the mount table.
#[derive(Debug, Clone)]
pub struct Mounter {
    runner: Arc<dyn CommandRunner>,
    privilege: Privilege,
    mount_table: PathBuf,
}

impl Mounter {
    /// A mounter reading `mount_table` and running commands through `runner`.
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        privilege: Privilege,
        mount_table: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            privilege,
            mount_table: mount_table.into(),
        }
    }

    /// Current mount table.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be read.
    pub fn entries(&self) -> io::Result<Vec<MountEntry>> {
        let contents = fs::read_to_string(&self.mount_table)?;
        Ok(parse_mount_table(&contents))
    }

    /// Whether anything is mounted at `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be read.
    pub fn is_mounted(&self, target: &Path) -> io::Result<bool> {
        let target = clean_path(target);
        Ok(self
            .entries()?
            .iter()
            .any(|entry| clean_path(&entry.target) == target))
    }

    /// Bind-mount `source` onto `target` unless something is already there.
    ///
    /// Returns whether a mount was performed. `target` is created first.
    /// When `mount` reports [`MOUNT_FAILURE`] the bind is retried once as a
    /// remount.
    ///
    /// # Errors
    ///
    /// Returns [`volstore_common::VolstoreError::CommandFailed`] with the
    /// combined command output when the mount fails, or an I/O error.
    pub fn bind_mount(&self, source: &Path, target: &Path) -> VolstoreResult<bool> {
        if self.is_mounted(target)? {
            tracing::debug!(target = %target.display(), "Already mounted");
            return Ok(false);
        }

        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o775)
            .create(target)?;

        tracing::info!(
            source = %source.display(),
            target = %target.display(),
            "Bind mounting volume"
        );

        let mut args = mount_args(&["bind"], source, target);
        let mut out = self.privilege.run(self.runner.as_ref(), "mount", args.clone())?;
        if out.status.is_some_and(|s| s != 0 && s & MOUNT_FAILURE != 0) {
            tracing::warn!(
                target = %target.display(),
                output = %out.text(),
                "Bind mount failed, possibly on a stale handle; retrying as remount"
            );
            args = mount_args(&["bind", "remount"], source, target);
            out = self.privilege.run(self.runner.as_ref(), "mount", args.clone())?;
        }

        if out.success() {
            Ok(true)
        } else {
            let (program, args) = self.privilege.command("mount", args);
            Err(command_failed(&program, &args, &out))
        }
    }

    /// Force-unmount `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if `umount` cannot be run or fails.
    pub fn unmount(&self, target: &Path) -> VolstoreResult<()> {
        tracing::info!(target = %target.display(), "Unmounting");
        self.privilege.run_checked(
            self.runner.as_ref(),
            "umount",
            ["-f".to_string(), target.to_string_lossy().into_owned()],
        )?;
        Ok(())
    }
}

fn mount_args(options: &[&str], source: &Path, target: &Path) -> Vec<String> {
    options
        .iter()
        .flat_map(|option| ["-o".to_string(), (*option).to_string()])
        .chain([
            source.to_string_lossy().into_owned(),
            target.to_string_lossy().into_owned(),
        ])
        .collect()
}
