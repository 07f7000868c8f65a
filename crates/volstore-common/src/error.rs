//! Common error types for volstore.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`VolstoreError`].
pub type VolstoreResult<T> = Result<T, VolstoreError>;

/// Common errors across the volstore crates.
#[derive(Error, Diagnostic, Debug)]
pub enum VolstoreError {
    /// A constructor is already registered for this backend kind.
    #[error("Driver already registered: {kind}")]
    #[diagnostic(code(volstore::registry::exists))]
    DriverExists {
        /// The backend kind.
        kind: String,
    },

    /// No constructor is registered for this backend kind.
    #[error("Driver not supported: {kind}")]
    #[diagnostic(
        code(volstore::registry::not_supported),
        help("Supported drivers are btrfs and rsync; devicemapper must be registered by the host")
    )]
    DriverNotSupported {
        /// The backend kind.
        kind: String,
    },

    /// No driver is bound at or above the path.
    #[error("Driver not initialized: {}", path.display())]
    #[diagnostic(code(volstore::registry::not_init))]
    DriverNotInit {
        /// The path that was looked up.
        path: PathBuf,
    },

    /// A different backend already owns the root.
    #[error(
        "Unable to initialize {requested} driver: {} has an existing {existing} volume driver",
        root.display()
    )]
    #[diagnostic(
        code(volstore::registry::already_init),
        help("Another process initialized this root with a different driver; refusing to continue")
    )]
    DriverAlreadyInit {
        /// The driver root.
        root: PathBuf,
        /// The backend kind requested by the caller.
        requested: String,
        /// The backend kind detected on disk.
        existing: String,
    },

    /// Driver roots and volume paths must be absolute.
    #[error("Path is not absolute: {}", path.display())]
    #[diagnostic(code(volstore::path::not_absolute))]
    PathIsNotAbs {
        /// The offending path.
        path: PathBuf,
    },

    /// The path is a driver root, not a volume.
    #[error("Path is initialized as a driver: {}", path.display())]
    #[diagnostic(code(volstore::path::is_driver))]
    PathIsDriver {
        /// The driver root.
        path: PathBuf,
    },

    /// A volume name does not resolve back under its driver root.
    #[error("Bad mount path: volume {name} does not resolve under {}", root.display())]
    #[diagnostic(code(volstore::path::bad_mount))]
    BadMount {
        /// The requested volume name.
        name: String,
        /// The requested driver root.
        root: PathBuf,
    },

    /// One or more drivers failed to clean up.
    #[error("Unable to shut down {failed} driver(s)")]
    #[diagnostic(code(volstore::registry::bad_shutdown))]
    BadDriverShutdown {
        /// Number of drivers whose cleanup failed.
        failed: usize,
    },

    /// Volume already exists.
    #[error("Volume already exists: {name}")]
    #[diagnostic(code(volstore::volume::exists))]
    VolumeExists {
        /// The volume name.
        name: String,
    },

    /// Volume not found.
    #[error("Volume not found: {name}")]
    #[diagnostic(code(volstore::volume::not_found))]
    VolumeNotFound {
        /// The volume name.
        name: String,
    },

    /// Invalid volume name.
    #[error("Invalid volume name: {name}")]
    #[diagnostic(
        code(volstore::volume::invalid_name),
        help("Volume names must be a single, non-hidden path component")
    )]
    InvalidVolumeName {
        /// The invalid name.
        name: String,
    },

    /// Invalid snapshot label.
    #[error("Invalid snapshot label: {label}")]
    #[diagnostic(
        code(volstore::snapshot::invalid_label),
        help("Snapshot labels must be a single, non-hidden path component")
    )]
    InvalidSnapshotLabel {
        /// The invalid label.
        label: String,
    },

    /// Invalid snapshot metadata entry name.
    #[error("Invalid metadata name {name} in snapshot {label}")]
    #[diagnostic(code(volstore::snapshot::invalid_metadata))]
    InvalidMetadataName {
        /// The snapshot label.
        label: String,
        /// The invalid entry name.
        name: String,
    },

    /// Snapshot already exists.
    #[error("Snapshot already exists: {label}")]
    #[diagnostic(code(volstore::snapshot::exists))]
    SnapshotExists {
        /// The snapshot label.
        label: String,
    },

    /// Snapshot does not exist.
    #[error("Snapshot does not exist: {label}")]
    #[diagnostic(code(volstore::snapshot::not_found))]
    SnapshotDoesNotExist {
        /// The snapshot label.
        label: String,
    },

    /// Snapshot could not be removed.
    #[error("Could not remove snapshot {label}: {message}")]
    #[diagnostic(code(volstore::snapshot::remove))]
    RemovingSnapshot {
        /// The snapshot label.
        label: String,
        /// Underlying failure.
        message: String,
    },

    /// Elevated rights are needed to complete the operation.
    #[error("Insufficient permissions to run command: {operation}")]
    #[diagnostic(
        code(volstore::permission_denied),
        help("Run as root or configure passwordless sudo for this command")
    )]
    InsufficientPermissions {
        /// The operation that was denied.
        operation: String,
    },

    /// An external command exited unsuccessfully.
    #[error("Command `{command}` failed ({}): {output}", status.map_or_else(|| "killed by signal".to_string(), |code| format!("exit status {code}")))]
    #[diagnostic(code(volstore::command))]
    CommandFailed {
        /// The full command line.
        command: String,
        /// Exit status, if the process exited normally.
        status: Option<i32>,
        /// Combined stdout and stderr.
        output: String,
    },

    /// The exported name is not a single directory name.
    #[error("Invalid exported name: {name}")]
    #[diagnostic(
        code(volstore::nfs::invalid_exported_name),
        help("Exported names must be at least two characters and contain no '/'")
    )]
    InvalidExportedName {
        /// The rejected name.
        name: String,
    },

    /// The local path to export is invalid.
    #[error("Invalid base path: {}", path.display())]
    #[diagnostic(code(volstore::nfs::invalid_base_path))]
    InvalidBasePath {
        /// The rejected path.
        path: PathBuf,
    },

    /// The base path exists but is not a directory.
    #[error("Base path is not a directory: {}", path.display())]
    #[diagnostic(code(volstore::nfs::base_path_not_dir))]
    BasePathNotDir {
        /// The rejected path.
        path: PathBuf,
    },

    /// The network specifier is not in CIDR form.
    #[error("Network value is not CIDR: {network}")]
    #[diagnostic(
        code(volstore::nfs::invalid_network),
        help("Use a value like '10.0.0.0/24' or '0.0.0.0/0'")
    )]
    InvalidNetwork {
        /// The rejected network.
        network: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(volstore::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(volstore::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(volstore::config))]
    Config {
        /// The error message.
        message: String,
    },
}

impl From<serde_json::Error> for VolstoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = VolstoreError::SnapshotExists {
            label: "nightly".to_string(),
        };
        assert_eq!(err.to_string(), "Snapshot already exists: nightly");
    }

    #[test]
    fn command_failed_display() {
        let err = VolstoreError::CommandFailed {
            command: "mount -o bind /a /b".to_string(),
            status: Some(32),
            output: "stale handle".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Command `mount -o bind /a /b` failed (exit status 32): stale handle"
        );

        let err = VolstoreError::CommandFailed {
            command: "umount -f /b".to_string(),
            status: None,
            output: String::new(),
        };
        assert!(err.to_string().contains("killed by signal"));
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: VolstoreError = io_err.into();
        assert!(matches!(err, VolstoreError::Io(_)));
    }
}
