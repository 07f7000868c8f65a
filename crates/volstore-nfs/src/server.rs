//! The export synchronizer.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use volstore_common::fsutil::{clean_path, read_if_exists, write_atomic};
use volstore_common::{CommandRunner, Privilege, StoragePaths, VolstoreError, VolstoreResult};

use crate::daemon::{Daemon, DaemonCommands};
use crate::managed::{export_line, render_exports, render_hosts_allow, render_hosts_deny};
use crate::mounts::Mounter;

/// Mode of every system file written.
pub const FILE_MODE: u32 = 0o664;

const DIR_MODE: u32 = 0o755;

/// Settings for an [`NfsServer`].
#[derive(Debug, Clone)]
pub struct NfsConfig {
    /// Directory holding the exported volumes.
    pub base_path: PathBuf,
    /// Name of the subtree under the exports root.
    pub exported_name: String,
    /// Network allowed to mount exports, in CIDR notation.
    pub network: String,
    /// Exports root, `/etc` and the mount table.
    pub paths: StoragePaths,
    /// Daemon lifecycle commands.
    pub daemon: DaemonCommands,
    /// How privileged commands are launched.
    pub privilege: Privilege,
}

impl NfsConfig {
    /// Settings with default system locations and daemon commands.
    pub fn new(
        base_path: impl Into<PathBuf>,
        exported_name: impl Into<String>,
        network: impl Into<String>,
    ) -> Self {
        Self {
            base_path: base_path.into(),
            exported_name: exported_name.into(),
            network: network.into(),
            paths: StoragePaths::new(),
            daemon: DaemonCommands::default(),
            privilege: Privilege::current(),
        }
    }

    /// Use `paths` for the exports root and system files.
    #[must_use]
    pub fn with_paths(mut self, paths: StoragePaths) -> Self {
        self.paths = paths;
        self
    }

    /// Use `daemon` to drive the NFS daemon.
    #[must_use]
    pub fn with_daemon(mut self, daemon: DaemonCommands) -> Self {
        self.daemon = daemon;
        self
    }

    /// Launch privileged commands this way.
    #[must_use]
    pub fn with_privilege(mut self, privilege: Privilege) -> Self {
        self.privilege = privilege;
        self
    }
}

#[derive(Debug, Default)]
struct State {
    clients: BTreeSet<String>,
    volumes: BTreeSet<PathBuf>,
    exported: BTreeSet<String>,
}

/// Reconciles the host's NFS configuration with a desired set of volumes
/// and clients.
///
/// Mutators only record intent; [`NfsServer::sync`] and
/// [`NfsServer::restart`] apply it. All of them serialize on one lock.
#[derive(Debug)]
pub struct NfsServer {
    base_path: PathBuf,
    exported_name: String,
    network: String,
    paths: StoragePaths,
    mounter: Mounter,
    daemon: Daemon,
    state: Mutex<State>,
}

impl NfsServer {
    /// Validate `config`, prepare the export directory and start the daemon.
    ///
    /// # Errors
    ///
    /// Returns [`VolstoreError::InvalidExportedName`],
    /// [`VolstoreError::InvalidBasePath`], [`VolstoreError::BasePathNotDir`]
    /// or [`VolstoreError::InvalidNetwork`] for bad settings, and any error
    /// from creating directories or starting the daemon.
    pub fn new(config: NfsConfig, runner: Arc<dyn CommandRunner>) -> VolstoreResult<Self> {
        let NfsConfig {
            base_path,
            exported_name,
            network,
            paths,
            daemon,
            privilege,
        } = config;

        if exported_name.len() < 2 || exported_name.contains('/') {
            return Err(VolstoreError::InvalidExportedName {
                name: exported_name,
            });
        }
        if base_path.as_os_str().len() < 2 {
            return Err(VolstoreError::InvalidBasePath { path: base_path });
        }
        verify_dir(&base_path)?;
        verify_dir(&paths.exports.join(&exported_name))?;
        parse_cidr(&network)?;

        let server = Self {
            base_path,
            exported_name,
            network,
            mounter: Mounter::new(runner.clone(), privilege, &paths.mount_table),
            daemon: Daemon::new(daemon, runner, privilege),
            paths,
            state: Mutex::new(State::default()),
        };
        server.daemon.start()?;

        tracing::info!(
            base = %server.base_path.display(),
            export = %server.export_path().display(),
            network = %server.network,
            "NFS server ready"
        );
        Ok(server)
    }

    /// Directory the volumes are bind-mounted under.
    #[must_use]
    pub fn export_path(&self) -> PathBuf {
        self.paths.exports.join(&self.exported_name)
    }

    /// Directory holding the exported volumes.
    #[must_use]
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Allowed clients, sorted.
    #[must_use]
    pub fn clients(&self) -> Vec<String> {
        self.state.lock().clients.iter().cloned().collect()
    }

    /// Replace the allowed clients.
    pub fn set_clients<I, S>(&self, clients: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let clients: BTreeSet<String> = clients.into_iter().map(Into::into).collect();
        tracing::debug!(?clients, "Setting NFS clients");
        self.state.lock().clients = clients;
    }

    /// Desired volumes, sorted.
    #[must_use]
    pub fn volumes(&self) -> Vec<PathBuf> {
        self.state.lock().volumes.iter().cloned().collect()
    }

    /// Base names exported by the last successful exports rewrite.
    #[must_use]
    pub fn exported(&self) -> Vec<String> {
        self.state.lock().exported.iter().cloned().collect()
    }

    /// Add a volume to the desired set.
    pub fn add_volume(&self, path: impl AsRef<Path>) {
        let path = clean_path(path.as_ref());
        tracing::debug!(volume = %path.display(), "Adding NFS volume");
        self.state.lock().volumes.insert(path);
    }

    /// Remove a volume from the desired set; unknown paths are ignored.
    pub fn remove_volume(&self, path: impl AsRef<Path>) {
        let path = clean_path(path.as_ref());
        tracing::debug!(volume = %path.display(), "Removing NFS volume");
        self.state.lock().volumes.remove(&path);
    }

    /// Bring the host in line with the desired state.
    ///
    /// Steps run in order and stop at the first failure: deny rules, allow
    /// rules, exports, daemon start, daemon reload, then stale bind mounts are
    /// cleaned up. Returns the export directories removed by the cleanup.
    ///
    /// # Errors
    ///
    /// Returns the error of the first step that failed.
    pub fn sync(&self) -> VolstoreResult<Vec<PathBuf>> {
        let mut state = self.state.lock();
        self.write_config(&mut state)?;
        step("start", self.daemon.start())?;
        step("reload", self.daemon.reload())?;
        Ok(self.cleanup_bind_mounts(&state.exported))
    }

    /// Rewrite the configuration and restart the daemon.
    ///
    /// # Errors
    ///
    /// Returns the error of the first step that failed.
    pub fn restart(&self) -> VolstoreResult<Vec<PathBuf>> {
        let mut state = self.state.lock();
        self.write_config(&mut state)?;
        step("restart", self.daemon.restart())?;
        Ok(self.cleanup_bind_mounts(&state.exported))
    }

    /// Stop the daemon.
    ///
    /// # Errors
    ///
    /// Returns an error if the stop command fails.
    pub fn stop(&self) -> VolstoreResult<()> {
        let _state = self.state.lock();
        step("stop", self.daemon.stop())
    }

    fn write_config(&self, state: &mut State) -> VolstoreResult<()> {
        step("hosts.deny", self.write_deny())?;
        step("hosts.allow", self.write_allow(&state.clients))?;
        step("exports", self.write_exports(state))
    }

    fn write_deny(&self) -> VolstoreResult<()> {
        let path = self.paths.hosts_deny();
        let existing = read_if_exists(&path)?;
        match render_hosts_deny(&existing) {
            Some(contents) => {
                write_atomic(&path, contents.as_bytes(), FILE_MODE)?;
                tracing::info!(path = %path.display(), "Wrote deny rules");
            }
            None => tracing::debug!(path = %path.display(), "Deny rules already present"),
        }
        Ok(())
    }

    fn write_allow(&self, clients: &BTreeSet<String>) -> VolstoreResult<()> {
        let path = self.paths.hosts_allow();
        let existing = read_if_exists(&path)?;
        write_atomic(
            &path,
            render_hosts_allow(&existing, clients).as_bytes(),
            FILE_MODE,
        )?;
        tracing::info!(path = %path.display(), ?clients, "Wrote allow rules");
        Ok(())
    }

    fn write_exports(&self, state: &mut State) -> VolstoreResult<()> {
        let export_path = self.export_path();
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o775)
            .create(&export_path)?;

        let mut exported = BTreeSet::new();
        let mut lines = String::new();
        for volume in &state.volumes {
            let Some(base) = volume.file_name() else {
                tracing::warn!(volume = %volume.display(), "Volume path has no base name; skipping");
                continue;
            };
            let target = export_path.join(base);
            self.mounter.bind_mount(volume, &target)?;
            exported.insert(base.to_string_lossy().into_owned());
            lines.push_str(&export_line(&target, &self.network));
        }
        state.exported = exported;

        let path = self.paths.exports_table();
        let existing = read_if_exists(&path)?;
        let contents = render_exports(
            &existing,
            &lines,
            &[self.paths.exports.as_path(), export_path.as_path()],
        );
        write_atomic(&path, contents.as_bytes(), FILE_MODE)?;
        tracing::info!(
            path = %path.display(),
            exported = ?state.exported,
            "Wrote exports"
        );
        Ok(())
    }

    /// Remove export directories for volumes no longer desired.
    ///
    /// Failures are logged and the directory skipped.
    fn cleanup_bind_mounts(&self, exported: &BTreeSet<String>) -> Vec<PathBuf> {
        let export_path = self.export_path();
        let entries = match fs::read_dir(&export_path) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(path = %export_path.display(), error = %e, "Cannot list exports");
                return Vec::new();
            }
        };

        let mut stale: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_ok_and(|t| t.is_dir()))
            .filter(|entry| !exported.contains(entry.file_name().to_string_lossy().as_ref()))
            .map(|entry| entry.path())
            .collect();
        stale.sort();

        let mut removed = Vec::new();
        for dir in stale {
            match self.mounter.is_mounted(&dir) {
                Ok(true) => {
                    if let Err(e) = self.mounter.unmount(&dir) {
                        tracing::warn!(path = %dir.display(), error = %e, "Cannot unmount stale export");
                        continue;
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(path = %dir.display(), error = %e, "Cannot read mount table");
                    continue;
                }
            }
            match fs::remove_dir_all(&dir) {
                Ok(()) => {
                    tracing::info!(path = %dir.display(), "Removed stale export");
                    removed.push(dir);
                }
                Err(e) => {
                    tracing::warn!(path = %dir.display(), error = %e, "Cannot remove stale export");
                }
            }
        }
        removed
    }
}

fn step<T>(name: &str, result: VolstoreResult<T>) -> VolstoreResult<T> {
    result.inspect_err(|e| tracing::error!(step = name, error = %e, "NFS sync step failed"))
}

/// Create `path` if missing and make sure it is a world-readable directory.
fn verify_dir(path: &Path) -> VolstoreResult<()> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::DirBuilder::new()
                .recursive(true)
                .mode(DIR_MODE)
                .create(path)?;
            fs::metadata(path)?
        }
        Err(e) => return Err(e.into()),
    };
    if !meta.is_dir() {
        return Err(VolstoreError::BasePathNotDir {
            path: path.to_path_buf(),
        });
    }
    let mode = meta.permissions().mode();
    if mode & DIR_MODE != DIR_MODE {
        tracing::debug!(path = %path.display(), mode = %format!("{mode:o}"), "Widening permissions");
        fs::set_permissions(path, fs::Permissions::from_mode((mode | DIR_MODE) & 0o7777))?;
    }
    Ok(())
}

/// Check that `network` is `address/prefix`.
///
/// # Errors
///
/// Returns [`VolstoreError::InvalidNetwork`] otherwise.
pub fn parse_cidr(network: &str) -> VolstoreResult<(IpAddr, u8)> {
    let invalid = || VolstoreError::InvalidNetwork {
        network: network.to_string(),
    };
    let (addr, prefix) = network.split_once('/').ok_or_else(invalid)?;
    let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(invalid());
    }
    Ok((addr, prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use volstore_common::ScriptedRunner;

    fn config(temp: &Path) -> NfsConfig {
        NfsConfig::new(temp.join("base"), "volstore_var", "10.0.0.0/8")
            .with_paths(StoragePaths::with_root(temp.join("root")).with_system_prefix(temp))
            .with_privilege(Privilege::Root)
    }

    #[test]
    fn cidr_parsing() {
        assert!(parse_cidr("0.0.0.0/0").is_ok());
        assert!(parse_cidr("10.0.0.0/8").is_ok());
        assert!(parse_cidr("fd00::/64").is_ok());
        for bad in ["10.0.0.0", "10.0.0.0/33", "banana/8", "10.0.0.0/x", "fd00::/129"] {
            assert!(
                matches!(parse_cidr(bad), Err(VolstoreError::InvalidNetwork { .. })),
                "{bad}"
            );
        }
    }

    #[test]
    fn rejects_bad_names() {
        let temp = tempfile::tempdir().unwrap();
        for name in ["x", "", "a/b"] {
            let cfg = NfsConfig {
                exported_name: name.to_string(),
                ..config(temp.path())
            };
            let err = NfsServer::new(cfg, Arc::new(ScriptedRunner::new())).unwrap_err();
            assert!(matches!(err, VolstoreError::InvalidExportedName { .. }), "{name}");
        }

        let cfg = NfsConfig {
            base_path: PathBuf::from("/"),
            ..config(temp.path())
        };
        assert!(matches!(
            NfsServer::new(cfg, Arc::new(ScriptedRunner::new())),
            Err(VolstoreError::InvalidBasePath { .. })
        ));
    }

    #[test]
    fn rejects_file_base_path() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("base"), "").unwrap();
        assert!(matches!(
            NfsServer::new(config(temp.path()), Arc::new(ScriptedRunner::new())),
            Err(VolstoreError::BasePathNotDir { .. })
        ));
    }

    #[test]
    fn rejects_bad_network() {
        let temp = tempfile::tempdir().unwrap();
        let cfg = NfsConfig {
            network: "everyone".to_string(),
            ..config(temp.path())
        };
        assert!(matches!(
            NfsServer::new(cfg, Arc::new(ScriptedRunner::new())),
            Err(VolstoreError::InvalidNetwork { .. })
        ));
    }

    #[test]
    fn new_prepares_dirs_and_starts_daemon() {
        let temp = tempfile::tempdir().unwrap();
        let base = temp.path().join("base");
        fs::create_dir(&base).unwrap();
        fs::set_permissions(&base, fs::Permissions::from_mode(0o700)).unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        let server = NfsServer::new(config(temp.path()), runner.clone()).unwrap();

        assert_eq!(server.export_path(), temp.path().join("exports/volstore_var"));
        assert!(server.export_path().is_dir());
        let mode = fs::metadata(&base).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(runner.calls(), vec!["systemctl start nfs-server"]);
    }

    #[test]
    fn clients_are_sorted_and_deduplicated() {
        let temp = tempfile::tempdir().unwrap();
        let server = NfsServer::new(config(temp.path()), Arc::new(ScriptedRunner::new())).unwrap();
        server.set_clients(["10.0.0.3", "10.0.0.1", "10.0.0.3"]);
        assert_eq!(server.clients(), vec!["10.0.0.1", "10.0.0.3"]);
    }

    #[test]
    fn volume_set_ignores_duplicates_and_unknown_removals() {
        let temp = tempfile::tempdir().unwrap();
        let server = NfsServer::new(config(temp.path()), Arc::new(ScriptedRunner::new())).unwrap();
        server.add_volume("/var/lib/volstore/volumes/b");
        server.add_volume("/var/lib/volstore/volumes/a/");
        server.add_volume("/var/lib/volstore/volumes/b");
        server.remove_volume("/nowhere");
        assert_eq!(
            server.volumes(),
            vec![
                PathBuf::from("/var/lib/volstore/volumes/a"),
                PathBuf::from("/var/lib/volstore/volumes/b"),
            ]
        );
    }
}
