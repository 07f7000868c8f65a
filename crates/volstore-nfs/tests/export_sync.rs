//! End-to-end reconciliation against a fake host.
//!
//! System files live under a temp dir and `mount`/`umount` edit a fake
//! mount table, so repeated syncs observe their own effects.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use tempfile::TempDir;
use volstore_common::{CommandOutput, Privilege, ScriptedRunner, StoragePaths, VolstoreError};
use volstore_nfs::{NfsConfig, NfsServer};

const OPTIONS: &str = "rw,no_root_squash,insecure,no_subtree_check,async";

struct Host {
    temp: TempDir,
    runner: Arc<ScriptedRunner>,
}

impl Host {
    fn new() -> Self {
        Self::with_mount(|_| CommandOutput::ok())
    }

    /// A host whose `mount` answers through `mount` before touching the table.
    fn with_mount(mount: impl Fn(&[String]) -> CommandOutput + Send + Sync + 'static) -> Self {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir_all(temp.path().join("proc")).unwrap();
        fs::create_dir_all(temp.path().join("etc")).unwrap();
        let table = temp.path().join("proc/mounts");
        fs::write(&table, "proc /proc proc rw 0 0\n").unwrap();

        let runner = Arc::new(ScriptedRunner::with_handler(move |program, args| {
            match program {
                "mount" => {
                    let out = mount(args);
                    if out.success() {
                        let n = args.len();
                        let mut contents = fs::read_to_string(&table).unwrap();
                        contents.push_str(&format!("{} {} none rw,bind 0 0\n", args[n - 2], args[n - 1]));
                        fs::write(&table, contents).unwrap();
                    }
                    out
                }
                "umount" => {
                    let target = args.last().unwrap();
                    let contents: String = fs::read_to_string(&table)
                        .unwrap()
                        .lines()
                        .filter(|line| line.split_whitespace().nth(1) != Some(target.as_str()))
                        .map(|line| format!("{line}\n"))
                        .collect();
                    fs::write(&table, contents).unwrap();
                    CommandOutput::ok()
                }
                _ => CommandOutput::ok(),
            }
        }));
        Self { temp, runner }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.temp.path().join(rel)
    }

    fn server(&self, network: &str) -> NfsServer {
        let paths = StoragePaths::with_root(self.path("root")).with_system_prefix(self.temp.path());
        let config = NfsConfig::new(self.path("volumes"), "volstore_var", network)
            .with_paths(paths)
            .with_privilege(Privilege::Root);
        NfsServer::new(config, self.runner.clone()).unwrap()
    }

    fn volume(&self, name: &str) -> PathBuf {
        let path = self.path("volumes").join(name);
        fs::create_dir_all(&path).unwrap();
        path
    }

    fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.path(rel)).unwrap()
    }
}

fn section(lines: &str) -> String {
    format!(
        "\n# --- VOLSTORE EXPORTS BEGIN ---\n# --- Do not edit this section\n{lines}\
         \n# --- VOLSTORE EXPORTS END ---\n"
    )
}

fn line(target: &Path, network: &str) -> String {
    format!("{}\t{network}({OPTIONS})\n", target.display())
}

#[test_log::test]
fn single_volume_is_exported() {
    let host = Host::new();
    let server = host.server("10.0.0.0/8");
    let tenant = host.volume("tenant1");
    host.runner.clear();

    server.add_volume(&tenant);
    let removed = server.sync().unwrap();
    assert!(removed.is_empty());

    let target = host.path("exports/volstore_var/tenant1");
    assert_eq!(host.read("etc/exports"), section(&line(&target, "10.0.0.0/8")));
    assert_eq!(
        host.runner.calls(),
        vec![
            format!("mount -o bind {} {}", tenant.display(), target.display()),
            "systemctl start nfs-server".to_string(),
            "exportfs -ra".to_string(),
        ]
    );
    assert_eq!(server.exported(), vec!["tenant1"]);

    for file in ["etc/exports", "etc/hosts.allow", "etc/hosts.deny"] {
        let mode = fs::metadata(host.path(file)).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o664, "{file}");
    }
}

#[test]
fn open_network_is_a_wildcard() {
    let host = Host::new();
    let server = host.server("0.0.0.0/0");
    server.add_volume(host.volume("tenant1"));
    server.sync().unwrap();

    let target = host.path("exports/volstore_var/tenant1");
    assert!(host.read("etc/exports").contains(&format!("{}\t*({OPTIONS})\n", target.display())));
}

#[test_log::test]
fn resync_changes_nothing() {
    let host = Host::new();
    let server = host.server("10.0.0.0/8");
    server.set_clients(["10.0.0.7", "10.0.0.5"]);
    server.add_volume(host.volume("a"));
    server.add_volume(host.volume("b"));
    server.sync().unwrap();

    let before: Vec<String> = ["etc/exports", "etc/hosts.allow", "etc/hosts.deny"]
        .iter()
        .map(|f| host.read(f))
        .collect();
    host.runner.clear();

    server.sync().unwrap();
    let after: Vec<String> = ["etc/exports", "etc/hosts.allow", "etc/hosts.deny"]
        .iter()
        .map(|f| host.read(f))
        .collect();
    assert_eq!(before, after);
    assert!(host.runner.calls_to("mount").is_empty());
    assert!(host.runner.calls_to("umount").is_empty());
}

#[test]
fn hosts_files_keep_operator_rules() {
    let host = Host::new();
    fs::write(host.path("etc/hosts.allow"), "sshd : 192.168.0.0/16\n").unwrap();
    fs::write(host.path("etc/hosts.deny"), "ALL : 10.9.9.9\n").unwrap();

    let server = host.server("10.0.0.0/8");
    server.set_clients(["10.0.0.9", "10.0.0.10"]);
    server.sync().unwrap();

    assert_eq!(
        host.read("etc/hosts.allow"),
        "sshd : 192.168.0.0/16\n\n# volstore, do not remove past this line\n\
         rpcbind mountd nfsd statd lockd rquotad : 127.0.0.1 10.0.0.10 10.0.0.9\n\n"
    );
    assert_eq!(
        host.read("etc/hosts.deny"),
        "ALL : 10.9.9.9\n\n# volstore, do not remove past this line\n\
         rpcbind mountd nfsd statd lockd rquotad : ALL\n\n"
    );

    server.set_clients(["10.0.0.9"]);
    server.sync().unwrap();
    assert!(host.read("etc/hosts.allow").ends_with(": 127.0.0.1 10.0.0.9\n\n"));
}

#[test]
fn rendered_files_match_snapshots() {
    let host = Host::new();
    fs::write(host.path("etc/exports"), "/srv/media 192.168.0.0/16(ro)\n").unwrap();
    fs::write(host.path("etc/hosts.allow"), "sshd : 192.168.0.0/16\n").unwrap();

    let server = host.server("10.0.0.0/8");
    server.set_clients(["10.0.0.9", "10.0.0.10"]);
    server.add_volume(host.volume("tenant1"));
    server.add_volume(host.volume("tenant2"));
    server.sync().unwrap();

    let root = host.temp.path().display().to_string();
    insta::assert_snapshot!("exports", host.read("etc/exports").replace(&root, "[HOST]"));
    insta::assert_snapshot!("hosts_allow", host.read("etc/hosts.allow"));
    insta::assert_snapshot!("hosts_deny", host.read("etc/hosts.deny"));
}

#[test]
fn operator_exports_are_preserved_or_displaced() {
    let host = Host::new();
    let export_root = host.path("exports");
    fs::write(
        host.path("etc/exports"),
        format!(
            "/srv/media 192.168.0.0/16(ro)\n{} *(rw,fsid=0)\n",
            export_root.display()
        ),
    )
    .unwrap();

    let server = host.server("10.0.0.0/8");
    server.add_volume(host.volume("tenant1"));
    server.sync().unwrap();

    let exports = host.read("etc/exports");
    let expected_pre = format!(
        "/srv/media 192.168.0.0/16(ro)\n# volstore removed: {} *(rw,fsid=0)\n",
        export_root.display()
    );
    assert!(exports.starts_with(&expected_pre), "{exports}");
    assert!(exports.contains("tenant1\t10.0.0.0/8("));
}

#[test_log::test]
fn removed_volume_is_unexported_and_cleaned() {
    let host = Host::new();
    let server = host.server("10.0.0.0/8");
    let a = host.volume("a");
    let b = host.volume("b");
    server.add_volume(&a);
    server.add_volume(&b);
    server.sync().unwrap();

    // A leftover directory that was never mounted and a plain file.
    fs::create_dir_all(host.path("exports/volstore_var/old")).unwrap();
    fs::write(host.path("exports/volstore_var/notes.txt"), "").unwrap();
    host.runner.clear();

    server.remove_volume(&b);
    let removed = server.sync().unwrap();

    let export = host.path("exports/volstore_var");
    assert_eq!(removed, vec![export.join("b"), export.join("old")]);
    assert!(export.join("a").is_dir());
    assert!(export.join("notes.txt").is_file());
    assert_eq!(
        host.runner.calls_to("umount"),
        vec![format!("umount -f {}", export.join("b").display())]
    );
    assert_eq!(
        host.read("etc/exports"),
        section(&line(&export.join("a"), "10.0.0.0/8"))
    );
}

#[test_log::test]
fn concurrent_adds_and_syncs_mount_each_volume_once() {
    let host = Host::new();
    let server = host.server("10.0.0.0/8");
    let volumes: Vec<PathBuf> = (0..8).map(|i| host.volume(&format!("tenant{i}"))).collect();
    host.runner.clear();

    thread::scope(|scope| {
        for volume in &volumes {
            let server = &server;
            scope.spawn(move || {
                server.add_volume(volume);
                server.sync().unwrap();
            });
        }
        for _ in 0..4 {
            scope.spawn(|| server.sync().unwrap());
        }
    });
    server.sync().unwrap();

    let export = host.path("exports/volstore_var");
    let mut mounted: Vec<String> = host.runner.calls_to("mount");
    assert_eq!(mounted.len(), volumes.len(), "{mounted:#?}");
    mounted.sort();
    mounted.dedup();
    assert_eq!(mounted.len(), volumes.len());

    let table = host.read("proc/mounts");
    for i in 0..8 {
        let target = export.join(format!("tenant{i}")).display().to_string();
        let count = table
            .lines()
            .filter(|l| l.split_whitespace().nth(1) == Some(target.as_str()))
            .count();
        assert_eq!(count, 1, "{target}");
    }

    let lines: String = (0..8)
        .map(|i| line(&export.join(format!("tenant{i}")), "10.0.0.0/8"))
        .collect();
    assert_eq!(host.read("etc/exports"), section(&lines));

    host.runner.clear();
    server.sync().unwrap();
    assert!(host.runner.calls_to("mount").is_empty());
}

#[test]
fn stale_target_is_remounted() {
    let host = Host::with_mount(|args| {
        if args.iter().any(|a| a == "remount") {
            CommandOutput::ok()
        } else {
            CommandOutput::failed(32, "mount: already mounted or mount point busy")
        }
    });
    let server = host.server("10.0.0.0/8");
    server.add_volume(host.volume("tenant1"));
    server.sync().unwrap();

    let mounts = host.runner.calls_to("mount");
    assert_eq!(mounts.len(), 2);
    assert!(mounts[1].starts_with("mount -o bind -o remount "));
    assert!(host.read("etc/exports").contains("tenant1\t"));
}

#[test]
fn failed_mount_aborts_before_reload() {
    let host = Host::with_mount(|_| CommandOutput::failed(1, "special device does not exist"));
    let server = host.server("10.0.0.0/8");
    server.add_volume(host.volume("tenant1"));
    host.runner.clear();

    let err = server.sync().unwrap_err();
    assert!(matches!(err, VolstoreError::CommandFailed { status: Some(1), .. }));
    assert!(!host.path("etc/exports").exists());
    assert!(host.runner.calls_to("exportfs").is_empty());
    // The earlier steps already ran.
    assert!(host.path("etc/hosts.deny").exists());
}

#[test]
fn restart_rewrites_and_restarts() {
    let host = Host::new();
    let server = host.server("10.0.0.0/8");
    server.add_volume(host.volume("tenant1"));
    host.runner.clear();

    server.restart().unwrap();
    let calls = host.runner.calls();
    assert!(calls.contains(&"systemctl restart nfs-server".to_string()));
    assert!(host.runner.calls_to("exportfs").is_empty());
    assert!(host.read("etc/exports").contains("tenant1"));

    server.stop().unwrap();
    assert_eq!(
        host.runner.calls().last().map(String::as_str),
        Some("systemctl stop nfs-server")
    );
}
