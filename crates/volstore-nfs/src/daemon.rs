//! NFS daemon lifecycle.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use volstore_common::{CommandRunner, Privilege, VolstoreError, VolstoreResult};

/// Command lines that drive the NFS daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonCommands {
    /// Start the daemon if it is not running.
    pub start: Vec<String>,
    /// Re-read the exports table.
    pub reload: Vec<String>,
    /// Restart the daemon.
    pub restart: Vec<String>,
    /// Stop the daemon.
    pub stop: Vec<String>,
}

fn words(line: &str) -> Vec<String> {
    line.split_whitespace().map(ToString::to_string).collect()
}

impl Default for DaemonCommands {
    fn default() -> Self {
        Self {
            start: words("systemctl start nfs-server"),
            reload: words("exportfs -ra"),
            restart: words("systemctl restart nfs-server"),
            stop: words("systemctl stop nfs-server"),
        }
    }
}

/// Runs [`DaemonCommands`] with the configured privilege.
#[derive(Debug, Clone)]
pub struct Daemon {
    commands: DaemonCommands,
    runner: Arc<dyn CommandRunner>,
    privilege: Privilege,
}

impl Daemon {
    /// Create a daemon controller.
    pub fn new(
        commands: DaemonCommands,
        runner: Arc<dyn CommandRunner>,
        privilege: Privilege,
    ) -> Self {
        Self {
            commands,
            runner,
            privilege,
        }
    }

    /// Start the daemon.
    ///
    /// # Errors
    ///
    /// Returns an error if the start command fails.
    pub fn start(&self) -> VolstoreResult<()> {
        self.invoke("start", &self.commands.start)
    }

    /// Make the daemon pick up a rewritten exports table.
    ///
    /// # Errors
    ///
    /// Returns an error if the reload command fails.
    pub fn reload(&self) -> VolstoreResult<()> {
        self.invoke("reload", &self.commands.reload)
    }

    /// Restart the daemon.
    ///
    /// # Errors
    ///
    /// Returns an error if the restart command fails.
    pub fn restart(&self) -> VolstoreResult<()> {
        self.invoke("restart", &self.commands.restart)
    }

    /// Stop the daemon.
    ///
    /// # Errors
    ///
    /// Returns an error if the stop command fails.
    pub fn stop(&self) -> VolstoreResult<()> {
        self.invoke("stop", &self.commands.stop)
    }

    fn invoke(&self, action: &str, line: &[String]) -> VolstoreResult<()> {
        let Some((program, args)) = line.split_first() else {
            return Err(VolstoreError::Config {
                message: format!("no NFS daemon {action} command configured"),
            });
        };
        tracing::debug!(action, "NFS daemon");
        self.privilege
            .run_checked(self.runner.as_ref(), program, args.iter().cloned())
            .inspect_err(|e| tracing::error!(action, error = %e, "NFS daemon command failed"))?;
        Ok(())
    }
}
