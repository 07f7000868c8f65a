//! External command execution.
//!
//! Every mount, unmount, backend probe and daemon lifecycle command goes
//! through a [`CommandRunner`]. The production runner shells out with
//! [`std::process::Command`]; [`ScriptedRunner`] records invocations and
//! replays canned results so elevation and retry logic can be exercised
//! without touching the host.
//!
//! Commands run to completion on the calling thread. There is no timeout: a
//! hung `mount` or `btrfs` invocation blocks its caller indefinitely.

use std::fmt;
use std::io;
use std::process::Command;

use parking_lot::Mutex;

use crate::{VolstoreError, VolstoreResult};

/// Outcome of a finished external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status; `None` when the process was killed by a signal.
    pub status: Option<i32>,
    /// Combined stdout followed by stderr.
    pub output: Vec<u8>,
}

impl CommandOutput {
    /// A successful, silent command.
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            status: Some(0),
            output: Vec::new(),
        }
    }

    /// A command that exited with `status` and printed `output`.
    #[must_use]
    pub fn failed(status: i32, output: &str) -> Self {
        Self {
            status: Some(status),
            output: output.as_bytes().to_vec(),
        }
    }

    /// Whether the command exited with status zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Combined output as lossy UTF-8, trimmed.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.output).trim().to_string()
    }
}

/// Narrow executor for external commands.
pub trait CommandRunner: Send + Sync + fmt::Debug {
    /// Run `program` with `args` and wait for it to exit.
    ///
    /// # Errors
    ///
    /// Returns an error only when the process could not be spawned; a
    /// non-zero exit is reported through [`CommandOutput::status`].
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput>;

    /// Run a command and turn a non-zero exit into [`VolstoreError::CommandFailed`].
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be spawned or exits unsuccessfully.
    fn run_checked(&self, program: &str, args: &[String]) -> VolstoreResult<CommandOutput> {
        let out = self.run(program, args)?;
        if out.success() {
            Ok(out)
        } else {
            Err(command_failed(program, args, &out))
        }
    }
}

/// Build a [`VolstoreError::CommandFailed`] for a finished command.
#[must_use]
pub fn command_failed(program: &str, args: &[String], out: &CommandOutput) -> VolstoreError {
    VolstoreError::CommandFailed {
        command: command_line(program, args),
        status: out.status,
        output: out.text(),
    }
}

/// Render a command line for logs and errors.
#[must_use]
pub fn command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs commands on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        tracing::debug!(command = %command_line(program, args), "Running command");

        let output = Command::new(program).args(args).output()?;
        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);

        Ok(CommandOutput {
            status: output.status.code(),
            output: combined,
        })
    }
}

type Handler = Box<dyn Fn(&str, &[String]) -> CommandOutput + Send + Sync>;

/// Records every command and answers with a scripted result.
pub struct ScriptedRunner {
    calls: Mutex<Vec<String>>,
    handler: Handler,
}

impl ScriptedRunner {
    /// A runner on which every command succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::with_handler(|_, _| CommandOutput::ok())
    }

    /// A runner that answers each command through `handler`.
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&str, &[String]) -> CommandOutput + Send + Sync + 'static,
    {
        Self {
            calls: Mutex::new(Vec::new()),
            handler: Box::new(handler),
        }
    }

    /// Command lines run so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Command lines whose program (after any `sudo -n`) is `program`.
    #[must_use]
    pub fn calls_to(&self, program: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|line| {
                let line = line.strip_prefix("sudo -n ").unwrap_or(line);
                line.split_whitespace().next() == Some(program)
            })
            .cloned()
            .collect()
    }

    /// Forget recorded calls.
    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ScriptedRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedRunner")
            .field("calls", &self.calls.lock().len())
            .finish_non_exhaustive()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        self.calls.lock().push(command_line(program, args));
        Ok((self.handler)(program, args))
    }
}

/// How privileged commands are launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// The process is root; commands run directly.
    Root,
    /// Commands are prefixed with `sudo -n`.
    Sudo,
}

impl Privilege {
    /// Privilege of the current process.
    #[must_use]
    pub fn current() -> Self {
        if rustix::process::geteuid().is_root() {
            Self::Root
        } else {
            Self::Sudo
        }
    }

    /// Whether commands run without elevation.
    #[must_use]
    pub const fn is_root(self) -> bool {
        matches!(self, Self::Root)
    }

    /// The program and arguments needed to run `program args..` with this privilege.
    #[must_use]
    pub fn command<I, S>(self, program: &str, args: I) -> (String, Vec<String>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args = args.into_iter().map(Into::into);
        match self {
            Self::Root => (program.to_string(), args.collect()),
            Self::Sudo => (
                "sudo".to_string(),
                ["-n".to_string(), program.to_string()]
                    .into_iter()
                    .chain(args)
                    .collect(),
            ),
        }
    }

    /// Run a command with this privilege.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be spawned.
    pub fn run<I, S>(
        self,
        runner: &dyn CommandRunner,
        program: &str,
        args: I,
    ) -> io::Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (program, args) = self.command(program, args);
        runner.run(&program, &args)
    }

    /// Run a command with this privilege, failing on non-zero exit.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be spawned or exits unsuccessfully.
    pub fn run_checked<I, S>(
        self,
        runner: &dyn CommandRunner,
        program: &str,
        args: I,
    ) -> VolstoreResult<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (program, args) = self.command(program, args);
        runner.run_checked(&program, &args)
    }
}
