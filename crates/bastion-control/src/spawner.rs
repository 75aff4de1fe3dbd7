//! Starting a daemon from a client invocation

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

/// Starts a daemon for a discovery record path without waiting for it
pub trait DaemonSpawner: Send + Sync {
    fn spawn(&self, state_file: &Path) -> io::Result<()>;
}

/// Re-executes a `bastion` binary as `<program> [args] <STATE_FILE> server --silent`
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Spawner for the currently running executable
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Global options placed before the state file argument
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn command(&self, state_file: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(state_file)
            .arg("server")
            .arg("--silent")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // Own process group, so the daemon outlives a Ctrl-C in the client's terminal
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        command
    }
}

impl DaemonSpawner for ProcessSpawner {
    fn spawn(&self, state_file: &Path) -> io::Result<()> {
        let child = self.command(state_file).spawn()?;
        debug!("Spawned daemon {:?} (pid {})", self.program, child.id());
        Ok(())
    }
}
