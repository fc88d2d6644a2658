//! Run executables in a throwaway working directory.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, instrument};

use crate::error::{LaunchError, SandboxError};
use crate::io::config::SandboxConfig;
use crate::io::process::run_command_with_timeout;

/// Output of one sandboxed program run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` when the process was ended by a signal (including a timeout kill).
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl ProgramOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Runs programs with a bounded wait, each in a fresh working directory.
#[derive(Debug, Clone)]
pub struct Sandbox {
    config: SandboxConfig,
    workspace_root: Option<PathBuf>,
}

impl Sandbox {
    pub fn new(config: SandboxConfig, workspace_root: Option<PathBuf>) -> Self {
        Self {
            config,
            workspace_root,
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run `executable` with `stdin` as its whole standard input.
    ///
    /// The working directory is removed before this returns, on every path.
    #[instrument(skip_all, fields(executable = %executable.display()))]
    pub fn run(&self, executable: &Path, stdin: &str) -> Result<ProgramOutput, SandboxError> {
        let executable = std::path::absolute(executable).map_err(SandboxError::Workspace)?;

        let mut builder = tempfile::Builder::new();
        builder.prefix("interact-run-");
        let workdir = match &self.workspace_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(SandboxError::Workspace)?;
        debug!(workdir = %workdir.path().display(), "run directory created");

        let mut cmd = Command::new(&executable);
        cmd.current_dir(workdir.path());
        let output = run_command_with_timeout(
            cmd,
            Some(stdin.as_bytes()),
            self.config.timeout(),
            self.config.output_limit_bytes,
        )
        .map_err(|err| match err.downcast::<LaunchError>() {
            Ok(launch) => SandboxError::Launch(launch),
            Err(other) => SandboxError::Other(other),
        })?;

        debug!(exit_code = ?output.status.code(), timed_out = output.timed_out, "program finished");
        Ok(ProgramOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.status.code(),
            timed_out: output.timed_out,
        })
    }
}
