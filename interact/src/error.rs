//! Error types for scheduling, sandboxed execution and captured calls.
//!
//! Plumbing failures travel as `anyhow::Error`; the types here are the ones
//! callers are expected to match on.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors that abort a whole scheduler run.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// A test was reached again while its own dependencies were being resolved.
    #[error("cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// A test id that was not issued by this scheduler.
    #[error("unknown test id {0}")]
    UnknownTest(usize),
}

/// A child process could not be started at all.
#[derive(Debug, thiserror::Error)]
#[error("failed to launch {}", .program.display())]
pub struct LaunchError {
    pub program: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Errors from [`crate::io::sandbox::Sandbox::run`].
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("create run directory: {0}")]
    Workspace(#[source] io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// An error raised by a captured callable, carried back verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct CallableError {
    /// Error category, e.g. `ArithmeticError` or `panic`.
    pub kind: String,
    pub message: String,
}

impl CallableError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Errors from [`crate::io::capture::capture`] and [`crate::io::capture::CapturedCall::wait`].
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// The callable itself failed inside the worker.
    #[error("captured callable raised {0}")]
    Raised(CallableError),

    #[error("captured call timed out after {0:?}")]
    TimedOut(Duration),

    /// The worker ended without reporting a result.
    #[error("capture worker exited with status {code:?} without a result: {stderr}")]
    WorkerExited { code: Option<i32>, stderr: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Exactly one of source files or an executable must describe a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("either source files or an executable must be given, but not both nor neither")]
pub struct UsageError;

/// Source files given to `run_program` failed to compile.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("program did not compile")]
pub struct ProgramDidNotCompile {
    pub diagnostics: String,
}
