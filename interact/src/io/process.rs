//! Helpers for running child processes with timeouts and bounded output.

use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::error::LaunchError;

/// How long stdin and output threads may run on once the child has been reaped.
///
/// A pipe stays open while a background process the child started still holds
/// it; past this grace period the thread is abandoned and the output read so
/// far is what the caller gets.
pub const PIPE_GRACE: Duration = Duration::from_millis(500);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Stdout followed by stderr, lossily decoded.
    pub fn combined_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&self.stderr));
        if self.stdout_truncated > 0 || self.stderr_truncated > 0 {
            text.push_str(&format!(
                "\n[output truncated {} bytes]\n",
                self.stdout_truncated + self.stderr_truncated
            ));
        }
        text
    }
}

/// Spawn `cmd`, reporting a failure to start as a [`LaunchError`].
pub fn spawn(cmd: &mut Command) -> Result<Child> {
    match cmd.spawn() {
        Ok(child) => Ok(child),
        Err(e) => {
            error!(err = %e, program = ?cmd.get_program(), "failed to spawn command");
            Err(LaunchError {
                program: PathBuf::from(cmd.get_program()),
                source: e,
            }
            .into())
        }
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Stdin is written and output is read on their own threads, so the timeout
/// holds whether or not the child reads its input; stdin is closed once
/// written. `output_limit_bytes` bounds the amount of stdout/stderr stored in
/// memory (bytes beyond this are discarded while still draining the pipe). A
/// command that cannot be started fails with a [`LaunchError`] that callers
/// may downcast to.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes = output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = spawn(&mut cmd)?;

    let stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout: SharedOutput = Arc::new(Mutex::new(Vec::new()));
    let stderr: SharedOutput = Arc::new(Mutex::new(Vec::new()));
    let stdout_reader = drain_detached(stdout_pipe, &stdout, output_limit_bytes);
    let stderr_reader = drain_detached(stderr_pipe, &stderr, output_limit_bytes);

    let writer = match stdin {
        Some(input) => {
            let mut child_stdin = match child.stdin.take() {
                Some(pipe) => pipe,
                None => {
                    kill_quietly(&mut child);
                    return Err(anyhow!("stdin was not piped"));
                }
            };
            let input = input.to_vec();
            Some(Detached::spawn(move || child_stdin.write_all(&input)))
        }
        None => None,
    };

    let (status, timed_out) = wait_or_kill(&mut child, timeout)?;
    let deadline = Instant::now() + PIPE_GRACE;

    if let Some(writer) = writer {
        match writer.finish(deadline).context("join stdin writer")? {
            Some(Ok(())) => {}
            Some(Err(e)) if e.kind() == ErrorKind::BrokenPipe => {
                debug!("child closed stdin before all input was written");
            }
            Some(Err(e)) if !timed_out => return Err(e).context("write stdin"),
            Some(Err(e)) => debug!(err = %e, "stdin write failed after kill"),
            None => warn!("stdin still blocked after the child exited, abandoning it"),
        }
    }

    let stdout_truncated = finish_output(stdout_reader, deadline, "stdout")?;
    let stderr_truncated = finish_output(stderr_reader, deadline, "stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout: take_output(&stdout),
        stderr: take_output(&stderr),
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// Wait up to `timeout`, killing the child when it runs over. Returns whether it was killed.
pub fn wait_or_kill(child: &mut Child, timeout: Duration) -> Result<(ExitStatus, bool)> {
    match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => Ok((status, false)),
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            child.kill().context("kill command")?;
            let status = child.wait().context("wait command after kill")?;
            Ok((status, true))
        }
    }
}

pub fn kill_quietly(child: &mut Child) {
    if child.kill().is_ok() {
        let _ = child.wait();
    }
}

/// A thread whose result is awaited until a deadline and abandoned after it.
pub struct Detached<T> {
    done: mpsc::Receiver<T>,
}

impl<T: Send + 'static> Detached<T> {
    pub fn spawn<F>(work: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, done) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(work());
        });
        Self { done }
    }

    /// The thread's result, or `None` when it is still running at `deadline`.
    pub fn finish(self, deadline: Instant) -> Result<Option<T>> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.done.recv_timeout(remaining) {
            Ok(value) => Ok(Some(value)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(anyhow!("worker thread panicked")),
        }
    }
}

/// Drain `reader` into `shared` on a detached thread.
pub fn drain_detached<R>(reader: R, shared: &SharedOutput, limit: usize) -> Detached<Result<usize>>
where
    R: Read + Send + 'static,
{
    let shared = Arc::clone(shared);
    Detached::spawn(move || drain_into(reader, &shared, limit))
}

/// Wait for an output stream to close; returns the bytes discarded past the limit.
pub fn finish_output(reader: Detached<Result<usize>>, deadline: Instant, stream: &str) -> Result<usize> {
    match reader.finish(deadline).with_context(|| format!("join {stream}"))? {
        Some(truncated) => truncated.with_context(|| format!("read {stream}")),
        None => {
            warn!(stream, "pipe still open after the child exited, abandoning it");
            Ok(0)
        }
    }
}

fn take_output(shared: &SharedOutput) -> Vec<u8> {
    match shared.lock() {
        Ok(mut buf) => std::mem::take(&mut *buf),
        Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
    }
}

/// Shared, growing copy of a child's output stream.
pub type SharedOutput = Arc<Mutex<Vec<u8>>>;

/// Drain `reader` into `shared` chunk by chunk so readers can observe partial output.
///
/// Bytes beyond `limit` are discarded; the number discarded is returned.
pub fn drain_into<R: Read>(mut reader: R, shared: &SharedOutput, limit: usize) -> Result<usize> {
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let mut buf = shared
            .lock()
            .map_err(|_| anyhow!("output buffer lock poisoned"))?;
        let remaining = limit.saturating_sub(buf.len());
        let keep = n.min(remaining);
        buf.extend_from_slice(&chunk[..keep]);
        truncated += n - keep;
    }

    Ok(truncated)
}
