//! Run a registered callable in a child process and capture what it does.
//!
//! The parent writes a JSON request into a private channel directory and
//! starts a worker (normally the current executable) with the request and
//! reply paths in its environment. The worker's `main` calls
//! [`serve_if_worker`] first; it looks the callable up in its
//! [`CallableRegistry`], runs it, and writes a JSON reply that is either the
//! returned value or the raised [`CallableError`]. A worker that exits
//! without a reply is reported as [`CaptureError::WorkerExited`].

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::TempDir;
use tracing::{debug, error, instrument, warn};

use crate::error::{CallableError, CaptureError, LaunchError};
use crate::io::config::CaptureConfig;
use crate::io::process::{
    Detached, PIPE_GRACE, SharedOutput, drain_detached, finish_output, kill_quietly, spawn,
    wait_or_kill,
};

const REQUEST_ENV: &str = "INTERACT_CAPTURE_REQUEST";
const REPLY_ENV: &str = "INTERACT_CAPTURE_REPLY";
const REQUEST_FILE: &str = "request.json";
const REPLY_FILE: &str = "reply.json";

/// Exit code of a worker that could not produce a reply.
pub const WORKER_FAILURE: i32 = 70;

#[derive(Debug, Serialize, Deserialize)]
struct Request {
    callable: String,
    args: Vec<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
enum Reply {
    Returned { value: Value },
    Raised { error: CallableError },
}

type Callable = Box<dyn Fn(Value) -> Result<Value, CallableError>>;

/// Callables a worker process can run by name.
#[derive(Default)]
pub struct CallableRegistry {
    callables: BTreeMap<String, Callable>,
}

impl CallableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callable taking the JSON argument array.
    pub fn register<F>(&mut self, name: impl Into<String>, callable: F) -> &mut Self
    where
        F: Fn(Value) -> Result<Value, CallableError> + 'static,
    {
        self.callables.insert(name.into(), Box::new(callable));
        self
    }

    /// Register a callable whose arguments and return value go through serde.
    ///
    /// Arguments arrive as a JSON array, so `A` is usually a tuple. Arguments
    /// that do not decode raise a `TypeError`.
    pub fn register_typed<A, R, F>(&mut self, name: impl Into<String>, callable: F) -> &mut Self
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(A) -> Result<R, CallableError> + 'static,
    {
        self.register(name, move |args| {
            let args: A = serde_json::from_value(args)
                .map_err(|err| CallableError::new("TypeError", err.to_string()))?;
            let value = callable(args)?;
            serde_json::to_value(value).map_err(|err| CallableError::new("TypeError", err.to_string()))
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.callables.contains_key(name)
    }

    /// Run a callable in this process. Panics come back as kind `panic`.
    pub fn call(&self, name: &str, args: Value) -> Result<Value, CallableError> {
        let callable = self
            .callables
            .get(name)
            .ok_or_else(|| CallableError::new("LookupError", format!("no callable named {name}")))?;
        match panic::catch_unwind(AssertUnwindSafe(|| callable(args))) {
            Ok(result) => result,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|text| (*text).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "callable panicked".to_string());
                Err(CallableError::new("panic", message))
            }
        }
    }
}

/// Serve one captured call if this process was started as a capture worker.
///
/// Returns the exit code the process should end with, or `None` when the
/// process is not a worker and should carry on as usual.
pub fn serve_if_worker(registry: &CallableRegistry) -> Option<i32> {
    let request = std::env::var_os(REQUEST_ENV)?;
    let reply = std::env::var_os(REPLY_ENV)?;
    let code = match serve(registry, Path::new(&request), Path::new(&reply)) {
        Ok(()) => 0,
        Err(err) => {
            let message = format!("{err:#}");
            error!(err = %message, "capture worker failed");
            eprintln!("capture worker: {message}");
            WORKER_FAILURE
        }
    };
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    Some(code)
}

fn serve(registry: &CallableRegistry, request_path: &Path, reply_path: &Path) -> Result<()> {
    let contents = fs::read_to_string(request_path)
        .with_context(|| format!("read {}", request_path.display()))?;
    let request: Request = serde_json::from_str(&contents)
        .with_context(|| format!("parse {}", request_path.display()))?;
    if !registry.contains(&request.callable) {
        bail!("unknown callable {}", request.callable);
    }

    let reply = match registry.call(&request.callable, Value::Array(request.args)) {
        Ok(value) => Reply::Returned { value },
        Err(error) => Reply::Raised { error },
    };
    std::io::stdout().flush().context("flush stdout")?;

    let partial = reply_path.with_extension("partial");
    let encoded = serde_json::to_vec(&reply).context("encode reply")?;
    fs::write(&partial, encoded).with_context(|| format!("write {}", partial.display()))?;
    fs::rename(&partial, reply_path)
        .with_context(|| format!("publish {}", reply_path.display()))?;
    Ok(())
}

/// The program started to serve captured calls.
#[derive(Debug, Clone)]
pub struct CaptureWorker {
    program: PathBuf,
    args: Vec<OsString>,
}

impl CaptureWorker {
    /// Re-run the current executable as the worker.
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe().context("locate current executable")?;
        Ok(Self::new(program))
    }

    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

/// Start `name` with `args` in a worker process and return immediately.
#[instrument(skip_all, fields(callable = name, args = args.len()))]
pub fn capture(
    worker: &CaptureWorker,
    name: &str,
    args: &[Value],
    config: &CaptureConfig,
) -> Result<CapturedCall, CaptureError> {
    let channel = tempfile::Builder::new()
        .prefix("interact-capture-")
        .tempdir()
        .context("create capture channel")?;
    let request_path = channel.path().join(REQUEST_FILE);
    let request = Request {
        callable: name.to_string(),
        args: args.to_vec(),
    };
    let encoded = serde_json::to_vec(&request).context("encode capture request")?;
    fs::write(&request_path, encoded)
        .with_context(|| format!("write {}", request_path.display()))?;

    let program = std::path::absolute(&worker.program)
        .with_context(|| format!("absolute path {}", worker.program.display()))?;
    let mut cmd = Command::new(&program);
    cmd.args(&worker.args)
        .current_dir(channel.path())
        .env(REQUEST_ENV, &request_path)
        .env(REPLY_ENV, channel.path().join(REPLY_FILE))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = spawn(&mut cmd).map_err(|err| match err.downcast::<LaunchError>() {
        Ok(launch) => CaptureError::Launch(launch),
        Err(other) => CaptureError::Other(other),
    })?;
    debug!(pid = child.id(), "capture worker started");

    let stdout: SharedOutput = Arc::new(Mutex::new(Vec::new()));
    let stderr: SharedOutput = Arc::new(Mutex::new(Vec::new()));
    let mut readers = Vec::new();
    if let Some(pipe) = child.stdout.take() {
        readers.push(("stdout", drain_detached(pipe, &stdout, config.output_limit_bytes)));
    }
    if let Some(pipe) = child.stderr.take() {
        readers.push(("stderr", drain_detached(pipe, &stderr, config.output_limit_bytes)));
    }
    let stdin = child.stdin.take();

    Ok(CapturedCall {
        child,
        stdin,
        stdout,
        stderr,
        readers,
        channel: Some(channel),
        timeout: config.timeout(),
        finished: false,
        return_value: None,
        raised: None,
    })
}

/// A captured call in flight (or finished).
pub struct CapturedCall {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: SharedOutput,
    stderr: SharedOutput,
    readers: Vec<(&'static str, Detached<Result<usize>>)>,
    channel: Option<TempDir>,
    timeout: Duration,
    finished: bool,
    return_value: Option<Value>,
    raised: Option<CallableError>,
}

impl CapturedCall {
    /// The worker's standard input, until [`CapturedCall::wait`] or
    /// [`CapturedCall::close_stdin`] closes it.
    pub fn stdin(&mut self) -> Option<&mut ChildStdin> {
        self.stdin.as_mut()
    }

    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    /// Standard output captured so far.
    pub fn stdout(&self) -> Vec<u8> {
        snapshot(&self.stdout)
    }

    /// Standard error captured so far.
    pub fn stderr(&self) -> Vec<u8> {
        snapshot(&self.stderr)
    }

    /// The value returned by the callable, once [`CapturedCall::wait`] succeeded.
    pub fn return_value(&self) -> Option<&Value> {
        self.return_value.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Close stdin, wait for the worker and decode its reply.
    ///
    /// Calling this again after the worker finished returns the same result
    /// without waiting.
    #[instrument(skip_all)]
    pub fn wait(&mut self) -> Result<Value, CaptureError> {
        if self.finished {
            return self.stored_result();
        }
        self.close_stdin();

        let (status, timed_out) = wait_or_kill(&mut self.child, self.timeout)?;
        self.finished = true;
        let deadline = Instant::now() + PIPE_GRACE;
        for (stream, reader) in self.readers.drain(..) {
            match finish_output(reader, deadline, stream) {
                Ok(truncated) if truncated > 0 => {
                    warn!(stream, truncated, "captured output truncated");
                }
                Ok(_) => {}
                Err(err) => {
                    let message = format!("{err:#}");
                    warn!(err = %message, "capture reader failed");
                }
            }
        }

        let reply = match self.channel.take() {
            Some(channel) => {
                let reply = read_reply(&channel.path().join(REPLY_FILE));
                let path = channel.path().to_path_buf();
                channel
                    .close()
                    .with_context(|| format!("remove capture channel {}", path.display()))?;
                reply?
            }
            None => None,
        };

        if timed_out {
            return Err(CaptureError::TimedOut(self.timeout));
        }
        match reply {
            Some(Reply::Returned { value }) => {
                debug!("captured call returned");
                self.return_value = Some(value.clone());
                Ok(value)
            }
            Some(Reply::Raised { error }) => {
                debug!(kind = %error.kind, "captured call raised");
                self.raised = Some(error.clone());
                Err(CaptureError::Raised(error))
            }
            None => Err(CaptureError::WorkerExited {
                code: status.code(),
                stderr: String::from_utf8_lossy(&self.stderr()).into_owned(),
            }),
        }
    }

    fn stored_result(&self) -> Result<Value, CaptureError> {
        if let Some(value) = &self.return_value {
            return Ok(value.clone());
        }
        if let Some(error) = &self.raised {
            return Err(CaptureError::Raised(error.clone()));
        }
        Err(CaptureError::Other(anyhow!(
            "captured call already finished without a result"
        )))
    }
}

impl Drop for CapturedCall {
    fn drop(&mut self) {
        if !self.finished {
            debug!("killing unfinished capture worker");
            self.stdin = None;
            kill_quietly(&mut self.child);
        }
    }
}

fn read_reply(path: &Path) -> Result<Option<Reply>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let reply = serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(reply))
}

fn snapshot(shared: &SharedOutput) -> Vec<u8> {
    match shared.lock() {
        Ok(buf) => buf.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}
