//! Compile-once cache of student programs.
//!
//! A [`BuildKey`] is the sorted set of absolute source paths plus the ordered
//! compiler flags. Each key owns a slot with its own lock, so two callers with
//! the same key never build twice at once while different keys build in
//! parallel. Only successful builds are published; a failed build leaves the
//! slot empty and its workspace is removed on the spot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use anyhow::{Context, Result, anyhow};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tracing::{debug, info, instrument, warn};

use crate::core::text::display_command;
use crate::io::config::CompilerConfig;
use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Name of the linked executable inside a build workspace.
pub const EXECUTABLE_NAME: &str = "main";

/// Identity of a build: path order is irrelevant, flag order is significant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildKey {
    files: Vec<PathBuf>,
    flags: Vec<String>,
}

impl BuildKey {
    pub fn new(files: &[PathBuf], flags: &[String]) -> Result<Self> {
        let mut absolute = files
            .iter()
            .map(|file| {
                std::path::absolute(file).with_context(|| format!("absolute path {}", file.display()))
            })
            .collect::<Result<Vec<_>>>()?;
        absolute.sort();
        Ok(Self {
            files: absolute,
            flags: flags.to_vec(),
        })
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn flags(&self) -> &[String] {
        &self.flags
    }

    /// Hex SHA-256 over the key, used to name build workspaces.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for file in &self.files {
            hasher.update(file.to_string_lossy().as_bytes());
            hasher.update([0u8]);
        }
        hasher.update([1u8]);
        for flag in &self.flags {
            hasher.update(flag.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}

/// A linked executable and the workspace that holds it.
#[derive(Debug)]
pub struct BuildArtifact {
    executable: PathBuf,
    workspace: TempDir,
}

impl BuildArtifact {
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn workspace(&self) -> &Path {
        self.workspace.path()
    }
}

/// Result of [`BuildCache::compile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    Built { executable: PathBuf, cached: bool },
    /// Combined output of every failing compiler step.
    Failed { diagnostics: String },
}

impl CompileOutcome {
    pub fn executable(&self) -> Option<&Path> {
        match self {
            CompileOutcome::Built { executable, .. } => Some(executable),
            CompileOutcome::Failed { .. } => None,
        }
    }
}

#[derive(Default)]
struct BuildSlot {
    artifact: Mutex<Option<BuildArtifact>>,
}

enum BuildResult {
    Linked(BuildArtifact),
    Failed(String),
}

/// Memoizes successful builds for the lifetime of the cache.
pub struct BuildCache {
    compiler: CompilerConfig,
    workspace_root: Option<PathBuf>,
    slots: Mutex<HashMap<BuildKey, Arc<BuildSlot>>>,
    retired: Mutex<Vec<TempDir>>,
}

impl BuildCache {
    pub fn open(compiler: CompilerConfig, workspace_root: Option<PathBuf>) -> Self {
        Self {
            compiler,
            workspace_root,
            slots: Mutex::new(HashMap::new()),
            retired: Mutex::new(Vec::new()),
        }
    }

    pub fn compiler(&self) -> &CompilerConfig {
        &self.compiler
    }

    /// Display form of a single command equivalent to the build of `files`.
    ///
    /// The cache itself compiles each file to an object with `-c` and then
    /// links the objects; this one-step form is what students are shown.
    pub fn compile_command(&self, files: &[PathBuf], flags: &[String]) -> String {
        let mut args = vec![self.compiler.program.clone()];
        args.extend(flags.iter().cloned());
        args.extend(["-o".to_string(), EXECUTABLE_NAME.to_string()]);
        args.extend(files.iter().map(|file| file.display().to_string()));
        display_command(&args)
    }

    /// Compile and link `files`, reusing a published artifact unless `ignore_cache`.
    ///
    /// A compiler that cannot be started is an error carrying a
    /// [`crate::error::LaunchError`]; compiler diagnostics are a
    /// [`CompileOutcome::Failed`].
    #[instrument(skip_all, fields(files = files.len(), ignore_cache = ignore_cache))]
    pub fn compile(
        &self,
        files: &[PathBuf],
        flags: &[String],
        ignore_cache: bool,
    ) -> Result<CompileOutcome> {
        if files.is_empty() {
            return Err(anyhow!("no source files to compile"));
        }
        let key = BuildKey::new(files, flags)?;
        let slot = {
            let mut slots = lock(&self.slots, "build cache")?;
            Arc::clone(slots.entry(key.clone()).or_default())
        };

        let mut artifact = lock(&slot.artifact, "build slot")?;
        if !ignore_cache && let Some(existing) = artifact.as_ref() {
            debug!(executable = %existing.executable.display(), "build cache hit");
            return Ok(CompileOutcome::Built {
                executable: existing.executable.clone(),
                cached: true,
            });
        }

        match self.build(&key)? {
            BuildResult::Failed(diagnostics) => Ok(CompileOutcome::Failed { diagnostics }),
            BuildResult::Linked(built) => {
                let executable = built.executable.clone();
                if let Some(replaced) = artifact.replace(built) {
                    debug!(
                        workspace = %replaced.workspace().display(),
                        "retiring replaced build workspace"
                    );
                    lock(&self.retired, "retired workspaces")?.push(replaced.workspace);
                }
                info!(executable = %executable.display(), "build published");
                Ok(CompileOutcome::Built {
                    executable,
                    cached: false,
                })
            }
        }
    }

    fn build(&self, key: &BuildKey) -> Result<BuildResult> {
        let digest = key.digest();
        let prefix = format!("interact-build-{}-", &digest[..12]);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let workspace = match &self.workspace_root {
            Some(root) => builder
                .tempdir_in(root)
                .with_context(|| format!("create build workspace in {}", root.display()))?,
            None => builder.tempdir().context("create build workspace")?,
        };
        debug!(workspace = %workspace.path().display(), "build workspace created");

        let objects: Vec<PathBuf> = key
            .files
            .iter()
            .enumerate()
            .map(|(index, file)| {
                let stem = file
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "source".to_string());
                workspace.path().join(format!("{index}-{stem}.o"))
            })
            .collect();

        let steps: Vec<Result<CommandOutput>> = thread::scope(|scope| {
            let handles: Vec<_> = key
                .files
                .iter()
                .zip(&objects)
                .map(|(file, object)| {
                    let mut args = key.flags.clone();
                    args.push("-c".to_string());
                    args.push(file.display().to_string());
                    args.push("-o".to_string());
                    args.push(object.display().to_string());
                    let dir = workspace.path();
                    scope.spawn(move || self.run_step(&args, dir))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(anyhow!("compile thread panicked")))
                })
                .collect()
        });

        let mut diagnostics = String::new();
        let mut failed = false;
        for step in steps {
            let output = step?;
            if !step_succeeded(&output) {
                failed = true;
                append_diagnostics(&mut diagnostics, &output);
            }
        }
        if failed {
            info!(workspace = %workspace.path().display(), "compilation failed");
            return Ok(BuildResult::Failed(diagnostics));
        }

        let executable = workspace.path().join(EXECUTABLE_NAME);
        let mut args = key.flags.clone();
        args.push("-o".to_string());
        args.push(executable.display().to_string());
        args.extend(objects.iter().map(|object| object.display().to_string()));
        let output = self.run_step(&args, workspace.path())?;
        if !step_succeeded(&output) {
            append_diagnostics(&mut diagnostics, &output);
            info!(workspace = %workspace.path().display(), "link failed");
            return Ok(BuildResult::Failed(diagnostics));
        }

        Ok(BuildResult::Linked(BuildArtifact {
            executable,
            workspace,
        }))
    }

    fn run_step(&self, args: &[String], dir: &Path) -> Result<CommandOutput> {
        let mut cmd = Command::new(&self.compiler.program);
        cmd.args(args).current_dir(dir);
        debug!(command = %display_command(args), "compiler step");
        run_command_with_timeout(
            cmd,
            None,
            self.compiler.timeout(),
            self.compiler.output_limit_bytes,
        )
    }

    /// Remove every build workspace, published or retired.
    #[instrument(skip_all)]
    pub fn close(self) -> Result<()> {
        let slots = self
            .slots
            .into_inner()
            .map_err(|_| anyhow!("build cache lock poisoned"))?;
        let mut workspaces = self
            .retired
            .into_inner()
            .map_err(|_| anyhow!("retired workspaces lock poisoned"))?;
        for (_, slot) in slots {
            let slot = Arc::try_unwrap(slot).map_err(|_| anyhow!("build slot still in use"))?;
            let artifact = slot
                .artifact
                .into_inner()
                .map_err(|_| anyhow!("build slot lock poisoned"))?;
            if let Some(artifact) = artifact {
                workspaces.push(artifact.workspace);
            }
        }

        let total = workspaces.len();
        let mut failures = Vec::new();
        for workspace in workspaces {
            let path = workspace.path().to_path_buf();
            if let Err(err) = workspace.close() {
                warn!(workspace = %path.display(), err = %err, "failed to remove build workspace");
                failures.push(format!("{}: {err}", path.display()));
            }
        }
        if !failures.is_empty() {
            return Err(anyhow!(
                "failed to remove {} of {total} build workspaces: {}",
                failures.len(),
                failures.join("; ")
            ));
        }
        debug!(removed = total, "build workspaces removed");
        Ok(())
    }
}

fn step_succeeded(output: &CommandOutput) -> bool {
    output.status.success() && !output.timed_out
}

fn append_diagnostics(diagnostics: &mut String, output: &CommandOutput) {
    diagnostics.push_str(&output.combined_text());
    if output.timed_out {
        diagnostics.push_str("\n[compiler timed out]\n");
    }
}

fn lock<'m, T>(mutex: &'m Mutex<T>, what: &str) -> Result<MutexGuard<'m, T>> {
    mutex.lock().map_err(|_| anyhow!("{what} lock poisoned"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(files: &[&str], flags: &[&str]) -> BuildKey {
        let files: Vec<PathBuf> = files.iter().map(PathBuf::from).collect();
        let flags: Vec<String> = flags.iter().map(|flag| flag.to_string()).collect();
        BuildKey::new(&files, &flags).expect("key")
    }

    #[test]
    fn key_ignores_path_order() {
        assert_eq!(key(&["/a.cpp", "/b.cpp"], &["-Wall"]), key(&["/b.cpp", "/a.cpp"], &["-Wall"]));
        assert_eq!(
            key(&["/a.cpp", "/b.cpp"], &[]).digest(),
            key(&["/b.cpp", "/a.cpp"], &[]).digest()
        );
    }

    #[test]
    fn key_respects_flag_order() {
        let first = key(&["/a.cpp"], &["-Wall", "-O2"]);
        let second = key(&["/a.cpp"], &["-O2", "-Wall"]);
        assert_ne!(first, second);
        assert_ne!(first.digest(), second.digest());
    }

    #[test]
    fn key_makes_paths_absolute() {
        let relative = key(&["main.cpp"], &[]);
        assert!(relative.files()[0].is_absolute());
    }

    #[test]
    fn compile_command_lists_flags_before_output() {
        let cache = BuildCache::open(CompilerConfig::default(), None);
        let files = vec![PathBuf::from("main.cpp"), PathBuf::from("my foo.cpp")];
        let flags = vec!["-Wall".to_string(), "-Werror".to_string()];
        assert_eq!(
            cache.compile_command(&files, &flags),
            "g++ -Wall -Werror -o main main.cpp \"my foo.cpp\""
        );
    }

    #[test]
    fn compile_without_files_is_an_error() {
        let cache = BuildCache::open(CompilerConfig::default(), None);
        assert!(cache.compile(&[], &[], false).is_err());
    }
}
