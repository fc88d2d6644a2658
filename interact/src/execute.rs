//! Compile (when needed) and run a student program.

use std::path::PathBuf;

use anyhow::Result;
use tracing::instrument;

use crate::error::{ProgramDidNotCompile, UsageError};
use crate::io::build_cache::{BuildCache, CompileOutcome};
use crate::io::sandbox::{ProgramOutput, Sandbox};

/// What to run: sources to build first, or a ready executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Program {
    Sources(Vec<PathBuf>),
    Executable(PathBuf),
}

impl Program {
    /// Exactly one of `files` or `executable` must be given.
    pub fn from_parts(
        files: Option<Vec<PathBuf>>,
        executable: Option<PathBuf>,
    ) -> Result<Self, UsageError> {
        match (files, executable) {
            (Some(files), None) if !files.is_empty() => Ok(Program::Sources(files)),
            (None, Some(executable)) => Ok(Program::Executable(executable)),
            _ => Err(UsageError),
        }
    }
}

/// Resolve `program` to an executable, compiling sources through `cache`.
pub fn executable_for(cache: &BuildCache, program: &Program) -> Result<PathBuf> {
    match program {
        Program::Executable(path) => Ok(path.clone()),
        Program::Sources(files) => match cache.compile(files, &[], false)? {
            CompileOutcome::Built { executable, .. } => Ok(executable),
            CompileOutcome::Failed { diagnostics } => Err(ProgramDidNotCompile { diagnostics }.into()),
        },
    }
}

/// Run `program` with `stdin`, compiling it first if it is given as sources.
///
/// A compile failure is a [`ProgramDidNotCompile`] error; a program that
/// cannot be started carries a [`crate::error::SandboxError`].
#[instrument(skip_all)]
pub fn run_program(
    cache: &BuildCache,
    sandbox: &Sandbox,
    program: &Program,
    stdin: &str,
) -> Result<ProgramOutput> {
    let executable = executable_for(cache, program)?;
    let output = sandbox.run(&executable, stdin)?;
    Ok(output)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::io::config::SandboxConfig;
    use crate::test_support::{FakeCompiler, write_script, write_source};

    #[test]
    fn from_parts_requires_exactly_one() {
        assert_eq!(Program::from_parts(None, None), Err(UsageError));
        assert_eq!(
            Program::from_parts(Some(vec![PathBuf::from("a.cpp")]), Some(PathBuf::from("main"))),
            Err(UsageError)
        );
        assert_eq!(
            Program::from_parts(None, Some(PathBuf::from("main"))),
            Ok(Program::Executable(PathBuf::from("main")))
        );
        assert_eq!(
            Program::from_parts(Some(vec![PathBuf::from("a.cpp")]), None),
            Ok(Program::Sources(vec![PathBuf::from("a.cpp")]))
        );
    }

    #[test]
    fn compiles_once_then_runs_sources() {
        let temp = tempfile::tempdir().expect("tempdir");
        let compiler = FakeCompiler::install(temp.path());
        let cache = BuildCache::open(compiler.config(), None);
        let sandbox = Sandbox::new(SandboxConfig::default(), None);
        let source = write_source(temp.path(), "hello.cpp", "printf 'Hello World!\\n'\n");
        let program = Program::Sources(vec![source]);

        let first = run_program(&cache, &sandbox, &program, "").expect("first run");
        let second = run_program(&cache, &sandbox, &program, "").expect("second run");

        assert_eq!(first.stdout, b"Hello World!\n");
        assert_eq!(first, second);
        assert_eq!(compiler.compile_steps(), 1);
        assert_eq!(compiler.link_steps(), 1);
        cache.close().expect("close");
    }

    #[test]
    fn compile_failure_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let compiler = FakeCompiler::install(temp.path());
        let cache = BuildCache::open(compiler.config(), None);
        let sandbox = Sandbox::new(SandboxConfig::default(), None);
        let source = write_source(temp.path(), "broken.cpp", "#error\n");

        let err = run_program(&cache, &sandbox, &Program::Sources(vec![source]), "")
            .expect_err("compile failure");
        let failure = err.downcast_ref::<ProgramDidNotCompile>().expect("did not compile");
        assert!(failure.diagnostics.contains("#error directive"));
    }

    #[test]
    fn runs_executable_directly() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cache = BuildCache::open(Default::default(), None);
        let sandbox = Sandbox::new(SandboxConfig::default(), None);
        let script = write_script(temp.path(), "exit7", "exit 7\n");

        let output = run_program(&cache, &sandbox, &Program::Executable(script), "")
            .expect("run");
        assert_eq!(output.exit_code, Some(7));
    }
}
