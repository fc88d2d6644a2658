//! Ready-made test bodies most harnesses need.

use std::path::PathBuf;

use anyhow::Result;
use regex::Regex;
use tracing::{debug, instrument};

use crate::core::outcome::{Message, Outcome, ScoreOptions};
use crate::core::text::{pretty_list, truncate_text};
use crate::error::ProgramDidNotCompile;
use crate::execute::{Program, run_program};
use crate::io::build_cache::{BuildCache, CompileOutcome};
use crate::io::config::DiagnosticsConfig;
use crate::io::sandbox::Sandbox;

pub const FILES_EXIST_KIND: &str = "interact/filesexist/basic_files_exist";
pub const COMPILES_CAP: f64 = 10.0;

/// Passes when every path in `files` is an existing regular file.
pub fn check_files_exist(files: &[PathBuf]) -> Outcome {
    let missing: Vec<String> = files
        .iter()
        .filter(|file| !file.is_file())
        .map(|file| file.display().to_string())
        .collect();

    let mut outcome = Outcome::new(
        "This test ensures that all of the necessary files are present.",
        Some(1.0),
        "Great job! All the necessary files are present.",
    );
    if missing.is_empty() {
        outcome.set_passing(true);
    } else {
        debug!(missing = ?missing, "files missing");
        outcome.add_message(
            Message::new("You are missing {{ missing_files_ }}.")
                .named("missing_files_", pretty_list(&missing, "and", "nothing"))
                .named("missing_files", &missing)
                .delta(-1.0)
                .kind(FILES_EXIST_KIND),
        );
        outcome.set_passing(false);
    }
    outcome
}

/// Compile `files` and report whether the compiler accepted them.
#[instrument(skip_all, fields(files = files.len(), ignore_cache = ignore_cache))]
pub fn check_compiles(
    cache: &BuildCache,
    files: &[PathBuf],
    flags: &[String],
    ignore_cache: bool,
    limits: DiagnosticsConfig,
) -> Result<Outcome> {
    let compiled = cache.compile(files, flags, ignore_cache)?;
    let command = cache.compile_command(files, flags);

    let mut outcome = Outcome::new(
        format!(
            "This test ensures that your code compiles without errors. \
             Your program was compiled with {command}."
        ),
        Some(COMPILES_CAP),
        "**Great job!** Your code compiled cleanly without any problems.",
    );
    outcome.set_bulleted(false);

    match compiled {
        CompileOutcome::Built { .. } => {
            outcome.set_score(COMPILES_CAP);
        }
        CompileOutcome::Failed { diagnostics } => {
            if diagnostics.trim().is_empty() {
                outcome.add_message(Message::new(
                    "Your code did not compile but the compiler did not output any errors or warnings.",
                ));
            } else {
                let shown = truncate_text(&diagnostics, limits.max_lines, limits.max_chars);
                outcome.add_message(
                    Message::new(
                        "Your code did not compile. The compiler output the following \
                         errors:\n\n```\n{{ compiler_output }}\n```\n",
                    )
                    .named("compiler_output", shown)
                    .delta(-COMPILES_CAP),
                );
            }
            outcome.set_score(0.0);
        }
    }
    Ok(outcome)
}

/// What a program's run is checked against. Unset fields are not checked.
#[derive(Debug, Clone, Default)]
pub struct OutputExpectation {
    /// Exact stdout, line by line.
    pub lines: Option<Vec<String>>,
    /// Must match somewhere in stdout.
    pub pattern: Option<Regex>,
    pub exit_code: Option<i32>,
}

/// Run `program` with `stdin` and compare what it did to `expectation`.
///
/// Each unmet expectation costs half of `cap`; the score never drops below 0.
/// A program that times out or does not compile scores 0.
#[instrument(skip_all, fields(cap = cap))]
pub fn check_program_output(
    cache: &BuildCache,
    sandbox: &Sandbox,
    program: &Program,
    stdin: &str,
    expectation: &OutputExpectation,
    cap: f64,
    limits: DiagnosticsConfig,
) -> Result<Outcome> {
    let mut outcome = Outcome::new(
        "This test runs your program and checks its output.",
        Some(cap),
        "**Great job!** Your program produced the expected output.",
    );

    let output = match run_program(cache, sandbox, program, stdin) {
        Ok(output) => output,
        Err(err) if err.downcast_ref::<ProgramDidNotCompile>().is_some() => {
            outcome.add_message(
                Message::new("Your program did not compile, so its output could not be checked.")
                    .delta(-cap),
            );
            outcome.set_score(0.0);
            return Ok(outcome);
        }
        Err(err) => return Err(err),
    };

    if output.timed_out {
        outcome.add_message(
            Message::new("Your program did not finish within {{ seconds }} seconds.")
                .named("seconds", sandbox.config().timeout_secs)
                .delta(-cap),
        );
        outcome.set_score(0.0);
        return Ok(outcome);
    }

    let penalty = -cap / 2.0;
    let stdout = output.stdout_text();

    if let Some(expected) = &expectation.lines {
        let actual: Vec<&str> = stdout.lines().collect();
        if actual != *expected {
            outcome.add_message(
                Message::new(
                    "Your program's output did not match the expected output.\n\n\
                     Expected:\n\n```\n{{ expected }}\n```\n\n\
                     Your program printed:\n\n```\n{{ actual }}\n```",
                )
                .named("expected", expected.join("\n"))
                .named(
                    "actual",
                    truncate_text(&stdout, limits.max_lines, limits.max_chars),
                )
                .delta(penalty),
            );
        }
    }

    if let Some(pattern) = &expectation.pattern
        && !pattern.is_match(&stdout)
    {
        outcome.add_message(
            Message::new("Your program's output did not contain the expected text (`{{ pattern }}`).")
                .named("pattern", pattern.as_str())
                .delta(penalty),
        );
    }

    if let Some(expected) = expectation.exit_code
        && output.exit_code != Some(expected)
    {
        let message = match output.exit_code {
            Some(actual) => {
                Message::new("Your program exited with code {{ actual }} but {{ expected }} was expected.")
                    .named("actual", actual)
            }
            None => Message::new(
                "Your program was stopped by a signal but should have exited with code {{ expected }}.",
            ),
        };
        outcome.add_message(message.named("expected", expected).delta(penalty));
    }

    outcome.calculate_score(ScoreOptions::min_score(0.0));
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn files_exist_passes_with_cap_one() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = temp.path().join("main.cpp");
        std::fs::write(&file, "").expect("write");

        let outcome = check_files_exist(&[file]);
        assert!(outcome.is_passing());
        assert_eq!(outcome.score(), Some(1.0));
        assert_eq!(outcome.cap(), Some(1.0));
        assert!(outcome.render(false).ends_with("Great job! All the necessary files are present."));
    }

    #[test]
    fn files_exist_lists_missing_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let present = temp.path().join("main.cpp");
        std::fs::write(&present, "").expect("write");
        let missing_a = temp.path().join("a.h");
        let missing_b = temp.path().join("b.h");

        let outcome = check_files_exist(&[present, missing_a.clone(), missing_b.clone()]);
        assert!(!outcome.is_passing());
        assert_eq!(outcome.score(), Some(0.0));
        let message = &outcome.messages()[0];
        assert_eq!(message.message_kind(), Some(FILES_EXIST_KIND));
        assert_eq!(message.score_delta(), Some(-1.0));
        assert_eq!(
            message.render(),
            format!("You are missing {} and {}.", missing_a.display(), missing_b.display())
        );
    }

    #[test]
    fn directories_do_not_count_as_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(!check_files_exist(&[temp.path().to_path_buf()]).is_passing());
    }
}

#[cfg(all(test, unix))]
mod process_tests {
    use super::*;
    use crate::io::config::SandboxConfig;
    use crate::test_support::{FakeCompiler, write_script, write_source};

    struct Fixture {
        temp: tempfile::TempDir,
        compiler: FakeCompiler,
        cache: BuildCache,
        sandbox: Sandbox,
    }

    fn fixture() -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let compiler = FakeCompiler::install(temp.path());
        let cache = BuildCache::open(compiler.config(), None);
        let sandbox = Sandbox::new(SandboxConfig::default(), None);
        Fixture {
            temp,
            compiler,
            cache,
            sandbox,
        }
    }

    #[test]
    fn compiles_scores_full_marks_and_names_command() {
        let fx = fixture();
        let source = write_source(fx.temp.path(), "main.cpp", "echo hi\n");

        let outcome = check_compiles(
            &fx.cache,
            &[source.clone()],
            &["-Wall".to_string()],
            false,
            DiagnosticsConfig::default(),
        )
        .expect("check");

        assert_eq!(outcome.score(), Some(COMPILES_CAP));
        let expected_command = format!("{} -Wall -o main {}", fx.compiler.program().display(), source.display());
        assert!(outcome.brief().contains(&expected_command));
        assert!(outcome.render(false).contains("compiled cleanly"));
    }

    #[test]
    fn compile_failure_shows_truncated_diagnostics() {
        let fx = fixture();
        let source = write_source(fx.temp.path(), "main.cpp", "#error\n");
        let limits = DiagnosticsConfig {
            max_lines: 20,
            max_chars: 10,
        };

        let outcome = check_compiles(&fx.cache, &[source], &[], false, limits).expect("check");

        assert_eq!(outcome.score(), Some(0.0));
        let rendered = outcome.render(false);
        assert!(rendered.contains("Your code did not compile."));
        assert!(rendered.contains("---Remaining text truncated---"));
        assert!(!rendered.contains(" * "));
    }

    #[test]
    fn matching_output_scores_cap() {
        let fx = fixture();
        let source = write_source(fx.temp.path(), "main.cpp", "printf 'Hello World!\\n'\n");
        let expectation = OutputExpectation {
            lines: Some(vec!["Hello World!".to_string()]),
            pattern: Some(Regex::new("World").expect("regex")),
            exit_code: Some(0),
        };

        let outcome = check_program_output(
            &fx.cache,
            &fx.sandbox,
            &Program::Sources(vec![source]),
            "",
            &expectation,
            10.0,
            DiagnosticsConfig::default(),
        )
        .expect("check");

        assert_eq!(outcome.score(), Some(10.0));
        assert!(outcome.messages().is_empty());
    }

    #[test]
    fn each_unmet_expectation_costs_half_the_cap() {
        let fx = fixture();
        let script = write_script(fx.temp.path(), "prog", "echo wrong\nexit 3\n");
        let expectation = OutputExpectation {
            lines: Some(vec!["right".to_string()]),
            pattern: None,
            exit_code: Some(0),
        };

        let outcome = check_program_output(
            &fx.cache,
            &fx.sandbox,
            &Program::Executable(script),
            "",
            &expectation,
            10.0,
            DiagnosticsConfig::default(),
        )
        .expect("check");

        assert_eq!(outcome.messages().len(), 2);
        assert_eq!(outcome.score(), Some(0.0));
        assert!(outcome.messages()[1].render().contains("exited with code 3 but 0"));
    }

    #[test]
    fn one_unmet_expectation_leaves_half() {
        let fx = fixture();
        let script = write_script(fx.temp.path(), "prog", "echo right\n");
        let expectation = OutputExpectation {
            lines: None,
            pattern: Some(Regex::new("^nope").expect("regex")),
            exit_code: Some(0),
        };

        let outcome = check_program_output(
            &fx.cache,
            &fx.sandbox,
            &Program::Executable(script),
            "",
            &expectation,
            10.0,
            DiagnosticsConfig::default(),
        )
        .expect("check");

        assert_eq!(outcome.score(), Some(5.0));
    }

    #[test]
    fn program_that_does_not_compile_scores_zero() {
        let fx = fixture();
        let source = write_source(fx.temp.path(), "main.cpp", "#error\n");

        let outcome = check_program_output(
            &fx.cache,
            &fx.sandbox,
            &Program::Sources(vec![source]),
            "",
            &OutputExpectation::default(),
            10.0,
            DiagnosticsConfig::default(),
        )
        .expect("check");

        assert!(!outcome.is_passing());
        assert!(outcome.render(false).contains("did not compile"));
    }
}
