//! Plan execution: register every test with the scheduler, run, and report.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use interact::core::outcome::Outcome;
use interact::core::scheduler::{Scheduler, TestId};
use interact::execute::Program;
use interact::harness::Harness;
use interact::report::Report;
use interact::standard_tests::{
    OutputExpectation, check_compiles, check_files_exist, check_program_output,
};
use regex::Regex;
use tracing::{debug, info, instrument};

use crate::plan::{Check, PlanFile, PlanTest};

/// Explicit totals that replace the summed ones in the report.
#[derive(Debug, Clone, Copy, Default)]
pub struct Totals {
    pub score: Option<f64>,
    pub max_score: Option<f64>,
}

/// Run every test of `plan` against the submission of `harness`.
///
/// A dependency cycle aborts the run with a
/// [`interact::error::SchedulerError::CyclicDependency`] inside the error.
#[instrument(skip_all, fields(tests = plan.tests.len()))]
pub fn run_plan(plan: &PlanFile, plan_dir: &Path, harness: &Harness, totals: Totals) -> Result<Report> {
    let mut scheduler = Scheduler::new();
    let mut ids: HashMap<&str, TestId> = HashMap::new();
    for test in &plan.tests {
        let id = scheduler.register(test.name.clone(), &[], move || {
            run_check(test, plan_dir, harness)
        })?;
        ids.insert(test.id.as_str(), id);
    }
    for test in &plan.tests {
        let id = ids[test.id.as_str()];
        for dependency in &test.depends {
            let dependency = *ids
                .get(dependency.as_str())
                .with_context(|| format!("test {}: unknown dependency {dependency}", test.id))?;
            scheduler.depend_on(id, dependency)?;
        }
    }
    debug!(tests = scheduler.len(), "plan registered");

    scheduler.run_all()?;

    let report = Report::from_scheduler(&scheduler).with_totals(totals.score, totals.max_score);
    info!(score = report.score, max_score = report.max_score, "plan finished");
    Ok(report)
}

fn run_check(test: &PlanTest, plan_dir: &Path, harness: &Harness) -> Result<Outcome> {
    debug!(test = %test.id, "running check");
    match &test.check {
        Check::FilesExist { files } => Ok(check_files_exist(&harness.student_files(files)?)),
        Check::Compiles {
            files,
            flags,
            ignore_cache,
        } => check_compiles(
            harness.cache(),
            &harness.student_files(files)?,
            flags,
            *ignore_cache,
            harness.config().diagnostics,
        ),
        Check::ProgramOutput {
            files,
            executable,
            stdin,
            expect_lines,
            expect_pattern,
            expect_exit_code,
            max_score,
        } => {
            let files = files
                .as_ref()
                .map(|files| harness.student_files(files))
                .transpose()?;
            let executable = executable.as_ref().map(|path| resolve(plan_dir, path));
            let program = Program::from_parts(files, executable)?;
            let pattern = expect_pattern
                .as_deref()
                .map(Regex::new)
                .transpose()
                .context("compile expect_pattern")?;
            let expectation = OutputExpectation {
                lines: expect_lines.clone(),
                pattern,
                exit_code: *expect_exit_code,
            };
            check_program_output(
                harness.cache(),
                harness.sandbox(),
                &program,
                stdin,
                &expectation,
                *max_score,
                harness.config().diagnostics,
            )
        }
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
