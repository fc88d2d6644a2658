//! CLI command implementations.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use interact::error::SchedulerError;
use interact::exit_codes;
use interact::harness::{Harness, Invocation};
use interact::io::config::load_config;
use tracing::{debug, error, info};

use crate::plan::PlanFile;
use crate::run::{Totals, run_plan};

/// Name of the configuration file looked up next to the plan.
pub const DEFAULT_CONFIG_FILE: &str = "interact.toml";

/// Options for `grade run`.
#[derive(Debug, Clone)]
pub struct RunArgs {
    pub plan: PathBuf,
    /// `(harness_dir, testables_dir)` for a local run.
    pub test_dirs: Option<(PathBuf, PathBuf)>,
    pub config: Option<PathBuf>,
    pub totals: Totals,
}

/// Run a plan and print its report. Returns the process exit code.
pub fn run(args: &RunArgs) -> Result<i32> {
    let plan = PlanFile::load(&args.plan)?;
    let plan_dir = plan_dir(&args.plan)?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| plan_dir.join(DEFAULT_CONFIG_FILE));
    let config = load_config(&config_path)?;
    debug!(config = %config_path.display(), "config loaded");

    let invocation = match &args.test_dirs {
        Some((harness_dir, testables_dir)) => Invocation::local(harness_dir, testables_dir)?,
        None => Invocation::read_remote(std::io::stdin().lock())?,
    };
    let local = invocation.is_local();

    let harness = Harness::open(invocation, config);
    let result = run_plan(&plan, &plan_dir, &harness, args.totals);
    let closed = harness.close();

    let report = match result {
        Ok(report) => report,
        Err(err) => {
            if let Err(close_err) = closed {
                let message = format!("{close_err:#}");
                error!(err = %message, "failed to clean up build workspaces");
            }
            if let Some(SchedulerError::CyclicDependency { .. }) = err.downcast_ref::<SchedulerError>() {
                eprintln!("{err:#}");
                return Ok(exit_codes::CYCLIC);
            }
            return Err(err);
        }
    };
    closed?;

    let mut stdout = std::io::stdout().lock();
    if local {
        write!(stdout, "{}", report.render_human()).context("write report")?;
    } else {
        writeln!(stdout, "{}", report.to_json().context("encode report")?).context("write report")?;
    }
    info!(score = report.score, max_score = report.max_score, "report written");
    Ok(exit_codes::OK)
}

/// Check that a plan parses and validates.
pub fn validate(plan_path: &Path) -> Result<i32> {
    let plan = PlanFile::load(plan_path)?;
    println!("plan ok: {} tests", plan.tests.len());
    Ok(exit_codes::OK)
}

fn plan_dir(plan_path: &Path) -> Result<PathBuf> {
    let absolute = std::path::absolute(plan_path)
        .with_context(|| format!("resolve {}", plan_path.display()))?;
    Ok(absolute
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(".")))
}

#[cfg(all(test, unix))]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn cycle_maps_to_cyclic_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let plan = temp.path().join("plan.toml");
        fs::write(
            &plan,
            r#"
[[tests]]
id = "a"
name = "A"
depends = ["a"]
type = "files_exist"
files = ["a"]
"#,
        )
        .expect("write plan");

        let args = RunArgs {
            plan,
            test_dirs: Some((temp.path().to_path_buf(), temp.path().join("submission"))),
            config: None,
            totals: Totals::default(),
        };
        assert_eq!(run(&args).expect("run"), exit_codes::CYCLIC);
    }

    #[test]
    fn invalid_config_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let plan = temp.path().join("plan.toml");
        fs::write(
            &plan,
            "[[tests]]\nid = \"a\"\nname = \"A\"\ntype = \"files_exist\"\nfiles = [\"a\"]\n",
        )
        .expect("write plan");
        fs::write(temp.path().join(DEFAULT_CONFIG_FILE), "[compiler]\ntimeout_secs = 0\n")
            .expect("write config");

        let args = RunArgs {
            plan,
            test_dirs: Some((temp.path().to_path_buf(), temp.path().join("submission"))),
            config: None,
            totals: Totals::default(),
        };
        assert!(run(&args).is_err());
    }

    #[test]
    fn validate_rejects_missing_plan() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(validate(&temp.path().join("missing.toml")).is_err());
    }
}
