mod cli;
mod plan;
mod run;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use interact::exit_codes;

use crate::cli::RunArgs;
use crate::run::Totals;

#[derive(Parser)]
#[command(name = "grade", version, about = "Run a grading harness plan against a submission")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every test of the plan and print the report.
    ///
    /// Without `--test`, submission info is read as JSON from stdin and the
    /// report is printed as JSON.
    Run {
        plan: PathBuf,
        /// Run locally against these directories and print a readable report.
        #[arg(long = "test", num_args = 2, value_names = ["HARNESS_DIR", "TESTABLES_DIR"])]
        test: Option<Vec<PathBuf>>,
        /// Configuration file (default: `interact.toml` next to the plan).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Report this total score instead of the summed one.
        #[arg(long)]
        score: Option<f64>,
        /// Report this maximum score instead of the summed one.
        #[arg(long)]
        max_score: Option<f64>,
    },
    /// Check that a plan parses and validates.
    Validate { plan: PathBuf },
}

fn main() {
    interact::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            plan,
            test,
            config,
            score,
            max_score,
        } => {
            let test_dirs = test.and_then(|dirs| match <[PathBuf; 2]>::try_from(dirs) {
                Ok([harness_dir, testables_dir]) => Some((harness_dir, testables_dir)),
                Err(_) => None,
            });
            cli::run(&RunArgs {
                plan,
                test_dirs,
                config,
                totals: Totals { score, max_score },
            })
        }
        Command::Validate { plan } => cli::validate(&plan),
    }
}
