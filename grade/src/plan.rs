//! Harness plan parsing and validation.
//!
//! A plan is a TOML file listing the tests of a harness and what they depend
//! on. Dependency cycles are not rejected here; the scheduler reports them
//! when the plan runs.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use interact::execute::Program;
use regex::Regex;
use serde::Deserialize;

/// A parsed plan file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PlanFile {
    #[serde(default)]
    pub tests: Vec<PlanTest>,
}

/// One test of the plan.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PlanTest {
    /// Unique identifier referenced by `depends`.
    pub id: String,
    /// Name shown in the report.
    pub name: String,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(flatten)]
    pub check: Check,
}

/// What a test checks. Source files are relative to the submission root.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Check {
    FilesExist {
        files: Vec<PathBuf>,
    },
    Compiles {
        files: Vec<PathBuf>,
        #[serde(default)]
        flags: Vec<String>,
        #[serde(default)]
        ignore_cache: bool,
    },
    ProgramOutput {
        files: Option<Vec<PathBuf>>,
        /// Relative to the directory holding the plan file.
        executable: Option<PathBuf>,
        #[serde(default)]
        stdin: String,
        expect_lines: Option<Vec<String>>,
        expect_pattern: Option<String>,
        expect_exit_code: Option<i32>,
        #[serde(default = "default_max_score")]
        max_score: f64,
    },
}

fn default_max_score() -> f64 {
    10.0
}

impl PlanFile {
    /// Load and validate a plan file from the given path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
        let plan: PlanFile =
            toml::from_str(&contents).with_context(|| format!("parse plan {}", path.display()))?;
        plan.validate()
            .with_context(|| format!("validate plan {}", path.display()))?;
        Ok(plan)
    }

    #[cfg(test)]
    pub fn parse_str(contents: &str) -> Result<Self> {
        let plan: PlanFile = toml::from_str(contents).context("parse plan")?;
        plan.validate()?;
        Ok(plan)
    }

    fn validate(&self) -> Result<()> {
        if self.tests.is_empty() {
            bail!("tests must be a non-empty array");
        }
        let mut ids = BTreeSet::new();
        for test in &self.tests {
            validate_id(&test.id)?;
            if !ids.insert(test.id.as_str()) {
                bail!("duplicate test id {}", test.id);
            }
        }
        for test in &self.tests {
            if test.name.trim().is_empty() {
                bail!("test {}: name must be non-empty", test.id);
            }
            for dependency in &test.depends {
                if !ids.contains(dependency.as_str()) {
                    bail!("test {}: unknown dependency {dependency}", test.id);
                }
            }
            test.check
                .validate()
                .with_context(|| format!("test {} invalid", test.id))?;
        }
        Ok(())
    }
}

impl Check {
    fn validate(&self) -> Result<()> {
        match self {
            Check::FilesExist { files } => {
                if files.is_empty() {
                    bail!("files_exist.files must be a non-empty array");
                }
            }
            Check::Compiles { files, .. } => {
                if files.is_empty() {
                    bail!("compiles.files must be a non-empty array");
                }
            }
            Check::ProgramOutput {
                files,
                executable,
                expect_pattern,
                max_score,
                ..
            } => {
                Program::from_parts(files.clone(), executable.clone())
                    .context("program_output needs either files or executable")?;
                if let Some(pattern) = expect_pattern {
                    Regex::new(pattern).context("program_output.expect_pattern")?;
                }
                if !max_score.is_finite() || *max_score <= 0.0 {
                    bail!("program_output.max_score must be > 0");
                }
            }
        }
        Ok(())
    }
}

fn validate_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        bail!("test id must be non-empty");
    }
    if !id
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' || ch == '_')
    {
        bail!("test id {id} must use [a-z0-9_-] only");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_plan() {
        let input = r#"
[[tests]]
id = "files"
name = "All files present."
type = "files_exist"
files = ["main.cpp"]

[[tests]]
id = "compiles"
name = "Program compiles correctly."
depends = ["files"]
type = "compiles"
files = ["main.cpp"]
flags = ["-Wall"]

[[tests]]
id = "hello"
name = "Program prints Hello World."
depends = ["compiles"]
type = "program_output"
files = ["main.cpp"]
expect_lines = ["Hello World!"]
expect_exit_code = 0
"#;
        let plan = PlanFile::parse_str(input).expect("plan parses");
        assert_eq!(plan.tests.len(), 3);
        assert_eq!(plan.tests[1].depends, vec!["files".to_string()]);
        match &plan.tests[2].check {
            Check::ProgramOutput {
                max_score, stdin, ..
            } => {
                assert_eq!(*max_score, 10.0);
                assert!(stdin.is_empty());
            }
            other => panic!("unexpected check {other:?}"),
        }
    }

    #[test]
    fn bundled_plans_validate() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("plans/hello_world.toml");
        let plan = PlanFile::load(&path).expect("bundled plan");
        assert_eq!(plan.tests.len(), 3);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let input = r#"
[[tests]]
id = "files"
name = "a"
type = "files_exist"
files = ["a"]

[[tests]]
id = "files"
name = "b"
type = "files_exist"
files = ["b"]
"#;
        let err = PlanFile::parse_str(input).expect_err("duplicate");
        assert!(err.to_string().contains("duplicate test id files"));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let input = r#"
[[tests]]
id = "compiles"
name = "compiles"
depends = ["files"]
type = "compiles"
files = ["main.cpp"]
"#;
        let err = PlanFile::parse_str(input).expect_err("unknown dependency");
        assert!(err.to_string().contains("unknown dependency files"));
    }

    #[test]
    fn rejects_program_with_files_and_executable() {
        let input = r#"
[[tests]]
id = "run"
name = "run"
type = "program_output"
files = ["main.cpp"]
executable = "main"
"#;
        let _err = PlanFile::parse_str(input).expect_err("both given");
    }

    #[test]
    fn rejects_bad_pattern() {
        let input = r#"
[[tests]]
id = "run"
name = "run"
type = "program_output"
executable = "main"
expect_pattern = "("
"#;
        let err = PlanFile::parse_str(input).expect_err("bad regex");
        assert!(format!("{err:#}").contains("expect_pattern"));
    }

    #[test]
    fn accepts_cycles_for_the_scheduler_to_report() {
        let input = r#"
[[tests]]
id = "a"
name = "A"
depends = ["b"]
type = "files_exist"
files = ["a"]

[[tests]]
id = "b"
name = "B"
depends = ["a"]
type = "files_exist"
files = ["b"]
"#;
        PlanFile::parse_str(input).expect("cycles are left to the scheduler");
    }
}
