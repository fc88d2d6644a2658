//! How a harness was started and where the submission lives.
//!
//! A harness started with `--test <harness_dir> <testables_dir>` runs locally
//! and prints a human-readable report. Otherwise the grading service sends a
//! JSON object describing the submission on stdin and expects a JSON report.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::io::build_cache::BuildCache;
use crate::io::config::HarnessConfig;
use crate::io::sandbox::Sandbox;

/// Testables directory used when the submission info does not name one.
pub const DEFAULT_TESTABLES_DIR: &str = "../submission/";

/// Submission description sent by the grading service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmissionInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub harness_directory: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub testables_directory: Option<PathBuf>,
    /// Fields this crate does not interpret, kept as sent.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Local {
        harness_dir: PathBuf,
        testables_dir: PathBuf,
    },
    Remote(SubmissionInfo),
}

impl Invocation {
    /// A local run against the given directories, resolved to absolute paths.
    pub fn local(harness_dir: &Path, testables_dir: &Path) -> Result<Self> {
        Ok(Invocation::Local {
            harness_dir: std::path::absolute(harness_dir)
                .with_context(|| format!("resolve {}", harness_dir.display()))?,
            testables_dir: std::path::absolute(testables_dir)
                .with_context(|| format!("resolve {}", testables_dir.display()))?,
        })
    }

    /// Read the submission info JSON from `reader` (normally stdin).
    pub fn read_remote<R: Read>(reader: R) -> Result<Self> {
        let info: SubmissionInfo =
            serde_json::from_reader(reader).context("parse submission info")?;
        Ok(Invocation::Remote(info))
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Invocation::Local { .. })
    }

    pub fn testables_dir(&self) -> PathBuf {
        match self {
            Invocation::Local { testables_dir, .. } => testables_dir.clone(),
            Invocation::Remote(info) => info
                .testables_directory
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TESTABLES_DIR)),
        }
    }

    pub fn harness_dir(&self) -> Option<&Path> {
        match self {
            Invocation::Local { harness_dir, .. } => Some(harness_dir),
            Invocation::Remote(info) => info.harness_directory.as_deref(),
        }
    }
}

/// Owns the build cache and sandbox for one harness run.
pub struct Harness {
    invocation: Invocation,
    config: HarnessConfig,
    cache: BuildCache,
    sandbox: Sandbox,
}

impl Harness {
    #[instrument(skip_all, fields(local = invocation.is_local()))]
    pub fn open(invocation: Invocation, config: HarnessConfig) -> Self {
        let cache = BuildCache::open(config.compiler.clone(), config.workspace_root.clone());
        let sandbox = Sandbox::new(config.sandbox.clone(), config.workspace_root.clone());
        info!(testables = %invocation.testables_dir().display(), "harness opened");
        Self {
            invocation,
            config,
            cache,
            sandbox,
        }
    }

    pub fn invocation(&self) -> &Invocation {
        &self.invocation
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn cache(&self) -> &BuildCache {
        &self.cache
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// Absolute path of `name` relative to the root of the submission.
    pub fn student_file(&self, name: impl AsRef<Path>) -> Result<PathBuf> {
        let path = self.invocation.testables_dir().join(name.as_ref());
        let resolved =
            std::path::absolute(&path).with_context(|| format!("resolve {}", path.display()))?;
        debug!(path = %resolved.display(), "student file");
        Ok(resolved)
    }

    pub fn student_files<S: AsRef<Path>>(&self, names: &[S]) -> Result<Vec<PathBuf>> {
        names.iter().map(|name| self.student_file(name)).collect()
    }

    /// Remove every build workspace.
    pub fn close(self) -> Result<()> {
        self.cache.close().context("close build cache")
    }
}
