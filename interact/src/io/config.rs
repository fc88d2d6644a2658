//! Harness configuration loaded from TOML (e.g. `interact.toml`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Harness configuration (TOML).
///
/// Every field is optional in the file; missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct HarnessConfig {
    pub compiler: CompilerConfig,
    pub sandbox: SandboxConfig,
    pub capture: CaptureConfig,
    pub diagnostics: DiagnosticsConfig,
    /// Parent directory for build and run workspaces. Defaults to the system temp dir.
    pub workspace_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CompilerConfig {
    /// Compiler executable, invoked once per source file (`-c`) and once to link.
    pub program: String,
    /// Per-step wall-clock budget in seconds.
    pub timeout_secs: u64,
    /// Truncate captured compiler output beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            program: "g++".to_string(),
            timeout_secs: 120,
            output_limit_bytes: 100_000,
        }
    }
}

impl CompilerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Wall-clock budget for one program run, in seconds.
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CaptureConfig {
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl CaptureConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Limits applied to compiler output shown to students.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub max_lines: usize,
    pub max_chars: usize,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            max_lines: 20,
            max_chars: 20 * 72,
        }
    }
}

impl HarnessConfig {
    pub fn validate(&self) -> Result<()> {
        if self.compiler.program.trim().is_empty() {
            return Err(anyhow!("compiler.program must be non-empty"));
        }
        if self.compiler.timeout_secs == 0 {
            return Err(anyhow!("compiler.timeout_secs must be > 0"));
        }
        if self.compiler.output_limit_bytes == 0 {
            return Err(anyhow!("compiler.output_limit_bytes must be > 0"));
        }
        if self.sandbox.timeout_secs == 0 {
            return Err(anyhow!("sandbox.timeout_secs must be > 0"));
        }
        if self.sandbox.output_limit_bytes == 0 {
            return Err(anyhow!("sandbox.output_limit_bytes must be > 0"));
        }
        if self.capture.timeout_secs == 0 {
            return Err(anyhow!("capture.timeout_secs must be > 0"));
        }
        if self.capture.output_limit_bytes == 0 {
            return Err(anyhow!("capture.output_limit_bytes must be > 0"));
        }
        if self.diagnostics.max_lines == 0 || self.diagnostics.max_chars == 0 {
            return Err(anyhow!("diagnostics limits must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `HarnessConfig::default()`.
pub fn load_config(path: &Path) -> Result<HarnessConfig> {
    if !path.exists() {
        let cfg = HarnessConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: HarnessConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}
