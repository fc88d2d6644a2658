//! Test-only helpers: shell scripts standing in for programs and a fake compiler.
//!
//! "Sources" for the fake compiler are shell snippets. Compiling copies a
//! snippet into its object file; linking concatenates objects behind a
//! `#!/bin/sh` line and marks the result executable. A source containing
//! `#error` fails to compile and one containing `#slow` takes a second.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::io::config::CompilerConfig;

const FAKE_COMPILER: &str = r#"#!/bin/sh
printf '%s\n' "$*" >> "$INTERACT_FAKE_COMPILER_LOG"
out=""
src=""
mode=link
prev=""
for arg in "$@"; do
  case "$prev" in
    -o) out="$arg" ;;
    -c) mode=compile; src="$arg" ;;
  esac
  prev="$arg"
done
if [ "$mode" = compile ]; then
  if grep -q '#slow' "$src"; then sleep 1; fi
  if grep -q '#error' "$src"; then
    echo "$src:1:1: error: #error directive" >&2
    exit 1
  fi
  cat "$src" > "$out" || exit 1
  exit 0
fi
printf '#!/bin/sh\n' > "$out"
prev=""
for arg in "$@"; do
  case "$arg" in
    *.o) if [ "$prev" != -o ]; then cat "$arg" >> "$out"; fi ;;
  esac
  prev="$arg"
done
chmod +x "$out"
"#;

/// Write an executable `#!/bin/sh` script named `name` into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod script");
    path
}

/// Write a source file for the fake compiler.
pub fn write_source(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).expect("write source");
    path
}

/// A fake compiler installed in a directory, logging every invocation.
pub struct FakeCompiler {
    program: PathBuf,
    log: PathBuf,
}

impl FakeCompiler {
    pub fn install(dir: &Path) -> Self {
        let log = dir.join("compiler.log");
        fs::write(&log, "").expect("create compiler log");
        let body = FAKE_COMPILER.replace(
            "\"$INTERACT_FAKE_COMPILER_LOG\"",
            &format!("'{}'", log.display()),
        );
        let program = dir.join("fake-cxx");
        fs::write(&program, body).expect("write fake compiler");
        fs::set_permissions(&program, fs::Permissions::from_mode(0o755))
            .expect("chmod fake compiler");
        Self { program, log }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn config(&self) -> CompilerConfig {
        CompilerConfig {
            program: self.program.display().to_string(),
            ..CompilerConfig::default()
        }
    }

    /// Argument lines of every invocation so far.
    pub fn invocations(&self) -> Vec<String> {
        fs::read_to_string(&self.log)
            .expect("read compiler log")
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn compile_steps(&self) -> usize {
        self.invocations()
            .iter()
            .filter(|line| line.split(' ').any(|arg| arg == "-c"))
            .count()
    }

    pub fn link_steps(&self) -> usize {
        self.invocations().len() - self.compile_steps()
    }
}
