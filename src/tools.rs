// External tool resolver and subprocess seam for exiftool and the import tool
//
// Resolution order:
// 1) Environment variable override (TAKEOUT_EXIFTOOL_PATH, TAKEOUT_IMPORT_TOOL_PATH)
// 2) Path from the config file
// 3) Binary next to the executable (or in its bin/ subdirectory)
// 4) PATH fallback

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;
use crate::error::{MigrateError, Result};

pub const EXIFTOOL_ENV: &str = "TAKEOUT_EXIFTOOL_PATH";
pub const IMPORT_TOOL_ENV: &str = "TAKEOUT_IMPORT_TOOL_PATH";

/// Captured result of one external tool invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    /// None when the process was killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout followed by stderr, for diagnostics and marker scanning.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Runs an external program to completion. The adapters only ever talk to
/// exiftool and the import tool through this trait.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &Path, args: &[String]) -> std::io::Result<ToolOutput>;
}

/// Runs programs as real subprocesses.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &Path, args: &[String]) -> std::io::Result<ToolOutput> {
        let output = Command::new(program).args(args).output()?;
        Ok(ToolOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Get the directory containing the current executable
fn exe_dir() -> Option<PathBuf> {
    env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.to_path_buf()))
}

/// Resolve a tool path.
fn resolve_tool(env_key: &str, configured: Option<&Path>, default_name: &str) -> PathBuf {
    if let Ok(v) = env::var(env_key) {
        let p = PathBuf::from(&v);
        if p.exists() {
            return p;
        }
    }

    if let Some(p) = configured {
        return p.to_path_buf();
    }

    let mut filename = default_name.to_string();
    if cfg!(windows) && !filename.to_lowercase().ends_with(".exe") {
        filename.push_str(".exe");
    }

    if let Some(dir) = exe_dir() {
        let candidate = dir.join(&filename);
        if candidate.exists() {
            return candidate;
        }

        let bin_candidate = dir.join("bin").join(&filename);
        if bin_candidate.exists() {
            return bin_candidate;
        }
    }

    PathBuf::from(default_name)
}

/// Get path to exiftool binary
pub fn exiftool_path(configured: Option<&Path>) -> PathBuf {
    resolve_tool(EXIFTOOL_ENV, configured, "exiftool")
}

/// Get path to the destination import tool (osxphotos)
pub fn import_tool_path(configured: Option<&Path>) -> PathBuf {
    resolve_tool(IMPORT_TOOL_ENV, configured, "osxphotos")
}

/// Run a tool's version command through the runner. Missing or failing
/// tools are a fatal `ToolMissing`.
pub fn check_tool_version(runner: &dyn CommandRunner, path: &Path, version_arg: &str) -> Result<String> {
    let output = runner
        .run(path, &[version_arg.to_string()])
        .map_err(|e| MigrateError::ToolMissing(format!("{}: {}", path.display(), e)))?;
    if !output.success() {
        return Err(MigrateError::ToolMissing(format!(
            "{} exited with {:?}",
            path.display(),
            output.code
        )));
    }
    Ok(output.stdout.trim().to_string())
}

/// Run an operator-configured command line (health check or restart hook).
/// Returns true when it exited with status 0.
pub fn run_command_line(runner: &dyn CommandRunner, command: &[String]) -> bool {
    let Some((program, args)) = command.split_first() else {
        return false;
    };
    match runner.run(Path::new(program), args) {
        Ok(output) => output.success(),
        Err(e) => {
            log::debug!("Command {} failed to start: {}", program, e);
            false
        }
    }
}
