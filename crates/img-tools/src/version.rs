//! Tool presence and version probing

use crate::{registry::ToolSpec, run_command, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Reported when a tool's version cannot be determined
pub const UNKNOWN_VERSION: &str = "unknown";

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Captured result of a short-lived command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

/// Runs short auxiliary commands such as version probes
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput>;
}

/// Runs commands as child processes
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
        run_command(program, args, timeout).await
    }
}

/// First non-empty line a tool prints for its version arguments, or
/// [`UNKNOWN_VERSION`] if it cannot be run or exits unsuccessfully.
pub async fn probe_version(runner: &dyn CommandRunner, program: &str, args: &[&str]) -> String {
    match runner.run(program, args, PROBE_TIMEOUT).await {
        Ok(output) if output.code == 0 => first_line(&output.stdout)
            .or_else(|| first_line(&output.stderr))
            .unwrap_or_else(|| UNKNOWN_VERSION.to_string()),
        Ok(output) => {
            debug!("{} version probe exited with {}", program, output.code);
            UNKNOWN_VERSION.to_string()
        }
        Err(e) => {
            debug!("{} version probe failed: {}", program, e);
            UNKNOWN_VERSION.to_string()
        }
    }
}

fn first_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

/// Whether a tool can be found and what version it reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolAvailability {
    pub name: String,
    pub executable: String,
    pub path: Option<PathBuf>,
    pub version: Option<String>,
}

impl ToolAvailability {
    pub fn is_available(&self) -> bool {
        self.path.is_some()
    }
}

/// Look up every tool on `PATH` and probe the ones found. A missing tool is
/// reported, never an error.
pub async fn check_tools(specs: &[ToolSpec], runner: &dyn CommandRunner) -> Vec<ToolAvailability> {
    let mut report = Vec::with_capacity(specs.len());
    for spec in specs {
        report.push(check_executable(spec.name, spec.executable, spec.version_args, runner).await);
    }
    report
}

/// Availability of a single executable, such as the container CLI used for
/// acquisition
pub async fn check_executable(
    name: &str,
    executable: &str,
    version_args: &[&str],
    runner: &dyn CommandRunner,
) -> ToolAvailability {
    let path = crate::get_command_path(executable);
    let version = match path {
        Some(_) => Some(probe_version(runner, executable, version_args).await),
        None => None,
    };
    ToolAvailability {
        name: name.to_string(),
        executable: executable.to_string(),
        path,
        version,
    }
}
