//! External analysis tool integration for container image scanning
//!
//! Every analysis tool is an entry in a strategy table ([`registry`]): how to
//! invoke it, how long it may run, and how to read its output. The
//! [`runner`] executes one entry against an extracted filesystem and always
//! produces a [`ToolResult`], whatever the tool does.

pub mod findings;
pub mod magika;
pub mod malcontent;
pub mod registry;
pub mod runner;
pub mod trivy;
pub mod version;

pub use findings::{CapabilityFindings, FileTypeFindings, ToolFindings, VulnerabilityFindings};
pub use registry::{builtin_tools, find_tool, OutputCapture, ToolSpec, BUILTIN_TOOLS};
pub use runner::{run_tool, Invocation};
pub use version::{
    check_executable, check_tools, probe_version, CommandOutput, CommandRunner, SystemCommandRunner,
    ToolAvailability, UNKNOWN_VERSION,
};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Tool timeout after {0:?}")]
    Timeout(Duration),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ToolError {
    fn from(e: serde_json::Error) -> Self {
        ToolError::ParseError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ToolError>;

/// Terminal state of one tool in one scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Ok,
    Failed,
    Timeout,
    Skipped,
}

impl ToolStatus {
    /// Enabled but did not finish successfully
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ToolStatus::Failed | ToolStatus::Timeout)
    }
}

impl std::fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolStatus::Ok => write!(f, "ok"),
            ToolStatus::Failed => write!(f, "failed"),
            ToolStatus::Timeout => write!(f, "timeout"),
            ToolStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Outcome of running (or not running) one analysis tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub name: String,
    pub version: String,
    pub status: ToolStatus,
    /// Diagnostic for failed and timed-out runs, or a note about unreadable output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Raw tool output, present for `ok` runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<PathBuf>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub findings: Option<ToolFindings>,
}

impl ToolResult {
    /// Result for a tool that was disabled and never invoked
    pub fn skipped(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: UNKNOWN_VERSION.to_string(),
            status: ToolStatus::Skipped,
            error: None,
            output_file: None,
            duration_ms: 0,
            findings: None,
        }
    }

    pub fn failed(name: &str, version: String, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            version,
            status: ToolStatus::Failed,
            error: Some(message.into()),
            output_file: None,
            duration_ms: 0,
            findings: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ToolStatus::Ok
    }
}

/// Run a command to completion with a timeout. The child is killed if the
/// deadline passes or the returned future is dropped.
pub async fn run_command(program: &str, args: &[&str], limit: Duration) -> Result<CommandOutput> {
    use tokio::process::Command;
    use tokio::time::timeout;

    let child = Command::new(program)
        .args(args)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .output();

    match timeout(limit, child).await {
        Ok(Ok(output)) => Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            code: output.status.code().unwrap_or(-1),
        }),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ToolError::NotFound(program.to_string()))
        }
        Ok(Err(e)) => Err(ToolError::ExecutionFailed(e.to_string())),
        Err(_) => Err(ToolError::Timeout(limit)),
    }
}

/// Get command path
pub fn get_command_path(cmd: &str) -> Option<PathBuf> {
    which::which(cmd).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ToolStatus::Timeout).unwrap(), "\"timeout\"");
        assert!(ToolStatus::Failed.is_incomplete());
        assert!(ToolStatus::Timeout.is_incomplete());
        assert!(!ToolStatus::Skipped.is_incomplete());
        assert!(!ToolStatus::Ok.is_incomplete());
    }

    #[test]
    fn test_skipped_result() {
        let result = ToolResult::skipped("magika");
        assert_eq!(result.status, ToolStatus::Skipped);
        assert_eq!(result.version, UNKNOWN_VERSION);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_run_command_missing_program() {
        let err = run_command("definitely-not-a-real-tool-xyz", &["--version"], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_times_out() {
        let start = std::time::Instant::now();
        let err = run_command("sleep", &["30"], Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout(_)));
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
