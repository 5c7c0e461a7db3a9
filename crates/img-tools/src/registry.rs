//! Table of analysis tools known to the scanner

use crate::{magika, malcontent, trivy, Result, ToolFindings};
use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;

/// Per-tool timeout when neither the tool nor the scan overrides it
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Where a tool's machine-readable report ends up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputCapture {
    /// The tool writes the report to the path passed in its arguments
    OutputFlag,
    /// The report is the tool's stdout, redirected into the output file
    Stdout,
}

/// Invocation and parsing strategy for one analysis tool
#[derive(Clone, Copy)]
pub struct ToolSpec {
    /// Key in the scan result map and base name of the output file
    pub name: &'static str,
    pub executable: &'static str,
    pub description: &'static str,
    pub version_args: &'static [&'static str],
    pub default_timeout: Duration,
    pub capture: OutputCapture,
    /// Builds the argument list from the rootfs and output file paths
    pub args: fn(&Path, &Path) -> Vec<OsString>,
    pub parse: fn(&[u8]) -> Result<ToolFindings>,
}

impl ToolSpec {
    pub fn output_file_name(&self) -> String {
        format!("{}.json", self.name)
    }
}

impl std::fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.name)
            .field("executable", &self.executable)
            .field("default_timeout", &self.default_timeout)
            .field("capture", &self.capture)
            .finish_non_exhaustive()
    }
}

/// Every tool a default scan runs, in launch order
pub static BUILTIN_TOOLS: [ToolSpec; 3] = [trivy::SPEC, malcontent::SPEC, magika::SPEC];

pub fn builtin_tools() -> &'static [ToolSpec] {
    &BUILTIN_TOOLS
}

pub fn find_tool(name: &str) -> Option<&'static ToolSpec> {
    BUILTIN_TOOLS.iter().find(|spec| spec.name == name)
}
