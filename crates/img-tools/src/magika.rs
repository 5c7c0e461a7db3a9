//! Magika content-type detection

use crate::registry::{OutputCapture, ToolSpec, DEFAULT_TOOL_TIMEOUT};
use crate::{FileTypeFindings, Result, ToolFindings};
use serde::Deserialize;
use std::ffi::OsString;
use std::path::Path;

pub const SPEC: ToolSpec = ToolSpec {
    name: "magika",
    executable: "magika",
    description: "Content-type detection",
    version_args: &["--version"],
    default_timeout: DEFAULT_TOOL_TIMEOUT,
    capture: OutputCapture::Stdout,
    args: build_args,
    parse: parse_output,
};

/// Labels for content that runs when handed to an interpreter
const SCRIPT_LABELS: &[&str] = &["shell", "powershell", "batch", "vba", "javascript", "perl", "php"];

fn build_args(rootfs: &Path, _output: &Path) -> Vec<OsString> {
    vec![
        "--json".into(),
        "--recursive".into(),
        "--no-dereference".into(),
        rootfs.into(),
    ]
}

#[derive(Debug, Deserialize)]
struct MagikaEntry {
    #[serde(default)]
    path: String,
    #[serde(default)]
    result: Option<MagikaResult>,
}

#[derive(Debug, Deserialize)]
struct MagikaResult {
    #[serde(default)]
    status: String,
    #[serde(default)]
    value: Option<MagikaValue>,
}

#[derive(Debug, Deserialize)]
struct MagikaValue {
    output: MagikaOutput,
}

#[derive(Debug, Deserialize)]
struct MagikaOutput {
    #[serde(default)]
    label: String,
    #[serde(default)]
    group: String,
    #[serde(default)]
    extensions: Vec<String>,
}

impl MagikaOutput {
    /// The file has an extension and the detected type never uses it
    fn extension_mismatch(&self, path: &str) -> bool {
        if self.extensions.is_empty() {
            return false;
        }
        match Path::new(path).extension().and_then(|e| e.to_str()) {
            Some(ext) => !self
                .extensions
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext)),
            None => false,
        }
    }

    fn is_runnable(&self) -> bool {
        self.group == "executable" || SCRIPT_LABELS.contains(&self.label.as_str())
    }
}

/// Count detections in `magika --json` output
pub fn parse_output(data: &[u8]) -> Result<ToolFindings> {
    let entries: Vec<MagikaEntry> = serde_json::from_slice(data)?;
    let mut counts = FileTypeFindings::default();

    for entry in entries {
        let Some(result) = entry.result else { continue };
        if result.status != "ok" {
            continue;
        }
        let Some(value) = result.value else { continue };

        counts.total_files += 1;
        if value.output.extension_mismatch(&entry.path) {
            counts.mismatched_extension += 1;
            if value.output.is_runnable() {
                counts.suspicious_types += 1;
            }
        }
    }

    Ok(ToolFindings::FileTypes(counts))
}
