//! Malcontent behavioral capability analysis

use crate::registry::{OutputCapture, ToolSpec, DEFAULT_TOOL_TIMEOUT};
use crate::{CapabilityFindings, Result, ToolFindings};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::path::Path;

pub const SPEC: ToolSpec = ToolSpec {
    name: "malcontent",
    executable: "mal",
    description: "Behavioral capability analysis",
    version_args: &["--version"],
    default_timeout: DEFAULT_TOOL_TIMEOUT,
    capture: OutputCapture::OutputFlag,
    args: build_args,
    parse: parse_output,
};

fn build_args(rootfs: &Path, output: &Path) -> Vec<OsString> {
    vec![
        "analyze".into(),
        "--format".into(),
        "json".into(),
        "--output".into(),
        output.into(),
        rootfs.into(),
    ]
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MalcontentReport {
    #[serde(default)]
    files: Option<BTreeMap<String, MalcontentFile>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MalcontentFile {
    #[serde(default)]
    behaviors: Option<Vec<Behavior>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Behavior {
    #[serde(default, rename = "ID")]
    id: String,
    #[serde(default)]
    risk_level: String,
    #[serde(default)]
    risk_score: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Risk {
    High,
    Medium,
    Low,
    None,
}

impl Behavior {
    fn risk(&self) -> Risk {
        match self.risk_level.to_ascii_uppercase().as_str() {
            "CRITICAL" | "HIGH" => Risk::High,
            "MEDIUM" => Risk::Medium,
            "LOW" => Risk::Low,
            "" => match self.risk_score {
                3.. => Risk::High,
                2 => Risk::Medium,
                1 => Risk::Low,
                _ => Risk::None,
            },
            _ => Risk::None,
        }
    }
}

/// Count behaviors in a `mal analyze --format json` report
pub fn parse_output(data: &[u8]) -> Result<ToolFindings> {
    let report: MalcontentReport = serde_json::from_slice(data)?;
    let mut counts = CapabilityFindings::default();
    let mut high_risk_ids = BTreeSet::new();

    for file in report.files.unwrap_or_default().into_values() {
        for behavior in file.behaviors.unwrap_or_default() {
            counts.total += 1;
            match behavior.risk() {
                Risk::High => {
                    counts.high_risk += 1;
                    if !behavior.id.is_empty() {
                        high_risk_ids.insert(behavior.id);
                    }
                }
                Risk::Medium => counts.medium_risk += 1,
                Risk::Low => counts.low_risk += 1,
                Risk::None => {}
            }
        }
    }

    counts.capabilities = high_risk_ids.into_iter().collect();
    Ok(ToolFindings::Capabilities(counts))
}
