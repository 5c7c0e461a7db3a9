//! Trivy vulnerability, secret and misconfiguration scanner

use crate::registry::{OutputCapture, ToolSpec, DEFAULT_TOOL_TIMEOUT};
use crate::{Result, ToolFindings, VulnerabilityFindings};
use serde::Deserialize;
use std::ffi::OsString;
use std::path::Path;

pub const SPEC: ToolSpec = ToolSpec {
    name: "trivy",
    executable: "trivy",
    description: "Vulnerability, secret and misconfiguration scanner",
    version_args: &["--version"],
    default_timeout: DEFAULT_TOOL_TIMEOUT,
    capture: OutputCapture::OutputFlag,
    args: build_args,
    parse: parse_output,
};

fn build_args(rootfs: &Path, output: &Path) -> Vec<OsString> {
    vec![
        "fs".into(),
        "--format".into(),
        "json".into(),
        "--output".into(),
        output.into(),
        "--scanners".into(),
        "vuln,secret,misconfig".into(),
        rootfs.into(),
    ]
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TrivyReport {
    #[serde(default)]
    results: Option<Vec<TrivyTarget>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TrivyTarget {
    #[serde(default)]
    vulnerabilities: Option<Vec<TrivyVulnerability>>,
    #[serde(default)]
    secrets: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    misconfigurations: Option<Vec<TrivyMisconfiguration>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TrivyVulnerability {
    #[serde(default)]
    severity: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TrivyMisconfiguration {
    #[serde(default)]
    status: String,
}

/// Count findings in a `trivy fs --format json` report
pub fn parse_output(data: &[u8]) -> Result<ToolFindings> {
    let report: TrivyReport = serde_json::from_slice(data)?;
    let mut counts = VulnerabilityFindings::default();

    for target in report.results.unwrap_or_default() {
        for vuln in target.vulnerabilities.unwrap_or_default() {
            match vuln.severity.to_ascii_uppercase().as_str() {
                "CRITICAL" => counts.critical += 1,
                "HIGH" => counts.high += 1,
                "MEDIUM" => counts.medium += 1,
                "LOW" => counts.low += 1,
                _ => {}
            }
        }

        counts.secrets += target.secrets.map_or(0, |s| s.len() as u32);

        counts.misconfigs += target
            .misconfigurations
            .unwrap_or_default()
            .iter()
            .filter(|m| !m.status.eq_ignore_ascii_case("PASS"))
            .count() as u32;
    }

    Ok(ToolFindings::Vulnerabilities(counts))
}
