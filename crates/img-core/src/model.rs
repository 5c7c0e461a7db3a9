//! Scan result data model

use chrono::{DateTime, Utc};
use img_extract::ExtractionReport;
use img_tools::{
    CapabilityFindings, FileTypeFindings, ToolFindings, ToolResult, ToolStatus,
    VulnerabilityFindings,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Overall verdict of a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScanStatus {
    Pass,
    Warn,
    Fail,
    /// No enabled tool produced a trustworthy signal
    Error,
}

impl ScanStatus {
    /// Process exit code for this verdict
    pub fn exit_code(&self) -> i32 {
        match self {
            ScanStatus::Pass => 0,
            ScanStatus::Warn => 1,
            ScanStatus::Fail => 2,
            ScanStatus::Error => 3,
        }
    }
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanStatus::Pass => write!(f, "PASS"),
            ScanStatus::Warn => write!(f, "WARN"),
            ScanStatus::Fail => write!(f, "FAIL"),
            ScanStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// Letter summary of a score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    pub fn from_total(total: u32) -> Self {
        match total {
            0..=10 => Grade::A,
            11..=30 => Grade::B,
            31..=60 => Grade::C,
            61..=100 => Grade::D,
            _ => Grade::F,
        }
    }
}

impl std::fmt::Display for Grade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let letter = match self {
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        };
        write!(f, "{}", letter)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    pub total: u32,
    pub grade: Grade,
    /// Points contributed per finding category; zero categories are omitted
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub breakdown: BTreeMap<String, u32>,
}

impl Score {
    pub fn from_breakdown(breakdown: BTreeMap<String, u32>) -> Self {
        let total = breakdown.values().fold(0u32, |acc, v| acc.saturating_add(*v));
        Self {
            total,
            grade: Grade::from_total(total),
            breakdown,
        }
    }
}

impl Default for Score {
    fn default() -> Self {
        Self::from_breakdown(BTreeMap::new())
    }
}

/// Findings merged across every tool that finished `ok`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Findings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vulnerabilities: Option<VulnerabilityFindings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<CapabilityFindings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_types: Option<FileTypeFindings>,
}

impl Findings {
    pub fn record(&mut self, findings: &ToolFindings) {
        match findings {
            ToolFindings::Vulnerabilities(v) => {
                self.vulnerabilities.get_or_insert_with(Default::default).merge(v)
            }
            ToolFindings::Capabilities(c) => {
                self.capabilities.get_or_insert_with(Default::default).merge(c)
            }
            ToolFindings::FileTypes(t) => {
                self.file_types.get_or_insert_with(Default::default).merge(t)
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.vulnerabilities.is_none() && self.capabilities.is_none() && self.file_types.is_none()
    }
}

/// Complete scan result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub id: Uuid,
    pub image_ref: String,
    /// Content digest of the scanned image, `sha256:<hex>`
    pub image_digest: String,
    pub platform: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: ScanStatus,
    pub partial: bool,
    pub score: Score,
    pub tools: BTreeMap<String, ToolResult>,
    pub findings: Findings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction: Option<ExtractionReport>,
}

impl ScanResult {
    /// A result for a scan that has just started. Status stays `ERROR` until
    /// the aggregator has seen tool results.
    pub fn new(image_ref: &str, platform: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            image_ref: image_ref.to_string(),
            image_digest: String::new(),
            platform: platform.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            status: ScanStatus::Error,
            partial: false,
            score: Score::default(),
            tools: BTreeMap::new(),
            findings: Findings::default(),
            extraction: None,
        }
    }

    /// Tools that were enabled for this scan, whatever their outcome
    pub fn enabled_tools(&self) -> impl Iterator<Item = &ToolResult> {
        self.tools.values().filter(|t| t.status != ToolStatus::Skipped)
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grade_thresholds_inclusive() {
        assert_eq!(Grade::from_total(0), Grade::A);
        assert_eq!(Grade::from_total(10), Grade::A);
        assert_eq!(Grade::from_total(11), Grade::B);
        assert_eq!(Grade::from_total(30), Grade::B);
        assert_eq!(Grade::from_total(60), Grade::C);
        assert_eq!(Grade::from_total(100), Grade::D);
        assert_eq!(Grade::from_total(101), Grade::F);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ScanStatus::Pass.exit_code(), 0);
        assert_eq!(ScanStatus::Warn.exit_code(), 1);
        assert_eq!(ScanStatus::Fail.exit_code(), 2);
        assert_eq!(ScanStatus::Error.exit_code(), 3);
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(serde_json::to_string(&ScanStatus::Warn).unwrap(), "\"WARN\"");
        assert_eq!(ScanStatus::Fail.to_string(), "FAIL");
    }

    #[test]
    fn test_findings_record_merges_by_category() {
        let mut findings = Findings::default();
        assert!(findings.is_empty());
        findings.record(&ToolFindings::Vulnerabilities(VulnerabilityFindings {
            critical: 1,
            ..Default::default()
        }));
        findings.record(&ToolFindings::Vulnerabilities(VulnerabilityFindings {
            critical: 2,
            low: 4,
            ..Default::default()
        }));
        let vulns = findings.vulnerabilities.unwrap();
        assert_eq!(vulns.critical, 3);
        assert_eq!(vulns.low, 4);
        assert!(findings.capabilities.is_none());
    }

    #[test]
    fn test_result_round_trips_through_json() {
        let mut result = ScanResult::new("nginx:1.25", "linux/arm64");
        result.tools.insert("magika".to_string(), ToolResult::skipped("magika"));
        let json = serde_json::to_string(&result).unwrap();
        let back: ScanResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, result.id);
        assert_eq!(back.tools["magika"].status, ToolStatus::Skipped);
        assert_eq!(back.enabled_tools().count(), 0);
    }
}
