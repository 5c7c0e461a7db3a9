//! Risk aggregation
//!
//! Pure mapping from the collected tool results to score, grade, status and
//! the partial-coverage flag. Only tools that finished `ok` contribute
//! findings.

use crate::model::{Findings, ScanStatus, Score};
use img_tools::{ToolResult, ToolStatus};
use std::collections::BTreeMap;

pub const CRITICAL_VULN_POINTS: u32 = 10;
pub const HIGH_VULN_POINTS: u32 = 5;
pub const MEDIUM_VULN_POINTS: u32 = 2;
pub const LOW_VULN_POINTS: u32 = 1;
pub const SECRET_POINTS: u32 = 20;
pub const HIGH_RISK_CAPABILITY_POINTS: u32 = 15;
pub const MEDIUM_RISK_CAPABILITY_POINTS: u32 = 7;
pub const SUSPICIOUS_FILE_POINTS: u32 = 5;

/// Totals above this fail the scan
pub const FAIL_THRESHOLD: u32 = 100;
/// Totals above this warn
pub const WARN_THRESHOLD: u32 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assessment {
    pub findings: Findings,
    pub score: Score,
    pub status: ScanStatus,
    pub partial: bool,
}

pub fn assess<'a, I>(tools: I) -> Assessment
where
    I: IntoIterator<Item = &'a ToolResult>,
{
    let mut findings = Findings::default();
    let mut enabled = 0usize;
    let mut succeeded = 0usize;
    let mut partial = false;

    for tool in tools {
        match tool.status {
            ToolStatus::Skipped => continue,
            ToolStatus::Ok => {
                succeeded += 1;
                if let Some(tool_findings) = &tool.findings {
                    findings.record(tool_findings);
                }
            }
            ToolStatus::Failed | ToolStatus::Timeout => partial = true,
        }
        enabled += 1;
    }

    let score = score_findings(&findings);
    let status = if enabled > 0 && succeeded == 0 {
        ScanStatus::Error
    } else if score.total > FAIL_THRESHOLD {
        ScanStatus::Fail
    } else if score.total > WARN_THRESHOLD || partial {
        ScanStatus::Warn
    } else {
        ScanStatus::Pass
    };

    Assessment {
        findings,
        score,
        status,
        partial,
    }
}

pub fn score_findings(findings: &Findings) -> Score {
    let mut breakdown = BTreeMap::new();
    let mut add = |category: &str, count: u32, points: u32| {
        let value = count.saturating_mul(points);
        if value > 0 {
            let entry = breakdown.entry(category.to_string()).or_insert(0u32);
            *entry = entry.saturating_add(value);
        }
    };

    if let Some(v) = &findings.vulnerabilities {
        add("critical", v.critical, CRITICAL_VULN_POINTS);
        add("high", v.high, HIGH_VULN_POINTS);
        add("medium", v.medium, MEDIUM_VULN_POINTS);
        add("low", v.low, LOW_VULN_POINTS);
        add("secrets", v.secrets, SECRET_POINTS);
    }
    if let Some(c) = &findings.capabilities {
        add("high_risk_capabilities", c.high_risk, HIGH_RISK_CAPABILITY_POINTS);
        add("medium_risk_capabilities", c.medium_risk, MEDIUM_RISK_CAPABILITY_POINTS);
    }
    if let Some(t) = &findings.file_types {
        add("suspicious_files", t.suspicious_types, SUSPICIOUS_FILE_POINTS);
    }

    Score::from_breakdown(breakdown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Grade;
    use img_tools::{CapabilityFindings, FileTypeFindings, ToolFindings, VulnerabilityFindings};

    fn ok(name: &str, findings: Option<ToolFindings>) -> ToolResult {
        ToolResult {
            name: name.to_string(),
            version: "1.0".to_string(),
            status: ToolStatus::Ok,
            error: None,
            output_file: None,
            duration_ms: 10,
            findings,
        }
    }

    fn with_status(name: &str, status: ToolStatus) -> ToolResult {
        ToolResult {
            status,
            error: Some("boom".to_string()),
            ..ok(name, None)
        }
    }

    fn vulns(critical: u32, high: u32) -> Option<ToolFindings> {
        Some(ToolFindings::Vulnerabilities(VulnerabilityFindings {
            critical,
            high,
            ..Default::default()
        }))
    }

    #[test]
    fn test_critical_and_high_score_grade_b_pass() {
        let tools = vec![ok("trivy", vulns(1, 2)), ok("magika", None)];
        let assessment = assess(&tools);
        assert_eq!(assessment.score.total, 20);
        assert_eq!(assessment.score.grade, Grade::B);
        assert_eq!(assessment.status, ScanStatus::Pass);
        assert!(!assessment.partial);
        assert_eq!(assessment.score.breakdown["critical"], 10);
        assert_eq!(assessment.score.breakdown["high"], 10);
    }

    #[test]
    fn test_timeout_forces_warn_at_zero() {
        let tools = vec![ok("trivy", None), with_status("malcontent", ToolStatus::Timeout)];
        let assessment = assess(&tools);
        assert_eq!(assessment.score.total, 0);
        assert!(assessment.partial);
        assert_eq!(assessment.status, ScanStatus::Warn);
    }

    #[test]
    fn test_all_failed_is_error() {
        let tools = vec![
            with_status("trivy", ToolStatus::Failed),
            with_status("malcontent", ToolStatus::Failed),
            ToolResult::skipped("magika"),
        ];
        let assessment = assess(&tools);
        assert_eq!(assessment.status, ScanStatus::Error);
        assert!(assessment.partial);
    }

    #[test]
    fn test_failed_tool_findings_ignored() {
        let mut failed = with_status("trivy", ToolStatus::Failed);
        failed.findings = vulns(50, 0);
        let tools = vec![failed, ok("magika", None)];
        let assessment = assess(&tools);
        assert_eq!(assessment.score.total, 0);
        assert_eq!(assessment.status, ScanStatus::Warn);
    }

    #[test]
    fn test_nothing_enabled_passes() {
        let tools = vec![ToolResult::skipped("trivy")];
        let assessment = assess(&tools);
        assert_eq!(assessment.status, ScanStatus::Pass);
        assert!(!assessment.partial);
        assert_eq!(assess(std::iter::empty::<&ToolResult>()).status, ScanStatus::Pass);
    }

    #[test]
    fn test_thresholds() {
        // 31 points: warn
        let low = Some(ToolFindings::Vulnerabilities(VulnerabilityFindings {
            low: 1,
            ..Default::default()
        }));
        let tools = vec![ok("trivy", vulns(3, 0)), ok("grype", low)];
        let assessment = assess(&tools);
        assert_eq!(assessment.score.total, 31);
        assert_eq!(assessment.status, ScanStatus::Warn);

        // exactly 100: still warn, grade D
        let tools = vec![ok("trivy", vulns(10, 0))];
        let assessment = assess(&tools);
        assert_eq!(assessment.score.grade, Grade::D);
        assert_eq!(assessment.status, ScanStatus::Warn);

        let tools = vec![ok("trivy", vulns(10, 1))];
        let assessment = assess(&tools);
        assert_eq!(assessment.score.grade, Grade::F);
        assert_eq!(assessment.status, ScanStatus::Fail);
    }

    #[test]
    fn test_all_categories_scored() {
        let tools = vec![
            ok(
                "trivy",
                Some(ToolFindings::Vulnerabilities(VulnerabilityFindings {
                    medium: 1,
                    low: 1,
                    secrets: 1,
                    misconfigs: 9,
                    ..Default::default()
                })),
            ),
            ok(
                "malcontent",
                Some(ToolFindings::Capabilities(CapabilityFindings {
                    total: 10,
                    high_risk: 1,
                    medium_risk: 1,
                    low_risk: 8,
                    capabilities: vec!["net/reverse_shell".to_string()],
                })),
            ),
            ok(
                "magika",
                Some(ToolFindings::FileTypes(FileTypeFindings {
                    total_files: 100,
                    suspicious_types: 1,
                    mismatched_extension: 4,
                })),
            ),
        ];
        let assessment = assess(&tools);
        // 2 + 1 + 20 + 15 + 7 + 5
        assert_eq!(assessment.score.total, 50);
        assert_eq!(assessment.score.grade, Grade::C);
        assert_eq!(assessment.status, ScanStatus::Warn);
        assert!(!assessment.score.breakdown.contains_key("critical"));
    }

    #[test]
    fn test_score_saturates() {
        let tools = vec![ok("trivy", vulns(u32::MAX, u32::MAX))];
        let assessment = assess(&tools);
        assert_eq!(assessment.score.total, u32::MAX);
        assert_eq!(assessment.status, ScanStatus::Fail);
    }
}
