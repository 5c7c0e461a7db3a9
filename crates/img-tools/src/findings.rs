//! Structured counts reported by analysis tools

use serde::{Deserialize, Serialize};

/// Vulnerability, secret and misconfiguration counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VulnerabilityFindings {
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
    pub secrets: u32,
    pub misconfigs: u32,
}

impl VulnerabilityFindings {
    pub fn merge(&mut self, other: &VulnerabilityFindings) {
        self.critical = self.critical.saturating_add(other.critical);
        self.high = self.high.saturating_add(other.high);
        self.medium = self.medium.saturating_add(other.medium);
        self.low = self.low.saturating_add(other.low);
        self.secrets = self.secrets.saturating_add(other.secrets);
        self.misconfigs = self.misconfigs.saturating_add(other.misconfigs);
    }
}

/// Behavioral capabilities bucketed by risk tier
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityFindings {
    pub total: u32,
    pub high_risk: u32,
    pub medium_risk: u32,
    pub low_risk: u32,
    /// Distinct identifiers of high-risk behaviors
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
}

impl CapabilityFindings {
    pub fn merge(&mut self, other: &CapabilityFindings) {
        self.total = self.total.saturating_add(other.total);
        self.high_risk = self.high_risk.saturating_add(other.high_risk);
        self.medium_risk = self.medium_risk.saturating_add(other.medium_risk);
        self.low_risk = self.low_risk.saturating_add(other.low_risk);
        for capability in &other.capabilities {
            if !self.capabilities.contains(capability) {
                self.capabilities.push(capability.clone());
            }
        }
        self.capabilities.sort();
    }
}

/// Content-type detection counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTypeFindings {
    pub total_files: u32,
    /// Files whose content is executable or script while their name says otherwise
    pub suspicious_types: u32,
    pub mismatched_extension: u32,
}

impl FileTypeFindings {
    pub fn merge(&mut self, other: &FileTypeFindings) {
        self.total_files = self.total_files.saturating_add(other.total_files);
        self.suspicious_types = self.suspicious_types.saturating_add(other.suspicious_types);
        self.mismatched_extension = self
            .mismatched_extension
            .saturating_add(other.mismatched_extension);
    }
}

/// Parsed output of one tool, tagged by finding category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum ToolFindings {
    Vulnerabilities(VulnerabilityFindings),
    Capabilities(CapabilityFindings),
    FileTypes(FileTypeFindings),
}
