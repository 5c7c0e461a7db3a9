//! Scan configuration

use crate::{CoreError, CoreResult};
use img_tools::ToolSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PLATFORM: &str = "linux/amd64";

/// Report format requested by the caller. Rendering happens outside the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Sarif,
    Html,
}

impl FromStr for OutputFormat {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "table" => Ok(OutputFormat::Table),
            "json" => Ok(OutputFormat::Json),
            "sarif" => Ok(OutputFormat::Sarif),
            "html" => Ok(OutputFormat::Html),
            other => Err(CoreError::Config(format!("unknown output format: {}", other))),
        }
    }
}

/// Per-tool overrides
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSettings {
    pub enabled: bool,
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: None,
        }
    }
}

/// Inputs for one scan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanOptions {
    pub image_ref: String,
    pub platform: String,
    pub output_format: OutputFormat,
    /// Raw tool outputs are copied here when set
    pub report_dir: Option<PathBuf>,
    /// Scan-wide per-tool timeout; individual tool settings take precedence
    pub timeout: Option<Duration>,
    /// Keyed by tool name. Tools without an entry run with defaults.
    pub tools: BTreeMap<String, ToolSettings>,
    /// Parent of the temporary working area
    pub work_dir: Option<PathBuf>,
    pub quiet: bool,
    pub verbose: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            image_ref: String::new(),
            platform: std::env::var("IMGSCAN_PLATFORM").unwrap_or_else(|_| DEFAULT_PLATFORM.into()),
            output_format: OutputFormat::default(),
            report_dir: std::env::var("IMGSCAN_REPORT_DIR").ok().map(PathBuf::from),
            timeout: std::env::var("IMGSCAN_TIMEOUT_MINS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|mins| *mins > 0)
                .map(|mins| Duration::from_secs(mins * 60)),
            tools: BTreeMap::new(),
            work_dir: std::env::var("IMGSCAN_WORK_DIR").ok().map(PathBuf::from),
            quiet: false,
            verbose: false,
        }
    }
}

impl ScanOptions {
    pub fn new(image_ref: impl Into<String>) -> Self {
        Self {
            image_ref: image_ref.into(),
            ..Self::default()
        }
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    pub fn with_report_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.report_dir = Some(dir.into());
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn disable_tool(mut self, name: &str) -> Self {
        self.tools.entry(name.to_string()).or_default().enabled = false;
        self
    }

    pub fn with_tool_timeout(mut self, name: &str, timeout: Duration) -> Self {
        self.tools.entry(name.to_string()).or_default().timeout = Some(timeout);
        self
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.tools.get(name).map_or(true, |t| t.enabled)
    }

    /// Tool override, then scan-wide override, then the tool's own default
    pub fn timeout_for(&self, spec: &ToolSpec) -> Duration {
        self.tools
            .get(spec.name)
            .and_then(|t| t.timeout)
            .or(self.timeout)
            .unwrap_or(spec.default_timeout)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.image_ref.trim().is_empty() {
            return Err(CoreError::Config("image reference is empty".to_string()));
        }
        if self.platform.trim().is_empty() {
            return Err(CoreError::Config("platform is empty".to_string()));
        }
        if self.timeout == Some(Duration::ZERO)
            || self.tools.values().any(|t| t.timeout == Some(Duration::ZERO))
        {
            return Err(CoreError::Config("tool timeout must be positive".to_string()));
        }
        Ok(())
    }
}
