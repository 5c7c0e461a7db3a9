//! Container Image Scanner Core
//!
//! Drives a scan end to end: acquire an image export, extract it into a
//! sanitized root, run every enabled analysis tool against that root
//! concurrently, and fold their results into one score and verdict.

pub mod acquire;
pub mod config;
pub mod model;
pub mod scanner;
pub mod scoring;

pub use acquire::{AcquiredImage, ArchiveSource, DockerSource, ImageExport, ImageSource};
pub use config::{OutputFormat, ScanOptions, ToolSettings};
pub use model::{Findings, Grade, ScanResult, ScanStatus, Score};
pub use scanner::{cancel_pair, CancelHandle, CancelSignal, Scanner};
pub use scoring::{assess, Assessment};

use img_extract::ExtractError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Image acquisition failed: {0}")]
    Acquisition(String),

    #[error("Extraction failed: {0}")]
    Extraction(#[from] ExtractError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Scan cancelled")]
    Cancelled,

    /// Every enabled tool ended without an `ok` status. The finalized
    /// result is kept so it can still be reported.
    #[error("All enabled analysis tools failed for {}", .0.image_ref)]
    AllToolsFailed(Box<ScanResult>),
}

pub type CoreResult<T> = Result<T, CoreError>;
