//! Scan orchestration

use crate::acquire::{AcquiredImage, DockerSource, ImageSource};
use crate::config::ScanOptions;
use crate::model::{ScanResult, ScanStatus};
use crate::scoring::assess;
use crate::{CoreError, CoreResult};
use chrono::Utc;
use img_extract::{make_readable_for_scan, ExtractionReport, Extractor};
use img_tools::{
    builtin_tools, check_executable, run_tool, CommandRunner, Invocation, SystemCommandRunner,
    ToolAvailability, ToolResult, ToolSpec, UNKNOWN_VERSION,
};
use std::collections::BTreeMap;
use std::io::{self, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Requests cancellation of a running scan
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Observed by a scan; resolves once its handle cancels
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes when cancellation is requested. Never completes if every
    /// handle is dropped first.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelSignal { rx })
}

/// Main scanner interface
pub struct Scanner<S = DockerSource> {
    options: ScanOptions,
    source: S,
    extractor: Extractor,
    tools: Vec<ToolSpec>,
    runner: Arc<dyn CommandRunner>,
}

impl Scanner<DockerSource> {
    /// Scanner that pulls images through docker
    pub fn new(options: ScanOptions) -> Self {
        Self::with_source(options, DockerSource::new())
    }
}

impl<S: ImageSource> Scanner<S> {
    pub fn with_source(options: ScanOptions, source: S) -> Self {
        Self {
            options,
            source,
            extractor: Extractor::new(),
            tools: builtin_tools().to_vec(),
            runner: Arc::new(SystemCommandRunner),
        }
    }

    /// Replace the analysis tool table
    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    /// Runner used for version probes
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_extractor(mut self, extractor: Extractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    pub fn tools(&self) -> &[ToolSpec] {
        &self.tools
    }

    /// Report which configured tools are installed, led by the image
    /// source's own executable when it needs one
    pub async fn check_tools(&self) -> Vec<ToolAvailability> {
        let runner = self.runner.as_ref();
        let mut report = Vec::with_capacity(self.tools.len() + 1);
        if let Some(executable) = self.source.executable() {
            report.push(check_executable(executable, executable, &["--version"], runner).await);
        }
        report.extend(img_tools::check_tools(&self.tools, runner).await);
        report
    }

    /// Run a scan to completion
    pub async fn run(&self) -> CoreResult<ScanResult> {
        let (handle, signal) = cancel_pair();
        let outcome = self.run_until_cancelled(signal).await;
        drop(handle);
        outcome
    }

    /// Run a scan, stopping early if `signal` fires. On cancellation every
    /// running tool process is killed and the working area is removed
    /// before [`CoreError::Cancelled`] is returned.
    ///
    /// A completed scan with status `ERROR` is returned as
    /// [`CoreError::AllToolsFailed`] carrying the result.
    pub async fn run_until_cancelled(&self, mut signal: CancelSignal) -> CoreResult<ScanResult> {
        self.options.validate()?;

        let mut result = ScanResult::new(&self.options.image_ref, &self.options.platform);
        let workspace = self.create_workspace()?;
        let rootfs = workspace.path().join("rootfs");
        let output_dir = workspace.path().join("output");
        std::fs::create_dir_all(&rootfs)?;
        std::fs::create_dir_all(&output_dir)?;

        info!(
            "Scanning {} ({}) in {}",
            self.options.image_ref,
            self.options.platform,
            workspace.path().display()
        );

        let image = tokio::select! {
            acquired = self.source.acquire(&self.options.image_ref, &self.options.platform) => acquired?,
            _ = signal.cancelled() => return Err(CoreError::Cancelled),
        };
        result.image_digest = image.digest.clone();

        let report = self.extract(image, &rootfs, &mut signal).await?;
        info!(
            "Extracted {} files, {} directories ({} bytes), skipped {} entries",
            report.files_written,
            report.directories_created,
            report.bytes_written,
            report.skipped_count()
        );
        result.extraction = Some(report);

        if signal.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        result.tools = self.run_tools(&rootfs, &output_dir, &mut signal).await?;

        let assessment = assess(result.tools.values());
        result.findings = assessment.findings;
        result.score = assessment.score;
        result.status = assessment.status;
        result.partial = assessment.partial;
        result.finished_at = Some(Utc::now());

        persist_outputs(&mut result, self.options.report_dir.as_deref()).await;

        if let Err(e) = workspace.close() {
            warn!("Failed to remove working area: {}", e);
        }

        info!(
            "Scan of {} finished: {} (score {}, grade {}{})",
            result.image_ref,
            result.status,
            result.score.total,
            result.score.grade,
            if result.partial { ", partial" } else { "" }
        );

        if result.status == ScanStatus::Error {
            return Err(CoreError::AllToolsFailed(Box::new(result)));
        }
        Ok(result)
    }

    fn create_workspace(&self) -> CoreResult<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("imgscan-");
        let workspace = match &self.options.work_dir {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        Ok(workspace)
    }

    async fn extract(
        &self,
        image: AcquiredImage,
        rootfs: &Path,
        signal: &mut CancelSignal,
    ) -> CoreResult<ExtractionReport> {
        let AcquiredImage { mut export, .. } = image;
        let extractor = self.extractor.clone();
        let destination = rootfs.to_path_buf();
        let abort = Arc::new(AtomicBool::new(false));
        let abort_flag = Arc::clone(&abort);

        let mut task = tokio::task::spawn_blocking(move || -> CoreResult<ExtractionReport> {
            let reader = AbortableReader {
                inner: export.reader(),
                abort: &abort_flag,
            };
            let report = match extractor.extract(reader, &destination) {
                Ok(report) => report,
                Err(e) => {
                    // dropping the export stops its producer
                    drop(export);
                    return Err(e.into());
                }
            };
            export.finish()?;
            let adjusted = make_readable_for_scan(&destination);
            debug!("Widened permissions on {} entries", adjusted);
            Ok(report)
        });

        let joined = tokio::select! {
            joined = &mut task => joined,
            _ = signal.cancelled() => {
                abort.store(true, Ordering::Relaxed);
                let _ = task.await;
                return Err(CoreError::Cancelled);
            }
        };

        joined.map_err(|e| {
            CoreError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("extraction task failed: {}", e),
            ))
        })?
    }

    async fn run_tools(
        &self,
        rootfs: &Path,
        output_dir: &Path,
        signal: &mut CancelSignal,
    ) -> CoreResult<BTreeMap<String, ToolResult>> {
        let mut results = BTreeMap::new();
        let mut tasks = JoinSet::new();

        for spec in &self.tools {
            if !self.options.is_enabled(spec.name) {
                info!("Skipping {} (disabled)", spec.name);
                results.insert(spec.name.to_string(), ToolResult::skipped(spec.name));
                continue;
            }

            let spec = *spec;
            let invocation = Invocation {
                rootfs: rootfs.to_path_buf(),
                output_dir: output_dir.to_path_buf(),
                timeout: self.options.timeout_for(&spec),
            };
            let runner = Arc::clone(&self.runner);
            tasks.spawn(async move { run_tool(&spec, &invocation, runner.as_ref()).await });
        }

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok(result)) => {
                        results.insert(result.name.clone(), result);
                    }
                    Some(Err(e)) => warn!("Tool task ended abnormally: {}", e),
                    None => break,
                },
                _ = signal.cancelled() => {
                    warn!("Scan cancelled, stopping {} running tools", tasks.len());
                    tasks.shutdown().await;
                    return Err(CoreError::Cancelled);
                }
            }
        }

        for spec in &self.tools {
            results.entry(spec.name.to_string()).or_insert_with(|| {
                ToolResult::failed(
                    spec.name,
                    UNKNOWN_VERSION.to_string(),
                    "tool task did not complete",
                )
            });
        }

        Ok(results)
    }
}

/// Copy raw outputs out of the working area before it is removed. Without a
/// report directory the references are dropped, since their files go with
/// the working area.
async fn persist_outputs(result: &mut ScanResult, report_dir: Option<&Path>) {
    let Some(report_dir) = report_dir else {
        for tool in result.tools.values_mut() {
            tool.output_file = None;
        }
        return;
    };

    if let Err(e) = tokio::fs::create_dir_all(report_dir).await {
        warn!("Cannot create report directory {}: {}", report_dir.display(), e);
    }

    for tool in result.tools.values_mut() {
        let Some(source) = tool.output_file.take() else {
            continue;
        };
        let target = report_dir.join(format!("{}.json", tool.name));
        match tokio::fs::copy(&source, &target).await {
            Ok(_) => tool.output_file = Some(target),
            Err(e) => warn!("Failed to save {} output to {}: {}", tool.name, target.display(), e),
        }
    }
}

/// Fails reads once the flag is raised, so a cancelled extraction stops at
/// the next entry boundary or buffer refill
struct AbortableReader<'a> {
    inner: &'a mut dyn Read,
    abort: &'a AtomicBool,
}

impl Read for AbortableReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.abort.load(Ordering::Relaxed) {
            return Err(io::Error::new(io::ErrorKind::Other, "scan cancelled"));
        }
        self.inner.read(buf)
    }
}
