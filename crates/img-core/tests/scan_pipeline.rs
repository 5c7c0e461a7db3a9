//! End-to-end scans against an exported filesystem on disk, with shell
//! scripts standing in for the analysis tools.

#![cfg(unix)]

use async_trait::async_trait;
use img_core::{
    cancel_pair, ArchiveSource, CoreError, Grade, ScanOptions, ScanStatus, Scanner,
};
use img_tools::{
    magika, trivy, CommandOutput, CommandRunner, OutputCapture, ToolError, ToolSpec, ToolStatus,
};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

struct NoProbe;

#[async_trait]
impl CommandRunner for NoProbe {
    async fn run(
        &self,
        program: &str,
        _args: &[&str],
        _timeout: Duration,
    ) -> img_tools::Result<CommandOutput> {
        Err(ToolError::NotFound(program.to_string()))
    }
}

const TRIVY_REPORT: &str = r#"{"Results":[{"Target":"os","Vulnerabilities":[{"Severity":"CRITICAL"},{"Severity":"HIGH"},{"Severity":"HIGH"}]}]}"#;

fn sh(script: &str, output: &Path) -> Vec<OsString> {
    vec!["-c".into(), script.into(), "sh".into(), output.into()]
}

fn vuln_args(_rootfs: &Path, output: &Path) -> Vec<OsString> {
    sh(&format!("printf '%s' '{}' > \"$1\"", TRIVY_REPORT), output)
}

fn clean_args(_rootfs: &Path, output: &Path) -> Vec<OsString> {
    sh("printf '{}' > \"$1\"", output)
}

/// Succeeds only if run inside the extracted tree with links dropped
fn layout_args(_rootfs: &Path, output: &Path) -> Vec<OsString> {
    sh(
        "test -f etc/os-release && test ! -e etc/motd && test ! -L etc/motd && echo '[]'",
        output,
    )
}

fn fail_args(_rootfs: &Path, output: &Path) -> Vec<OsString> {
    sh("echo 'database unavailable' >&2; exit 1", output)
}

fn sleep_args(_rootfs: &Path, output: &Path) -> Vec<OsString> {
    sh("sleep 30 & echo $! > \"$1.pid\"; wait", output)
}

fn tool(
    name: &'static str,
    capture: OutputCapture,
    args: fn(&Path, &Path) -> Vec<OsString>,
    parse: fn(&[u8]) -> img_tools::Result<img_tools::ToolFindings>,
) -> ToolSpec {
    ToolSpec {
        name,
        executable: "sh",
        description: "stand-in",
        version_args: &["--version"],
        default_timeout: Duration::from_secs(20),
        capture,
        args,
        parse,
    }
}

fn vuln_tool() -> ToolSpec {
    tool("vulns", OutputCapture::OutputFlag, vuln_args, trivy::parse_output)
}

fn clean_tool() -> ToolSpec {
    tool("clean", OutputCapture::OutputFlag, clean_args, trivy::parse_output)
}

fn layout_tool() -> ToolSpec {
    tool("layout", OutputCapture::Stdout, layout_args, magika::parse_output)
}

fn failing_tool(name: &'static str) -> ToolSpec {
    tool(name, OutputCapture::OutputFlag, fail_args, trivy::parse_output)
}

fn sleeping_tool() -> ToolSpec {
    tool("hang", OutputCapture::OutputFlag, sleep_args, trivy::parse_output)
}

fn write_export(dir: &Path) -> PathBuf {
    let path = dir.join("export.tar");
    let file = std::fs::File::create(&path).unwrap();
    let mut builder = tar::Builder::new(file);

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Directory);
    header.set_mode(0o755);
    header.set_size(0);
    builder.append_data(&mut header, "etc/", std::io::empty()).unwrap();

    let body = b"ID=alpine\n";
    let mut header = tar::Header::new_gnu();
    header.set_mode(0o644);
    header.set_size(body.len() as u64);
    builder.append_data(&mut header, "etc/os-release", &body[..]).unwrap();

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Symlink);
    header.set_size(0);
    builder.append_link(&mut header, "etc/motd", "/etc/shadow").unwrap();

    builder.into_inner().unwrap();
    path
}

fn options(work: &Path) -> ScanOptions {
    let mut options = ScanOptions::new("local/alpine:test");
    options.platform = "linux/amd64".to_string();
    options.timeout = None;
    options.report_dir = None;
    options.work_dir = Some(work.join("scratch"));
    options
}

fn scanner(options: ScanOptions, export: &Path, tools: Vec<ToolSpec>) -> Scanner<ArchiveSource> {
    Scanner::with_source(options, ArchiveSource::new(export))
        .with_tools(tools)
        .with_runner(Arc::new(NoProbe))
}

fn scratch_is_empty(work: &Path) -> bool {
    std::fs::read_dir(work.join("scratch")).unwrap().next().is_none()
}

#[tokio::test]
async fn test_scan_extracts_runs_and_scores() {
    let work = tempfile::tempdir().unwrap();
    let export = write_export(work.path());
    let reports = work.path().join("reports");
    let options = options(work.path())
        .with_report_dir(&reports)
        .disable_tool("clean");

    let result = scanner(options, &export, vec![vuln_tool(), layout_tool(), clean_tool()])
        .run()
        .await
        .unwrap();

    assert!(result.image_digest.starts_with("sha256:"));
    assert_eq!(result.score.total, 20);
    assert_eq!(result.score.grade, Grade::B);
    assert_eq!(result.status, ScanStatus::Pass);
    assert!(!result.partial);
    assert!(result.finished_at.is_some());

    assert_eq!(result.tools.len(), 3);
    assert_eq!(result.tools["layout"].status, ToolStatus::Ok);
    assert_eq!(result.tools["clean"].status, ToolStatus::Skipped);
    assert_eq!(result.enabled_tools().count(), 2);

    let vulns = result.findings.vulnerabilities.as_ref().unwrap();
    assert_eq!(vulns.critical, 1);
    assert_eq!(vulns.high, 2);

    let extraction = result.extraction.as_ref().unwrap();
    assert_eq!(extraction.files_written, 1);
    assert_eq!(extraction.skipped.len(), 1);

    let saved = reports.join("vulns.json");
    assert_eq!(result.tools["vulns"].output_file.as_deref(), Some(saved.as_path()));
    assert!(saved.exists());
    assert!(scratch_is_empty(work.path()));
}

#[tokio::test]
async fn test_timeout_and_failure_mark_partial() {
    let work = tempfile::tempdir().unwrap();
    let export = write_export(work.path());
    let options = options(work.path()).with_tool_timeout("hang", Duration::from_millis(300));

    let result = scanner(
        options,
        &export,
        vec![clean_tool(), sleeping_tool(), failing_tool("broken")],
    )
    .run()
    .await
    .unwrap();

    assert_eq!(result.tools["hang"].status, ToolStatus::Timeout);
    assert_eq!(result.tools["broken"].status, ToolStatus::Failed);
    assert!(result.tools["broken"]
        .error
        .as_deref()
        .unwrap()
        .contains("database unavailable"));
    assert!(result.partial);
    assert_eq!(result.score.total, 0);
    assert_eq!(result.status, ScanStatus::Warn);
    assert_eq!(result.status.exit_code(), 1);
    assert!(result.tools["clean"].output_file.is_none());
    assert!(scratch_is_empty(work.path()));
}

#[tokio::test]
async fn test_all_tools_failed_is_pipeline_error() {
    let work = tempfile::tempdir().unwrap();
    let export = write_export(work.path());

    let err = scanner(
        options(work.path()),
        &export,
        vec![failing_tool("one"), failing_tool("two")],
    )
    .run()
    .await
    .unwrap_err();

    let result = match err {
        CoreError::AllToolsFailed(result) => result,
        other => panic!("expected AllToolsFailed, got {:?}", other),
    };
    assert_eq!(result.status, ScanStatus::Error);
    assert_eq!(result.status.exit_code(), 3);
    assert!(result.partial);
    assert_eq!(result.tools.len(), 2);
    assert!(scratch_is_empty(work.path()));
}

#[tokio::test]
async fn test_corrupt_export_aborts_and_cleans_up() {
    let work = tempfile::tempdir().unwrap();
    let export = work.path().join("export.tar");
    let mut junk = vec![0x41u8; 512];
    junk[148..156].copy_from_slice(b"garbage!");
    std::fs::write(&export, &junk).unwrap();

    let err = scanner(options(work.path()), &export, vec![clean_tool()])
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Extraction(_)));
    assert!(scratch_is_empty(work.path()));
}

#[tokio::test]
async fn test_missing_export_is_acquisition_error() {
    let work = tempfile::tempdir().unwrap();
    let err = scanner(
        options(work.path()),
        &work.path().join("missing.tar"),
        vec![clean_tool()],
    )
    .run()
    .await
    .unwrap_err();
    assert!(matches!(err, CoreError::Acquisition(_)));
    assert!(scratch_is_empty(work.path()));
}

#[cfg(target_os = "linux")]
fn find_pid_file(scratch: &Path) -> Option<PathBuf> {
    for workspace in std::fs::read_dir(scratch).ok()? {
        let candidate = workspace.ok()?.path().join("output").join("hang.json.pid");
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn process_gone(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/status", pid)) {
        Err(_) => true,
        Ok(status) => status
            .lines()
            .find(|line| line.starts_with("State:"))
            .map_or(true, |line| line.contains('Z')),
    }
}

#[cfg(target_os = "linux")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_kills_tools_and_removes_work_area() {
    let work = tempfile::tempdir().unwrap();
    let export = write_export(work.path());
    let scratch = work.path().join("scratch");
    let scan = scanner(options(work.path()), &export, vec![sleeping_tool()]);

    let (handle, signal) = cancel_pair();
    let running = tokio::spawn(async move { scan.run_until_cancelled(signal).await });

    let mut pid = None;
    for _ in 0..100 {
        if let Some(path) = find_pid_file(&scratch) {
            let text = std::fs::read_to_string(path).unwrap_or_default();
            if let Ok(found) = text.trim().parse::<u32>() {
                pid = Some(found);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let pid = pid.expect("tool never started");
    assert!(!process_gone(pid));

    handle.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, Err(CoreError::Cancelled)));

    let mut gone = false;
    for _ in 0..50 {
        if process_gone(pid) {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(gone, "tool process {} still running", pid);
    assert!(scratch_is_empty(work.path()));
}
