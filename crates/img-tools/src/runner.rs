//! Execute one analysis tool against an extracted filesystem

use crate::registry::{OutputCapture, ToolSpec};
use crate::version::{probe_version, CommandRunner};
use crate::{ToolResult, ToolStatus};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Diagnostics keep only the tail of a tool's combined output
const MAX_DIAGNOSTIC_BYTES: usize = 64 * 1024;

/// How long output is still collected once the tool itself has exited
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Where and how long a tool runs
#[derive(Debug, Clone)]
pub struct Invocation {
    pub rootfs: PathBuf,
    pub output_dir: PathBuf,
    pub timeout: Duration,
}

enum Execution {
    Completed { output: Vec<u8> },
    Failed(String),
    TimedOut,
}

/// Run `spec` to completion or timeout. Never fails: spawn errors, non-zero
/// exits and timeouts all become a [`ToolResult`] with the matching status.
///
/// The tool and every process it started are killed on timeout, once it
/// exits, and if this future is dropped.
pub async fn run_tool(
    spec: &ToolSpec,
    invocation: &Invocation,
    probe: &dyn CommandRunner,
) -> ToolResult {
    info!("Running {} ({})", spec.name, spec.description);
    let version = probe_version(probe, spec.executable, spec.version_args).await;

    let output_file = invocation.output_dir.join(spec.output_file_name());
    let start = Instant::now();
    let execution = execute(spec, invocation, &output_file).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    let mut result = ToolResult {
        name: spec.name.to_string(),
        version,
        status: ToolStatus::Ok,
        error: None,
        output_file: None,
        duration_ms,
        findings: None,
    };

    match execution {
        Execution::Completed { output } => {
            if !output.is_empty() {
                debug!("{} output:\n{}", spec.name, String::from_utf8_lossy(&output));
            }
            match tokio::fs::read(&output_file).await {
                Ok(data) => match (spec.parse)(&data) {
                    Ok(findings) => result.findings = Some(findings),
                    Err(e) => {
                        warn!("Could not parse {} output: {}", spec.name, e);
                        result.error = Some(format!("output not parsed: {}", e));
                    }
                },
                Err(e) => {
                    warn!("Could not read {} output: {}", spec.name, e);
                    result.error = Some(format!("output not readable: {}", e));
                }
            }
            result.output_file = Some(output_file);
            info!("{} finished in {} ms", spec.name, duration_ms);
        }
        Execution::Failed(message) => {
            warn!("{} failed: {}", spec.name, first_line(&message));
            result.status = ToolStatus::Failed;
            result.error = Some(message);
        }
        Execution::TimedOut => {
            warn!("{} timed out after {:?}", spec.name, invocation.timeout);
            result.status = ToolStatus::Timeout;
            result.error = Some(format!("timed out after {:?}", invocation.timeout));
        }
    }

    result
}

async fn execute(spec: &ToolSpec, invocation: &Invocation, output_file: &Path) -> Execution {
    let mut command = std::process::Command::new(spec.executable);
    command
        .args((spec.args)(&invocation.rootfs, output_file))
        .current_dir(&invocation.rootfs)
        .stdin(Stdio::null())
        .stderr(Stdio::piped());

    // descendants share the group, so the whole tree can be signalled
    #[cfg(unix)]
    std::os::unix::process::CommandExt::process_group(&mut command, 0);

    match spec.capture {
        OutputCapture::OutputFlag => {
            command.stdout(Stdio::piped());
        }
        OutputCapture::Stdout => match std::fs::File::create(output_file) {
            Ok(file) => {
                command.stdout(Stdio::from(file));
            }
            Err(e) => {
                return Execution::Failed(format!(
                    "failed to create {}: {}",
                    output_file.display(),
                    e
                ))
            }
        },
    }

    let mut command = Command::from(command);
    command.kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => return Execution::Failed(format!("failed to start {}: {}", spec.executable, e)),
    };
    let group = ProcessGroup::of(&child);

    let mut stdout = tokio::spawn(drain(child.stdout.take()));
    let mut stderr = tokio::spawn(drain(child.stderr.take()));

    let status = match timeout(invocation.timeout, child.wait()).await {
        Err(_) => {
            group.kill();
            if let Err(e) = child.kill().await {
                warn!("Failed to kill {}: {}", spec.executable, e);
            }
            stdout.abort();
            stderr.abort();
            return Execution::TimedOut;
        }
        Ok(Err(e)) => {
            return Execution::Failed(format!("failed waiting for {}: {}", spec.executable, e))
        }
        Ok(Ok(status)) => status,
    };

    // leftover descendants may still hold the pipes open
    group.kill();
    let mut output = collect(spec.name, &mut stdout).await;
    output.extend_from_slice(&collect(spec.name, &mut stderr).await);

    if status.success() {
        Execution::Completed { output }
    } else {
        Execution::Failed(format!(
            "{} exited with {}: {}",
            spec.executable,
            status,
            tail(&output).trim()
        ))
    }
}

/// Every process in a tool's group is killed when this is dropped, which
/// covers timeouts, normal exits and an aborted scan alike
struct ProcessGroup {
    #[cfg_attr(not(unix), allow(dead_code))]
    leader: Option<u32>,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self { leader: child.id() }
    }

    #[cfg(unix)]
    fn kill(&self) {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(leader) = self.leader else {
            return;
        };
        match killpg(Pid::from_raw(leader as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!("Failed to kill process group {}: {}", leader, e),
        }
    }

    #[cfg(not(unix))]
    fn kill(&self) {}
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn collect(name: &str, task: &mut JoinHandle<Vec<u8>>) -> Vec<u8> {
    match timeout(DRAIN_GRACE, &mut *task).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            debug!("{} output reader failed: {}", name, e);
            Vec::new()
        }
        Err(_) => {
            debug!("{} output still open after exit, dropping it", name);
            task.abort();
            Vec::new()
        }
    }
}

async fn drain<R: AsyncRead + Unpin>(stream: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        if let Err(e) = stream.read_to_end(&mut buf).await {
            debug!("Output stream closed early: {}", e);
        }
    }
    buf
}

fn tail(output: &[u8]) -> String {
    let start = output.len().saturating_sub(MAX_DIAGNOSTIC_BYTES);
    String::from_utf8_lossy(&output[start..]).to_string()
}

fn first_line(message: &str) -> &str {
    message.lines().next().unwrap_or_default()
}
