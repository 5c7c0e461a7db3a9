//! Image acquisition
//!
//! An [`ImageSource`] resolves an image reference to a content digest and a
//! forward-only tar stream of the image's flattened filesystem.

use crate::{CoreError, CoreResult};
use async_trait::async_trait;
use img_tools::run_command;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound for each docker command other than the export stream
pub const DEFAULT_DOCKER_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// A filesystem export being streamed
pub trait ImageExport: Send {
    fn reader(&mut self) -> &mut dyn Read;

    /// Called once the stream has been consumed; reports whether the
    /// producer finished cleanly.
    fn finish(self: Box<Self>) -> CoreResult<()>;
}

pub struct AcquiredImage {
    /// `sha256:<hex>`
    pub digest: String,
    pub export: Box<dyn ImageExport>,
}

impl std::fmt::Debug for AcquiredImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquiredImage")
            .field("digest", &self.digest)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn acquire(&self, image_ref: &str, platform: &str) -> CoreResult<AcquiredImage>;

    /// External program this source shells out to, if any
    fn executable(&self) -> Option<&str> {
        None
    }
}

/// Pulls through the docker CLI and exports a created, never-started
/// container.
#[derive(Debug, Clone)]
pub struct DockerSource {
    docker: String,
    timeout: Duration,
}

impl DockerSource {
    pub fn new() -> Self {
        Self {
            docker: "docker".to_string(),
            timeout: DEFAULT_DOCKER_TIMEOUT,
        }
    }

    /// Use another docker-compatible CLI, e.g. `podman`
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.docker = binary.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn docker(&self, args: &[&str]) -> CoreResult<String> {
        let step = args.first().copied().unwrap_or_default();
        let output = run_command(&self.docker, args, self.timeout)
            .await
            .map_err(|e| CoreError::Acquisition(format!("{} {}: {}", self.docker, step, e)))?;

        if output.code != 0 {
            return Err(CoreError::Acquisition(format!(
                "{} {} failed with exit code {}: {}",
                self.docker,
                step,
                output.code,
                output.stderr.trim()
            )));
        }
        Ok(output.stdout.trim().to_string())
    }
}

impl Default for DockerSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageSource for DockerSource {
    async fn acquire(&self, image_ref: &str, platform: &str) -> CoreResult<AcquiredImage> {
        info!("Pulling {} for {}", image_ref, platform);
        self.docker(&["pull", "--platform", platform, image_ref]).await?;

        let digest = self
            .docker(&["inspect", "--format", "{{.Id}}", image_ref])
            .await?;
        debug!("Resolved {} to {}", image_ref, digest);

        let container_id = self
            .docker(&["create", "--platform", platform, image_ref])
            .await?;
        if container_id.is_empty() {
            return Err(CoreError::Acquisition(format!(
                "{} create returned no container id",
                self.docker
            )));
        }

        let child = Command::new(&self.docker)
            .args(["export", container_id.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                remove_container(&self.docker, &container_id);
                return Err(CoreError::Acquisition(format!(
                    "{} export failed to start: {}",
                    self.docker, e
                )));
            }
        };

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            remove_container(&self.docker, &container_id);
            return Err(CoreError::Acquisition("export stream unavailable".to_string()));
        };

        Ok(AcquiredImage {
            digest,
            export: Box::new(DockerExport {
                docker: self.docker.clone(),
                container_id,
                child,
                stdout,
            }),
        })
    }

    fn executable(&self) -> Option<&str> {
        Some(self.docker.as_str())
    }
}

/// Removes its container on drop, on every path
struct DockerExport {
    docker: String,
    container_id: String,
    child: Child,
    stdout: ChildStdout,
}

impl ImageExport for DockerExport {
    fn reader(&mut self) -> &mut dyn Read {
        &mut self.stdout
    }

    fn finish(mut self: Box<Self>) -> CoreResult<()> {
        // the archive reader stops at the end marker; the rest is padding
        io::copy(&mut self.stdout, &mut io::sink())?;
        let status = self.child.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(CoreError::Acquisition(format!(
                "{} export exited with {}",
                self.docker, status
            )))
        }
    }
}

impl Drop for DockerExport {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
        remove_container(&self.docker, &self.container_id);
    }
}

fn remove_container(docker: &str, container_id: &str) {
    let removed = Command::new(docker)
        .args(["rm", "-f", container_id])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match removed {
        Ok(status) if status.success() => debug!("Removed container {}", container_id),
        Ok(status) => warn!("Removing container {} exited with {}", container_id, status),
        Err(e) => warn!("Failed to remove container {}: {}", container_id, e),
    }
}

/// A filesystem export already on disk, as written by `docker export -o`
#[derive(Debug, Clone)]
pub struct ArchiveSource {
    path: PathBuf,
}

impl ArchiveSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ImageSource for ArchiveSource {
    async fn acquire(&self, image_ref: &str, _platform: &str) -> CoreResult<AcquiredImage> {
        info!("Reading {} from {}", image_ref, self.path.display());
        let path = self.path.clone();
        let digest = tokio::task::spawn_blocking(move || file_digest(&path))
            .await
            .map_err(|e| CoreError::Acquisition(format!("digest task failed: {}", e)))?
            .map_err(|e| {
                CoreError::Acquisition(format!("cannot read {}: {}", self.path.display(), e))
            })?;

        let file = File::open(&self.path).map_err(|e| {
            CoreError::Acquisition(format!("cannot open {}: {}", self.path.display(), e))
        })?;

        Ok(AcquiredImage {
            digest,
            export: Box::new(FileExport {
                reader: BufReader::new(file),
            }),
        })
    }
}

struct FileExport {
    reader: BufReader<File>,
}

impl ImageExport for FileExport {
    fn reader(&mut self) -> &mut dyn Read {
        &mut self.reader
    }

    fn finish(self: Box<Self>) -> CoreResult<()> {
        Ok(())
    }
}

/// `sha256:<hex>` of a file's contents
pub fn file_digest(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}
