//! External provisioning tool invocation
//!
//! The [`Provisioner`] trait is the seam between a build and the tool that
//! actually brings up the cluster. [`KubeOne`] runs `kubeone apply` inside the
//! build's working directory and forwards its output to `tracing`.

use crate::build::artifacts::MANIFEST_FILE_NAME;
use crate::model::BuildId;
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long output is still forwarded once the tool has exited
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ProvisionerError {
    #[error("failed to start {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: io::Error,
    },

    #[error("failed waiting for {binary}: {source}")]
    Wait {
        binary: String,
        #[source]
        source: io::Error,
    },

    #[error("{binary} failed with {status}")]
    Exit { binary: String, status: ExitStatus },

    #[error("{binary} did not finish within {}s", .timeout.as_secs())]
    TimedOut { binary: String, timeout: Duration },

    #[error("{binary} was cancelled")]
    Cancelled { binary: String },
}

impl ProvisionerError {
    /// Exit code of the tool, if it ran to completion
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProvisionerError::Exit { status, .. } => status.code(),
            _ => None,
        }
    }
}

/// Tool that provisions a cluster from a prepared working directory
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Tool name for logging
    fn name(&self) -> &'static str;

    /// Provision the cluster described by the files in `working_dir`
    ///
    /// Blocks until the tool exits, the optional deadline passes, or `cancel`
    /// fires. A zero exit status is success.
    async fn apply(
        &self,
        working_dir: &Path,
        build_id: &BuildId,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionerError>;
}

/// `kubeone apply` runner
#[derive(Debug, Clone)]
pub struct KubeOne {
    binary: PathBuf,
    timeout: Option<Duration>,
}

impl KubeOne {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: None,
        }
    }

    /// Kill the tool if it runs longer than `timeout`
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn binary_name(&self) -> String {
        self.binary.display().to_string()
    }
}

impl Default for KubeOne {
    fn default() -> Self {
        Self::new("kubeone")
    }
}

enum Outcome {
    Exited(io::Result<ExitStatus>),
    Cancelled,
    TimedOut(Duration),
}

#[async_trait]
impl Provisioner for KubeOne {
    fn name(&self) -> &'static str {
        "kubeone"
    }

    async fn apply(
        &self,
        working_dir: &Path,
        build_id: &BuildId,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionerError> {
        let binary = self.binary_name();

        info!(
            cluster = %build_id,
            dir = %working_dir.display(),
            "Running kubeone apply"
        );

        let mut child = Command::new(&self.binary)
            .args(["apply", "-m", MANIFEST_FILE_NAME, "-y"])
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProvisionerError::Spawn {
                binary: binary.clone(),
                source,
            })?;

        let mut forwarders: Vec<_> = [
            child
                .stdout
                .take()
                .map(|out| tokio::spawn(forward_output(out, build_id.to_string(), "stdout"))),
            child
                .stderr
                .take()
                .map(|err| tokio::spawn(forward_output(err, build_id.to_string(), "stderr"))),
        ]
        .into_iter()
        .flatten()
        .collect();

        let started = Instant::now();
        let timeout = self.timeout;
        let deadline = async move {
            match timeout {
                Some(t) => {
                    tokio::time::sleep(t).await;
                    t
                }
                None => std::future::pending().await,
            }
        };

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = cancel.cancelled() => Outcome::Cancelled,
            t = deadline => Outcome::TimedOut(t),
        };

        let status = match outcome {
            Outcome::Exited(status) => status,
            Outcome::Cancelled => {
                stop(&mut child, &forwarders, build_id).await;
                return Err(ProvisionerError::Cancelled { binary });
            }
            Outcome::TimedOut(timeout) => {
                stop(&mut child, &forwarders, build_id).await;
                return Err(ProvisionerError::TimedOut { binary, timeout });
            }
        };

        // A process left behind by the tool may keep the pipes open
        let grace = match timeout {
            Some(t) => t.saturating_sub(started.elapsed()).min(OUTPUT_DRAIN_TIMEOUT),
            None => OUTPUT_DRAIN_TIMEOUT,
        };
        let drained = tokio::select! {
            _ = drain(&mut forwarders) => true,
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(grace) => false,
        };
        if !drained {
            warn!(
                cluster = %build_id,
                "Tool output still open after exit, no longer forwarding it"
            );
            for task in &forwarders {
                task.abort();
            }
        }

        let status = status.map_err(|source| ProvisionerError::Wait {
            binary: binary.clone(),
            source,
        })?;

        if !status.success() {
            return Err(ProvisionerError::Exit { binary, status });
        }

        debug!(cluster = %build_id, "kubeone apply finished");
        Ok(())
    }
}

async fn drain(forwarders: &mut [JoinHandle<()>]) {
    for task in forwarders {
        let _ = task.await;
    }
}

async fn stop(child: &mut Child, forwarders: &[JoinHandle<()>], build_id: &BuildId) {
    if let Err(e) = child.kill().await {
        warn!(cluster = %build_id, error = %e, "Failed to kill kubeone");
    }
    for task in forwarders {
        task.abort();
    }
}

/// Log every line the tool writes, tagged with the build
async fn forward_output<R>(reader: R, build_id: String, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(cluster = %build_id, stream, "{}", line),
            Ok(None) => break,
            Err(e) => {
                warn!(cluster = %build_id, stream, error = %e, "Failed to read tool output");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_id() -> BuildId {
        BuildId::new("c1", "h1")
    }

    /// Executable shell script standing in for kubeone
    #[cfg(unix)]
    fn fake_kubeone(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-kubeone");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let kubeone = KubeOne::new("/nonexistent/kubeone");

        let err = kubeone
            .apply(dir.path(), &build_id(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionerError::Spawn { .. }));
        assert_eq!(err.exit_code(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_zero_exit_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let kubeone = KubeOne::new(fake_kubeone(dir.path(), "echo applied"));

        kubeone
            .apply(dir.path(), &build_id(), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let kubeone = KubeOne::new(fake_kubeone(dir.path(), "exit 1"));

        let err = kubeone
            .apply(dir.path(), &build_id(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionerError::Exit { .. }));
        assert_eq!(err.exit_code(), Some(1));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancellation_stops_the_tool() {
        let dir = tempfile::tempdir().unwrap();
        let kubeone = KubeOne::new(fake_kubeone(dir.path(), "sleep 30"));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = kubeone
            .apply(dir.path(), &build_id(), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionerError::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_deadline_stops_the_tool() {
        let dir = tempfile::tempdir().unwrap();
        let kubeone = KubeOne::new(fake_kubeone(dir.path(), "sleep 30"))
            .with_timeout(Some(Duration::from_millis(100)));

        let err = kubeone
            .apply(dir.path(), &build_id(), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            ProvisionerError::TimedOut { timeout, .. } => {
                assert_eq!(timeout, Duration::from_millis(100))
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_leftover_process_does_not_outlive_the_deadline() {
        let dir = tempfile::tempdir().unwrap();
        // The background sleep inherits stdout and keeps it open
        let kubeone = KubeOne::new(fake_kubeone(dir.path(), "sleep 30 &\nexit 0"))
            .with_timeout(Some(Duration::from_millis(500)));

        let started = Instant::now();
        kubeone
            .apply(dir.path(), &build_id(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_leftover_process_does_not_outlive_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let kubeone = KubeOne::new(fake_kubeone(dir.path(), "sleep 30 &\nexit 0"));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        kubeone
            .apply(dir.path(), &build_id(), &cancel)
            .await
            .unwrap();

        assert!(started.elapsed() < OUTPUT_DRAIN_TIMEOUT);
    }
}
