//! Container backend abstraction.
//!
//! The conveyor materializes stages through a [`ContainerBackend`]: a stable
//! capability contract any engine implementation must satisfy. Two engines
//! ship in-tree: the daemon-API docker backend (commit-based construction)
//! and the daemonless buildah backend. No other coupling to a specific
//! engine's wire format exists outside this module.

pub mod buildah;
pub mod docker;
pub mod session;

pub use buildah::BuildahBackend;
pub use docker::DockerDaemonBackend;
pub use session::{BackendSession, ContainerCleaner};

use crate::error::{Result, StagecraftError};
use crate::instruction::Instruction;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Inspected image metadata.
#[derive(Debug, Clone, Default)]
pub struct ImageInfo {
    pub id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub size_bytes: u64,
    pub labels: HashMap<String, String>,
    pub parent_id: Option<String>,
}

/// Options shared by tag/push/pull/rmi operations.
#[derive(Debug, Clone, Default)]
pub struct RemoteOpts {
    pub target_platform: Option<String>,
    pub force: bool,
}

/// Options for building one stage.
#[derive(Debug, Clone, Default)]
pub struct BuildStageOptions {
    pub target_platform: Option<String>,
    /// Build-context root for instructions that read context files.
    pub context_dir: Option<PathBuf>,
    /// Image references for cross-stage reads, keyed by the reference string
    /// used in the instruction (`COPY --from=<key>`, mount `from=<key>`).
    pub dependency_images: HashMap<String, String>,
    /// Extra labels applied at commit.
    pub labels: Vec<(String, String)>,
    /// Drop into a shell in the base image before surfacing a failure.
    pub introspect_before_error: bool,
    /// Drop into a shell in the failed container state before surfacing.
    pub introspect_after_error: bool,
}

/// Capability contract over a container build engine.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Engine name for log lines and error messages.
    fn name(&self) -> &str;

    /// Whether the engine can execute stage builds with cross-stage mounts
    /// natively. The conveyor checks this before choosing a code path and
    /// fails fast on unsupported instruction classes.
    fn has_native_stage_support(&self) -> bool;

    /// Materializes one stage from a base image, returning the built image
    /// id. The image is not yet tagged.
    async fn build_stage(
        &self,
        base: &str,
        instructions: &[Instruction],
        opts: &BuildStageOptions,
    ) -> Result<String>;

    async fn tag(&self, reference: &str, new_reference: &str, opts: &RemoteOpts) -> Result<()>;
    async fn push(&self, reference: &str, opts: &RemoteOpts) -> Result<()>;
    async fn pull(&self, reference: &str, opts: &RemoteOpts) -> Result<()>;
    async fn rmi(&self, reference: &str, opts: &RemoteOpts) -> Result<()>;

    /// Inspects an image. Returns `Ok(None)` when the image does not exist;
    /// `Err` is reserved for real failures (daemon unreachable, malformed
    /// output). Callers distinguish not-found from error this way.
    async fn inspect(&self, reference: &str) -> Result<Option<ImageInfo>>;
}

/// Per-stage build lifecycle, tracked for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StageBuildState {
    Created,
    Running,
    Committed,
    Failed,
}

/// Bounded retry loop for transient engine I/O (push/pull). The conveyor
/// itself never retries; retries live with the component that owns the
/// resource.
pub(crate) async fn with_retries<F, Fut, T>(what: &str, attempts: u32, operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts => {
                warn!(what, attempt, %err, "transient failure, retrying");
                tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Runs the engine binary and captures its output.
pub(crate) async fn run_engine(binary: &str, args: &[String]) -> Result<std::process::Output> {
    tokio::process::Command::new(binary)
        .args(args)
        .output()
        .await
        .map_err(|e| StagecraftError::Backend {
            backend: binary.to_string(),
            reason: format!("failed to run {binary}: {e}"),
        })
}

/// Maps a non-zero exit into a backend error carrying stderr verbatim.
pub(crate) fn expect_success(
    backend: &str,
    what: &str,
    output: std::process::Output,
) -> Result<String> {
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(StagecraftError::Backend {
            backend: backend.to_string(),
            reason: format!(
                "{what} failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retries("push", 3, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StagecraftError::Backend { backend: "t".into(), reason: "transient".into() })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_stops_on_success() {
        let calls = AtomicU32::new(0);
        let result = with_retries("pull", 3, || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(StagecraftError::Backend { backend: "t".into(), reason: "transient".into() })
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
