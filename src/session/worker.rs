use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use super::{SessionId, Target};
use crate::error::VmctlError;
use crate::logging;

/// Everything a worker needs to start.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSpec<'a> {
    pub session_id: &'a SessionId,
    pub socket: &'a Path,
    pub target: &'a Target,
}

/// A running worker, as seen by the supervisor.
///
/// Methods returning futures use `Pin<Box<...>>` so the trait stays
/// object-safe.
pub trait WorkerHandle: Send {
    fn pid(&self) -> Option<u32>;

    fn is_alive(&mut self) -> bool;

    /// Resolves once the worker has exited and been reaped. Cancel-safe.
    fn exited(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Ask the worker to stop (SIGTERM).
    fn terminate(&mut self);

    /// Force the worker down without waiting.
    fn start_kill(&mut self);
}

/// Starts workers. Swapped out in tests for an in-process launcher.
pub trait Launcher: Send + Sync {
    fn launch(&self, spec: &WorkerSpec<'_>) -> Result<Box<dyn WorkerHandle>, VmctlError>;
}

// ── process workers ─────────────────────────────────────

pub struct ChildWorker {
    child: Child,
}

impl ChildWorker {
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

impl WorkerHandle for ChildWorker {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn exited(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            match self.child.wait().await {
                Ok(status) => tracing::debug!(%status, "worker exited"),
                Err(e) => tracing::warn!(error = %e, "failed to wait for worker"),
            }
        })
    }

    fn terminate(&mut self) {
        // `id()` is None once the child has been reaped.
        if let Some(pid) = self.child.id()
            && let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
        {
            tracing::debug!(pid, error = %e, "SIGTERM failed");
        }
    }

    fn start_kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(error = %e, "kill failed");
        }
    }
}

/// Spawns the `vmctl-worker` binary.
pub struct ProcessLauncher {
    worker_path: PathBuf,
    logs_dir: PathBuf,
}

impl ProcessLauncher {
    pub fn new(worker_path: PathBuf, logs_dir: PathBuf) -> Self {
        Self {
            worker_path,
            logs_dir,
        }
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, spec: &WorkerSpec<'_>) -> Result<Box<dyn WorkerHandle>, VmctlError> {
        logging::rotate_worker_logs(&self.logs_dir, logging::WORKER_LOGS_KEPT);

        let log_path = logging::worker_log_path(&self.logs_dir, spec.session_id.as_str());
        let stderr = logging::open_worker_log(&log_path).map_err(|source| VmctlError::Io {
            context: format!("failed to create worker log {}", log_path.display()),
            source,
        })?;

        let child = Command::new(&self.worker_path)
            .arg("--socket")
            .arg(spec.socket)
            .arg("--uri")
            .arg(&spec.target.uri)
            .arg("--domain")
            .arg(&spec.target.domain)
            .arg("--session")
            .arg(spec.session_id.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VmctlError::ConnectFailed {
                target: spec.target.to_string(),
                message: format!("failed to start {}: {e}", self.worker_path.display()),
            })?;

        tracing::debug!(
            pid = child.id(),
            log = %log_path.display(),
            "worker spawned"
        );
        Ok(Box::new(ChildWorker::new(child)))
    }
}
