//! Persistent command sessions.
//!
//! A [`Session`] is one authenticated engagement with one target, backed by
//! one `vmctl-worker` process and one [`Channel`]. The caller owns the
//! session value and passes it to [`Supervisor`] operations.

mod channel;
mod supervisor;
mod worker;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub use channel::{Channel, ChannelError};
pub use supervisor::Supervisor;
pub use worker::{ChildWorker, Launcher, ProcessLauncher, WorkerHandle, WorkerSpec};

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique per controller process and across concurrently running controllers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let counter = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("{}-{nanos:x}-{counter}", std::process::id()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A domain on a specific hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub domain: String,
    /// Endpoint label, the `location` of the inventory record.
    pub endpoint: String,
    pub uri: String,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.domain, self.endpoint)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Ready,
    Busy,
    Ended,
    Failed,
}

impl SessionState {
    /// States that hold the supervisor's single session slot.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            SessionState::Initializing | SessionState::Ready | SessionState::Busy
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Initializing => "initializing",
            SessionState::Ready => "ready",
            SessionState::Busy => "busy",
            SessionState::Ended => "ended",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

pub struct Session {
    id: SessionId,
    target: Target,
    state: SessionState,
    channel: Option<Channel>,
    worker: Option<Box<dyn WorkerHandle>>,
    socket_path: PathBuf,
    /// Held while live; the supervisor keeps only a weak reference.
    lease: Option<Arc<String>>,
}

impl Session {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn socket_path(&self) -> &std::path::Path {
        &self.socket_path
    }

    pub fn worker_pid(&self) -> Option<u32> {
        self.worker.as_ref().and_then(|w| w.pid())
    }

    /// Mark the session unusable. The worker is killed here and reaped by
    /// `Supervisor::close`.
    fn fail(&mut self) {
        if self.state.is_live() {
            tracing::debug!(session = %self.id, "session failed");
        }
        self.state = SessionState::Failed;
        self.channel = None;
        self.lease = None;
        if let Some(worker) = self.worker.as_mut() {
            worker.start_kill();
        }
    }

    fn remove_socket(&self) {
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.socket_path.display(), error = %e, "could not remove session socket");
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("state", &self.state)
            .field("socket_path", &self.socket_path)
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.as_mut()
            && worker.is_alive()
        {
            tracing::warn!(session = %self.id, "session dropped without close, killing worker");
            worker.start_kill();
        }
        self.remove_socket();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn session_ids_are_unique() {
        let ids: HashSet<SessionId> = (0..1000).map(|_| SessionId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn session_id_starts_with_pid() {
        let id = SessionId::generate();
        assert!(id.as_str().starts_with(&format!("{}-", std::process::id())));
        assert!(!id.as_str().contains('/'));
    }

    #[test]
    fn target_display() {
        let target = Target {
            domain: "web01".into(),
            endpoint: "lab1".into(),
            uri: "qemu:///system".into(),
        };
        assert_eq!(target.to_string(), "web01@lab1");
    }
}
