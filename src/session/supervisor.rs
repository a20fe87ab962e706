use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::UnixListener;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use vmctl_worker::{Opcode, Response};

use super::{
    Channel, ChannelError, Launcher, ProcessLauncher, Session, SessionId, SessionState, Target,
    WorkerHandle, WorkerSpec,
};
use crate::config::{SessionConfig, SystemConfig};
use crate::error::VmctlError;
use crate::paths;

/// How long to keep reading after the worker exits during startup, so an
/// `ERROR:` line it wrote just before exiting is still reported.
const EXIT_READ_GRACE: Duration = Duration::from_millis(200);

/// Opens, drives and closes sessions. Holds at most one live session.
pub struct Supervisor {
    config: SessionConfig,
    launcher: Box<dyn Launcher>,
    socket_dir: PathBuf,
    active: Weak<String>,
}

/// Why a bounded startup wait stopped without a result.
enum Interrupted {
    WorkerExited,
    BudgetExhausted,
}

/// Startup budget: `attempts` ticks of `interval`, shared by the connect and
/// the readiness phases.
struct OpenBudget {
    ticker: Interval,
    attempt: u32,
    attempts: u32,
    total: Duration,
}

impl OpenBudget {
    fn new(config: &SessionConfig) -> Self {
        let interval = config.open_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            ticker,
            attempt: 0,
            attempts: config.open_attempts,
            total: interval * config.open_attempts,
        }
    }

    /// Drive `fut` until it completes, the worker exits, or the budget runs out.
    async fn wait<T>(
        &mut self,
        worker: &mut dyn WorkerHandle,
        fut: impl Future<Output = T>,
    ) -> Result<T, Interrupted> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                out = &mut fut => return Ok(out),
                () = worker.exited() => return Err(Interrupted::WorkerExited),
                _ = self.ticker.tick() => {
                    self.attempt += 1;
                    if self.attempt >= self.attempts {
                        return Err(Interrupted::BudgetExhausted);
                    }
                    tracing::debug!(attempt = self.attempt, of = self.attempts, "waiting for worker");
                }
            }
        }
    }
}

impl Supervisor {
    pub fn new(config: SessionConfig, launcher: Box<dyn Launcher>, socket_dir: PathBuf) -> Self {
        Self {
            config,
            launcher,
            socket_dir,
            active: Weak::new(),
        }
    }

    /// Supervisor spawning the real worker binary.
    pub fn from_config(system: &SystemConfig) -> Self {
        let launcher = ProcessLauncher::new(system.worker_path(), paths::logs_dir());
        Self::new(
            system.config.session.clone(),
            Box::new(launcher),
            paths::socket_dir(),
        )
    }

    /// Default timeout for `opcode`.
    pub fn timeout_for(&self, opcode: &Opcode) -> Duration {
        if opcode.is_long_running() {
            self.config.long_command_timeout()
        } else {
            self.config.command_timeout()
        }
    }

    pub async fn open(&mut self, target: Target) -> Result<Session, VmctlError> {
        if let Some(live) = self.active.upgrade() {
            return Err(VmctlError::SessionActive {
                target: live.as_str().to_string(),
            });
        }

        std::fs::create_dir_all(&self.socket_dir).map_err(|source| VmctlError::Io {
            context: format!("failed to create {}", self.socket_dir.display()),
            source,
        })?;

        let id = SessionId::generate();
        let socket_path = self.socket_dir.join(format!("session-{id}.sock"));
        match std::fs::remove_file(&socket_path) {
            Ok(()) => tracing::debug!(path = %socket_path.display(), "removed leftover socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(VmctlError::Io {
                    context: format!("failed to remove {}", socket_path.display()),
                    source,
                });
            }
        }
        let listener = UnixListener::bind(&socket_path).map_err(|source| VmctlError::Io {
            context: format!("failed to bind {}", socket_path.display()),
            source,
        })?;

        let spec = WorkerSpec {
            session_id: &id,
            socket: &socket_path,
            target: &target,
        };
        let worker = match self.launcher.launch(&spec) {
            Ok(worker) => worker,
            Err(e) => {
                drop(listener);
                let _ = std::fs::remove_file(&socket_path);
                return Err(e);
            }
        };

        let lease = Arc::new(target.to_string());
        self.active = Arc::downgrade(&lease);

        let mut session = Session {
            id,
            target,
            state: SessionState::Initializing,
            channel: None,
            worker: Some(worker),
            socket_path,
            lease: Some(lease),
        };
        tracing::info!(session = %session.id, vm = %session.target, pid = session.worker_pid(), "opening session");

        match self.handshake(&mut session, listener).await {
            Ok(channel) => {
                session.channel = Some(channel);
                session.state = SessionState::Ready;
                tracing::info!(session = %session.id, "session ready");
                Ok(session)
            }
            Err(e) => {
                tracing::warn!(session = %session.id, error = %e, "session failed to open");
                session.fail();
                self.close(&mut session).await;
                Err(e)
            }
        }
    }

    /// Accept the worker's connection and wait for `SESSION_READY`.
    async fn handshake(
        &self,
        session: &mut Session,
        listener: UnixListener,
    ) -> Result<Channel, VmctlError> {
        let target = session.target.to_string();
        let Some(worker) = session.worker.as_deref_mut() else {
            return Err(VmctlError::Dead {
                message: "no worker".into(),
            });
        };
        let mut budget = OpenBudget::new(&self.config);
        let waiting_for = format!("worker for {target} to become ready");
        let timeout = |budget: &OpenBudget| VmctlError::Timeout {
            waiting_for: waiting_for.clone(),
            after: budget.total,
        };

        let stream = match budget.wait(worker, listener.accept()).await {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(source)) => {
                return Err(VmctlError::Io {
                    context: "failed to accept worker connection".into(),
                    source,
                });
            }
            Err(Interrupted::WorkerExited) => {
                return Err(VmctlError::ConnectFailed {
                    target: target.clone(),
                    message: "worker exited before connecting".into(),
                });
            }
            Err(Interrupted::BudgetExhausted) => return Err(timeout(&budget)),
        };
        drop(listener);

        let mut channel = Channel::new(stream);
        let first = match budget.wait(worker, channel.recv_frame()).await {
            Ok(frame) => frame,
            Err(Interrupted::WorkerExited) => {
                // The worker may have reported why before exiting.
                match tokio::time::timeout(EXIT_READ_GRACE, channel.recv_frame()).await {
                    Ok(Ok(Response::Error(message))) => {
                        return Err(VmctlError::ConnectFailed { target, message });
                    }
                    _ => {
                        return Err(VmctlError::ConnectFailed {
                            target,
                            message: "worker exited before becoming ready".into(),
                        });
                    }
                }
            }
            Err(Interrupted::BudgetExhausted) => return Err(timeout(&budget)),
        };

        match first {
            Ok(Response::Ready) => Ok(channel),
            Ok(Response::Error(message)) => Err(VmctlError::ConnectFailed { target, message }),
            Ok(other) => Err(VmctlError::Protocol {
                message: format!("expected SESSION_READY, got {:?}", other.to_wire().trim_end()),
            }),
            Err(ChannelError::Closed { .. }) => Err(VmctlError::ConnectFailed {
                target,
                message: "worker closed the channel before becoming ready".into(),
            }),
            Err(e) => Err(channel_error(e)),
        }
    }

    /// Send with the opcode's default timeout.
    pub async fn send_default(
        &self,
        session: &mut Session,
        opcode: &Opcode,
    ) -> Result<Response, VmctlError> {
        let timeout = self.timeout_for(opcode);
        self.send(session, opcode, timeout).await
    }

    /// Run one command and wait for its response.
    ///
    /// An `ERROR:` response becomes `VmctlError::Operation` and leaves the
    /// session ready. Every other error fails the session.
    pub async fn send(
        &self,
        session: &mut Session,
        opcode: &Opcode,
        timeout: Duration,
    ) -> Result<Response, VmctlError> {
        match session.state {
            SessionState::Ready => {}
            SessionState::Ended | SessionState::Failed => {
                return Err(VmctlError::Dead {
                    message: format!("session {} is {}", session.id, session.state),
                });
            }
            SessionState::Initializing | SessionState::Busy => {
                return Err(VmctlError::Protocol {
                    message: format!("session {} is {}", session.id, session.state),
                });
            }
        }
        if *opcode == Opcode::EndSession {
            return Err(VmctlError::Validation {
                message: "end-session is sent by close".into(),
            });
        }

        let outcome = {
            let (Some(channel), Some(worker)) =
                (session.channel.as_mut(), session.worker.as_deref_mut())
            else {
                session.fail();
                return Err(VmctlError::Dead {
                    message: "session has no channel".into(),
                });
            };

            let stale = channel.drain_stale();
            if stale > 0 {
                tracing::warn!(session = %session.id, stale, "drained stale responses");
            }

            if !worker.is_alive() {
                Outcome::Exited
            } else if let Err(e) = channel.send_line(&opcode.to_string()).await {
                Outcome::Frame(Err(e))
            } else {
                session.state = SessionState::Busy;
                tracing::debug!(session = %session.id, %opcode, "command sent");
                tokio::select! {
                    biased;
                    frame = channel.recv_frame() => Outcome::Frame(frame),
                    () = worker.exited() => Outcome::Exited,
                    () = tokio::time::sleep(timeout) => Outcome::TimedOut,
                }
            }
        };

        match outcome {
            Outcome::Frame(Ok(response)) if !opcode.accepts(&response) => {
                session.fail();
                Err(VmctlError::Protocol {
                    message: format!(
                        "unexpected response to {}: {:?}",
                        opcode.token(),
                        response.to_wire().lines().next().unwrap_or_default()
                    ),
                })
            }
            Outcome::Frame(Ok(Response::Error(message))) => {
                session.state = SessionState::Ready;
                tracing::debug!(session = %session.id, %opcode, error = %message, "command failed");
                Err(VmctlError::Operation {
                    opcode: opcode.token().to_string(),
                    message,
                })
            }
            Outcome::Frame(Ok(response)) => {
                session.state = SessionState::Ready;
                tracing::debug!(session = %session.id, %opcode, "command completed");
                Ok(response)
            }
            Outcome::Frame(Err(e)) => {
                session.fail();
                Err(channel_error(e))
            }
            Outcome::Exited => {
                session.fail();
                Err(VmctlError::Dead {
                    message: format!("worker for {} exited", session.target),
                })
            }
            Outcome::TimedOut => {
                tracing::warn!(session = %session.id, %opcode, ?timeout, "command timed out");
                session.fail();
                Err(VmctlError::Timeout {
                    waiting_for: format!("response to {}", opcode.token()),
                    after: timeout,
                })
            }
        }
    }

    /// End the session and make sure the worker is gone. Safe to call
    /// repeatedly and after the worker has exited on its own.
    pub async fn close(&self, session: &mut Session) {
        let grace = self.config.close_grace();

        if let Some(mut worker) = session.worker.take() {
            if session.state == SessionState::Ready
                && worker.is_alive()
                && let Some(channel) = session.channel.as_mut()
            {
                let ended = tokio::time::timeout(grace, async {
                    channel.drain_stale();
                    channel.send_line(&Opcode::EndSession.to_string()).await?;
                    channel.recv_frame().await
                })
                .await;
                match ended {
                    Ok(Ok(Response::Ended)) => {
                        tracing::debug!(session = %session.id, "worker acknowledged end of session");
                    }
                    Ok(Ok(other)) => {
                        tracing::warn!(session = %session.id, response = ?other, "unexpected response to end-session");
                    }
                    Ok(Err(e)) => tracing::debug!(session = %session.id, error = %e, "end-session not acknowledged"),
                    Err(_) => tracing::warn!(session = %session.id, "end-session timed out"),
                }
            }
            session.channel = None;

            stop_worker(worker.as_mut(), grace).await;
        }

        session.channel = None;
        session.remove_socket();
        if session.state != SessionState::Ended {
            tracing::info!(session = %session.id, "session closed");
        }
        session.state = SessionState::Ended;
        session.lease = None;
    }
}

enum Outcome {
    Frame(Result<Response, ChannelError>),
    Exited,
    TimedOut,
}

/// Wait for a graceful exit, then SIGTERM, then SIGKILL.
async fn stop_worker(worker: &mut dyn WorkerHandle, grace: Duration) {
    if tokio::time::timeout(grace, worker.exited()).await.is_ok() {
        return;
    }
    tracing::debug!(pid = worker.pid(), "worker still running, sending SIGTERM");
    worker.terminate();
    if tokio::time::timeout(grace, worker.exited()).await.is_ok() {
        return;
    }
    tracing::warn!(pid = worker.pid(), "worker ignored SIGTERM, killing");
    worker.start_kill();
    if tokio::time::timeout(grace, worker.exited()).await.is_err() {
        tracing::error!(pid = worker.pid(), "worker could not be reaped");
    }
}

fn channel_error(e: ChannelError) -> VmctlError {
    match e {
        ChannelError::Closed { open_block: None } => VmctlError::Dead {
            message: "worker closed the channel".into(),
        },
        ChannelError::Closed {
            open_block: Some(block),
        } => VmctlError::Protocol {
            message: format!("channel closed inside {block} block"),
        },
        ChannelError::Io(e) => VmctlError::Dead {
            message: format!("channel i/o failed: {e}"),
        },
        ChannelError::Frame(e) => VmctlError::Protocol {
            message: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::pin::Pin;
    use std::sync::Mutex;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;
    use vmctl_worker::fake::FakeMachine;

    type Script = Arc<dyn Fn(PathBuf) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

    /// Runs the worker side as a tokio task in this process.
    struct TaskLauncher {
        script: Script,
    }

    impl TaskLauncher {
        fn scripted<F, Fut>(f: F) -> Self
        where
            F: Fn(PathBuf) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = ()> + Send + 'static,
        {
            Self {
                script: Arc::new(move |path| -> Pin<Box<dyn Future<Output = ()> + Send>> {
                    Box::pin(f(path))
                }),
            }
        }

        /// The real worker loop over a `FakeMachine`.
        fn fake(machine: FakeMachine) -> Self {
            let machine = Arc::new(Mutex::new(Some(machine)));
            Self::scripted(move |path| {
                let machine = machine.clone();
                async move {
                    let stream = UnixStream::connect(&path).await.unwrap();
                    let Some(machine) = machine.lock().unwrap().take() else {
                        return;
                    };
                    let _ = vmctl_worker::run_session(
                        stream,
                        || Ok(machine),
                        std::future::pending(),
                    )
                    .await;
                }
            })
        }
    }

    struct TaskWorker {
        handle: Option<JoinHandle<()>>,
        stop: Option<oneshot::Sender<()>>,
    }

    impl WorkerHandle for TaskWorker {
        fn pid(&self) -> Option<u32> {
            None
        }

        fn is_alive(&mut self) -> bool {
            self.handle.as_ref().is_some_and(|h| !h.is_finished())
        }

        fn exited(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            Box::pin(async move {
                if let Some(handle) = self.handle.as_mut() {
                    let _ = handle.await;
                    self.handle = None;
                }
            })
        }

        fn terminate(&mut self) {
            if let Some(stop) = self.stop.take() {
                let _ = stop.send(());
            }
        }

        fn start_kill(&mut self) {
            if let Some(handle) = &self.handle {
                handle.abort();
            }
        }
    }

    impl Launcher for TaskLauncher {
        fn launch(&self, spec: &WorkerSpec<'_>) -> Result<Box<dyn WorkerHandle>, VmctlError> {
            let (stop_tx, stop_rx) = oneshot::channel::<()>();
            let script = (self.script)(spec.socket.to_path_buf());
            let handle = tokio::spawn(async move {
                tokio::select! {
                    () = script => {}
                    _ = stop_rx => {}
                }
            });
            Ok(Box::new(TaskWorker {
                handle: Some(handle),
                stop: Some(stop_tx),
            }))
        }
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            open_attempts: 30,
            open_interval_ms: 20,
            command_timeout_s: 5,
            long_command_timeout_s: 10,
            close_grace_ms: 200,
            worker_path: None,
        }
    }

    fn supervisor(dir: &Path, launcher: TaskLauncher) -> Supervisor {
        Supervisor::new(fast_config(), Box::new(launcher), dir.to_path_buf())
    }

    fn target() -> Target {
        Target {
            domain: "web01".into(),
            endpoint: "lab1".into(),
            uri: "test:///default".into(),
        }
    }

    /// Connect, announce readiness, then hand the line reader and writer to `rest`.
    async fn ready_then<F, Fut>(path: PathBuf, rest: F)
    where
        F: FnOnce(
            tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>,
            tokio::net::unix::OwnedWriteHalf,
        ) -> Fut,
        Fut: Future<Output = ()>,
    {
        let stream = UnixStream::connect(&path).await.unwrap();
        let (r, mut w) = stream.into_split();
        w.write_all(b"SESSION_READY\n").await.unwrap();
        rest(BufReader::new(r).lines(), w).await;
    }

    #[tokio::test]
    async fn open_waits_for_late_ready() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = TaskLauncher::scripted(|path| async move {
            // Two open intervals late.
            tokio::time::sleep(Duration::from_millis(40)).await;
            ready_then(path, |mut lines, _w| async move {
                while let Ok(Some(_)) = lines.next_line().await {}
            })
            .await;
        });
        let mut sup = supervisor(dir.path(), launcher);

        let mut session = sup.open(target()).await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert!(session.socket_path().exists());

        sup.close(&mut session).await;
        assert_eq!(session.state(), SessionState::Ended);
        assert!(!session.socket_path().exists());
    }

    #[tokio::test]
    async fn open_times_out_when_worker_never_ready() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = TaskLauncher::scripted(|path| async move {
            let _stream = UnixStream::connect(&path).await.unwrap();
            std::future::pending::<()>().await;
        });
        let mut sup = Supervisor::new(
            SessionConfig {
                open_attempts: 3,
                ..fast_config()
            },
            Box::new(launcher),
            dir.path().to_path_buf(),
        );

        let err = sup.open(target()).await.unwrap_err();
        assert!(matches!(err, VmctlError::Timeout { .. }), "{err:?}");
        assert!(err.to_string().contains("timed out after 60ms"), "{err}");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        // The failed attempt does not hold the slot.
        let err = sup.open(target()).await.unwrap_err();
        assert!(matches!(err, VmctlError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn default_open_budget_is_thirty_one_second_attempts() {
        let dir = tempfile::tempdir().unwrap();
        // Never connects.
        let launcher = TaskLauncher::scripted(|_path| std::future::pending::<()>());
        let config = SessionConfig::default();
        let mut sup = Supervisor::new(config.clone(), Box::new(launcher), dir.path().to_path_buf());

        let started = Instant::now();
        let err = sup.open(target()).await.unwrap_err();
        let elapsed = started.elapsed();

        match err {
            VmctlError::Timeout { after, .. } => assert_eq!(after, Duration::from_secs(30)),
            other => panic!("expected Timeout, got {other:?}"),
        }
        assert!(elapsed >= Duration::from_secs(30), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(30) + config.close_grace() * 3, "{elapsed:?}");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn stop_worker_kills_a_worker_ignoring_sigterm() {
        let child = tokio::process::Command::new("sh")
            .args(["-c", "trap '' TERM; exec sleep 30"])
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let mut worker = crate::session::ChildWorker::new(child);
        let grace = Duration::from_millis(200);

        let started = Instant::now();
        stop_worker(&mut worker, grace).await;

        assert!(!worker.is_alive());
        // Waited out both the graceful and the SIGTERM phases before killing.
        assert!(started.elapsed() >= grace * 2, "{:?}", started.elapsed());
    }

    #[tokio::test]
    async fn startup_error_is_connect_failure() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = TaskLauncher::scripted(|path| async move {
            let mut stream = UnixStream::connect(&path).await.unwrap();
            stream
                .write_all(b"ERROR: domain 'web01' not found on test:///default\n")
                .await
                .unwrap();
        });
        let mut sup = supervisor(dir.path(), launcher);

        match sup.open(target()).await {
            Err(VmctlError::ConnectFailed { target, message }) => {
                assert_eq!(target, "web01@lab1");
                assert!(message.contains("not found"), "{message}");
            }
            other => panic!("expected ConnectFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn worker_exit_before_connect_is_connect_failure() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = TaskLauncher::scripted(|_path| async move {});
        let mut sup = supervisor(dir.path(), launcher);

        let err = sup.open(target()).await.unwrap_err();
        assert!(matches!(err, VmctlError::ConnectFailed { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn second_ready_is_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = TaskLauncher::scripted(|path| async move {
            ready_then(path, |mut lines, mut w| async move {
                let _ = lines.next_line().await;
                w.write_all(b"SESSION_READY\n").await.unwrap();
                std::future::pending::<()>().await;
            })
            .await;
        });
        let mut sup = supervisor(dir.path(), launcher);
        let mut session = sup.open(target()).await.unwrap();

        let err = sup
            .send_default(&mut session, &Opcode::PowerOn)
            .await
            .unwrap_err();
        assert!(matches!(err, VmctlError::Protocol { .. }), "{err:?}");
        assert_eq!(session.state(), SessionState::Failed);

        sup.close(&mut session).await;
    }

    #[tokio::test]
    async fn only_one_live_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path(), TaskLauncher::fake(FakeMachine::new("web01")));

        let mut first = sup.open(target()).await.unwrap();
        match sup.open(target()).await {
            Err(VmctlError::SessionActive { target }) => assert_eq!(target, "web01@lab1"),
            other => panic!("expected SessionActive, got {other:?}"),
        }

        sup.close(&mut first).await;
        // The fake launcher hands its machine out once; the slot is free
        // again but this worker has nothing to serve.
        assert!(!matches!(
            sup.open(target()).await,
            Err(VmctlError::SessionActive { .. })
        ));
    }

    #[tokio::test]
    async fn dropping_a_session_frees_the_slot() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = TaskLauncher::scripted(|path| async move {
            ready_then(path, |mut lines, _w| async move {
                while let Ok(Some(_)) = lines.next_line().await {}
            })
            .await;
        });
        let mut sup = supervisor(dir.path(), launcher);

        let session = sup.open(target()).await.unwrap();
        let socket = session.socket_path().to_path_buf();
        drop(session);
        assert!(!socket.exists());

        let mut again = sup.open(target()).await.unwrap();
        sup.close(&mut again).await;
    }

    #[tokio::test]
    async fn list_snapshots_with_none_is_bare_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path(), TaskLauncher::fake(FakeMachine::new("web01")));
        let mut session = sup.open(target()).await.unwrap();

        let response = sup
            .send_default(&mut session, &Opcode::ListSnapshots)
            .await
            .unwrap();
        assert_eq!(response, Response::NoSnapshots);
        assert_eq!(response.to_wire(), "NO_SNAPSHOTS\n");
        assert_eq!(session.state(), SessionState::Ready);

        sup.close(&mut session).await;
    }

    #[tokio::test]
    async fn details_block_is_framed_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path(), TaskLauncher::fake(FakeMachine::new("web01")));
        let mut session = sup.open(target()).await.unwrap();

        let response = sup
            .send_default(&mut session, &Opcode::GetDetails)
            .await
            .unwrap();
        let wire = response.to_wire();
        let lines: Vec<&str> = wire.lines().collect();
        assert_eq!(lines.first(), Some(&"DETAILS_START"));
        assert_eq!(lines.last(), Some(&"DETAILS_END"));
        assert_eq!(lines.iter().filter(|l| **l == "DETAILS_START").count(), 1);
        assert_eq!(lines.iter().filter(|l| **l == "DETAILS_END").count(), 1);

        sup.close(&mut session).await;
    }

    #[tokio::test]
    async fn operation_error_keeps_session_ready() {
        let dir = tempfile::tempdir().unwrap();
        let machine = FakeMachine::new("web01").with_snapshots(["vmctl-a"]);
        let mut sup = supervisor(dir.path(), TaskLauncher::fake(machine));
        let mut session = sup.open(target()).await.unwrap();

        let missing = Opcode::delete_snapshot("no-such-snap").unwrap();
        match sup.send_default(&mut session, &missing).await {
            Err(VmctlError::Operation { opcode, message }) => {
                assert_eq!(opcode, "delete-snapshot");
                assert!(message.contains("no-such-snap"), "{message}");
            }
            other => panic!("expected Operation, got {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Ready);

        let ok = sup
            .send_default(&mut session, &Opcode::delete_snapshot("vmctl-a").unwrap())
            .await
            .unwrap();
        assert!(matches!(ok, Response::Success(_)));

        sup.close(&mut session).await;
    }

    #[tokio::test]
    async fn stale_responses_are_drained_before_send() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = TaskLauncher::scripted(|path| async move {
            ready_then(path, |mut lines, mut w| async move {
                let _ = lines.next_line().await;
                w.write_all(b"NO_SNAPSHOTS\nSUCCESS: stale leftover\n")
                    .await
                    .unwrap();
                let _ = lines.next_line().await;
                w.write_all(b"SUCCESS: fresh\n").await.unwrap();
                while let Ok(Some(_)) = lines.next_line().await {}
            })
            .await;
        });
        let mut sup = supervisor(dir.path(), launcher);
        let mut session = sup.open(target()).await.unwrap();

        assert_eq!(
            sup.send_default(&mut session, &Opcode::ListSnapshots)
                .await
                .unwrap(),
            Response::NoSnapshots
        );
        assert_eq!(
            sup.send_default(&mut session, &Opcode::PowerOn).await.unwrap(),
            Response::Success("fresh".into())
        );

        sup.close(&mut session).await;
    }

    #[tokio::test]
    async fn worker_death_fails_session() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = TaskLauncher::scripted(|path| async move {
            ready_then(path, |mut lines, _w| async move {
                let _ = lines.next_line().await;
            })
            .await;
        });
        let mut sup = supervisor(dir.path(), launcher);
        let mut session = sup.open(target()).await.unwrap();

        let err = sup
            .send_default(&mut session, &Opcode::PowerOff)
            .await
            .unwrap_err();
        assert!(matches!(err, VmctlError::Dead { .. }), "{err:?}");
        assert!(err.ends_session());
        assert_eq!(session.state(), SessionState::Failed);

        // Never a silent success afterwards.
        let err = sup
            .send_default(&mut session, &Opcode::PowerOn)
            .await
            .unwrap_err();
        assert!(matches!(err, VmctlError::Dead { .. }));

        sup.close(&mut session).await;
        sup.close(&mut session).await;
        assert_eq!(session.state(), SessionState::Ended);
    }

    #[tokio::test]
    async fn command_timeout_fails_session() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = TaskLauncher::scripted(|path| async move {
            ready_then(path, |mut lines, w| async move {
                let _w = w;
                let _ = lines.next_line().await;
                std::future::pending::<()>().await;
            })
            .await;
        });
        let mut sup = supervisor(dir.path(), launcher);
        let mut session = sup.open(target()).await.unwrap();

        let err = sup
            .send(&mut session, &Opcode::GetDetails, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, VmctlError::Timeout { .. }), "{err:?}");
        assert_eq!(session.state(), SessionState::Failed);

        sup.close(&mut session).await;
        assert!(!session.socket_path().exists());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_tolerates_exited_worker() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path(), TaskLauncher::fake(FakeMachine::new("web01")));
        let mut session = sup.open(target()).await.unwrap();

        sup.close(&mut session).await;
        sup.close(&mut session).await;
        assert_eq!(session.state(), SessionState::Ended);

        let err = sup
            .send_default(&mut session, &Opcode::ListSnapshots)
            .await
            .unwrap_err();
        assert!(matches!(err, VmctlError::Dead { .. }));

        // Worker that leaves on its own before close.
        let launcher = TaskLauncher::scripted(|path| async move {
            ready_then(path, |_lines, _w| async move {}).await;
        });
        let mut sup = supervisor(dir.path(), launcher);
        let mut session = sup.open(target()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        sup.close(&mut session).await;
        assert_eq!(session.state(), SessionState::Ended);
    }

    #[tokio::test]
    async fn end_session_is_reserved_for_close() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path(), TaskLauncher::fake(FakeMachine::new("web01")));
        let mut session = sup.open(target()).await.unwrap();

        let err = sup
            .send_default(&mut session, &Opcode::EndSession)
            .await
            .unwrap_err();
        assert!(matches!(err, VmctlError::Validation { .. }));
        assert_eq!(session.state(), SessionState::Ready);

        sup.close(&mut session).await;
    }

    #[test]
    fn snapshot_opcodes_use_long_timeout() {
        let sup = Supervisor::new(
            SessionConfig::default(),
            Box::new(TaskLauncher::scripted(|_| async {})),
            PathBuf::from("/tmp"),
        );
        assert_eq!(
            sup.timeout_for(&Opcode::delete_snapshot("x").unwrap()),
            Duration::from_secs(600)
        );
        assert_eq!(sup.timeout_for(&Opcode::CreateSnapshot), Duration::from_secs(600));
        assert_eq!(sup.timeout_for(&Opcode::PowerOn), Duration::from_secs(15));
    }
}
