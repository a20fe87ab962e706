use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;

/// Worker logs kept after rotation.
pub const WORKER_LOGS_KEPT: usize = 20;

// ── DeferredFileWriter ───────────────────────────────────

/// A `MakeWriter` that discards writes until `DeferredFileHandle::set_file`
/// points it at a log file.
///
/// The subscriber is installed before we know whether the command needs a
/// log file at all (only session commands do).
#[derive(Clone)]
pub struct DeferredFileWriter {
    inner: Arc<Mutex<Option<File>>>,
}

#[derive(Clone)]
pub struct DeferredFileHandle {
    inner: Arc<Mutex<Option<File>>>,
}

impl DeferredFileWriter {
    pub fn new() -> (Self, DeferredFileHandle) {
        let inner = Arc::new(Mutex::new(None));
        (
            Self {
                inner: inner.clone(),
            },
            DeferredFileHandle { inner },
        )
    }
}

impl DeferredFileHandle {
    /// Start appending to `path`.
    pub fn set_file(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if let Ok(mut guard) = self.inner.lock() {
            *guard = Some(file);
        }
        Ok(())
    }
}

pub struct DeferredWriter {
    inner: Arc<Mutex<Option<File>>>,
}

impl std::io::Write for DeferredWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.inner.lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(f) => f.write(buf),
                None => Ok(buf.len()),
            },
            Err(_) => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.inner.lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(f) => f.flush(),
                None => Ok(()),
            },
            Err(_) => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for DeferredFileWriter {
    type Writer = DeferredWriter;

    fn make_writer(&'a self) -> Self::Writer {
        DeferredWriter {
            inner: self.inner.clone(),
        }
    }
}

// ── Worker logs ──────────────────────────────────────────

/// Per-session worker log inside `logs_dir`.
pub fn worker_log_path(logs_dir: &Path, session_id: &str) -> PathBuf {
    logs_dir.join(format!("worker-{session_id}.log"))
}

/// Create the stderr sink for a worker process.
pub fn open_worker_log(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Delete the oldest `worker-*.log` files, keeping at most `keep`.
pub fn rotate_worker_logs(logs_dir: &Path, keep: usize) {
    let Ok(entries) = fs::read_dir(logs_dir) else {
        return;
    };

    let mut logs: Vec<(std::time::SystemTime, PathBuf)> = entries
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_str()
                .is_some_and(|f| f.starts_with("worker-") && f.ends_with(".log"))
        })
        .filter_map(|e| {
            let modified = e.metadata().ok()?.modified().ok()?;
            Some((modified, e.path()))
        })
        .collect();

    // Oldest first; ties broken by name for a stable order.
    logs.sort();

    if logs.len() > keep {
        for (_, old) in &logs[..logs.len() - keep] {
            if let Err(e) = fs::remove_file(old) {
                tracing::debug!(path = %old.display(), error = %e, "could not remove old worker log");
            }
        }
    }
}
