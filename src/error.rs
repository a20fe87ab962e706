use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum VmctlError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("libvirt error: {message}")]
    #[diagnostic(help("{hint}"))]
    Libvirt { message: String, hint: String },

    #[error("inventory error: {message}")]
    #[diagnostic(help("run `vmctl refresh` to rebuild the inventory cache"))]
    Inventory { message: String },

    #[error("{message}")]
    NotFound { message: String },

    #[error("cancelled")]
    Cancelled,

    // ── session ─────────────────────────────────────────────

    #[error("failed to open session for '{target}': {message}")]
    ConnectFailed { target: String, message: String },

    #[error("timed out after {after:?} waiting for {waiting_for}")]
    Timeout {
        waiting_for: String,
        after: std::time::Duration,
    },

    #[error("session worker is not running: {message}")]
    #[diagnostic(help("open a new session"))]
    Dead { message: String },

    #[error("protocol error: {message}")]
    Protocol { message: String },

    #[error("{opcode} failed: {message}")]
    Operation { opcode: String, message: String },

    #[error("a session for '{target}' is still open")]
    SessionActive { target: String },
}

impl VmctlError {
    /// Errors after which the session can no longer be used.
    pub fn ends_session(&self) -> bool {
        matches!(
            self,
            VmctlError::ConnectFailed { .. }
                | VmctlError::Timeout { .. }
                | VmctlError::Dead { .. }
                | VmctlError::Protocol { .. }
        )
    }
}
