use std::path::PathBuf;

use thiserror::Error;

use crate::machine::MachineError;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to connect to controller socket {path}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("session startup failed")]
    Startup(#[source] MachineError),

    #[error("failed to read command")]
    Read(#[source] std::io::Error),

    #[error("failed to write response")]
    Write(#[source] std::io::Error),
}
