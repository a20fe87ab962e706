use std::fmt;

use thiserror::Error;

/// Coarse power state of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Running,
    Paused,
    Suspended,
    ShuttingDown,
    Off,
    Crashed,
    Unknown,
}

impl PowerState {
    /// Any state in which the guest holds resources on the host.
    pub fn is_on(self) -> bool {
        matches!(
            self,
            PowerState::Running | PowerState::Paused | PowerState::ShuttingDown
        )
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PowerState::Running => "running",
            PowerState::Paused => "paused",
            PowerState::Suspended => "suspended",
            PowerState::ShuttingDown => "shutting down",
            PowerState::Off => "shutoff",
            PowerState::Crashed => "crashed",
            PowerState::Unknown => "unknown",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub name: String,
    /// Creation time as reported by the hypervisor, if known.
    pub created: Option<String>,
}

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("failed to connect to {uri}: {message}")]
    Connect { uri: String, message: String },

    #[error("domain '{name}' not found on {uri}")]
    DomainNotFound { name: String, uri: String },

    #[error("snapshot '{name}' not found")]
    SnapshotNotFound { name: String },

    #[error("{action} failed: {message}")]
    Operation {
        action: &'static str,
        message: String,
    },
}

impl MachineError {
    pub fn operation(action: &'static str, err: impl fmt::Display) -> Self {
        MachineError::Operation {
            action,
            message: err.to_string(),
        }
    }
}

/// An authenticated handle on one resolved domain.
///
/// Methods perform a single hypervisor call each and block until it
/// completes. Policy (idempotence, preconditions, response framing) lives in
/// `dispatch`, not here.
pub trait Machine {
    fn name(&self) -> &str;
    fn power_state(&self) -> Result<PowerState, MachineError>;
    fn start(&mut self) -> Result<(), MachineError>;
    /// Hard power-off.
    fn stop(&mut self) -> Result<(), MachineError>;
    /// Hard reset.
    fn reset(&mut self) -> Result<(), MachineError>;
    fn has_guest_agent(&self) -> Result<bool, MachineError>;
    fn guest_shutdown(&mut self) -> Result<(), MachineError>;
    fn guest_reboot(&mut self) -> Result<(), MachineError>;
    fn snapshots(&self) -> Result<Vec<SnapshotInfo>, MachineError>;
    fn create_snapshot(&mut self, name: &str) -> Result<(), MachineError>;
    /// Delete a snapshot, returning once the hypervisor has finished.
    fn delete_snapshot(&mut self, name: &str) -> Result<(), MachineError>;
    /// Descriptive attributes as ordered `(key, value)` pairs.
    fn details(&self) -> Result<Vec<(String, String)>, MachineError>;
    /// Release the hypervisor connection. Safe to call more than once.
    fn release(&mut self);
}
