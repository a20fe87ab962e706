//! Worker side of a vmctl session.
//!
//! The worker holds one authenticated libvirt connection to one domain and
//! executes opcodes sent by the controller over a Unix socket, one at a
//! time. The wire protocol in [`protocol`] is shared with the controller.

pub mod clock;
pub mod dispatch;
pub mod error;
#[cfg(any(test, feature = "testing"))]
pub mod fake;
pub mod libvirt;
pub mod machine;
pub mod protocol;
pub mod session;

pub use error::WorkerError;
pub use machine::{Machine, MachineError, PowerState, SnapshotInfo};
pub use protocol::{FrameDecoder, FrameError, Opcode, ParseOpcodeError, Response};
pub use session::run_session;
