//! Opcode dispatch table.
//!
//! Every opcode maps to exactly one `Response`. Machine failures become
//! `ERROR:` responses; nothing here ends the session except `end-session`,
//! which the session loop handles.

use crate::clock;
use crate::machine::{Machine, MachineError, SnapshotInfo};
use crate::protocol::{DETAILS_BLOCK, Opcode, Response, SNAPSHOTS_BLOCK, snapshot_line};

/// Prefix for snapshots created through `create-snapshot`.
pub const SNAPSHOT_PREFIX: &str = "vmctl";

pub fn execute<M: Machine + ?Sized>(machine: &mut M, opcode: &Opcode) -> Response {
    let result = match opcode {
        Opcode::ListSnapshots => list_snapshots(machine),
        Opcode::CreateSnapshot => create_snapshot(machine),
        Opcode::DeleteSnapshot { name } => delete_snapshot(machine, name),
        Opcode::Restart => restart(machine),
        Opcode::PowerOff => power_off(machine),
        Opcode::PowerOn => power_on(machine),
        Opcode::GracefulShutdown => graceful_shutdown(machine),
        Opcode::GracefulRestart => graceful_restart(machine),
        Opcode::GetDetails => details(machine),
        Opcode::EndSession => Ok(Response::Ended),
    };

    result.unwrap_or_else(|e| {
        tracing::warn!(opcode = %opcode, error = %e, "opcode failed");
        Response::error(e.to_string())
    })
}

fn list_snapshots<M: Machine + ?Sized>(machine: &M) -> Result<Response, MachineError> {
    let snapshots = machine.snapshots()?;
    if snapshots.is_empty() {
        return Ok(Response::NoSnapshots);
    }
    Ok(Response::block(
        SNAPSHOTS_BLOCK,
        snapshots.iter().map(format_snapshot),
    ))
}

fn format_snapshot(snapshot: &SnapshotInfo) -> String {
    snapshot_line(&snapshot.name, snapshot.created.as_deref())
}

fn create_snapshot<M: Machine + ?Sized>(machine: &mut M) -> Result<Response, MachineError> {
    let name = format!("{SNAPSHOT_PREFIX}-{}", clock::utc_timestamp());
    machine.create_snapshot(&name)?;
    tracing::info!(vm = machine.name(), snapshot = %name, "snapshot created");
    Ok(Response::success(format!(
        "snapshot '{name}' created for '{}'",
        machine.name()
    )))
}

fn delete_snapshot<M: Machine + ?Sized>(
    machine: &mut M,
    name: &str,
) -> Result<Response, MachineError> {
    if !machine.snapshots()?.iter().any(|s| s.name == name) {
        return Err(MachineError::SnapshotNotFound {
            name: name.to_string(),
        });
    }
    machine.delete_snapshot(name)?;
    tracing::info!(vm = machine.name(), snapshot = name, "snapshot deleted");
    Ok(Response::success(format!(
        "snapshot '{name}' deleted from '{}'",
        machine.name()
    )))
}

fn restart<M: Machine + ?Sized>(machine: &mut M) -> Result<Response, MachineError> {
    if !machine.power_state()?.is_on() {
        return Ok(Response::error(format!(
            "cannot restart '{}': it is powered off",
            machine.name()
        )));
    }
    machine.reset()?;
    Ok(Response::success(format!("'{}' restarted", machine.name())))
}

fn power_off<M: Machine + ?Sized>(machine: &mut M) -> Result<Response, MachineError> {
    if !machine.power_state()?.is_on() {
        return Ok(Response::success(format!(
            "'{}' is already powered off",
            machine.name()
        )));
    }
    machine.stop()?;
    Ok(Response::success(format!("'{}' powered off", machine.name())))
}

fn power_on<M: Machine + ?Sized>(machine: &mut M) -> Result<Response, MachineError> {
    if machine.power_state()?.is_on() {
        return Ok(Response::success(format!(
            "'{}' is already powered on",
            machine.name()
        )));
    }
    machine.start()?;
    Ok(Response::success(format!("'{}' powered on", machine.name())))
}

fn graceful_shutdown<M: Machine + ?Sized>(machine: &mut M) -> Result<Response, MachineError> {
    if !machine.power_state()?.is_on() {
        return Ok(Response::success(format!(
            "'{}' is already powered off",
            machine.name()
        )));
    }
    if !machine.has_guest_agent()? {
        return Ok(guest_agent_missing(machine.name(), "graceful shutdown"));
    }
    machine.guest_shutdown()?;
    Ok(Response::success(format!(
        "guest shutdown initiated for '{}'",
        machine.name()
    )))
}

fn graceful_restart<M: Machine + ?Sized>(machine: &mut M) -> Result<Response, MachineError> {
    if !machine.power_state()?.is_on() {
        return Ok(Response::error(format!(
            "cannot restart guest of '{}': it is powered off",
            machine.name()
        )));
    }
    if !machine.has_guest_agent()? {
        return Ok(guest_agent_missing(machine.name(), "graceful restart"));
    }
    machine.guest_reboot()?;
    Ok(Response::success(format!(
        "guest restart initiated for '{}'",
        machine.name()
    )))
}

fn guest_agent_missing(vm: &str, action: &str) -> Response {
    Response::error(format!(
        "guest agent is not available on '{vm}'; {action} requires a running guest agent"
    ))
}

fn details<M: Machine + ?Sized>(machine: &M) -> Result<Response, MachineError> {
    let attrs = machine.details()?;
    Ok(Response::block(
        DETAILS_BLOCK,
        attrs.iter().map(|(k, v)| format!("{k}: {v}")),
    ))
}
