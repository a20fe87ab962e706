//! Worker side of a session: announce readiness once, then execute one
//! command at a time until `end-session`, EOF or shutdown.

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::dispatch;
use crate::error::WorkerError;
use crate::machine::{Machine, MachineError};
use crate::protocol::{Opcode, Response};

/// Run a complete worker session over `stream`.
///
/// `open` authenticates and resolves the target; it runs exactly once.
/// Its failure is reported as a single `ERROR:` line before returning.
/// `shutdown` resolving ends the loop early (e.g. on SIGTERM).
pub async fn run_session<S, M, F, Q>(stream: S, open: F, shutdown: Q) -> Result<(), WorkerError>
where
    S: AsyncRead + AsyncWrite,
    M: Machine,
    F: FnOnce() -> Result<M, MachineError>,
    Q: Future<Output = ()>,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    let mut machine = match open() {
        Ok(machine) => machine,
        Err(e) => {
            tracing::error!(error = %e, "session startup failed");
            write_response(&mut writer, &Response::error(e.to_string())).await?;
            return Err(WorkerError::Startup(e));
        }
    };

    write_response(&mut writer, &Response::Ready).await?;
    tracing::info!(vm = machine.name(), "session ready");

    let result = tokio::select! {
        result = serve(&mut machine, &mut reader, &mut writer) => result,
        () = shutdown => {
            tracing::info!("shutdown requested, ending session");
            Ok(())
        }
    };

    machine.release();
    tracing::info!("connection released");
    result
}

async fn serve<M, R, W>(
    machine: &mut M,
    reader: &mut BufReader<R>,
    writer: &mut W,
) -> Result<(), WorkerError>
where
    M: Machine,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader
            .read_until(b'\n', &mut buf)
            .await
            .map_err(WorkerError::Read)?
            == 0
        {
            tracing::info!("controller closed the channel");
            return Ok(());
        }
        // Invalid UTF-8 is replaced rather than fatal, so the command is
        // rejected with an ERROR line like any other unknown command.
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        tracing::debug!(command = line, "received");
        let response = match line.parse::<Opcode>() {
            Ok(Opcode::EndSession) => {
                write_response(writer, &Response::Ended).await?;
                tracing::info!("end of session requested");
                return Ok(());
            }
            Ok(opcode) => execute_guarded(machine, &opcode),
            Err(e) => {
                tracing::warn!(command = line, error = %e, "rejected command");
                Response::error(e.to_string())
            }
        };

        write_response(writer, &response).await?;
    }
}

/// Run one opcode, turning a panic into an `ERROR:` response so the
/// session survives it.
fn execute_guarded<M: Machine>(machine: &mut M, opcode: &Opcode) -> Response {
    match catch_unwind(AssertUnwindSafe(|| dispatch::execute(machine, opcode))) {
        Ok(response) => response,
        Err(payload) => {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            tracing::error!(opcode = %opcode, detail = %detail, "internal fault");
            Response::error(format!("internal fault while running {opcode}: {detail}"))
        }
    }
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &Response,
) -> Result<(), WorkerError> {
    writer
        .write_all(response.to_wire().as_bytes())
        .await
        .map_err(WorkerError::Write)?;
    writer.flush().await.map_err(WorkerError::Write)
}
