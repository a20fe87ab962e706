use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::net::UnixStream;
use tokio::signal::unix::{SignalKind, signal};
use tracing::Instrument;
use tracing_subscriber::EnvFilter;

use vmctl_worker::libvirt::LibvirtMachine;
use vmctl_worker::{WorkerError, run_session};

/// Session worker for vmctl. Spawned by the controller; not meant to be run
/// by hand.
#[derive(Parser, Debug)]
#[command(name = "vmctl-worker", version)]
struct Args {
    /// Controller socket to connect to
    #[arg(long)]
    socket: PathBuf,

    /// libvirt URI of the hypervisor hosting the domain
    #[arg(long)]
    uri: String,

    /// Domain name to resolve
    #[arg(long)]
    domain: String,

    /// Session identifier, for log correlation
    #[arg(long, default_value = "-")]
    session: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("vmctl_worker=debug")),
        )
        .init();

    let args = Args::parse();
    let span = tracing::info_span!("session", id = %args.session, domain = %args.domain);
    tracing::info!(parent: &span, version = env!("CARGO_PKG_VERSION"), uri = %args.uri, "worker starting");

    match run(&args).instrument(span).await {
        Ok(()) => {
            tracing::info!("worker exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, source = ?std::error::Error::source(&e), "worker failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> Result<(), WorkerError> {
    let stream = UnixStream::connect(&args.socket)
        .await
        .map_err(|source| WorkerError::Connect {
            path: args.socket.clone(),
            source,
        })?;

    let shutdown = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot watch SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    run_session(
        stream,
        || LibvirtMachine::connect(&args.uri, &args.domain),
        shutdown,
    )
    .await
}
