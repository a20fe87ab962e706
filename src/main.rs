use std::io::IsTerminal;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use vmctl::cli::{Cli, Command};
use vmctl::config;
use vmctl::error::VmctlError;
use vmctl::fetch;
use vmctl::inventory::{Inventory, Record};
use vmctl::logging;
use vmctl::progress::{OutputMode, Progress};
use vmctl::ui;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let mode = OutputMode::resolve(cli.verbose, cli.quiet, std::io::stdout().is_terminal());

    // Terminal layer: prompts and spinners own the terminal during sessions,
    // so stderr tracing stays off there unless -v was given.
    let terminal_filter = match mode {
        OutputMode::Verbose => EnvFilter::new("debug"),
        OutputMode::Quiet => EnvFilter::new("off"),
        OutputMode::Normal if cli.command.uses_sessions() => EnvFilter::new("off"),
        OutputMode::Normal | OutputMode::Plain => EnvFilter::from_default_env()
            .add_directive("vmctl=info".parse().expect("valid log directive")),
    };

    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter);

    // File layer: always captures vmctl=debug, initially discards until activated
    let (file_writer, file_handle) = logging::DeferredFileWriter::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("vmctl=debug"));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();

    let sys_config = config::load_config(cli.config.as_deref())?;

    // Activate file logging for commands that open sessions
    if cli.command.uses_sessions() {
        let logs_dir = vmctl::paths::logs_dir();
        if let Err(e) = file_handle.set_file(&logs_dir.join("vmctl.log")) {
            tracing::warn!(error = %e, "file logging disabled");
        }
    }

    let progress = Progress::new(mode);

    match cli.command {
        Command::Refresh => {
            let inventory = progress
                .run("Refreshing inventory", fetch::refresh(&sys_config))
                .await?;
            println!(
                "{} records written to {}",
                inventory.len(),
                sys_config.cache_path().display()
            );
        }
        Command::Search { pattern, json } => {
            let inventory = Inventory::load(&sys_config.cache_path())?;
            let hits = inventory.search(&pattern);
            if json {
                let records: Vec<Record> = hits.into_iter().cloned().collect();
                println!(
                    "{}",
                    facet_json::to_string(&records).expect("JSON serialization")
                );
            } else {
                print_records(&pattern, &hits);
            }
        }
        Command::Manage { pattern } => match ui::manage(&sys_config, pattern, progress).await {
            Ok(()) | Err(VmctlError::Cancelled) => {}
            Err(e) => return Err(e.into()),
        },
        Command::Exec {
            name,
            opcodes,
            location,
        } => {
            let all_ok =
                ui::exec(&sys_config, &name, &opcodes, location.as_deref(), progress).await?;
            if !all_ok {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn print_records(pattern: &str, hits: &[&Record]) {
    if hits.is_empty() {
        println!("No VMs match '{pattern}'.");
        return;
    }

    let name_w = hits.iter().map(|r| r.name.len()).max().unwrap_or(4).max(4);
    let status_w = hits.iter().map(|r| r.status.len()).max().unwrap_or(6).max(6);
    let loc_w = hits
        .iter()
        .map(|r| r.location.len())
        .max()
        .unwrap_or(8)
        .max(8);

    println!(
        "{:<name_w$}  {:<status_w$}  {:<loc_w$}  GROUP",
        "NAME", "STATUS", "LOCATION"
    );
    for r in hits {
        println!(
            "{:<name_w$}  {:<status_w$}  {:<loc_w$}  {}",
            r.name, r.status, r.location, r.group
        );
    }
}
