use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "vmctl",
    about = "Search a VM inventory and manage machines over persistent libvirt sessions"
)]
pub struct Cli {
    /// Path to config file (default: ~/.config/vmctl/vmctl.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only print results
    #[arg(short, long)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Rebuild the inventory cache from every configured endpoint
    Refresh,

    /// Search cached records by name (case-insensitive substring)
    Search {
        pattern: String,

        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Pick a VM and manage it interactively
    Manage {
        /// Name filter; prompts when omitted
        pattern: Option<String>,
    },

    /// Run commands against one VM and exit
    Exec {
        /// Exact VM name
        name: String,

        /// Commands to run in order (e.g. list-snapshots, delete-snapshot:NAME)
        #[arg(required = true)]
        opcodes: Vec<String>,

        /// Endpoint to use when the name exists on several
        #[arg(short, long)]
        location: Option<String>,
    },
}

impl Command {
    /// Commands that open sessions and log to a file.
    pub fn uses_sessions(&self) -> bool {
        matches!(self, Command::Manage { .. } | Command::Exec { .. })
    }
}
