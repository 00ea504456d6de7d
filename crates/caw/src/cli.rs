use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "caw", about = "Peer change awareness for your editor", version)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress human-readable output
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Directory holding the local service sockets
    #[arg(long, global = true)]
    pub socket_root: Option<PathBuf>,

    /// Config file (default: <config dir>/caw/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Session ID to use instead of a fresh one
    #[arg(long, global = true)]
    pub session: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Check the connection to the local service
    Status,

    /// Show lines changed by peers in a file
    ActivePath {
        /// File inside a repository
        file: PathBuf,
    },

    /// Reposition line markers across edits, offline
    Shift {
        /// Line numbers, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        lines: Vec<u32>,

        /// Edit as LINE:LEN:REPLACE_LEN (repeatable, applied in order)
        #[arg(long = "edit")]
        edits: Vec<String>,
    },

    /// Print events pushed by the local service until interrupted
    Watch {
        /// Also keep this file's markers fresh and print them
        #[arg(long)]
        file: Option<PathBuf>,
    },
}
