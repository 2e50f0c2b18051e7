//! CLI command definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// TaskRelay - stateless task distribution for untrusted worker nodes
#[derive(Debug, Parser)]
#[command(name = "tr", version, about = "TaskRelay operator tools")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Secret key for session tokens (overrides `secret-key` from the config)
    #[arg(long, global = true)]
    pub secret_key: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print a fresh random secret key
    Keygen,

    /// Print the effective configuration
    Config,

    /// Seal a JSON object read from stdin into a session token
    Seal {
        /// Task id the token is bound to
        #[arg(long)]
        task_id: String,
    },

    /// Open a session token and print the JSON object inside
    Open {
        /// Token produced by `tr seal`
        token: String,

        /// Task id the token was bound to
        #[arg(long)]
        task_id: String,
    },
}
