//! cf-vault - Manage Cloudflare credentials securely
//!
//! Commands:
//! - add <PROFILE>: Store a credential and describe the profile
//! - list: Show configured profiles
//! - exec <PROFILE> [-- CMD...]: Run a command (or $SHELL) with credentials
//! - version: Print version and platform

mod cli;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Add {
            profile,
            session_duration,
            profile_template,
        } => cli::cmd_add(profile, session_duration, profile_template),
        Commands::List { json } => cli::cmd_list(json),
        Commands::Exec { profile, command } => cli::cmd_exec(profile, command),
        Commands::Version => cli::cmd_version(),
    }
}
