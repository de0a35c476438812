//! CLI command definitions and handlers

use anyhow::{bail, Context, Result};
use cf_vault::launch::{Launcher, Target};
use cf_vault::store::{self, Backend, SecretStore, BACKEND_ENV};
use cf_vault::{HttpConnector, Materializer, NewProfile, Provisioner, Template};
use cf_vault_core::{AuthType, Config, Paths, ProfileStore};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::env;
use std::io::{self, BufRead, Write};
use tracing::debug;

/// cf-vault - Manage Cloudflare credentials securely
#[derive(Parser)]
#[command(name = "cf-vault")]
#[command(version)]
#[command(about = "Manage Cloudflare credentials securely")]
#[command(long_about = "Manage Cloudflare credentials securely.\n\n\
    Long lived API keys and tokens are kept in the OS keychain (or an\n\
    age-encrypted file store) instead of shell profiles and dotfiles.\n\
    `exec` runs a command with one profile's credentials in its\n\
    environment, optionally swapping them for a short lived token.")]
#[command(after_help = "EXAMPLES:\n\
    cf-vault add work\n\
    cf-vault add deploy --session-duration 15m --profile-template write-everything\n\
    cf-vault exec work -- wrangler whoami\n\
    cf-vault exec deploy\n\
    cf-vault list --json\n\n\
ENVIRONMENT:\n\
    CF_VAULT_HOME             Config and key directory (default ~/.cf-vault)\n\
    CF_VAULT_BACKEND          Secret store: keychain or file\n\
    CF_VAULT_FILE_PASSPHRASE  Passphrase for the file store\n\
    RUST_LOG                  Log filter (overrides --verbose)")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Add a new profile to cf-vault
    Add {
        /// Profile name
        profile: String,

        /// TTL of short lived tokens (e.g. 15m, 1h, 1h30m)
        #[arg(long)]
        session_duration: Option<String>,

        /// Policy template for short lived tokens: read-only, write-everything
        #[arg(long)]
        profile_template: Option<String>,
    },

    /// List all profiles
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Execute a command with Cloudflare credentials populated
    Exec {
        /// Profile to use
        profile: String,

        /// Command to run (defaults to $SHELL)
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Print the version and platform
    Version,
}

fn open_store(paths: &Paths) -> Result<Box<dyn SecretStore>> {
    let setting = env::var(BACKEND_ENV).ok();
    let backend = Backend::from_setting(setting.as_deref())
        .with_context(|| format!("invalid {}", BACKEND_ENV))?;
    Ok(store::open(backend, paths))
}

fn prompt_line(prompt: &str) -> Result<String> {
    print!("{}", prompt);
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read from stdin")?;
    Ok(line.trim().to_string())
}

/// Add a profile
pub fn cmd_add(
    profile: String,
    session_duration: Option<String>,
    profile_template: Option<String>,
) -> Result<()> {
    let template = profile_template
        .as_deref()
        .map(str::parse::<Template>)
        .transpose()?;

    let email = prompt_line("Email address: ")?;
    let secret = rpassword::prompt_password("Authentication value (API key or API token): ")
        .context("failed to read authentication value")?;
    if secret.trim().is_empty() {
        bail!("empty authentication value not allowed");
    }

    let paths = Paths::new();
    let profiles = ProfileStore::new(&paths.config);
    let secrets = open_store(&paths)?;
    let connector = HttpConnector::from_env();

    let added = Provisioner::new(&profiles, secrets.as_ref(), &connector)
        .add(NewProfile {
            name: profile.clone(),
            email,
            secret,
            session_duration,
            template,
        })
        .with_context(|| format!("failed to add profile {:?}", profile))?;

    println!("success: profile {} added ({})", profile.trim(), added.auth_type);
    if let Some(duration) = &added.session_duration {
        println!(
            "Sessions will use tokens valid for {} scoped to {} policies",
            duration,
            added.policies.len()
        );
    }

    Ok(())
}

/// One line of `list` output
#[derive(Debug, Serialize, PartialEq)]
pub struct ProfileRow<'a> {
    pub name: &'a str,
    pub auth_type: AuthType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_duration: Option<&'a str>,
    pub policies: usize,
}

/// Rows sorted by profile name
pub fn profile_rows(config: &Config) -> Vec<ProfileRow<'_>> {
    config
        .profiles
        .iter()
        .map(|(name, profile)| ProfileRow {
            name,
            auth_type: profile.auth_type,
            email: (profile.auth_type == AuthType::ApiKey).then_some(profile.email.as_str()),
            session_duration: profile
                .session_duration
                .as_deref()
                .filter(|d| !d.trim().is_empty()),
            policies: profile.policies.len(),
        })
        .collect()
}

/// List profiles
pub fn cmd_list(json: bool) -> Result<()> {
    let profiles = ProfileStore::new(&Paths::new().config);
    let config = profiles.load()?;
    let rows = profile_rows(&config);

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!(
            "No profiles in {}. Add one with: cf-vault add <profile>",
            profiles.path().display()
        );
        return Ok(());
    }

    let width = rows.iter().map(|r| r.name.len()).max().unwrap_or(0).max(7);
    println!(
        "{:<width$}  {:<9}  {:<24}  {:<16}  {}",
        "PROFILE", "AUTH", "EMAIL", "SESSION", "POLICIES"
    );
    for row in &rows {
        println!(
            "{:<width$}  {:<9}  {:<24}  {:<16}  {}",
            row.name,
            row.auth_type.as_str(),
            row.email.unwrap_or("-"),
            row.session_duration.unwrap_or("-"),
            row.policies
        );
    }

    Ok(())
}

/// Run a command inside a session for `profile`
pub fn cmd_exec(profile: String, command: Vec<String>) -> Result<()> {
    let paths = Paths::new();
    let profiles = ProfileStore::new(&paths.config);
    let secrets = open_store(&paths)?;
    let connector = HttpConnector::from_env();
    let materializer = Materializer::new(secrets.as_ref(), &connector);

    let launcher = Launcher::for_profile(
        &profile,
        Target::from_args(command, env::var("SHELL").ok()),
        env::vars_os(),
        &profiles,
        &materializer,
        Utc::now(),
    )
    .with_context(|| format!("failed to start a session for {:?}", profile))?;
    debug!("launching {}", launcher.program().display());

    match launcher.exec()? {}
}

pub fn version_string() -> String {
    format!(
        "cf-vault {} ({}-{})",
        env!("CARGO_PKG_VERSION"),
        env::consts::OS,
        env::consts::ARCH
    )
}

/// Print version
pub fn cmd_version() -> Result<()> {
    println!("{}", version_string());
    Ok(())
}
