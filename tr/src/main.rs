//! TaskRelay - operator CLI
//!
//! Key management and session token inspection for a relay deployment.

use std::io::Read;

use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use serde_json::Value;
use tracing::debug;

use taskrelay::cli::{Cli, Command};
use taskrelay::config::Config;
use taskrelay::session::{SessionCipher, generate_secret};

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .try_init()
        .map_err(|e| eyre::eyre!("Failed to initialize logging: {}", e))?;
    Ok(())
}

fn cipher(cli: &Cli, config: &Config) -> Result<SessionCipher> {
    let secret = cli
        .secret_key
        .as_deref()
        .or(config.secret_key.as_deref())
        .ok_or_else(|| eyre::eyre!("No secret key: set `secret-key` in the config or pass --secret-key"))?;
    SessionCipher::from_secret(secret).context("Failed to derive session key")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    debug!(command = ?cli.command, "main: dispatching");

    match &cli.command {
        Command::Keygen => {
            println!("{}", generate_secret());
        }
        Command::Config => {
            let yaml = serde_yaml::to_string(&config.redacted()).context("Failed to render configuration")?;
            let node = serde_json::to_string_pretty(&config.node_config()).context("Failed to render node config")?;
            println!("{}", "# Effective configuration".cyan());
            print!("{}", yaml);
            println!("{}", "# Sent to nodes on register".cyan());
            println!("{}", node);
        }
        Command::Seal { task_id } => {
            let mut input = String::new();
            std::io::stdin()
                .read_to_string(&mut input)
                .context("Failed to read stdin")?;
            let data = match serde_json::from_str::<Value>(&input).context("Input is not valid JSON")? {
                Value::Object(map) => map,
                _ => eyre::bail!("Input must be a JSON object"),
            };
            let token = cipher(&cli, &config)?
                .seal(&data, task_id.as_bytes())
                .context("Failed to seal session data")?;
            println!("{}", token);
        }
        Command::Open { token, task_id } => {
            let data = cipher(&cli, &config)?
                .open(token.trim(), task_id.as_bytes())
                .context("Failed to open session token")?;
            let pretty = serde_json::to_string_pretty(&Value::Object(data)).context("Failed to render session data")?;
            println!("{}", pretty);
            eprintln!("{} token verified for task {}", "✓".green(), task_id.cyan());
        }
    }

    Ok(())
}
