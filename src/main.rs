#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, clippy::all, clippy::pedantic)]
#![warn(clippy::nursery)]

use std::{env, path::PathBuf, sync::Arc};

use cerberus::{settings, CertManager};
use clap::{Parser, Subcommand};
use eyre::{bail, Result};
use log::{info, warn, LevelFilter};

/// Keep a Let's Encrypt certificate for this server valid.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Configuration file.
    #[arg(short, long, global = true, env = "CERBERUS_CONFIG", default_value = "config.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
enum Command {
    /// Obtain a certificate if needed, then keep renewing it until interrupted (default).
    Run,
    /// Exit with an error if the certificate is missing or due for renewal.
    Check,
    /// Print everything known about the stored account, keys and certificate as JSON.
    Parse,
    /// Create the account and server keys if they don't exist yet.
    Keys,
    /// Order a new certificate right away.
    Renew,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let settings = Arc::new(settings::load(&cli.config)?);
    init_logger(settings.debug);

    let manager = Arc::new(CertManager::new(settings));

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(manager).await?,
        Command::Check => {
            if !manager.check_cert() {
                bail!("certificate is missing or due for renewal");
            }
        }
        Command::Parse => println!("{:#}", manager.parse_cert()),
        Command::Keys => {
            manager.create_keys()?;
        }
        Command::Renew => {
            if !manager.create_cert(true).await? {
                bail!("certificate renewal failed");
            }
        }
    }

    Ok(())
}

fn init_logger(debug: bool) {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let mut builder = pretty_env_logger::formatted_timed_builder();
    builder
        .filter_level(LevelFilter::Warn)
        .filter_module("cerberus", level);

    if let Ok(filters) = env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }

    builder.init();
}

async fn run(manager: Arc<CertManager>) -> Result<()> {
    if !manager.get_cert().await? {
        warn!("no valid certificate available yet, the next check will retry");
    }

    let Some(monitor) = Arc::clone(&manager).monitor_cert(|| info!("certificate renewed")) else {
        return Ok(());
    };

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    monitor.abort();

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_to_run_with_local_config() {
        let cli = Cli::try_parse_from(["cerberus"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("config.toml"));
        assert_eq!(cli.command, None);
    }

    #[test]
    fn config_flag_before_and_after_command() {
        let cli = Cli::try_parse_from(["cerberus", "--config", "x.toml", "check"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("x.toml"));
        assert_eq!(cli.command, Some(Command::Check));

        let cli = Cli::try_parse_from(["cerberus", "renew", "-c", "y.toml"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("y.toml"));
        assert_eq!(cli.command, Some(Command::Renew));
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert!(Cli::try_parse_from(["cerberus", "frobnicate"]).is_err());
    }
}
