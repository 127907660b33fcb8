use std::io::stderr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Result};
use tracing::{debug, error};
use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter};

mod cmd;
mod config;
mod console;

use cmd::config::ConfigCommand;
use cmd::demo::DemoArgs;
use cmd::snapshots::SnapshotsArgs;
use config::AppConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "Unattended fleet OS upgrades", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: ~/conf.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Verbose output - shows more detailed logs
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show or initialize the configuration file
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Validate the configuration
    Check,
    /// Run the upgrade engine against a simulated fleet
    Demo(DemoArgs),
    /// List or remove snapshots across a simulated fleet
    Snapshots(SnapshotsArgs),
}

fn init_logging(verbose: bool, configured_level: Option<String>) {
    let level = if verbose {
        "debug".to_string()
    } else {
        configured_level.unwrap_or_else(|| "info".to_string())
    };
    let directives = format!(
        "osupgrader={level},osupgrader_hypervisor={level},osupgrader_workflow={level},osupgrader_dispatch={level}",
        level = level
    );
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));

    registry().with(filter).with(fmt::layer().with_writer(stderr)).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => AppConfig::default_path()?,
    };
    init_logging(cli.verbose, config::peek_log_level(&config_path));
    debug!(config = %config_path.display(), "Logger initialized");

    match cli.command {
        Commands::Config(command) => {
            if let Err(e) = cmd::config::run(command, &config_path) {
                error!("config failed: {:#}", e);
                return Err(eyre!("{:#}", e));
            }
        }
        Commands::Check => {
            if let Err(e) = cmd::check::run(&config_path) {
                error!("check failed: {:#}", e);
                return Err(eyre!("{:#}", e));
            }
        }
        Commands::Demo(args) => match cmd::demo::run(args, &config_path).await {
            Ok(summary) if summary.failed == 0 => {}
            Ok(summary) => {
                return Err(eyre!("{} of {} upgrades failed", summary.failed, summary.total));
            }
            Err(e) => {
                error!("demo failed: {:#}", e);
                return Err(eyre!("{:#}", e));
            }
        },
        Commands::Snapshots(args) => {
            if let Err(e) = cmd::snapshots::run(args, &config_path).await {
                error!("snapshots failed: {:#}", e);
                return Err(eyre!("{:#}", e));
            }
        }
    }

    Ok(())
}
