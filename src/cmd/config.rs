//! `config` subcommands

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Subcommand;

use crate::config::AppConfig;

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective configuration (secrets are never shown)
    Show,
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, default_value_t = false)]
        force: bool,
    },
}

pub fn run(command: ConfigCommand, path: &Path) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let config = AppConfig::load_or_init(path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
            let json = serde_json::to_string_pretty(&config)?;
            println!("Config: {}", path.display());
            println!("{}", json);
        }
        ConfigCommand::Init { force } => {
            if path.exists() && !force {
                bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            AppConfig::default()
                .save(path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote default configuration to {}", path.display());
        }
    }
    Ok(())
}
