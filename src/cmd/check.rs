//! `check`: validate the configuration before a real run

use std::path::Path;

use anyhow::{bail, Context, Result};
use osupgrader_dispatch::{effective_workers, DEFAULT_PARALLELISM};
use osupgrader_workflow::SettleDelays;
use tracing::warn;

use crate::config::AppConfig;

pub fn run(path: &Path) -> Result<()> {
    let config = AppConfig::load_or_init(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    println!("Config: {}", path.display());

    let mut problems = 0;

    match config.iso_path() {
        Ok(iso) => println!("✓ ISO path: {}", iso),
        Err(e) => {
            println!("❌ {}", e);
            problems += 1;
        }
    }

    if let Err(e) = config.script_bundle() {
        println!("❌ {}", e);
        problems += 1;
    } else if let Some(dir) = &config.scripts.dir {
        println!("✓ Scripts: {}", dir.display());
    } else {
        println!("✓ Scripts: built-in placeholders");
    }

    let timeouts = config.timeout_config();
    match timeouts.budget_warning(&SettleDelays::default()) {
        Some(warning) => {
            warn!("{}", warning);
            println!("⚠ {}", warning);
        }
        None => println!(
            "✓ Overall timeout: {} min",
            timeouts.overall.as_secs() / 60
        ),
    }

    let parallel = config.upgrade.parallel;
    if parallel <= 0 {
        println!(
            "⚠ upgrade.parallel is {}, using the default of {}",
            parallel, DEFAULT_PARALLELISM
        );
    } else {
        println!(
            "✓ Parallelism: up to {} workers",
            effective_workers(parallel, usize::MAX)
        );
    }

    if problems > 0 {
        bail!("{} configuration problem(s) found", problems);
    }
    Ok(())
}
