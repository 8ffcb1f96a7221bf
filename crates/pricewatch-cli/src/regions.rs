//! `regions` command handlers: list the catalogue and vet token resolution.

use std::process::ExitCode;

use clap::Subcommand;
use pricewatch_core::AppConfig;
use pricewatch_scraper::{RegionDirectory, RegionResolver};

/// Sub-commands available under `regions`.
#[derive(Debug, Subcommand)]
pub enum RegionsCommands {
    /// Print every canonical region with its aliases
    List,
    /// Show how a raw token resolves
    Resolve {
        /// Region token as a source site labels it, e.g. "sa_en"
        token: String,
    },
}

/// Load the region catalogue and build a resolver honouring strict mode.
pub(crate) fn load_resolver(config: &AppConfig) -> anyhow::Result<RegionResolver> {
    let file = pricewatch_core::load_regions(&config.regions_path)?;
    let directory = RegionDirectory::from_file(file);
    tracing::debug!(regions = directory.len(), "region catalogue loaded");
    Ok(RegionResolver::new(directory).strict(config.region_strict))
}

pub(crate) fn run(config: &AppConfig, command: &RegionsCommands) -> anyhow::Result<ExitCode> {
    let resolver = load_resolver(config)?;

    match command {
        RegionsCommands::List => {
            for record in resolver.directory().records() {
                if record.aliases.is_empty() {
                    println!("{:<5} {}", record.code, record.name);
                } else {
                    println!(
                        "{:<5} {} ({})",
                        record.code,
                        record.name,
                        record.aliases.join(", ")
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        RegionsCommands::Resolve { token } => match resolver.explain(token) {
            Some((code, source)) => {
                println!("{token} -> {code} ({source})");
                Ok(ExitCode::SUCCESS)
            }
            None => {
                println!("{token} -> unresolved");
                Ok(ExitCode::FAILURE)
            }
        },
    }
}
