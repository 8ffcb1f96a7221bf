mod discover;
mod regions;
mod scrape;
mod sink;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::discover::DiscoverArgs;
use crate::regions::RegionsCommands;
use crate::scrape::{RunArgs, ScrapeUrlArgs};

#[derive(Debug, Parser)]
#[command(name = "pricewatch")]
#[command(about = "Subscription price scraper across regional storefronts")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape every configured product (or one, with --product)
    Run(RunArgs),
    /// Scrape a single URL with ad-hoc selectors
    ScrapeUrl(ScrapeUrlArgs),
    /// Find price selectors with the vision model and store them in the catalogue
    DiscoverSelectors(DiscoverArgs),
    /// Inspect the region catalogue
    Regions {
        #[command(subcommand)]
        command: RegionsCommands,
    },
    /// Database maintenance
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommands {
    /// Apply pending migrations
    Migrate,
    /// Check the database connection
    Ping,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // --help and usage errors exit here, before any config is required.
    let cli = Cli::parse();

    dotenvy::dotenv().ok();
    let config = pricewatch_core::load_app_config()?;
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.log_level.clone()))?;
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Some(Commands::Run(args)) => scrape::run(&config, &args).await,
        Some(Commands::ScrapeUrl(args)) => scrape::scrape_url(&config, &args).await,
        Some(Commands::DiscoverSelectors(args)) => discover::run(&config, &args).await,
        Some(Commands::Regions { command }) => regions::run(&config, &command),
        Some(Commands::Db { command }) => {
            let pool = pricewatch_db::connect_from_config(&config).await?;
            match command {
                DbCommands::Migrate => {
                    let applied = pricewatch_db::run_migrations(&pool).await?;
                    println!("applied {applied} migration(s)");
                }
                DbCommands::Ping => {
                    pricewatch_db::ping(&pool).await?;
                    println!("database reachable");
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        None => {
            println!("pricewatch: no command given; see --help");
            Ok(ExitCode::SUCCESS)
        }
    }
}
