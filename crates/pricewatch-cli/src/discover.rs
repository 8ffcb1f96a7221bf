//! `discover-selectors` command handler.
//!
//! Finds price selectors for catalogue entries with the vision model and
//! stores the ones that read a valid price back into the products file.

use std::process::ExitCode;
use std::time::Duration;

use clap::Args;
use pricewatch_core::{AppConfig, ProductConfig};
use pricewatch_scraper::{
    Discovered, LadderSettings, PriceNormalizer, SelectorDiscovery, TokioSleeper,
};

use crate::scrape::{build_fetcher, build_vision, select_products};

#[derive(Debug, Clone, Default, Args)]
pub struct DiscoverArgs {
    /// Only this product (name or slug), even if it already has selectors
    #[arg(long)]
    pub product: Option<String>,

    /// Print what was found without rewriting the products file
    #[arg(long)]
    pub dry_run: bool,

    /// Enable the residential-proxy tier (needs proxy credentials)
    #[arg(long)]
    pub proxy: bool,

    /// Run the browser with a visible window
    #[arg(long)]
    pub visible: bool,
}

pub(crate) async fn run(config: &AppConfig, args: &DiscoverArgs) -> anyhow::Result<ExitCode> {
    let catalogue = pricewatch_core::load_products_for_discovery(&config.products_path)?;
    let products = discovery_targets(catalogue.products, args.product.as_deref())?;
    if products.is_empty() {
        println!("no products need selector discovery");
        return Ok(ExitCode::SUCCESS);
    }

    let Some(model) = build_vision(config)? else {
        anyhow::bail!("selector discovery needs OPENAI_API_KEY to be set");
    };
    if args.proxy && config.proxy.is_none() {
        anyhow::bail!(
            "--proxy needs PRICEWATCH_PROXY_USERNAME and PRICEWATCH_PROXY_PASSWORD to be set"
        );
    }

    let fetcher = build_fetcher(config, args.visible)?;
    let normalizer = PriceNormalizer::new(config.fallback_currency.clone());
    let settings = LadderSettings {
        max_retries: config.max_retries,
        backoff_base: Duration::from_millis(config.retry_backoff_base_ms),
        tier_override: None,
        proxy_enabled: args.proxy,
    };
    let sleeper = TokioSleeper;
    let discovery =
        SelectorDiscovery::new(&fetcher, &sleeper, model.as_ref(), &normalizer, settings);

    let mut failed = 0usize;
    for product in &products {
        match discovery.discover(product).await {
            Ok(found) => {
                println!("{}", describe(product, &found));
                if args.dry_run {
                    continue;
                }
                if let Err(e) = pricewatch_core::update_product_selectors(
                    &config.products_path,
                    &product.name,
                    &found.selectors,
                ) {
                    tracing::error!(product = %product.name, error = %e, "could not store selectors");
                    println!("  not saved: {e}");
                    failed += 1;
                }
            }
            Err(e) => {
                tracing::warn!(product = %product.name, error = %e, "selector discovery failed");
                println!("{}: {e}", product.name);
                failed += 1;
            }
        }
    }

    println!(
        "discovery finished: {} succeeded, {failed} failed",
        products.len() - failed
    );
    Ok(if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// The named product, else every product still lacking a price selector.
fn discovery_targets(
    products: Vec<ProductConfig>,
    filter: Option<&str>,
) -> anyhow::Result<Vec<ProductConfig>> {
    match filter {
        Some(_) => select_products(products, filter),
        None => Ok(products
            .into_iter()
            .filter(ProductConfig::needs_discovery)
            .collect()),
    }
}

fn describe(product: &ProductConfig, found: &Discovered) -> String {
    let mut lines = vec![format!(
        "{}: {:.2} {} read via {} (fetch={})",
        product.name,
        found.amount,
        found.currency,
        found.selectors.price.join(", "),
        found.fetch_tier,
    )];
    for (field, selectors) in [
        ("currency", &found.selectors.currency),
        ("period", &found.selectors.period),
        ("plan_name", &found.selectors.plan_name),
    ] {
        if !selectors.is_empty() {
            lines.push(format!("  {field}: {}", selectors.join(", ")));
        }
    }
    if let Some(note) = &found.note {
        lines.push(format!("  note: {note}"));
    }
    lines.join("\n")
}
