//! `run` and `scrape-url` command handlers.
//!
//! Both wire the same engine: config → fetcher, extractor and resolver →
//! orchestrator → sink. Per-pair failures never abort the command; they show
//! up in the summary and the exit status.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Args;
use pricewatch_core::{
    AppConfig, FetchTier, ProductConfig, RegionSwitch, Rendering, SelectorSet, SwitchMechanism,
};
use pricewatch_scraper::{
    BrowserFetcher, BrowserOptions, ContentExtractor, LadderSettings, ObservationSink,
    OpenAiVision, Orchestrator, Pacing, PlainFetcher, PriceNormalizer, RunReport, TieredFetcher,
    TokioSleeper, VisionModel,
};

use crate::regions::load_resolver;
use crate::sink::{DryRunSink, PgSink};

/// Exit status after an operator interrupt.
const EXIT_INTERRUPTED: u8 = 130;

/// Flags shared by `run` and `scrape-url`.
#[derive(Debug, Clone, Default, Args)]
pub struct EngineArgs {
    /// Start the fetch ladder at this tier (plain, rendered, stealth, proxied)
    #[arg(long)]
    pub tier: Option<FetchTier>,

    /// Enable the residential-proxy tier (needs proxy credentials)
    #[arg(long)]
    pub proxy: bool,

    /// Run the browser with a visible window and click verification widgets
    #[arg(long)]
    pub visible: bool,

    /// Report intended inserts without writing to the database
    #[arg(long)]
    pub dry_run: bool,

    /// Save every fetched page as <DIR>/<product-slug>[_<region>].html
    #[arg(long, value_name = "DIR")]
    pub debug_html: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Scrape only this product (name or slug)
    #[arg(long)]
    pub product: Option<String>,

    #[command(flatten)]
    pub engine: EngineArgs,
}

#[derive(Debug, Clone, Args)]
pub struct ScrapeUrlArgs {
    #[arg(long)]
    pub url: String,

    #[arg(long)]
    pub price_selector: String,

    #[arg(long)]
    pub currency_selector: Option<String>,

    #[arg(long)]
    pub period_selector: Option<String>,

    #[arg(long)]
    pub plan_selector: Option<String>,

    /// Plan whose price is wanted, e.g. "Plus"
    #[arg(long)]
    pub plan: Option<String>,

    /// Region token to geo-target
    #[arg(long)]
    pub region: Option<String>,

    /// Treat the page as JavaScript-rendered
    #[arg(long)]
    pub render: bool,

    #[command(flatten)]
    pub engine: EngineArgs,
}

/// Scrape the catalogue, or a single product from it.
pub(crate) async fn run(config: &AppConfig, args: &RunArgs) -> anyhow::Result<ExitCode> {
    let catalogue = pricewatch_core::load_products(&config.products_path)?;
    let products = select_products(catalogue.products, args.product.as_deref())?;
    tracing::info!(products = products.len(), "catalogue loaded");

    let report = execute(config, &args.engine, &products).await?;
    println!("{}", report.summary);
    Ok(exit_code(&report))
}

/// Scrape one URL with selectors given on the command line.
pub(crate) async fn scrape_url(
    config: &AppConfig,
    args: &ScrapeUrlArgs,
) -> anyhow::Result<ExitCode> {
    let product = adhoc_product(args);
    pricewatch_core::catalog::validate_product(&product)?;

    let report = execute(config, &args.engine, std::slice::from_ref(&product)).await?;
    for observation in &report.observations {
        println!("{}", serde_json::to_string_pretty(observation)?);
    }
    Ok(exit_code(&report))
}

async fn execute(
    config: &AppConfig,
    engine: &EngineArgs,
    products: &[ProductConfig],
) -> anyhow::Result<RunReport> {
    if engine.proxy && config.proxy.is_none() {
        anyhow::bail!(
            "--proxy needs PRICEWATCH_PROXY_USERNAME and PRICEWATCH_PROXY_PASSWORD to be set"
        );
    }

    let resolver = load_resolver(config)?;
    let normalizer = PriceNormalizer::new(config.fallback_currency.clone());
    let extractor = ContentExtractor::standard(normalizer, build_vision(config)?);
    let fetcher = build_fetcher(config, engine.visible)?;

    let sink: Box<dyn ObservationSink> = if engine.dry_run {
        Box::new(DryRunSink)
    } else {
        let pool = pricewatch_db::connect_from_config(config)
            .await
            .context("connecting to the database (use --dry-run to skip persistence)")?;
        Box::new(PgSink::new(pool))
    };

    let settings = LadderSettings {
        max_retries: config.max_retries,
        backoff_base: Duration::from_millis(config.retry_backoff_base_ms),
        tier_override: engine.tier,
        proxy_enabled: engine.proxy,
    };
    let pacing = Pacing {
        region_delay_min: Duration::from_millis(config.region_delay_min_ms),
        region_delay_max: Duration::from_millis(config.region_delay_max_ms),
        product_delay: Duration::from_millis(config.product_delay_ms),
    };

    let cancel = Arc::new(AtomicBool::new(false));
    let interrupt = spawn_interrupt_listener(Arc::clone(&cancel));

    let sleeper = TokioSleeper;
    let report = Orchestrator::new(
        &fetcher,
        &extractor,
        &resolver,
        sink.as_ref(),
        &sleeper,
        settings,
    )
    .pacing(pacing)
    .cancel_flag(cancel)
    .debug_html(engine.debug_html.clone())
    .run(products)
    .await;
    interrupt.abort();

    write_run_log(&config.logs_dir, &report);
    Ok(report)
}

pub(crate) fn build_fetcher(config: &AppConfig, visible: bool) -> anyhow::Result<TieredFetcher> {
    let plain = PlainFetcher::new(config.request_timeout_secs, &config.user_agent)
        .context("building HTTP client")?;
    let browser = match BrowserFetcher::new(BrowserOptions::from_config(config, visible)) {
        Ok(browser) => Some(browser),
        Err(e) => {
            tracing::warn!(error = %e, "rendered tiers disabled");
            None
        }
    };
    Ok(TieredFetcher::new(plain, browser))
}

pub(crate) fn build_vision(config: &AppConfig) -> anyhow::Result<Option<Arc<dyn VisionModel>>> {
    let Some(api_key) = config.openai_api_key.as_deref() else {
        tracing::info!("OPENAI_API_KEY not set; vision extraction disabled");
        return Ok(None);
    };
    let client = OpenAiVision::new(
        api_key,
        &config.vision_model,
        &config.vision_url,
        config.vision_timeout_secs,
    )
    .context("building vision client")?;
    Ok(Some(Arc::new(client)))
}

/// Raise `cancel` on Ctrl-C. The run stops before its next product.
fn spawn_interrupt_listener(cancel: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; stopping after the current product");
            cancel.store(true, Ordering::SeqCst);
        }
    })
}

fn write_run_log(logs_dir: &Path, report: &RunReport) {
    match report.log.write_to(logs_dir, &report.summary) {
        Ok(path) => println!("run log: {}", path.display()),
        Err(e) => tracing::error!(
            dir = %logs_dir.display(),
            error = %e,
            "failed to write run log"
        ),
    }
}

pub(crate) fn select_products(
    products: Vec<ProductConfig>,
    filter: Option<&str>,
) -> anyhow::Result<Vec<ProductConfig>> {
    let Some(wanted) = filter else {
        return Ok(products);
    };
    let wanted_lower = wanted.to_lowercase();
    let selected: Vec<ProductConfig> = products
        .into_iter()
        .filter(|p| p.name.to_lowercase() == wanted_lower || p.slug() == wanted_lower)
        .collect();
    if selected.is_empty() {
        anyhow::bail!("product '{wanted}' not found in the catalogue");
    }
    Ok(selected)
}

fn adhoc_product(args: &ScrapeUrlArgs) -> ProductConfig {
    let name = reqwest::Url::parse(&args.url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| args.url.clone());

    let selectors = SelectorSet {
        price: vec![args.price_selector.clone()],
        currency: args.currency_selector.iter().cloned().collect(),
        period: args.period_selector.iter().cloned().collect(),
        plan_name: args.plan_selector.iter().cloned().collect(),
        section: Vec::new(),
    };

    let region_switch = args.region.as_ref().map(|token| RegionSwitch {
        mechanism: if args.engine.proxy {
            SwitchMechanism::Proxy
        } else {
            SwitchMechanism::None
        },
        selector: None,
        regions: vec![token.clone()],
        url_template: None,
    });

    ProductConfig {
        rendering: if args.render {
            Rendering::Dynamic
        } else {
            Rendering::Static
        },
        plan: args.plan.clone(),
        region_switch,
        ..ProductConfig::new(name, args.url.clone(), selectors)
    }
}

fn exit_code(report: &RunReport) -> ExitCode {
    ExitCode::from(exit_status(report))
}

fn exit_status(report: &RunReport) -> u8 {
    if report.cancelled {
        EXIT_INTERRUPTED
    } else if report.summary.is_clean() {
        0
    } else {
        1
    }
}
