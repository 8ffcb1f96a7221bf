//! End-to-end tests for `Orchestrator::run` over fake fetchers and sinks.
//!
//! No network, browser or wall-clock waiting: pages come from a map, sleeps
//! are recorded, and observations are collected in memory.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use pricewatch_core::{
    ExtractionTier, FetchTier, PriceObservation, ProductConfig, RegionRecord, RegionSwitch,
    SelectorSet, SwitchMechanism,
};
use pricewatch_scraper::{
    ContentExtractor, FetchError, FetchRequest, FetchedPage, LadderSettings, ObservationSink,
    Orchestrator, Pacing, PageFetcher, PersistenceError, PriceNormalizer, RecordingSleeper,
    RegionDirectory, RegionResolver, RunReport, VisionError, VisionModel, VisionRequest,
    VisionResponse,
};

const PRICE_PAGE: &str =
    r#"<html><body><span id="price">$12.99</span><div id="period">/month</div></body></html>"#;

/// What a client-rendered app serves before its JavaScript runs.
const JS_SHELL: &str = r#"<html><body><div id="app"></div><script src="/bundle.js"></script><noscript>Enable JavaScript to see pricing.</noscript></body></html>"#;

const SCREENSHOT: &[u8] = b"\x89PNG fake";

/// Serves pages by URL, or by URL and tier when a tier-specific page is
/// set; unknown URLs fail with a 502. Requested screenshots are fake bytes.
#[derive(Default)]
struct MapFetcher {
    pages: HashMap<String, String>,
    tier_pages: HashMap<(String, FetchTier), String>,
    panic_on: Option<String>,
    calls: Mutex<Vec<(String, FetchTier)>>,
    screenshot_requests: Mutex<Vec<bool>>,
}

impl MapFetcher {
    fn with_page(mut self, url: &str, html: &str) -> Self {
        self.pages.insert(url.to_string(), html.to_string());
        self
    }

    fn with_tier_page(mut self, url: &str, tier: FetchTier, html: &str) -> Self {
        self.tier_pages
            .insert((url.to_string(), tier), html.to_string());
        self
    }

    fn calls(&self) -> Vec<(String, FetchTier)> {
        self.calls.lock().unwrap().clone()
    }

    fn tiers(&self) -> Vec<FetchTier> {
        self.calls().into_iter().map(|(_, t)| t).collect()
    }

    fn screenshot_requests(&self) -> Vec<bool> {
        self.screenshot_requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageFetcher for MapFetcher {
    async fn fetch(
        &self,
        request: &FetchRequest,
        tier: FetchTier,
    ) -> Result<FetchedPage, FetchError> {
        self.calls.lock().unwrap().push((request.url.clone(), tier));
        self.screenshot_requests
            .lock()
            .unwrap()
            .push(request.capture_screenshot);
        assert!(
            self.panic_on.as_deref() != Some(request.url.as_str()),
            "fetcher exploded on {}",
            request.url
        );
        let page = self
            .tier_pages
            .get(&(request.url.clone(), tier))
            .or_else(|| self.pages.get(&request.url));
        match page {
            Some(html) => Ok(FetchedPage {
                url: request.url.clone(),
                html: html.clone(),
                screenshot: request.capture_screenshot.then(|| SCREENSHOT.to_vec()),
                tier,
                challenge_wait: Duration::ZERO,
            }),
            None => Err(FetchError::UnexpectedStatus {
                status: 502,
                url: request.url.clone(),
            }),
        }
    }
}

/// Collects observations; rejects those for `reject_region`, and raises
/// `cancel_after_first` once the first observation lands.
#[derive(Default)]
struct MemorySink {
    observations: Mutex<Vec<PriceObservation>>,
    reject_region: Option<String>,
    cancel_after_first: Option<Arc<AtomicBool>>,
}

impl MemorySink {
    fn stored(&self) -> Vec<PriceObservation> {
        self.observations.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObservationSink for MemorySink {
    async fn record(&self, observation: &PriceObservation) -> Result<(), PersistenceError> {
        if let Some(flag) = &self.cancel_after_first {
            flag.store(true, Ordering::SeqCst);
        }
        if self.reject_region.is_some() && observation.region_token == self.reject_region {
            return Err(PersistenceError::new("unique constraint violated"));
        }
        self.observations.lock().unwrap().push(observation.clone());
        Ok(())
    }
}

/// Answers every request with fixed selectors and remembers what it was sent.
#[derive(Default)]
struct StubVision {
    answer: VisionResponse,
    seen: Mutex<Vec<(String, Option<Vec<u8>>)>>,
}

impl StubVision {
    fn seen(&self) -> Vec<(String, Option<Vec<u8>>)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl VisionModel for StubVision {
    async fn locate(&self, request: &VisionRequest<'_>) -> Result<VisionResponse, VisionError> {
        self.seen.lock().unwrap().push((
            request.plan_name.to_string(),
            request.screenshot.map(<[u8]>::to_vec),
        ));
        Ok(self.answer.clone())
    }
}

fn resolver() -> RegionResolver {
    let records = [("GB", "United Kingdom"), ("DE", "Germany"), ("FR", "France"), ("US", "United States")]
        .iter()
        .map(|(code, name)| RegionRecord {
            code: (*code).to_string(),
            name: (*name).to_string(),
            aliases: Vec::new(),
        })
        .collect();
    RegionResolver::new(RegionDirectory::new(records, &BTreeMap::new())).strict(true)
}

fn settings() -> LadderSettings {
    LadderSettings {
        max_retries: 3,
        backoff_base: Duration::from_secs(1),
        tier_override: None,
        proxy_enabled: false,
    }
}

fn selectors() -> SelectorSet {
    SelectorSet {
        price: vec!["#price".to_string()],
        period: vec!["#period".to_string()],
        ..SelectorSet::default()
    }
}

fn simple_product(name: &str, url: &str) -> ProductConfig {
    ProductConfig::new(name, url, selectors())
}

fn regional_product(regions: &[&str]) -> ProductConfig {
    ProductConfig {
        region_switch: Some(RegionSwitch {
            mechanism: SwitchMechanism::UrlParam,
            selector: None,
            regions: regions.iter().map(|r| (*r).to_string()).collect(),
            url_template: Some("?country={REGION}".to_string()),
        }),
        ..simple_product("Regional", "https://shop.test/pricing")
    }
}

async fn run(
    fetcher: &MapFetcher,
    sink: &MemorySink,
    sleeper: &RecordingSleeper,
    products: &[ProductConfig],
) -> RunReport {
    run_with_vision(fetcher, sink, sleeper, products, None).await
}

async fn run_with_vision(
    fetcher: &MapFetcher,
    sink: &MemorySink,
    sleeper: &RecordingSleeper,
    products: &[ProductConfig],
    vision: Option<Arc<dyn VisionModel>>,
) -> RunReport {
    let extractor = ContentExtractor::standard(PriceNormalizer::default(), vision);
    let resolver = resolver();
    Orchestrator::new(fetcher, &extractor, &resolver, sink, sleeper, settings())
        .run(products)
        .await
}

#[tokio::test]
async fn single_product_yields_one_successful_observation() {
    let fetcher = MapFetcher::default().with_page("https://a.test/pricing", PRICE_PAGE);
    let sink = MemorySink::default();
    let sleeper = RecordingSleeper::new();

    let report = run(
        &fetcher,
        &sink,
        &sleeper,
        &[simple_product("Alpha", "https://a.test/pricing")],
    )
    .await;

    assert_eq!(report.observations.len(), 1);
    let obs = &report.observations[0];
    assert!(obs.success);
    assert!((obs.amount - 12.99).abs() < 1e-9);
    assert_eq!(obs.currency, "USD");
    assert!(obs.period.to_lowercase().contains("month"), "period: {}", obs.period);
    assert_eq!(obs.plan_name, "Alpha");
    assert_eq!(obs.region_token, None);
    assert_eq!(obs.fetch_tier, Some(FetchTier::Plain));
    assert_eq!(obs.extraction_tier, Some(ExtractionTier::Selector));

    assert_eq!(sink.stored().len(), 1);
    assert_eq!(report.summary.succeeded, 1);
    assert!(report.summary.is_clean());
    assert!(sleeper.calls().is_empty());
}

#[tokio::test]
async fn exhausted_ladder_emits_one_failure_observation() {
    let fetcher = MapFetcher::default();
    let sink = MemorySink::default();
    let sleeper = RecordingSleeper::new();

    let report = run(
        &fetcher,
        &sink,
        &sleeper,
        &[simple_product("Down", "https://down.test/pricing")],
    )
    .await;

    assert_eq!(report.observations.len(), 1);
    let obs = &report.observations[0];
    assert!(!obs.success);
    assert!(obs.amount.abs() < f64::EPSILON);
    assert!(obs.notes.as_deref().is_some_and(|n| !n.trim().is_empty()));
    assert_eq!(obs.fetch_tier, Some(FetchTier::Stealth));

    let tiers: Vec<FetchTier> = fetcher.calls().into_iter().map(|(_, t)| t).collect();
    assert_eq!(tiers, [FetchTier::Plain, FetchTier::Rendered, FetchTier::Stealth]);
    assert_eq!(
        sleeper.calls(),
        [Duration::from_secs(1), Duration::from_secs(2)]
    );
    assert_eq!(report.summary.fetch_failed, 1);
    assert!(!report.summary.is_clean());
}

#[tokio::test]
async fn three_regions_yield_three_tagged_observations() {
    let fetcher = MapFetcher::default()
        .with_page("https://shop.test/pricing?country=uk", PRICE_PAGE)
        .with_page(
            "https://shop.test/pricing?country=fr",
            r#"<span id="price">9,99 €</span><div id="period">par mois</div>"#,
        );
    let sink = MemorySink::default();
    let sleeper = RecordingSleeper::new();

    let report = run(&fetcher, &sink, &sleeper, &[regional_product(&["uk", "de", "fr"])]).await;

    let tokens: Vec<Option<&str>> = report
        .observations
        .iter()
        .map(|o| o.region_token.as_deref())
        .collect();
    assert_eq!(tokens, [Some("uk"), Some("de"), Some("fr")]);

    let regions: Vec<Option<&str>> = report
        .observations
        .iter()
        .map(|o| o.region.as_deref())
        .collect();
    assert_eq!(regions, [Some("GB"), Some("DE"), Some("FR")]);

    assert!(report.observations[0].success);
    assert!(!report.observations[1].success, "de has no page");
    assert!(report.observations[2].success);
    assert_eq!(report.observations[2].currency, "EUR");
    assert!((report.observations[2].amount - 9.99).abs() < 1e-9);

    assert_eq!(report.summary.succeeded, 2);
    assert_eq!(report.summary.fetch_failed, 1);
}

#[tokio::test]
async fn persistence_failure_is_counted_and_run_continues() {
    let fetcher = MapFetcher::default()
        .with_page("https://shop.test/pricing?country=uk", PRICE_PAGE)
        .with_page("https://shop.test/pricing?country=de", PRICE_PAGE);
    let sink = MemorySink {
        reject_region: Some("uk".to_string()),
        ..MemorySink::default()
    };
    let sleeper = RecordingSleeper::new();

    let report = run(&fetcher, &sink, &sleeper, &[regional_product(&["uk", "de"])]).await;

    assert_eq!(report.observations.len(), 2);
    assert_eq!(report.summary.persistence_failed, 1);
    assert_eq!(report.summary.succeeded, 2);
    assert_eq!(sink.stored().len(), 1);
    assert_eq!(sink.stored()[0].region_token.as_deref(), Some("de"));
    assert!(report
        .log
        .lines()
        .iter()
        .any(|l| l.contains("persistence failed")));
}

#[tokio::test]
async fn unresolved_region_still_emits_and_is_counted() {
    let fetcher =
        MapFetcher::default().with_page("https://shop.test/pricing?country=atlantis", PRICE_PAGE);
    let sink = MemorySink::default();
    let sleeper = RecordingSleeper::new();

    let report = run(&fetcher, &sink, &sleeper, &[regional_product(&["atlantis"])]).await;

    assert_eq!(report.observations.len(), 1);
    let obs = &report.observations[0];
    assert!(obs.success);
    assert_eq!(obs.region, None);
    assert_eq!(obs.region_token.as_deref(), Some("atlantis"));
    assert_eq!(report.summary.unresolved_region, 1);
}

#[tokio::test]
async fn unparseable_price_text_is_a_parse_failure() {
    let fetcher = MapFetcher::default()
        .with_page("https://a.test/pricing", r#"<span id="price">Contact us</span>"#)
        .with_page("https://b.test/pricing", "<p>Pricing coming soon</p>");
    let sink = MemorySink::default();
    let sleeper = RecordingSleeper::new();

    let report = run(
        &fetcher,
        &sink,
        &sleeper,
        &[
            simple_product("Sales", "https://a.test/pricing"),
            simple_product("Soon", "https://b.test/pricing"),
        ],
    )
    .await;

    assert_eq!(report.observations.len(), 2);
    assert!(report.observations.iter().all(|o| !o.success));
    assert_eq!(report.summary.parse_failed, 1);
    assert_eq!(report.summary.extraction_failed, 1);
    assert_eq!(report.observations[0].fetch_tier, Some(FetchTier::Stealth));
    assert!(report.observations[0]
        .notes
        .as_deref()
        .is_some_and(|n| n.contains("Contact us")));
}

#[tokio::test]
async fn priceless_page_escalates_to_the_next_tier() {
    let url = "https://app.test/pricing";
    let fetcher = MapFetcher::default()
        .with_tier_page(url, FetchTier::Plain, JS_SHELL)
        .with_tier_page(url, FetchTier::Rendered, PRICE_PAGE);
    let sink = MemorySink::default();
    let sleeper = RecordingSleeper::new();

    let report = run(&fetcher, &sink, &sleeper, &[simple_product("Spa", url)]).await;

    assert_eq!(report.observations.len(), 1);
    let obs = &report.observations[0];
    assert!(obs.success, "notes: {:?}", obs.notes);
    assert!((obs.amount - 12.99).abs() < 1e-9);
    assert_eq!(obs.fetch_tier, Some(FetchTier::Rendered));
    assert_eq!(obs.extraction_tier, Some(ExtractionTier::Selector));
    assert_eq!(fetcher.tiers(), [FetchTier::Plain, FetchTier::Rendered]);
    assert_eq!(sleeper.calls(), [Duration::from_secs(1)]);
    assert_eq!(report.summary.succeeded, 1);
    assert!(report.summary.is_clean());
}

#[tokio::test]
async fn priceless_page_at_every_tier_is_an_extraction_failure() {
    let url = "https://app.test/pricing";
    let fetcher = MapFetcher::default().with_page(url, JS_SHELL);
    let sink = MemorySink::default();
    let sleeper = RecordingSleeper::new();

    let report = run(&fetcher, &sink, &sleeper, &[simple_product("Spa", url)]).await;

    let obs = &report.observations[0];
    assert!(!obs.success);
    assert_eq!(obs.fetch_tier, Some(FetchTier::Stealth));
    assert_eq!(
        fetcher.tiers(),
        [FetchTier::Plain, FetchTier::Rendered, FetchTier::Stealth]
    );
    assert_eq!(
        sleeper.calls(),
        [Duration::from_secs(1), Duration::from_secs(2)]
    );
    assert_eq!(report.summary.extraction_failed, 1);
    assert_eq!(report.summary.fetch_failed, 0);
}

/// Amount, currency and cycle sit in separate elements with nothing
/// price-shaped in the page text, so only the vision selectors find them.
const SPLIT_PRICE_PAGE: &str = r#"<html><body>
<h2 id="plan">Team</h2>
<div class="card"><span class="cur">EUR</span> <em>billed each month</em></div>
<div class="figure"><b class="amount">24</b></div>
<p><span class="cycle">monthly</span></p>
</body></html>"#;

fn split_price_product(url: &str) -> ProductConfig {
    ProductConfig::new(
        "Split",
        url,
        SelectorSet {
            price: vec!["#price".to_string()],
            period: vec![".cycle".to_string()],
            plan_name: vec!["#plan".to_string()],
            ..SelectorSet::default()
        },
    )
}

#[tokio::test]
async fn vision_selectors_rescue_a_page_the_other_tiers_miss() {
    let url = "https://split.test/pricing";
    let fetcher = MapFetcher::default().with_page(url, SPLIT_PRICE_PAGE);
    let sink = MemorySink::default();
    let sleeper = RecordingSleeper::new();
    let vision = Arc::new(StubVision {
        answer: VisionResponse {
            price: ".amount".to_string(),
            currency: ".cur".to_string(),
            ..VisionResponse::default()
        },
        ..StubVision::default()
    });

    let report = run_with_vision(
        &fetcher,
        &sink,
        &sleeper,
        &[split_price_product(url)],
        Some(Arc::clone(&vision) as Arc<dyn VisionModel>),
    )
    .await;

    let obs = &report.observations[0];
    assert!(obs.success, "notes: {:?}", obs.notes);
    assert_eq!(obs.extraction_tier, Some(ExtractionTier::Vision));
    assert_eq!(obs.fetch_tier, Some(FetchTier::Plain));
    assert!((obs.amount - 24.0).abs() < 1e-9);
    assert_eq!(obs.currency, "EUR");
    assert_eq!(obs.period, "Monthly");
    assert_eq!(obs.plan_name, "Team");

    assert_eq!(fetcher.screenshot_requests(), [true]);
    let seen = vision.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].1.as_deref(), Some(SCREENSHOT));
}

#[tokio::test]
async fn screenshots_are_not_requested_without_a_vision_tier() {
    let url = "https://split.test/pricing";
    let fetcher = MapFetcher::default().with_page(url, SPLIT_PRICE_PAGE);
    let sink = MemorySink::default();
    let sleeper = RecordingSleeper::new();

    let report = run(&fetcher, &sink, &sleeper, &[split_price_product(url)]).await;

    assert!(!report.observations[0].success);
    assert_eq!(fetcher.screenshot_requests(), [false, false, false]);
}

#[tokio::test]
async fn pattern_tier_rescues_a_stale_selector() {
    let fetcher = MapFetcher::default().with_page(
        "https://a.test/pricing",
        r"<section><h3>Plus</h3><p>£20 / month</p></section>",
    );
    let sink = MemorySink::default();
    let sleeper = RecordingSleeper::new();
    let product = ProductConfig {
        plan: Some("Plus".to_string()),
        ..simple_product("Chat", "https://a.test/pricing")
    };

    let report = run(&fetcher, &sink, &sleeper, &[product]).await;

    let obs = &report.observations[0];
    assert!(obs.success);
    assert_eq!(obs.currency, "GBP");
    assert_eq!(obs.period, "Monthly");
    assert_eq!(obs.plan_name, "Plus");
    assert_eq!(obs.extraction_tier, Some(ExtractionTier::Pattern));
}

#[tokio::test]
async fn panicking_pair_becomes_a_failure_observation() {
    let fetcher = MapFetcher {
        panic_on: Some("https://boom.test/pricing".to_string()),
        ..MapFetcher::default()
    }
    .with_page("https://a.test/pricing", PRICE_PAGE);
    let sink = MemorySink::default();
    let sleeper = RecordingSleeper::new();

    let report = run(
        &fetcher,
        &sink,
        &sleeper,
        &[
            simple_product("Boom", "https://boom.test/pricing"),
            simple_product("Alpha", "https://a.test/pricing"),
        ],
    )
    .await;

    assert_eq!(report.observations.len(), 2);
    assert!(!report.observations[0].success);
    assert!(report.observations[0]
        .notes
        .as_deref()
        .is_some_and(|n| n.contains("fetcher exploded")));
    assert!(report.observations[1].success);
    assert_eq!(report.summary.crashed, 1);
}

#[tokio::test]
async fn cancel_flag_stops_between_products() {
    let fetcher = MapFetcher::default()
        .with_page("https://a.test/pricing", PRICE_PAGE)
        .with_page("https://b.test/pricing", PRICE_PAGE);
    let flag = Arc::new(AtomicBool::new(false));
    let sink = MemorySink {
        cancel_after_first: Some(Arc::clone(&flag)),
        ..MemorySink::default()
    };
    let sleeper = RecordingSleeper::new();
    let extractor = ContentExtractor::standard(PriceNormalizer::default(), None);
    let resolver = resolver();

    let report = Orchestrator::new(&fetcher, &extractor, &resolver, &sink, &sleeper, settings())
        .cancel_flag(Arc::clone(&flag))
        .run(&[
            simple_product("Alpha", "https://a.test/pricing"),
            simple_product("Beta", "https://b.test/pricing"),
        ])
        .await;

    assert!(report.cancelled);
    assert_eq!(report.observations.len(), 1);
    assert_eq!(report.observations[0].product_name, "Alpha");
    assert_eq!(fetcher.calls().len(), 1);
}

#[tokio::test]
async fn pacing_pauses_between_products_and_regions() {
    let fetcher = MapFetcher::default()
        .with_page("https://a.test/pricing", PRICE_PAGE)
        .with_page("https://shop.test/pricing?country=uk", PRICE_PAGE)
        .with_page("https://shop.test/pricing?country=de", PRICE_PAGE);
    let sink = MemorySink::default();
    let sleeper = RecordingSleeper::new();
    let extractor = ContentExtractor::standard(PriceNormalizer::default(), None);
    let resolver = resolver();
    let pacing = Pacing {
        region_delay_min: Duration::from_secs(3),
        region_delay_max: Duration::from_secs(3),
        product_delay: Duration::from_secs(2),
    };

    let report = Orchestrator::new(&fetcher, &extractor, &resolver, &sink, &sleeper, settings())
        .pacing(pacing)
        .run(&[
            simple_product("Alpha", "https://a.test/pricing"),
            regional_product(&["uk", "de"]),
        ])
        .await;

    assert_eq!(report.observations.len(), 3);
    assert_eq!(
        sleeper.calls(),
        [Duration::from_secs(2), Duration::from_secs(3)]
    );
}

#[tokio::test]
async fn debug_html_is_saved_per_pair() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = MapFetcher::default()
        .with_page("https://shop.test/pricing?country=uk", PRICE_PAGE);
    let sink = MemorySink::default();
    let sleeper = RecordingSleeper::new();
    let extractor = ContentExtractor::standard(PriceNormalizer::default(), None);
    let resolver = resolver();

    Orchestrator::new(&fetcher, &extractor, &resolver, &sink, &sleeper, settings())
        .debug_html(Some(dir.path().to_path_buf()))
        .run(&[regional_product(&["uk"])])
        .await;

    let saved = std::fs::read_to_string(dir.path().join("regional_uk.html")).unwrap();
    assert!(saved.contains("$12.99"));
}
