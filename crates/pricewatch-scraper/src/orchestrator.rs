//! Drives every product × region pair through fetch, extraction and
//! normalization, and hands each resulting observation to a sink.
//!
//! Pairs run strictly in catalogue order, one at a time. A pair that fails
//! in any way, including a panic, still yields exactly one observation.
//! Extraction runs inside the fetch ladder, so a page that loads without a
//! usable price costs an attempt and escalates like a failed fetch.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt as _;
use pricewatch_core::{ObservationTarget, PriceObservation, ProductConfig};

use crate::error::{ExtractionError, PersistenceError};
use crate::extract::{ContentExtractor, ExtractionInput, ExtractionResult};
use crate::fetch::ladder::LadderSettings;
use crate::fetch::{
    CheckedFailure, FetchLadder, FetchedPage, LadderPolicy, PageCheck, PageFetcher,
};
use crate::normalize::{as_currency_code, detect_currency, normalize_period};
use crate::rate_limit::{Pacing, Sleeper};
use crate::region::RegionResolver;
use crate::run_log::{PairOutcome, RunLog, RunSummary};
use crate::targets::{plan_targets, ScrapeTarget};

/// Where finished observations go.
#[async_trait]
pub trait ObservationSink: Send + Sync {
    async fn record(&self, observation: &PriceObservation) -> Result<(), PersistenceError>;
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Fetching,
    Extracting,
    Normalizing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Fetching => "fetching",
            Stage::Extracting => "extracting",
            Stage::Normalizing => "normalizing",
        })
    }
}

/// Everything a run produced.
#[derive(Debug)]
pub struct RunReport {
    /// In emission order: product, then region.
    pub observations: Vec<PriceObservation>,
    pub summary: RunSummary,
    pub log: RunLog,
    /// The run stopped early on the cancel flag.
    pub cancelled: bool,
}

pub struct Orchestrator<'a> {
    fetcher: &'a dyn PageFetcher,
    extractor: &'a ContentExtractor,
    resolver: &'a RegionResolver,
    sink: &'a dyn ObservationSink,
    sleeper: &'a dyn Sleeper,
    settings: LadderSettings,
    pacing: Pacing,
    cancel: Arc<AtomicBool>,
    debug_html: Option<PathBuf>,
}

impl<'a> Orchestrator<'a> {
    #[must_use]
    pub fn new(
        fetcher: &'a dyn PageFetcher,
        extractor: &'a ContentExtractor,
        resolver: &'a RegionResolver,
        sink: &'a dyn ObservationSink,
        sleeper: &'a dyn Sleeper,
        settings: LadderSettings,
    ) -> Self {
        Self {
            fetcher,
            extractor,
            resolver,
            sink,
            sleeper,
            settings,
            pacing: Pacing::none(),
            cancel: Arc::new(AtomicBool::new(false)),
            debug_html: None,
        }
    }

    #[must_use]
    pub fn pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    /// Flag checked between products; set it to stop the run early.
    #[must_use]
    pub fn cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    /// Save every fetched page under `dir`.
    #[must_use]
    pub fn debug_html(mut self, dir: Option<PathBuf>) -> Self {
        self.debug_html = dir;
        self
    }

    /// Scrape `products` in order. Never fails: every problem ends up in an
    /// observation, the summary, or the log.
    pub async fn run(&self, products: &[ProductConfig]) -> RunReport {
        let mut report = RunReport {
            observations: Vec::new(),
            summary: RunSummary::default(),
            log: RunLog::new(),
            cancelled: false,
        };
        report
            .log
            .line(format!("run started: {} product(s)", products.len()));

        for (i, product) in products.iter().enumerate() {
            if i > 0 {
                self.sleeper.sleep(self.pacing.product_delay).await;
            }
            if self.cancel.load(Ordering::SeqCst) {
                tracing::warn!(remaining = products.len() - i, "run interrupted");
                report
                    .log
                    .line(format!("interrupted; {} product(s) skipped", products.len() - i));
                report.cancelled = true;
                break;
            }
            self.scrape_product(product, &mut report).await;
        }

        tracing::info!(summary = %report.summary, "run finished");
        report
    }

    async fn scrape_product(&self, product: &ProductConfig, report: &mut RunReport) {
        let policy = LadderPolicy::for_product(product, &self.settings);
        tracing::info!(
            product = %product.name,
            start = %policy.start,
            top = %policy.top,
            regions = product.region_tokens().len(),
            "scraping product"
        );

        let targets = match plan_targets(product, self.resolver) {
            Ok(targets) => targets,
            Err(e) => {
                tracing::warn!(product = %product.name, error = %e, "could not build region URLs");
                for target in self.fallback_targets(product) {
                    let observation = PriceObservation::failed(
                        observation_target(product, &target),
                        self.extractor.normalizer().fallback_currency(),
                        e.to_string(),
                        None,
                    );
                    self.emit(&target, observation, PairOutcome::FetchFailed, report)
                        .await;
                }
                return;
            }
        };

        for (i, target) in targets.iter().enumerate() {
            if i > 0 {
                self.sleeper.sleep(self.pacing.region_delay()).await;
            }

            let pair = AssertUnwindSafe(self.scrape_pair(product, &policy, target))
                .catch_unwind()
                .await;
            let (observation, outcome) = pair.unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                tracing::error!(
                    product = %product.name,
                    region = target.label(),
                    panic = %message,
                    "unexpected error while scraping"
                );
                (
                    PriceObservation::failed(
                        observation_target(product, target),
                        self.extractor.normalizer().fallback_currency(),
                        format!("unexpected error: {message}"),
                        None,
                    ),
                    PairOutcome::Crashed,
                )
            });

            self.emit(target, observation, outcome, report).await;
        }
    }

    /// Targets without URL templating, used to report a templating failure
    /// once per configured region.
    fn fallback_targets(&self, product: &ProductConfig) -> Vec<ScrapeTarget> {
        product
            .region_tokens()
            .iter()
            .map(|token| ScrapeTarget {
                region_token: Some(token.clone()),
                region: self.resolver.resolve(token).into_code(),
                url: product.url.clone(),
                switch: None,
            })
            .collect()
    }

    async fn scrape_pair(
        &self,
        product: &ProductConfig,
        policy: &LadderPolicy,
        target: &ScrapeTarget,
    ) -> (PriceObservation, PairOutcome) {
        let fallback = self.extractor.normalizer().fallback_currency();
        let region = target.label();

        tracing::debug!(product = %product.name, region, stage = %Stage::Fetching, "pair stage");
        let request = target.request(self.extractor.uses_vision());
        let ladder = FetchLadder::new(self.fetcher, self.sleeper);
        let check = ExtractionCheck {
            extractor: self.extractor,
            product,
            debug_path: self
                .debug_html
                .as_deref()
                .map(|dir| debug_html_path(dir, product, target)),
        };
        let fetched = match ladder.fetch_checked(&request, policy, &check).await {
            Ok(success) => success,
            Err(CheckedFailure::Fetch(failure)) => {
                tracing::warn!(product = %product.name, region, error = %failure, "fetch failed");
                return (
                    PriceObservation::failed(
                        observation_target(product, target),
                        fallback,
                        failure.to_string(),
                        failure.last_tier(),
                    ),
                    PairOutcome::FetchFailed,
                );
            }
            Err(CheckedFailure::Rejected {
                tier,
                rejection,
                attempts,
            }) => {
                let outcome = self.classify_extraction_failure(&rejection);
                tracing::warn!(
                    product = %product.name,
                    region,
                    attempts = attempts.len(),
                    error = %rejection,
                    "no price extracted"
                );
                return (
                    PriceObservation::failed(
                        observation_target(product, target),
                        fallback,
                        extraction_note(&rejection),
                        Some(tier),
                    ),
                    outcome,
                );
            }
        };

        tracing::debug!(product = %product.name, region, stage = %Stage::Normalizing, "pair stage");
        self.normalize(product, target, fetched.page.tier, &fetched.value)
    }

    fn normalize(
        &self,
        product: &ProductConfig,
        target: &ScrapeTarget,
        fetch_tier: pricewatch_core::FetchTier,
        extracted: &ExtractionResult,
    ) -> (PriceObservation, PairOutcome) {
        let normalizer = self.extractor.normalizer();
        let price_raw = extracted.price_raw.as_deref().unwrap_or_default();
        let mut obs_target = observation_target(product, target);

        let parsed = match normalizer.parse(price_raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                return (
                    PriceObservation::failed(
                        obs_target,
                        normalizer.fallback_currency(),
                        e.to_string(),
                        Some(fetch_tier),
                    ),
                    PairOutcome::ParseFailed,
                );
            }
        };

        let currency = resolve_currency(
            price_raw,
            extracted.currency_raw.as_deref(),
            normalizer.fallback_currency(),
        );
        let period = normalize_period(extracted.period_raw.as_deref().unwrap_or_default());
        if let Some(plan) = extracted
            .plan_name_raw
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
        {
            obs_target.plan_name = plan.to_string();
        }

        match PriceObservation::succeeded(
            obs_target.clone(),
            parsed.amount,
            &currency,
            &period,
            fetch_tier,
            extracted.tier,
        ) {
            Some(observation) => (observation, PairOutcome::Succeeded),
            None => (
                PriceObservation::failed(
                    obs_target,
                    &currency,
                    format!("price \"{price_raw}\" is not a positive amount"),
                    Some(fetch_tier),
                ),
                PairOutcome::ParseFailed,
            ),
        }
    }

    fn classify_extraction_failure(&self, error: &ExtractionError) -> PairOutcome {
        let ExtractionError::NoValidatedPrice { raw_price, .. } = error;
        match raw_price {
            Some(raw) if self.extractor.normalizer().parse(raw).is_err() => {
                PairOutcome::ParseFailed
            }
            _ => PairOutcome::ExtractionFailed,
        }
    }

    async fn emit(
        &self,
        target: &ScrapeTarget,
        observation: PriceObservation,
        outcome: PairOutcome,
        report: &mut RunReport,
    ) {
        report.summary.record(outcome);
        if let (Some(token), None) = (&target.region_token, &target.region) {
            tracing::warn!(token = %token, "region token did not resolve");
            report.summary.unresolved_region += 1;
        }

        report.log.line(describe(&observation, target, outcome));
        if outcome == PairOutcome::Succeeded {
            tracing::info!(
                product = %observation.product_name,
                region = target.label(),
                amount = observation.amount,
                currency = %observation.currency,
                period = %observation.period,
                "price observed"
            );
        }

        if let Err(e) = self.sink.record(&observation).await {
            tracing::warn!(
                product = %observation.product_name,
                region = target.label(),
                error = %e,
                "observation not persisted"
            );
            report.summary.persistence_failed += 1;
            report.log.line(format!(
                "{} [{}] persistence failed: {}",
                observation.product_name,
                target.label(),
                e.message
            ));
        }

        report.observations.push(observation);
    }
}

/// Extracts a price from each page the ladder loads; a page without one is
/// rejected so the ladder moves on.
struct ExtractionCheck<'a> {
    extractor: &'a ContentExtractor,
    product: &'a ProductConfig,
    debug_path: Option<PathBuf>,
}

#[async_trait]
impl PageCheck for ExtractionCheck<'_> {
    type Output = ExtractionResult;
    type Rejection = ExtractionError;

    async fn check(&self, page: &FetchedPage) -> Result<ExtractionResult, ExtractionError> {
        if let Some(path) = &self.debug_path {
            save_debug_html(path, &page.html);
        }
        tracing::debug!(url = %page.url, tier = %page.tier, stage = %Stage::Extracting, "pair stage");
        let input = ExtractionInput {
            html: &page.html,
            selectors: &self.product.selectors,
            plan_hint: self.product.plan.as_deref(),
            screenshot: page.screenshot.as_deref(),
            url: &page.url,
        };
        self.extractor.extract(&input).await
    }
}

fn save_debug_html(path: &Path, html: &str) {
    let written = path
        .parent()
        .map_or(Ok(()), std::fs::create_dir_all)
        .and_then(|()| std::fs::write(path, html));
    match written {
        Ok(()) => tracing::debug!(path = %path.display(), "saved page HTML"),
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not save page HTML"),
    }
}

fn observation_target(product: &ProductConfig, target: &ScrapeTarget) -> ObservationTarget {
    ObservationTarget {
        product_name: product.name.clone(),
        region_token: target.region_token.clone(),
        region: target.region.clone(),
        plan_name: default_plan(product),
        source_url: target.url.clone(),
    }
}

/// Configured plan, else the product name.
fn default_plan(product: &ProductConfig) -> String {
    product
        .plan
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or(&product.name)
        .to_string()
}

/// Currency from the price text, then the currency element's text (as a
/// symbol, then as a bare code), then `fallback`.
fn resolve_currency(price_raw: &str, currency_raw: Option<&str>, fallback: &str) -> String {
    if let Some(code) = detect_currency(price_raw) {
        return code.to_string();
    }
    if let Some(text) = currency_raw {
        if let Some(code) = detect_currency(text) {
            return code.to_string();
        }
        if let Some(code) = as_currency_code(text) {
            return code;
        }
    }
    fallback.to_uppercase()
}

fn extraction_note(error: &ExtractionError) -> String {
    let ExtractionError::NoValidatedPrice { notes, .. } = error;
    if notes.is_empty() {
        error.to_string()
    } else {
        format!("{error}; {}", notes.join("; "))
    }
}

fn describe(observation: &PriceObservation, target: &ScrapeTarget, outcome: PairOutcome) -> String {
    let region = match (&target.region_token, &observation.region) {
        (Some(token), Some(code)) => format!("{token} -> {code}"),
        (Some(token), None) => format!("{token} -> unresolved"),
        (None, _) => "default".to_string(),
    };
    if observation.success {
        format!(
            "{} [{region}] ok {:.2} {} {} (fetch={}, extract={})",
            observation.product_name,
            observation.amount,
            observation.currency,
            observation.period,
            observation
                .fetch_tier
                .map_or("-", pricewatch_core::FetchTier::as_str),
            observation
                .extraction_tier
                .map_or("-", pricewatch_core::ExtractionTier::as_str),
        )
    } else {
        format!(
            "{} [{region}] {}: {}",
            observation.product_name,
            outcome.as_str(),
            observation.notes.as_deref().unwrap_or_default()
        )
    }
}

fn debug_html_path(dir: &Path, product: &ProductConfig, target: &ScrapeTarget) -> PathBuf {
    let name = match &target.region_token {
        Some(token) => {
            let token: String = token
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                        c
                    } else {
                        '-'
                    }
                })
                .collect();
            format!("{}_{token}.html", product.slug())
        }
        None => format!("{}.html", product.slug()),
    };
    dir.join(name)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic without a message".to_string())
}
