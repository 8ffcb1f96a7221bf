//! Selector discovery for catalogue entries.
//!
//! A rendered page and its screenshot go to the vision model; the selectors
//! it suggests are kept only if they read a valid price back out of that
//! same page. A page whose suggestion does not check out counts as a failed
//! ladder attempt, so discovery escalates tiers like a scrape does.

use async_trait::async_trait;
use pricewatch_core::{ExtractionTier, FetchTier, ProductConfig, SelectorSet};
use thiserror::Error;

use crate::extract::selector::extract_with;
use crate::extract::{VisionModel, VisionRequest};
use crate::fetch::{
    CheckedFailure, FetchLadder, FetchRequest, FetchedPage, LadderFailure, LadderPolicy,
    LadderSettings, PageCheck, PageFetcher,
};
use crate::normalize::PriceNormalizer;
use crate::rate_limit::Sleeper;

/// Selectors that read a valid price from the live page.
#[derive(Debug, Clone, PartialEq)]
pub struct Discovered {
    /// Only the fields the model suggested and that matched the page.
    pub selectors: SelectorSet,
    pub price_raw: String,
    pub amount: f64,
    pub currency: String,
    pub note: Option<String>,
    pub fetch_tier: FetchTier,
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Fetch(#[from] LadderFailure),

    #[error("no working selector after {attempts} attempt(s), last at {tier}: {reason}")]
    NoSelector {
        tier: FetchTier,
        attempts: usize,
        reason: String,
    },
}

pub struct SelectorDiscovery<'a> {
    fetcher: &'a dyn PageFetcher,
    sleeper: &'a dyn Sleeper,
    model: &'a dyn VisionModel,
    normalizer: &'a PriceNormalizer,
    settings: LadderSettings,
}

impl<'a> SelectorDiscovery<'a> {
    #[must_use]
    pub fn new(
        fetcher: &'a dyn PageFetcher,
        sleeper: &'a dyn Sleeper,
        model: &'a dyn VisionModel,
        normalizer: &'a PriceNormalizer,
        settings: LadderSettings,
    ) -> Self {
        Self {
            fetcher,
            sleeper,
            model,
            normalizer,
            settings,
        }
    }

    /// The product's ladder, started no lower than the rendered tier so
    /// every attempt has a screenshot.
    #[must_use]
    pub fn policy(&self, product: &ProductConfig) -> LadderPolicy {
        let base = LadderPolicy::for_product(product, &self.settings);
        LadderPolicy::new(
            base.start.max(FetchTier::Rendered),
            base.top,
            base.max_attempts,
            base.backoff_base,
        )
    }

    /// Find working selectors for `product`'s default page.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::Fetch`] when no page loaded at all, else
    /// [`DiscoveryError::NoSelector`] with the last reason a suggestion was
    /// turned down.
    pub async fn discover(&self, product: &ProductConfig) -> Result<Discovered, DiscoveryError> {
        let request = FetchRequest {
            capture_screenshot: true,
            ..FetchRequest::new(product.url.clone())
        };
        let policy = self.policy(product);
        tracing::info!(product = %product.name, start = %policy.start, "discovering selectors");

        let check = SuggestionCheck {
            model: self.model,
            normalizer: self.normalizer,
            product,
        };
        let ladder = FetchLadder::new(self.fetcher, self.sleeper);
        match ladder.fetch_checked(&request, &policy, &check).await {
            Ok(done) => {
                let found = done.value;
                tracing::info!(
                    product = %product.name,
                    selector = %found.selectors.price.join(", "),
                    price = %found.price_raw,
                    tier = %done.page.tier,
                    "selectors discovered"
                );
                Ok(Discovered {
                    fetch_tier: done.page.tier,
                    ..found
                })
            }
            Err(CheckedFailure::Fetch(failure)) => Err(DiscoveryError::Fetch(failure)),
            Err(CheckedFailure::Rejected {
                tier,
                rejection,
                attempts,
            }) => Err(DiscoveryError::NoSelector {
                tier,
                attempts: attempts.len(),
                reason: rejection,
            }),
        }
    }
}

struct SuggestionCheck<'a> {
    model: &'a dyn VisionModel,
    normalizer: &'a PriceNormalizer,
    product: &'a ProductConfig,
}

#[async_trait]
impl PageCheck for SuggestionCheck<'_> {
    type Output = Discovered;
    type Rejection = String;

    async fn check(&self, page: &FetchedPage) -> Result<Discovered, String> {
        let request = VisionRequest::for_page(
            &page.url,
            &page.html,
            self.product.plan.as_deref(),
            page.screenshot.as_deref(),
        );
        let response = self
            .model
            .locate(&request)
            .await
            .map_err(|e| format!("vision request failed: {e}"))?;
        let note = response.note();

        let mut suggested = response.suggested();
        let Some(price_selector) = suggested.price.first().cloned() else {
            return Err(match note {
                Some(note) => format!("no price selector suggested ({note})"),
                None => "no price selector suggested".to_string(),
            });
        };

        let read = extract_with(&page.html, &suggested, ExtractionTier::Vision);
        let Some(price_raw) = read.price_raw else {
            return Err(format!("suggested selector {price_selector} matched nothing"));
        };
        let Some(parsed) = self.normalizer.validated(&price_raw) else {
            return Err(format!(
                "suggested selector {price_selector} reads \"{price_raw}\", not a price"
            ));
        };

        // Suggestions that select nothing are not worth storing.
        if read.currency_raw.is_none() {
            suggested.currency.clear();
        }
        if read.period_raw.is_none() {
            suggested.period.clear();
        }
        if read.plan_name_raw.is_none() {
            suggested.plan_name.clear();
        }

        Ok(Discovered {
            selectors: suggested,
            price_raw,
            amount: parsed.amount,
            currency: parsed.currency,
            note,
            fetch_tier: page.tier,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::error::{FetchError, VisionError};
    use crate::extract::VisionResponse;
    use crate::rate_limit::RecordingSleeper;

    const PAGE: &str = r#"<html><body>
<section data-plan="pro"><h3 class="name">Pro</h3><span class="amount">$18</span><span class="cycle">per month</span></section>
</body></html>"#;

    /// Serves `PAGE` with a screenshot at every tier.
    struct StaticPage {
        calls: Mutex<Vec<(FetchTier, bool)>>,
    }

    impl StaticPage {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PageFetcher for StaticPage {
        async fn fetch(
            &self,
            request: &FetchRequest,
            tier: FetchTier,
        ) -> Result<FetchedPage, FetchError> {
            self.calls
                .lock()
                .unwrap()
                .push((tier, request.capture_screenshot));
            Ok(FetchedPage {
                url: request.url.clone(),
                html: PAGE.to_string(),
                screenshot: Some(b"png".to_vec()),
                tier,
                challenge_wait: Duration::ZERO,
            })
        }
    }

    /// Answers with each scripted response in turn, repeating the last.
    struct Scripted {
        answers: Mutex<Vec<VisionResponse>>,
        plans: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(answers: Vec<VisionResponse>) -> Self {
            Self {
                answers: Mutex::new(answers),
                plans: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl VisionModel for Scripted {
        async fn locate(&self, request: &VisionRequest<'_>) -> Result<VisionResponse, VisionError> {
            assert!(request.screenshot.is_some());
            self.plans.lock().unwrap().push(request.plan_name.to_string());
            let mut answers = self.answers.lock().unwrap();
            if answers.len() > 1 {
                Ok(answers.remove(0))
            } else {
                answers.first().cloned().ok_or(VisionError::EmptyResponse)
            }
        }
    }

    fn answer(price: &str, currency: &str, period: &str) -> VisionResponse {
        VisionResponse {
            price: price.to_string(),
            currency: currency.to_string(),
            period: period.to_string(),
            ..VisionResponse::default()
        }
    }

    fn settings() -> LadderSettings {
        LadderSettings {
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            tier_override: None,
            proxy_enabled: false,
        }
    }

    fn product() -> ProductConfig {
        ProductConfig {
            plan: Some("Pro".to_string()),
            ..ProductConfig::new("Tool", "https://tool.test/pricing", SelectorSet::default())
        }
    }

    #[tokio::test]
    async fn working_suggestion_is_returned_from_the_first_rendered_page() {
        let fetcher = StaticPage::new();
        let sleeper = RecordingSleeper::new();
        let model = Scripted::new(vec![answer(
            "[data-plan=pro] .amount",
            ".missing-currency",
            "[data-plan=pro] .cycle",
        )]);
        let normalizer = PriceNormalizer::default();
        let discovery = SelectorDiscovery::new(&fetcher, &sleeper, &model, &normalizer, settings());

        let found = discovery.discover(&product()).await.unwrap();

        assert_eq!(found.selectors.price, vec!["[data-plan=pro] .amount".to_string()]);
        assert_eq!(found.selectors.period, vec!["[data-plan=pro] .cycle".to_string()]);
        assert!(found.selectors.currency.is_empty());
        assert_eq!(found.price_raw, "$18");
        assert!((found.amount - 18.0).abs() < 1e-9);
        assert_eq!(found.currency, "USD");
        assert_eq!(found.fetch_tier, FetchTier::Rendered);
        assert_eq!(*fetcher.calls.lock().unwrap(), [(FetchTier::Rendered, true)]);
        assert_eq!(*model.plans.lock().unwrap(), ["Pro"]);
        assert!(sleeper.calls().is_empty());
    }

    #[tokio::test]
    async fn bad_suggestion_escalates_before_a_good_one_is_kept() {
        let fetcher = StaticPage::new();
        let sleeper = RecordingSleeper::new();
        let model = Scripted::new(vec![
            answer("[data-plan=pro] .name", "", ""),
            answer("[data-plan=pro] .amount", "", ""),
        ]);
        let normalizer = PriceNormalizer::default();
        let discovery = SelectorDiscovery::new(&fetcher, &sleeper, &model, &normalizer, settings());

        let found = discovery.discover(&product()).await.unwrap();

        assert_eq!(found.fetch_tier, FetchTier::Stealth);
        assert_eq!(found.price_raw, "$18");
        assert_eq!(sleeper.calls(), [Duration::from_secs(1)]);
    }

    #[tokio::test]
    async fn no_suggestion_at_any_tier_reports_the_model_note() {
        let fetcher = StaticPage::new();
        let sleeper = RecordingSleeper::new();
        let model = Scripted::new(vec![VisionResponse {
            note: Some("price loads after login".to_string()),
            ..VisionResponse::default()
        }]);
        let normalizer = PriceNormalizer::default();
        let discovery = SelectorDiscovery::new(&fetcher, &sleeper, &model, &normalizer, settings());

        let err = discovery.discover(&product()).await.unwrap_err();

        let DiscoveryError::NoSelector {
            tier,
            attempts,
            reason,
        } = err
        else {
            panic!("expected NoSelector");
        };
        assert_eq!(tier, FetchTier::Stealth);
        assert_eq!(attempts, 3);
        assert!(reason.contains("price loads after login"), "{reason}");
    }

    #[test]
    fn policy_never_starts_below_rendered() {
        let fetcher = StaticPage::new();
        let sleeper = RecordingSleeper::new();
        let model = Scripted::new(Vec::new());
        let normalizer = PriceNormalizer::default();
        let discovery = SelectorDiscovery::new(&fetcher, &sleeper, &model, &normalizer, settings());

        let policy = discovery.policy(&product());
        assert_eq!(policy.start, FetchTier::Rendered);
        assert_eq!(policy.top, FetchTier::Stealth);
    }
}
