//! Price extraction cascade: selectors, then text patterns, then vision.
//!
//! [`ContentExtractor`] tries each [`Extractor`] in order and stops at the
//! first one whose price text normalizes to a finite positive amount.

pub mod pattern;
pub mod selector;
pub mod vision;

use std::sync::Arc;

use async_trait::async_trait;
use pricewatch_core::{ExtractionTier, SelectorSet};

use crate::error::ExtractionError;
use crate::normalize::PriceNormalizer;

pub use pattern::PatternExtractor;
pub use selector::SelectorExtractor;
pub use vision::{OpenAiVision, VisionExtractor, VisionModel, VisionRequest, VisionResponse};

/// Everything an extractor may look at for one page.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionInput<'a> {
    pub html: &'a str,
    pub selectors: &'a SelectorSet,
    /// Plan whose price is wanted; locates the pricing card.
    pub plan_hint: Option<&'a str>,
    pub screenshot: Option<&'a [u8]>,
    pub url: &'a str,
}

/// Raw field texts produced by one tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionResult {
    pub price_raw: Option<String>,
    pub currency_raw: Option<String>,
    pub period_raw: Option<String>,
    pub plan_name_raw: Option<String>,
    pub tier: ExtractionTier,
    pub note: Option<String>,
}

impl ExtractionResult {
    #[must_use]
    pub fn empty(tier: ExtractionTier) -> Self {
        Self {
            price_raw: None,
            currency_raw: None,
            period_raw: None,
            plan_name_raw: None,
            tier,
            note: None,
        }
    }

    /// Fill fields this result lacks from an earlier tier's result.
    fn backfill(mut self, earlier: &ExtractionResult) -> Self {
        if self.currency_raw.is_none() {
            self.currency_raw.clone_from(&earlier.currency_raw);
        }
        if self.period_raw.is_none() {
            self.period_raw.clone_from(&earlier.period_raw);
        }
        if self.plan_name_raw.is_none() {
            self.plan_name_raw.clone_from(&earlier.plan_name_raw);
        }
        self
    }
}

/// One rung of the extraction cascade.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn tier(&self) -> ExtractionTier;

    /// Extract raw field texts. `None` means the tier had nothing to offer
    /// (for example, a vision tier with no model configured).
    async fn extract(&self, input: &ExtractionInput<'_>) -> Option<ExtractionResult>;
}

/// Ordered list of extractors gated by a validated-price predicate.
pub struct ContentExtractor {
    tiers: Vec<Box<dyn Extractor>>,
    normalizer: PriceNormalizer,
}

impl ContentExtractor {
    #[must_use]
    pub fn new(tiers: Vec<Box<dyn Extractor>>, normalizer: PriceNormalizer) -> Self {
        Self { tiers, normalizer }
    }

    /// Selector and pattern tiers, plus vision when a model is supplied.
    #[must_use]
    pub fn standard(normalizer: PriceNormalizer, vision: Option<Arc<dyn VisionModel>>) -> Self {
        let mut tiers: Vec<Box<dyn Extractor>> = vec![
            Box::new(SelectorExtractor),
            Box::new(PatternExtractor::new(normalizer.clone())),
        ];
        if let Some(model) = vision {
            tiers.push(Box::new(VisionExtractor::new(model)));
        }
        Self::new(tiers, normalizer)
    }

    #[must_use]
    pub fn normalizer(&self) -> &PriceNormalizer {
        &self.normalizer
    }

    /// Whether a vision tier is present, i.e. screenshots are worth taking.
    #[must_use]
    pub fn uses_vision(&self) -> bool {
        self.tiers
            .iter()
            .any(|t| t.tier() == ExtractionTier::Vision)
    }

    /// Run the cascade.
    ///
    /// Fields a winning later tier did not find (currency, period, plan
    /// name) are filled from the first tier's result.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractionError::NoValidatedPrice`] with the last raw price
    /// text seen and any tier notes when no tier yields a valid price.
    pub async fn extract(
        &self,
        input: &ExtractionInput<'_>,
    ) -> Result<ExtractionResult, ExtractionError> {
        let mut first: Option<ExtractionResult> = None;
        let mut raw_price = None;
        let mut notes = Vec::new();

        for extractor in &self.tiers {
            let tier = extractor.tier();
            let Some(result) = extractor.extract(input).await else {
                tracing::debug!(url = input.url, tier = %tier, "extractor had nothing to offer");
                continue;
            };

            if let Some(note) = &result.note {
                notes.push(format!("{tier}: {note}"));
            }

            if let Some(price) = result.price_raw.as_deref() {
                if self.normalizer.validated(price).is_some() {
                    tracing::info!(url = input.url, tier = %tier, price, "price extracted");
                    return Ok(match &first {
                        Some(earlier) => result.backfill(earlier),
                        None => result,
                    });
                }
                tracing::debug!(url = input.url, tier = %tier, price, "price text did not validate");
                raw_price = Some(price.to_string());
            }

            if first.is_none() {
                first = Some(result);
            }
        }

        Err(ExtractionError::NoValidatedPrice { raw_price, notes })
    }
}

/// Whitespace-collapsed text.
pub(crate) fn collapse_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
