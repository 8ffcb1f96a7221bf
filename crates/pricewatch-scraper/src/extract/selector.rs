use async_trait::async_trait;
use pricewatch_core::{ExtractionTier, SelectorSet};
use scraper::{ElementRef, Html, Selector};

use super::pattern::contains_price;
use super::{collapse_ws, ExtractionInput, ExtractionResult, Extractor};

/// Tier 1: configured CSS selectors.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectorExtractor;

#[async_trait]
impl Extractor for SelectorExtractor {
    fn tier(&self) -> ExtractionTier {
        ExtractionTier::Selector
    }

    async fn extract(&self, input: &ExtractionInput<'_>) -> Option<ExtractionResult> {
        Some(extract_with(input.html, input.selectors, ExtractionTier::Selector))
    }
}

/// Evaluate `selectors` against `html`, taking the first non-empty text per
/// field. When no price selector matches, the parent of the period element
/// is used if its text looks like a price.
#[must_use]
pub fn extract_with(html: &str, selectors: &SelectorSet, tier: ExtractionTier) -> ExtractionResult {
    let doc = Html::parse_document(html);

    let period_raw = first_text(&doc, &selectors.period);
    let price_raw = first_text(&doc, &selectors.price).or_else(|| {
        let fallback = period_parent_text(&doc, &selectors.period);
        if fallback.is_some() {
            tracing::debug!("price taken from the period element's parent");
        }
        fallback
    });

    ExtractionResult {
        price_raw,
        currency_raw: first_text(&doc, &selectors.currency),
        period_raw,
        plan_name_raw: first_text(&doc, &selectors.plan_name),
        tier,
        note: None,
    }
}

fn parse_selector(candidate: &str) -> Option<Selector> {
    match Selector::parse(candidate) {
        Ok(sel) => Some(sel),
        Err(e) => {
            tracing::debug!(selector = candidate, error = %e, "skipping unparseable selector");
            None
        }
    }
}

fn element_text(el: ElementRef<'_>) -> String {
    collapse_ws(&el.text().collect::<String>())
}

fn first_text(doc: &Html, candidates: &[String]) -> Option<String> {
    candidates
        .iter()
        .filter_map(|c| parse_selector(c))
        .find_map(|sel| {
            doc.select(&sel)
                .map(element_text)
                .find(|text| !text.is_empty())
        })
}

fn period_parent_text(doc: &Html, period_selectors: &[String]) -> Option<String> {
    period_selectors
        .iter()
        .filter_map(|c| parse_selector(c))
        .find_map(|sel| {
            doc.select(&sel)
                .filter_map(|el| el.parent().and_then(ElementRef::wrap))
                .map(element_text)
                .find(|text| contains_price(text))
        })
}
